/*
 * This file is a part of NTDB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! NTDB is an embedded, single-file key/value store shared by cooperating
//! processes on one host, without a server or any network surface. A
//! single mmap'd file holds a hash index, a segregated free-space
//! allocator, and a write-ahead transaction log; concurrent access across
//! processes is coordinated entirely through POSIX byte-range locks on the
//! file itself.
//!
//! ```no_run
//! use ntdb::{OpenOptions, StoreMode};
//!
//! let db = OpenOptions::new().create(true).open("/tmp/example.ntdb")?;
//! db.store(b"key", b"value", StoreMode::Replace)?;
//! assert_eq!(db.fetch(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), ntdb::Error>(())
//! ```

mod alloc;
mod capability;
mod check;
mod context;
mod error;
mod format;
mod hash;
mod io;
mod lock;
mod registry;
mod transaction;

pub use check::CheckStats;
pub use context::{HashFn, Ntdb, OpenOptions, StoreMode};
pub use error::{Error, LogFn, LogLevel, Result};
pub use hash::jenkins_hash_stable;
pub use transaction::Transaction;
