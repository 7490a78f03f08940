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

//! Process-wide registry of open databases.
//!
//! POSIX byte-range locks are per-(process, file), not per-file-descriptor:
//! opening the same file twice within one process and locking on both
//! descriptors is indistinguishable, to the kernel, from one open locking
//! itself twice -- the second open silently "succeeds" at a lock the first
//! open still thinks it holds exclusively. We sidestep this by keying
//! every open on `(device, inode)` and handing back the already-open
//! handle's shared state to a second caller in the same process instead of
//! mapping the file again.
//!
//! A `fork()`'d child inherits the parent's file descriptors and mappings;
//! we detect that by comparing the registering pid against the current
//! one, since a fork-without-exec child sharing the parent's open handle
//! would silently corrupt the lock bookkeeping otherwise.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, Weak};

use crate::context::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

struct Entry {
    shared: Weak<Shared>,
    opened_by_pid: u32,
}

fn registry() -> &'static Mutex<HashMap<FileKey, Entry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<FileKey, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn current_pid() -> u32 {
    std::process::id()
}

/// Look up an already-open handle for `key` in this process. Returns
/// `None` if there isn't one, or if the one on record was opened by a
/// different pid (i.e. we're a fork()'d child and must not reuse it).
pub fn lookup(key: FileKey) -> Option<std::sync::Arc<Shared>> {
    let mut reg = registry().lock().unwrap();
    match reg.get(&key) {
        Some(entry) if entry.opened_by_pid == current_pid() => {
            let upgraded = entry.shared.upgrade();
            if upgraded.is_none() {
                reg.remove(&key);
            }
            upgraded
        }
        Some(_) => {
            reg.remove(&key);
            None
        }
        None => None,
    }
}

pub fn register(key: FileKey, shared: &std::sync::Arc<Shared>) {
    let mut reg = registry().lock().unwrap();
    reg.insert(
        key,
        Entry {
            shared: std::sync::Arc::downgrade(shared),
            opened_by_pid: current_pid(),
        },
    );
}

/// Drop the registry's record of `key`. Called when the last `Ntdb` handle
/// for it in this process is going away; a stale entry left behind by a
/// race is harmless since `lookup` also self-heals on a dead `Weak`.
pub fn unregister(key: FileKey) {
    registry().lock().unwrap().remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality() {
        let a = FileKey { dev: 1, ino: 2 };
        let b = FileKey { dev: 1, ino: 2 };
        assert_eq!(a, b);
    }

    #[test]
    fn lookup_miss_on_empty_registry() {
        let key = FileKey {
            dev: 0xdead,
            ino: 0xbeef,
        };
        assert!(lookup(key).is_none());
    }
}
