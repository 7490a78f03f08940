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

//! # Error taxonomy
//!
//! NTDB never packs an error into an offset or pointer return value the way
//! the original C implementation does. Every fallible operation returns a
//! [`Result`] carrying an [`Error`] variant from the taxonomy below.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Severity passed to the log callback alongside an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    UseError,
    Warning,
}

#[derive(Debug)]
pub enum Error {
    /// An on-disk invariant was violated.
    Corrupt(String),
    /// A syscall failed, or an access landed out of bounds.
    Io(io::Error),
    /// Same as `Io`, but with some context about what we were doing.
    IoContext(io::Error, String),
    /// Lock acquisition failed (includes non-blocking would-block).
    Lock(String),
    /// The caller-provided allocator failed.
    Oom,
    /// `store(.., INSERT)` on an existing key.
    Exists,
    /// An operation on a missing key.
    NoExist,
    /// Misuse: bad flag, write on a read-only handle, nested transaction
    /// without permission, and the like.
    Einval(String),
    /// A write was attempted on a read-only handle.
    Rdonly,
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub(crate) fn einval(msg: impl Into<String>) -> Self {
        Self::Einval(msg.into())
    }

    pub(crate) fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    pub(crate) fn io_context(e: io::Error, ctx: impl Into<String>) -> Self {
        Self::IoContext(e, ctx.into())
    }

    /// The log severity an error of this kind should be reported at.
    pub(crate) fn level(&self) -> LogLevel {
        match self {
            Error::Exists | Error::NoExist => LogLevel::UseError,
            Error::Einval(_) | Error::Rdonly => LogLevel::UseError,
            Error::Lock(_) => LogLevel::Warning,
            _ => LogLevel::Error,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Corrupt(msg) => write!(f, "corrupt database: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::IoContext(e, ctx) => write!(f, "I/O error while {ctx}: {e}"),
            Error::Lock(msg) => write!(f, "lock error: {msg}"),
            Error::Oom => write!(f, "allocation failure"),
            Error::Exists => write!(f, "key already exists"),
            Error::NoExist => write!(f, "key does not exist"),
            Error::Einval(msg) => write!(f, "invalid usage: {msg}"),
            Error::Rdonly => write!(f, "database is read-only"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::IoContext(e, _) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Caller-installable diagnostic sink. Invoked on every error except the
/// ones the engine is expected to handle internally (non-blocking lock
/// contention, `/dev/urandom` read failures during seeding).
pub type LogFn = std::sync::Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Default log callback: forwards to the `log` crate so that an embedding
/// binary gets useful output just by installing any `log`-compatible
/// subscriber (e.g. `env_logger`), without `ntdb` itself depending on one.
pub(crate) fn default_log_fn() -> LogFn {
    std::sync::Arc::new(|level, msg| match level {
        LogLevel::Error => log::error!("{msg}"),
        LogLevel::UseError => log::debug!("{msg}"),
        LogLevel::Warning => log::warn!("{msg}"),
    })
}
