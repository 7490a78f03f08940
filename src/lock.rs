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

//! Byte-range lock layer.
//!
//! Every lock is a POSIX `fcntl` byte-range lock on some region of the
//! database file, so locking is cooperative across unrelated processes
//! without any other form of IPC. Within a process, many call sites may
//! want the "same" lock concurrently (e.g. two cursors walking the same
//! chain); a naive `fcntl` re-acquire on the same fd would silently
//! downgrade or drop the outer lock, so [`LockManager`] keeps a refcounted
//! table of currently-held ranges and only calls into `fcntl` on the
//! first/last acquire/release of a given range.
//!
//! The actual `fcntl` call is behind the [`LockBackend`] trait so tests can
//! swap in a fake backend; [`FcntlLockBackend`] is what production code
//! uses.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::format::{FREE_BUCKETS, FTABLE_NONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Fixed offsets (beyond the end of any real record) used for
/// whole-database coordination locks. These are private implementation
/// details -- two processes only need to agree on them, not on anything
/// published externally.
pub mod offsets {
    /// Guards header fields mutated outside a transaction (seqnum etc).
    pub const OPEN_LOCK: u64 = u64::MAX - 1;
    /// Held by whichever process is expanding the file.
    pub const EXPANSION_LOCK: u64 = u64::MAX - 2;
    /// Held by the single active transaction.
    pub const TRANSACTION_LOCK: u64 = u64::MAX - 3;
    /// Held while replaying a recovery record on open.
    pub const RECOVERY_LOCK: u64 = u64::MAX - 4;
    /// Base for the per-bucket hash chain locks; one byte per bucket,
    /// addressed as `HASH_LOCK_BASE - bucket`.
    pub const HASH_LOCK_BASE: u64 = u64::MAX - 1024;
    /// Base for the per-bucket free-list locks.
    pub const FREE_LOCK_BASE: u64 = u64::MAX - 2048;
    /// The "lock all records" range start; gradual-doubling locks acquire
    /// `[ALL_LOCK_BASE, ALL_LOCK_BASE + n)` for increasing `n`.
    pub const ALL_LOCK_BASE: u64 = u64::MAX - 4096;
    pub const ALL_LOCK_FULL: u64 = 4096;
}

pub fn hash_bucket_offset(bucket: u64) -> u64 {
    offsets::HASH_LOCK_BASE - bucket
}

pub fn free_bucket_offset(bucket: u64) -> u64 {
    debug_assert!((bucket as usize) < FREE_BUCKETS || bucket == FTABLE_NONE as u64);
    offsets::FREE_LOCK_BASE - bucket
}

pub trait LockBackend: Send + Sync {
    fn lock(&self, fd: RawFd, kind: LockKind, off: u64, len: u64, wait: bool) -> Result<bool>;
    fn unlock(&self, fd: RawFd, off: u64, len: u64) -> Result<()>;
}

pub struct FcntlLockBackend;

impl LockBackend for FcntlLockBackend {
    fn lock(&self, fd: RawFd, kind: LockKind, off: u64, len: u64, wait: bool) -> Result<bool> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = match kind {
            LockKind::Read => libc::F_RDLCK as i16,
            LockKind::Write => libc::F_WRLCK as i16,
        };
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = off as libc::off_t;
        fl.l_len = len as libc::off_t;

        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        let ret = unsafe { libc::fcntl(fd, cmd, &fl) };
        if ret == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if !wait
            && matches!(
                err.raw_os_error(),
                Some(libc::EACCES) | Some(libc::EAGAIN)
            )
        {
            return Ok(false);
        }
        Err(Error::lock(format!(
            "fcntl lock failed at offset {off} len {len}: {err}"
        )))
    }

    fn unlock(&self, fd: RawFd, off: u64, len: u64) -> Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = off as libc::off_t;
        fl.l_len = len as libc::off_t;
        let ret = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::lock(format!(
                "fcntl unlock failed at offset {off} len {len}: {err}"
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Held {
    kind: LockKind,
    count: u32,
}

impl Default for LockKind {
    fn default() -> Self {
        LockKind::Read
    }
}

/// Per-process refcounted view onto the byte-range locks held on one file
/// descriptor. Two nested calls asking for the same `(off, len)` range
/// only hit `fcntl` once; the lock is only released on the last matching
/// `unlock`.
pub struct LockManager {
    backend: Box<dyn LockBackend>,
    held: Mutex<HashMap<(u64, u64), Held>>,
}

impl LockManager {
    pub fn new(backend: Box<dyn LockBackend>) -> Self {
        LockManager {
            backend,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fcntl() -> Self {
        Self::new(Box::new(FcntlLockBackend))
    }

    pub fn lock(&self, fd: RawFd, kind: LockKind, off: u64, len: u64, wait: bool) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        if let Some(entry) = held.get_mut(&(off, len)) {
            // Already held in this process. A read-holder asking for write
            // (or vice versa) is a programming error in our own call
            // sites -- every such site always requests the stronger kind
            // up front -- so we only allow widening count, never silently
            // changing kind underneath a caller.
            if entry.kind == kind || kind == LockKind::Read {
                entry.count += 1;
                return Ok(true);
            }
            return Err(Error::lock("conflicting nested lock kind requested"));
        }
        if !self.backend.lock(fd, kind, off, len, wait)? {
            return Ok(false);
        }
        held.insert((off, len), Held { kind, count: 1 });
        Ok(true)
    }

    pub fn unlock(&self, fd: RawFd, off: u64, len: u64) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(&(off, len)) {
            None => Err(Error::lock("unlock of a range we don't hold")),
            Some(entry) => {
                entry.count -= 1;
                if entry.count == 0 {
                    held.remove(&(off, len));
                    self.backend.unlock(fd, off, len)?;
                }
                Ok(())
            }
        }
    }

    pub fn is_held(&self, off: u64, len: u64) -> bool {
        self.held.lock().unwrap().contains_key(&(off, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        locks: AtomicUsize,
        unlocks: AtomicUsize,
    }

    impl LockBackend for CountingBackend {
        fn lock(&self, _fd: RawFd, _kind: LockKind, _off: u64, _len: u64, _wait: bool) -> Result<bool> {
            self.locks.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn unlock(&self, _fd: RawFd, _off: u64, _len: u64) -> Result<()> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn nested_locks_coalesce() {
        let backend = CountingBackend {
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        };
        let mgr = LockManager::new(Box::new(backend));
        mgr.lock(0, LockKind::Read, 10, 1, true).unwrap();
        mgr.lock(0, LockKind::Read, 10, 1, true).unwrap();
        mgr.unlock(0, 10, 1).unwrap();
        assert!(mgr.is_held(10, 1));
        mgr.unlock(0, 10, 1).unwrap();
        assert!(!mgr.is_held(10, 1));
    }

    #[test]
    fn unlock_without_hold_errors() {
        let mgr = LockManager::new(Box::new(CountingBackend {
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }));
        assert!(mgr.unlock(0, 1, 1).is_err());
    }
}
