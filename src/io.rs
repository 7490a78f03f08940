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

//! File and mmap layer.
//!
//! A [`Storage`] owns the open file descriptor and the current memory
//! mapping. Every access goes through `access_read`/`access_write`, which
//! hand back a direct slice into the mapping when possible and fall back to
//! a `pread` copy when the requested range is out of bounds of the current
//! mapping (a concurrent writer may have grown the file since we last
//! mapped it).
//!
//! Growing the file remaps it; any slice borrowed from the *old* mapping
//! must keep working until the caller drops it. We get that for free by
//! handing out `Arc<MmapRaw>` clones alongside the borrowed range instead of
//! a bare `&[u8]`: as long as a [`ReadGuard`] is alive, its `Arc` keeps the
//! old mapping resident even after `Storage` has moved on to a newer one.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use memmap2::MmapRaw;

use crate::error::{Error, Result};
use crate::format::FILL_BYTE;

/// Live memory mapping plus the file size it was made for.
struct Mapping {
    mmap: Arc<MmapRaw>,
    len: u64,
}

pub struct Storage {
    file: RwLock<File>,
    mapping: RwLock<Mapping>,
    /// Cached file length, kept in lockstep with `mapping.len` but readable
    /// without taking the mapping lock.
    size: AtomicU64,
    pub read_only: bool,
    /// When true, multi-byte header/record integer fields are stored
    /// big-endian on disk (used when the file was created on, or is being
    /// shared with, a machine of different endianness).
    pub convert: bool,
}

impl Storage {
    pub fn open(file: File, read_only: bool, convert: bool) -> Result<Self> {
        let mut len = file.metadata()?.len();
        if len == 0 {
            // mmap(2) rejects a zero-length mapping; a brand-new database
            // file gets a one-byte placeholder that `expand_file` replaces
            // with the real layout before anything reads or writes it.
            file.set_len(1)?;
            len = 1;
        }
        let mmap = MmapRaw::map_raw(&file)?;
        Ok(Storage {
            file: RwLock::new(file),
            mapping: RwLock::new(Mapping {
                mmap: Arc::new(mmap),
                len,
            }),
            size: AtomicU64::new(len),
            read_only,
            convert,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// True if `[off, off+len)` is outside the addressable file.
    pub fn oob(&self, off: u64, len: u64, probe_only: bool) -> bool {
        let size = self.file_size();
        let (end, overflow) = off.overflowing_add(len);
        if overflow {
            return true;
        }
        if probe_only {
            off > size
        } else {
            end > size
        }
    }

    /// Extend the file to at least `new_len`, zero-filled with the
    /// implementation's poison byte so that accidental reads of
    /// not-yet-allocated space are detectable in a debugger, then remap.
    pub fn expand_file(&self, new_len: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::Rdonly);
        }
        let mut file = self.file.write().unwrap();
        let old_len = file.metadata()?.len();
        if new_len <= old_len {
            return Ok(());
        }
        file.set_len(new_len)?;
        if new_len > old_len {
            file.seek(SeekFrom::Start(old_len))?;
            let fill = vec![FILL_BYTE; 65536];
            let mut remaining = new_len - old_len;
            while remaining > 0 {
                let chunk = remaining.min(fill.len() as u64) as usize;
                file.write_all(&fill[..chunk])?;
                remaining -= chunk as u64;
            }
        }
        file.flush()?;
        self.remap(&file, new_len)?;
        Ok(())
    }

    fn remap(&self, file: &File, len: u64) -> Result<()> {
        let mmap = MmapRaw::map_raw(file)?;
        let mut mapping = self.mapping.write().unwrap();
        mapping.mmap = Arc::new(mmap);
        mapping.len = len;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    /// Re-check the file's actual length and remap if another process has
    /// grown it since we last looked (called after acquiring a lock that
    /// a writer might have held while expanding).
    pub fn refresh(&self) -> Result<()> {
        let file = self.file.read().unwrap();
        let len = file.metadata()?.len();
        if len != self.mapping.read().unwrap().len {
            drop(file);
            let file = self.file.write().unwrap();
            let len = file.metadata()?.len();
            self.remap(&file, len)?;
        }
        Ok(())
    }

    /// Borrow `len` bytes at `off` directly from the mapping when the
    /// mapping already covers them; otherwise returns `None` and the caller
    /// should `refresh()` and retry, or fall back to `pread_copy`.
    pub fn access_read(&self, off: u64, len: u64) -> Result<ReadGuard> {
        if self.oob(off, len, false) {
            return Err(Error::corrupt("access past end of file"));
        }
        let mapping = self.mapping.read().unwrap();
        if off + len > mapping.len {
            drop(mapping);
            self.refresh()?;
            return self.access_read(off, len);
        }
        let mmap = mapping.mmap.clone();
        Ok(ReadGuard {
            mmap,
            off: off as usize,
            len: len as usize,
        })
    }

    /// Mutable access. Safety of concurrent writers across processes is the
    /// caller's responsibility (via the lock layer) -- within this process
    /// we additionally rely on never handing out two live `WriteGuard`s
    /// over overlapping ranges at once.
    pub fn access_write(&self, off: u64, len: u64) -> Result<WriteGuard> {
        if self.read_only {
            return Err(Error::Rdonly);
        }
        if self.oob(off, len, false) {
            return Err(Error::corrupt("write past end of file"));
        }
        let mapping = self.mapping.read().unwrap();
        if off + len > mapping.len {
            drop(mapping);
            self.refresh()?;
            return self.access_write(off, len);
        }
        let mmap = mapping.mmap.clone();
        Ok(WriteGuard {
            mmap,
            off: off as usize,
            len: len as usize,
        })
    }

    pub fn read_copy(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        Ok(self.access_read(off, len)?.to_vec())
    }

    pub fn write_all_at(&self, off: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.access_write(off, data.len() as u64)?;
        guard.copy_from_slice(data);
        Ok(())
    }

    /// Flush dirty mapped pages to disk (`msync` equivalent via `flush`).
    pub fn sync(&self) -> Result<()> {
        let mapping = self.mapping.read().unwrap();
        mapping.mmap.flush()?;
        Ok(())
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.read().unwrap().as_raw_fd()
    }
}

pub struct ReadGuard {
    mmap: Arc<MmapRaw>,
    off: usize,
    len: usize,
}

impl Deref for ReadGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(self.off), self.len) }
    }
}

pub struct WriteGuard {
    mmap: Arc<MmapRaw>,
    off: usize,
    len: usize,
}

impl Deref for WriteGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(self.off), self.len) }
    }
}

impl std::ops::DerefMut for WriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(self.off), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_file(initial: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(initial).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn read_and_write_roundtrip() {
        let f = temp_file(&[0u8; 64]);
        let storage = Storage::open(f, false, false).unwrap();
        storage.write_all_at(8, b"hello").unwrap();
        let back = storage.read_copy(8, 5).unwrap();
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn expand_zero_fills_with_poison_byte() {
        let f = temp_file(&[0u8; 16]);
        let storage = Storage::open(f, false, false).unwrap();
        storage.expand_file(32).unwrap();
        let tail = storage.read_copy(16, 16).unwrap();
        assert!(tail.iter().all(|&b| b == FILL_BYTE));
    }

    #[test]
    fn oob_detection() {
        let f = temp_file(&[0u8; 16]);
        let storage = Storage::open(f, false, false).unwrap();
        assert!(storage.oob(10, 10, false));
        assert!(!storage.oob(0, 16, false));
    }

    #[test]
    fn read_only_rejects_write() {
        let f = temp_file(&[0u8; 16]);
        let storage = Storage::open(f, true, false).unwrap();
        assert!(storage.write_all_at(0, b"x").is_err());
    }
}
