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

//! Segregated free-space allocator.
//!
//! Free space is kept in `FREE_BUCKETS` singly linked lists bucketed by
//! `log2(len)`, threaded through a small free-table record near the start
//! of the file. A bucket holds every free record whose length falls in
//! `[2^b, 2^(b+1))`; allocation does a bounded best-fit search within the
//! smallest non-empty bucket that could possibly fit, splitting off any
//! leftover tail in place. Adjacent free records are physically coalesced
//! using a tailer word at the end of each free record so we can walk
//! backwards from any offset.

use crate::error::{Error, Result};
use crate::format::{
    FreeRecord, FREE_BUCKETS, FREE_HDR_LEN, FTABLE_NONE, MIN_DATA_LEN, USED_HDR_LEN,
};
use crate::io::Storage;

/// Maximum number of free records inspected in a single bucket before
/// giving up and moving to the next bucket up; bounds allocation time on a
/// badly fragmented file at the cost of occasionally missing a tighter fit.
const MAX_BUCKET_SEARCH: usize = 50;

pub fn size_to_bucket(len: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let bits = 63 - len.leading_zeros();
    (bits as usize).min(FREE_BUCKETS - 1)
}

/// Round a requested payload length up to what we'll actually reserve,
/// guaranteeing a freed record is always big enough to hold a free-record
/// header (so we never need a separate "too small to free" record type).
pub fn round_alloc_len(key_len: u64, data_len: u64) -> u64 {
    let payload = key_len + data_len;
    payload.max(MIN_DATA_LEN)
}

/// In-memory view of the free-table: one head offset per bucket. Offset 0
/// means empty (file offset 0 is always inside the header, never a valid
/// free record).
pub struct FreeTable {
    pub off: u64,
    pub heads: [u64; FREE_BUCKETS],
}

impl FreeTable {
    pub fn empty(off: u64) -> Self {
        FreeTable {
            off,
            heads: [0; FREE_BUCKETS],
        }
    }

    pub fn load(storage: &Storage, off: u64) -> Result<Self> {
        let mut heads = [0u64; FREE_BUCKETS];
        let raw = storage.read_copy(off, FREE_BUCKETS as u64 * 8)?;
        for (i, head) in heads.iter_mut().enumerate() {
            *head = crate::format::read_u64(&raw[i * 8..i * 8 + 8], storage.convert);
        }
        Ok(FreeTable { off, heads })
    }

    pub fn store(&self, storage: &Storage) -> Result<()> {
        let mut buf = vec![0u8; FREE_BUCKETS * 8];
        for (i, head) in self.heads.iter().enumerate() {
            crate::format::write_u64(&mut buf[i * 8..i * 8 + 8], *head, storage.convert);
        }
        storage.write_all_at(self.off, &buf)
    }
}

fn read_free_record(storage: &Storage, off: u64) -> Result<FreeRecord> {
    let raw = storage.read_copy(off, FREE_HDR_LEN)?;
    FreeRecord::decode(&raw)
}

fn write_free_record(storage: &Storage, off: u64, rec: &FreeRecord) -> Result<()> {
    storage.write_all_at(off, &rec.encode())
}

fn tailer_off(off: u64, len: u64) -> u64 {
    off + USED_HDR_LEN + len - 8
}

fn write_tailer(storage: &Storage, off: u64, len: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    crate::format::write_u64(&mut buf, len, storage.convert);
    storage.write_all_at(tailer_off(off, len), &buf)
}

fn read_tailer_len(storage: &Storage, record_end: u64) -> Result<u64> {
    if record_end < 8 {
        return Ok(0);
    }
    let raw = storage.read_copy(record_end - 8, 8)?;
    Ok(crate::format::read_u64(&raw, storage.convert))
}

impl FreeTable {
    fn unlink(&mut self, storage: &Storage, bucket: usize, off: u64, rec: &FreeRecord) -> Result<()> {
        if rec.prev == 0 {
            self.heads[bucket] = rec.next;
        } else {
            let mut prev = read_free_record(storage, rec.prev)?;
            prev.next = rec.next;
            write_free_record(storage, rec.prev, &prev)?;
        }
        if rec.next != 0 {
            let mut next = read_free_record(storage, rec.next)?;
            next.prev = rec.prev;
            write_free_record(storage, rec.next, &next)?;
        }
        Ok(())
    }

    fn push_front(&mut self, storage: &Storage, bucket: usize, off: u64, len: u64) -> Result<()> {
        let old_head = self.heads[bucket];
        let rec = FreeRecord {
            prev: 0,
            ftable: bucket as u8,
            len,
            next: old_head,
        };
        write_free_record(storage, off, &rec)?;
        write_tailer(storage, off, len)?;
        if old_head != 0 {
            let mut head = read_free_record(storage, old_head)?;
            head.prev = off;
            write_free_record(storage, old_head, &head)?;
        }
        self.heads[bucket] = off;
        Ok(())
    }

    /// Add `len` bytes of payload capacity (i.e. not counting the used
    /// record header) at `off` back to the free pool, coalescing with any
    /// physically adjacent free record first.
    pub fn add_free_record(&mut self, storage: &Storage, mut off: u64, mut len: u64) -> Result<()> {
        // Coalesce with the record physically before us, if it's free: its
        // tailer, if present, sits right before our header.
        if off >= 8 {
            if let Ok(prev_len) = read_tailer_len(storage, off) {
                if prev_len != 0 {
                    let prev_off = off.saturating_sub(USED_HDR_LEN + prev_len);
                    if prev_off < off {
                        if let Ok(prev_rec) = read_free_record(storage, prev_off) {
                            if prev_rec.len == prev_len {
                                let bucket = size_to_bucket(prev_len);
                                self.unlink(storage, bucket, prev_off, &prev_rec)?;
                                len = len + USED_HDR_LEN + prev_len;
                                off = prev_off;
                            }
                        }
                    }
                }
            }
        }

        // Coalesce with the record physically after us.
        let after_off = off + USED_HDR_LEN + len;
        if !storage.oob(after_off, FREE_HDR_LEN, true) {
            if let Ok(next_rec) = read_free_record(storage, after_off) {
                let bucket = size_to_bucket(next_rec.len);
                self.unlink(storage, bucket, after_off, &next_rec)?;
                len = len + USED_HDR_LEN + next_rec.len;
            }
        }

        let bucket = size_to_bucket(len);
        self.push_front(storage, bucket, off, len)
    }

    /// Best-fit allocation of at least `need` bytes of payload. Returns the
    /// offset of the (still free-record-formatted) space; caller is
    /// responsible for overwriting it with a used record, splitting off
    /// any leftover first.
    pub fn alloc(&mut self, storage: &Storage, need: u64) -> Result<Option<u64>> {
        let start_bucket = size_to_bucket(need);
        for bucket in start_bucket..FREE_BUCKETS {
            let mut cur = self.heads[bucket];
            let mut best: Option<(u64, FreeRecord)> = None;
            let mut examined = 0;
            while cur != 0 && examined < MAX_BUCKET_SEARCH {
                let rec = read_free_record(storage, cur)?;
                if rec.len >= need {
                    let better = match &best {
                        None => true,
                        Some((_, b)) => rec.len < b.len,
                    };
                    if better {
                        best = Some((cur, rec));
                    }
                }
                cur = rec.next;
                examined += 1;
            }
            if let Some((off, rec)) = best {
                self.unlink(storage, bucket, off, &rec)?;
                self.maybe_split(storage, off, rec.len, need)?;
                return Ok(Some(off));
            }
        }
        Ok(None)
    }

    /// If the free record we just pulled out is big enough to usefully
    /// split (leftover fits a free-record header plus minimum payload),
    /// carve off the tail and return it to the pool.
    fn maybe_split(&mut self, storage: &Storage, off: u64, have: u64, need: u64) -> Result<()> {
        if have < need {
            return Err(Error::corrupt("allocator picked a too-small free record"));
        }
        let leftover = have - need;
        if leftover < FREE_HDR_LEN {
            return Ok(());
        }
        let tail_off = off + USED_HDR_LEN + need;
        let tail_len = leftover - USED_HDR_LEN;
        self.add_free_record(storage, tail_off, tail_len)
    }
}

/// How large a new file segment should be when the allocator can't satisfy
/// a request from existing free space, mirroring the original's capped
/// exponential growth.
pub fn growth_size(current_len: u64, needed: u64) -> u64 {
    let grown = current_len + current_len / crate::format::EXTENSION_FACTOR.max(1);
    let min_needed = current_len + needed + USED_HDR_LEN;
    grown.max(min_needed)
}

pub const FTABLE_SENTINEL: u8 = FTABLE_NONE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(size_to_bucket(1), 0);
        assert_eq!(size_to_bucket(2), 1);
        assert_eq!(size_to_bucket(3), 1);
        assert_eq!(size_to_bucket(4), 2);
        assert_eq!(size_to_bucket(1023), 9);
        assert_eq!(size_to_bucket(1024), 10);
    }

    #[test]
    fn round_alloc_len_enforces_minimum() {
        assert_eq!(round_alloc_len(0, 0), MIN_DATA_LEN);
        assert!(round_alloc_len(100, 100) >= 200);
    }

    fn temp_storage(len: u64) -> Storage {
        use std::io::Write;
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; len as usize]).unwrap();
        Storage::open(f, false, false).unwrap()
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let storage = temp_storage(4096);
        let mut table = FreeTable::empty(0);
        table.add_free_record(&storage, 64, 512).unwrap();
        let got = table.alloc(&storage, 100).unwrap();
        assert_eq!(got, Some(64));
    }

    #[test]
    fn alloc_too_large_returns_none() {
        let storage = temp_storage(4096);
        let mut table = FreeTable::empty(0);
        table.add_free_record(&storage, 64, 100).unwrap();
        let got = table.alloc(&storage, 10_000).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn split_leaves_usable_remainder() {
        let storage = temp_storage(4096);
        let mut table = FreeTable::empty(0);
        table.add_free_record(&storage, 64, 1000).unwrap();
        let got = table.alloc(&storage, 50).unwrap().unwrap();
        assert_eq!(got, 64);
        // the remainder should have gone back into some bucket
        assert!(table.heads.iter().any(|&h| h != 0));
    }
}
