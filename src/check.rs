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

//! Internal consistency checker.
//!
//! Walks the whole file once classifying every record by its magic, then
//! cross-checks that classification two ways: every free record must
//! appear exactly once when walking the free-table buckets, and every used
//! record must be reachable from the hash table through its own hash
//! chain. A caller-supplied predicate can additionally validate individual
//! key/value pairs (e.g. that they deserialize to whatever the embedding
//! application expects).

use std::collections::HashSet;

use crate::alloc::{size_to_bucket, FreeTable};
use crate::error::{Error, Result};
use crate::format::{
    self, FreeRecord, UsedRecord, CAP_MAGIC, CHAIN_MAGIC, FREE_HDR_LEN, FTABLE_MAGIC, USED_HDR_LEN,
    USED_MAGIC,
};
use crate::hash::{extra_bits, jenkins_hash_stable, top_bucket};
use crate::io::Storage;

#[derive(Debug, Default, Clone, Copy)]
pub struct CheckStats {
    pub used_records: u64,
    pub free_records: u64,
    pub htable_records: u64,
    pub chain_records: u64,
    pub ftable_records: u64,
    pub cap_records: u64,
}

pub type RecordPredicate<'a> = dyn Fn(&[u8], &[u8]) -> bool + 'a;

/// Run a full linear-scan + cross-check pass. `hash_fn`/`hash_seed` must
/// match whatever the database was opened with. Returns aggregate stats on
/// success, or the first inconsistency found as an error.
pub fn check(
    storage: &Storage,
    hash_bits: u32,
    hash_seed: u32,
    htable_off: u64,
    free_table_off: u64,
    data_start: u64,
    predicate: Option<&RecordPredicate>,
) -> Result<CheckStats> {
    let mut stats = CheckStats::default();
    let mut seen_free: HashSet<u64> = HashSet::new();
    let mut seen_used: HashSet<u64> = HashSet::new();

    let file_len = storage.file_size();
    // Walk every record physically, classifying it and validating basic
    // shape. Two regions have no per-record magic and are skipped as
    // pseudo-records instead of decoded: the hash table itself (starts
    // right after the header, `2^hash_bits` slots of 8 bytes) and the
    // free-table-plus-recovery-area span that runs from `free_table_off`
    // up to `data_start` (a bare bucket-head array followed by the
    // reserved recovery log, neither of which carries a record header).
    let htable_bytes = crate::hash::hash_table_size(hash_bits) * 8;
    stats.htable_records += 1;
    debug_assert_eq!(htable_off + htable_bytes, free_table_off);
    let mut off = data_start;

    while off < file_len {
        if off + 8 > file_len {
            return Err(Error::corrupt("trailing bytes too short for a record header"));
        }
        let peek = storage.read_copy(off, 16.min(file_len - off))?;
        if peek.len() < 2 {
            break;
        }
        // Used/chain/ftable/cap records all start with a 16-byte header
        // whose top 16 bits are the magic; free records use an 8-byte
        // magic-in-top-byte scheme instead. Try used-record decode first.
        if peek.len() >= 16 {
            if let Ok(rec) = UsedRecord::decode(&peek) {
                match rec.magic {
                    USED_MAGIC => {
                        let total = rec.total_len();
                        validate_used(storage, off, &rec, predicate)?;
                        seen_used.insert(off);
                        stats.used_records += 1;
                        off += total;
                        continue;
                    }
                    CHAIN_MAGIC => {
                        seen_used.insert(off);
                        stats.chain_records += 1;
                        off += rec.total_len();
                        continue;
                    }
                    FTABLE_MAGIC => {
                        stats.ftable_records += 1;
                        off += rec.total_len();
                        continue;
                    }
                    CAP_MAGIC => {
                        stats.cap_records += 1;
                        off += rec.total_len();
                        continue;
                    }
                    _ => {}
                }
            }
        }
        if peek.len() >= FREE_HDR_LEN as usize {
            if let Ok(rec) = FreeRecord::decode(&peek) {
                if rec.len >= FREE_HDR_LEN - USED_HDR_LEN {
                    seen_free.insert(off);
                    stats.free_records += 1;
                    off += USED_HDR_LEN + rec.len;
                    continue;
                }
            }
        }
        return Err(Error::corrupt(format!(
            "unrecognized record magic at offset {off}"
        )));
    }

    verify_free_table(storage, free_table_off, &seen_free)?;
    verify_hash_table(storage, hash_bits, hash_seed, htable_off, &seen_used)?;

    Ok(stats)
}

fn validate_used(
    storage: &Storage,
    off: u64,
    rec: &UsedRecord,
    predicate: Option<&RecordPredicate>,
) -> Result<()> {
    if let Some(pred) = predicate {
        let key = storage.read_copy(off + USED_HDR_LEN, rec.key_len)?;
        let val = storage.read_copy(off + USED_HDR_LEN + rec.key_len, rec.data_len)?;
        if !pred(&key, &val) {
            return Err(Error::corrupt(format!(
                "record predicate rejected record at offset {off}"
            )));
        }
    }
    Ok(())
}

/// Walk every bucket of the free-table and check each record we find
/// there was also seen during the linear scan, exactly once, and in the
/// bucket its length implies.
fn verify_free_table(storage: &Storage, free_table_off: u64, seen_free: &HashSet<u64>) -> Result<()> {
    let table = FreeTable::load(storage, free_table_off)?;
    let mut visited: HashSet<u64> = HashSet::new();
    for (bucket, &head) in table.heads.iter().enumerate() {
        let mut cur = head;
        while cur != 0 {
            if !seen_free.contains(&cur) {
                return Err(Error::corrupt(format!(
                    "free-table bucket {bucket} references offset {cur} not seen in linear scan"
                )));
            }
            if !visited.insert(cur) {
                return Err(Error::corrupt(format!(
                    "free record at offset {cur} linked into more than one bucket chain"
                )));
            }
            let raw = storage.read_copy(cur, FREE_HDR_LEN)?;
            let rec = FreeRecord::decode(&raw)?;
            let expected_bucket = size_to_bucket(rec.len);
            if expected_bucket != bucket {
                return Err(Error::corrupt(format!(
                    "free record at {cur} of len {} found in bucket {bucket}, expected {expected_bucket}",
                    rec.len
                )));
            }
            cur = rec.next;
        }
    }
    if visited.len() != seen_free.len() {
        return Err(Error::corrupt(
            "linear scan found free records unreachable from any free-table bucket",
        ));
    }
    Ok(())
}

/// Validate the used record a direct (non-chain) slot points at: that it
/// really is a used record, that its stored extra hash bits and top-level
/// bucket both agree with a fresh hash of its key (the §8 encoding
/// invariant), and that it was seen exactly once during the linear scan.
fn check_direct_slot(
    storage: &Storage,
    hash_bits: u32,
    hash_seed: u32,
    bucket: u64,
    slot: u64,
    seen_used: &HashSet<u64>,
    visited: &mut HashSet<u64>,
) -> Result<()> {
    let off = format::slot_offset(slot);
    let header = storage.read_copy(off, USED_HDR_LEN)?;
    let rec = UsedRecord::decode(&header)?;
    if rec.magic != USED_MAGIC {
        return Err(Error::corrupt(format!(
            "hash slot at bucket {bucket} points at non-used record offset {off}"
        )));
    }
    let key = storage.read_copy(off + USED_HDR_LEN, rec.key_len)?;
    let hash = jenkins_hash_stable(&key, hash_seed);
    if top_bucket(hash, hash_bits) != bucket {
        return Err(Error::corrupt(format!(
            "record at offset {off} stored in bucket {bucket} but hashes to a different one"
        )));
    }
    let want_extra = extra_bits(hash, hash_bits, format::OFF_UPPER_STEAL);
    if format::slot_extra_bits(slot) != want_extra {
        return Err(Error::corrupt(format!(
            "record at offset {off} has extra hash bits that disagree with its key's hash"
        )));
    }
    if !seen_used.contains(&off) {
        return Err(Error::corrupt(format!(
            "hash table references offset {off} not seen in linear scan"
        )));
    }
    if !visited.insert(off) {
        return Err(Error::corrupt(format!(
            "record at offset {off} reachable from more than one hash slot"
        )));
    }
    Ok(())
}

/// Walk the top-level hash table and every chain record reachable from it,
/// checking that each occupied slot's extra hash bits and top bucket agree
/// with a fresh hash of the key it points to, and that every used record
/// (and chain record) seen in the linear scan is reachable this way exactly
/// once.
fn verify_hash_table(
    storage: &Storage,
    hash_bits: u32,
    hash_seed: u32,
    htable_off: u64,
    seen_used: &HashSet<u64>,
) -> Result<()> {
    let slots = crate::hash::hash_table_size(hash_bits);
    let mut visited: HashSet<u64> = HashSet::new();

    for bucket in 0..slots {
        let slot_off = htable_off + bucket * 8;
        let raw = storage.read_copy(slot_off, 8)?;
        let slot = crate::format::read_u64(&raw, storage.convert);
        if slot == 0 {
            continue;
        }
        if !format::slot_is_chain(slot) {
            check_direct_slot(storage, hash_bits, hash_seed, bucket, slot, seen_used, &mut visited)?;
            continue;
        }

        let chain_off = format::slot_offset(slot);
        let header = storage.read_copy(chain_off, USED_HDR_LEN)?;
        let rec = UsedRecord::decode(&header)?;
        if rec.magic != CHAIN_MAGIC {
            return Err(Error::corrupt(format!(
                "hash slot at bucket {bucket} points at non-chain record offset {chain_off}"
            )));
        }
        if !seen_used.contains(&chain_off) {
            return Err(Error::corrupt(format!(
                "hash table references chain offset {chain_off} not seen in linear scan"
            )));
        }
        if !visited.insert(chain_off) {
            return Err(Error::corrupt(format!(
                "chain record at offset {chain_off} reachable from more than one hash slot"
            )));
        }

        let n = rec.data_len / 8;
        let raw = storage.read_copy(chain_off + USED_HDR_LEN, rec.data_len)?;
        for i in 0..n {
            let i = i as usize;
            let cslot = crate::format::read_u64(&raw[i * 8..i * 8 + 8], storage.convert);
            if cslot == 0 {
                continue;
            }
            if format::slot_is_chain(cslot) {
                return Err(Error::corrupt(format!(
                    "chain record at offset {chain_off} has a nested chain pointer at slot {i}"
                )));
            }
            check_direct_slot(storage, hash_bits, hash_seed, bucket, cslot, seen_used, &mut visited)?;
        }
    }

    if visited.len() != seen_used.len() {
        return Err(Error::corrupt(
            "linear scan found used or chain records unreachable from the hash table",
        ));
    }
    Ok(())
}
