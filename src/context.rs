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

//! Public API: [`Ntdb`], [`OpenOptions`] and [`StoreMode`].
//!
//! Ties the file/lock/allocator/hash/transaction/check layers together
//! into the operations an embedding application actually calls. A
//! top-level hash slot either points directly at a used record (with
//! extra hash bits packed into its high byte) or, once a bucket
//! collides, at a `CHAIN_MAGIC` record whose payload is a packed array of
//! slot values using the same encoding; chains grow in place while spare
//! padding remains and are reallocated one slot larger once it runs out.

use std::fs::OpenOptions as FsOpenOptions;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::alloc::{round_alloc_len, FreeTable};
use crate::error::{default_log_fn, Error, LogFn, LogLevel, Result};
use crate::format::{self, Header, UsedRecord, CHAIN_MAGIC, USED_HDR_LEN, USED_MAGIC};
use crate::hash::{extra_bits, jenkins_hash_stable, top_bucket};
use crate::io::Storage;
use crate::lock::{hash_bucket_offset, offsets, LockKind, LockManager};
use crate::registry::{self, FileKey};
use crate::transaction::{replay_recovery, Transaction};

const RECOVERY_RESERVED: u64 = 65536;

/// Slots of zeroed padding left on a freshly (re)allocated chain record so
/// the next collision in the same bucket can grow it in place instead of
/// reallocating again immediately.
const CHAIN_GROW_SLACK_SLOTS: u64 = 1;

pub type HashFn = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with [`Error::Exists`] if the key is already present.
    Insert,
    /// Overwrite if present, insert otherwise.
    Replace,
    /// Fail with [`Error::NoExist`] if the key is absent.
    Modify,
}

pub struct OpenOptions {
    create: bool,
    read_only: bool,
    hash_fn: Option<HashFn>,
    hash_seed: u32,
    log_fn: Option<LogFn>,
    allow_nesting: bool,
    convert: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            create: false,
            read_only: false,
            hash_fn: None,
            hash_seed: 0,
            log_fn: None,
            allow_nesting: false,
            convert: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn hash_fn(mut self, f: HashFn) -> Self {
        self.hash_fn = Some(f);
        self
    }

    pub fn hash_seed(mut self, seed: u32) -> Self {
        self.hash_seed = seed;
        self
    }

    pub fn log_fn(mut self, f: LogFn) -> Self {
        self.log_fn = Some(f);
        self
    }

    pub fn allow_nesting(mut self, allow: bool) -> Self {
        self.allow_nesting = allow;
        self
    }

    pub fn convert(mut self, convert: bool) -> Self {
        self.convert = convert;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Ntdb> {
        Ntdb::open_with(path.as_ref(), self)
    }
}

struct Layout {
    htable_off: u64,
    free_table_off: u64,
    recovery_off: u64,
    data_start: u64,
}

pub(crate) struct Shared {
    storage: Storage,
    lock_mgr: LockManager,
    hash_bits: u32,
    hash_seed: u32,
    hash_fn: HashFn,
    layout: Layout,
    log_fn: LogFn,
    seqnum: AtomicU64,
    name: PathBuf,
    allow_nesting: bool,
}

impl Shared {
    fn log(&self, level: LogLevel, msg: impl AsRef<str>) {
        (self.log_fn)(level, msg.as_ref());
    }

    fn hash(&self, key: &[u8]) -> u64 {
        (self.hash_fn)(key)
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        self.storage.fd()
    }
}

pub struct Ntdb {
    shared: Arc<Shared>,
    key: FileKey,
}

/// Where a key was (or would be) found, produced by [`Ntdb::locate`] and
/// consumed by the insert/remove helpers so they don't have to re-derive
/// bucket/chain structure that lookup already walked.
struct HashCursor {
    bucket: u64,
    /// The extra hash bits this key's full hash contributes to a slot.
    extra: u8,
    location: CursorLocation,
}

enum CursorLocation {
    /// The top-level slot is empty.
    TopEmpty,
    /// The top-level slot is a direct pointer (whether or not it matched).
    TopDirect,
    /// The top-level slot points at a chain record.
    InChain {
        chain_off: u64,
        rec: UsedRecord,
        slots: Vec<u64>,
        /// First empty slot index found while scanning, if any.
        insert_idx: Option<usize>,
    },
}

impl Ntdb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    fn open_with(path: &Path, opts: OpenOptions) -> Result<Self> {
        let mut fs_opts = FsOpenOptions::new();
        fs_opts.read(true).write(!opts.read_only);
        if opts.create {
            fs_opts.create(true);
        }
        let file = fs_opts.open(path).map_err(|e| {
            Error::io_context(e, format!("opening {}", path.display()))
        })?;

        let meta = file.metadata()?;
        let key = FileKey {
            dev: meta.dev(),
            ino: meta.ino(),
        };

        if let Some(shared) = registry::lookup(key) {
            return Ok(Ntdb { shared, key });
        }

        let log_fn = opts.log_fn.clone().unwrap_or_else(default_log_fn);

        let is_new = meta.len() == 0;
        let storage = Storage::open(file, opts.read_only, opts.convert)?;

        let (layout, hash_bits, hash_seed) = if is_new {
            if opts.read_only {
                return Err(Error::einval("cannot create a new database read-only"));
            }
            let (layout, hash_bits) = Self::initialize(&storage, opts.hash_seed)?;
            (layout, hash_bits, opts.hash_seed)
        } else {
            Self::read_layout(&storage)?
        };

        let hash_fn = opts
            .hash_fn
            .clone()
            .unwrap_or_else(|| Arc::new(move |k: &[u8]| jenkins_hash_stable(k, hash_seed)));

        if !is_new {
            let raw = storage.read_copy(0, Header::ON_DISK_LEN)?;
            let header = Header::decode(&raw, storage.convert)?;
            if header.capabilities != 0 {
                let cap = crate::capability::Capability::decode(header.capabilities, 0);
                crate::capability::check_capabilities(&[cap], !opts.read_only)?;
            }
        }

        if !opts.read_only {
            replay_recovery(&storage, layout.recovery_off)?;
        }

        let shared = Arc::new(Shared {
            storage,
            lock_mgr: LockManager::with_fcntl(),
            hash_bits,
            hash_seed,
            hash_fn,
            layout,
            log_fn,
            seqnum: AtomicU64::new(0),
            name: path.to_path_buf(),
            allow_nesting: opts.allow_nesting,
        });

        shared.log(
            LogLevel::UseError,
            format!("opened {} ({} hash bits)", path.display(), hash_bits),
        );
        registry::register(key, &shared);
        Ok(Ntdb { shared, key })
    }

    fn initialize(storage: &Storage, hash_seed: u32) -> Result<(Layout, u32)> {
        let hash_bits = format::DEFAULT_HASH_BITS;
        let slots = crate::hash::hash_table_size(hash_bits);
        let htable_off = Header::ON_DISK_LEN;
        let free_table_off = htable_off + slots * 8;
        let recovery_off = free_table_off + crate::format::FREE_BUCKETS as u64 * 8;
        let data_start = recovery_off + RECOVERY_RESERVED;

        storage.expand_file(data_start)?;

        let hash_test = jenkins_hash_stable(format::MAGIC_FOOD, hash_seed);
        let header = Header::new(hash_bits, hash_test, hash_seed);
        storage.write_all_at(0, &header.encode(storage.convert))?;

        let zero_slots = vec![0u8; (slots * 8) as usize];
        storage.write_all_at(htable_off, &zero_slots)?;

        let table = FreeTable::empty(free_table_off);
        table.store(storage)?;

        let mut invalid = [0u8; 8];
        format::write_u64(&mut invalid, format::RECOVERY_INVALID_MAGIC, storage.convert);
        storage.write_all_at(recovery_off, &invalid)?;

        Ok((
            Layout {
                htable_off,
                free_table_off,
                recovery_off,
                data_start,
            },
            hash_bits,
        ))
    }

    fn read_layout(storage: &Storage) -> Result<(Layout, u32, u32)> {
        let raw = storage.read_copy(0, Header::ON_DISK_LEN)?;
        let header = Header::decode(&raw, storage.convert)?;
        if header.version != format::VERSION {
            return Err(Error::corrupt("unsupported file version"));
        }
        let hash_bits = header.hash_bits;
        let slots = crate::hash::hash_table_size(hash_bits);
        let htable_off = Header::ON_DISK_LEN;
        let free_table_off = htable_off + slots * 8;
        let recovery_off = free_table_off + crate::format::FREE_BUCKETS as u64 * 8;
        let data_start = recovery_off + RECOVERY_RESERVED;
        Ok((
            Layout {
                htable_off,
                free_table_off,
                recovery_off,
                data_start,
            },
            hash_bits,
            header.hash_seed,
        ))
    }

    pub fn name(&self) -> &Path {
        &self.shared.name
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.shared.fd()
    }

    pub fn get_seqnum(&self) -> u64 {
        self.shared.seqnum.load(Ordering::Acquire)
    }

    fn bump_seqnum(&self) {
        self.shared.seqnum.fetch_add(1, Ordering::AcqRel);
    }

    fn slot_off(&self, bucket: u64) -> u64 {
        self.shared.layout.htable_off + bucket * 8
    }

    fn read_slot(&self, bucket: u64) -> Result<u64> {
        let raw = self.shared.storage.read_copy(self.slot_off(bucket), 8)?;
        Ok(format::read_u64(&raw, self.shared.storage.convert))
    }

    fn write_slot(&self, bucket: u64, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        format::write_u64(&mut buf, value, self.shared.storage.convert);
        self.shared.storage.write_all_at(self.slot_off(bucket), &buf)
    }

    fn lock_bucket(&self, bucket: u64, kind: LockKind) -> Result<()> {
        let off = hash_bucket_offset(bucket);
        self.shared
            .lock_mgr
            .lock(self.shared.fd(), kind, off, 1, true)?;
        Ok(())
    }

    fn unlock_bucket(&self, bucket: u64) -> Result<()> {
        self.shared.lock_mgr.unlock(self.shared.fd(), hash_bucket_offset(bucket), 1)
    }

    /// Read a used record's header and key/value bytes at `off`.
    fn read_record(&self, off: u64) -> Result<(UsedRecord, Vec<u8>, Vec<u8>)> {
        let header_raw = self.shared.storage.read_copy(off, 16)?;
        let rec = UsedRecord::decode(&header_raw)?;
        if rec.magic != USED_MAGIC {
            return Err(Error::corrupt(format!("expected used record at {off}")));
        }
        let key = self.shared.storage.read_copy(off + USED_HDR_LEN, rec.key_len)?;
        let val = self
            .shared
            .storage
            .read_copy(off + USED_HDR_LEN + rec.key_len, rec.data_len)?;
        Ok((rec, key, val))
    }

    /// Read a chain record's header and its packed array of slot values.
    fn read_chain(&self, off: u64) -> Result<(UsedRecord, Vec<u64>)> {
        let header_raw = self.shared.storage.read_copy(off, USED_HDR_LEN)?;
        let rec = UsedRecord::decode(&header_raw)?;
        if rec.magic != CHAIN_MAGIC {
            return Err(Error::corrupt(format!("expected chain record at {off}")));
        }
        let n = rec.data_len / 8;
        let raw = self.shared.storage.read_copy(off + USED_HDR_LEN, rec.data_len)?;
        let slots = (0..n)
            .map(|i| {
                let i = i as usize;
                format::read_u64(&raw[i * 8..i * 8 + 8], self.shared.storage.convert)
            })
            .collect();
        Ok((rec, slots))
    }

    fn write_chain_slot(&self, chain_off: u64, idx: u64, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        format::write_u64(&mut buf, value, self.shared.storage.convert);
        self.shared
            .storage
            .write_all_at(chain_off + USED_HDR_LEN + idx * 8, &buf)
    }

    /// Round `need` up to an even byte count: hash/chain slots steal
    /// offset bit 0 to flag a chain pointer (`format::OFF_CHAIN_BIT`), and
    /// `slot_offset` unconditionally masks it off, so every allocation
    /// span must land on an even offset. Returns the rounded length and
    /// how many of those bytes are pure padding.
    fn even_align(need: u64) -> (u64, u64) {
        let rounded = need + (need & 1);
        (rounded, rounded - need)
    }

    fn alloc_record(&self, free_table: &mut FreeTable, key: &[u8], val: &[u8]) -> Result<u64> {
        let payload = key.len() as u64 + val.len() as u64;
        let min_need = round_alloc_len(key.len() as u64, val.len() as u64);
        let (need, _) = Self::even_align(min_need);
        let padding = need - payload;
        let off = match free_table.alloc(&self.shared.storage, need)? {
            Some(off) => off,
            None => {
                let cur_len = self.shared.storage.file_size();
                let grown = crate::alloc::growth_size(cur_len, need + USED_HDR_LEN);
                self.shared.storage.expand_file(grown)?;
                cur_len
            }
        };
        let rec = UsedRecord::new(USED_MAGIC, key.len() as u64, val.len() as u64, padding as u32);
        self.shared.storage.write_all_at(off, &rec.encode())?;
        self.shared.storage.write_all_at(off + USED_HDR_LEN, key)?;
        self.shared
            .storage
            .write_all_at(off + USED_HDR_LEN + key.len() as u64, val)?;
        Ok(off)
    }

    /// Allocate and write a new chain record holding `slots`, reserving
    /// `slack_slots` worth of zeroed padding for future in-place growth.
    fn alloc_chain(
        &self,
        free_table: &mut FreeTable,
        slots: &[u64],
        slack_slots: u64,
    ) -> Result<u64> {
        let data_len = slots.len() as u64 * 8;
        let raw_padding = slack_slots * 8;
        let (need, extra_align) = Self::even_align(data_len + raw_padding);
        let padding = (raw_padding + extra_align) as u32;

        let off = match free_table.alloc(&self.shared.storage, need)? {
            Some(off) => off,
            None => {
                let cur_len = self.shared.storage.file_size();
                let grown = crate::alloc::growth_size(cur_len, need + USED_HDR_LEN);
                self.shared.storage.expand_file(grown)?;
                cur_len
            }
        };
        let rec = UsedRecord::new(CHAIN_MAGIC, 0, data_len, padding);
        self.shared.storage.write_all_at(off, &rec.encode())?;

        let mut buf = vec![0u8; need as usize];
        for (i, &s) in slots.iter().enumerate() {
            format::write_u64(&mut buf[i * 8..i * 8 + 8], s, self.shared.storage.convert);
        }
        self.shared.storage.write_all_at(off + USED_HDR_LEN, &buf)?;
        Ok(off)
    }

    /// Locate `key` in `bucket`'s chain, per §4.4: compare extra hash bits
    /// before ever reading a candidate record's key, and while scanning a
    /// chain remember the first empty slot as a future insertion point.
    fn locate(&self, bucket: u64, hash: u64, key: &[u8]) -> Result<(HashCursor, Option<(u64, UsedRecord)>)> {
        let want_extra = extra_bits(hash, self.shared.hash_bits, format::OFF_UPPER_STEAL);
        let slot = self.read_slot(bucket)?;

        if slot == 0 {
            return Ok((
                HashCursor {
                    bucket,
                    extra: want_extra,
                    location: CursorLocation::TopEmpty,
                },
                None,
            ));
        }

        if !format::slot_is_chain(slot) {
            let off = format::slot_offset(slot);
            let extra = format::slot_extra_bits(slot);
            let matched = if extra == want_extra {
                let (rec, rec_key, _) = self.read_record(off)?;
                if rec_key == key {
                    Some((off, rec))
                } else {
                    None
                }
            } else {
                None
            };
            return Ok((
                HashCursor {
                    bucket,
                    extra: want_extra,
                    location: CursorLocation::TopDirect,
                },
                matched,
            ));
        }

        let chain_off = format::slot_offset(slot);
        let (rec, slots) = self.read_chain(chain_off)?;
        let mut matched = None;
        let mut insert_idx = None;
        for (idx, &s) in slots.iter().enumerate() {
            if s == 0 {
                if insert_idx.is_none() {
                    insert_idx = Some(idx);
                }
                continue;
            }
            if format::slot_extra_bits(s) != want_extra {
                continue;
            }
            let off = format::slot_offset(s);
            let (rrec, rkey, _) = self.read_record(off)?;
            if rkey == key {
                matched = Some((off, rrec));
                break;
            }
        }
        Ok((
            HashCursor {
                bucket,
                extra: want_extra,
                location: CursorLocation::InChain {
                    chain_off,
                    rec,
                    slots,
                    insert_idx,
                },
            },
            matched,
        ))
    }

    /// Zero out the slot holding `off`, found via `cursor`.
    fn remove_from_hash(&self, cursor: &HashCursor, off: u64) -> Result<()> {
        match &cursor.location {
            CursorLocation::TopEmpty => Err(Error::corrupt("attempted to remove from an empty slot")),
            CursorLocation::TopDirect => self.write_slot(cursor.bucket, 0),
            CursorLocation::InChain { chain_off, slots, .. } => {
                let idx = slots
                    .iter()
                    .position(|&s| s != 0 && format::slot_offset(s) == off)
                    .ok_or_else(|| Error::corrupt("record to delete not found in its chain"))?;
                self.write_chain_slot(*chain_off, idx as u64, 0)
            }
        }
    }

    /// Write `new_off` into the hash index per §4.4's insertion rules,
    /// using whatever `cursor` (freshly re-located after any delete)
    /// found.
    fn insert_into_hash(
        &self,
        cursor: &HashCursor,
        new_off: u64,
        free_table: &mut FreeTable,
    ) -> Result<()> {
        match &cursor.location {
            CursorLocation::TopEmpty => {
                self.write_slot(cursor.bucket, format::encode_direct_slot(new_off, cursor.extra))
            }
            CursorLocation::TopDirect => {
                // Direct-slot collision: promote to a 2-slot chain holding
                // the record that was already there plus the new one.
                let existing_slot = self.read_slot(cursor.bucket)?;
                let chain_off = self.alloc_chain(
                    free_table,
                    &[existing_slot, format::encode_direct_slot(new_off, cursor.extra)],
                    0,
                )?;
                self.write_slot(cursor.bucket, format::encode_chain_slot(chain_off))
            }
            CursorLocation::InChain {
                chain_off,
                rec,
                slots,
                insert_idx,
            } => {
                if let Some(idx) = insert_idx {
                    self.write_chain_slot(
                        *chain_off,
                        *idx as u64,
                        format::encode_direct_slot(new_off, cursor.extra),
                    )
                } else if rec.extra_padding as u64 >= 8 {
                    let idx = slots.len() as u64;
                    let grown = UsedRecord::new(CHAIN_MAGIC, 0, rec.data_len + 8, rec.extra_padding - 8);
                    self.shared.storage.write_all_at(*chain_off, &grown.encode())?;
                    self.write_chain_slot(
                        *chain_off,
                        idx,
                        format::encode_direct_slot(new_off, cursor.extra),
                    )
                } else {
                    let mut new_slots = slots.clone();
                    new_slots.push(format::encode_direct_slot(new_off, cursor.extra));
                    let new_chain_off = self.alloc_chain(free_table, &new_slots, CHAIN_GROW_SLACK_SLOTS)?;
                    free_table.add_free_record(
                        &self.shared.storage,
                        *chain_off,
                        rec.total_len() - USED_HDR_LEN,
                    )?;
                    self.write_slot(cursor.bucket, format::encode_chain_slot(new_chain_off))
                }
            }
        }
    }

    fn load_free_table(&self) -> Result<FreeTable> {
        FreeTable::load(&self.shared.storage, self.shared.layout.free_table_off)
    }

    pub fn store(&self, key: &[u8], val: &[u8], mode: StoreMode) -> Result<()> {
        if self.shared.storage.read_only {
            return Err(Error::Rdonly);
        }
        let hash = self.shared.hash(key);
        let bucket = top_bucket(hash, self.shared.hash_bits);
        self.lock_bucket(bucket, LockKind::Write)?;
        let result = self.store_locked(bucket, hash, key, val, mode);
        self.unlock_bucket(bucket)?;
        result
    }

    fn store_locked(&self, bucket: u64, hash: u64, key: &[u8], val: &[u8], mode: StoreMode) -> Result<()> {
        let (cursor, existing) = self.locate(bucket, hash, key)?;
        match (&existing, mode) {
            (Some(_), StoreMode::Insert) => return Err(Error::Exists),
            (None, StoreMode::Modify) => return Err(Error::NoExist),
            _ => {}
        }

        let mut free_table = self.load_free_table()?;

        if let Some((old_off, old_rec)) = existing {
            self.remove_from_hash(&cursor, old_off)?;
            free_table.add_free_record(&self.shared.storage, old_off, old_rec.total_len() - USED_HDR_LEN)?;
        }

        let new_off = self.alloc_record(&mut free_table, key, val)?;
        // Re-locate rather than reuse `cursor`: removing the old entry (if
        // any) may have opened up a chain slot, and a fresh lookup is what
        // finds it.
        let (cursor, _) = self.locate(bucket, hash, key)?;
        self.insert_into_hash(&cursor, new_off, &mut free_table)?;
        free_table.store(&self.shared.storage)?;
        self.bump_seqnum();
        Ok(())
    }

    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = self.shared.hash(key);
        let bucket = top_bucket(hash, self.shared.hash_bits);
        self.lock_bucket(bucket, LockKind::Read)?;
        let result = self.locate(bucket, hash, key);
        self.unlock_bucket(bucket)?;
        match result?.1 {
            Some((off, rec)) => {
                let val = self
                    .shared
                    .storage
                    .read_copy(off + USED_HDR_LEN + rec.key_len, rec.data_len)?;
                Ok(Some(val))
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.fetch(key)?.is_some())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if self.shared.storage.read_only {
            return Err(Error::Rdonly);
        }
        let hash = self.shared.hash(key);
        let bucket = top_bucket(hash, self.shared.hash_bits);
        self.lock_bucket(bucket, LockKind::Write)?;
        let result = self.delete_locked(bucket, hash, key);
        self.unlock_bucket(bucket)?;
        result
    }

    fn delete_locked(&self, bucket: u64, hash: u64, key: &[u8]) -> Result<()> {
        let (cursor, existing) = self.locate(bucket, hash, key)?;
        let (off, rec) = match existing {
            Some(found) => found,
            None => return Err(Error::NoExist),
        };
        let mut free_table = self.load_free_table()?;
        self.remove_from_hash(&cursor, off)?;
        free_table.add_free_record(&self.shared.storage, off, rec.total_len() - USED_HDR_LEN)?;
        free_table.store(&self.shared.storage)?;
        self.bump_seqnum();
        Ok(())
    }

    pub fn append(&self, key: &[u8], extra: &[u8]) -> Result<()> {
        if self.shared.storage.read_only {
            return Err(Error::Rdonly);
        }
        let hash = self.shared.hash(key);
        let bucket = top_bucket(hash, self.shared.hash_bits);
        self.lock_bucket(bucket, LockKind::Write)?;
        let result = (|| {
            let mut combined = match self.locate(bucket, hash, key)?.1 {
                Some((off, rec)) => self
                    .shared
                    .storage
                    .read_copy(off + USED_HDR_LEN + rec.key_len, rec.data_len)?,
                None => Vec::new(),
            };
            combined.extend_from_slice(extra);
            self.store_locked(bucket, hash, key, &combined, StoreMode::Replace)
        })();
        self.unlock_bucket(bucket)?;
        result
    }

    /// Visit every key/value pair. `f` returning `false` stops the walk
    /// early. Each bucket is locked for reading only while it is visited.
    pub fn traverse(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<u64> {
        let slots = crate::hash::hash_table_size(self.shared.hash_bits);
        let mut count = 0u64;
        for bucket in 0..slots {
            self.lock_bucket(bucket, LockKind::Read)?;
            let chain = self.collect_bucket(bucket);
            self.unlock_bucket(bucket)?;
            let chain = chain?;
            for (key, val) in chain {
                count += 1;
                if !f(&key, &val) {
                    return Ok(count);
                }
            }
        }
        Ok(count)
    }

    /// All key/value pairs reachable from `bucket`'s slot, whether it's a
    /// direct pointer or a chain.
    fn collect_bucket(&self, bucket: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let slot = self.read_slot(bucket)?;
        if slot == 0 {
            return Ok(Vec::new());
        }
        if !format::slot_is_chain(slot) {
            let (_, key, val) = self.read_record(format::slot_offset(slot))?;
            return Ok(vec![(key, val)]);
        }
        let (_, slots) = self.read_chain(format::slot_offset(slot))?;
        let mut out = Vec::with_capacity(slots.len());
        for s in slots {
            if s == 0 {
                continue;
            }
            let (_, key, val) = self.read_record(format::slot_offset(s))?;
            out.push((key, val));
        }
        Ok(out)
    }

    /// Delete every key in the database.
    pub fn wipe_all(&self) -> Result<()> {
        if self.shared.storage.read_only {
            return Err(Error::Rdonly);
        }
        let slots = crate::hash::hash_table_size(self.shared.hash_bits);
        for bucket in 0..slots {
            self.lock_bucket(bucket, LockKind::Write)?;
            let result = (|| -> Result<()> {
                let slot = self.read_slot(bucket)?;
                if slot == 0 {
                    return Ok(());
                }
                let mut free_table = self.load_free_table()?;
                if !format::slot_is_chain(slot) {
                    let off = format::slot_offset(slot);
                    let (rec, _, _) = self.read_record(off)?;
                    free_table.add_free_record(&self.shared.storage, off, rec.total_len() - USED_HDR_LEN)?;
                } else {
                    let chain_off = format::slot_offset(slot);
                    let (chain_rec, chain_slots) = self.read_chain(chain_off)?;
                    for s in chain_slots {
                        if s == 0 {
                            continue;
                        }
                        let off = format::slot_offset(s);
                        let (rec, _, _) = self.read_record(off)?;
                        free_table.add_free_record(&self.shared.storage, off, rec.total_len() - USED_HDR_LEN)?;
                    }
                    free_table.add_free_record(
                        &self.shared.storage,
                        chain_off,
                        chain_rec.total_len() - USED_HDR_LEN,
                    )?;
                }
                self.write_slot(bucket, 0)?;
                free_table.store(&self.shared.storage)
            })();
            self.unlock_bucket(bucket)?;
            result?;
        }
        self.bump_seqnum();
        Ok(())
    }

    pub fn transaction_start(&self) -> Result<Transaction<'_>> {
        if self.shared.storage.read_only {
            return Err(Error::Rdonly);
        }
        self.shared
            .lock_mgr
            .lock(self.shared.fd(), LockKind::Write, offsets::TRANSACTION_LOCK, 1, true)?;
        Transaction::start(&self.shared.storage, self.shared.allow_nesting)
    }

    pub fn transaction_commit(&self, tx: Transaction<'_>) -> Result<()> {
        let result = tx.commit(self.shared.layout.recovery_off, RECOVERY_RESERVED);
        self.shared
            .lock_mgr
            .unlock(self.shared.fd(), offsets::TRANSACTION_LOCK, 1)?;
        self.bump_seqnum();
        result
    }

    pub fn transaction_cancel(&self, tx: Transaction<'_>) -> Result<()> {
        tx.cancel();
        self.shared
            .lock_mgr
            .unlock(self.shared.fd(), offsets::TRANSACTION_LOCK, 1)
    }

    pub fn lockall(&self) -> Result<()> {
        self.shared
            .lock_mgr
            .lock(self.shared.fd(), LockKind::Write, offsets::ALL_LOCK_BASE, offsets::ALL_LOCK_FULL, true)
            .map(|_| ())
    }

    pub fn lockall_read(&self) -> Result<()> {
        self.shared
            .lock_mgr
            .lock(self.shared.fd(), LockKind::Read, offsets::ALL_LOCK_BASE, offsets::ALL_LOCK_FULL, true)
            .map(|_| ())
    }

    pub fn unlockall(&self) -> Result<()> {
        self.shared
            .lock_mgr
            .unlock(self.shared.fd(), offsets::ALL_LOCK_BASE, offsets::ALL_LOCK_FULL)
    }

    pub fn check(&self) -> Result<crate::check::CheckStats> {
        crate::check::check(
            &self.shared.storage,
            self.shared.hash_bits,
            self.shared.hash_seed,
            self.shared.layout.htable_off,
            self.shared.layout.free_table_off,
            self.shared.layout.data_start,
            None,
        )
    }
}

impl Drop for Ntdb {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) <= 1 {
            registry::unregister(self.key);
        }
    }
}
