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

//! # On-disk layout
//!
//! Every record is hand-serialized to/from a byte buffer; there is no
//! `#[repr(C)]` struct laid over raw bytes, since several fields (key length,
//! which is stored in a runtime-variable number of bits) don't map onto a
//! fixed Rust layout anyway.
//!
//! All constants here come from `ccan/ntdb/private.h` in the original C
//! implementation this format is ported from.

use crate::error::{Error, Result};

pub const MAGIC_FOOD: &[u8; 10] = b"NTDB file\n";
pub const MAGIC_LEN: usize = 64;
pub const VERSION: u64 = 0x26011967 + 7;

pub const USED_MAGIC: u16 = 0x1999;
pub const HTABLE_MAGIC: u16 = 0x1888;
pub const CHAIN_MAGIC: u16 = 0x1777;
pub const FTABLE_MAGIC: u16 = 0x1666;
pub const CAP_MAGIC: u16 = 0x1555;
pub const FREE_MAGIC: u8 = 0xFE;
pub const HASH_MAGIC: u64 = 0xA1AB_E11A_0109_2008;
pub const RECOVERY_MAGIC: u64 = 0xF53B_C0E7_AD12_4589;
pub const RECOVERY_INVALID_MAGIC: u64 = 0;

/// Bits stolen from the top of every on-disk offset for extra hash bits
/// (hash slots) or free-table bucket index (free records).
pub const OFF_UPPER_STEAL: u32 = 8;
pub const OFF_CHAIN_BIT: u64 = 1;
pub const OFF_MASK: u64 = ((1u64 << (64 - OFF_UPPER_STEAL)) - 1) & !OFF_CHAIN_BIT;

pub const PAGE_SIZE: u64 = 16384;
pub const EXTENSION_FACTOR: u64 = 100;
pub const FREE_BUCKETS: usize = 64 - OFF_UPPER_STEAL as usize;
pub const FTABLE_NONE: u8 = ((1u32 << OFF_UPPER_STEAL) - 1) as u8;
pub const DEFAULT_HASH_BITS: u32 = 13;
pub const FILL_BYTE: u8 = 0x43;

pub const CAP_NOCHECK: u64 = 1 << 63;
pub const CAP_NOWRITE: u64 = 1 << 62;
pub const CAP_NOOPEN: u64 = 1 << 61;
pub const CAP_TYPE_MASK: u64 = (1u64 << 61) - 1;

pub const HEADER_RESERVED: usize = 22;

/// `sizeof(struct ntdb_used_record)`.
pub const USED_HDR_LEN: u64 = 16;
/// `sizeof(struct ntdb_free_record)`.
pub const FREE_HDR_LEN: u64 = 24;
/// Minimum payload a used record must reserve so it can always be turned
/// into a free record in place.
pub const MIN_DATA_LEN: u64 = FREE_HDR_LEN - USED_HDR_LEN;

/// The fixed-size header at offset 0.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u64,
    pub hash_bits: u32,
    pub hash_test: u64,
    pub hash_seed: u32,
    pub free_table: u64,
    pub recovery: u64,
    pub features_used: u64,
    pub features_offered: u64,
    pub seqnum: u64,
    pub capabilities: u64,
}

impl Header {
    pub const ON_DISK_LEN: u64 =
        MAGIC_LEN as u64 + 8 * 9 + HEADER_RESERVED as u64 * 8;

    pub fn new(hash_bits: u32, hash_test: u64, hash_seed: u32) -> Self {
        Header {
            version: VERSION,
            hash_bits,
            hash_test,
            hash_seed,
            free_table: 0,
            recovery: 0,
            features_used: 0,
            features_offered: 0,
            seqnum: 0,
            capabilities: 0,
        }
    }

    pub fn encode(&self, convert: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ON_DISK_LEN as usize);
        buf.extend_from_slice(MAGIC_FOOD);
        buf.resize(MAGIC_LEN, 0);
        push_u64(&mut buf, self.version, convert);
        push_u64(&mut buf, self.hash_bits as u64, convert);
        push_u64(&mut buf, self.hash_test, convert);
        push_u64(&mut buf, self.hash_seed as u64, convert);
        push_u64(&mut buf, self.free_table, convert);
        push_u64(&mut buf, self.recovery, convert);
        push_u64(&mut buf, self.features_used, convert);
        push_u64(&mut buf, self.features_offered, convert);
        push_u64(&mut buf, self.seqnum, convert);
        push_u64(&mut buf, self.capabilities, convert);
        for _ in 0..HEADER_RESERVED {
            push_u64(&mut buf, 0, convert);
        }
        buf
    }

    pub fn decode(buf: &[u8], convert: bool) -> Result<Self> {
        if buf.len() < Self::ON_DISK_LEN as usize {
            return Err(Error::corrupt("header shorter than expected"));
        }
        if &buf[..MAGIC_FOOD.len()] != MAGIC_FOOD {
            return Err(Error::corrupt("bad magic"));
        }
        let mut off = MAGIC_LEN;
        let mut next = || {
            let v = read_u64(&buf[off..off + 8], convert);
            off += 8;
            v
        };
        let version = next();
        let hash_bits = next() as u32;
        let hash_test = next();
        let hash_seed = next() as u32;
        let free_table = next();
        let recovery = next();
        let features_used = next();
        let features_offered = next();
        let seqnum = next();
        let capabilities = next();
        Ok(Header {
            version,
            hash_bits,
            hash_test,
            hash_seed,
            free_table,
            recovery,
            features_used,
            features_offered,
            seqnum,
            capabilities,
        })
    }
}

fn push_u64(buf: &mut Vec<u8>, v: u64, convert: bool) {
    if convert {
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn read_u64(buf: &[u8], convert: bool) -> u64 {
    let arr: [u8; 8] = buf[..8].try_into().unwrap();
    if convert {
        u64::from_be_bytes(arr)
    } else {
        u64::from_le_bytes(arr)
    }
}

pub fn write_u64(buf: &mut [u8], v: u64, convert: bool) {
    let bytes = if convert { v.to_be_bytes() } else { v.to_le_bytes() };
    buf[..8].copy_from_slice(&bytes);
}

/// `struct ntdb_used_record`: precedes every allocated payload.
#[derive(Debug, Clone, Copy)]
pub struct UsedRecord {
    pub magic: u16,
    pub key_len_bits: u8,
    pub extra_padding: u32,
    pub key_len: u64,
    pub data_len: u64,
}

impl UsedRecord {
    /// Smallest `key_len_bits` (always even, max 31*2) that can represent
    /// `key_len` in that many bits.
    fn bits_for(key_len: u64) -> u8 {
        let mut bits = 1u32;
        while bits < 31 && (1u64 << (bits * 2)) <= key_len {
            bits += 1;
        }
        bits as u8
    }

    pub fn new(magic: u16, key_len: u64, data_len: u64, extra_padding: u32) -> Self {
        UsedRecord {
            magic,
            key_len_bits: Self::bits_for(key_len),
            extra_padding,
            key_len,
            data_len,
        }
    }

    pub fn total_len(&self) -> u64 {
        USED_HDR_LEN + self.key_len + self.data_len + self.extra_padding as u64
    }

    pub fn encode(&self) -> [u8; 16] {
        let magic_and_meta = ((self.magic as u64) << 48)
            | (((self.key_len_bits as u64) & 0x1F) << 43)
            | ((self.extra_padding as u64) & 0xFFFF_FFFF) << 11;
        let key_and_data_len =
            (self.data_len << (self.key_len_bits as u64 * 2)) | self.key_len;
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&magic_and_meta.to_le_bytes());
        out[8..].copy_from_slice(&key_and_data_len.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::corrupt("used record header truncated"));
        }
        let magic_and_meta = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let key_and_data_len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let magic = (magic_and_meta >> 48) as u16;
        let key_len_bits = ((magic_and_meta >> 43) & 0x1F) as u8;
        let extra_padding = ((magic_and_meta >> 11) & 0xFFFF_FFFF) as u32;
        let key_len_bit_width = key_len_bits as u64 * 2;
        let key_len = if key_len_bit_width == 0 {
            0
        } else {
            key_and_data_len & ((1u64 << key_len_bit_width) - 1)
        };
        let data_len = if key_len_bit_width == 0 {
            key_and_data_len
        } else {
            key_and_data_len >> key_len_bit_width
        };
        Ok(UsedRecord {
            magic,
            key_len_bits,
            extra_padding,
            key_len,
            data_len,
        })
    }
}

/// `struct ntdb_free_record`: overlays the used header on freed space.
#[derive(Debug, Clone, Copy)]
pub struct FreeRecord {
    pub prev: u64,
    pub ftable: u8,
    pub len: u64,
    pub next: u64,
}

impl FreeRecord {
    pub fn encode(&self) -> [u8; 24] {
        let magic_and_prev = ((FREE_MAGIC as u64) << (64 - OFF_UPPER_STEAL)) | self.prev;
        let ftable_and_len = ((self.ftable as u64) << (64 - OFF_UPPER_STEAL)) | self.len;
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&magic_and_prev.to_le_bytes());
        out[8..16].copy_from_slice(&ftable_and_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(Error::corrupt("free record header truncated"));
        }
        let magic_and_prev = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let ftable_and_len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let next = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let magic = (magic_and_prev >> (64 - OFF_UPPER_STEAL)) as u8;
        if magic != FREE_MAGIC {
            return Err(Error::corrupt("bad free record magic"));
        }
        let prev = magic_and_prev & ((1u64 << (64 - OFF_UPPER_STEAL)) - 1);
        let ftable = (ftable_and_len >> (64 - OFF_UPPER_STEAL)) as u8;
        let len = ftable_and_len & ((1u64 << (64 - OFF_UPPER_STEAL)) - 1);
        Ok(FreeRecord {
            prev,
            ftable,
            len,
            next,
        })
    }
}

/// `struct ntdb_recovery_record`.
#[derive(Debug, Clone)]
pub struct RecoveryHeader {
    pub magic: u64,
    pub max_len: u64,
    pub len: u64,
    pub eof: u64,
}

impl RecoveryHeader {
    pub const LEN: u64 = 32;

    pub fn encode(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..16].copy_from_slice(&self.max_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.len.to_le_bytes());
        out[24..32].copy_from_slice(&self.eof.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::corrupt("recovery header truncated"));
        }
        Ok(RecoveryHeader {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            max_len: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            len: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            eof: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// Pack a used-record-relative offset plus extra hash bits into a hash
/// slot/table-of-contents value.
pub fn encode_direct_slot(off: u64, extra_hash_bits: u8) -> u64 {
    debug_assert_eq!(off & !OFF_MASK, 0, "offset uses reserved bits");
    off | ((extra_hash_bits as u64) << (64 - OFF_UPPER_STEAL))
}

pub fn encode_chain_slot(off: u64) -> u64 {
    debug_assert_eq!(off & !OFF_MASK, 0, "offset uses reserved bits");
    off | OFF_CHAIN_BIT
}

pub fn slot_is_chain(slot: u64) -> bool {
    slot & OFF_CHAIN_BIT != 0
}

pub fn slot_offset(slot: u64) -> u64 {
    slot & OFF_MASK
}

pub fn slot_extra_bits(slot: u64) -> u8 {
    (slot >> (64 - OFF_UPPER_STEAL)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header::new(13, 0xdead_beef_0000_1234, 0x5a5a5a5a);
        let encoded = h.encode(false);
        let decoded = Header::decode(&encoded, false).unwrap();
        assert_eq!(decoded.hash_bits, 13);
        assert_eq!(decoded.hash_test, h.hash_test);
        assert_eq!(decoded.hash_seed, h.hash_seed);
    }

    #[test]
    fn header_roundtrip_converted() {
        let h = Header::new(13, 42, 7);
        let encoded = h.encode(true);
        let decoded = Header::decode(&encoded, true).unwrap();
        assert_eq!(decoded.hash_test, 42);
    }

    #[test]
    fn used_record_roundtrip_small() {
        let r = UsedRecord::new(USED_MAGIC, 3, 5, 0);
        let encoded = r.encode();
        let back = UsedRecord::decode(&encoded).unwrap();
        assert_eq!(back.key_len, 3);
        assert_eq!(back.data_len, 5);
        assert_eq!(back.magic, USED_MAGIC);
    }

    #[test]
    fn used_record_roundtrip_large() {
        let r = UsedRecord::new(USED_MAGIC, 0, 1_000_000, 128);
        let encoded = r.encode();
        let back = UsedRecord::decode(&encoded).unwrap();
        assert_eq!(back.key_len, 0);
        assert_eq!(back.data_len, 1_000_000);
        assert_eq!(back.extra_padding, 128);
    }

    #[test]
    fn used_record_empty_key_and_value() {
        let r = UsedRecord::new(USED_MAGIC, 0, 0, 0);
        let encoded = r.encode();
        let back = UsedRecord::decode(&encoded).unwrap();
        assert_eq!(back.key_len, 0);
        assert_eq!(back.data_len, 0);
    }

    #[test]
    fn free_record_roundtrip() {
        let f = FreeRecord {
            prev: 12345,
            ftable: 7,
            len: 4096,
            next: 99999,
        };
        let encoded = f.encode();
        let back = FreeRecord::decode(&encoded).unwrap();
        assert_eq!(back.prev, 12345);
        assert_eq!(back.ftable, 7);
        assert_eq!(back.len, 4096);
        assert_eq!(back.next, 99999);
    }

    #[test]
    fn slot_encoding() {
        let slot = encode_direct_slot(0x1000, 0xAB);
        assert!(!slot_is_chain(slot));
        assert_eq!(slot_offset(slot), 0x1000);
        assert_eq!(slot_extra_bits(slot), 0xAB);

        let chain = encode_chain_slot(0x2000);
        assert!(slot_is_chain(chain));
        assert_eq!(slot_offset(chain), 0x2000);
    }
}
