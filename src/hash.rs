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

//! Default hash function and hash-table addressing helpers.
//!
//! The default hash is Bob Jenkins' "lookup3" `hashlittle`, ported verbatim
//! from the algorithm used by the original store (seeded so two processes
//! that agree on a seed always agree on bucket placement). Callers may
//! supply their own hash function instead; this module only provides the
//! built-in one plus the bit-twiddling used to place a hash in the table.

pub const HASH_MAGIC_SEED_CHECK: u64 = 0xA1AB_E11A_0109_2008;

fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

/// `hashlittle` from lookup3.c, specialized to the common case (no need for
/// the `hashlittle2` two-output variant since we never needed the high
/// 32 bits).
pub fn jenkins_hash_stable(data: &[u8], seed: u32) -> u64 {
    let mut length = data.len();
    let mut a: u32 = 0xdeadbeefu32
        .wrapping_add(length as u32)
        .wrapping_add(seed);
    let mut b = a;
    let mut c = a;

    let mut chunks = data.chunks_exact(12);
    let mut off = 0usize;

    loop {
        if length > 12 {
            let chunk = match chunks.next() {
                Some(c) => c,
                None => break,
            };
            a = a.wrapping_add(u32::from_le_bytes(chunk[0..4].try_into().unwrap()));
            b = b.wrapping_add(u32::from_le_bytes(chunk[4..8].try_into().unwrap()));
            c = c.wrapping_add(u32::from_le_bytes(chunk[8..12].try_into().unwrap()));

            a = a.wrapping_sub(c);
            a ^= rot(c, 4);
            c = c.wrapping_add(b);
            b = b.wrapping_sub(a);
            b ^= rot(a, 6);
            a = a.wrapping_add(c);
            c = c.wrapping_sub(b);
            c ^= rot(b, 8);
            b = b.wrapping_add(a);
            a = a.wrapping_sub(c);
            a ^= rot(c, 16);
            c = c.wrapping_add(b);
            b = b.wrapping_sub(a);
            b ^= rot(a, 19);
            a = a.wrapping_add(c);
            c = c.wrapping_sub(b);
            c ^= rot(b, 4);
            b = b.wrapping_add(a);

            length -= 12;
            off += 12;
        } else {
            break;
        }
    }

    let tail = &data[off..off + length];
    let mut buf = [0u8; 12];
    buf[..length].copy_from_slice(tail);

    if length > 0 {
        a = a.wrapping_add(u32::from_le_bytes(buf[0..4].try_into().unwrap()));
        b = b.wrapping_add(u32::from_le_bytes(buf[4..8].try_into().unwrap()));
        c = c.wrapping_add(u32::from_le_bytes(buf[8..12].try_into().unwrap()));

        c ^= b;
        c = c.wrapping_sub(rot(b, 14));
        a ^= c;
        a = a.wrapping_sub(rot(c, 11));
        b ^= a;
        b = b.wrapping_sub(rot(a, 25));
        c ^= b;
        c = c.wrapping_sub(rot(b, 16));
        a ^= c;
        a = a.wrapping_sub(rot(c, 4));
        b ^= a;
        b = b.wrapping_sub(rot(a, 14));
        c ^= b;
        c = c.wrapping_sub(rot(b, 24));
    }

    ((c as u64) << 32) | b as u64
}

/// Top-level hash table entry count for `hash_bits` bits of addressing.
pub fn hash_table_size(hash_bits: u32) -> u64 {
    1u64 << hash_bits
}

/// Which top-level bucket a full 64-bit hash lands in.
pub fn top_bucket(hash: u64, hash_bits: u32) -> u64 {
    hash & (hash_table_size(hash_bits) - 1)
}

/// Extra hash bits stashed in the unused high bits of a hash-table/chain
/// slot, letting a collision be partially disambiguated without a disk
/// read. `used_bits` is the number of low bits already consumed by
/// `top_bucket` plus any chain-depth expansion.
pub fn extra_bits(hash: u64, used_bits: u32, extra_bit_count: u32) -> u8 {
    if extra_bit_count == 0 {
        return 0;
    }
    ((hash >> used_bits) & ((1u64 << extra_bit_count) - 1)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_seed() {
        let h1 = jenkins_hash_stable(b"hello world", 42);
        let h2 = jenkins_hash_stable(b"hello world", 42);
        assert_eq!(h1, h2);
    }

    #[test]
    fn differs_by_seed() {
        let h1 = jenkins_hash_stable(b"hello world", 1);
        let h2 = jenkins_hash_stable(b"hello world", 2);
        assert_ne!(h1, h2);
    }

    #[test]
    fn empty_input() {
        let h = jenkins_hash_stable(b"", 0);
        let h2 = jenkins_hash_stable(b"", 0);
        assert_eq!(h, h2);
    }

    #[test]
    fn long_input_crosses_chunk_boundary() {
        let data = vec![0xAB; 137];
        let h1 = jenkins_hash_stable(&data, 7);
        let h2 = jenkins_hash_stable(&data, 7);
        assert_eq!(h1, h2);
    }

    #[test]
    fn bucket_within_range() {
        let h = jenkins_hash_stable(b"key", 0);
        let b = top_bucket(h, 13);
        assert!(b < hash_table_size(13));
    }
}
