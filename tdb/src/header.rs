/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
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
//! Every multi-byte field here is encoded native-endian when the database was created without
//! [`crate::attrs::OpenFlags::CONVERT`], or big-endian when it was. [`Endian`] carries that choice
//! through every encode/decode call site, the same way the source threads a "convert" flag through
//! every record read/write.
//!
//! A record's 16-bit magic (and, for free records, an 8-bit tag duplicated for redundancy) always
//! sits in a fixed, predictable position so that a forward scan of the file (used by the free-space
//! coalescer, and by `check`) can identify a record's kind without first knowing its length.

pub type Offset = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Native,
    Swapped,
}

impl Endian {
    pub fn of(convert: bool) -> Self {
        if convert {
            Self::Swapped
        } else {
            Self::Native
        }
    }
    pub fn enc_u64(self, v: u64) -> [u8; 8] {
        match self {
            Self::Native => v.to_ne_bytes(),
            Self::Swapped => v.to_be_bytes(),
        }
    }
    pub fn dec_u64(self, b: [u8; 8]) -> u64 {
        match self {
            Self::Native => u64::from_ne_bytes(b),
            Self::Swapped => u64::from_be_bytes(b),
        }
    }
}

/// 16-bit record-kind tags. Chosen from a range no valid free-table bucket index (0-55) or free
/// sentinel (0xFF) can collide with when the low byte is read in isolation, which is what lets the
/// coalescer in [`crate::alloc`] tell a free record from a used-record-family record while scanning
/// forward byte-for-byte.
pub mod magic {
    pub const USED: u16 = 0xA501;
    pub const HTABLE: u16 = 0xA502;
    pub const CHAIN: u16 = 0xA503;
    pub const FTABLE: u16 = 0xA504;
    pub const FREE: u8 = 0xF5;
    pub const RECOVERY_INVALID: u16 = 0xDEAD;
    pub const RECOVERY_VALID: u16 = 0xF00D;
}

/// 64-byte identifying string stamped at file offset 0
pub const FILE_MAGIC: [u8; 64] = {
    let mut buf = [0u8; 64];
    let id = b"TDB2:trivial-database:expanding-trie-hash-mmap-store\0";
    let mut i = 0;
    while i < id.len() {
        buf[i] = id[i];
        i += 1;
    }
    buf
};

pub const FORMAT_VERSION: u64 = 1;
pub const HASH_TEST_CONST: &[u8] = b"tdb2-hash-self-test";
pub const TOP_HASHTABLE_LEN: usize = 1024;
pub const RESERVED_SLOTS: usize = 26;

/// Fixed file header at offset 0
pub struct FileHeader {
    pub version: u64,
    pub hash_test: u64,
    pub hash_seed: u64,
    pub free_table: Offset,
    pub recovery: Offset,
    pub hashtable: Vec<Offset>,
}

impl FileHeader {
    pub const MAGIC_LEN: usize = 64;
    pub const SCALAR_FIELDS: usize = 5; // version, hash_test, hash_seed, free_table, recovery
    pub const SIZE: usize = Self::MAGIC_LEN
        + (Self::SCALAR_FIELDS + RESERVED_SLOTS) * 8
        + TOP_HASHTABLE_LEN * 8;

    /// Absolute file offset of top-level hashtable slot `index` (0..[`TOP_HASHTABLE_LEN`]). The
    /// hash index reads/writes slots directly at this offset rather than through the in-memory
    /// [`FileHeader::hashtable`] vector, which exists only so a freshly decoded header is complete.
    pub fn hashtable_slot_offset(index: usize) -> Offset {
        (Self::MAGIC_LEN + (Self::SCALAR_FIELDS + RESERVED_SLOTS) * 8 + index * 8) as Offset
    }

    pub fn new(hash_seed: u64, hash_test: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            hash_test,
            hash_seed,
            free_table: 0,
            recovery: 0,
            hashtable: vec![0; TOP_HASHTABLE_LEN],
        }
    }

    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&endian.enc_u64(self.version));
        buf.extend_from_slice(&endian.enc_u64(self.hash_test));
        buf.extend_from_slice(&endian.enc_u64(self.hash_seed));
        buf.extend_from_slice(&endian.enc_u64(self.free_table));
        buf.extend_from_slice(&endian.enc_u64(self.recovery));
        for _ in 0..RESERVED_SLOTS {
            buf.extend_from_slice(&[0u8; 8]);
        }
        for off in &self.hashtable {
            buf.extend_from_slice(&endian.enc_u64(*off));
        }
        debug_assert_eq!(buf.len(), Self::SIZE);
        buf
    }

    pub fn decode(buf: &[u8], endian: Endian) -> crate::error::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(crate::error::Error::corrupt("file shorter than header"));
        }
        if &buf[..Self::MAGIC_LEN] != &FILE_MAGIC[..] {
            return Err(crate::error::Error::corrupt("bad file magic"));
        }
        let mut p = Self::MAGIC_LEN;
        let rd = |p: &mut usize| -> u64 {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[*p..*p + 8]);
            *p += 8;
            endian.dec_u64(b)
        };
        let version = rd(&mut p);
        let hash_test = rd(&mut p);
        let hash_seed = rd(&mut p);
        let free_table = rd(&mut p);
        let recovery = rd(&mut p);
        p += RESERVED_SLOTS * 8;
        let mut hashtable = Vec::with_capacity(TOP_HASHTABLE_LEN);
        for _ in 0..TOP_HASHTABLE_LEN {
            hashtable.push(rd(&mut p));
        }
        Ok(Self {
            version,
            hash_test,
            hash_seed,
            free_table,
            recovery,
            hashtable,
        })
    }
}

/// A hash-group/subhash/chain slot. Packed as:
/// `[1 subhash-bit | 7 extra-hash bits | 48 offset bits | 3 home-bucket bits | 5 reserved]`
/// from MSB to LSB, i.e. home bucket in the lowest bits, offset in the middle, extra hash and the
/// subhash marker stealing the high end, matching the layout description in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSlot(pub u64);

impl HashSlot {
    const HOME_SHIFT: u32 = 0;
    const HOME_MASK: u64 = 0x7;
    const OFFSET_SHIFT: u32 = 3;
    const OFFSET_MASK: u64 = (1u64 << 48) - 1;
    const EXTRA_SHIFT: u32 = 51;
    const EXTRA_MASK: u64 = 0x7F;
    const SUBHASH_BIT: u64 = 1 << 58;

    pub const EMPTY: HashSlot = HashSlot(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_subhash(self) -> bool {
        self.0 & Self::SUBHASH_BIT != 0
    }

    pub fn offset(self) -> Offset {
        (self.0 >> Self::OFFSET_SHIFT) & Self::OFFSET_MASK
    }

    pub fn home_bucket(self) -> u8 {
        ((self.0 >> Self::HOME_SHIFT) & Self::HOME_MASK) as u8
    }

    pub fn extra_hash(self) -> u8 {
        ((self.0 >> Self::EXTRA_SHIFT) & Self::EXTRA_MASK) as u8
    }

    pub fn encode_record(offset: Offset, home_bucket: u8, extra_hash: u8) -> Self {
        debug_assert!(offset <= Self::OFFSET_MASK, "offset overflows 48 bits");
        debug_assert!(home_bucket < 8);
        debug_assert!(extra_hash < 128);
        HashSlot(
            ((offset & Self::OFFSET_MASK) << Self::OFFSET_SHIFT)
                | ((home_bucket as u64) << Self::HOME_SHIFT)
                | ((extra_hash as u64 & Self::EXTRA_MASK) << Self::EXTRA_SHIFT),
        )
    }

    pub fn encode_subhash(offset: Offset, home_bucket: u8) -> Self {
        HashSlot(Self::encode_record(offset, home_bucket, 0).0 | Self::SUBHASH_BIT)
    }
}

/// Header common to every used-record-family record (`USED`, `HTABLE`, `CHAIN`, `FTABLE`). For
/// `HTABLE`/`CHAIN`/`FTABLE` the "key" is empty (`key_len == 0`) and the payload is the slot/bucket
/// array instead of a user key+value.
pub struct UsedRecordHeader {
    pub magic: u16,
    /// number of bits used to represent `key_len`/`data_len`'s split point; `key_len` occupies the
    /// low `2*k` bits of the second word
    pub k: u8,
    pub extra_padding: u32,
    pub hash11: u16,
    pub key_len: u64,
    pub data_len: u64,
}

impl UsedRecordHeader {
    pub const SIZE: usize = 16;
    pub const DEFAULT_K: u8 = 24; // 2k = 48 bits for key_len, 16 bits for data_len by default

    pub fn total_len(&self) -> u64 {
        self.key_len + self.data_len + self.extra_padding as u64
    }

    pub fn new(magic: u16, key_len: u64, data_len: u64, hash11: u16) -> Self {
        let k = Self::DEFAULT_K;
        Self {
            magic,
            k,
            extra_padding: 0,
            hash11,
            key_len,
            data_len,
        }
    }

    pub fn encode(&self, endian: Endian) -> [u8; Self::SIZE] {
        let w1: u64 = (self.magic as u64)
            | ((self.k as u64) << 16)
            | ((self.extra_padding as u64) << 21)
            | ((self.hash11 as u64 & 0x7FF) << 53);
        let two_k = 2 * self.k as u32;
        debug_assert!(two_k < 64, "k too large, key_len field would overflow");
        let w2: u64 = (self.key_len & ((1u64 << two_k) - 1)) | (self.data_len << two_k);
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&endian.enc_u64(w1));
        out[8..].copy_from_slice(&endian.enc_u64(w2));
        out
    }

    pub fn decode(buf: [u8; Self::SIZE], endian: Endian) -> Self {
        let mut b1 = [0u8; 8];
        b1.copy_from_slice(&buf[..8]);
        let w1 = endian.dec_u64(b1);
        let mut b2 = [0u8; 8];
        b2.copy_from_slice(&buf[8..]);
        let w2 = endian.dec_u64(b2);
        let magic = (w1 & 0xFFFF) as u16;
        let k = ((w1 >> 16) & 0x1F) as u8;
        let extra_padding = ((w1 >> 21) & 0xFFFF_FFFF) as u32;
        let hash11 = ((w1 >> 53) & 0x7FF) as u16;
        let two_k = 2 * k as u32;
        let key_len = if two_k >= 64 { w2 } else { w2 & ((1u64 << two_k) - 1) };
        let data_len = if two_k >= 64 { 0 } else { w2 >> two_k };
        Self {
            magic,
            k,
            extra_padding,
            hash11,
            key_len,
            data_len,
        }
    }
}

/// Free record header, always exactly 24 bytes (3 packed 64-bit words)
pub struct FreeRecordHeader {
    pub ftable_idx: u8,
    pub prev: Offset,
    pub len: u64,
    pub next: Offset,
}

impl FreeRecordHeader {
    pub const SIZE: usize = 24;
    /// Reserved value for `ftable_idx`. Some coalescing schemes use this to mark a freed record as
    /// "not yet linked into any bucket" while a merge is still pending; `alloc::Allocator::free`
    /// resolves left- and right-adjacency fully before linking a record into its bucket, so no
    /// record here is ever left in that transient state and this value is never written.
    #[allow(dead_code)]
    pub const NONE: u8 = 0xFF;
    const TAGFIELD_SHIFT: u32 = 56;
    const IDXFIELD_SHIFT: u32 = 48;
    const LOWFIELD_MASK: u64 = (1u64 << 48) - 1;

    pub fn encode(&self, endian: Endian) -> [u8; Self::SIZE] {
        let w1 = ((magic::FREE as u64) << Self::TAGFIELD_SHIFT)
            | ((self.ftable_idx as u64) << Self::IDXFIELD_SHIFT)
            | (self.prev & Self::LOWFIELD_MASK);
        let w2 = ((magic::FREE as u64) << Self::TAGFIELD_SHIFT)
            | ((self.ftable_idx as u64) << Self::IDXFIELD_SHIFT)
            | (self.len & Self::LOWFIELD_MASK);
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&endian.enc_u64(w1));
        out[8..16].copy_from_slice(&endian.enc_u64(w2));
        out[16..24].copy_from_slice(&endian.enc_u64(self.next));
        out
    }

    pub fn decode(buf: [u8; Self::SIZE], endian: Endian) -> crate::error::Result<Self> {
        let word = |s: &[u8]| -> u64 {
            let mut b = [0u8; 8];
            b.copy_from_slice(s);
            endian.dec_u64(b)
        };
        let w1 = word(&buf[0..8]);
        let w2 = word(&buf[8..16]);
        let next = word(&buf[16..24]);
        let tag1 = (w1 >> Self::TAGFIELD_SHIFT) as u8;
        let tag2 = (w2 >> Self::TAGFIELD_SHIFT) as u8;
        if tag1 != magic::FREE || tag2 != magic::FREE {
            return Err(crate::error::Error::corrupt("free record tag mismatch"));
        }
        let idx1 = ((w1 >> Self::IDXFIELD_SHIFT) & 0xFF) as u8;
        let idx2 = ((w2 >> Self::IDXFIELD_SHIFT) & 0xFF) as u8;
        if idx1 != idx2 {
            return Err(crate::error::Error::corrupt(
                "free record bucket index mismatch between words",
            ));
        }
        Ok(Self {
            ftable_idx: idx1,
            prev: w1 & Self::LOWFIELD_MASK,
            len: w2 & Self::LOWFIELD_MASK,
            next,
        })
    }

    /// Peek just enough of a record at `buf` (must contain at least 8 bytes) to tell whether it's
    /// a free record, without decoding the rest. Used by the coalescer's forward scan.
    pub fn looks_like_free(first_word: u64) -> bool {
        ((first_word >> Self::TAGFIELD_SHIFT) as u8) == magic::FREE
    }
}

/// `FTABLE` payload: a `next` pointer (chained free table) plus 56 bucket heads
pub const FREE_BUCKETS: usize = 56;

pub struct FreeTable {
    pub next: Offset,
    pub buckets: [Offset; FREE_BUCKETS],
}

impl FreeTable {
    pub const SIZE: usize = 8 + FREE_BUCKETS * 8;

    pub fn empty() -> Self {
        Self {
            next: 0,
            buckets: [0; FREE_BUCKETS],
        }
    }

    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&endian.enc_u64(self.next));
        for b in &self.buckets {
            buf.extend_from_slice(&endian.enc_u64(*b));
        }
        buf
    }

    pub fn decode(buf: &[u8], endian: Endian) -> crate::error::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(crate::error::Error::corrupt("truncated free table"));
        }
        let word = |p: usize| -> u64 {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[p..p + 8]);
            endian.dec_u64(b)
        };
        let next = word(0);
        let mut buckets = [0u64; FREE_BUCKETS];
        for (i, b) in buckets.iter_mut().enumerate() {
            *b = word(8 + i * 8);
        }
        Ok(Self { next, buckets })
    }
}

/// `HTABLE`/`CHAIN` payload is an array of [`HashSlot`]s (64 for a subhash, 8 for a chain block),
/// optionally followed by a `next` offset for chain blocks.
pub const SUBHASH_SLOTS: usize = 64;
pub const GROUP_SLOTS: usize = 8;
pub const CHAIN_SLOTS: usize = 8;

pub fn encode_slots(slots: &[HashSlot], endian: Endian) -> Vec<u8> {
    let mut buf = Vec::with_capacity(slots.len() * 8);
    for s in slots {
        buf.extend_from_slice(&endian.enc_u64(s.0));
    }
    buf
}

pub fn decode_slots(buf: &[u8], count: usize, endian: Endian) -> Vec<HashSlot> {
    (0..count)
        .map(|i| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            HashSlot(endian.dec_u64(b))
        })
        .collect()
}

/// Recovery-area record header (not a used-record wrapper: the recovery area is its own region,
/// embedded rather than a sidecar file)
pub struct RecoveryHeader {
    pub magic: u16,
    pub max_len: u64,
    pub len: u64,
    pub eof: u64,
}

impl RecoveryHeader {
    pub const SIZE: usize = 8 + 8 + 8 + 8;

    pub fn encode(&self, endian: Endian) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&endian.enc_u64(self.magic as u64));
        out[8..16].copy_from_slice(&endian.enc_u64(self.max_len));
        out[16..24].copy_from_slice(&endian.enc_u64(self.len));
        out[24..32].copy_from_slice(&endian.enc_u64(self.eof));
        out
    }

    pub fn decode(buf: [u8; Self::SIZE], endian: Endian) -> Self {
        let word = |p: usize| -> u64 {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[p..p + 8]);
            endian.dec_u64(b)
        };
        Self {
            magic: word(0) as u16,
            max_len: word(8),
            len: word(16),
            eof: word(24),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_slot_roundtrip() {
        let s = HashSlot::encode_record(0xDEAD_BEEF, 5, 0x2A);
        assert!(!s.is_empty());
        assert!(!s.is_subhash());
        assert_eq!(s.offset(), 0xDEAD_BEEF);
        assert_eq!(s.home_bucket(), 5);
        assert_eq!(s.extra_hash(), 0x2A);
    }

    #[test]
    fn hash_slot_subhash_roundtrip() {
        let s = HashSlot::encode_subhash(4096, 3);
        assert!(s.is_subhash());
        assert_eq!(s.offset(), 4096);
        assert_eq!(s.home_bucket(), 3);
    }

    #[test]
    fn used_record_header_roundtrip() {
        let h = UsedRecordHeader::new(magic::USED, 12, 34, 0x5AA);
        let enc = h.encode(Endian::Native);
        let dec = UsedRecordHeader::decode(enc, Endian::Native);
        assert_eq!(dec.magic, magic::USED);
        assert_eq!(dec.key_len, 12);
        assert_eq!(dec.data_len, 34);
        assert_eq!(dec.hash11, 0x5AA);
    }

    #[test]
    fn free_record_header_roundtrip() {
        let h = FreeRecordHeader {
            ftable_idx: 7,
            prev: 128,
            len: 4096,
            next: 9000,
        };
        let enc = h.encode(Endian::Native);
        let dec = FreeRecordHeader::decode(enc, Endian::Native).unwrap();
        assert_eq!(dec.ftable_idx, 7);
        assert_eq!(dec.prev, 128);
        assert_eq!(dec.len, 4096);
        assert_eq!(dec.next, 9000);
    }

    #[test]
    fn file_header_roundtrip() {
        let mut h = FileHeader::new(0x1234_5678_9abc_def0, 0xaaaa_bbbb);
        h.hashtable[3] = 555;
        let enc = h.encode(Endian::Native);
        let dec = FileHeader::decode(&enc, Endian::Native).unwrap();
        assert_eq!(dec.hash_seed, h.hash_seed);
        assert_eq!(dec.hashtable[3], 555);
    }
}
