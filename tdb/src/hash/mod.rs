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

//! # Expanding trie hash index
//!
//! The top-level [`FileHeader::hashtable`](crate::header::FileHeader::hashtable) is a 1024-entry
//! array of [`HashSlot`]s. A slot is empty, points straight at a `USED` record, or is marked as a
//! subhash and points at an `HTABLE` record holding another 64 slots. The trie descends one level
//! per 6 bits of hash consumed until the 64-bit hash is exhausted, at which point further
//! collisions degrade to a `CHAIN` of linked 8-slot overflow groups that are full-key-compared.
//!
//! Every public entry point here takes the hash-range lock for the top 10 bits first and holds it
//! for the whole descent, so a concurrent writer touching a different top-level group never blocks
//! this one (see [`crate::lock`]).

use crate::attrs::HashFn;
use crate::error::{Error, Result};
use crate::header::{
    magic, FileHeader, HashSlot, Offset, UsedRecordHeader, CHAIN_SLOTS, GROUP_SLOTS, SUBHASH_SLOTS,
};
use crate::io::IoBackend;
use crate::lock::{LockGuard, LockKind, LockTarget, Locker};
use std::sync::Arc;

/// 64-bit Jenkins one-at-a-time mix (the lookup3-style variant this corpus's hashing code favors),
/// seeded from the header's `hash_seed`. The two halves are swapped after mixing so the bits that
/// discriminate first (the ones the trie consumes at the top) are the ones the avalanche step
/// randomized most thoroughly.
pub fn jenkins_hash64(seed: u64, key: &[u8]) -> u64 {
    let mut hash = seed;
    for &b in key {
        hash = hash.wrapping_add(b as u64);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    // swap halves: the low 32 bits (mixed last, so least distinguishing) move to the top, where
    // the trie would otherwise consume the most-significant, least-mixed bits first
    (hash << 32) | (hash >> 32)
}

/// Number of trie levels the 64-bit hash supports before degrading to a chain: 10 bits at the top,
/// then 6 bits per subhash level: (64 - 10) / 6 = 9 full levels.
pub(crate) const MAX_SUBHASH_DEPTH: u32 = 9;
const TOP_BITS: u32 = 10;
const LEVEL_BITS: u32 = 6;
const GROUP_BITS: u32 = 3;

pub(crate) fn top_index(hash: u64) -> u32 {
    (hash >> (64 - TOP_BITS)) as u32
}

/// 3 bits selecting the home bucket within whichever group `depth` lands on.
fn home_bucket_at(hash: u64, depth: u32) -> u8 {
    let consumed = TOP_BITS + depth * LEVEL_BITS;
    let shift = 64 - consumed - GROUP_BITS;
    ((hash >> shift) & 0x7) as u8
}

/// 3 bits selecting which of the 8 groups within a 64-slot subhash this descent lands in.
fn sub_group_at(hash: u64, depth: u32) -> u32 {
    let consumed = TOP_BITS + depth * LEVEL_BITS;
    let shift = 64 - consumed - GROUP_BITS - GROUP_BITS;
    ((hash >> shift) & 0x7) as u32
}

/// The 11-bit truncated hash stamped into a used-record's header (see
/// [`crate::header::UsedRecordHeader::hash11`]); exposed to [`crate::lib`]'s store/append path,
/// which has to fill this field in before a record's slot even exists to derive it from.
pub(crate) fn truncated11(hash: u64) -> u16 {
    (hash & 0x7FF) as u16
}

fn extra7(hash: u64) -> u8 {
    ((hash >> 11) & 0x7F) as u8
}

fn rehash(seed: u64, hash_fn: Option<HashFn>, key: &[u8]) -> u64 {
    hash_fn.map(|f| f(seed, key)).unwrap_or_else(|| jenkins_hash64(seed, key))
}

/// Where a lookup landed: either an existing match, or the empty slot a subsequent insert should
/// use. Always carries enough state (`group_off`, `home`, `bucket`) to write the slot back without
/// re-descending the trie.
pub struct Located {
    pub hash: u64,
    pub depth: u32,
    /// offset of the 8-slot group (within the top table, a subhash, or a chain block)
    pub group_off: Offset,
    pub home: u8,
    /// index of the matching/insertion slot within the group/chain
    pub bucket: Option<u8>,
    pub found: Option<Offset>,
    /// true once the bit budget is exhausted and we're scanning a `CHAIN` instead of a subhash
    pub in_chain: bool,
}

pub struct HashIndex;

impl HashIndex {
    /// Acquire the top-level hash-range lock for `key`'s hash and descend the trie, returning a
    /// [`Located`] plus the lock guard that must be held for as long as the caller needs the result
    /// to remain valid.
    pub fn find_and_lock<IO: IoBackend>(
        io: &mut IO,
        header: &FileHeader,
        locker: &Arc<Locker>,
        hash_seed: u64,
        hash_fn: Option<HashFn>,
        key: &[u8],
    ) -> Result<(Located, LockGuard)> {
        let hash = rehash(hash_seed, hash_fn, key);
        let top = top_index(hash);
        let guard = locker.lock(LockTarget::HashGroup(top), LockKind::Read, true)?;
        let located = Self::descend(io, header, hash, key)?;
        Ok((located, guard))
    }

    fn descend<IO: IoBackend>(io: &mut IO, header: &FileHeader, hash: u64, key: &[u8]) -> Result<Located> {
        let _ = header;
        let top = top_index(hash) as usize;
        let mut table_off: Option<Offset> = None; // None == top-level array
        let mut depth = 0u32;
        loop {
            // past the bit budget, the parent slot points straight at a CHAIN block (not a further
            // subhash), so it must be read as-is, before either bit-consuming helper below is
            // called — both underflow their shift amount once `depth == MAX_SUBHASH_DEPTH`.
            if depth >= MAX_SUBHASH_DEPTH {
                let chain_off =
                    table_off.expect("chain depth is only reached after descending into a subhash slot");
                return Self::scan_chain(io, chain_off, hash, key, depth);
            }
            let home = home_bucket_at(hash, depth);
            let group_off = match table_off {
                None => FileHeader::hashtable_slot_offset(top - (top % GROUP_SLOTS)),
                Some(sub) => {
                    let group_idx = sub_group_at(hash, depth) as u64;
                    sub + group_idx * GROUP_SLOTS as u64 * 8
                }
            };
            let slots = Self::read_group(io, group_off, GROUP_SLOTS)?;
            if slots[home as usize].is_subhash() {
                table_off = Some(slots[home as usize].offset());
                depth += 1;
                continue;
            }
            return match Self::probe_group(io, &slots, home, hash, key)? {
                Some((found, bucket)) => Ok(Located {
                    hash,
                    depth,
                    group_off,
                    home,
                    bucket: Some(bucket),
                    found,
                    in_chain: false,
                }),
                None => Ok(Located {
                    hash,
                    depth,
                    group_off,
                    home,
                    bucket: None,
                    found: None,
                    in_chain: false,
                }),
            };
        }
    }

    /// Like [`Self::descend`] but for locating *where a new entry belongs* rather than searching
    /// for an existing key: it never needs to compare key bytes, only whether a bucket is empty,
    /// which matters right after an expansion, where the record being inserted hasn't been written
    /// yet and so has nothing to compare against.
    fn descend_for_insert<IO: IoBackend>(io: &mut IO, hash: u64) -> Result<Located> {
        let top = top_index(hash) as usize;
        let mut table_off: Option<Offset> = None;
        let mut depth = 0u32;
        loop {
            if depth >= MAX_SUBHASH_DEPTH {
                let chain_off =
                    table_off.expect("chain depth is only reached after descending into a subhash slot");
                let slots = Self::read_group(io, chain_off, CHAIN_SLOTS)?;
                let bucket = slots.iter().position(|s| s.is_empty()).map(|i| i as u8);
                return Ok(Located {
                    hash,
                    depth,
                    group_off: chain_off,
                    home: 0,
                    bucket,
                    found: None,
                    in_chain: true,
                });
            }
            let home = home_bucket_at(hash, depth);
            let group_off = match table_off {
                None => FileHeader::hashtable_slot_offset(top - (top % GROUP_SLOTS)),
                Some(sub) => {
                    let group_idx = sub_group_at(hash, depth) as u64;
                    sub + group_idx * GROUP_SLOTS as u64 * 8
                }
            };
            let slots = Self::read_group(io, group_off, GROUP_SLOTS)?;
            if slots[home as usize].is_subhash() {
                table_off = Some(slots[home as usize].offset());
                depth += 1;
                continue;
            }
            let bucket = (home as usize..home as usize + GROUP_SLOTS)
                .map(|i| i % GROUP_SLOTS)
                .find(|&i| slots[i].is_empty())
                .map(|i| i as u8);
            return Ok(Located {
                hash,
                depth,
                group_off,
                home,
                bucket,
                found: None,
                in_chain: false,
            });
        }
    }

    /// Linear-probe a group starting at `home`, wrapping around its 8 slots. Returns
    /// `Some((Some(offset), bucket))` on a match, `Some((None, bucket))` at the first empty slot
    /// found (an insertion point), or `None` if the group is entirely full of non-matching entries
    /// (the caller must expand).
    fn probe_group<IO: IoBackend>(
        io: &mut IO,
        slots: &[HashSlot],
        home: u8,
        hash: u64,
        key: &[u8],
    ) -> Result<Option<(Option<Offset>, u8)>> {
        let want_extra = extra7(hash);
        let want_trunc = truncated11(hash);
        for step in 0..GROUP_SLOTS {
            let idx = (home as usize + step) % GROUP_SLOTS;
            let slot = slots[idx];
            if slot.is_empty() {
                return Ok(Some((None, idx as u8)));
            }
            if slot.is_subhash() {
                continue;
            }
            if slot.home_bucket() == home && slot.extra_hash() == want_extra {
                let rec = Self::read_used_header(io, slot.offset())?;
                if rec.hash11 == want_trunc {
                    let key_buf = io.read(slot.offset() + UsedRecordHeader::SIZE as u64, rec.key_len as usize)?;
                    if key_buf == key {
                        return Ok(Some((Some(slot.offset()), idx as u8)));
                    }
                }
            }
        }
        Ok(None)
    }

    fn scan_chain<IO: IoBackend>(
        io: &mut IO,
        mut chain_off: Offset,
        hash: u64,
        key: &[u8],
        depth: u32,
    ) -> Result<Located> {
        loop {
            let slots = Self::read_group(io, chain_off, CHAIN_SLOTS)?;
            let next = io.read_off(chain_off + CHAIN_SLOTS as u64 * 8)?;
            for (idx, slot) in slots.iter().enumerate() {
                if slot.is_empty() {
                    continue;
                }
                let rec = Self::read_used_header(io, slot.offset())?;
                let key_buf = io.read(slot.offset() + UsedRecordHeader::SIZE as u64, rec.key_len as usize)?;
                if key_buf == key {
                    return Ok(Located {
                        hash,
                        depth,
                        group_off: chain_off,
                        home: idx as u8,
                        bucket: Some(idx as u8),
                        found: Some(slot.offset()),
                        in_chain: true,
                    });
                }
            }
            if let Some(empty_idx) = slots.iter().position(|s| s.is_empty()) {
                return Ok(Located {
                    hash,
                    depth,
                    group_off: chain_off,
                    home: empty_idx as u8,
                    bucket: Some(empty_idx as u8),
                    found: None,
                    in_chain: true,
                });
            }
            if next == 0 {
                return Ok(Located {
                    hash,
                    depth,
                    group_off: chain_off,
                    home: 0,
                    bucket: None,
                    found: None,
                    in_chain: true,
                });
            }
            chain_off = next;
        }
    }

    /// Write `offset` into the slot a prior [`Self::find_and_lock`] located. Expands the trie
    /// (allocating a subhash or chain block) first if the group/chain was full.
    pub fn add_to_hash<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        hash_seed: u64,
        hash_fn: Option<HashFn>,
        located: &Located,
        offset: Offset,
    ) -> Result<()> {
        match located.bucket {
            Some(bucket) => {
                let slot = HashSlot::encode_record(offset, located.home, extra7(located.hash));
                Self::write_slot(io, located.group_off, bucket, slot)
            }
            None if located.in_chain => {
                let new_chain = Self::alloc_chain(io, header, locker)?;
                io.write_off(located.group_off + CHAIN_SLOTS as u64 * 8, new_chain)?;
                let slot = HashSlot::encode_record(offset, 0, extra7(located.hash));
                Self::write_slot(io, new_chain, 0, slot)
            }
            None => Self::expand_and_retry(io, header, locker, hash_seed, hash_fn, located, offset),
        }
    }

    /// The group at `located.group_off`/depth `located.depth` is full. Pick the single home bucket
    /// with the largest population, move every entry sharing that bucket one level deeper
    /// (re-hashing each from its stored key, since a slot carries only 18 derived bits, not the
    /// full 64-bit hash it was inserted under), replace that slot in the parent with a subhash (or
    /// chain, past the bit budget) pointer, then retry the original insert.
    fn expand_and_retry<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        hash_seed: u64,
        hash_fn: Option<HashFn>,
        located: &Located,
        new_offset: Offset,
    ) -> Result<()> {
        let slots = Self::read_group(io, located.group_off, GROUP_SLOTS)?;
        let fullest = Self::fullest_bucket(&slots, located.home);
        let next_depth = located.depth + 1;
        if next_depth >= MAX_SUBHASH_DEPTH {
            let new_chain = Self::alloc_chain(io, header, locker)?;
            let moved = Self::migrate_bucket_to_chain(io, located.group_off, fullest, new_chain)?;
            debug_assert!(moved >= 0, "expand_group moved a negative number of entries");
            let slot = HashSlot::encode_subhash(new_chain, fullest);
            Self::write_slot(io, located.group_off, fullest, slot)?;
        } else {
            let new_sub = Self::alloc_subhash(io, header, locker)?;
            let moved = Self::migrate_bucket_to_subhash(
                io,
                located.group_off,
                fullest,
                new_sub,
                next_depth,
                hash_seed,
                hash_fn,
            )?;
            // the source carries a deliberately-commented-out `assert(num_vals)` here ("but we do
            // this during unit test"); kept as a debug_assert rather than a hard assert — see
            // DESIGN.md's Open Question decisions
            debug_assert!(moved >= 0, "expand_group moved a negative number of entries");
            let slot = HashSlot::encode_subhash(new_sub, fullest);
            Self::write_slot(io, located.group_off, fullest, slot)?;
        }
        // re-descend from scratch: the trie shape just changed under us, and the cheapest correct
        // thing to do is let descend_for_insert() walk it again rather than hand-patch `located`.
        // A key comparison would be wrong here: we're not looking for `new_offset`'s key (it
        // hasn't been written yet), only for where it belongs.
        let relocated = Self::descend_for_insert(io, located.hash)?;
        if relocated.bucket.is_none() {
            return Self::expand_and_retry(io, header, locker, hash_seed, hash_fn, &relocated, new_offset);
        }
        Self::add_to_hash(io, header, locker, hash_seed, hash_fn, &relocated, new_offset)
    }

    /// Number of non-empty, non-subhash slots in `slots` whose home bucket is each candidate;
    /// returns whichever has the largest population, ties favoring `prefer` (the inserter's own
    /// home), matching the data model's tie-break rule.
    fn fullest_bucket(slots: &[HashSlot], prefer: u8) -> u8 {
        let mut counts = [0u32; GROUP_SLOTS];
        for s in slots {
            if !s.is_empty() && !s.is_subhash() {
                counts[s.home_bucket() as usize] += 1;
            }
        }
        let mut best = prefer;
        let mut best_count = counts[prefer as usize];
        for (bucket, &count) in counts.iter().enumerate() {
            if count > best_count {
                best = bucket as u8;
                best_count = count;
            }
        }
        best
    }

    /// Move every slot in `group_off` whose home bucket is `bucket` into `new_sub`, re-hashing each
    /// from its stored key at `depth` levels deep, and clear them from the source group.
    fn migrate_bucket_to_subhash<IO: IoBackend>(
        io: &mut IO,
        group_off: Offset,
        bucket: u8,
        new_sub: Offset,
        depth: u32,
        hash_seed: u64,
        hash_fn: Option<HashFn>,
    ) -> Result<i64> {
        let slots = Self::read_group(io, group_off, GROUP_SLOTS)?;
        let mut moved = 0i64;
        for (idx, slot) in slots.iter().enumerate() {
            if slot.is_empty() || slot.is_subhash() || slot.home_bucket() != bucket {
                continue;
            }
            let rec = Self::read_used_header(io, slot.offset())?;
            let key_buf = io.read(slot.offset() + UsedRecordHeader::SIZE as u64, rec.key_len as usize)?;
            let hash = rehash(hash_seed, hash_fn, &key_buf);
            let new_home = home_bucket_at(hash, depth);
            let new_group_idx = sub_group_at(hash, depth) as u64;
            let new_group_off = new_sub + new_group_idx * GROUP_SLOTS as u64 * 8;
            let dest_slots = Self::read_group(io, new_group_off, GROUP_SLOTS)?;
            let free_idx = (new_home as usize..new_home as usize + GROUP_SLOTS)
                .map(|i| i % GROUP_SLOTS)
                .find(|&i| dest_slots[i].is_empty())
                .ok_or_else(|| Error::corrupt("freshly allocated subhash group is already full"))?;
            let reinserted = HashSlot::encode_record(slot.offset(), new_home, extra7(hash));
            Self::write_slot(io, new_group_off, free_idx as u8, reinserted)?;
            Self::write_slot(io, group_off, idx as u8, HashSlot::EMPTY)?;
            moved += 1;
        }
        Ok(moved)
    }

    fn migrate_bucket_to_chain<IO: IoBackend>(
        io: &mut IO,
        group_off: Offset,
        bucket: u8,
        chain_off: Offset,
    ) -> Result<i64> {
        let slots = Self::read_group(io, group_off, GROUP_SLOTS)?;
        let mut moved = 0i64;
        let mut dest_idx = 0usize;
        for (idx, slot) in slots.iter().enumerate() {
            if slot.is_empty() || slot.is_subhash() || slot.home_bucket() != bucket {
                continue;
            }
            if dest_idx >= CHAIN_SLOTS {
                return Err(Error::corrupt("freshly allocated chain block overflowed during migration"));
            }
            let reinserted = HashSlot::encode_record(slot.offset(), 0, slot.extra_hash());
            Self::write_slot(io, chain_off, dest_idx as u8, reinserted)?;
            Self::write_slot(io, group_off, idx as u8, HashSlot::EMPTY)?;
            dest_idx += 1;
            moved += 1;
        }
        Ok(moved)
    }

    /// Preserve home-bucket/extra-hash bits, overwrite only the offset.
    pub fn replace_in_hash<IO: IoBackend>(io: &mut IO, located: &Located, new_offset: Offset) -> Result<()> {
        let bucket = located
            .bucket
            .ok_or_else(|| Error::einval("replace_in_hash called without a located slot"))?;
        let slot = HashSlot::encode_record(new_offset, located.home, extra7(located.hash));
        Self::write_slot(io, located.group_off, bucket, slot)
    }

    /// Clear the located slot, then walk the rest of the group pulling any slot whose home bucket
    /// no longer matches its index back toward its home, so linear probing for other keys in the
    /// group still terminates at the right place. Writes the whole group back in one call.
    pub fn delete_from_hash<IO: IoBackend>(io: &mut IO, located: &Located) -> Result<()> {
        let bucket = located
            .bucket
            .ok_or_else(|| Error::einval("delete_from_hash called without a located slot"))?;
        let width = if located.in_chain { CHAIN_SLOTS } else { GROUP_SLOTS };
        let mut slots = Self::read_group(io, located.group_off, width)?;
        slots[bucket as usize] = HashSlot::EMPTY;
        if !located.in_chain {
            Self::reseat_displaced(&mut slots);
        }
        for (idx, slot) in slots.iter().enumerate() {
            io.write(located.group_off + idx as u64 * 8, &io.endian().enc_u64(slot.0))?;
        }
        Ok(())
    }

    /// After clearing a slot, any non-empty, non-subhash slot whose home bucket differs from its
    /// current array index is "displaced" — it only landed there because its home was occupied at
    /// insert time — and is shifted back toward its home bucket by one slot at a time while doing
    /// so doesn't skip over a still-occupied slot.
    fn reseat_displaced(slots: &mut [HashSlot]) {
        let len = slots.len();
        for _ in 0..len {
            for idx in 0..len {
                let slot = slots[idx];
                if slot.is_empty() || slot.is_subhash() {
                    continue;
                }
                let home = slot.home_bucket() as usize;
                if home == idx {
                    continue;
                }
                let prev = (idx + len - 1) % len;
                if slots[prev].is_empty() && Self::dist(home, prev, len) < Self::dist(home, idx, len) {
                    slots[prev] = slot;
                    slots[idx] = HashSlot::EMPTY;
                }
            }
        }
    }

    fn dist(home: usize, idx: usize, len: usize) -> usize {
        (idx + len - home) % len
    }

    fn alloc_subhash<IO: IoBackend>(io: &mut IO, header: &mut FileHeader, locker: &Arc<Locker>) -> Result<Offset> {
        let off = crate::alloc::Allocator::alloc(
            io,
            header,
            locker,
            0,
            SUBHASH_SLOTS as u64 * 8,
            magic::HTABLE,
            0,
        )?;
        let body = off + UsedRecordHeader::SIZE as u64;
        io.write(body, &vec![0u8; SUBHASH_SLOTS * 8])?;
        Ok(body)
    }

    fn alloc_chain<IO: IoBackend>(io: &mut IO, header: &mut FileHeader, locker: &Arc<Locker>) -> Result<Offset> {
        let off = crate::alloc::Allocator::alloc(
            io,
            header,
            locker,
            0,
            CHAIN_SLOTS as u64 * 8 + 8,
            magic::CHAIN,
            0,
        )?;
        let body = off + UsedRecordHeader::SIZE as u64;
        io.write(body, &vec![0u8; CHAIN_SLOTS * 8 + 8])?;
        Ok(body)
    }

    fn read_group<IO: IoBackend>(io: &mut IO, off: Offset, count: usize) -> Result<Vec<HashSlot>> {
        let buf = io.read(off, count * 8)?;
        Ok(crate::header::decode_slots(&buf, count, io.endian()))
    }

    fn write_slot<IO: IoBackend>(io: &mut IO, group_off: Offset, idx: u8, slot: HashSlot) -> Result<()> {
        io.write(group_off + idx as u64 * 8, &io.endian().enc_u64(slot.0))
    }

    fn read_used_header<IO: IoBackend>(io: &mut IO, off: Offset) -> Result<UsedRecordHeader> {
        let buf = io.read(off, UsedRecordHeader::SIZE)?;
        let mut arr = [0u8; UsedRecordHeader::SIZE];
        arr.copy_from_slice(&buf);
        let hdr = UsedRecordHeader::decode(arr, io.endian());
        if hdr.magic != magic::USED {
            return Err(Error::corrupt(format!(
                "expected USED record at offset {off}, found magic {:#x}",
                hdr.magic
            )));
        }
        Ok(hdr)
    }
}

/// One nesting level of a [`Cursor`]'s traversal stack: either a 1024-wide top-level array, a
/// 64-wide subhash, or an 8-wide chain block (`in_chain`, which additionally follows its `next`
/// pointer once exhausted instead of popping).
struct ScanFrame {
    /// `None` only for the single top-level frame
    table_off: Option<Offset>,
    idx: usize,
    total: usize,
    depth: u32,
    in_chain: bool,
}

/// Cursor over every live key in the index: a stack of [`ScanFrame`]s, one per nesting level, so
/// that a subhash (or chain) found while scanning a frame can be descended into without recursion
/// blowing the stack on a pathological 9-level-deep trie.
///
/// A subhash-bit slot means two different things depending on depth: before the bit budget is
/// exhausted it points at another 64-slot subhash; at [`MAX_SUBHASH_DEPTH`] it points at an 8-slot
/// `CHAIN` block instead (see [`HashIndex::descend`]). The cursor has to track depth itself to
/// tell these apart, since nothing about the slot's bits alone distinguishes them.
pub struct Cursor {
    frames: Vec<ScanFrame>,
    /// offset of the last record this cursor returned, so a caller that deletes it mid-traversal
    /// doesn't confuse the next `next()` call
    pub prev: Option<Offset>,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            frames: vec![ScanFrame {
                table_off: None,
                idx: 0,
                total: crate::header::TOP_HASHTABLE_LEN,
                depth: 0,
                in_chain: false,
            }],
            prev: None,
        }
    }

    pub fn next<IO: IoBackend>(&mut self, io: &mut IO) -> Result<Option<Offset>> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(None);
            };
            if frame.idx >= frame.total {
                if frame.in_chain {
                    let chain_off = frame.table_off.expect("a chain frame always carries its block offset");
                    let next = io.read_off(chain_off + CHAIN_SLOTS as u64 * 8)?;
                    if next != 0 {
                        frame.table_off = Some(next);
                        frame.idx = 0;
                        continue;
                    }
                }
                self.frames.pop();
                if self.frames.is_empty() {
                    return Ok(None);
                }
                continue;
            }
            let depth = frame.depth;
            let in_chain = frame.in_chain;
            let slot_off = match frame.table_off {
                None => FileHeader::hashtable_slot_offset(frame.idx),
                Some(base) => base + frame.idx as u64 * 8,
            };
            let raw = io.read_off(slot_off)?;
            let slot = HashSlot(raw);
            frame.idx += 1;
            if slot.is_empty() {
                continue;
            }
            if slot.is_subhash() && !in_chain {
                if depth >= MAX_SUBHASH_DEPTH {
                    self.frames.push(ScanFrame {
                        table_off: Some(slot.offset()),
                        idx: 0,
                        total: CHAIN_SLOTS,
                        depth,
                        in_chain: true,
                    });
                } else {
                    self.frames.push(ScanFrame {
                        table_off: Some(slot.offset()),
                        idx: 0,
                        total: SUBHASH_SLOTS,
                        depth: depth + 1,
                        in_chain: false,
                    });
                }
                continue;
            }
            self.prev = Some(slot.offset());
            return Ok(Some(slot.offset()));
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_seed_sensitive() {
        let a = jenkins_hash64(1, b"hello");
        let b = jenkins_hash64(1, b"hello");
        let c = jenkins_hash64(2, b"hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn top_index_in_range() {
        for seed in 0..100u64 {
            let h = jenkins_hash64(seed, b"some-key");
            assert!(top_index(h) < crate::header::TOP_HASHTABLE_LEN as u32);
        }
    }

    #[test]
    fn fullest_bucket_picks_majority() {
        let mut slots = [HashSlot::EMPTY; GROUP_SLOTS];
        slots[0] = HashSlot::encode_record(100, 0, 1);
        slots[1] = HashSlot::encode_record(200, 0, 2);
        slots[2] = HashSlot::encode_record(300, 2, 3);
        assert_eq!(HashIndex::fullest_bucket(&slots, 2), 0);
    }

    #[test]
    fn home_and_subgroup_bits_partition_the_hash() {
        let h = 0xFFFF_FFFF_FFFF_FFFFu64;
        // exhaustively consuming bits shouldn't panic on shift amounts even at max depth
        for depth in 0..MAX_SUBHASH_DEPTH {
            let _ = home_bucket_at(h, depth);
            let _ = sub_group_at(h, depth);
        }
    }
}
