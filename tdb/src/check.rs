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

//! # Consistency validator
//!
//! [`check`] walks the same structures the engine mutates in the ordinary course of business
//! (hash index, free lists, the forward record chain) and reports the first inconsistency found,
//! rather than trying to repair anything. A failing `check` means a prior write left the file in a
//! state the engine itself doesn't expect, which should only ever follow a bug, not ordinary
//! operation.

use crate::alloc::size_to_bucket;
use crate::attrs::HashFn;
use crate::error::{Error, Result};
use crate::header::{
    magic, decode_slots, FileHeader, FreeRecordHeader, FreeTable, HashSlot, Offset,
    UsedRecordHeader, CHAIN_SLOTS, FREE_BUCKETS, GROUP_SLOTS, SUBHASH_SLOTS,
};
use crate::hash::{Cursor, HashIndex, MAX_SUBHASH_DEPTH};
use crate::io::IoBackend;
use crate::lock::Locker;
use std::collections::HashSet;
use std::sync::Arc;

/// Walk the hash index, the free lists, and the forward record chain, checking every invariant
/// the data model promises (P1-P5). `validator`, if given, additionally gets a look at every live
/// key/value pair and can reject the database for application-level reasons beyond structural
/// consistency.
pub fn check<IO: IoBackend>(
    io: &mut IO,
    header: &FileHeader,
    locker: &Arc<Locker>,
    hash_seed: u64,
    hash_fn: Option<HashFn>,
    validator: Option<&dyn Fn(&[u8], &[u8]) -> bool>,
) -> Result<()> {
    check_group_invariants(io)?;
    check_live_records(io, header, locker, hash_seed, hash_fn, validator)?;
    let scan = scan_body(io, header)?;
    check_free_table(io, header, &scan)?;
    Ok(())
}

/// **P1**: every used record reachable from the index has `magic == USED`, and looking it back up
/// by its own key finds it at the same offset (which, since [`HashIndex::find_and_lock`]'s probe
/// only ever matches on home bucket + extra-hash + full key compare, also exercises "the encoded
/// extra-hash bits match the live hash of its key").
fn check_live_records<IO: IoBackend>(
    io: &mut IO,
    header: &FileHeader,
    locker: &Arc<Locker>,
    hash_seed: u64,
    hash_fn: Option<HashFn>,
    validator: Option<&dyn Fn(&[u8], &[u8]) -> bool>,
) -> Result<()> {
    let mut cursor = Cursor::new();
    while let Some(offset) = cursor.next(io)? {
        let buf = io.read(offset, UsedRecordHeader::SIZE)?;
        let mut arr = [0u8; UsedRecordHeader::SIZE];
        arr.copy_from_slice(&buf);
        let rec = UsedRecordHeader::decode(arr, io.endian());
        if rec.magic != magic::USED {
            // HTABLE/CHAIN/FTABLE bodies are never referenced directly by a hash slot's offset
            // field the way a USED record is; reaching one here means the index points at the
            // wrong kind of record.
            return Err(Error::corrupt(format!(
                "hash index points at a non-USED record (magic {:#x}) at offset {offset} (P1 violation)",
                rec.magic
            )));
        }
        let key = io.read(offset + UsedRecordHeader::SIZE as u64, rec.key_len as usize)?;
        let (located, _guard) = HashIndex::find_and_lock(io, header, locker, hash_seed, hash_fn, &key)?;
        if located.found != Some(offset) {
            return Err(Error::corrupt(format!(
                "record at offset {offset} is not reachable by looking up its own key (P1 violation)"
            )));
        }
        if let Some(validate) = validator {
            let value = io.read(
                offset + UsedRecordHeader::SIZE as u64 + rec.key_len,
                rec.data_len as usize,
            )?;
            if !validate(&key, &value) {
                return Err(Error::einval(format!(
                    "caller-supplied validator rejected the record at offset {offset}"
                )));
            }
        }
    }
    Ok(())
}

/// **P2**: for every hash-group slot that's occupied and not itself a subhash/chain pointer, the
/// slots between its recorded home bucket and its current position must all be occupied too —
/// otherwise [`HashIndex::delete_from_hash`]'s reseat pass would have moved it back, and a linear
/// probe for some other key sharing that home bucket could stop short of finding it.
fn check_group_invariants<IO: IoBackend>(io: &mut IO) -> Result<()> {
    // (table_offset, group_count, depth); `None` table_offset means the top-level array
    let mut stack: Vec<(Option<Offset>, usize, u32)> =
        vec![(None, crate::header::TOP_HASHTABLE_LEN / GROUP_SLOTS, 0)];
    while let Some((table_off, group_count, depth)) = stack.pop() {
        for g in 0..group_count {
            let group_off = match table_off {
                None => FileHeader::hashtable_slot_offset(g * GROUP_SLOTS),
                Some(base) => base + g as u64 * GROUP_SLOTS as u64 * 8,
            };
            let slots = read_group(io, group_off, GROUP_SLOTS)?;
            check_one_group(&slots)?;
            for slot in &slots {
                if !slot.is_subhash() {
                    continue;
                }
                if depth >= MAX_SUBHASH_DEPTH {
                    check_chain(io, slot.offset())?;
                } else {
                    stack.push((Some(slot.offset()), SUBHASH_SLOTS / GROUP_SLOTS, depth + 1));
                }
            }
        }
    }
    Ok(())
}

fn check_one_group(slots: &[HashSlot]) -> Result<()> {
    let len = slots.len();
    for (idx, slot) in slots.iter().enumerate() {
        if slot.is_empty() || slot.is_subhash() {
            continue;
        }
        let home = slot.home_bucket() as usize;
        if home >= len {
            return Err(Error::corrupt("hash slot's home bucket field is out of range (P2 violation)"));
        }
        let mut i = home;
        while i != idx {
            if slots[i].is_empty() {
                return Err(Error::corrupt(
                    "hash group has an empty slot between an entry and its home bucket (P2 violation)",
                ));
            }
            i = (i + 1) % len;
        }
    }
    Ok(())
}

/// A `CHAIN` block never contains a subhash pointer (the bit budget is already exhausted by the
/// time anything overflows into one), only records and empty slots; walk every linked block.
fn check_chain<IO: IoBackend>(io: &mut IO, mut chain_off: Offset) -> Result<()> {
    let mut visited = HashSet::new();
    loop {
        if !visited.insert(chain_off) {
            return Err(Error::corrupt("chain block list contains a cycle"));
        }
        let slots = read_group(io, chain_off, CHAIN_SLOTS)?;
        for slot in &slots {
            if slot.is_subhash() {
                return Err(Error::corrupt(
                    "chain block contains a subhash pointer, which should be impossible past the bit budget",
                ));
            }
        }
        let next = io.read_off(chain_off + CHAIN_SLOTS as u64 * 8)?;
        if next == 0 {
            return Ok(());
        }
        chain_off = next;
    }
}

fn read_group<IO: IoBackend>(io: &mut IO, off: Offset, count: usize) -> Result<Vec<HashSlot>> {
    let buf = io.read(off, count * 8)?;
    Ok(decode_slots(&buf, count, io.endian()))
}

struct BodyScan {
    free_records: Vec<(Offset, u8, u64)>,
}

/// Forward-scans the whole record area (everything past the header and the free table), checking
/// **P4** (no two byte-adjacent records are both free) and, implicitly, **P5**: every record's own
/// length field is trusted to find the next one, so a short or overrunning scan means the sizes
/// recorded somewhere don't sum to the file's actual length.
fn scan_body<IO: IoBackend>(io: &mut IO, header: &FileHeader) -> Result<BodyScan> {
    let file_len = io.len()?;
    let mut off = FileHeader::SIZE as u64;
    let mut free_records = Vec::new();
    let mut prev_was_free = false;
    while off < file_len {
        if off == header.free_table {
            off += FreeTable::SIZE as u64;
            prev_was_free = false;
            continue;
        }
        let first_word = io.read_off(off)?;
        if FreeRecordHeader::looks_like_free(first_word) {
            let buf = io.read(off, FreeRecordHeader::SIZE)?;
            let mut arr = [0u8; FreeRecordHeader::SIZE];
            arr.copy_from_slice(&buf);
            let frec = FreeRecordHeader::decode(arr, io.endian())?;
            if prev_was_free {
                return Err(Error::corrupt(format!(
                    "two byte-adjacent free records meeting at offset {off} (P4 violation)"
                )));
            }
            free_records.push((off, frec.ftable_idx, frec.len));
            off += FreeRecordHeader::SIZE as u64 + frec.len;
            prev_was_free = true;
        } else {
            let buf = io.read(off, UsedRecordHeader::SIZE)?;
            let mut arr = [0u8; UsedRecordHeader::SIZE];
            arr.copy_from_slice(&buf);
            let rec = UsedRecordHeader::decode(arr, io.endian());
            if !matches!(rec.magic, magic::USED | magic::HTABLE | magic::CHAIN | magic::FTABLE) {
                return Err(Error::corrupt(format!(
                    "unrecognized record magic {:#x} at offset {off} (P5 violation: sizes don't add up)",
                    rec.magic
                )));
            }
            off += UsedRecordHeader::SIZE as u64 + rec.total_len();
            prev_was_free = false;
        }
    }
    if off != file_len {
        return Err(Error::corrupt(
            "forward scan of the record area overran the file length (P5 violation)",
        ));
    }
    Ok(BodyScan { free_records })
}

/// **P3**: every free record the forward scan found appears exactly once, in exactly one free-table
/// bucket list, and that bucket is the one `size_to_bucket` would assign it.
fn check_free_table<IO: IoBackend>(io: &mut IO, header: &FileHeader, scan: &BodyScan) -> Result<()> {
    let buf = io.read(header.free_table, FreeTable::SIZE)?;
    let table = FreeTable::decode(&buf, io.endian())?;
    let mut seen = HashSet::new();
    for bucket in 0..FREE_BUCKETS as u8 {
        let mut cursor = table.buckets[bucket as usize];
        let mut steps = 0usize;
        while cursor != 0 {
            if !seen.insert(cursor) {
                return Err(Error::corrupt(format!(
                    "free record at offset {cursor} appears more than once across bucket lists (P3 violation)"
                )));
            }
            let buf = io.read(cursor, FreeRecordHeader::SIZE)?;
            let mut arr = [0u8; FreeRecordHeader::SIZE];
            arr.copy_from_slice(&buf);
            let frec = FreeRecordHeader::decode(arr, io.endian())?;
            if frec.ftable_idx != bucket || size_to_bucket(frec.len) != bucket {
                return Err(Error::corrupt(format!(
                    "free record at offset {cursor} is filed under bucket {bucket} but belongs in {} (P3 violation)",
                    size_to_bucket(frec.len)
                )));
            }
            cursor = frec.next;
            steps += 1;
            if steps > scan.free_records.len() + 1 {
                return Err(Error::corrupt("free bucket list longer than the number of free records found on disk"));
            }
        }
    }
    if seen.len() != scan.free_records.len() {
        return Err(Error::corrupt(
            "a free record found by the forward scan is missing from every free-table bucket list (P3 violation)",
        ));
    }
    for &(off, _, _) in &scan.free_records {
        if !seen.contains(&off) {
            return Err(Error::corrupt(format!(
                "free record at offset {off} was found on disk but is not linked from any free-table bucket (P3 violation)"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::header::Endian;
    use crate::io::mapping::DirectIo;
    use crate::lock::RawLock;

    fn scratch() -> (DirectIo, FileHeader, Arc<Locker>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check-test");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let io = DirectIo::new(file, Endian::Native, false).unwrap();
        let header = FileHeader::new(42, 99);
        let raw = RawLock::open(&path).unwrap();
        let locker = Arc::new(Locker::new(raw, false));
        (io, header, locker)
    }

    #[test]
    fn empty_database_passes_check() {
        let (mut io, mut header, locker) = scratch();
        io.write(0, &header.encode(io.endian())).unwrap();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        io.write(0, &header.encode(io.endian())).unwrap();
        check(&mut io, &header, &locker, header.hash_seed, None, None).unwrap();
    }

    #[test]
    fn stored_record_passes_check() {
        let (mut io, mut header, locker) = scratch();
        io.write(0, &header.encode(io.endian())).unwrap();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        let key = b"hello";
        let value = b"world";
        let off = Allocator::alloc(&mut io, &mut header, &locker, key.len() as u64, value.len() as u64, magic::USED, 0)
            .unwrap();
        io.write(off + UsedRecordHeader::SIZE as u64, key).unwrap();
        io.write(off + UsedRecordHeader::SIZE as u64 + key.len() as u64, value).unwrap();
        let (located, _guard) =
            HashIndex::find_and_lock(&mut io, &header, &locker, header.hash_seed, None, key).unwrap();
        HashIndex::add_to_hash(&mut io, &mut header, &locker, header.hash_seed, None, &located, off).unwrap();
        io.write(0, &header.encode(io.endian())).unwrap();
        check(&mut io, &header, &locker, header.hash_seed, None, None).unwrap();
    }
}
