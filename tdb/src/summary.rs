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

//! # Diagnostic summary
//!
//! [`summary`] walks the same hash index and free-table structures [`crate::check`] does, but
//! instead of validating invariants it tallies them into a human-readable histogram: how deep the
//! trie gets, how many records live at each depth, how the free space is distributed across the
//! 56 size buckets. Built with [`std::fmt::Write`] into a single `String`, the same idiom this
//! corpus prefers over repeated `String::push_str` calls.

use crate::alloc::size_to_bucket;
use crate::attrs::HashFn;
use crate::error::Result;
use crate::header::{FileHeader, FreeRecordHeader, FreeTable, HashSlot, Offset, UsedRecordHeader, FREE_BUCKETS, GROUP_SLOTS, SUBHASH_SLOTS};
use crate::hash::MAX_SUBHASH_DEPTH;
use crate::io::IoBackend;
use crate::lock::Locker;
use std::fmt::Write as _;
use std::sync::Arc;

/// A tiny hand-rolled bitflags-alike, matching the one in [`crate::attrs`]; a second dependency on
/// the same one-off macro isn't worth factoring out of a 7-line definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryFlags(u32);

impl SummaryFlags {
    pub const HASH: Self = Self(1 << 0);
    pub const FREE: Self = Self(1 << 1);
    pub const ALL: Self = Self(Self::HASH.0 | Self::FREE.0);

    pub const fn empty() -> Self {
        Self(0)
    }
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SummaryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for SummaryFlags {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Default)]
struct HashStats {
    records_at_depth: [u64; (MAX_SUBHASH_DEPTH + 1) as usize],
    subhash_count: u64,
    chain_blocks: u64,
    chain_records: u64,
    key_bytes: u64,
    value_bytes: u64,
}

#[derive(Default)]
struct FreeStats {
    per_bucket_count: [u64; FREE_BUCKETS],
    per_bucket_bytes: [u64; FREE_BUCKETS],
}

/// Build the text report [`crate::Database::summary`] returns. Tallies instead of validating; for
/// a correctness check use [`crate::check::check`].
pub fn summary<IO: IoBackend>(
    io: &mut IO,
    header: &FileHeader,
    locker: &Arc<Locker>,
    hash_seed: u64,
    hash_fn: Option<HashFn>,
    flags: SummaryFlags,
) -> Result<String> {
    // unlocked scan, same tradeoff as crate::Database::traverse: a diagnostic snapshot, not a
    // consistency guarantee. locker/hash_fn stay in the signature for parity with check().
    let _ = (locker, hash_fn);
    let mut out = String::new();
    writeln!(out, "tdb2 summary").ok();
    writeln!(out, "  file length       : {} bytes", io.len()?).ok();
    writeln!(out, "  hash seed         : {:#018x}", hash_seed).ok();
    writeln!(out, "  free table offset : {}", header.free_table).ok();

    if flags.contains(SummaryFlags::HASH) {
        let stats = scan_hash(io)?;
        writeln!(out, "hash index:").ok();
        for (depth, count) in stats.records_at_depth.iter().enumerate() {
            if *count > 0 {
                writeln!(out, "  depth {depth:>2}: {count} record(s)").ok();
            }
        }
        writeln!(out, "  subhash tables    : {}", stats.subhash_count).ok();
        writeln!(out, "  chain blocks      : {}", stats.chain_blocks).ok();
        writeln!(out, "  chained records   : {}", stats.chain_records).ok();
        let total_records: u64 = stats.records_at_depth.iter().sum::<u64>() + stats.chain_records;
        writeln!(out, "  total records     : {total_records}").ok();
        if total_records > 0 {
            writeln!(
                out,
                "  avg key/value len : {}/{} bytes",
                stats.key_bytes / total_records,
                stats.value_bytes / total_records
            )
            .ok();
        }
    }

    if flags.contains(SummaryFlags::FREE) {
        let stats = scan_free(io, header)?;
        writeln!(out, "free space:").ok();
        let mut total_bytes = 0u64;
        let mut total_count = 0u64;
        for bucket in 0..FREE_BUCKETS {
            if stats.per_bucket_count[bucket] > 0 {
                writeln!(
                    out,
                    "  bucket {bucket:>2} [{:>12}, {:>12}): {:>6} record(s), {:>10} bytes",
                    1u64 << bucket,
                    1u64 << (bucket + 1),
                    stats.per_bucket_count[bucket],
                    stats.per_bucket_bytes[bucket]
                )
                .ok();
                total_count += stats.per_bucket_count[bucket];
                total_bytes += stats.per_bucket_bytes[bucket];
            }
        }
        writeln!(out, "  total             : {total_count} record(s), {total_bytes} bytes").ok();
    }

    Ok(out)
}

/// Walk the trie the same way [`crate::check::check`]'s `check_group_invariants` does, but tally
/// depth/record counts instead of asserting anything.
fn scan_hash<IO: IoBackend>(io: &mut IO) -> Result<HashStats> {
    let mut stats = HashStats::default();
    let mut stack: Vec<(Option<Offset>, usize, u32)> =
        vec![(None, crate::header::TOP_HASHTABLE_LEN / GROUP_SLOTS, 0)];
    while let Some((table_off, group_count, depth)) = stack.pop() {
        for g in 0..group_count {
            let group_off = match table_off {
                None => FileHeader::hashtable_slot_offset(g * GROUP_SLOTS),
                Some(base) => base + g as u64 * GROUP_SLOTS as u64 * 8,
            };
            let slots = read_group(io, group_off, GROUP_SLOTS)?;
            for slot in &slots {
                if slot.is_empty() {
                    continue;
                }
                if slot.is_subhash() {
                    if depth >= MAX_SUBHASH_DEPTH {
                        stats.chain_blocks += 1;
                        scan_chain(io, slot.offset(), &mut stats)?;
                    } else {
                        stats.subhash_count += 1;
                        stack.push((Some(slot.offset()), SUBHASH_SLOTS / GROUP_SLOTS, depth + 1));
                    }
                } else {
                    stats.records_at_depth[depth as usize] += 1;
                    tally_record(io, slot.offset(), &mut stats)?;
                }
            }
        }
    }
    Ok(stats)
}

fn scan_chain<IO: IoBackend>(io: &mut IO, mut chain_off: Offset, stats: &mut HashStats) -> Result<()> {
    loop {
        let slots = read_group(io, chain_off, crate::header::CHAIN_SLOTS)?;
        for slot in &slots {
            if !slot.is_empty() {
                stats.chain_records += 1;
                tally_record(io, slot.offset(), stats)?;
            }
        }
        let next = io.read_off(chain_off + crate::header::CHAIN_SLOTS as u64 * 8)?;
        if next == 0 {
            return Ok(());
        }
        chain_off = next;
    }
}

fn tally_record<IO: IoBackend>(io: &mut IO, off: Offset, stats: &mut HashStats) -> Result<()> {
    let buf = io.read(off, UsedRecordHeader::SIZE)?;
    let mut arr = [0u8; UsedRecordHeader::SIZE];
    arr.copy_from_slice(&buf);
    let rec = UsedRecordHeader::decode(arr, io.endian());
    stats.key_bytes += rec.key_len;
    stats.value_bytes += rec.data_len;
    Ok(())
}

fn scan_free<IO: IoBackend>(io: &mut IO, header: &FileHeader) -> Result<FreeStats> {
    let mut stats = FreeStats::default();
    let buf = io.read(header.free_table, FreeTable::SIZE)?;
    let table = FreeTable::decode(&buf, io.endian())?;
    for bucket in 0..FREE_BUCKETS {
        let mut cursor = table.buckets[bucket];
        while cursor != 0 {
            let fbuf = io.read(cursor, FreeRecordHeader::SIZE)?;
            let mut arr = [0u8; FreeRecordHeader::SIZE];
            arr.copy_from_slice(&fbuf);
            let frec = FreeRecordHeader::decode(arr, io.endian())?;
            debug_assert_eq!(size_to_bucket(frec.len), bucket as u8);
            stats.per_bucket_count[bucket] += 1;
            stats.per_bucket_bytes[bucket] += frec.len + FreeRecordHeader::SIZE as u64;
            cursor = frec.next;
        }
    }
    Ok(stats)
}

fn read_group<IO: IoBackend>(io: &mut IO, off: Offset, count: usize) -> Result<Vec<HashSlot>> {
    let buf = io.read(off, count * 8)?;
    Ok(crate::header::decode_slots(&buf, count, io.endian()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::header::{magic, Endian};
    use crate::hash::HashIndex;
    use crate::io::mapping::DirectIo;
    use crate::lock::RawLock;

    fn scratch() -> (DirectIo, FileHeader, Arc<Locker>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary-test");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let io = DirectIo::new(file, Endian::Native, false).unwrap();
        let header = FileHeader::new(7, 0xabc);
        let raw = RawLock::open(&path).unwrap();
        let locker = Arc::new(Locker::new(raw, false));
        (io, header, locker)
    }

    #[test]
    fn empty_database_summary_has_no_records() {
        let (mut io, mut header, locker) = scratch();
        io.write(0, &header.encode(io.endian())).unwrap();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        io.write(0, &header.encode(io.endian())).unwrap();
        let text = summary(&mut io, &header, &locker, header.hash_seed, None, SummaryFlags::ALL).unwrap();
        assert!(text.contains("tdb2 summary"));
        assert!(!text.contains("depth"));
    }

    #[test]
    fn one_record_is_counted_at_depth_zero() {
        let (mut io, mut header, locker) = scratch();
        io.write(0, &header.encode(io.endian())).unwrap();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        let key = b"k";
        let value = b"v";
        let off = Allocator::alloc(&mut io, &mut header, &locker, key.len() as u64, value.len() as u64, magic::USED, 0)
            .unwrap();
        io.write(off + UsedRecordHeader::SIZE as u64, key).unwrap();
        io.write(off + UsedRecordHeader::SIZE as u64 + key.len() as u64, value).unwrap();
        let (located, _guard) =
            HashIndex::find_and_lock(&mut io, &header, &locker, header.hash_seed, None, key).unwrap();
        HashIndex::add_to_hash(&mut io, &mut header, &locker, header.hash_seed, None, &located, off).unwrap();
        io.write(0, &header.encode(io.endian())).unwrap();
        let text = summary(&mut io, &header, &locker, header.hash_seed, None, SummaryFlags::ALL).unwrap();
        assert!(text.contains("depth  0: 1 record(s)"));
        assert!(text.contains("total records     : 1"));
    }
}
