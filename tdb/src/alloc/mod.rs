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

//! # Free-space allocator
//!
//! A size-bucketed free list: bucket `i` holds records whose usable span is in `[2^i, 2^(i+1))`.
//! Allocation walks buckets upward from the smallest one that could fit; freeing pushes a record
//! back onto its bucket and, opportunistically, merges it with an immediately-following free
//! neighbor. There is no room to thread a record to its *preceding* neighbor without doubly linking
//! every record by position, so a freed record that could merge left is simply left for the next
//! scan that passes over it to pick up (see [`Allocator::free`]).

use crate::error::{Error, Result};
use crate::header::{FileHeader, FreeRecordHeader, FreeTable, Offset, UsedRecordHeader, FREE_BUCKETS};
use crate::io::IoBackend;
use crate::lock::{LockKind, LockTarget, Locker};
use std::sync::Arc;

/// Extend the file by at least this many times the size of the allocation that triggered the
/// extension, matching the 100x growth factor this storage family has used historically to keep
/// extensions infrequent.
const EXTENSION_FACTOR: u64 = 100;
/// Floor for a file extension regardless of how small the triggering allocation was.
const MIN_GROWTH: u64 = 4096;
/// A free record's usable span must be at least this big for a split to leave a reusable
/// leftover (room for another free record's own header).
const MIN_FREE_SPLIT: u64 = FreeRecordHeader::SIZE as u64;

pub fn size_to_bucket(len: u64) -> u8 {
    if len == 0 {
        0
    } else {
        (63 - len.leading_zeros()).min(FREE_BUCKETS as u32 - 1) as u8
    }
}

pub struct Allocator;

impl Allocator {
    /// Allocate space for a record with the given key/data payload, write a used-record header of
    /// the given `magic`/`hash11` into it, and return the offset of the record (header start).
    pub fn alloc<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        key_len: u64,
        data_len: u64,
        magic: u16,
        hash11: u16,
    ) -> Result<Offset> {
        let needed = key_len + data_len;
        loop {
            if let Some(off) = Self::try_take(io, header, locker, needed)? {
                let rec = UsedRecordHeader::new(magic, key_len, data_len, hash11);
                // the free header occupying this slot is wider than a used header; the
                // difference becomes this record's extra padding
                let slot_len = Self::read_free(io, off)?.len + FreeRecordHeader::SIZE as u64;
                let mut rec = rec;
                rec.extra_padding = (slot_len - UsedRecordHeader::SIZE as u64 - needed) as u32;
                io.write(off, &rec.encode(io.endian()))?;
                return Ok(off);
            }
            Self::expand(io, header, locker, needed)?;
        }
    }

    /// Look across the free table for a record big enough to hold `needed` bytes of key+data,
    /// splitting it if there's a reusable leftover. Returns `None` if no bucket has a fit.
    fn try_take<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        needed: u64,
    ) -> Result<Option<Offset>> {
        let start_bucket = size_to_bucket(needed);
        for bucket in start_bucket..FREE_BUCKETS as u8 {
            let _lock = locker.lock(LockTarget::FreeBucket(bucket), LockKind::Write, true)?;
            let mut table = Self::read_table(io, header)?;
            let mut cursor = table.buckets[bucket as usize];
            let mut prev: Option<Offset> = None;
            while cursor != 0 {
                let frec = Self::read_free(io, cursor)?;
                let capacity = frec.len + FreeRecordHeader::SIZE as u64 - UsedRecordHeader::SIZE as u64;
                if capacity >= needed {
                    Self::unlink(io, header, &mut table, bucket, prev, cursor, frec.next)?;
                    Self::maybe_split(io, header, locker, cursor, &frec, needed)?;
                    return Ok(Some(cursor));
                }
                prev = Some(cursor);
                cursor = frec.next;
            }
        }
        Ok(None)
    }

    /// If the chosen record has enough slack beyond `needed` to host another free record, shrink
    /// it in place and push the tail back onto whichever bucket its new, smaller size belongs to.
    fn maybe_split<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        off: Offset,
        frec: &FreeRecordHeader,
        needed: u64,
    ) -> Result<()> {
        let total_span = FreeRecordHeader::SIZE as u64 + frec.len;
        let used_span = UsedRecordHeader::SIZE as u64 + needed;
        if total_span < used_span + MIN_FREE_SPLIT {
            return Ok(());
        }
        let tail_off = off + used_span;
        let tail_len = total_span - used_span - FreeRecordHeader::SIZE as u64;
        let tail_bucket = size_to_bucket(tail_len);
        Self::push_free(io, header, locker, tail_bucket, tail_off, tail_len)?;
        Ok(())
    }

    /// Release a previously allocated record back to the free list, merging with whichever
    /// immediate neighbor(s) — by file position, not list position — are also free.
    pub fn free<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        off: Offset,
        total_len: u64,
    ) -> Result<()> {
        let mut off = off;
        let mut len = total_len - FreeRecordHeader::SIZE as u64;
        let next_off = off + FreeRecordHeader::SIZE as u64 + len;
        if let Ok(first_word) = io.read_off(next_off) {
            if FreeRecordHeader::looks_like_free(first_word) {
                if let Ok(neighbor) = Self::read_free(io, next_off) {
                    let neighbor_bucket = size_to_bucket(neighbor.len);
                    let _lock = locker.lock(LockTarget::FreeBucket(neighbor_bucket), LockKind::Write, true)?;
                    let mut table = Self::read_table(io, header)?;
                    Self::unlink_known(io, header, &mut table, neighbor_bucket, next_off, neighbor.next)?;
                    len += FreeRecordHeader::SIZE as u64 + neighbor.len;
                }
            }
        }
        // there is no reverse pointer to the record immediately to the left by position, so
        // finding it (if free) takes a forward scan from the start of the record area; P4 (no two
        // adjacent free records survive a free()) already holds everywhere else, so the left
        // neighbor found here, if any, cannot itself have a free record further left.
        if let Some(left_off) = Self::find_left_neighbor(io, header, off)? {
            if let Ok(first_word) = io.read_off(left_off) {
                if FreeRecordHeader::looks_like_free(first_word) {
                    if let Ok(left) = Self::read_free(io, left_off) {
                        let left_bucket = size_to_bucket(left.len);
                        let _lock = locker.lock(LockTarget::FreeBucket(left_bucket), LockKind::Write, true)?;
                        let mut table = Self::read_table(io, header)?;
                        Self::unlink_known(io, header, &mut table, left_bucket, left_off, left.next)?;
                        len += FreeRecordHeader::SIZE as u64 + left.len;
                        off = left_off;
                    }
                }
            }
        }
        let bucket = size_to_bucket(len);
        Self::push_free(io, header, locker, bucket, off, len)
    }

    /// Walk the record area from its start, stepping record-by-record via each record's own
    /// length field (the same traversal `check`'s body scan performs), to find whichever record's
    /// span ends exactly at `target`. Returns `None` if `target` is the very first record, or sits
    /// right after the free table.
    fn find_left_neighbor<IO: IoBackend>(
        io: &mut IO,
        header: &FileHeader,
        target: Offset,
    ) -> Result<Option<Offset>> {
        let mut off = FileHeader::SIZE as u64;
        let mut prev = None;
        while off < target {
            if off == header.free_table {
                off += FreeTable::SIZE as u64;
                prev = None;
                continue;
            }
            let this = off;
            let first_word = io.read_off(off)?;
            if FreeRecordHeader::looks_like_free(first_word) {
                let frec = Self::read_free(io, off)?;
                off += FreeRecordHeader::SIZE as u64 + frec.len;
            } else {
                let buf = io.read(off, UsedRecordHeader::SIZE)?;
                let mut arr = [0u8; UsedRecordHeader::SIZE];
                arr.copy_from_slice(&buf);
                let rec = UsedRecordHeader::decode(arr, io.endian());
                off += UsedRecordHeader::SIZE as u64 + rec.total_len();
            }
            prev = Some(this);
        }
        // an overshoot means `target` doesn't sit on a record boundary; nothing safe to merge with
        Ok(if off == target { prev } else { None })
    }

    fn push_free<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        bucket: u8,
        off: Offset,
        len: u64,
    ) -> Result<()> {
        let _lock = locker.lock(LockTarget::FreeBucket(bucket), LockKind::Write, true)?;
        let mut table = Self::read_table(io, header)?;
        let old_head = table.buckets[bucket as usize];
        let frec = FreeRecordHeader {
            ftable_idx: bucket,
            prev: 0,
            len,
            next: old_head,
        };
        io.write(off, &frec.encode(io.endian()))?;
        table.buckets[bucket as usize] = off;
        Self::write_table(io, header, &table)
    }

    /// Remove a free record from its bucket list once its predecessor in that list is known
    /// (`prev == None` means it was the head).
    fn unlink<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        table: &mut FreeTable,
        bucket: u8,
        prev: Option<Offset>,
        off: Offset,
        next: Offset,
    ) -> Result<()> {
        match prev {
            None => table.buckets[bucket as usize] = next,
            Some(p) => {
                let mut pf = Self::read_free(io, p)?;
                pf.next = next;
                io.write(p, &pf.encode(io.endian()))?;
            }
        }
        let _ = off;
        Self::write_table(io, header, table)
    }

    /// Like [`Self::unlink`] but walks the bucket list itself to find the predecessor, for the
    /// coalescing path where only the neighbor's offset (not its position in the list) is known.
    fn unlink_known<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        table: &mut FreeTable,
        bucket: u8,
        off: Offset,
        next: Offset,
    ) -> Result<()> {
        let mut cursor = table.buckets[bucket as usize];
        if cursor == off {
            table.buckets[bucket as usize] = next;
            return Self::write_table(io, header, table);
        }
        while cursor != 0 {
            let mut frec = Self::read_free(io, cursor)?;
            if frec.next == off {
                frec.next = next;
                io.write(cursor, &frec.encode(io.endian()))?;
                return Self::write_table(io, header, table);
            }
            cursor = frec.next;
        }
        Err(Error::corrupt("free record not found in its own bucket list"))
    }

    /// Grow the file to make room for an allocation that no existing free record can satisfy, and
    /// hand the new tail straight to the free list as a single record.
    fn expand<IO: IoBackend>(
        io: &mut IO,
        header: &mut FileHeader,
        locker: &Arc<Locker>,
        needed: u64,
    ) -> Result<()> {
        let _exp = locker.lock(LockTarget::Expansion, LockKind::Write, true)?;
        let _all = locker.lock_all_record(LockKind::Write, false)?;
        let old_len = io.len()?;
        let grow = (needed * EXTENSION_FACTOR).max(MIN_GROWTH);
        io.ensure_capacity(old_len + grow)?;
        let tail_off = old_len;
        let tail_len = grow - FreeRecordHeader::SIZE as u64;
        let bucket = size_to_bucket(tail_len);
        Self::push_free(io, header, locker, bucket, tail_off, tail_len)
    }

    fn read_free<IO: IoBackend>(io: &mut IO, off: Offset) -> Result<FreeRecordHeader> {
        let buf = io.read(off, FreeRecordHeader::SIZE)?;
        let mut arr = [0u8; FreeRecordHeader::SIZE];
        arr.copy_from_slice(&buf);
        FreeRecordHeader::decode(arr, io.endian())
    }

    fn read_table<IO: IoBackend>(io: &mut IO, header: &FileHeader) -> Result<FreeTable> {
        let buf = io.read(header.free_table, FreeTable::SIZE)?;
        FreeTable::decode(&buf, io.endian())
    }

    fn write_table<IO: IoBackend>(io: &mut IO, header: &FileHeader, table: &FreeTable) -> Result<()> {
        io.write(header.free_table, &table.encode(io.endian()))
    }

    /// Bootstrap an empty free table at file creation time, before any allocation has happened.
    pub fn bootstrap<IO: IoBackend>(io: &mut IO, header: &mut FileHeader) -> Result<()> {
        let off = io.len()?;
        io.ensure_capacity(off + FreeTable::SIZE as u64)?;
        header.free_table = off;
        io.write(off, &FreeTable::empty().encode(io.endian()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Endian;
    use crate::io::mapping::DirectIo;
    use crate::lock::RawLock;

    fn scratch() -> (DirectIo, FileHeader, Arc<Locker>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc-test");
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
    fn bucket_boundaries() {
        assert_eq!(size_to_bucket(1), 0);
        assert_eq!(size_to_bucket(2), 1);
        assert_eq!(size_to_bucket(3), 1);
        assert_eq!(size_to_bucket(4), 2);
        assert_eq!(size_to_bucket(1023), 9);
        assert_eq!(size_to_bucket(1024), 10);
    }

    #[test]
    fn alloc_then_free_roundtrip() {
        let (mut io, mut header, locker) = scratch();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        let off = Allocator::alloc(&mut io, &mut header, &locker, 3, 5, 0xA501, 7).unwrap();
        assert!(off > 0);
        Allocator::free(&mut io, &mut header, &locker, off, 16 + 3 + 5).unwrap();
        let off2 = Allocator::alloc(&mut io, &mut header, &locker, 3, 5, 0xA501, 7).unwrap();
        // the freed record should be reused rather than growing the file again
        assert_eq!(off, off2);
    }

    #[test]
    fn expand_when_list_is_empty() {
        let (mut io, mut header, locker) = scratch();
        Allocator::bootstrap(&mut io, &mut header).unwrap();
        let before = io.len().unwrap();
        let off = Allocator::alloc(&mut io, &mut header, &locker, 10, 10, 0xA501, 1).unwrap();
        assert!(off >= before);
    }
}
