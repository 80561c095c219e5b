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

//! # Transaction + recovery
//!
//! [`TransactionIo`] is an [`IoBackend`] that keeps every read/write entirely in memory: nothing
//! this transaction writes touches the real file until [`Transaction::commit`]. Before it does, the
//! pre-transaction contents of everything the transaction is about to overwrite are written to an
//! embedded recovery area and fsynced, so a crash between that fsync and the final one leaves
//! enough on disk for [`recover_if_needed`] to put the file back the way it was (or finish applying
//! what was about to be committed) the next time it's opened.
//!
//! The recovery area's CRC-32/ISO-HDLC checksum per triple mirrors how this corpus checksums its
//! own append-only journal records (see `server/src/engine/storage/v1/raw/journal/raw.rs`).

use crate::error::{Error, Result};
use crate::header::{magic, Endian, Offset, RecoveryHeader};
use crate::io::IoBackend;
use crate::lock::{LockGuard, LockKind, Locker};
use std::collections::BTreeMap;
use std::sync::Arc;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// An [`IoBackend`] that buffers every write in memory and layers it over reads from `inner`.
/// Nothing reaches `inner` until the owning [`Transaction`] commits.
pub struct TransactionIo<'a, IO: IoBackend> {
    inner: &'a mut IO,
    /// logical length as seen from inside the transaction; may exceed `inner`'s real length if the
    /// transaction has grown the file (via the allocator) but not yet committed
    virtual_len: u64,
    /// buffered writes, keyed by starting offset
    writes: BTreeMap<Offset, Vec<u8>>,
    /// pre-image of every byte range this transaction has overwritten that existed in `inner`
    /// before the transaction started; replayed by [`recover_if_needed`] on a crash mid-commit
    originals: BTreeMap<Offset, Vec<u8>>,
    /// `inner`'s length when the transaction started; only bytes below this line have a pre-image
    /// worth recording (anything past it didn't exist before the transaction, so a crash can just
    /// truncate it away)
    start_len: u64,
}

impl<'a, IO: IoBackend> TransactionIo<'a, IO> {
    pub fn new(inner: &'a mut IO) -> Result<Self> {
        let start_len = inner.len()?;
        Ok(Self {
            inner,
            virtual_len: start_len,
            writes: BTreeMap::new(),
            originals: BTreeMap::new(),
            start_len,
        })
    }

    fn capture_original(&mut self, off: Offset, len: usize) -> Result<()> {
        if off >= self.start_len || self.originals.contains_key(&off) {
            return Ok(());
        }
        let clipped = ((off + len as u64).min(self.start_len) - off) as usize;
        if clipped == 0 {
            return Ok(());
        }
        let bytes = self.inner.read(off, clipped)?;
        self.originals.insert(off, bytes);
        Ok(())
    }

    fn overlay_read(&self, off: Offset, len: usize) -> Option<Vec<u8>> {
        // only services a read that falls entirely within a single previously buffered write;
        // a read spanning a buffered write's edge falls through to the merge path in `read`
        let (&w_off, w_data) = self.writes.range(..=off).next_back()?;
        let w_end = w_off + w_data.len() as u64;
        if off >= w_off && off + len as u64 <= w_end {
            let start = (off - w_off) as usize;
            Some(w_data[start..start + len].to_vec())
        } else {
            None
        }
    }

    /// Every (offset, original-bytes) pair a prior write overwrote, for [`Transaction::prepare_commit`]
    /// to serialize into the recovery area.
    pub fn originals(&self) -> &BTreeMap<Offset, Vec<u8>> {
        &self.originals
    }

    pub fn start_len(&self) -> u64 {
        self.start_len
    }

    /// Direct access to the file this transaction is layered over, bypassing the write buffer.
    /// Used only for the recovery record itself, which must land on disk immediately rather than
    /// waiting for commit.
    pub fn inner_mut(&mut self) -> &mut IO {
        self.inner
    }

    /// Reconstitute a transaction's in-memory state against a (possibly different, but same-file)
    /// borrow of `IO`. Used to thread one transaction's buffered state through a sequence of
    /// otherwise-independent borrows of the handle's [`IoBackend`] without holding the borrow open
    /// across calls.
    pub fn from_parts(
        inner: &'a mut IO,
        virtual_len: u64,
        writes: BTreeMap<Offset, Vec<u8>>,
        originals: BTreeMap<Offset, Vec<u8>>,
        start_len: u64,
    ) -> Self {
        Self {
            inner,
            virtual_len,
            writes,
            originals,
            start_len,
        }
    }

    /// The inverse of [`Self::from_parts`]: hand back the buffered state without the borrow, so it
    /// can be stored until the next call needs to reattach it to the handle's [`IoBackend`].
    pub fn into_parts(
        self,
    ) -> (
        u64,
        BTreeMap<Offset, Vec<u8>>,
        BTreeMap<Offset, Vec<u8>>,
        u64,
    ) {
        (self.virtual_len, self.writes, self.originals, self.start_len)
    }

    /// Apply every buffered write straight to the underlying file, in offset order (doesn't sync).
    pub fn flush_into(&mut self) -> Result<()> {
        self.inner.ensure_capacity(self.virtual_len)?;
        for (&off, data) in &self.writes {
            self.inner.write(off, data)?;
        }
        Ok(())
    }
}

impl<'a, IO: IoBackend> IoBackend for TransactionIo<'a, IO> {
    fn endian(&self) -> Endian {
        self.inner.endian()
    }

    fn len(&self) -> Result<u64> {
        Ok(self.virtual_len)
    }

    fn ensure_capacity(&mut self, min_len: u64) -> Result<()> {
        if min_len > self.virtual_len {
            self.virtual_len = min_len;
        }
        Ok(())
    }

    fn read(&mut self, off: Offset, len: usize) -> Result<Vec<u8>> {
        if off + len as u64 > self.virtual_len {
            return Err(Error::corrupt("read past transaction's virtual end of file"));
        }
        if let Some(v) = self.overlay_read(off, len) {
            return Ok(v);
        }
        // byte-by-byte merge: start from the underlying file (or zero, for the grown tail), then
        // paint every buffered write that overlaps this range on top
        let mut buf = if off < self.start_len {
            let clipped = ((off + len as u64).min(self.start_len) - off) as usize;
            let mut b = self.inner.read(off, clipped)?;
            b.resize(len, 0);
            b
        } else {
            vec![0u8; len]
        };
        for (&w_off, w_data) in self.writes.range(..off + len as u64) {
            let w_end = w_off + w_data.len() as u64;
            if w_end <= off {
                continue;
            }
            let overlap_start = w_off.max(off);
            let overlap_end = w_end.min(off + len as u64);
            if overlap_start >= overlap_end {
                continue;
            }
            let src = (overlap_start - w_off) as usize..(overlap_end - w_off) as usize;
            let dst = (overlap_start - off) as usize..(overlap_end - off) as usize;
            buf[dst].copy_from_slice(&w_data[src]);
        }
        Ok(buf)
    }

    fn write(&mut self, off: Offset, data: &[u8]) -> Result<()> {
        self.capture_original(off, data.len())?;
        let end = off + data.len() as u64;
        if end > self.virtual_len {
            self.virtual_len = end;
        }
        self.writes.insert(off, data.to_vec());
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        // a transaction's writes aren't durable until commit; mid-transaction sync is a no-op by
        // design, matching "writes do not touch the file until commit"
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.virtual_len = len;
        self.writes.retain(|&off, data| {
            if off >= len {
                false
            } else if off + data.len() as u64 > len {
                data.truncate((len - off) as usize);
                true
            } else {
                true
            }
        });
        Ok(())
    }
}

/// Lifecycle state machine for one process-local transaction against one [`crate::Database`]
/// handle. Only one may be open per handle at a time (the transaction lock serializes attempts
/// across processes).
pub enum TransactionState {
    /// snapshotting originals, buffering writes; all-record read lock held
    Open,
    /// `prepare_commit` has durably written a valid recovery record; all-record write lock held
    Prepared,
}

pub struct Transaction {
    pub state: TransactionState,
    _txn_lock: LockGuard,
    all_record: LockGuard,
}

impl Transaction {
    pub fn start(locker: &Arc<Locker>) -> Result<Self> {
        let txn_lock = locker.lock(crate::lock::LockTarget::Transaction, LockKind::Write, true)?;
        let all_record = locker.lock_all_record(LockKind::Read, true)?;
        Ok(Self {
            state: TransactionState::Open,
            _txn_lock: txn_lock,
            all_record,
        })
    }

    /// Upgrade to an all-record write lock, persist the recovery record, and fsync twice (once for
    /// the record body, once more after flipping its magic to "valid"). After this returns, a crash
    /// is guaranteed recoverable: either this function's caller still finishes `commit`, or
    /// [`recover_if_needed`] replays the originals back on the next open.
    ///
    /// The recovery record is written through `txn_io.inner_mut()`, i.e. straight to the real file,
    /// never through the write buffer: it must be on disk before any of the transaction's own
    /// buffered writes are.
    pub fn prepare_commit<IO: IoBackend>(
        &mut self,
        header: &mut crate::header::FileHeader,
        txn_io: &mut TransactionIo<IO>,
    ) -> Result<()> {
        self.all_record.upgrade()?;
        let triples: Vec<(Offset, &[u8])> = txn_io
            .originals()
            .iter()
            .map(|(&off, bytes)| (off, bytes.as_slice()))
            .collect();
        let start_len = txn_io.start_len();
        let io = txn_io.inner_mut();
        let area_off = Self::alloc_recovery_area(io, header, &triples)?;
        Self::write_recovery_record(io, area_off, start_len, &triples, magic::RECOVERY_INVALID)?;
        io.sync()?;
        Self::write_recovery_magic(io, area_off, magic::RECOVERY_VALID)?;
        io.sync()?;
        header.recovery = area_off;
        self.state = TransactionState::Prepared;
        Ok(())
    }

    /// Apply the buffered writes to the real file, sync, then invalidate the recovery record: from
    /// this point on a crash has nothing left to replay.
    pub fn commit<IO: IoBackend>(
        mut self,
        header: &mut crate::header::FileHeader,
        mut txn_io: TransactionIo<IO>,
    ) -> Result<()> {
        if !matches!(self.state, TransactionState::Prepared) {
            self.prepare_commit(header, &mut txn_io)?;
        }
        txn_io.flush_into()?;
        let recovery = header.recovery;
        let io = txn_io.inner_mut();
        io.sync()?;
        Self::write_recovery_magic(io, recovery, magic::RECOVERY_INVALID)?;
        io.sync()?;
        Ok(())
    }

    /// Discard every buffered write; the transaction never touched the real file, so there is
    /// nothing to undo beyond releasing the locks (handled by `Drop`).
    pub fn cancel(self) {}

    fn alloc_recovery_area<IO: IoBackend>(
        io: &mut IO,
        header: &mut crate::header::FileHeader,
        triples: &[(Offset, &[u8])],
    ) -> Result<Offset> {
        let needed = RecoveryHeader::SIZE as u64 + Self::triples_encoded_len(triples);
        if header.recovery != 0 {
            let existing = Self::read_recovery_header(io, header.recovery)?;
            if existing.max_len >= needed {
                return Ok(header.recovery);
            }
        }
        let off = io.len()?;
        io.ensure_capacity(off + needed)?;
        Ok(off)
    }

    fn triples_encoded_len(triples: &[(Offset, &[u8])]) -> u64 {
        triples.iter().map(|(_, b)| 8 + 8 + 4 + b.len() as u64).sum()
    }

    fn write_recovery_record<IO: IoBackend>(
        io: &mut IO,
        area_off: Offset,
        eof: u64,
        triples: &[(Offset, &[u8])],
        magic: u16,
    ) -> Result<()> {
        let hdr = RecoveryHeader {
            magic,
            max_len: RecoveryHeader::SIZE as u64 + Self::triples_encoded_len(triples),
            len: triples.len() as u64,
            eof,
        };
        io.write(area_off, &hdr.encode(io.endian()))?;
        let mut p = area_off + RecoveryHeader::SIZE as u64;
        for &(off, bytes) in triples {
            let crc = CRC.checksum(bytes);
            io.write(p, &io.endian().enc_u64(off))?;
            p += 8;
            io.write(p, &io.endian().enc_u64(bytes.len() as u64))?;
            p += 8;
            io.write(p, &crc.to_le_bytes())?;
            p += 4;
            io.write(p, bytes)?;
            p += bytes.len() as u64;
        }
        Ok(())
    }

    fn write_recovery_magic<IO: IoBackend>(io: &mut IO, area_off: Offset, magic: u16) -> Result<()> {
        io.write(area_off, &io.endian().enc_u64(magic as u64))
    }

    fn read_recovery_header<IO: IoBackend>(io: &mut IO, area_off: Offset) -> Result<RecoveryHeader> {
        let buf = io.read(area_off, RecoveryHeader::SIZE)?;
        let mut arr = [0u8; RecoveryHeader::SIZE];
        arr.copy_from_slice(&buf);
        Ok(RecoveryHeader::decode(arr, io.endian()))
    }
}

/// Called once, right after a fresh file header has been read at `open()`: if the recovery area's
/// magic is the "valid" marker, a commit was interrupted between its two fsyncs. Replay every
/// (offset, length, bytes) triple back into the file, truncate to the recorded `eof`, fsync,
/// invalidate the magic, fsync again, and only then let `open()` proceed.
pub fn recover_if_needed<IO: IoBackend>(
    io: &mut IO,
    header: &mut crate::header::FileHeader,
    locker: &Arc<Locker>,
) -> Result<bool> {
    if header.recovery == 0 {
        return Ok(false);
    }
    let magic_word = io.read_off(header.recovery)?;
    if magic_word as u16 != magic::RECOVERY_VALID {
        return Ok(false);
    }
    let _lock = locker.lock_all_record(LockKind::Write, false)?;
    let hdr_buf = io.read(header.recovery, RecoveryHeader::SIZE)?;
    let mut arr = [0u8; RecoveryHeader::SIZE];
    arr.copy_from_slice(&hdr_buf);
    let rhdr = RecoveryHeader::decode(arr, io.endian());
    let mut p = header.recovery + RecoveryHeader::SIZE as u64;
    for _ in 0..rhdr.len {
        let off = io.read_off(p)?;
        p += 8;
        let len = io.read_off(p)?;
        p += 8;
        let crc_buf = io.read(p, 4)?;
        let mut crc_arr = [0u8; 4];
        crc_arr.copy_from_slice(&crc_buf);
        let stored_crc = u32::from_le_bytes(crc_arr);
        p += 4;
        let bytes = io.read(p, len as usize)?;
        p += len;
        if CRC.checksum(&bytes) != stored_crc {
            return Err(Error::corrupt("recovery triple failed CRC check; refusing to replay"));
        }
        io.write(off, &bytes)?;
    }
    io.truncate(rhdr.eof)?;
    io.sync()?;
    Transaction::write_recovery_magic(io, header.recovery, magic::RECOVERY_INVALID)?;
    io.sync()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Endian;
    use crate::io::mapping::DirectIo;

    fn scratch() -> DirectIo {
        let mut f = tempfile::tempfile().unwrap();
        use std::io::Write;
        f.write_all(&[0xAAu8; 256]).unwrap();
        DirectIo::new(f, Endian::Native, false).unwrap()
    }

    #[test]
    fn writes_are_invisible_until_flushed() {
        let mut io = scratch();
        {
            let mut txn_io = TransactionIo::new(&mut io).unwrap();
            txn_io.write(10, b"hello").unwrap();
            assert_eq!(txn_io.read(10, 5).unwrap(), b"hello");
        }
        // the real file never saw the write
        assert_eq!(&io.read(10, 5).unwrap(), &[0xAA; 5]);
    }

    #[test]
    fn original_bytes_are_captured_once() {
        let mut io = scratch();
        let mut txn_io = TransactionIo::new(&mut io).unwrap();
        txn_io.write(10, b"hello").unwrap();
        txn_io.write(10, b"world").unwrap();
        assert_eq!(txn_io.originals().get(&10).unwrap(), &vec![0xAA; 5]);
    }

    #[test]
    fn flush_applies_writes_to_inner() {
        let mut io = scratch();
        {
            let mut txn_io = TransactionIo::new(&mut io).unwrap();
            txn_io.write(10, b"hello").unwrap();
            txn_io.flush_into().unwrap();
        }
        assert_eq!(&io.read(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn read_merges_overlay_with_underlying_bytes() {
        let mut io = scratch();
        let mut txn_io = TransactionIo::new(&mut io).unwrap();
        txn_io.write(10, b"AB").unwrap();
        let merged = txn_io.read(9, 4).unwrap();
        assert_eq!(merged, vec![0xAA, b'A', b'B', 0xAA]);
    }
}
