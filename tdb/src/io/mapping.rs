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

//! Direct, un-buffered access to the file: through a memory mapping when one is valid, or through
//! `pread`/`pwrite`-equivalent positioned IO (`FileExt::read_at`/`write_at`) when the database was
//! opened with [`crate::attrs::OpenFlags::NOMMAP`] or on a platform where mapping the file isn't
//! desirable.
//!
//! Every out-of-bounds access grows the file first (`ensure_capacity`), which on a mapped file
//! means dropping and remaking the mapping — so nothing above this layer may hold a borrow into the
//! old mapping across a write; [`read`]/[`write`] always return/take owned `Vec<u8>` copies rather
//! than a slice, exactly so that a remap can never dangle a caller's reference.

use super::IoBackend;
use crate::error::{Error, Result};
use crate::header::{Endian, Offset};
use memmap2::MmapMut;
use std::fs::File;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

pub struct DirectIo {
    file: File,
    endian: Endian,
    nommap: bool,
    /// set from [`crate::attrs::OpenFlags::NOSYNC`]: [`IoBackend::sync`] becomes a no-op. Trades
    /// the crash-safety guarantee in §5 for speed; a caller that sets this is promising it doesn't
    /// need commits to survive a crash.
    nosync: bool,
    mmap: Option<MmapMut>,
    len: u64,
}

impl DirectIo {
    pub fn new(file: File, endian: Endian, nommap: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        let mut slf = Self {
            file,
            endian,
            nommap,
            nosync: false,
            mmap: None,
            len,
        };
        if len > 0 {
            slf.remap()?;
        }
        Ok(slf)
    }

    pub fn set_nosync(&mut self, nosync: bool) {
        self.nosync = nosync;
    }

    fn remap(&mut self) -> Result<()> {
        if self.nommap {
            return Ok(());
        }
        if self.len == 0 {
            self.mmap = None;
            return Ok(());
        }
        // SAFETY: the file is exclusively owned by this `DirectIo` for its lifetime (no other
        // in-process writer touches the descriptor; cross-process writers are coordinated by the
        // locking layer, which is the same tradeoff every mmap-backed store in this position makes)
        let mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    fn check_bounds(&self, off: Offset, len: usize) -> Result<()> {
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| Error::corrupt("offset overflow"))?;
        if end > self.len {
            return Err(Error::corrupt(format!(
                "access [{off}, {end}) out of bounds of {}-byte file",
                self.len
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn pread(&self, off: Offset, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    #[cfg(not(unix))]
    fn pwrite(&self, off: Offset, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(off))?;
        retry_write_all(&mut f, data)
    }
}

/// Retry a write that was interrupted by a signal (`EINTR`) indefinitely; any other short write is
/// fatal, matching the source's "partial writes due to signals are retried; short writes after
/// retries are fatal" guarantee.
#[cfg(not(unix))]
fn retry_write_all<W: std::io::Write>(w: &mut W, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match w.write(data) {
            Ok(0) => return Err(Error::Io(std::io::ErrorKind::WriteZero.into())),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl IoBackend for DirectIo {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn len(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn ensure_capacity(&mut self, min_len: u64) -> Result<()> {
        if min_len <= self.len {
            return Ok(());
        }
        self.file.set_len(min_len)?;
        self.len = min_len;
        self.remap()
    }

    fn read(&mut self, off: Offset, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(off, len)?;
        if let Some(mmap) = &self.mmap {
            let start = off as usize;
            Ok(mmap[start..start + len].to_vec())
        } else {
            #[cfg(unix)]
            {
                let mut buf = vec![0u8; len];
                self.file.read_exact_at(&mut buf, off)?;
                Ok(buf)
            }
            #[cfg(not(unix))]
            {
                self.pread(off, len)
            }
        }
    }

    fn write(&mut self, off: Offset, data: &[u8]) -> Result<()> {
        let end = off
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::corrupt("offset overflow"))?;
        if end > self.len {
            self.ensure_capacity(end)?;
        }
        if let Some(mmap) = &mut self.mmap {
            let start = off as usize;
            mmap[start..start + data.len()].copy_from_slice(data);
            Ok(())
        } else {
            #[cfg(unix)]
            {
                self.file.write_all_at(data, off)?;
                Ok(())
            }
            #[cfg(not(unix))]
            {
                self.pwrite(off, data)
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        if self.nosync {
            return Ok(());
        }
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        self.remap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn scratch_file() -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn grow_and_write_read_roundtrip() {
        let f = scratch_file();
        let mut io = DirectIo::new(f, Endian::Native, false).unwrap();
        io.write(100, b"hello").unwrap();
        assert!(io.len().unwrap() >= 105);
        let got = io.read(100, 5).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn out_of_bounds_read_is_corrupt() {
        let f = scratch_file();
        let mut io = DirectIo::new(f, Endian::Native, false).unwrap();
        assert!(io.read(1_000_000, 8).is_err());
    }

    #[test]
    fn nommap_path_roundtrips_too() {
        let f = scratch_file();
        let mut io = DirectIo::new(f, Endian::Native, true).unwrap();
        io.write(10, b"abcd").unwrap();
        assert_eq!(io.read(10, 4).unwrap(), b"abcd");
    }

    #[test]
    fn offset_roundtrip() {
        let f = scratch_file();
        let mut io = DirectIo::new(f, Endian::Native, false).unwrap();
        io.write_off(0, 0xDEAD_BEEF_CAFE_0001).unwrap();
        assert_eq!(io.read_off(0).unwrap(), 0xDEAD_BEEF_CAFE_0001);
    }
}
