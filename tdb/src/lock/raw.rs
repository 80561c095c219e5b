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

//! Thin wrapper around `fcntl(F_SETLK/F_SETLKW)` byte-range advisory locking. One [`RawLock`] per
//! open database file; everything above this module only ever asks it for a `(offset, len, kind)`
//! and gets back success, `Error::Lock` (contention, non-blocking path), or `Error::Io`.

use super::LockKind;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct RawLock {
    file: File,
}

impl RawLock {
    /// Open (creating if necessary) the file that locks will be taken against
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn from_file(file: &File) -> Result<Self> {
        Ok(Self {
            file: file.try_clone()?,
        })
    }

    /// Every `fcntl` call below retries indefinitely on `EINTR` (a lock wait interrupted by a
    /// signal is not contention, and not an error worth surfacing), matching §5's "the engine
    /// retries `EINTR` indefinitely".
    #[cfg(unix)]
    pub fn set_lock(&self, off: u64, len: u64, kind: LockKind, wait: bool) -> Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = match kind {
            LockKind::Read => libc::F_RDLCK as i16,
            LockKind::Write => libc::F_WRLCK as i16,
        };
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = off as libc::off_t;
        fl.l_len = len as libc::off_t;
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &mut fl as *mut libc::flock) };
            if rc != -1 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EACCES) | Some(libc::EAGAIN) => {
                    return Err(Error::lock(format!("range [{off}, {}) is held: {err}", off + len)))
                }
                _ => return Err(Error::Io(err)),
            };
        }
    }

    #[cfg(unix)]
    pub fn unlock(&self, off: u64, len: u64) -> Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = off as libc::off_t;
        fl.l_len = len as libc::off_t;
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &mut fl as *mut libc::flock) };
            if rc != -1 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(err));
        }
    }

    #[cfg(not(unix))]
    pub fn set_lock(&self, _off: u64, _len: u64, _kind: LockKind, _wait: bool) -> Result<()> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "byte-range file locking is unix-only in this build",
        )))
    }

    #[cfg(not(unix))]
    pub fn unlock(&self, _off: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn same_process_relock_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let raw = RawLock::open(&path).unwrap();
        raw.set_lock(0, 1, LockKind::Write, true).unwrap();
        // fcntl locks don't nest: a second F_SETLK for the same range from the same process
        // succeeds outright, which is exactly why the in-process LockTable exists above this layer
        raw.set_lock(0, 1, LockKind::Write, true).unwrap();
        raw.unlock(0, 1).unwrap();
    }
}
