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

//! # Open-handle registry
//!
//! A process that opens the same `(device, inode)` twice, through two independent handles, would
//! end up with two in-process lock tables racing each other for locks the kernel thinks are already
//! held by "itself" — `fcntl` locks are per-process, not per-handle. This registry makes a second
//! independent open of a file already open in this process fail fast instead.

use crate::error::Error;
use std::collections::HashSet;

lazy_static::lazy_static! {
    static ref OPEN_HANDLES: parking_lot::Mutex<HashSet<(u64, u64)>> =
        parking_lot::Mutex::new(HashSet::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(file: &std::fs::File) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let md = file.metadata()?;
        Ok(Self {
            device: md.dev(),
            inode: md.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(file: &std::fs::File) -> std::io::Result<Self> {
        // no stable (dev, inode) pair off-unix; fall back to a per-process unique counter so the
        // registry still rejects a literal double-register, even though it can't detect aliasing
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let _ = file;
        Ok(Self {
            device: 0,
            inode: COUNTER.fetch_add(1, Ordering::Relaxed),
        })
    }
}

/// RAII registration: removes itself from the registry on drop (including on an early return from
/// `Database::open`), mirroring the source's `close()`-or-`Drop` symmetry.
pub struct HandleGuard {
    id: FileIdentity,
}

impl HandleGuard {
    pub fn register(id: FileIdentity) -> crate::error::Result<Self> {
        let mut set = OPEN_HANDLES.lock();
        if !set.insert((id.device, id.inode)) {
            return Err(Error::einval(
                "file is already open by another handle in this process",
            ));
        }
        Ok(Self { id })
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        OPEN_HANDLES.lock().remove(&(self.id.device, self.id.inode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_register_fails() {
        let id = FileIdentity {
            device: 999,
            inode: 12345,
        };
        let g1 = HandleGuard::register(id).unwrap();
        let g2 = HandleGuard::register(id);
        assert!(g2.is_err());
        drop(g1);
        let g3 = HandleGuard::register(id).unwrap();
        drop(g3);
    }
}
