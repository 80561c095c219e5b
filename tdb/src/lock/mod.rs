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

//! # Byte-range record locking
//!
//! Maps the logical lock targets a caller actually wants ("the hash range this key falls in",
//! "the expansion lock", "free bucket 12") onto `fcntl` byte-range locks over the database file.
//! A kernel advisory lock is a property of the *process*, not of any particular handle or thread
//! within it, and it does not nest — two `F_SETLK` calls for the same range from the same process
//! succeed independently of each other and a single `F_UNLCK` drops both. [`LockTable`] is the
//! in-process bookkeeping that makes nesting actually work: callers take a [`LockGuard`], the table
//! reference-counts identical `(offset, len)` requests, and only the outermost acquire/innermost
//! release ever touches the kernel.

mod raw;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub use raw::RawLock;

/// Base offset of the singleton locks, matching the order they're listed in the data model
const OPEN_OFFSET: u64 = 0;
const TRANSACTION_OFFSET: u64 = 1;
const EXPANSION_OFFSET: u64 = 2;
const HASH_BASE_OFFSET: u64 = 3;
/// `2^30`: one logical byte per top-level hash group, so the whole range can be locked in one
/// `fcntl` call as "all hash locks"
const HASH_RANGE_LEN: u64 = 1 << 30;
const FREE_BASE_OFFSET: u64 = HASH_BASE_OFFSET + HASH_RANGE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// A logical thing this engine can lock. Each variant maps to a contiguous `(offset, len)` range
/// in the file, per the layout table in the data model; none of these ranges ever hold actual file
/// data, they exist purely as `fcntl` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    Open,
    Transaction,
    Expansion,
    /// One of the 1024 top-level hash groups
    HashGroup(u32),
    /// The entire hash range at once (used by the all-record lock and by expansion)
    AllHash,
    /// One of the 56 free-list buckets
    FreeBucket(u8),
}

impl LockTarget {
    fn range(self) -> (u64, u64) {
        match self {
            Self::Open => (OPEN_OFFSET, 1),
            Self::Transaction => (TRANSACTION_OFFSET, 1),
            Self::Expansion => (EXPANSION_OFFSET, 1),
            Self::HashGroup(g) => {
                debug_assert!((g as usize) < crate::header::TOP_HASHTABLE_LEN);
                (HASH_BASE_OFFSET + g as u64, 1)
            }
            Self::AllHash => (HASH_BASE_OFFSET, HASH_RANGE_LEN),
            Self::FreeBucket(b) => {
                debug_assert!((b as usize) < crate::header::FREE_BUCKETS);
                (FREE_BASE_OFFSET + (b as u64) / 8, 1)
            }
        }
    }
}

struct Entry {
    kind: LockKind,
    refcount: u32,
}

/// Per-handle nesting table: tracks how many outstanding [`LockGuard`]s refer to each kernel range
/// this handle holds, plus the handful of "is some *other* kind of lock currently held" flags the
/// locking rules need (requesting a hash lock while holding free/expansion is an error).
struct LockTable {
    held: HashMap<(u64, u64), Entry>,
    free_held: u32,
    expansion_held: u32,
}

impl LockTable {
    fn new() -> Self {
        Self {
            held: HashMap::new(),
            free_held: 0,
            expansion_held: 0,
        }
    }
}

/// Owns the raw file descriptor used for `fcntl` calls and the in-process nesting table. One
/// `Locker` per open `Database` handle.
pub struct Locker {
    raw: RawLock,
    readonly: bool,
    /// set when the database was opened with [`crate::attrs::OpenFlags::NOLOCK`]: every lock
    /// request still runs through the in-process nesting table (so the rest of the engine doesn't
    /// need to know the difference) but never reaches the kernel. Only sound for a database a
    /// caller has promised no other process/handle touches concurrently.
    noop: bool,
    table: Mutex<LockTable>,
}

impl Locker {
    pub fn new(raw: RawLock, readonly: bool) -> Self {
        Self {
            raw,
            readonly,
            noop: false,
            table: Mutex::new(LockTable::new()),
        }
    }

    pub fn new_unlocked(raw: RawLock, readonly: bool) -> Self {
        Self {
            raw,
            readonly,
            noop: true,
            table: Mutex::new(LockTable::new()),
        }
    }

    /// Acquire a single, non-subdivided lock target (anything but [`LockTarget::AllHash`] under
    /// contention; `AllHash` goes through [`Locker::lock_all_record`] instead).
    pub fn lock(self: &Arc<Self>, target: LockTarget, kind: LockKind, wait: bool) -> Result<LockGuard> {
        if kind == LockKind::Write && self.readonly {
            return Err(Error::RdOnly);
        }
        self.guard_nesting_rules(target)?;
        let (off, len) = target.range();
        self.acquire_range(off, len, kind, wait)?;
        Ok(LockGuard {
            locker: self.clone(),
            target,
            ranges: vec![(off, len)],
        })
    }

    /// Requesting a hash lock while holding a free-bucket or expansion lock is a deadlock risk
    /// against the allocator/expander and is rejected outright (see the locking rules in the data
    /// model). `FreeBucket` itself is intentionally exempted: a free-bucket lock while holding the
    /// expansion lock remains permitted, matching the permissive behavior this engine preserves.
    fn guard_nesting_rules(&self, target: LockTarget) -> Result<()> {
        if matches!(target, LockTarget::HashGroup(_) | LockTarget::AllHash) {
            let t = self.table.lock();
            if t.free_held > 0 || t.expansion_held > 0 {
                return Err(Error::lock(
                    "cannot take a hash lock while holding a free-bucket or expansion lock",
                ));
            }
        }
        Ok(())
    }

    fn acquire_range(&self, off: u64, len: u64, kind: LockKind, wait: bool) -> Result<()> {
        let mut t = self.table.lock();
        if let Some(entry) = t.held.get_mut(&(off, len)) {
            if entry.kind != kind && kind == LockKind::Write {
                // a nested upgrade request: re-take at the kernel level as write, in place
                if !self.noop {
                    self.raw.set_lock(off, len, kind, wait)?;
                }
                entry.kind = kind;
            }
            entry.refcount += 1;
        } else {
            drop(t);
            if !self.noop {
                self.raw.set_lock(off, len, kind, wait)?;
            }
            t = self.table.lock();
            t.held.insert((off, len), Entry { kind, refcount: 1 });
        }
        self.bump_flags(off, len, 1);
        Ok(())
    }

    fn release_range(&self, off: u64, len: u64) {
        let mut t = self.table.lock();
        let done = if let Some(entry) = t.held.get_mut(&(off, len)) {
            entry.refcount -= 1;
            entry.refcount == 0
        } else {
            false
        };
        if done {
            t.held.remove(&(off, len));
            drop(t);
            if !self.noop {
                // best-effort: a failed unlock here means the fd is already gone (e.g. process
                // exit race); there is nothing a Drop impl can usefully do about it
                let _ = self.raw.unlock(off, len);
            }
        }
        self.bump_flags(off, len, -1);
    }

    fn bump_flags(&self, off: u64, len: u64, delta: i32) {
        let mut t = self.table.lock();
        if off == EXPANSION_OFFSET && len == 1 {
            t.expansion_held = (t.expansion_held as i32 + delta).max(0) as u32;
        } else if off >= FREE_BASE_OFFSET {
            t.free_held = (t.free_held as i32 + delta).max(0) as u32;
        }
    }

    /// Binary-subdivision gradual acquisition of the all-record lock: try the whole hash range
    /// non-blocking first; on contention, split in half and recurse into each half so a single
    /// contended byte never stalls acquisition of the rest of the range.
    pub fn lock_all_record(self: &Arc<Self>, kind: LockKind, upgradable: bool) -> Result<LockGuard> {
        if kind == LockKind::Write && self.readonly {
            return Err(Error::RdOnly);
        }
        let effective_kind = if upgradable { LockKind::Write } else { kind };
        let mut ranges = Vec::new();
        self.subdivide_acquire(HASH_BASE_OFFSET, HASH_RANGE_LEN, effective_kind, &mut ranges)?;
        Ok(LockGuard {
            locker: self.clone(),
            target: LockTarget::AllHash,
            ranges,
        })
    }

    fn subdivide_acquire(
        &self,
        off: u64,
        len: u64,
        kind: LockKind,
        acquired: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        match self.acquire_range(off, len, kind, false) {
            Ok(()) => {
                acquired.push((off, len));
                Ok(())
            }
            Err(Error::Lock(_)) if len > 1 => {
                let half = len / 2;
                self.subdivide_acquire(off, half, kind, acquired)?;
                self.subdivide_acquire(off + half, len - half, kind, acquired)
            }
            Err(e) => Err(e),
        }
    }

    /// Upgrade an all-record read lock (acquired as `upgradable`) to a write lock. Some kernels
    /// spuriously report `EDEADLK` on a same-process read-to-write upgrade; retried up to 1000
    /// times with a 1 microsecond sleep between attempts before giving up.
    pub fn upgrade(&self, ranges: &[(u64, u64)]) -> Result<()> {
        for &(off, len) in ranges {
            if !self.noop {
                let mut attempts = 0;
                loop {
                    match self.raw.set_lock(off, len, LockKind::Write, false) {
                        Ok(()) => break,
                        Err(Error::Lock(_)) if attempts < 1000 => {
                            attempts += 1;
                            std::thread::sleep(std::time::Duration::from_micros(1));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            let mut t = self.table.lock();
            if let Some(entry) = t.held.get_mut(&(off, len)) {
                entry.kind = LockKind::Write;
            }
        }
        Ok(())
    }
}

/// RAII guard: releases every range it acquired (one for a simple lock, possibly many for a
/// subdivided all-record lock) on drop.
pub struct LockGuard {
    locker: Arc<Locker>,
    target: LockTarget,
    ranges: Vec<(u64, u64)>,
}

impl LockGuard {
    pub fn target(&self) -> LockTarget {
        self.target
    }

    pub fn upgrade(&self) -> Result<()> {
        self.locker.upgrade(&self.ranges)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for &(off, len) in &self.ranges {
            self.locker.release_range(off, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ranges_match_layout_table() {
        assert_eq!(LockTarget::Open.range(), (0, 1));
        assert_eq!(LockTarget::Transaction.range(), (1, 1));
        assert_eq!(LockTarget::Expansion.range(), (2, 1));
        assert_eq!(LockTarget::HashGroup(0).range(), (3, 1));
        assert_eq!(LockTarget::AllHash.range(), (3, 1 << 30));
        assert_eq!(LockTarget::FreeBucket(0).range(), (3 + (1 << 30), 1));
    }

    #[test]
    fn nested_lock_on_same_handle_shares_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let raw = RawLock::open(&path).unwrap();
        let locker = Arc::new(Locker::new(raw, false));
        let g1 = locker.lock(LockTarget::Open, LockKind::Write, true).unwrap();
        let g2 = locker.lock(LockTarget::Open, LockKind::Write, true).unwrap();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn hash_lock_while_holding_free_lock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let raw = RawLock::open(&path).unwrap();
        let locker = Arc::new(Locker::new(raw, false));
        let _free = locker
            .lock(LockTarget::FreeBucket(3), LockKind::Write, true)
            .unwrap();
        let hash = locker.lock(LockTarget::HashGroup(5), LockKind::Write, true);
        assert!(hash.is_err());
    }

    #[test]
    fn write_lock_on_readonly_handle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let raw = RawLock::open(&path).unwrap();
        let locker = Arc::new(Locker::new(raw, true));
        assert!(matches!(
            locker.lock(LockTarget::Open, LockKind::Write, true),
            Err(Error::RdOnly)
        ));
    }
}
