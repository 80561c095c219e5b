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

//! # Error taxonomy
//!
//! Every fallible call in this crate returns [`Result<T>`]. An [`Error`] always carries a
//! [`Severity`] so that it can be routed to whatever logging sink the caller configured via
//! [`crate::attrs::Attributes`] before it is returned up the stack.

use core::fmt;
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// How seriously a given [`Error`] should be taken by whatever is watching the log sink
pub enum Severity {
    /// Purely informational; emitted on the hot path for tracing only
    Trace,
    /// Something unusual happened but the operation can still proceed
    Warning,
    /// The operation failed, but the database is left in a consistent state
    Error,
    /// An invariant was violated. The database may be in an inconsistent state; in debug builds
    /// this additionally asserts
    Fatal,
}

#[derive(Debug)]
/// The kinds of failure this engine can report. Mirrors the source's `NO_ERROR`/`CORRUPT`/`IO`/
/// `LOCK`/`OOM`/`EXISTS`/`NOEXIST`/`EINVAL`/`RDONLY`/`NESTING` taxonomy one-to-one (`NO_ERROR` has
/// no variant here: success is simply `Ok(_)`)
pub enum Error {
    /// A format violation was detected while reading the file
    Corrupt(String),
    /// An underlying syscall failed
    Io(io::Error),
    /// Lock contention, or an attempt to acquire a lock in a way that would deadlock
    Lock(String),
    /// The allocator exhausted the file and a growth attempt failed, or a heap allocation failed
    Oom,
    /// `StoreMode::Insert` on a key that already exists
    Exists,
    /// `StoreMode::Modify`/`delete`/`fetch` on a key that doesn't exist
    NoExist,
    /// A caller-supplied argument is invalid (e.g. a double `open` of the same file in-process)
    EInval(String),
    /// A write was attempted against a database opened read-only
    RdOnly,
    /// Inconsistent or double-held lock nesting was detected
    Nesting(String),
}

impl Error {
    /// The severity this error is reported at when no context overrides it
    pub fn severity(&self) -> Severity {
        match self {
            Error::Corrupt(_) => Severity::Error,
            Error::Io(_) => Severity::Error,
            Error::Lock(_) => Severity::Warning,
            Error::Oom => Severity::Error,
            Error::Exists | Error::NoExist => Severity::Trace,
            Error::EInval(_) => Severity::Warning,
            Error::RdOnly => Severity::Warning,
            Error::Nesting(_) => Severity::Fatal,
        }
    }
    /// Log this error through the `log` crate at the level matching its severity, then return it.
    /// This is the default sink; callers that supplied `Attributes::log` get routed there instead
    /// (see [`crate::attrs::Attributes::report`]).
    pub fn report(self) -> Self {
        match self.severity() {
            Severity::Trace => log::trace!("{self}"),
            Severity::Warning => log::warn!("{self}"),
            Severity::Error => log::error!("{self}"),
            Severity::Fatal => {
                log::error!("fatal: {self}");
                debug_assert!(false, "fatal engine invariant violated: {self}");
            }
        }
        self
    }
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }
    pub fn einval(msg: impl Into<String>) -> Self {
        Self::EInval(msg.into())
    }
    pub fn nesting(msg: impl Into<String>) -> Self {
        Self::Nesting(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(m) => write!(f, "corrupt: {m}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Lock(m) => write!(f, "lock error: {m}"),
            Self::Oom => write!(f, "out of memory/space"),
            Self::Exists => write!(f, "key already exists"),
            Self::NoExist => write!(f, "key does not exist"),
            Self::EInval(m) => write!(f, "invalid argument: {m}"),
            Self::RdOnly => write!(f, "database is read-only"),
            Self::Nesting(m) => write!(f, "lock nesting violation: {m}"),
        }
    }
}

impl std::error::Error for Error {}
