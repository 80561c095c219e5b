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

//! # Open-time configuration
//!
//! [`OpenFlags`] picks the access mode and on-disk representation; [`Attributes`] carries the
//! optional overrides (hash function, seed, logging/statistics sinks) a caller may want at
//! `Database::open` time. There is no config *file* here — no network surface means nothing to
//! deserialize — but the role `Attributes` plays (ambient, open-time configuration) is the same one
//! a `serde`-backed config struct plays elsewhere in this codebase.

use crate::error::Error;

/// A tiny hand-rolled bitflags-alike; the source reaches for the `bitflags` crate on larger
/// flag sets elsewhere in the corpus, but a 7-flag `u32` newtype doesn't earn a new dependency here
macro_rules! bitflags_lite {
    ($(#[$meta:meta])* pub struct $name:ident: $repr:ty { $(const $flag:ident = $val:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($repr);
        impl $name {
            $(pub const $flag: Self = Self($val);)*
            pub const fn empty() -> Self { Self(0) }
            pub const fn bits(self) -> $repr { self.0 }
            pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
        }
        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
        }
        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0; }
        }
    };
}

bitflags_lite! {
    pub struct OpenFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const CREATE  = 1 << 2;
        const CONVERT = 1 << 3;
        const NOMMAP  = 1 << 4;
        const NOLOCK  = 1 << 5;
        const NOSYNC  = 1 << 6;
    }
}

impl OpenFlags {
    pub fn is_readonly(self) -> bool {
        !self.contains(Self::WRITE)
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ | Self::WRITE | Self::CREATE
    }
}

/// A custom hash function, in case a caller wants something other than the built-in
/// [`crate::hash::jenkins_hash64`] (e.g. to reproduce a file written by the reference
/// implementation's hash choice)
pub type HashFn = fn(seed: u64, key: &[u8]) -> u64;

/// A logging sink: called with a human-readable message and the [`crate::error::Severity`] it was
/// reported at. Defaults to routing through the `log` crate (see [`Error::report`])
pub type LogSink = std::sync::Arc<dyn Fn(crate::error::Severity, &str) + Send + Sync>;

/// A statistics sink: called after every public operation with its name and elapsed time
pub type StatsSink = std::sync::Arc<dyn Fn(&str, std::time::Duration) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Attributes {
    pub hash_fn: Option<HashFn>,
    pub hash_seed: Option<u64>,
    pub log: Option<LogSink>,
    pub stats: Option<StatsSink>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_hash_fn(mut self, f: HashFn) -> Self {
        self.hash_fn = Some(f);
        self
    }
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = Some(seed);
        self
    }
    pub fn with_log(mut self, sink: LogSink) -> Self {
        self.log = Some(sink);
        self
    }
    pub fn with_stats(mut self, sink: StatsSink) -> Self {
        self.stats = Some(sink);
        self
    }
    /// Report an error through whichever sink is configured, then hand it back to the caller
    pub fn report(&self, e: Error) -> Error {
        match &self.log {
            Some(sink) => {
                sink(e.severity(), &e.to_string());
                e
            }
            None => e.report(),
        }
    }
    pub fn record_stat(&self, op: &str, elapsed: std::time::Duration) {
        if let Some(sink) = &self.stats {
            sink(op, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_are_rw_create() {
        let f = OpenFlags::default();
        assert!(f.contains(OpenFlags::READ));
        assert!(f.contains(OpenFlags::WRITE));
        assert!(f.contains(OpenFlags::CREATE));
        assert!(!f.is_readonly());
    }

    #[test]
    fn readonly_flags() {
        let f = OpenFlags::READ;
        assert!(f.is_readonly());
    }
}
