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

//! # IO / mapping layer
//!
//! [`IoBackend`] is the seam a transaction installs itself at: [`mapping::DirectIo`] touches the
//! file/mapping immediately, while [`crate::txn::TransactionIo`] buffers writes and snapshots
//! originals first. Everything above this module (locking, the allocator, the hash index) is
//! written against the trait, not against either concrete type, so the same call sites work whether
//! or not a transaction is open.

pub mod mapping;

use crate::error::Result;
use crate::header::{Endian, Offset};

pub trait IoBackend {
    fn endian(&self) -> Endian;
    /// Current logical length of the file
    fn len(&self) -> Result<u64>;
    /// Ensure the file is at least `min_len` bytes, growing (and remapping) if necessary
    fn ensure_capacity(&mut self, min_len: u64) -> Result<()>;
    fn read(&mut self, off: Offset, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, off: Offset, data: &[u8]) -> Result<()>;
    fn zero(&mut self, off: Offset, len: usize) -> Result<()> {
        self.write(off, &vec![0u8; len])
    }
    fn read_off(&mut self, off: Offset) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.read(off, 8)?);
        Ok(self.endian().dec_u64(b))
    }
    fn write_off(&mut self, off: Offset, value: u64) -> Result<()> {
        self.write(off, &self.endian().enc_u64(value))
    }
    /// Durably commit everything written so far (no-op for a transaction's local buffer; real for
    /// direct IO, which calls `fsync`)
    fn sync(&mut self) -> Result<()>;
    /// Truncate the file down to `len` (only ever used by recovery replay, never by normal
    /// operation — the file may grow, but application code never shrinks it)
    fn truncate(&mut self, len: u64) -> Result<()>;
}
