// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Keyed non-volatile record storage.
//!
//! The platform persists small byte records under `u16` keys. A key may hold
//! several records (a list); `index` selects among them. The settings capsule
//! layers typed records and save coalescing on top of this interface.

use crate::ErrorCode;

pub trait SettingsStore {
    /// Read record `index` under `key` into `buf`, returning its length.
    ///
    /// Returns `NOTFOUND` when the key or index does not exist and `NOMEM`
    /// when `buf` is too small (the record is not partially copied).
    fn get(&self, key: u16, index: usize, buf: &mut [u8]) -> Result<usize, ErrorCode>;

    /// Replace all records under `key` with a single record.
    fn set(&self, key: u16, value: &[u8]) -> Result<(), ErrorCode>;

    /// Append a record under `key`.
    fn add(&self, key: u16, value: &[u8]) -> Result<(), ErrorCode>;

    /// Delete record `index` under `key`, or every record when `None`.
    fn delete(&self, key: u16, index: Option<usize>) -> Result<(), ErrorCode>;

    /// Delete everything.
    fn wipe(&self);
}
