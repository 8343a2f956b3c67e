// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Randomness sources.

use crate::ErrorCode;

/// Platform randomness.
///
/// `get_u32` is the fast non-cryptographic source used for CSMA backoff and
/// protocol jitter; `get_bytes` must be backed by a CSPRNG and is reserved
/// for key material and challenges.
pub trait Rng {
    fn get_u32(&self) -> u32;

    fn get_bytes(&self, buf: &mut [u8]) -> Result<(), ErrorCode>;
}
