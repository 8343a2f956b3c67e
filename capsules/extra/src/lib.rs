// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The mesh networking stack: the IEEE 802.15.4 MAC sublayer and the
//! Thread-style network layer built on top of it.

#![forbid(unsafe_code)]
#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate capsules_core;

pub mod ieee802154;
pub mod net;
pub mod settings;
pub mod symmetric_encryption;
pub mod test;
