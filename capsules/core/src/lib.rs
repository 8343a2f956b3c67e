// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Infrastructure capsules shared by the rest of the stack: the byte-stream
//! codec used for every wire format and the alarm virtualizer that turns the
//! single platform alarm into the stack's timer wheel.

#![forbid(unsafe_code)]
#![no_std]

#[macro_use]
pub mod stream;

pub mod test;
pub mod virtualizers;
