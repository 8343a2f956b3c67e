// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Support crate for the mesh networking stack.
//!
//! Provides the pieces every capsule is written against: the shared
//! [`ErrorCode`] taxonomy, the hardware interface layer traits consumed by the
//! stack ([`hil`]), interior-mutability cells ([`utilities::cells`]), intrusive
//! collections, the deferred-call (tasklet) queue, and the `debug!` diagnostic
//! macro.
//!
//! The stack is single-threaded and cooperative: all state is owned by one
//! logical task, every callback runs to completion, and interrupt context is
//! only ever allowed to enqueue work for the main loop. Nothing in this crate
//! is interrupt-safe by itself.

#![no_std]

pub mod collections;
#[macro_use]
pub mod debug;
pub mod deferred_call;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use errorcode::ErrorCode;
