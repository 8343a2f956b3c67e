// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! TREL: Thread frames encapsulated in UDP over an infrastructure link.
//!
//! The platform owns the UDP socket and peer discovery (DNS-SD); the stack
//! hands it datagrams addressed by the peer's extended address. TREL uses a
//! deferred acknowledgement model: the outcome of a send arrives later
//! through the stack's deferred-ack entry point, not through this trait.

use crate::ErrorCode;

pub trait TrelSender {
    /// Send `frame` to the peer with this extended address.
    fn send(&self, peer: &[u8; 8], frame: &[u8]) -> Result<(), ErrorCode>;
}
