// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! IEEE 802.15.4 MAC sublayer: CSMA/CA scheduling, acknowledgement and
//! retransmission, frame security, source-address matching and indirect
//! (polled) transmission.

pub mod device;
pub mod framer;
pub mod indirect;
pub mod mac;
pub mod source_match;
pub mod virtual_mac;
