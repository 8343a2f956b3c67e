// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface between the MAC sublayer and its users.
//!
//! A `MacDevice` prepares and sends frames in plaintext; header encoding and
//! the security procedures happen transparently below it (in the framer).

use crate::ieee802154::framer::Frame;
use crate::net::ieee802154::{Header, KeyId, MacAddress, PanID, SecurityLevel};
use kernel::ErrorCode;

pub trait MacDevice<'a> {
    fn set_transmit_client(&self, client: &'a dyn TxClient);
    fn set_receive_client(&self, client: &'a dyn RxClient);

    /// The short 16-bit address of the MAC device.
    fn get_address(&self) -> u16;
    /// The long 64-bit address (EUI-64) of the MAC device.
    fn get_address_long(&self) -> [u8; 8];
    /// The 16-bit PAN id of the MAC device.
    fn get_pan(&self) -> u16;
    /// The radio channel in use.
    fn get_channel(&self) -> u8;

    fn set_address(&self, addr: u16);
    fn set_address_long(&self, addr: [u8; 8]);
    fn set_pan(&self, id: u16);
    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode>;

    /// Push configuration changes down to the radio.
    fn config_commit(&self);

    fn is_on(&self) -> bool;

    /// Prepare a data frame, filling in the header and security parameters.
    /// The payload is appended with `Frame::append_payload` before
    /// `transmit`.
    fn prepare_data_frame(
        &self,
        buf: &'static mut [u8],
        dst_pan: PanID,
        dst_addr: MacAddress,
        src_pan: PanID,
        src_addr: MacAddress,
        security_needed: Option<(SecurityLevel, KeyId)>,
    ) -> Result<Frame, &'static mut [u8]>;

    /// Prepare a MAC command frame with the given command identifier.
    fn prepare_command_frame(
        &self,
        buf: &'static mut [u8],
        dst_pan: PanID,
        dst_addr: MacAddress,
        src_pan: PanID,
        src_addr: MacAddress,
        command_id: u8,
        security_needed: Option<(SecurityLevel, KeyId)>,
    ) -> Result<Frame, &'static mut [u8]>;

    /// Transmit a prepared frame, securing it first if requested.
    fn transmit(&self, frame: Frame) -> Result<(), (ErrorCode, &'static mut [u8])>;
}

/// Receiver duty-cycle control, used by the network layer to keep a sleepy
/// device's radio on only around its polls.
pub trait LinkController {
    fn set_rx_on_when_idle(&self, on: bool);
}

pub trait TxClient {
    /// A transmission completed.
    ///
    /// `acked` reports whether the expected acknowledgement arrived;
    /// `ack_frame_pending` mirrors the frame-pending bit of that
    /// acknowledgement, which tells a polling child that more data is queued
    /// for it.
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    );
}

pub trait RxClient {
    /// An unsecured frame was received and passed filtering.
    ///
    /// The frame payload lives at `buf[data_offset..data_offset + data_len]`
    /// in plaintext; the auxiliary security header, if one was present, is
    /// retained so the client can tell secured from unsecured traffic.
    fn receive(&self, buf: &[u8], header: Header, lqi: u8, data_offset: usize, data_len: usize);
}
