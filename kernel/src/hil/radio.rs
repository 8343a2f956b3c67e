// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface for an IEEE 802.15.4 radio.
//!
//! The radio transmits and receives whole PHY frames; CSMA/CA, acknowledgement
//! matching and retransmission live in the MAC capsule above this interface.
//! Buffers handed to the radio reserve [`PSDU_OFFSET`] bytes of headroom in
//! front of the frame and one trailing LQI byte on receive.

use crate::ErrorCode;

/// Length of the MAC footer (FCS), generated and checked by hardware.
pub const MFR_SIZE: usize = 2;
/// Maximum PSDU length, including the FCS.
pub const MAX_FRAME_SIZE: usize = 127;
/// Headroom in front of the PSDU in every radio buffer.
pub const PSDU_OFFSET: usize = 2;
/// Trailing link-quality byte appended to received frames.
pub const LQI_SIZE: usize = 1;
/// Required size of buffers exchanged with the radio.
pub const MAX_BUF_SIZE: usize = PSDU_OFFSET + MAX_FRAME_SIZE + LQI_SIZE;
/// Smallest meaningful frame: frame control and sequence number.
pub const MIN_FRAME_SIZE: usize = 3;

/// Capability bits a radio may advertise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadioCaps {
    /// Hardware performs energy scan itself.
    pub energy_scan: bool,
    /// Link reports acknowledgements asynchronously (deferred ack).
    pub deferred_ack: bool,
}

pub trait TxClient {
    /// The frame handed to `transmit` has left the radio (or failed to).
    fn transmit_done(&self, buf: &'static mut [u8], result: Result<(), ErrorCode>);
}

pub trait RxClient {
    /// A frame arrived. `buf[PSDU_OFFSET..PSDU_OFFSET + frame_len]` holds the
    /// PSDU without the FCS; the byte after it is the LQI.
    fn receive(
        &self,
        buf: &'static mut [u8],
        frame_len: usize,
        lqi: u8,
        crc_valid: bool,
        result: Result<(), ErrorCode>,
    );
}

pub trait ScanClient {
    fn scan_done(&self, max_rssi: i8, result: Result<(), ErrorCode>);
}

pub trait ConfigClient {
    fn config_done(&self, result: Result<(), ErrorCode>);
}

/// Configuration surface of the radio.
pub trait RadioConfig<'a> {
    fn initialize(&self) -> Result<(), ErrorCode>;

    fn set_config_client(&self, client: &'a dyn ConfigClient);

    /// Push pending `set_*` values to the hardware; `config_done` follows.
    fn config_commit(&self);

    fn is_on(&self) -> bool;
    fn start(&self) -> Result<(), ErrorCode>;
    fn stop(&self) -> Result<(), ErrorCode>;
    /// Keep the radio enabled but powered down between operations.
    fn sleep(&self) -> Result<(), ErrorCode>;

    fn get_address(&self) -> u16;
    fn get_address_long(&self) -> [u8; 8];
    fn get_pan(&self) -> u16;
    fn get_channel(&self) -> u8;
    fn get_tx_power(&self) -> i8;
    fn get_caps(&self) -> RadioCaps;

    fn set_address(&self, addr: u16);
    fn set_address_long(&self, addr: [u8; 8]);
    fn set_pan(&self, id: u16);
    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode>;
    fn set_tx_power(&self, power: i8) -> Result<(), ErrorCode>;

    /// Instantaneous RSSI on the current channel, in dBm.
    fn get_noise_floor(&self) -> i8;
}

/// Data path of the radio.
pub trait RadioData<'a> {
    fn set_transmit_client(&self, client: &'a dyn TxClient);
    fn set_receive_client(&self, client: &'a dyn RxClient);
    fn set_receive_buffer(&self, buffer: &'static mut [u8]);

    /// Enable reception on the current channel.
    fn receive(&self) -> Result<(), ErrorCode>;

    /// Clear-channel assessment on the current channel.
    fn cca(&self) -> bool;

    /// Transmit `frame_len` PSDU bytes starting at `buf[PSDU_OFFSET]`.
    fn transmit(
        &self,
        buf: &'static mut [u8],
        frame_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;
}

/// Hardware-assisted energy scan, present when `RadioCaps::energy_scan`.
pub trait RadioScan<'a> {
    fn set_scan_client(&self, client: &'a dyn ScanClient);
    fn energy_scan(&self, channel: u8, duration_ms: u16) -> Result<(), ErrorCode>;
}

pub trait Radio<'a>: RadioConfig<'a> + RadioData<'a> + RadioScan<'a> {}
impl<'a, T: RadioConfig<'a> + RadioData<'a> + RadioScan<'a>> Radio<'a> for T {}
