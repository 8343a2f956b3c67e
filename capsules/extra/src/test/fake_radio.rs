// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! A scriptable 802.15.4 radio.
//!
//! Tests drive the MAC by scripting CCA results, completing transmissions,
//! and injecting received frames.

use kernel::hil::radio::{
    ConfigClient, RadioCaps, RadioConfig, RadioData, RadioScan, RxClient, ScanClient, TxClient,
    LQI_SIZE, PSDU_OFFSET,
};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::ErrorCode;

use core::cell::Cell;

pub struct FakeRadio<'a> {
    on: Cell<bool>,
    sleeping: Cell<bool>,
    receiving: Cell<bool>,
    address: Cell<u16>,
    address_long: Cell<[u8; 8]>,
    pan: Cell<u16>,
    channel: Cell<u8>,
    tx_power: Cell<i8>,
    noise_floor: Cell<i8>,
    caps: Cell<RadioCaps>,

    cca_result: Cell<bool>,
    cca_count: Cell<u32>,

    tx_client: OptionalCell<&'a dyn TxClient>,
    rx_client: OptionalCell<&'a dyn RxClient>,
    scan_client: OptionalCell<&'a dyn ScanClient>,
    config_client: OptionalCell<&'a dyn ConfigClient>,

    tx_buf: TakeCell<'static, [u8]>,
    tx_len: Cell<usize>,
    tx_count: Cell<u32>,

    rx_buf: TakeCell<'static, [u8]>,
}

impl<'a> FakeRadio<'a> {
    pub fn new() -> FakeRadio<'a> {
        FakeRadio {
            on: Cell::new(false),
            sleeping: Cell::new(false),
            receiving: Cell::new(false),
            address: Cell::new(0),
            address_long: Cell::new([0; 8]),
            pan: Cell::new(0),
            channel: Cell::new(11),
            tx_power: Cell::new(0),
            noise_floor: Cell::new(-90),
            caps: Cell::new(RadioCaps::default()),
            cca_result: Cell::new(true),
            cca_count: Cell::new(0),
            tx_client: OptionalCell::empty(),
            rx_client: OptionalCell::empty(),
            scan_client: OptionalCell::empty(),
            config_client: OptionalCell::empty(),
            tx_buf: TakeCell::empty(),
            tx_len: Cell::new(0),
            tx_count: Cell::new(0),
            rx_buf: TakeCell::empty(),
        }
    }

    pub fn set_cca_result(&self, clear: bool) {
        self.cca_result.set(clear);
    }

    pub fn cca_count(&self) -> u32 {
        self.cca_count.get()
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count.get()
    }

    pub fn set_noise_floor(&self, rssi: i8) {
        self.noise_floor.set(rssi);
    }

    pub fn pending_tx(&self) -> bool {
        self.tx_buf.is_some()
    }

    /// Run `f` over the PSDU of the frame currently held for transmission.
    pub fn inspect_tx<F: FnOnce(&[u8])>(&self, f: F) {
        let len = self.tx_len.get();
        self.tx_buf.map(|buf| f(&buf[PSDU_OFFSET..PSDU_OFFSET + len]));
    }

    /// Complete the in-flight transmission.
    pub fn complete_tx(&self) {
        if let Some(buf) = self.tx_buf.take() {
            self.tx_client.map(move |client| {
                client.transmit_done(buf, Ok(()));
            });
        }
    }

    /// Hand a received frame to the client, using the buffer previously
    /// provided with `set_receive_buffer`.
    pub fn deliver_frame(&self, frame: &[u8], lqi: u8) {
        if let Some(buf) = self.rx_buf.take() {
            assert!(buf.len() >= PSDU_OFFSET + frame.len() + LQI_SIZE);
            buf[PSDU_OFFSET..PSDU_OFFSET + frame.len()].copy_from_slice(frame);
            let len = frame.len();
            self.rx_client.map(move |client| {
                client.receive(buf, len, lqi, true, Ok(()));
            });
        }
    }

    pub fn has_rx_buffer(&self) -> bool {
        self.rx_buf.is_some()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.get()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.get()
    }

    /// Complete a hardware-assisted energy scan.
    pub fn trigger_scan_done(&self, max_rssi: i8) {
        self.scan_client.map(|client| client.scan_done(max_rssi, Ok(())));
    }
}

impl<'a> Default for FakeRadio<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RadioConfig<'a> for FakeRadio<'a> {
    fn initialize(&self) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn set_config_client(&self, client: &'a dyn ConfigClient) {
        self.config_client.set(client);
    }

    fn config_commit(&self) {
        self.config_client.map(|client| client.config_done(Ok(())));
    }

    fn is_on(&self) -> bool {
        self.on.get()
    }

    fn start(&self) -> Result<(), ErrorCode> {
        self.on.set(true);
        self.sleeping.set(false);
        Ok(())
    }

    fn stop(&self) -> Result<(), ErrorCode> {
        self.on.set(false);
        Ok(())
    }

    fn sleep(&self) -> Result<(), ErrorCode> {
        self.sleeping.set(true);
        self.receiving.set(false);
        Ok(())
    }

    fn get_address(&self) -> u16 {
        self.address.get()
    }

    fn get_address_long(&self) -> [u8; 8] {
        self.address_long.get()
    }

    fn get_pan(&self) -> u16 {
        self.pan.get()
    }

    fn get_channel(&self) -> u8 {
        self.channel.get()
    }

    fn get_tx_power(&self) -> i8 {
        self.tx_power.get()
    }

    fn get_caps(&self) -> RadioCaps {
        self.caps.get()
    }

    fn set_address(&self, addr: u16) {
        self.address.set(addr);
    }

    fn set_address_long(&self, addr: [u8; 8]) {
        self.address_long.set(addr);
    }

    fn set_pan(&self, id: u16) {
        self.pan.set(id);
    }

    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode> {
        self.channel.set(chan);
        Ok(())
    }

    fn set_tx_power(&self, power: i8) -> Result<(), ErrorCode> {
        self.tx_power.set(power);
        Ok(())
    }

    fn get_noise_floor(&self) -> i8 {
        self.noise_floor.get()
    }
}

impl<'a> RadioData<'a> for FakeRadio<'a> {
    fn set_transmit_client(&self, client: &'a dyn TxClient) {
        self.tx_client.set(client);
    }

    fn set_receive_client(&self, client: &'a dyn RxClient) {
        self.rx_client.set(client);
    }

    fn set_receive_buffer(&self, buffer: &'static mut [u8]) {
        self.rx_buf.replace(buffer);
    }

    fn receive(&self) -> Result<(), ErrorCode> {
        self.receiving.set(true);
        self.sleeping.set(false);
        Ok(())
    }

    fn cca(&self) -> bool {
        self.cca_count.set(self.cca_count.get() + 1);
        self.cca_result.get()
    }

    fn transmit(
        &self,
        buf: &'static mut [u8],
        frame_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if self.tx_buf.is_some() {
            return Err((ErrorCode::BUSY, buf));
        }
        self.tx_len.set(frame_len);
        self.tx_count.set(self.tx_count.get() + 1);
        self.tx_buf.replace(buf);
        Ok(())
    }
}

impl<'a> RadioScan<'a> for FakeRadio<'a> {
    fn set_scan_client(&self, client: &'a dyn ScanClient) {
        self.scan_client.set(client);
    }

    fn energy_scan(&self, channel: u8, _duration_ms: u16) -> Result<(), ErrorCode> {
        self.channel.set(channel);
        Err(ErrorCode::NOSUPPORT)
    }
}
