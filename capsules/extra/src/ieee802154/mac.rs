// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! CSMA/CA MAC scheduler.
//!
//! [`CsmaMac`] owns the radio and implements the transmit discipline of the
//! MAC sublayer in software: unslotted CSMA/CA with binary exponential
//! backoff, acknowledgement matching with retransmission, receive filtering
//! (PAN, address, extended-address allow/deny lists, duplicate rejection),
//! acknowledgement generation with the frame-pending bit taken from the
//! source-match table, and energy scanning.
//!
//! Frames arrive here fully encoded and secured; the framer above performs
//! header construction and cryptography. Acknowledgements never carry
//! security.

use crate::ieee802154::device;
use crate::ieee802154::source_match::SourceMatch;
use crate::net::ieee802154::{FrameType, Header, MacAddress};

use kernel::hil::radio::{self, PSDU_OFFSET};
use kernel::hil::rng::Rng;
use kernel::hil::time::{Alarm, AlarmClient, ConvertTicks};
use kernel::utilities::cells::{MapCell, OptionalCell, TakeCell};
use kernel::ErrorCode;

use core::cell::Cell;

/// Backoff exponent bounds of unslotted CSMA/CA.
const MIN_BE: u8 = 3;
const MAX_BE: u8 = 5;
/// One backoff unit: 20 symbols of 16 us at 250 kbps.
const UNIT_BACKOFF_US: u32 = 320;
/// macAckWaitDuration: 54 symbol periods.
const ACK_WAIT_US: u32 = 864;
/// Interval between RSSI samples of a software energy scan.
const SCAN_SAMPLE_MS: u32 = 1;

/// Per-request transmission parameters.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TxParameters {
    /// CSMA/CA attempts (one CCA each) before `CHANBUSY`.
    pub max_csma_backoffs: u8,
    /// Retransmissions after a missing acknowledgement.
    pub max_frame_retries: u8,
    /// Channel to transmit on; `None` keeps the current channel.
    pub channel: Option<u8>,
}

impl Default for TxParameters {
    fn default() -> TxParameters {
        TxParameters {
            max_csma_backoffs: 4,
            max_frame_retries: 3,
            channel: None,
        }
    }
}

/// Interface of the MAC scheduler, consumed by the framer.
pub trait Mac<'a> {
    fn initialize(&self) -> Result<(), ErrorCode>;

    fn set_config_client(&self, client: &'a dyn radio::ConfigClient);
    fn set_transmit_client(&self, client: &'a dyn device::TxClient);
    fn set_receive_client(&self, client: &'a dyn radio::RxClient);
    fn set_receive_buffer(&self, buffer: &'static mut [u8]);

    fn get_address(&self) -> u16;
    fn get_address_long(&self) -> [u8; 8];
    fn get_pan(&self) -> u16;
    fn get_channel(&self) -> u8;
    fn set_address(&self, addr: u16);
    fn set_address_long(&self, addr: [u8; 8]);
    fn set_pan(&self, id: u16);
    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode>;
    fn config_commit(&self);

    fn is_on(&self) -> bool;
    fn start(&self) -> Result<(), ErrorCode>;
    fn stop(&self) -> Result<(), ErrorCode>;
    fn sleep(&self) -> Result<(), ErrorCode>;

    /// Whether the receiver stays on outside explicit operations.
    fn set_rx_on_when_idle(&self, on: bool);

    /// Transmit a fully-formed MAC frame at `full_mac_frame[..frame_len]`.
    fn transmit(
        &self,
        full_mac_frame: &'static mut [u8],
        frame_len: usize,
        params: TxParameters,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    fn set_scan_client(&self, client: &'a dyn radio::ScanClient);

    /// Sample the channel's energy for `duration_ms`, reporting the maximum
    /// RSSI to the scan client. Only starts when no operation is in flight.
    fn energy_scan(&self, channel: u8, duration_ms: u16) -> Result<(), ErrorCode>;
}

/// Observer of raw frames for packet capture.
pub trait PcapClient {
    fn captured_frame(&self, frame: &[u8], is_transmit: bool);
}

/// Extended-address receive filter.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FilterMode {
    Disabled,
    /// Accept only listed addresses.
    AllowList,
    /// Reject listed addresses.
    DenyList,
}

const FILTER_SIZE: usize = 8;

/// Number of (source, sequence) pairs remembered for duplicate rejection.
const DUP_WINDOW: usize = 8;

#[derive(Copy, Clone, Default)]
struct RecentFrame {
    key: u64,
    seq: u8,
    valid: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Disabled,
    Sleep,
    Idle,
    /// Receiver on, no operation pending.
    Listen,
    /// CSMA/CA backoff timer running.
    Backoff,
    /// Frame handed to the radio.
    Transmit,
    AckWait,
    Scan,
}

#[derive(Copy, Clone)]
struct ScanProgress {
    restore_channel: u8,
    remaining_ms: u32,
    max_rssi: i8,
}

pub struct CsmaMac<'a, R: radio::Radio<'a>, A: Alarm<'a>> {
    radio: &'a R,
    alarm: &'a A,
    rng: &'a dyn Rng,
    source_match: &'a SourceMatch,

    state: Cell<State>,
    rx_on_when_idle: Cell<bool>,
    promiscuous: Cell<bool>,

    tx_client: OptionalCell<&'a dyn device::TxClient>,
    rx_client: OptionalCell<&'a dyn radio::RxClient>,
    scan_client: OptionalCell<&'a dyn radio::ScanClient>,
    pcap_client: OptionalCell<&'a dyn PcapClient>,

    tx_buf: TakeCell<'static, [u8]>,
    tx_len: Cell<usize>,
    tx_params: Cell<TxParameters>,
    tx_seq: Cell<u8>,
    tx_ack_requested: Cell<bool>,
    csma_attempts: Cell<u8>,
    backoff_exponent: Cell<u8>,
    retries: Cell<u8>,

    ack_buf: TakeCell<'static, [u8]>,
    ack_in_flight: Cell<bool>,

    recent_frames: MapCell<[RecentFrame; DUP_WINDOW]>,
    recent_cursor: Cell<usize>,

    filter_mode: Cell<FilterMode>,
    filter: MapCell<[Option<[u8; 8]>; FILTER_SIZE]>,

    scan: Cell<Option<ScanProgress>>,

    /// Frames dropped by filtering, duplicate rejection, or parsing.
    rx_drops: Cell<u32>,
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> CsmaMac<'a, R, A> {
    pub fn new(
        radio: &'a R,
        alarm: &'a A,
        rng: &'a dyn Rng,
        source_match: &'a SourceMatch,
        ack_buf: &'static mut [u8],
    ) -> CsmaMac<'a, R, A> {
        CsmaMac {
            radio,
            alarm,
            rng,
            source_match,
            state: Cell::new(State::Disabled),
            rx_on_when_idle: Cell::new(true),
            promiscuous: Cell::new(false),
            tx_client: OptionalCell::empty(),
            rx_client: OptionalCell::empty(),
            scan_client: OptionalCell::empty(),
            pcap_client: OptionalCell::empty(),
            tx_buf: TakeCell::empty(),
            tx_len: Cell::new(0),
            tx_params: Cell::new(TxParameters::default()),
            tx_seq: Cell::new(0),
            tx_ack_requested: Cell::new(false),
            csma_attempts: Cell::new(0),
            backoff_exponent: Cell::new(MIN_BE),
            retries: Cell::new(0),
            ack_buf: TakeCell::new(ack_buf),
            ack_in_flight: Cell::new(false),
            recent_frames: MapCell::new([RecentFrame::default(); DUP_WINDOW]),
            recent_cursor: Cell::new(0),
            filter_mode: Cell::new(FilterMode::Disabled),
            filter: MapCell::new([None; FILTER_SIZE]),
            scan: Cell::new(None),
            rx_drops: Cell::new(0),
        }
    }

    pub fn set_promiscuous(&self, on: bool) {
        self.promiscuous.set(on);
    }

    /// Observe every frame crossing the radio, before any filtering.
    pub fn set_pcap_client(&self, client: &'a dyn PcapClient) {
        self.pcap_client.set(client);
    }

    pub fn set_filter_mode(&self, mode: FilterMode) {
        self.filter_mode.set(mode);
    }

    pub fn filter_add(&self, addr: [u8; 8]) -> Result<(), ErrorCode> {
        self.filter.map_or(Err(ErrorCode::NOMEM), |filter| {
            match filter.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(addr);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn filter_remove(&self, addr: [u8; 8]) -> Result<(), ErrorCode> {
        self.filter.map_or(Err(ErrorCode::NOTFOUND), |filter| {
            match filter.iter_mut().find(|slot| **slot == Some(addr)) {
                Some(slot) => {
                    *slot = None;
                    Ok(())
                }
                None => Err(ErrorCode::NOTFOUND),
            }
        })
    }

    pub fn filter_clear(&self) {
        self.filter.put([None; FILTER_SIZE]);
    }

    pub fn rx_drop_count(&self) -> u32 {
        self.rx_drops.get()
    }

    /// State to rest in when no operation is in flight.
    fn return_to_idle(&self) {
        if self.rx_on_when_idle.get() {
            let _ = self.radio.receive();
            self.state.set(State::Listen);
        } else {
            let _ = self.radio.sleep();
            self.state.set(State::Sleep);
        }
    }

    fn start_csma(&self) {
        self.csma_attempts.set(0);
        self.backoff_exponent.set(MIN_BE);
        self.state.set(State::Backoff);
        // The receiver must run during backoff so CCA has carrier to judge.
        let _ = self.radio.receive();
        self.arm_backoff();
    }

    fn arm_backoff(&self) {
        let slots = 1u32 << self.backoff_exponent.get();
        let delay_us = (self.rng.get_u32() % slots) * UNIT_BACKOFF_US;
        let dt = self.alarm.ticks_from_us(delay_us);
        self.alarm.set_alarm(self.alarm.now(), dt);
    }

    /// One CSMA attempt: a single CCA, then transmit or back off again.
    fn csma_attempt(&self) {
        self.csma_attempts.set(self.csma_attempts.get() + 1);
        if self.radio.cca() && !self.ack_in_flight.get() {
            self.state.set(State::Transmit);
            let len = self.tx_len.get();
            if let Some(buf) = self.tx_buf.take() {
                if let Err((ecode, buf)) = self.radio.transmit(buf, len) {
                    self.finish_tx(buf, false, false, Err(ecode));
                }
            }
        } else if self.csma_attempts.get() >= self.tx_params.get().max_csma_backoffs {
            if let Some(buf) = self.tx_buf.take() {
                self.finish_tx(buf, false, false, Err(ErrorCode::CHANBUSY));
            }
        } else {
            self.backoff_exponent
                .set((self.backoff_exponent.get() + 1).min(MAX_BE));
            self.state.set(State::Backoff);
            self.arm_backoff();
        }
    }

    fn finish_tx(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        let _ = self.alarm.disarm();
        self.return_to_idle();
        self.tx_client.map(move |client| {
            client.send_done(buf, acked, ack_frame_pending, result);
        });
    }

    fn ack_timeout(&self) {
        // The sequence number is preserved across retransmissions: the
        // buffer is untouched and re-enters CSMA as-is.
        if self.retries.get() < self.tx_params.get().max_frame_retries {
            self.retries.set(self.retries.get() + 1);
            self.start_csma();
        } else if let Some(buf) = self.tx_buf.take() {
            self.finish_tx(buf, false, false, Err(ErrorCode::NOACK));
        }
    }

    fn handle_ack(&self, header: &Header) {
        if self.state.get() != State::AckWait {
            return;
        }
        if header.seq != Some(self.tx_seq.get()) {
            return;
        }
        if let Some(buf) = self.tx_buf.take() {
            self.finish_tx(buf, true, header.frame_pending, Ok(()));
        }
    }

    /// Destination filtering. Returns whether the frame is for this device.
    fn address_match(&self, header: &Header) -> bool {
        if let Some(dst_pan) = header.dst_pan {
            if dst_pan != self.radio.get_pan() && dst_pan != 0xffff {
                return false;
            }
        }
        match header.dst_addr {
            Some(MacAddress::Short(addr)) => {
                addr == self.radio.get_address() || addr == 0xffff
            }
            Some(MacAddress::Long(addr)) => addr == self.radio.get_address_long(),
            None => false,
        }
    }

    fn filter_allows(&self, header: &Header) -> bool {
        let mode = self.filter_mode.get();
        if mode == FilterMode::Disabled {
            return true;
        }
        let listed = match header.src_addr {
            Some(MacAddress::Long(addr)) => self
                .filter
                .map_or(false, |filter| filter.iter().any(|e| *e == Some(addr))),
            // Short-addressed sources cannot be matched against an
            // extended-address list; allow-lists reject them.
            _ => false,
        };
        match mode {
            FilterMode::AllowList => listed,
            FilterMode::DenyList => !listed,
            FilterMode::Disabled => true,
        }
    }

    fn duplicate_key(&self, header: &Header) -> Option<u64> {
        match header.src_addr {
            Some(MacAddress::Long(addr)) => Some(u64::from_le_bytes(addr)),
            Some(MacAddress::Short(addr)) => {
                let pan = header.src_pan.unwrap_or(0) as u64;
                Some((1 << 63) | (pan << 16) | addr as u64)
            }
            None => None,
        }
    }

    /// Sliding-window duplicate rejection by (source, sequence number).
    fn is_duplicate(&self, header: &Header) -> bool {
        let key = match self.duplicate_key(header) {
            Some(key) => key,
            None => return false,
        };
        let seq = match header.seq {
            Some(seq) => seq,
            None => return false,
        };
        let dup = self.recent_frames.map_or(false, |recent| {
            recent
                .iter()
                .any(|r| r.valid && r.key == key && r.seq == seq)
        });
        if !dup {
            let cursor = self.recent_cursor.get();
            self.recent_frames.map(|recent| {
                recent[cursor] = RecentFrame {
                    key,
                    seq,
                    valid: true,
                };
            });
            self.recent_cursor.set((cursor + 1) % DUP_WINDOW);
        }
        dup
    }

    /// Acknowledge a received frame. The frame-pending bit is taken from the
    /// source-match table for MAC commands (a data request's ack must tell
    /// the child whether to stay awake) and is clear otherwise.
    fn send_ack(&self, header: &Header) {
        // A pending data transmission owns the radio; losing an ack is
        // recoverable (the peer retransmits).
        if self.state.get() == State::Transmit || self.ack_in_flight.get() {
            return;
        }
        let frame_pending = header.frame_type == FrameType::MACCommand
            && match header.src_addr {
                Some(MacAddress::Short(addr)) => self.source_match.find_short(addr) >= 0,
                Some(MacAddress::Long(ref addr)) => self.source_match.find_ext(addr) >= 0,
                None => false,
            };

        let ack = Header {
            frame_type: FrameType::Acknowledgement,
            frame_pending,
            ack_requested: false,
            version: crate::net::ieee802154::FrameVersion::V2006,
            seq: header.seq,
            dst_pan: None,
            dst_addr: None,
            src_pan: None,
            src_addr: None,
            security: None,
        };

        if let Some(buf) = self.ack_buf.take() {
            match ack.encode(&mut buf[PSDU_OFFSET..]).done() {
                Some((len, ())) => {
                    self.ack_in_flight.set(true);
                    if let Err((_, buf)) = self.radio.transmit(buf, len) {
                        self.ack_in_flight.set(false);
                        self.ack_buf.replace(buf);
                    }
                }
                None => {
                    self.ack_buf.replace(buf);
                }
            }
        }
    }

    fn scan_sample(&self) {
        if let Some(mut progress) = self.scan.get() {
            let rssi = self.radio.get_noise_floor();
            if rssi > progress.max_rssi {
                progress.max_rssi = rssi;
            }
            if progress.remaining_ms <= SCAN_SAMPLE_MS {
                let _ = self.radio.set_channel(progress.restore_channel);
                self.scan.set(None);
                self.return_to_idle();
                self.scan_client.map(|client| {
                    client.scan_done(progress.max_rssi, Ok(()));
                });
            } else {
                progress.remaining_ms -= SCAN_SAMPLE_MS;
                self.scan.set(Some(progress));
                self.alarm
                    .set_alarm(self.alarm.now(), self.alarm.ticks_from_ms(SCAN_SAMPLE_MS));
            }
        }
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> Mac<'a> for CsmaMac<'a, R, A> {
    fn initialize(&self) -> Result<(), ErrorCode> {
        self.radio.initialize()
    }

    fn set_config_client(&self, client: &'a dyn radio::ConfigClient) {
        self.radio.set_config_client(client);
    }

    fn set_transmit_client(&self, client: &'a dyn device::TxClient) {
        self.tx_client.set(client);
    }

    fn set_receive_client(&self, client: &'a dyn radio::RxClient) {
        self.rx_client.set(client);
    }

    fn set_receive_buffer(&self, buffer: &'static mut [u8]) {
        self.radio.set_receive_buffer(buffer);
    }

    fn get_address(&self) -> u16 {
        self.radio.get_address()
    }

    fn get_address_long(&self) -> [u8; 8] {
        self.radio.get_address_long()
    }

    fn get_pan(&self) -> u16 {
        self.radio.get_pan()
    }

    fn get_channel(&self) -> u8 {
        self.radio.get_channel()
    }

    fn set_address(&self, addr: u16) {
        self.radio.set_address(addr)
    }

    fn set_address_long(&self, addr: [u8; 8]) {
        self.radio.set_address_long(addr)
    }

    fn set_pan(&self, id: u16) {
        self.radio.set_pan(id);
        self.source_match.set_pan_id(id);
    }

    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode> {
        self.radio.set_channel(chan)
    }

    fn config_commit(&self) {
        self.radio.config_commit()
    }

    fn is_on(&self) -> bool {
        self.state.get() != State::Disabled
    }

    fn start(&self) -> Result<(), ErrorCode> {
        if self.state.get() != State::Disabled {
            return Err(ErrorCode::ALREADY);
        }
        self.radio.start()?;
        self.state.set(State::Idle);
        self.return_to_idle();
        Ok(())
    }

    fn stop(&self) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Disabled => Err(ErrorCode::ALREADY),
            State::Backoff | State::Transmit | State::AckWait | State::Scan => {
                Err(ErrorCode::BUSY)
            }
            _ => {
                let _ = self.alarm.disarm();
                self.radio.stop()?;
                self.state.set(State::Disabled);
                Ok(())
            }
        }
    }

    fn sleep(&self) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Disabled => Err(ErrorCode::STATE),
            State::Sleep => Ok(()),
            State::Idle | State::Listen => {
                let _ = self.radio.sleep();
                self.state.set(State::Sleep);
                Ok(())
            }
            _ => Err(ErrorCode::BUSY),
        }
    }

    fn set_rx_on_when_idle(&self, on: bool) {
        self.rx_on_when_idle.set(on);
        match self.state.get() {
            State::Sleep | State::Idle | State::Listen => self.return_to_idle(),
            _ => {}
        }
    }

    fn transmit(
        &self,
        full_mac_frame: &'static mut [u8],
        frame_len: usize,
        params: TxParameters,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        match self.state.get() {
            State::Disabled => return Err((ErrorCode::STATE, full_mac_frame)),
            State::Sleep | State::Idle | State::Listen => {}
            _ => return Err((ErrorCode::BUSY, full_mac_frame)),
        }
        if full_mac_frame.len() < frame_len + PSDU_OFFSET {
            return Err((ErrorCode::NOMEM, full_mac_frame));
        }
        if frame_len > radio::MAX_FRAME_SIZE {
            return Err((ErrorCode::INVAL, full_mac_frame));
        }

        let header = match Header::decode(&full_mac_frame[..frame_len]).done() {
            Some((_, header)) => header,
            None => return Err((ErrorCode::INVAL, full_mac_frame)),
        };
        self.tx_seq.set(header.seq.unwrap_or(0));
        self.tx_ack_requested.set(header.ack_requested);

        if let Some(channel) = params.channel {
            if let Err(e) = self.radio.set_channel(channel) {
                return Err((e, full_mac_frame));
            }
        }

        self.pcap_client
            .map(|pcap| pcap.captured_frame(&full_mac_frame[..frame_len], true));

        // Reserve the radio headroom the way the hardware expects it.
        full_mac_frame.copy_within(0..frame_len, PSDU_OFFSET);
        self.tx_buf.replace(full_mac_frame);
        self.tx_len.set(frame_len);
        self.tx_params.set(params);
        self.retries.set(0);
        self.start_csma();
        Ok(())
    }

    fn set_scan_client(&self, client: &'a dyn radio::ScanClient) {
        self.scan_client.set(client);
    }

    fn energy_scan(&self, channel: u8, duration_ms: u16) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Sleep | State::Idle | State::Listen => {}
            State::Disabled => return Err(ErrorCode::STATE),
            _ => return Err(ErrorCode::BUSY),
        }
        if self.radio.get_caps().energy_scan {
            self.state.set(State::Scan);
            return self.radio.energy_scan(channel, duration_ms);
        }

        let restore_channel = self.radio.get_channel();
        self.radio.set_channel(channel)?;
        let _ = self.radio.receive();
        self.state.set(State::Scan);
        self.scan.set(Some(ScanProgress {
            restore_channel,
            remaining_ms: (duration_ms as u32).max(SCAN_SAMPLE_MS),
            max_rssi: i8::MIN,
        }));
        self.alarm
            .set_alarm(self.alarm.now(), self.alarm.ticks_from_ms(SCAN_SAMPLE_MS));
        Ok(())
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> device::LinkController for CsmaMac<'a, R, A> {
    fn set_rx_on_when_idle(&self, on: bool) {
        Mac::set_rx_on_when_idle(self, on);
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> AlarmClient for CsmaMac<'a, R, A> {
    fn alarm(&self) {
        match self.state.get() {
            State::Backoff => self.csma_attempt(),
            State::AckWait => self.ack_timeout(),
            State::Scan => self.scan_sample(),
            _ => {}
        }
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> radio::TxClient for CsmaMac<'a, R, A> {
    fn transmit_done(&self, buf: &'static mut [u8], result: Result<(), ErrorCode>) {
        if self.ack_in_flight.get() {
            // Completion of an acknowledgement we generated.
            self.ack_in_flight.set(false);
            self.ack_buf.replace(buf);
            return;
        }

        match result {
            Ok(()) => {
                if self.tx_ack_requested.get() {
                    self.state.set(State::AckWait);
                    self.tx_buf.replace(buf);
                    let _ = self.radio.receive();
                    self.alarm
                        .set_alarm(self.alarm.now(), self.alarm.ticks_from_us(ACK_WAIT_US));
                } else {
                    self.finish_tx(buf, false, false, Ok(()));
                }
            }
            Err(ecode) => {
                self.finish_tx(buf, false, false, Err(ecode));
            }
        }
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> radio::RxClient for CsmaMac<'a, R, A> {
    fn receive(
        &self,
        buf: &'static mut [u8],
        frame_len: usize,
        lqi: u8,
        crc_valid: bool,
        result: Result<(), ErrorCode>,
    ) {
        if !crc_valid {
            self.radio.set_receive_buffer(buf);
            return;
        }

        self.pcap_client
            .map(|pcap| pcap.captured_frame(&buf[PSDU_OFFSET..PSDU_OFFSET + frame_len], false));

        if self.promiscuous.get() {
            // Capture mode: everything goes up unfiltered.
            self.rx_client.map(move |client| {
                client.receive(buf, frame_len, lqi, crc_valid, result);
            });
            return;
        }

        let header = match Header::decode(&buf[PSDU_OFFSET..PSDU_OFFSET + frame_len]).done() {
            Some((_, header)) => header,
            None => {
                self.rx_drops.set(self.rx_drops.get() + 1);
                self.radio.set_receive_buffer(buf);
                return;
            }
        };

        if header.frame_type == FrameType::Acknowledgement {
            self.handle_ack(&header);
            self.radio.set_receive_buffer(buf);
            return;
        }

        if !self.address_match(&header) || !self.filter_allows(&header) {
            self.rx_drops.set(self.rx_drops.get() + 1);
            self.radio.set_receive_buffer(buf);
            return;
        }

        if self.is_duplicate(&header) {
            self.rx_drops.set(self.rx_drops.get() + 1);
            self.radio.set_receive_buffer(buf);
            return;
        }

        if header.ack_requested && !header.dst_addr.map_or(false, |a| a.is_broadcast()) {
            self.send_ack(&header);
        }

        self.rx_client.map(move |client| {
            client.receive(buf, frame_len, lqi, crc_valid, result);
        });
    }
}

impl<'a, R: radio::Radio<'a>, A: Alarm<'a>> radio::ScanClient for CsmaMac<'a, R, A> {
    fn scan_done(&self, max_rssi: i8, result: Result<(), ErrorCode>) {
        // Hardware-assisted scan completion.
        if self.state.get() == State::Scan && self.scan.get().is_none() {
            self.return_to_idle();
            self.scan_client.map(|client| {
                client.scan_done(max_rssi, result);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ieee802154::{FrameVersion, PanID};
    use crate::test::fake_radio::FakeRadio;
    use crate::test::fake_rng::FakeRng;
    use kernel::hil::radio::RadioConfig;
    use kernel::hil::radio::RadioData;
    use capsules_core::test::fake_alarm::FakeAlarm;
    use kernel::utilities::cells::TakeCell;
    use std::boxed::Box;

    const PAN: PanID = 0x1234;
    const OUR_SHORT: u16 = 0x0001;
    const PEER_SHORT: u16 = 0x0005;

    struct TxCatcher {
        buf: TakeCell<'static, [u8]>,
        acked: Cell<Option<bool>>,
        pending: Cell<bool>,
        result: Cell<Option<Result<(), ErrorCode>>>,
    }

    impl TxCatcher {
        fn new() -> TxCatcher {
            TxCatcher {
                buf: TakeCell::empty(),
                acked: Cell::new(None),
                pending: Cell::new(false),
                result: Cell::new(None),
            }
        }
    }

    impl device::TxClient for TxCatcher {
        fn send_done(
            &self,
            buf: &'static mut [u8],
            acked: bool,
            ack_frame_pending: bool,
            result: Result<(), ErrorCode>,
        ) {
            self.buf.replace(buf);
            self.acked.set(Some(acked));
            self.pending.set(ack_frame_pending);
            self.result.set(Some(result));
        }
    }

    struct RxCatcher {
        buf: TakeCell<'static, [u8]>,
        count: Cell<u32>,
    }

    impl RxCatcher {
        fn new() -> RxCatcher {
            RxCatcher {
                buf: TakeCell::empty(),
                count: Cell::new(0),
            }
        }
    }

    impl radio::RxClient for RxCatcher {
        fn receive(
            &self,
            buf: &'static mut [u8],
            _frame_len: usize,
            _lqi: u8,
            _crc_valid: bool,
            _result: Result<(), ErrorCode>,
        ) {
            self.count.set(self.count.get() + 1);
            self.buf.replace(buf);
        }
    }

    struct ScanCatcher {
        rssi: Cell<Option<i8>>,
    }

    impl radio::ScanClient for ScanCatcher {
        fn scan_done(&self, max_rssi: i8, result: Result<(), ErrorCode>) {
            assert!(result.is_ok());
            self.rssi.set(Some(max_rssi));
        }
    }

    fn leak_buf() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; radio::MAX_BUF_SIZE]))
    }

    fn data_header(seq: u8, ack_requested: bool, dst: u16, src: u16) -> Header {
        Header {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_requested,
            version: FrameVersion::V2006,
            seq: Some(seq),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Short(dst)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Short(src)),
            security: None,
        }
    }

    fn encode_frame(header: &Header, payload: &[u8]) -> (&'static mut [u8], usize) {
        let buf = leak_buf();
        let (mut len, ()) = header.encode(buf).done().unwrap();
        buf[len..len + payload.len()].copy_from_slice(payload);
        len += payload.len();
        (buf, len)
    }

    fn frame_bytes(header: &Header, payload: &[u8]) -> ([u8; 64], usize) {
        let mut buf = [0u8; 64];
        let (mut len, ()) = header.encode(&mut buf).done().unwrap();
        buf[len..len + payload.len()].copy_from_slice(payload);
        len += payload.len();
        (buf, len)
    }

    // Builds the standard test fixture; the caller wires clients.
    macro_rules! fixture {
        ($radio:ident, $alarm:ident, $rng:ident, $sm:ident, $mac:ident) => {
            let $radio = FakeRadio::new();
            let $alarm = FakeAlarm::new();
            let $rng = FakeRng::new(0);
            let $sm = SourceMatch::new();
            let $mac = CsmaMac::new(&$radio, &$alarm, &$rng, &$sm, leak_buf());
            $radio.set_transmit_client(&$mac);
            $radio.set_receive_client(&$mac);
            $alarm.set_alarm_client(&$mac);
            $radio.set_address(OUR_SHORT);
            $radio.set_address_long([0xaa; 8]);
            $mac.set_pan(PAN);
            $mac.start().unwrap();
        };
    }

    #[test]
    fn busy_channel_fails_after_exact_cca_attempts() {
        fixture!(radio, alarm, rng, sm, mac);
        let client = TxCatcher::new();
        mac.set_transmit_client(&client);
        radio.set_cca_result(false);

        let (buf, len) = encode_frame(&data_header(7, false, PEER_SHORT, OUR_SHORT), b"hi");
        mac.transmit(
            buf,
            len,
            TxParameters {
                max_csma_backoffs: 4,
                max_frame_retries: 3,
                channel: None,
            },
        )
        .unwrap();

        for _ in 0..4 {
            assert!(alarm.trigger_next());
        }
        assert_eq!(radio.cca_count(), 4);
        assert_eq!(radio.tx_count(), 0);
        assert_eq!(client.result.get(), Some(Err(ErrorCode::CHANBUSY)));
    }

    #[test]
    fn unacked_frame_completes_after_radio_tx() {
        fixture!(radio, alarm, rng, sm, mac);
        let client = TxCatcher::new();
        mac.set_transmit_client(&client);

        let (buf, len) = encode_frame(&data_header(1, false, PEER_SHORT, OUR_SHORT), b"x");
        mac.transmit(buf, len, TxParameters::default()).unwrap();
        assert!(alarm.trigger_next());
        assert_eq!(radio.tx_count(), 1);
        radio.complete_tx();
        assert_eq!(client.result.get(), Some(Ok(())));
        assert_eq!(client.acked.get(), Some(false));
    }

    #[test]
    fn ack_completes_transmission_and_reports_frame_pending() {
        fixture!(radio, alarm, rng, sm, mac);
        let client = TxCatcher::new();
        mac.set_transmit_client(&client);

        let (buf, len) = encode_frame(&data_header(9, true, PEER_SHORT, OUR_SHORT), b"p");
        mac.transmit(buf, len, TxParameters::default()).unwrap();
        assert!(alarm.trigger_next());
        radio.complete_tx();
        // In AckWait now; deliver the matching acknowledgement.
        mac.set_receive_buffer(leak_buf());
        let ack = Header {
            frame_type: FrameType::Acknowledgement,
            frame_pending: true,
            ack_requested: false,
            version: FrameVersion::V2006,
            seq: Some(9),
            dst_pan: None,
            dst_addr: None,
            src_pan: None,
            src_addr: None,
            security: None,
        };
        let (bytes, ack_len) = frame_bytes(&ack, &[]);
        radio.deliver_frame(&bytes[..ack_len], 255);

        assert_eq!(client.result.get(), Some(Ok(())));
        assert_eq!(client.acked.get(), Some(true));
        assert!(client.pending.get());
    }

    #[test]
    fn zero_retries_never_retransmits() {
        fixture!(radio, alarm, rng, sm, mac);
        let client = TxCatcher::new();
        mac.set_transmit_client(&client);

        let (buf, len) = encode_frame(&data_header(3, true, PEER_SHORT, OUR_SHORT), b"q");
        mac.transmit(
            buf,
            len,
            TxParameters {
                max_csma_backoffs: 4,
                max_frame_retries: 0,
                channel: None,
            },
        )
        .unwrap();
        assert!(alarm.trigger_next());
        radio.complete_tx();
        // Ack timeout fires; with zero retries the transmission fails.
        assert!(alarm.trigger_next());
        assert_eq!(radio.tx_count(), 1);
        assert_eq!(client.result.get(), Some(Err(ErrorCode::NOACK)));
    }

    #[test]
    fn retry_preserves_sequence_number() {
        fixture!(radio, alarm, rng, sm, mac);
        let client = TxCatcher::new();
        mac.set_transmit_client(&client);

        let (buf, len) = encode_frame(&data_header(0x5a, true, PEER_SHORT, OUR_SHORT), b"r");
        mac.transmit(
            buf,
            len,
            TxParameters {
                max_csma_backoffs: 4,
                max_frame_retries: 2,
                channel: None,
            },
        )
        .unwrap();
        assert!(alarm.trigger_next());
        radio.complete_tx();
        // First ack timeout: retransmission with the same sequence number.
        assert!(alarm.trigger_next());
        assert!(alarm.trigger_next()); // backoff of the retry
        assert_eq!(radio.tx_count(), 2);
        radio.inspect_tx(|frame| {
            let (_, header) = Header::decode(frame).done().unwrap();
            assert_eq!(header.seq, Some(0x5a));
        });
    }

    #[test]
    fn duplicate_frames_are_dropped() {
        fixture!(radio, alarm, rng, sm, mac);
        let rx = RxCatcher::new();
        mac.set_receive_client(&rx);
        mac.set_receive_buffer(leak_buf());

        let (bytes, len) = frame_bytes(&data_header(5, false, OUR_SHORT, PEER_SHORT), b"dup");
        radio.deliver_frame(&bytes[..len], 100);
        assert_eq!(rx.count.get(), 1);
        // Return the buffer and replay the identical frame.
        mac.set_receive_buffer(rx.buf.take().unwrap());
        radio.deliver_frame(&bytes[..len], 100);
        assert_eq!(rx.count.get(), 1);
        assert_eq!(mac.rx_drop_count(), 1);
    }

    #[test]
    fn wrong_pan_is_filtered() {
        fixture!(radio, alarm, rng, sm, mac);
        let rx = RxCatcher::new();
        mac.set_receive_client(&rx);
        mac.set_receive_buffer(leak_buf());

        let mut header = data_header(5, false, OUR_SHORT, PEER_SHORT);
        header.dst_pan = Some(0x4444);
        header.src_pan = Some(0x4444);
        let (bytes, len) = frame_bytes(&header, b"no");
        radio.deliver_frame(&bytes[..len], 100);
        assert_eq!(rx.count.get(), 0);
        assert_eq!(mac.rx_drop_count(), 1);
    }

    #[test]
    fn ack_requested_command_gets_ack_with_source_match_pending() {
        fixture!(radio, alarm, rng, sm, mac);
        let rx = RxCatcher::new();
        mac.set_receive_client(&rx);
        mac.set_receive_buffer(leak_buf());
        sm.add_short(PEER_SHORT).unwrap();

        let mut header = data_header(0x21, true, OUR_SHORT, PEER_SHORT);
        header.frame_type = FrameType::MACCommand;
        // Data request command identifier.
        let (bytes, len) = frame_bytes(&header, &[0x04]);
        radio.deliver_frame(&bytes[..len], 90);

        // The MAC should have handed an acknowledgement to the radio.
        assert!(radio.pending_tx());
        radio.inspect_tx(|frame| {
            let (_, ack) = Header::decode(frame).done().unwrap();
            assert_eq!(ack.frame_type, FrameType::Acknowledgement);
            assert_eq!(ack.seq, Some(0x21));
            assert!(ack.frame_pending);
        });
        radio.complete_tx();
        assert_eq!(rx.count.get(), 1);
    }

    #[test]
    fn extended_address_filter_modes() {
        fixture!(radio, alarm, rng, sm, mac);
        let rx = RxCatcher::new();
        mac.set_receive_client(&rx);
        mac.set_receive_buffer(leak_buf());

        let peer_ext = [0x66u8; 8];
        let mut header = data_header(1, false, OUR_SHORT, PEER_SHORT);
        header.src_addr = Some(MacAddress::Long(peer_ext));

        // Deny-listed sources are dropped.
        mac.set_filter_mode(FilterMode::DenyList);
        mac.filter_add(peer_ext).unwrap();
        let (bytes, len) = frame_bytes(&header, b"x");
        radio.deliver_frame(&bytes[..len], 50);
        assert_eq!(rx.count.get(), 0);

        // Allow-list mode admits only listed sources.
        mac.set_filter_mode(FilterMode::AllowList);
        header.seq = Some(2);
        let (bytes, len) = frame_bytes(&header, b"y");
        radio.deliver_frame(&bytes[..len], 50);
        assert_eq!(rx.count.get(), 1);

        mac.filter_remove(peer_ext).unwrap();
        header.seq = Some(3);
        mac.set_receive_buffer(rx.buf.take().unwrap());
        let (bytes, len) = frame_bytes(&header, b"z");
        radio.deliver_frame(&bytes[..len], 50);
        assert_eq!(rx.count.get(), 1);
    }

    #[test]
    fn energy_scan_reports_max_rssi_and_restores_channel() {
        fixture!(radio, alarm, rng, sm, mac);
        let scan = ScanCatcher {
            rssi: Cell::new(None),
        };
        mac.set_scan_client(&scan);

        radio.set_noise_floor(-77);
        mac.energy_scan(15, 3).unwrap();
        assert_eq!(radio.get_channel(), 15);
        assert!(alarm.trigger_next());
        radio.set_noise_floor(-40);
        assert!(alarm.trigger_next());
        radio.set_noise_floor(-90);
        assert!(alarm.trigger_next());

        assert_eq!(scan.rssi.get(), Some(-40));
        assert_eq!(radio.get_channel(), 11);
        // Busy while not idle: a transmit during scan must have been refused,
        // and now the MAC accepts work again.
        assert!(mac.energy_scan(16, 1).is_ok());
    }
}
