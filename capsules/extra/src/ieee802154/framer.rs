// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Implements the IEEE 802.15.4 MAC device abstraction over the MAC
//! scheduler.
//!
//! Users of the framer prepare and send frames in plaintext; header encoding
//! and the 802.15.4 security procedures happen here. The outgoing procedure
//! fills the auxiliary security header, encrypts the payload in place and
//! appends the MIC; the incoming procedure looks the key up, enforces the
//! per-sender frame-counter window and verifies the MIC before yielding the
//! plaintext frame to the receive client.
//!
//! Frame counters are monotonic per (sender, key sequence); a receive is
//! rejected as a replay when its counter does not exceed the last accepted
//! one. The outgoing counter is reported to the
//! [`SecurityCounterClient`] after every secured transmission so it can be
//! persisted.

use crate::ieee802154::device::{MacDevice, RxClient, TxClient};
use crate::ieee802154::mac::{Mac, TxParameters};
use crate::net::ieee802154::{
    FrameType, FrameVersion, Header, KeyId, MacAddress, PanID, Security, SecurityLevel,
};
use capsules_core::stream::{encode_bytes, encode_u32, encode_u8};

use kernel::hil::radio::{self, PSDU_OFFSET};
use kernel::hil::symmetric_encryption::{AES128CCM, CCMClient};
use kernel::utilities::cells::{MapCell, OptionalCell};
use kernel::ErrorCode;

use core::cell::Cell;

/// Wraps a static mutable byte slice along with header information for a
/// payload, so the user need not care where the payload lands in the buffer.
#[derive(Eq, PartialEq, Debug)]
pub struct Frame {
    buf: &'static mut [u8],
    info: FrameInfo,
}

/// Just enough information about a frame to secure and transmit it once the
/// payload has been finalized. Offsets are relative to the start of the
/// PSDU.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct FrameInfo {
    frame_type: FrameType,
    // Start of the MAC payload (end of the MHR).
    data_offset: usize,
    // Length of the data payload, not including MIC and FCS.
    data_len: usize,
    mic_len: usize,
    // Security level, key, and nonce.
    security_params: Option<(SecurityLevel, [u8; 16], [u8; 13])>,
    params: TxParameters,
}

impl Frame {
    /// Consumes the frame and retrieves the buffer it wraps.
    pub fn into_buf(self) -> &'static mut [u8] {
        self.buf
    }

    /// Calculates how much more data this frame can hold.
    pub fn remaining_data_capacity(&self) -> usize {
        self.buf.len() - radio::PSDU_OFFSET - radio::MFR_SIZE - self.info.secured_length()
    }

    /// Appends payload bytes into the frame if possible.
    pub fn append_payload(&mut self, payload: &[u8]) -> Result<(), ErrorCode> {
        if payload.len() > self.remaining_data_capacity() {
            return Err(ErrorCode::NOMEM);
        }
        let begin = self.info.unsecured_length();
        self.buf[begin..begin + payload.len()].copy_from_slice(payload);
        self.info.data_len += payload.len();
        Ok(())
    }

    pub fn set_max_csma_backoffs(&mut self, backoffs: u8) {
        self.info.params.max_csma_backoffs = backoffs;
    }

    pub fn set_max_frame_retries(&mut self, retries: u8) {
        self.info.params.max_frame_retries = retries;
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.info.params.channel = Some(channel);
    }
}

impl FrameInfo {
    /// Current size of the frame, not including the MAC footer or the MIC.
    fn unsecured_length(&self) -> usize {
        self.data_offset + self.data_len
    }

    /// Current size of the frame, not including the MAC footer but including
    /// the MIC.
    fn secured_length(&self) -> usize {
        self.data_offset + self.data_len + self.mic_len
    }

    /// Offsets of the private (m) data for the CCM* procedures, relative to
    /// the PSDU. The a data is the remaining prefix of the frame.
    ///
    /// IEEE 802.15.4-2015, Table 9-1: the MAC command identifier stays in
    /// the open part; for other frames the whole MAC payload is private.
    /// When the level encrypts nothing, the entire frame is a data.
    fn ccm_encrypt_ranges(&self) -> (usize, usize) {
        let encryption_needed = self
            .security_params
            .is_some_and(|(level, _, _)| level.encryption_needed());
        if !encryption_needed {
            return (self.unsecured_length(), 0);
        }
        let private_offset = match self.frame_type {
            FrameType::MACCommand => (self.data_offset + 1).min(self.unsecured_length()),
            _ => self.data_offset,
        };
        (private_offset, self.unsecured_length() - private_offset)
    }
}

/// Generate a 15.4 CCM nonce from the device address, frame counter, and
/// security level.
pub fn get_ccm_nonce(device_addr: &[u8; 8], frame_counter: u32, level: SecurityLevel) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    let encode_ccm_nonce = |buf: &mut [u8]| {
        let off = enc_consume!(buf; encode_bytes, device_addr.as_ref());
        // Nonce fields are most-significant-byte first (IEEE 802.15.4-2015,
        // 9.3.2), unlike the MHR's little-endian fields.
        let off = enc_consume!(buf, off; encode_u32, frame_counter.swap_bytes());
        let off = enc_consume!(buf, off; encode_u8, level as u8);
        stream_done!(off);
    };
    match encode_ccm_nonce(&mut nonce).done() {
        None => {
            // The nonce is exactly 13 bytes; this cannot fail.
            unreachable!()
        }
        Some(_) => nonce,
    }
}

/// IEEE 802.15.4-2015, 9.2.2, KeyDescriptor lookup procedure.
///
/// Implemented by the layer that owns the key material (the key manager).
pub trait KeyProcedure {
    /// Key matching the security level and key id of a received frame,
    /// together with the key sequence it belongs to.
    fn lookup_key(&self, level: SecurityLevel, key_id: KeyId) -> Option<([u8; 16], u32)>;

    /// Key id, key and key sequence for securing outgoing frames.
    fn outgoing_key(&self) -> Option<(KeyId, [u8; 16], u32)>;
}

/// IEEE 802.15.4-2015, 9.2.5, DeviceDescriptor lookup procedure.
///
/// Implemented by the neighbor table: address translation plus the
/// per-device incoming frame-counter window.
pub trait DeviceProcedure {
    /// Look up the extended address of a device given either form of its
    /// address.
    fn lookup_addr_long(&self, addr: MacAddress) -> Option<[u8; 8]>;

    /// Last accepted incoming frame counter for (device, key sequence), or
    /// `None` when no secured frame has been accepted yet.
    fn link_frame_counter(&self, addr: &[u8; 8], key_seq: u32) -> Option<u32>;

    /// Record the counter of an accepted frame.
    fn set_link_frame_counter(&self, addr: &[u8; 8], key_seq: u32, counter: u32);
}

/// Receives the outgoing frame counter after each secured transmission, for
/// persistence.
pub trait SecurityCounterClient {
    fn mac_frame_counter_advanced(&self, counter: u32);
}

/// Disposition of a received secured frame that was not accepted.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SecurityError {
    UnknownKey,
    Replayed,
    MicFailed,
    Malformed,
}

/// Transmission pipeline state.
#[derive(Eq, PartialEq, Debug)]
enum TxState {
    Idle,
    /// A valid frame needs to be secured before transmission.
    ReadyToEncrypt(FrameInfo, &'static mut [u8]),
    /// The encryption facility is processing the frame. With the software
    /// engine this state is traversed within the `crypt` call itself.
    Encrypting(FrameInfo),
    /// Secured (or security-free) and waiting for the MAC.
    ReadyToTransmit(FrameInfo, &'static mut [u8]),
}

#[derive(Eq, PartialEq, Debug)]
enum RxState {
    Idle,
    /// A secured frame is being decrypted. Decrypting(info, lqi)
    Decrypting(FrameInfo, u8),
}

/// Exposes [`MacDevice`] over the MAC scheduler, adding the security
/// procedures.
pub struct Framer<'a, M: Mac<'a>, A: AES128CCM<'a>> {
    mac: &'a M,
    aes_ccm: &'a A,
    data_sequence: Cell<u8>,
    /// Outgoing frame counter for secured transmissions.
    frame_counter: Cell<u32>,
    /// Whether the frame currently in the MAC was secured.
    tx_secured: Cell<bool>,

    key_procedure: OptionalCell<&'a dyn KeyProcedure>,
    device_procedure: OptionalCell<&'a dyn DeviceProcedure>,
    counter_client: OptionalCell<&'a dyn SecurityCounterClient>,

    /// Transmission pipeline state. Never `None` outside a transition.
    tx_state: MapCell<TxState>,
    tx_client: OptionalCell<&'a dyn TxClient>,

    /// Reception pipeline state. Never `None` outside a transition.
    rx_state: MapCell<RxState>,
    rx_client: OptionalCell<&'a dyn RxClient>,

    /// Dropped frames that failed the incoming security procedure.
    security_errors: Cell<u32>,
    /// Dropped frames that failed header parsing.
    parse_errors: Cell<u32>,
}

impl<'a, M: Mac<'a>, A: AES128CCM<'a>> Framer<'a, M, A> {
    pub fn new(mac: &'a M, aes_ccm: &'a A) -> Framer<'a, M, A> {
        Framer {
            mac,
            aes_ccm,
            data_sequence: Cell::new(0),
            frame_counter: Cell::new(0),
            tx_secured: Cell::new(false),
            key_procedure: OptionalCell::empty(),
            device_procedure: OptionalCell::empty(),
            counter_client: OptionalCell::empty(),
            tx_state: MapCell::new(TxState::Idle),
            tx_client: OptionalCell::empty(),
            rx_state: MapCell::new(RxState::Idle),
            rx_client: OptionalCell::empty(),
            security_errors: Cell::new(0),
            parse_errors: Cell::new(0),
        }
    }

    pub fn set_key_procedure(&self, key_procedure: &'a dyn KeyProcedure) {
        self.key_procedure.set(key_procedure);
    }

    pub fn set_device_procedure(&self, device_procedure: &'a dyn DeviceProcedure) {
        self.device_procedure.set(device_procedure);
    }

    pub fn set_security_counter_client(&self, client: &'a dyn SecurityCounterClient) {
        self.counter_client.set(client);
    }

    /// Restore the outgoing frame counter from persisted state.
    pub fn set_frame_counter(&self, counter: u32) {
        self.frame_counter.set(counter);
    }

    pub fn security_error_count(&self) -> u32 {
        self.security_errors.get()
    }

    pub fn parse_error_count(&self) -> u32 {
        self.parse_errors.get()
    }

    fn drop_secured(&self, err: SecurityError, src: Option<MacAddress>) {
        self.security_errors.set(self.security_errors.get() + 1);
        kernel::debug!("[mac] dropped secured frame: {:?} from {:?}", err, src);
    }

    fn prepare_frame(
        &self,
        buf: &'static mut [u8],
        frame_type: FrameType,
        dst_pan: PanID,
        dst_addr: MacAddress,
        src_pan: PanID,
        src_addr: MacAddress,
        command_id: Option<u8>,
        security_needed: Option<(SecurityLevel, KeyId)>,
    ) -> Result<Frame, &'static mut [u8]> {
        // IEEE 802.15.4-2015: 9.2.1, steps a-e of the outgoing frame
        // security procedure.
        let security_desc = security_needed.and_then(|(level, key_id)| {
            self.key_procedure
                .and_then(|keys| keys.lookup_key(level, key_id))
                .map(|(key, _seq)| {
                    let frame_counter = self.frame_counter.get();
                    // Nonces use this device's extended address regardless of
                    // the addressing mode in the header.
                    let nonce =
                        get_ccm_nonce(&self.mac.get_address_long(), frame_counter, level);
                    (
                        Security {
                            level,
                            frame_counter,
                            key_id,
                        },
                        key,
                        nonce,
                    )
                })
        });
        if security_needed.is_some() && security_desc.is_none() {
            // Security was requested but the key was not found.
            return Err(buf);
        }

        let security = security_desc.map(|(sec, _, _)| sec);
        let mic_len = security.map_or(0, |sec| sec.level.mic_len());
        let header = Header {
            frame_type,
            frame_pending: false,
            // Unicast frames request acknowledgement.
            ack_requested: !dst_addr.is_broadcast(),
            version: FrameVersion::V2006,
            seq: Some(self.data_sequence.get()),
            dst_pan: Some(dst_pan),
            dst_addr: Some(dst_addr),
            src_pan: Some(src_pan),
            src_addr: Some(src_addr),
            security,
        };

        match header.encode(buf).done() {
            Some((data_offset, ())) => {
                if security_desc.is_some() {
                    self.frame_counter.set(self.frame_counter.get().wrapping_add(1));
                }
                let mut frame = Frame {
                    buf,
                    info: FrameInfo {
                        frame_type,
                        data_offset,
                        data_len: 0,
                        mic_len,
                        security_params: security_desc
                            .map(|(sec, key, nonce)| (sec.level, key, nonce)),
                        params: TxParameters::default(),
                    },
                };
                if let Some(command_id) = command_id {
                    if frame.append_payload(&[command_id]).is_err() {
                        return Err(frame.into_buf());
                    }
                }
                Ok(frame)
            }
            None => Err(buf),
        }
    }

    /// IEEE 802.15.4-2015, 9.2.1: dispatch a prepared frame into the
    /// transmission pipeline.
    fn outgoing_frame_security(&self, buf: &'static mut [u8], frame_info: FrameInfo) -> TxState {
        match frame_info.security_params {
            Some((level, _, _)) if level != SecurityLevel::None => {
                TxState::ReadyToEncrypt(frame_info, buf)
            }
            _ => TxState::ReadyToTransmit(frame_info, buf),
        }
    }

    /// IEEE 802.15.4-2015, 9.2.3, incoming frame security procedure.
    ///
    /// Returns the buffer to the MAC when the frame is dropped or yielded
    /// immediately; otherwise hands it to the decryption pipeline.
    fn incoming_frame_security(&self, buf: &'static mut [u8], frame_len: usize, lqi: u8) {
        let frame_buffer = &buf[PSDU_OFFSET..PSDU_OFFSET + frame_len];
        let decoded = Header::decode(frame_buffer).done();
        let (data_offset, header) = match decoded {
            Some(d) => d,
            None => {
                self.parse_errors.set(self.parse_errors.get() + 1);
                self.mac.set_receive_buffer(buf);
                return;
            }
        };

        let security = match header.security {
            None => {
                // Unsecured: yield immediately.
                let data_len = frame_len - data_offset;
                self.rx_client.map(|client| {
                    client.receive(frame_buffer, header, lqi, data_offset, data_len);
                });
                self.mac.set_receive_buffer(buf);
                return;
            }
            Some(security) => security,
        };

        let mic_len = security.level.mic_len();
        if frame_len < data_offset + mic_len {
            self.parse_errors.set(self.parse_errors.get() + 1);
            self.mac.set_receive_buffer(buf);
            return;
        }
        let data_len = frame_len - data_offset - mic_len;

        // Step e: look the key up.
        let key_seq;
        let key = match self
            .key_procedure
            .and_then(|keys| keys.lookup_key(security.level, security.key_id))
        {
            Some((key, seq)) => {
                key_seq = seq;
                key
            }
            None => {
                self.drop_secured(SecurityError::UnknownKey, header.src_addr);
                self.mac.set_receive_buffer(buf);
                return;
            }
        };

        // Step f: obtain the sender's extended address.
        let device_addr = match header
            .src_addr
            .and_then(|addr| match addr {
                MacAddress::Long(long) => Some(long),
                short => self
                    .device_procedure
                    .and_then(|devices| devices.lookup_addr_long(short)),
            }) {
            Some(addr) => addr,
            None => {
                self.drop_secured(SecurityError::Malformed, header.src_addr);
                self.mac.set_receive_buffer(buf);
                return;
            }
        };

        // Steps g, h: frame counter checks.
        let frame_counter = security.frame_counter;
        if frame_counter == 0xffff_ffff {
            self.drop_secured(SecurityError::Malformed, header.src_addr);
            self.mac.set_receive_buffer(buf);
            return;
        }
        let replayed = self
            .device_procedure
            .and_then(|devices| devices.link_frame_counter(&device_addr, key_seq))
            .is_some_and(|last| frame_counter <= last);
        if replayed {
            self.drop_secured(SecurityError::Replayed, header.src_addr);
            self.mac.set_receive_buffer(buf);
            return;
        }

        let nonce = get_ccm_nonce(&device_addr, frame_counter, security.level);
        let info = FrameInfo {
            frame_type: header.frame_type,
            data_offset,
            data_len,
            mic_len,
            security_params: Some((security.level, key, nonce)),
            params: TxParameters::default(),
        };

        if self.aes_ccm.set_key(&key).is_err() || self.aes_ccm.set_nonce(&nonce).is_err() {
            self.drop_secured(SecurityError::Malformed, header.src_addr);
            self.mac.set_receive_buffer(buf);
            return;
        }

        let (m_off, m_len) = info.ccm_encrypt_ranges();
        let (a_off, m_off) = (PSDU_OFFSET, PSDU_OFFSET + m_off);

        // The state must be in place before `crypt`: the software engine
        // completes inline.
        self.rx_state.replace(RxState::Decrypting(info, lqi));
        let level = security.level;
        if let Err((_, buf)) = self.aes_ccm.crypt(
            buf,
            a_off,
            m_off,
            m_len,
            info.mic_len,
            level.encryption_needed(),
            false,
        ) {
            self.rx_state.replace(RxState::Idle);
            self.drop_secured(SecurityError::Malformed, header.src_addr);
            self.mac.set_receive_buffer(buf);
        }
    }

    /// Advances the transmission pipeline if it can be advanced.
    fn step_transmit_state(&self) -> Result<(), (ErrorCode, &'static mut [u8])> {
        let state = match self.tx_state.take() {
            Some(state) => state,
            None => return Err((ErrorCode::FAIL, &mut [])),
        };
        match state {
            TxState::Idle => {
                self.tx_state.replace(TxState::Idle);
                Ok(())
            }
            TxState::ReadyToEncrypt(info, buf) => match info.security_params {
                None => {
                    // Only entered with security parameters present.
                    self.tx_state.replace(TxState::Idle);
                    Err((ErrorCode::FAIL, buf))
                }
                Some((level, key, nonce)) => {
                    if self.aes_ccm.set_key(&key).is_err()
                        || self.aes_ccm.set_nonce(&nonce).is_err()
                    {
                        self.tx_state.replace(TxState::Idle);
                        Err((ErrorCode::FAIL, buf))
                    } else {
                        let (m_off, m_len) = info.ccm_encrypt_ranges();
                        // Set the state first: the software engine calls
                        // `crypt_done` before `crypt` returns.
                        self.tx_state.replace(TxState::Encrypting(info));
                        match self.aes_ccm.crypt(
                            buf,
                            0,
                            m_off,
                            m_len,
                            info.mic_len,
                            level.encryption_needed(),
                            true,
                        ) {
                            Ok(()) => Ok(()),
                            Err((ErrorCode::BUSY, buf)) => {
                                self.tx_state.replace(TxState::ReadyToEncrypt(info, buf));
                                Ok(())
                            }
                            Err((ecode, buf)) => {
                                self.tx_state.replace(TxState::Idle);
                                Err((ecode, buf))
                            }
                        }
                    }
                }
            },
            TxState::Encrypting(info) => {
                // Advanced only by the encryption callback.
                self.tx_state.replace(TxState::Encrypting(info));
                Ok(())
            }
            TxState::ReadyToTransmit(info, buf) => {
                self.tx_secured.set(info.security_params.is_some());
                match self.mac.transmit(buf, info.secured_length(), info.params) {
                    // The MAC is busy; a send_done callback will retrigger
                    // this state transition.
                    Err((ErrorCode::BUSY, buf)) => {
                        self.tx_state.replace(TxState::ReadyToTransmit(info, buf));
                        Ok(())
                    }
                    Ok(()) => {
                        self.tx_state.replace(TxState::Idle);
                        Ok(())
                    }
                    Err((ecode, buf)) => {
                        self.tx_state.replace(TxState::Idle);
                        Err((ecode, buf))
                    }
                }
            }
        }
    }
}

impl<'a, M: Mac<'a>, A: AES128CCM<'a>> MacDevice<'a> for Framer<'a, M, A> {
    fn set_transmit_client(&self, client: &'a dyn TxClient) {
        self.tx_client.set(client);
    }

    fn set_receive_client(&self, client: &'a dyn RxClient) {
        self.rx_client.set(client);
    }

    fn get_address(&self) -> u16 {
        self.mac.get_address()
    }

    fn get_address_long(&self) -> [u8; 8] {
        self.mac.get_address_long()
    }

    fn get_pan(&self) -> u16 {
        self.mac.get_pan()
    }

    fn get_channel(&self) -> u8 {
        self.mac.get_channel()
    }

    fn set_address(&self, addr: u16) {
        self.mac.set_address(addr)
    }

    fn set_address_long(&self, addr: [u8; 8]) {
        self.mac.set_address_long(addr)
    }

    fn set_pan(&self, id: u16) {
        self.mac.set_pan(id)
    }

    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode> {
        self.mac.set_channel(chan)
    }

    fn config_commit(&self) {
        self.mac.config_commit()
    }

    fn is_on(&self) -> bool {
        self.mac.is_on()
    }

    fn prepare_data_frame(
        &self,
        buf: &'static mut [u8],
        dst_pan: PanID,
        dst_addr: MacAddress,
        src_pan: PanID,
        src_addr: MacAddress,
        security_needed: Option<(SecurityLevel, KeyId)>,
    ) -> Result<Frame, &'static mut [u8]> {
        self.prepare_frame(
            buf,
            FrameType::Data,
            dst_pan,
            dst_addr,
            src_pan,
            src_addr,
            None,
            security_needed,
        )
    }

    fn prepare_command_frame(
        &self,
        buf: &'static mut [u8],
        dst_pan: PanID,
        dst_addr: MacAddress,
        src_pan: PanID,
        src_addr: MacAddress,
        command_id: u8,
        security_needed: Option<(SecurityLevel, KeyId)>,
    ) -> Result<Frame, &'static mut [u8]> {
        self.prepare_frame(
            buf,
            FrameType::MACCommand,
            dst_pan,
            dst_addr,
            src_pan,
            src_addr,
            Some(command_id),
            security_needed,
        )
    }

    fn transmit(&self, frame: Frame) -> Result<(), (ErrorCode, &'static mut [u8])> {
        let Frame { buf, info } = frame;
        match self.tx_state.take() {
            None => Err((ErrorCode::FAIL, buf)),
            Some(TxState::Idle) => {
                let next_state = self.outgoing_frame_security(buf, info);
                self.tx_state.replace(next_state);
                self.step_transmit_state()
            }
            Some(other_state) => {
                self.tx_state.replace(other_state);
                Err((ErrorCode::BUSY, buf))
            }
        }
    }
}

impl<'a, M: Mac<'a>, A: AES128CCM<'a>> crate::ieee802154::device::TxClient for Framer<'a, M, A> {
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        self.data_sequence.set(self.data_sequence.get().wrapping_add(1));
        if self.tx_secured.take() && result.is_ok() {
            self.counter_client.map(|client| {
                client.mac_frame_counter_advanced(self.frame_counter.get());
            });
        }
        self.tx_client.map(move |client| {
            client.send_done(buf, acked, ack_frame_pending, result);
        });
    }
}

impl<'a, M: Mac<'a>, A: AES128CCM<'a>> radio::RxClient for Framer<'a, M, A> {
    fn receive(
        &self,
        buf: &'static mut [u8],
        frame_len: usize,
        lqi: u8,
        crc_valid: bool,
        _result: Result<(), ErrorCode>,
    ) {
        if !crc_valid {
            self.mac.set_receive_buffer(buf);
            return;
        }
        let idle = self.rx_state.map_or(false, |state| *state == RxState::Idle);
        if idle {
            self.incoming_frame_security(buf, frame_len, lqi);
        } else {
            // The reception pipeline is occupied; the frame is dropped.
            self.mac.set_receive_buffer(buf);
        }
    }
}

impl<'a, M: Mac<'a>, A: AES128CCM<'a>> CCMClient for Framer<'a, M, A> {
    fn crypt_done(&self, buf: &'static mut [u8], res: Result<(), ErrorCode>, tag_is_valid: bool) {
        // Transmission pipeline?
        let opt_buf = match self.tx_state.take() {
            Some(TxState::Encrypting(info)) => {
                let res2 = match res {
                    Err(ecode) => {
                        self.tx_state.replace(TxState::Idle);
                        Err((ecode, buf))
                    }
                    Ok(()) => {
                        self.tx_state.replace(TxState::ReadyToTransmit(info, buf));
                        self.step_transmit_state()
                    }
                };
                if let Err((ecode, buf)) = res2 {
                    self.tx_client.map(move |client| {
                        client.send_done(buf, false, false, Err(ecode));
                    });
                }
                None
            }
            Some(other) => {
                self.tx_state.replace(other);
                Some(buf)
            }
            None => Some(buf),
        };

        // Otherwise it belongs to the reception pipeline.
        if let Some(buf) = opt_buf {
            match self.rx_state.take() {
                Some(RxState::Decrypting(info, lqi)) => {
                    self.rx_state.replace(RxState::Idle);
                    if res.is_err() || !tag_is_valid {
                        self.drop_secured(SecurityError::MicFailed, None);
                        self.mac.set_receive_buffer(buf);
                        return;
                    }
                    // Accepted: advance the sender's counter window, then
                    // re-parse the now-plaintext frame and yield it.
                    let frame_len = info.secured_length();
                    let frame_buffer = &buf[PSDU_OFFSET..PSDU_OFFSET + frame_len];
                    if let Some((_, header)) = Header::decode(frame_buffer).done() {
                        if let (Some(security), Some(src_addr)) = (header.security, header.src_addr)
                        {
                            let device_addr = match src_addr {
                                MacAddress::Long(long) => Some(long),
                                short => self
                                    .device_procedure
                                    .and_then(|devices| devices.lookup_addr_long(short)),
                            };
                            if let Some(device_addr) = device_addr {
                                let key_seq = self
                                    .key_procedure
                                    .and_then(|keys| {
                                        keys.lookup_key(security.level, security.key_id)
                                    })
                                    .map_or(0, |(_, seq)| seq);
                                self.device_procedure.map(|devices| {
                                    devices.set_link_frame_counter(
                                        &device_addr,
                                        key_seq,
                                        security.frame_counter,
                                    );
                                });
                            }
                        }
                        self.rx_client.map(|client| {
                            client.receive(frame_buffer, header, lqi, info.data_offset, info.data_len);
                        });
                    }
                    self.mac.set_receive_buffer(buf);
                }
                Some(other) => {
                    self.rx_state.replace(other);
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ieee802154::mac::CsmaMac;
    use crate::ieee802154::source_match::SourceMatch;
    use crate::symmetric_encryption::aes_ccm::Aes128CcmSw;
    use crate::test::fake_radio::FakeRadio;
    use crate::test::fake_rng::FakeRng;
    use capsules_core::test::fake_alarm::FakeAlarm;
    use kernel::hil::radio::RadioConfig;
    use kernel::hil::radio::RadioData;
    use kernel::hil::time::Alarm;
    use kernel::utilities::cells::MapCell;
    use std::boxed::Box;

    const PAN: PanID = 0x1234;
    const OUR_SHORT: u16 = 0x0001;
    const OUR_EXT: [u8; 8] = [0xac, 0xde, 0x48, 0x00, 0x00, 0x00, 0x00, 0x01];
    const KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    struct TestKeys;

    impl KeyProcedure for TestKeys {
        fn lookup_key(&self, _level: SecurityLevel, key_id: KeyId) -> Option<([u8; 16], u32)> {
            match key_id {
                KeyId::Index(1) => Some((KEY, 0)),
                _ => None,
            }
        }

        fn outgoing_key(&self) -> Option<(KeyId, [u8; 16], u32)> {
            Some((KeyId::Index(1), KEY, 0))
        }
    }

    struct TestDevices {
        counter: Cell<Option<u32>>,
    }

    impl DeviceProcedure for TestDevices {
        fn lookup_addr_long(&self, addr: MacAddress) -> Option<[u8; 8]> {
            match addr {
                MacAddress::Long(long) => Some(long),
                MacAddress::Short(_) => None,
            }
        }

        fn link_frame_counter(&self, _addr: &[u8; 8], _key_seq: u32) -> Option<u32> {
            self.counter.get()
        }

        fn set_link_frame_counter(&self, _addr: &[u8; 8], _key_seq: u32, counter: u32) {
            self.counter.set(Some(counter));
        }
    }

    struct DevRxCatcher {
        count: Cell<u32>,
        payload: MapCell<([u8; 32], usize)>,
        last_secured: Cell<bool>,
    }

    impl DevRxCatcher {
        fn new() -> DevRxCatcher {
            DevRxCatcher {
                count: Cell::new(0),
                payload: MapCell::empty(),
                last_secured: Cell::new(false),
            }
        }
    }

    impl RxClient for DevRxCatcher {
        fn receive(&self, buf: &[u8], header: Header, _lqi: u8, data_offset: usize, data_len: usize) {
            self.count.set(self.count.get() + 1);
            let mut payload = [0u8; 32];
            payload[..data_len].copy_from_slice(&buf[data_offset..data_offset + data_len]);
            self.payload.put((payload, data_len));
            self.last_secured.set(header.security.is_some());
        }
    }

    struct CounterCatcher {
        counter: Cell<Option<u32>>,
    }

    impl SecurityCounterClient for CounterCatcher {
        fn mac_frame_counter_advanced(&self, counter: u32) {
            self.counter.set(Some(counter));
        }
    }

    struct NullTxClient;
    impl TxClient for NullTxClient {
        fn send_done(
            &self,
            _buf: &'static mut [u8],
            _acked: bool,
            _ack_frame_pending: bool,
            _result: Result<(), ErrorCode>,
        ) {
        }
    }

    fn leak_buf() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; radio::MAX_BUF_SIZE]))
    }

    macro_rules! fixture {
        ($radio:ident, $alarm:ident, $rng:ident, $sm:ident, $mac:ident, $ccm:ident, $framer:ident) => {
            let $radio = FakeRadio::new();
            let $alarm = FakeAlarm::new();
            let $rng = FakeRng::new(0);
            let $sm = SourceMatch::new();
            let $ccm = Aes128CcmSw::new();
            let $mac = CsmaMac::new(&$radio, &$alarm, &$rng, &$sm, leak_buf());
            let $framer = Framer::new(&$mac, &$ccm);
            $radio.set_transmit_client(&$mac);
            $radio.set_receive_client(&$mac);
            $alarm.set_alarm_client(&$mac);
            $ccm.set_client(&$framer);
            $mac.set_transmit_client(&$framer);
            $mac.set_receive_client(&$framer);
            $radio.set_address(OUR_SHORT);
            $radio.set_address_long(OUR_EXT);
            $mac.set_pan(PAN);
            $mac.start().unwrap();
        };
    }

    #[test]
    fn secured_roundtrip_then_replay_is_rejected() {
        let keys = TestKeys;
        let devices = TestDevices {
            counter: Cell::new(None),
        };
        let rx = DevRxCatcher::new();
        let counters = CounterCatcher {
            counter: Cell::new(None),
        };
        let tx_done = NullTxClient;
        fixture!(radio, alarm, rng, sm, mac, ccm, framer);
        framer.set_key_procedure(&keys);
        framer.set_device_procedure(&devices);
        framer.set_security_counter_client(&counters);
        framer.set_receive_client(&rx);
        framer.set_transmit_client(&tx_done);
        framer.set_frame_counter(100);

        // Send a frame to ourselves so the same key material unprotects it.
        let mut frame = framer
            .prepare_data_frame(
                leak_buf(),
                PAN,
                MacAddress::Short(OUR_SHORT),
                PAN,
                MacAddress::Long(OUR_EXT),
                Some((SecurityLevel::EncMic32, KeyId::Index(1))),
            )
            .ok()
            .unwrap();
        frame.append_payload(b"secret").unwrap();
        framer.transmit(frame).unwrap();
        assert!(alarm.trigger_next());

        // Capture the secured PSDU off the radio.
        let mut wire = [0u8; 127];
        let mut wire_len = 0;
        radio.inspect_tx(|psdu| {
            wire[..psdu.len()].copy_from_slice(psdu);
            wire_len = psdu.len();
        });
        assert!(wire_len > 0);
        // The payload must not appear in clear on the wire.
        assert!(!wire[..wire_len].windows(6).any(|w| w == b"secret"));
        radio.complete_tx();

        // Acknowledge so the counter client learns the advanced counter.
        mac.set_receive_buffer(leak_buf());
        let ack = Header {
            frame_type: FrameType::Acknowledgement,
            frame_pending: false,
            ack_requested: false,
            version: FrameVersion::V2006,
            seq: Some(0),
            dst_pan: None,
            dst_addr: None,
            src_pan: None,
            src_addr: None,
            security: None,
        };
        let mut ack_bytes = [0u8; 8];
        let (ack_len, ()) = ack.encode(&mut ack_bytes).done().unwrap();
        radio.deliver_frame(&ack_bytes[..ack_len], 255);
        assert_eq!(counters.counter.get(), Some(101));

        // Bypass MAC-level duplicate rejection: the replay must be caught by
        // the security procedure itself.
        mac.set_promiscuous(true);

        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&wire[..wire_len], 200);
        assert_eq!(rx.count.get(), 1);
        assert!(rx.last_secured.get());
        assert_eq!(devices.counter.get(), Some(100));
        rx.payload.map(|(payload, len)| {
            assert_eq!(&payload[..*len], b"secret");
        });

        // Identical bytes again: counter 100 is no longer fresh.
        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&wire[..wire_len], 200);
        assert_eq!(rx.count.get(), 1);
        assert_eq!(framer.security_error_count(), 1);
        assert_eq!(devices.counter.get(), Some(100));
    }

    #[test]
    fn unknown_key_index_is_dropped() {
        let keys = TestKeys;
        let devices = TestDevices {
            counter: Cell::new(None),
        };
        let rx = DevRxCatcher::new();
        fixture!(radio, alarm, rng, sm, mac, ccm, framer);
        framer.set_key_procedure(&keys);
        framer.set_device_procedure(&devices);
        framer.set_receive_client(&rx);
        mac.set_promiscuous(true);

        let header = Header {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_requested: false,
            version: FrameVersion::V2006,
            seq: Some(3),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Short(OUR_SHORT)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Long(OUR_EXT)),
            security: Some(Security {
                level: SecurityLevel::EncMic32,
                frame_counter: 1,
                key_id: KeyId::Index(9),
            }),
        };
        let mut bytes = [0u8; 64];
        let (mut len, ()) = header.encode(&mut bytes).done().unwrap();
        // Garbage payload and MIC; the key lookup fails first.
        len += 6;

        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&bytes[..len], 90);
        assert_eq!(rx.count.get(), 0);
        assert_eq!(framer.security_error_count(), 1);
    }

    #[test]
    fn unsecured_frames_bypass_the_security_procedure() {
        let rx = DevRxCatcher::new();
        fixture!(radio, alarm, rng, sm, mac, ccm, framer);
        framer.set_receive_client(&rx);

        let header = Header {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_requested: false,
            version: FrameVersion::V2006,
            seq: Some(4),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Short(OUR_SHORT)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Short(0x0099)),
            security: None,
        };
        let mut bytes = [0u8; 64];
        let (mut len, ()) = header.encode(&mut bytes).done().unwrap();
        bytes[len..len + 5].copy_from_slice(b"plain");
        len += 5;

        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&bytes[..len], 80);
        assert_eq!(rx.count.get(), 1);
        assert!(!rx.last_secured.get());
        rx.payload.map(|(payload, len)| {
            assert_eq!(&payload[..*len], b"plain");
        });
    }
}
