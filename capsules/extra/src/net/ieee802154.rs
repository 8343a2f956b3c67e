// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! IEEE 802.15.4 header representation, encoding and decoding.
//!
//! The codec locates and (de)serializes every MHR field, including the
//! auxiliary security header, but performs no cryptography: securing frames
//! is the framer's job. It writes only into caller-provided buffers and
//! never allocates.
//!
//! Wire format (IEEE 802.15.4-2006, little-endian):
//!
//! ```text
//! | FCF (2) | seq (1) | dst PAN (0/2) | dst addr (0/2/8)
//! | src PAN (0/2) | src addr (0/2/8) | aux security header (0/5/6/10/14)
//! | payload | MIC (0/4/8/16) | FCS (2) |
//! ```

use capsules_core::stream::SResult;
use capsules_core::stream::{decode_bytes, decode_u16, decode_u32, decode_u8};
use capsules_core::stream::{encode_bytes, encode_u16, encode_u32, encode_u8};

/// Maximum PSDU length, including the 2-byte FCS.
pub const MAX_FRAME_SIZE: usize = 127;

pub type PanID = u16;

/// The 16-bit broadcast short address.
pub const BROADCAST_ADDR: u16 = 0xffff;
/// Short address of a device that has not been assigned one.
pub const SHORT_ADDR_UNSPECIFIED: u16 = 0xfffe;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MacAddress {
    Short(u16),
    Long([u8; 8]),
}

impl MacAddress {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, MacAddress::Short(BROADCAST_ADDR))
    }

    fn address_mode(&self) -> AddressMode {
        match self {
            MacAddress::Short(_) => AddressMode::Short,
            MacAddress::Long(_) => AddressMode::Long,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrameType {
    Beacon = 0b000,
    Data = 0b001,
    Acknowledgement = 0b010,
    MACCommand = 0b011,
}

impl FrameType {
    pub fn from_fcf(fcf: u16) -> Option<FrameType> {
        match fcf & fcf::TYPE_MASK {
            0b000 => Some(FrameType::Beacon),
            0b001 => Some(FrameType::Data),
            0b010 => Some(FrameType::Acknowledgement),
            0b011 => Some(FrameType::MACCommand),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrameVersion {
    V2003 = 0b00,
    V2006 = 0b01,
    V2015 = 0b10,
}

impl FrameVersion {
    fn from_fcf(fcf: u16) -> Option<FrameVersion> {
        match (fcf & fcf::VERSION_MASK) >> fcf::VERSION_SHIFT {
            0b00 => Some(FrameVersion::V2003),
            0b01 => Some(FrameVersion::V2006),
            0b10 => Some(FrameVersion::V2015),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressMode {
    NotPresent = 0b00,
    Short = 0b10,
    Long = 0b11,
}

impl AddressMode {
    fn from_bits(bits: u16) -> Option<AddressMode> {
        match bits {
            0b00 => Some(AddressMode::NotPresent),
            0b10 => Some(AddressMode::Short),
            0b11 => Some(AddressMode::Long),
            // 0b01 is reserved
            _ => None,
        }
    }
}

/// Security level of the auxiliary security header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SecurityLevel {
    None = 0b000,
    Mic32 = 0b001,
    Mic64 = 0b010,
    Mic128 = 0b011,
    Enc = 0b100,
    EncMic32 = 0b101,
    EncMic64 = 0b110,
    EncMic128 = 0b111,
}

impl SecurityLevel {
    pub fn from_bits(bits: u8) -> Option<SecurityLevel> {
        match bits & 0b111 {
            0b000 => Some(SecurityLevel::None),
            0b001 => Some(SecurityLevel::Mic32),
            0b010 => Some(SecurityLevel::Mic64),
            0b011 => Some(SecurityLevel::Mic128),
            0b100 => Some(SecurityLevel::Enc),
            0b101 => Some(SecurityLevel::EncMic32),
            0b110 => Some(SecurityLevel::EncMic64),
            0b111 => Some(SecurityLevel::EncMic128),
            _ => None,
        }
    }

    /// Length of the message integrity code in bytes.
    pub fn mic_len(&self) -> usize {
        match *self {
            SecurityLevel::Mic32 | SecurityLevel::EncMic32 => 4,
            SecurityLevel::Mic64 | SecurityLevel::EncMic64 => 8,
            SecurityLevel::Mic128 | SecurityLevel::EncMic128 => 16,
            _ => 0,
        }
    }

    pub fn encryption_needed(&self) -> bool {
        matches!(
            *self,
            SecurityLevel::Enc
                | SecurityLevel::EncMic32
                | SecurityLevel::EncMic64
                | SecurityLevel::EncMic128
        )
    }
}

/// Key identifier, determining the key lookup procedure at the receiver.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum KeyId {
    /// Mode 0: known implicitly from the addressing.
    Implicit,
    /// Mode 1: index into a shared key list.
    Index(u8),
    /// Mode 2: 4-byte key source plus index.
    Source4Index([u8; 4], u8),
    /// Mode 3: 8-byte key source plus index.
    Source8Index([u8; 8], u8),
}

impl KeyId {
    fn mode_bits(&self) -> u8 {
        match *self {
            KeyId::Implicit => 0b00,
            KeyId::Index(_) => 0b01,
            KeyId::Source4Index(_, _) => 0b10,
            KeyId::Source8Index(_, _) => 0b11,
        }
    }

    fn encoded_len(&self) -> usize {
        match *self {
            KeyId::Implicit => 0,
            KeyId::Index(_) => 1,
            KeyId::Source4Index(_, _) => 5,
            KeyId::Source8Index(_, _) => 9,
        }
    }
}

/// Decoded auxiliary security header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Security {
    pub level: SecurityLevel,
    pub frame_counter: u32,
    pub key_id: KeyId,
}

impl Security {
    /// Length of the auxiliary security header on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.key_id.encoded_len()
    }

    pub fn encode(&self, buf: &mut [u8]) -> SResult {
        let control = (self.level as u8) | (self.key_id.mode_bits() << security::KEY_ID_MODE_SHIFT);
        let mut off = enc_consume!(buf; encode_u8, control);
        off = enc_consume!(buf, off; encode_u32, self.frame_counter);
        match self.key_id {
            KeyId::Implicit => {}
            KeyId::Index(index) => {
                off = enc_consume!(buf, off; encode_u8, index);
            }
            KeyId::Source4Index(ref src, index) => {
                off = enc_consume!(buf, off; encode_bytes, src);
                off = enc_consume!(buf, off; encode_u8, index);
            }
            KeyId::Source8Index(ref src, index) => {
                off = enc_consume!(buf, off; encode_bytes, src);
                off = enc_consume!(buf, off; encode_u8, index);
            }
        }
        stream_done!(off);
    }

    pub fn decode(buf: &[u8]) -> SResult<Security> {
        let (off, control) = dec_consume!(buf; decode_u8);
        let level = match SecurityLevel::from_bits(control & security::LEVEL_MASK) {
            Some(level) => level,
            None => stream_err!(),
        };
        stream_cond!(control & security::RESERVED_MASK == 0);
        let (off, frame_counter) = dec_consume!(buf, off; decode_u32);
        let (off, key_id) = match (control >> security::KEY_ID_MODE_SHIFT) & 0b11 {
            0b00 => (off, KeyId::Implicit),
            0b01 => {
                let (off, index) = dec_consume!(buf, off; decode_u8);
                (off, KeyId::Index(index))
            }
            0b10 => {
                let mut src = [0u8; 4];
                let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut src);
                let (off, index) = dec_consume!(buf, off; decode_u8);
                (off, KeyId::Source4Index(src, index))
            }
            _ => {
                let mut src = [0u8; 8];
                let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut src);
                let (off, index) = dec_consume!(buf, off; decode_u8);
                (off, KeyId::Source8Index(src, index))
            }
        };
        stream_done!(
            off,
            Security {
                level,
                frame_counter,
                key_id,
            }
        );
    }
}

mod fcf {
    pub const TYPE_MASK: u16 = 0b111;
    pub const SECURITY_ENABLED: u16 = 1 << 3;
    pub const FRAME_PENDING: u16 = 1 << 4;
    pub const ACK_REQUESTED: u16 = 1 << 5;
    pub const PAN_ID_COMPRESSION: u16 = 1 << 6;
    pub const DST_MODE_SHIFT: usize = 10;
    pub const DST_MODE_MASK: u16 = 0b11 << DST_MODE_SHIFT;
    pub const VERSION_SHIFT: usize = 12;
    pub const VERSION_MASK: u16 = 0b11 << VERSION_SHIFT;
    pub const SRC_MODE_SHIFT: usize = 14;
    pub const SRC_MODE_MASK: u16 = 0b11 << SRC_MODE_SHIFT;
}

mod security {
    pub const LEVEL_MASK: u8 = 0b111;
    pub const KEY_ID_MODE_SHIFT: usize = 3;
    pub const RESERVED_MASK: u8 = 0b1110_0000;
}

/// A decoded (or to-be-encoded) MAC header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Header {
    pub frame_type: FrameType,
    pub frame_pending: bool,
    pub ack_requested: bool,
    pub version: FrameVersion,
    pub seq: Option<u8>,
    pub dst_pan: Option<PanID>,
    pub dst_addr: Option<MacAddress>,
    pub src_pan: Option<PanID>,
    pub src_addr: Option<MacAddress>,
    pub security: Option<Security>,
}

impl Header {
    /// Length of the encoded MHR, including the auxiliary security header.
    pub fn encoded_len(&self) -> usize {
        let addr_len = |addr: &Option<MacAddress>| match addr {
            None => 0,
            Some(MacAddress::Short(_)) => 2,
            Some(MacAddress::Long(_)) => 8,
        };
        let mut len = 2;
        len += self.seq.map_or(0, |_| 1);
        len += self.dst_addr.map_or(0, |_| 2) + addr_len(&self.dst_addr);
        if !self.pan_id_compressed() {
            len += self.src_addr.map_or(0, |_| 2);
        }
        len += addr_len(&self.src_addr);
        len += self.security.as_ref().map_or(0, |sec| sec.encoded_len());
        len
    }

    /// Source PAN is elided when it would repeat the destination PAN.
    fn pan_id_compressed(&self) -> bool {
        match (self.dst_addr, self.src_addr) {
            (Some(_), Some(_)) => self.dst_pan == self.src_pan,
            _ => false,
        }
    }

    fn fcf(&self) -> u16 {
        let dst_mode = self
            .dst_addr
            .map_or(AddressMode::NotPresent, |a| a.address_mode());
        let src_mode = self
            .src_addr
            .map_or(AddressMode::NotPresent, |a| a.address_mode());
        let mut fcf = self.frame_type as u16;
        if self.security.is_some() {
            fcf |= fcf::SECURITY_ENABLED;
        }
        if self.frame_pending {
            fcf |= fcf::FRAME_PENDING;
        }
        if self.ack_requested {
            fcf |= fcf::ACK_REQUESTED;
        }
        if self.pan_id_compressed() {
            fcf |= fcf::PAN_ID_COMPRESSION;
        }
        fcf |= (dst_mode as u16) << fcf::DST_MODE_SHIFT;
        fcf |= (self.version as u16) << fcf::VERSION_SHIFT;
        fcf |= (src_mode as u16) << fcf::SRC_MODE_SHIFT;
        fcf
    }

    /// Serialize the header. `SResult::Done` carries the data offset, which
    /// is where the MAC payload begins.
    pub fn encode(&self, buf: &mut [u8]) -> SResult {
        // An address is always accompanied by its PAN (possibly compressed).
        stream_cond!(self.dst_addr.is_none() || self.dst_pan.is_some());
        stream_cond!(self.src_addr.is_none() || self.src_pan.is_some() || self.pan_id_compressed());

        let mut off = enc_consume!(buf; encode_u16, self.fcf());
        if let Some(seq) = self.seq {
            off = enc_consume!(buf, off; encode_u8, seq);
        }
        if self.dst_addr.is_some() {
            if let Some(pan) = self.dst_pan {
                off = enc_consume!(buf, off; encode_u16, pan);
            }
        }
        match self.dst_addr {
            None => {}
            Some(MacAddress::Short(addr)) => {
                off = enc_consume!(buf, off; encode_u16, addr);
            }
            Some(MacAddress::Long(ref addr)) => {
                off = enc_consume!(buf, off; encode_bytes, addr);
            }
        }
        if self.src_addr.is_some() && !self.pan_id_compressed() {
            if let Some(pan) = self.src_pan {
                off = enc_consume!(buf, off; encode_u16, pan);
            }
        }
        match self.src_addr {
            None => {}
            Some(MacAddress::Short(addr)) => {
                off = enc_consume!(buf, off; encode_u16, addr);
            }
            Some(MacAddress::Long(ref addr)) => {
                off = enc_consume!(buf, off; encode_bytes, addr);
            }
        }
        if let Some(ref security) = self.security {
            off = enc_consume!(buf, off; encode_security, security);
        }
        stream_done!(off);
    }

    /// Parse a header from the PSDU (FCS already stripped or beyond the
    /// slice). `SResult::Done` carries the data offset.
    pub fn decode(buf: &[u8]) -> SResult<Header> {
        stream_cond!(buf.len() <= MAX_FRAME_SIZE);
        let (off, fcf) = dec_consume!(buf; decode_u16);
        let frame_type = match FrameType::from_fcf(fcf) {
            Some(ft) => ft,
            None => stream_err!(),
        };
        let version = match FrameVersion::from_fcf(fcf) {
            Some(v) => v,
            None => stream_err!(),
        };
        let dst_mode = match AddressMode::from_bits((fcf & fcf::DST_MODE_MASK) >> fcf::DST_MODE_SHIFT)
        {
            Some(mode) => mode,
            None => stream_err!(),
        };
        let src_mode = match AddressMode::from_bits((fcf & fcf::SRC_MODE_MASK) >> fcf::SRC_MODE_SHIFT)
        {
            Some(mode) => mode,
            None => stream_err!(),
        };
        let compressed = fcf & fcf::PAN_ID_COMPRESSION != 0;
        // Compression is only meaningful with a destination PAN present.
        stream_cond!(!compressed || dst_mode != AddressMode::NotPresent);

        let (off, seq) = dec_consume!(buf, off; decode_u8);

        let (off, dst_pan) = if dst_mode != AddressMode::NotPresent {
            let (off, pan) = dec_consume!(buf, off; decode_u16);
            (off, Some(pan))
        } else {
            (off, None)
        };
        let (off, dst_addr) = dec_consume!(buf, off; decode_addr, dst_mode);
        let (off, src_pan) = if src_mode != AddressMode::NotPresent && !compressed {
            let (off, pan) = dec_consume!(buf, off; decode_u16);
            (off, Some(pan))
        } else if src_mode != AddressMode::NotPresent {
            (off, dst_pan)
        } else {
            (off, None)
        };
        let (off, src_addr) = dec_consume!(buf, off; decode_addr, src_mode);

        let (off, security) = if fcf & fcf::SECURITY_ENABLED != 0 {
            // 2003 security carries no auxiliary header we support.
            stream_cond!(version != FrameVersion::V2003);
            let (off, sec) = dec_consume!(buf, off; Security::decode);
            (off, Some(sec))
        } else {
            (off, None)
        };

        stream_done!(
            off,
            Header {
                frame_type,
                frame_pending: fcf & fcf::FRAME_PENDING != 0,
                ack_requested: fcf & fcf::ACK_REQUESTED != 0,
                version,
                seq: Some(seq),
                dst_pan,
                dst_addr,
                src_pan,
                src_addr,
                security,
            }
        );
    }

}

fn encode_security(buf: &mut [u8], security: &Security) -> SResult {
    security.encode(buf)
}

fn decode_addr(buf: &[u8], mode: AddressMode) -> SResult<Option<MacAddress>> {
    match mode {
        AddressMode::NotPresent => stream_done!(0, None),
        AddressMode::Short => {
            let (off, addr) = dec_consume!(buf; decode_u16);
            stream_done!(off, Some(MacAddress::Short(addr)));
        }
        AddressMode::Long => {
            let mut addr = [0u8; 8];
            let (off, ()) = dec_consume!(buf; decode_bytes, &mut addr);
            stream_done!(off, Some(MacAddress::Long(addr)));
        }
    }
}
