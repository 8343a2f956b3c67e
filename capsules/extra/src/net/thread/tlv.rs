// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! MLE TLV encoding and decoding.
//!
//! MLE message bodies are a sequence of `(type, length, value)` triples.
//! Multi-byte integers inside TLV values are big-endian, per the MLE wire
//! format.

use capsules_core::stream::SResult;
use capsules_core::stream::{encode_bytes, encode_u8};

/// Leader data advertised by routers and carried in attach handshakes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LeaderData {
    pub partition_id: u32,
    pub weighting: u8,
    pub data_version: u8,
    pub stable_data_version: u8,
    pub leader_router_id: u8,
}

/// Contents of a Connectivity TLV.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Connectivity {
    pub parent_priority: i8,
    pub link_quality_3: u8,
    pub link_quality_2: u8,
    pub link_quality_1: u8,
    pub leader_cost: u8,
    pub id_sequence: u8,
    pub active_routers: u8,
    pub sed_buffer_size: u16,
    pub sed_datagram_count: u8,
}

/// Contents of a Route64 TLV: the allocated router-id set plus per-router
/// cost nibbles.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Route64 {
    pub id_sequence: u8,
    /// Bit N set when router-id N is allocated.
    pub id_mask: u64,
    pub route_data: [u8; 63],
    pub route_count: u8,
}

impl Default for Route64 {
    fn default() -> Self {
        Route64 {
            id_sequence: 0,
            id_mask: 0,
            route_data: [0; 63],
            route_count: 0,
        }
    }
}

/// Device mode bits of the Mode TLV.
pub enum LinkMode {
    FullNetworkDataRequired = 0x01,
    FullThreadDevice = 0x02,
    SecureDataRequests = 0x04,
    ReceiverOnWhenIdle = 0x08,
}

/// Scan Mask TLV bits selecting who answers a Parent Request.
pub enum MulticastResponder {
    Router = 0x80,
    EndDevice = 0x40,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Tlv<'a> {
    SourceAddress(u16),
    Mode(u8),
    Timeout(u32),
    Challenge([u8; 8]),
    Response([u8; 8]),
    LinkLayerFrameCounter(u32),
    MleFrameCounter(u32),
    Route64(Route64),
    Address16(u16),
    LeaderData(LeaderData),
    NetworkData(&'a [u8]),
    TlvRequest(&'a [u8]),
    ScanMask(u8),
    Connectivity(Connectivity),
    LinkMargin(u8),
    Status(u8),
    Version(u16),
    AddressRegistration(&'a [u8]),
    ActiveTimestamp(u64),
}

mod tlv_type {
    pub const SOURCE_ADDRESS: u8 = 0;
    pub const MODE: u8 = 1;
    pub const TIMEOUT: u8 = 2;
    pub const CHALLENGE: u8 = 3;
    pub const RESPONSE: u8 = 4;
    pub const LINK_LAYER_FRAME_COUNTER: u8 = 5;
    pub const MLE_FRAME_COUNTER: u8 = 8;
    pub const ROUTE64: u8 = 9;
    pub const ADDRESS16: u8 = 10;
    pub const LEADER_DATA: u8 = 11;
    pub const NETWORK_DATA: u8 = 12;
    pub const TLV_REQUEST: u8 = 13;
    pub const SCAN_MASK: u8 = 14;
    pub const CONNECTIVITY: u8 = 15;
    pub const LINK_MARGIN: u8 = 16;
    pub const STATUS: u8 = 17;
    pub const VERSION: u8 = 18;
    pub const ADDRESS_REGISTRATION: u8 = 19;
    pub const ACTIVE_TIMESTAMP: u8 = 22;
}

impl<'a> Tlv<'a> {
    pub fn type_byte(&self) -> u8 {
        match *self {
            Tlv::SourceAddress(_) => tlv_type::SOURCE_ADDRESS,
            Tlv::Mode(_) => tlv_type::MODE,
            Tlv::Timeout(_) => tlv_type::TIMEOUT,
            Tlv::Challenge(_) => tlv_type::CHALLENGE,
            Tlv::Response(_) => tlv_type::RESPONSE,
            Tlv::LinkLayerFrameCounter(_) => tlv_type::LINK_LAYER_FRAME_COUNTER,
            Tlv::MleFrameCounter(_) => tlv_type::MLE_FRAME_COUNTER,
            Tlv::Route64(_) => tlv_type::ROUTE64,
            Tlv::Address16(_) => tlv_type::ADDRESS16,
            Tlv::LeaderData(_) => tlv_type::LEADER_DATA,
            Tlv::NetworkData(_) => tlv_type::NETWORK_DATA,
            Tlv::TlvRequest(_) => tlv_type::TLV_REQUEST,
            Tlv::ScanMask(_) => tlv_type::SCAN_MASK,
            Tlv::Connectivity(_) => tlv_type::CONNECTIVITY,
            Tlv::LinkMargin(_) => tlv_type::LINK_MARGIN,
            Tlv::Status(_) => tlv_type::STATUS,
            Tlv::Version(_) => tlv_type::VERSION,
            Tlv::AddressRegistration(_) => tlv_type::ADDRESS_REGISTRATION,
            Tlv::ActiveTimestamp(_) => tlv_type::ACTIVE_TIMESTAMP,
        }
    }

    /// Serialize into `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut [u8]) -> SResult {
        let mut off = enc_consume!(buf; encode_u8, self.type_byte());
        match *self {
            Tlv::SourceAddress(addr) | Tlv::Address16(addr) => {
                off = enc_consume!(buf, off; encode_u8, 2);
                off = enc_consume!(buf, off; encode_bytes, &addr.to_be_bytes());
            }
            Tlv::Mode(mode) => {
                off = enc_consume!(buf, off; encode_u8, 1);
                off = enc_consume!(buf, off; encode_u8, mode);
            }
            Tlv::Timeout(val)
            | Tlv::LinkLayerFrameCounter(val)
            | Tlv::MleFrameCounter(val) => {
                off = enc_consume!(buf, off; encode_u8, 4);
                off = enc_consume!(buf, off; encode_bytes, &val.to_be_bytes());
            }
            Tlv::Challenge(bytes) | Tlv::Response(bytes) => {
                off = enc_consume!(buf, off; encode_u8, 8);
                off = enc_consume!(buf, off; encode_bytes, &bytes);
            }
            Tlv::Route64(ref route) => {
                let count = route.route_count as usize;
                off = enc_consume!(buf, off; encode_u8, (9 + count) as u8);
                off = enc_consume!(buf, off; encode_u8, route.id_sequence);
                off = enc_consume!(buf, off; encode_bytes, &route.id_mask.to_be_bytes());
                off = enc_consume!(buf, off; encode_bytes, &route.route_data[..count]);
            }
            Tlv::LeaderData(ref ld) => {
                off = enc_consume!(buf, off; encode_u8, 8);
                off = enc_consume!(buf, off; encode_bytes, &ld.partition_id.to_be_bytes());
                off = enc_consume!(buf, off; encode_u8, ld.weighting);
                off = enc_consume!(buf, off; encode_u8, ld.data_version);
                off = enc_consume!(buf, off; encode_u8, ld.stable_data_version);
                off = enc_consume!(buf, off; encode_u8, ld.leader_router_id);
            }
            Tlv::NetworkData(data) | Tlv::TlvRequest(data) | Tlv::AddressRegistration(data) => {
                stream_cond!(data.len() <= 255);
                off = enc_consume!(buf, off; encode_u8, data.len() as u8);
                off = enc_consume!(buf, off; encode_bytes, data);
            }
            Tlv::ScanMask(mask) => {
                off = enc_consume!(buf, off; encode_u8, 1);
                off = enc_consume!(buf, off; encode_u8, mask);
            }
            Tlv::Connectivity(ref c) => {
                off = enc_consume!(buf, off; encode_u8, 10);
                off = enc_consume!(buf, off; encode_u8, c.parent_priority as u8);
                off = enc_consume!(buf, off; encode_u8, c.link_quality_3);
                off = enc_consume!(buf, off; encode_u8, c.link_quality_2);
                off = enc_consume!(buf, off; encode_u8, c.link_quality_1);
                off = enc_consume!(buf, off; encode_u8, c.leader_cost);
                off = enc_consume!(buf, off; encode_u8, c.id_sequence);
                off = enc_consume!(buf, off; encode_u8, c.active_routers);
                off = enc_consume!(buf, off; encode_bytes, &c.sed_buffer_size.to_be_bytes());
                off = enc_consume!(buf, off; encode_u8, c.sed_datagram_count);
            }
            Tlv::LinkMargin(margin) => {
                off = enc_consume!(buf, off; encode_u8, 1);
                off = enc_consume!(buf, off; encode_u8, margin);
            }
            Tlv::Status(status) => {
                off = enc_consume!(buf, off; encode_u8, 1);
                off = enc_consume!(buf, off; encode_u8, status);
            }
            Tlv::Version(version) => {
                off = enc_consume!(buf, off; encode_u8, 2);
                off = enc_consume!(buf, off; encode_bytes, &version.to_be_bytes());
            }
            Tlv::ActiveTimestamp(ts) => {
                off = enc_consume!(buf, off; encode_u8, 8);
                off = enc_consume!(buf, off; encode_bytes, &ts.to_be_bytes());
            }
        }
        stream_done!(off);
    }
}

/// Offset consumed by a successful encode, 0 otherwise.
pub fn unwrap_tlv_offset(res: SResult) -> usize {
    match res {
        SResult::Done(off, ()) => off,
        _ => 0,
    }
}

/// Locate the value of the first TLV of the given type.
pub fn find_tlv<'b>(buf: &'b [u8], tlv_type: u8) -> Option<&'b [u8]> {
    let mut index = 0;
    while index + 2 <= buf.len() {
        let t = buf[index];
        let len = buf[index + 1] as usize;
        if index + 2 + len > buf.len() {
            return None;
        }
        if t == tlv_type {
            return Some(&buf[index + 2..index + 2 + len]);
        }
        index += 2 + len;
    }
    None
}

fn be16(value: &[u8]) -> Option<u16> {
    if value.len() < 2 {
        return None;
    }
    Some(((value[0] as u16) << 8) | value[1] as u16)
}

fn be32(value: &[u8]) -> Option<u32> {
    if value.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

/// Typed accessors over a TLV sequence.
pub struct TlvReader<'b> {
    buf: &'b [u8],
}

impl<'b> TlvReader<'b> {
    pub fn new(buf: &'b [u8]) -> TlvReader<'b> {
        TlvReader { buf }
    }

    pub fn bytes(&self, tlv_type: u8) -> Option<&'b [u8]> {
        find_tlv(self.buf, tlv_type)
    }

    pub fn source_address(&self) -> Option<u16> {
        self.bytes(tlv_type::SOURCE_ADDRESS).and_then(be16)
    }

    pub fn address16(&self) -> Option<u16> {
        self.bytes(tlv_type::ADDRESS16).and_then(be16)
    }

    pub fn mode(&self) -> Option<u8> {
        self.bytes(tlv_type::MODE).and_then(|v| v.first().copied())
    }

    pub fn timeout(&self) -> Option<u32> {
        self.bytes(tlv_type::TIMEOUT).and_then(be32)
    }

    pub fn challenge(&self) -> Option<[u8; 8]> {
        self.bytes(tlv_type::CHALLENGE).and_then(|v| v.try_into().ok())
    }

    pub fn response(&self) -> Option<[u8; 8]> {
        self.bytes(tlv_type::RESPONSE).and_then(|v| v.try_into().ok())
    }

    pub fn link_layer_frame_counter(&self) -> Option<u32> {
        self.bytes(tlv_type::LINK_LAYER_FRAME_COUNTER).and_then(be32)
    }

    pub fn mle_frame_counter(&self) -> Option<u32> {
        self.bytes(tlv_type::MLE_FRAME_COUNTER).and_then(be32)
    }

    pub fn scan_mask(&self) -> Option<u8> {
        self.bytes(tlv_type::SCAN_MASK).and_then(|v| v.first().copied())
    }

    pub fn link_margin(&self) -> Option<u8> {
        self.bytes(tlv_type::LINK_MARGIN)
            .and_then(|v| v.first().copied())
    }

    pub fn status(&self) -> Option<u8> {
        self.bytes(tlv_type::STATUS).and_then(|v| v.first().copied())
    }

    pub fn version(&self) -> Option<u16> {
        self.bytes(tlv_type::VERSION).and_then(be16)
    }

    pub fn leader_data(&self) -> Option<LeaderData> {
        let v = self.bytes(tlv_type::LEADER_DATA)?;
        if v.len() < 8 {
            return None;
        }
        Some(LeaderData {
            partition_id: be32(v)?,
            weighting: v[4],
            data_version: v[5],
            stable_data_version: v[6],
            leader_router_id: v[7],
        })
    }

    pub fn connectivity(&self) -> Option<Connectivity> {
        let v = self.bytes(tlv_type::CONNECTIVITY)?;
        if v.len() < 10 {
            return None;
        }
        Some(Connectivity {
            parent_priority: v[0] as i8,
            link_quality_3: v[1],
            link_quality_2: v[2],
            link_quality_1: v[3],
            leader_cost: v[4],
            id_sequence: v[5],
            active_routers: v[6],
            sed_buffer_size: be16(&v[7..9])?,
            sed_datagram_count: v[9],
        })
    }

    pub fn route64(&self) -> Option<Route64> {
        let v = self.bytes(tlv_type::ROUTE64)?;
        if v.len() < 9 {
            return None;
        }
        let mut route = Route64 {
            id_sequence: v[0],
            id_mask: u64::from_be_bytes([v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]]),
            ..Route64::default()
        };
        let count = (v.len() - 9).min(63);
        route.route_data[..count].copy_from_slice(&v[9..9 + count]);
        route.route_count = count as u8;
        Some(route)
    }

    pub fn network_data(&self) -> Option<&'b [u8]> {
        self.bytes(tlv_type::NETWORK_DATA)
    }

    pub fn tlv_request(&self) -> Option<&'b [u8]> {
        self.bytes(tlv_type::TLV_REQUEST)
    }

    pub fn address_registration(&self) -> Option<&'b [u8]> {
        self.bytes(tlv_type::ADDRESS_REGISTRATION)
    }
}

pub use tlv_type::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_find() {
        let mut buf = [0u8; 64];
        let mut off = 0;
        off += unwrap_tlv_offset(Tlv::Mode(0x0f).encode(&mut buf[off..]));
        off += unwrap_tlv_offset(Tlv::Challenge([1, 2, 3, 4, 5, 6, 7, 8]).encode(&mut buf[off..]));
        off += unwrap_tlv_offset(Tlv::SourceAddress(0x0401).encode(&mut buf[off..]));
        off += unwrap_tlv_offset(Tlv::Version(4).encode(&mut buf[off..]));

        let reader = TlvReader::new(&buf[..off]);
        assert_eq!(reader.mode(), Some(0x0f));
        assert_eq!(reader.challenge(), Some([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(reader.source_address(), Some(0x0401));
        assert_eq!(reader.version(), Some(4));
        assert_eq!(reader.timeout(), None);
    }

    #[test]
    fn leader_data_roundtrip() {
        let ld = LeaderData {
            partition_id: 0xdeadbeef,
            weighting: 64,
            data_version: 7,
            stable_data_version: 5,
            leader_router_id: 2,
        };
        let mut buf = [0u8; 16];
        let off = unwrap_tlv_offset(Tlv::LeaderData(ld).encode(&mut buf));
        assert_eq!(off, 10);
        let reader = TlvReader::new(&buf[..off]);
        assert_eq!(reader.leader_data(), Some(ld));
    }

    #[test]
    fn route64_roundtrip() {
        let mut route = Route64 {
            id_sequence: 9,
            id_mask: (1 << 63) | (1 << 62),
            ..Route64::default()
        };
        route.route_data[0] = 0x11;
        route.route_data[1] = 0x22;
        route.route_count = 2;
        let mut buf = [0u8; 32];
        let off = unwrap_tlv_offset(Tlv::Route64(route).encode(&mut buf));
        let reader = TlvReader::new(&buf[..off]);
        let decoded = reader.route64().unwrap();
        assert_eq!(decoded.id_sequence, 9);
        assert_eq!(decoded.id_mask, route.id_mask);
        assert_eq!(decoded.route_count, 2);
        assert_eq!(&decoded.route_data[..2], &[0x11, 0x22]);
    }

    #[test]
    fn truncated_tlv_is_not_found() {
        // Length byte claims more than the buffer holds.
        let buf = [tlv_type::CHALLENGE, 8, 1, 2, 3];
        assert_eq!(find_tlv(&buf, tlv_type::CHALLENGE), None);
    }
}
