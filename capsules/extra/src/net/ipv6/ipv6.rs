// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! IPv6 interface state and the fixed header codec.
//!
//! The interface tracks the unicast address list, multicast subscriptions
//! and unsecure ports of one node. Datagram forwarding and resolution live
//! in the stack facade; this module only answers "is this address ours" and
//! frames datagrams with the 40-byte fixed header.

use crate::net::ipv6::ip_utils::IPAddr;

use capsules_core::stream::SResult;
use capsules_core::stream::{decode_bytes, decode_u16, decode_u8, encode_bytes, encode_u16, encode_u8};

use kernel::utilities::cells::{MapCell, OptionalCell};
use kernel::ErrorCode;

use core::cell::Cell;

pub const IP6_HDR_LEN: usize = 40;

const MAX_UNICAST: usize = 8;
const MAX_MULTICAST: usize = 8;
const MAX_UNSECURE_PORTS: usize = 4;

/// The IPv6 fixed header. Flow label and traffic class are carried but not
/// interpreted.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct IP6Header {
    pub version_class_flow: [u8; 4],
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: IPAddr,
    pub dst_addr: IPAddr,
}

impl IP6Header {
    pub fn new(src_addr: IPAddr, dst_addr: IPAddr, next_header: u8, payload_len: u16) -> IP6Header {
        IP6Header {
            version_class_flow: [0x60, 0, 0, 0],
            payload_len,
            next_header,
            hop_limit: 64,
            src_addr,
            dst_addr,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> SResult {
        let mut off = enc_consume!(buf; encode_bytes, &self.version_class_flow);
        // Length and port-like fields in IP headers are network order.
        off = enc_consume!(buf, off; encode_u16, self.payload_len.swap_bytes());
        off = enc_consume!(buf, off; encode_u8, self.next_header);
        off = enc_consume!(buf, off; encode_u8, self.hop_limit);
        off = enc_consume!(buf, off; encode_bytes, &self.src_addr.0);
        off = enc_consume!(buf, off; encode_bytes, &self.dst_addr.0);
        stream_done!(off);
    }

    pub fn decode(buf: &[u8]) -> SResult<IP6Header> {
        let mut version_class_flow = [0u8; 4];
        let (off, ()) = dec_consume!(buf; decode_bytes, &mut version_class_flow);
        stream_cond!(version_class_flow[0] >> 4 == 6);
        let (off, payload_len) = dec_consume!(buf, off; decode_u16);
        let (off, next_header) = dec_consume!(buf, off; decode_u8);
        let (off, hop_limit) = dec_consume!(buf, off; decode_u8);
        let mut src = [0u8; 16];
        let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut src);
        let mut dst = [0u8; 16];
        let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut dst);
        stream_done!(
            off,
            IP6Header {
                version_class_flow,
                payload_len: payload_len.swap_bytes(),
                next_header,
                hop_limit,
                src_addr: IPAddr(src),
                dst_addr: IPAddr(dst),
            }
        );
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct UnicastAddress {
    pub addr: IPAddr,
    pub prefix_len: u8,
}

/// Delivery callback for datagrams addressed to this node.
pub trait Ip6RxClient {
    fn datagram_received(&self, header: &IP6Header, payload: &[u8], link_secured: bool);
}

/// Per-node IPv6 interface state.
pub struct IP6Interface<'a> {
    enabled: Cell<bool>,
    unicast: MapCell<[Option<UnicastAddress>; MAX_UNICAST]>,
    multicast: MapCell<[Option<IPAddr>; MAX_MULTICAST]>,
    unsecure_ports: MapCell<[Option<u16>; MAX_UNSECURE_PORTS]>,
    rx_client: OptionalCell<&'a dyn Ip6RxClient>,
}

impl<'a> IP6Interface<'a> {
    pub fn new() -> IP6Interface<'a> {
        IP6Interface {
            enabled: Cell::new(false),
            unicast: MapCell::new([None; MAX_UNICAST]),
            multicast: MapCell::new([None; MAX_MULTICAST]),
            unsecure_ports: MapCell::new([None; MAX_UNSECURE_PORTS]),
            rx_client: OptionalCell::empty(),
        }
    }

    pub fn set_receive_client(&self, client: &'a dyn Ip6RxClient) {
        self.rx_client.set(client);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn add_unicast(&self, addr: IPAddr, prefix_len: u8) -> Result<(), ErrorCode> {
        self.unicast.map_or(Err(ErrorCode::NOMEM), |table| {
            if table
                .iter()
                .any(|slot| slot.is_some_and(|u| u.addr == addr))
            {
                return Err(ErrorCode::ALREADY);
            }
            match table.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(UnicastAddress { addr, prefix_len });
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn remove_unicast(&self, addr: &IPAddr) -> Result<(), ErrorCode> {
        self.unicast.map_or(Err(ErrorCode::NOTFOUND), |table| {
            match table
                .iter_mut()
                .find(|slot| slot.is_some_and(|u| u.addr == *addr))
            {
                Some(slot) => {
                    *slot = None;
                    Ok(())
                }
                None => Err(ErrorCode::NOTFOUND),
            }
        })
    }

    pub fn is_unicast(&self, addr: &IPAddr) -> bool {
        self.unicast.map_or(false, |table| {
            table.iter().any(|slot| slot.is_some_and(|u| u.addr == *addr))
        })
    }

    /// Run `f` for each configured unicast address.
    pub fn each_unicast<F: FnMut(&UnicastAddress)>(&self, mut f: F) {
        self.unicast.map(|table| {
            for slot in table.iter().flatten() {
                f(slot);
            }
        });
    }

    pub fn subscribe_multicast(&self, addr: IPAddr) -> Result<(), ErrorCode> {
        if !addr.is_multicast() {
            return Err(ErrorCode::INVAL);
        }
        self.multicast.map_or(Err(ErrorCode::NOMEM), |table| {
            if table.iter().any(|slot| *slot == Some(addr)) {
                return Err(ErrorCode::ALREADY);
            }
            match table.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(addr);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn unsubscribe_multicast(&self, addr: &IPAddr) -> Result<(), ErrorCode> {
        self.multicast.map_or(Err(ErrorCode::NOTFOUND), |table| {
            match table.iter_mut().find(|slot| **slot == Some(*addr)) {
                Some(slot) => {
                    *slot = None;
                    Ok(())
                }
                None => Err(ErrorCode::NOTFOUND),
            }
        })
    }

    pub fn is_multicast_subscribed(&self, addr: &IPAddr) -> bool {
        self.multicast
            .map_or(false, |table| table.iter().any(|slot| *slot == Some(*addr)))
    }

    pub fn add_unsecure_port(&self, port: u16) -> Result<(), ErrorCode> {
        self.unsecure_ports.map_or(Err(ErrorCode::NOMEM), |ports| {
            if ports.iter().any(|slot| *slot == Some(port)) {
                return Err(ErrorCode::ALREADY);
            }
            match ports.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(port);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn remove_unsecure_port(&self, port: u16) -> Result<(), ErrorCode> {
        self.unsecure_ports.map_or(Err(ErrorCode::NOTFOUND), |ports| {
            match ports.iter_mut().find(|slot| **slot == Some(port)) {
                Some(slot) => {
                    *slot = None;
                    Ok(())
                }
                None => Err(ErrorCode::NOTFOUND),
            }
        })
    }

    pub fn is_unsecure_port(&self, port: u16) -> bool {
        self.unsecure_ports
            .map_or(false, |ports| ports.iter().any(|slot| *slot == Some(port)))
    }

    /// Whether a datagram with this destination should be delivered locally.
    pub fn accepts(&self, dst: &IPAddr) -> bool {
        if !self.enabled.get() {
            return false;
        }
        if dst.is_multicast() {
            // All-nodes groups are implicit.
            dst.0[15] == 0x01 && dst.0[1] <= 0x03 && dst.0[2..15].iter().all(|&b| b == 0)
                || self.is_multicast_subscribed(dst)
        } else {
            self.is_unicast(dst)
        }
    }

    /// Deliver a datagram to the registered client.
    pub fn deliver(&self, header: &IP6Header, payload: &[u8], link_secured: bool) {
        self.rx_client.map(|client| {
            client.datagram_received(header, payload, link_secured);
        });
    }
}

impl<'a> Default for IP6Interface<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ipv6::ip_utils::{generate_link_local, LINK_LOCAL_ALL_NODES};

    #[test]
    fn header_roundtrip() {
        let src = generate_link_local(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let header = IP6Header::new(src, LINK_LOCAL_ALL_NODES, 17, 32);
        let mut buf = [0u8; IP6_HDR_LEN];
        let (len, ()) = header.encode(&mut buf).done().unwrap();
        assert_eq!(len, IP6_HDR_LEN);
        let (_, decoded) = IP6Header::decode(&buf).done().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unicast_add_is_idempotent_in_effect() {
        let iface: IP6Interface = IP6Interface::new();
        iface.set_enabled(true);
        let addr = generate_link_local(&[1, 2, 3, 4, 5, 6, 7, 8]);
        iface.add_unicast(addr, 64).unwrap();
        assert_eq!(iface.add_unicast(addr, 64), Err(ErrorCode::ALREADY));
        assert!(iface.accepts(&addr));
        iface.remove_unicast(&addr).unwrap();
        assert!(!iface.accepts(&addr));
    }

    #[test]
    fn multicast_subscription_controls_acceptance() {
        let iface: IP6Interface = IP6Interface::new();
        iface.set_enabled(true);
        // All-nodes is accepted without subscription.
        assert!(iface.accepts(&LINK_LOCAL_ALL_NODES));
        let group = IPAddr::parse("ff03::1234").unwrap();
        assert!(!iface.accepts(&group));
        iface.subscribe_multicast(group).unwrap();
        assert!(iface.accepts(&group));
        assert_eq!(iface.subscribe_multicast(group), Err(ErrorCode::ALREADY));
        iface.unsubscribe_multicast(&group).unwrap();
        assert!(!iface.accepts(&group));
    }

    #[test]
    fn unsecure_ports() {
        let iface: IP6Interface = IP6Interface::new();
        iface.add_unsecure_port(1234).unwrap();
        assert!(iface.is_unsecure_port(1234));
        assert!(!iface.is_unsecure_port(4321));
        iface.remove_unsecure_port(1234).unwrap();
        assert!(!iface.is_unsecure_port(1234));
    }
}
