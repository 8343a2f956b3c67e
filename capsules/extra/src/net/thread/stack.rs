// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The assembled stack: the in-process instance the application talks to.
//!
//! `ThreadStack` composes the MAC, the MLE engine, the tables and the IPv6
//! surface, and owns the glue none of them should know about: the datagram
//! transmit path (queueing through the message pool, EID resolution,
//! indirect queueing toward sleepy children), the receive demultiplexer (MAC
//! data requests to the indirect sender, address query/notification
//! handling, delivery to the IPv6 client), and the lifecycle reactions
//! (address configuration on attach, cleanup when children leave).
//!
//! Address queries ride as bare IPv6 datagrams with experimental protocol
//! numbers: a query carries the target EID, the notification answers with
//! the target and its RLOC16. (The original uses CoAP for this; CoAP is an
//! external collaborator here.)
//!
//! The datagram drain runs as a deferred call: events (a completed send, an
//! arriving notification, a new datagram) only schedule it, and it executes
//! when the embedder services the tasklet queue, before the next event is
//! dispatched. When both the radio and a TREL transport can reach a
//! neighbor, the per-neighbor preference picks the link; acknowledgement
//! outcomes on either link move the preference, and the unselected TREL
//! link is probed probabilistically.

use crate::ieee802154::device::{self, MacDevice};
use crate::ieee802154::framer::DeviceProcedure;
use crate::ieee802154::indirect::{IndirectSender, IndirectTxClient};
use crate::net::ieee802154::{
    FrameType, Header, KeyId, MacAddress, SecurityLevel, BROADCAST_ADDR,
};
use crate::net::ipv6::ip_utils::{
    self, generate_link_local, make_rloc, IPAddr, LINK_LOCAL_ALL_ROUTERS,
};
use crate::net::ipv6::{IP6Header, IP6Interface, IP6_HDR_LEN};
use crate::net::message::{MessageHandle, MessagePool, MessagePriority, MessageType, PriorityQueue};
use crate::net::thread::address_resolver::{AddressQuerySender, AddressResolver};
use crate::net::thread::key_manager::{key_index_for, KeyManager};
use crate::net::thread::mle::{Mle, MleObserver, Role};
use crate::net::thread::neighbor::{
    NeighborEvent, NeighborObserver, NeighborTable, StateFilter,
};
use crate::net::thread::radio_selector::{self, ProbeConfig, RadioType};
use crate::settings::Settings;

use kernel::deferred_call::{DeferredCall, DeferredCallClient, DeferredCallQueue};
use kernel::hil::rng::Rng;
use kernel::hil::time::Alarm;
use kernel::hil::trel::TrelSender;
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::ErrorCode;

use core::cell::Cell;

/// Experimental protocol number carrying an address query (target EID).
pub const PROTO_ADDRESS_QUERY: u8 = 253;
/// Experimental protocol number carrying an address notification
/// (target EID, RLOC16).
pub const PROTO_ADDRESS_NOTIFY: u8 = 254;

/// Mesh-local prefix of the operational dataset.
pub const DEFAULT_MESH_LOCAL_PREFIX: [u8; 8] = [0xfd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

pub struct ThreadStack<'a, M: MacDevice<'a>, A: Alarm<'a>> {
    mac: &'a M,
    mle: &'a Mle<'a, M, A>,
    keys: &'a KeyManager<'a>,
    neighbors: &'a NeighborTable<'a>,
    ip6: &'a IP6Interface<'a>,
    pool: &'a MessagePool,
    tx_queue: PriorityQueue,
    resolver: &'a AddressResolver<'a, A>,
    indirect: &'a IndirectSender<'a, M>,
    settings: &'a Settings<'a>,
    rng: &'a dyn Rng,

    mesh_local_prefix: Cell<[u8; 8]>,
    tx_buf: TakeCell<'static, [u8]>,
    /// Datagram currently being transmitted directly.
    in_flight: Cell<Option<MessageHandle>>,
    /// Unicast destination of that transmission, for the radio selector.
    in_flight_dst: Cell<Option<[u8; 8]>>,
    /// The datagram drain tasklet.
    deferred_call: DeferredCall<'a>,
    trel: OptionalCell<&'a dyn TrelSender>,
    trel_probe: ProbeConfig,
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> ThreadStack<'a, M, A> {
    pub fn new(
        mac: &'a M,
        mle: &'a Mle<'a, M, A>,
        keys: &'a KeyManager<'a>,
        neighbors: &'a NeighborTable<'a>,
        ip6: &'a IP6Interface<'a>,
        pool: &'a MessagePool,
        resolver: &'a AddressResolver<'a, A>,
        indirect: &'a IndirectSender<'a, M>,
        settings: &'a Settings<'a>,
        rng: &'a dyn Rng,
        tx_buf: &'static mut [u8],
    ) -> ThreadStack<'a, M, A> {
        ThreadStack {
            mac,
            mle,
            keys,
            neighbors,
            ip6,
            pool,
            tx_queue: PriorityQueue::new(pool),
            resolver,
            indirect,
            settings,
            rng,
            mesh_local_prefix: Cell::new(DEFAULT_MESH_LOCAL_PREFIX),
            tx_buf: TakeCell::new(tx_buf),
            in_flight: Cell::new(None),
            in_flight_dst: Cell::new(None),
            deferred_call: DeferredCall::new(),
            trel: OptionalCell::empty(),
            trel_probe: ProbeConfig::new(0),
        }
    }

    /// Register the datagram-drain tasklet with the embedder's queue. Must
    /// be called at initialization, like the other client wiring.
    pub fn register_deferred_call(&'a self, queue: &DeferredCallQueue<'a>) {
        queue.register(&self.deferred_call, self);
    }

    /// Attach the optional TREL transport for this node.
    pub fn set_trel_transport(&self, trel: &'a dyn TrelSender) {
        self.trel.set(trel);
    }

    /// Percentage of transmissions that additionally probe an unselected
    /// TREL link.
    pub fn set_trel_probe_percent(&self, percent: u8) {
        self.trel_probe.set_percent(percent);
    }

    /// The platform's TREL driver discovered a peer (DNS-SD).
    pub fn trel_peer_discovered(&self, peer: &[u8; 8]) {
        self.neighbors
            .with_neighbor_by_ext(peer, StateFilter::InStateAnyExceptInvalid, |n| {
                radio_selector::add_supported(n, RadioType::TrelUdp6);
            });
    }

    /// Deferred acknowledgement outcome from the TREL transport.
    pub fn trel_ack_received(&self, peer: &[u8; 8], acked: bool) {
        self.neighbors
            .with_neighbor_by_ext(peer, StateFilter::InStateAnyExceptInvalid, |n| {
                n.radios.pending_acks = n.radios.pending_acks.saturating_sub(1);
                // Whether the neighbor may be removed is left to aging: a
                // retained neighbor simply stays until its timer expires.
                radio_selector::update_on_deferred_ack(n, acked)
            });
    }

    // --- operational configuration ---

    pub fn set_pan_id(&self, pan: u16) {
        self.mac.set_pan(pan);
        self.mac.config_commit();
    }

    pub fn set_channel(&self, channel: u8) -> Result<(), ErrorCode> {
        self.mac.set_channel(channel)?;
        self.mac.config_commit();
        Ok(())
    }

    pub fn set_network_key(&self, key: [u8; 16]) {
        self.keys.set_master_key(key);
    }

    pub fn set_mesh_local_prefix(&self, prefix: [u8; 8]) {
        self.mesh_local_prefix.set(prefix);
    }

    pub fn mesh_local_prefix(&self) -> [u8; 8] {
        self.mesh_local_prefix.get()
    }

    /// Bring the interface and the protocol up.
    pub fn start(&self) -> Result<(), ErrorCode> {
        self.ip6.set_enabled(true);
        let ll = generate_link_local(&self.mac.get_address_long());
        let _ = self.ip6.add_unicast(ll, 64);
        self.mle.start()
    }

    pub fn stop(&self) -> Result<(), ErrorCode> {
        self.ip6.set_enabled(false);
        self.mle.stop()
    }

    pub fn wipe(&self) {
        self.settings.wipe();
    }

    pub fn role(&self) -> Role {
        self.mle.role()
    }

    pub fn rloc16(&self) -> u16 {
        self.mle.rloc16()
    }

    pub fn child_count(&self) -> usize {
        self.neighbors.child_count(StateFilter::InStateValid)
    }

    pub fn router_count(&self) -> usize {
        self.neighbors.router_count(StateFilter::InStateValid)
    }

    // --- datagram path ---

    /// Queue an IPv6 datagram for delivery inside the mesh.
    pub fn send_datagram(
        &self,
        dst: IPAddr,
        next_header: u8,
        payload: &[u8],
    ) -> Result<(), ErrorCode> {
        if !self.ip6.is_enabled() {
            return Err(ErrorCode::STATE);
        }
        let src = self.source_address_for(&dst);
        let header = IP6Header::new(src, dst, next_header, payload.len() as u16);
        let mut header_bytes = [0u8; IP6_HDR_LEN];
        let (header_len, ()) = match header.encode(&mut header_bytes).done() {
            Some(done) => done,
            None => return Err(ErrorCode::FAIL),
        };

        let handle = self
            .pool
            .allocate(MessagePriority::Normal, MessageType::Ip6, true)
            .ok_or(ErrorCode::NOMEM)?;
        if let Err(e) = self
            .pool
            .append(handle, &header_bytes[..header_len])
            .and_then(|()| self.pool.append(handle, payload))
        {
            let _ = self.pool.free(handle);
            return Err(e);
        }
        self.tx_queue.enqueue(self.pool, handle)?;
        self.schedule_drain();
        Ok(())
    }

    /// Defer the drain to the tasklet queue so it runs after the current
    /// event, before the next one. Runs inline only when no queue is wired.
    fn schedule_drain(&self) {
        if self.deferred_call.is_registered() {
            self.deferred_call.schedule();
        } else {
            self.drain_tx_queue();
        }
    }

    fn source_address_for(&self, dst: &IPAddr) -> IPAddr {
        let our_ext = self.mac.get_address_long();
        if dst.is_unicast_link_local() || dst.is_multicast() {
            generate_link_local(&our_ext)
        } else {
            make_rloc(&self.mesh_local_prefix.get(), self.mle.rloc16())
        }
    }

    /// Map an in-mesh destination to a MAC address, possibly consulting the
    /// resolver.
    fn route_datagram(&self, dst: &IPAddr) -> Result<MacAddress, ErrorCode> {
        if dst.is_multicast() {
            return Ok(MacAddress::Short(BROADCAST_ADDR));
        }
        if dst.is_unicast_link_local() {
            return Ok(MacAddress::Long(ip_utils::ext_addr_from_iid(dst)));
        }
        if let Some(rloc16) = ip_utils::rloc16_of(&self.mesh_local_prefix.get(), dst) {
            return Ok(MacAddress::Short(rloc16));
        }
        self.resolver.resolve(dst).map(MacAddress::Short)
    }

    fn drain_tx_queue(&self) {
        loop {
            if self.in_flight.get().is_some() || self.tx_buf.is_none() {
                return;
            }
            let Some(handle) = self.tx_queue.dequeue(self.pool) else {
                return;
            };

            let mut header_bytes = [0u8; IP6_HDR_LEN];
            if self.pool.read(handle, 0, &mut header_bytes) < IP6_HDR_LEN {
                let _ = self.pool.free(handle);
                continue;
            }
            let Some((_, header)) = IP6Header::decode(&header_bytes).done() else {
                let _ = self.pool.free(handle);
                continue;
            };

            let dst = match self.route_datagram(&header.dst_addr) {
                Ok(dst) => dst,
                Err(ErrorCode::BUSY) => {
                    // Resolution is in progress; park the datagram and try
                    // again when the notification arrives.
                    if self.tx_queue.enqueue(self.pool, handle).is_err() {
                        let _ = self.pool.free(handle);
                    }
                    return;
                }
                Err(_) => {
                    let _ = self.pool.free(handle);
                    continue;
                }
            };

            // Multi-radio selection for unicast neighbors: the preference
            // picks the link, and the unselected TREL link may be probed.
            let dst_ext = match dst {
                MacAddress::Short(BROADCAST_ADDR) => None,
                addr => self.neighbors.lookup_addr_long(addr),
            };
            let selection = dst_ext.and_then(|ext| {
                self.neighbors
                    .with_neighbor_by_ext(&ext, StateFilter::InStateAnyExceptInvalid, |n| {
                        // The selection-order fallback can name a link the
                        // neighbor was never seen on; commit to TREL only
                        // when it is actually supported.
                        let trel_ok = radio_selector::supports(n, RadioType::TrelUdp6);
                        let selected = radio_selector::select(n);
                        let probe = self.trel_probe.should_probe(n, selected, self.rng);
                        (selected == RadioType::TrelUdp6 && trel_ok, probe)
                    })
            });
            if let (Some(ext), Some((trel_selected, probe))) = (dst_ext, selection) {
                if (trel_selected || probe) && self.trel.is_some() {
                    if self.send_over_trel(&ext, handle) && trel_selected {
                        // TREL carries the datagram; its deferred ack will
                        // move the preference later.
                        let _ = self.pool.free(handle);
                        continue;
                    }
                    // A probe rides alongside the radio transmission.
                }
            }

            // A frame destined to one of our sleepy children waits in the
            // indirect queue for its poll.
            let sleepy_child = match dst {
                MacAddress::Short(rloc) => self
                    .neighbors
                    .find_child_by_short(rloc, StateFilter::InStateValid)
                    .and_then(|i| {
                        self.neighbors
                            .with_child(i, |c| !c.neighbor.mode.rx_on_when_idle())
                    })
                    .unwrap_or(false),
                _ => false,
            };

            let Some(buf) = self.tx_buf.take() else {
                // Lost the buffer race; put the datagram back.
                if self.tx_queue.enqueue(self.pool, handle).is_err() {
                    let _ = self.pool.free(handle);
                }
                return;
            };

            let pan = self.mac.get_pan();
            let security = if self.pool.link_security(handle) {
                Some((
                    SecurityLevel::EncMic32,
                    KeyId::Index(key_index_for(self.keys.key_sequence())),
                ))
            } else {
                None
            };
            let src_mac = MacAddress::Short(self.mle.rloc16());
            let frame = match self.mac.prepare_data_frame(buf, pan, dst, pan, src_mac, security) {
                Ok(mut frame) => {
                    let mut chunk = [0u8; 64];
                    let mut offset = 0;
                    let len = self.pool.len(handle);
                    let mut ok = true;
                    while offset < len {
                        let n = self.pool.read(handle, offset, &mut chunk);
                        if n == 0 || frame.append_payload(&chunk[..n]).is_err() {
                            ok = false;
                            break;
                        }
                        offset += n;
                    }
                    if !ok {
                        self.tx_buf.replace(frame.into_buf());
                        let _ = self.pool.free(handle);
                        continue;
                    }
                    frame
                }
                Err(buf) => {
                    self.tx_buf.replace(buf);
                    let _ = self.pool.free(handle);
                    continue;
                }
            };

            if sleepy_child {
                match self.indirect.queue_frame(dst, frame) {
                    Ok(()) => {
                        let _ = self.pool.free(handle);
                        // The indirect queue owns the frame; our buffer is
                        // gone until its send completes.
                    }
                    Err((_, frame)) => {
                        self.tx_buf.replace(frame.into_buf());
                        let _ = self.pool.free(handle);
                        kernel::debug!("[stack] indirect queue full; datagram dropped");
                    }
                }
                continue;
            }

            self.in_flight.set(Some(handle));
            self.in_flight_dst.set(dst_ext);
            if let Err((ecode, buf)) = self.mac.transmit(frame) {
                self.tx_buf.replace(buf);
                self.in_flight.set(None);
                self.in_flight_dst.set(None);
                let _ = self.pool.free(handle);
                kernel::debug!("[stack] datagram transmit failed: {:?}", ecode);
            }
        }
    }

    /// Hand the datagram to the TREL transport. Returns whether it was
    /// accepted; a deferred acknowledgement follows either way later.
    fn send_over_trel(&self, ext: &[u8; 8], handle: MessageHandle) -> bool {
        let Some(trel) = self.trel.get() else {
            return false;
        };
        let mut dgram = [0u8; IP6_HDR_LEN + crate::net::message::BUFFER_SIZE];
        let len = self.pool.read(handle, 0, &mut dgram);
        if len == 0 || trel.send(ext, &dgram[..len]).is_err() {
            return false;
        }
        self.neighbors
            .with_neighbor_by_ext(ext, StateFilter::InStateAnyExceptInvalid, |n| {
                n.radios.pending_acks = n.radios.pending_acks.saturating_add(1);
            });
        true
    }

    fn handle_datagram(&self, header: &IP6Header, payload: &[u8], link_secured: bool) {
        match header.next_header {
            PROTO_ADDRESS_QUERY => {
                if payload.len() < 16 {
                    return;
                }
                let mut target = [0u8; 16];
                target.copy_from_slice(&payload[..16]);
                let target = IPAddr(target);
                if self.ip6.is_unicast(&target) {
                    // It is ours: answer with our RLOC16.
                    let mut notify = [0u8; 18];
                    notify[..16].copy_from_slice(&target.0);
                    notify[16..18].copy_from_slice(&self.mle.rloc16().to_be_bytes());
                    let _ = self.send_datagram(header.src_addr, PROTO_ADDRESS_NOTIFY, &notify);
                }
            }
            PROTO_ADDRESS_NOTIFY => {
                if payload.len() < 18 {
                    return;
                }
                let mut target = [0u8; 16];
                target.copy_from_slice(&payload[..16]);
                let rloc16 = u16::from_be_bytes([payload[16], payload[17]]);
                self.resolver.handle_notification(&IPAddr(target), rloc16);
                // A parked datagram may now be routable.
                self.schedule_drain();
            }
            _ => {
                if self.ip6.accepts(&header.dst_addr) {
                    self.ip6.deliver(header, payload, link_secured);
                }
            }
        }
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> device::TxClient for ThreadStack<'a, M, A> {
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        _ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        self.tx_buf.replace(buf);
        if let Some(handle) = self.in_flight.take() {
            let _ = self.pool.free(handle);
        }
        if let Some(ext) = self.in_flight_dst.take() {
            self.neighbors
                .with_neighbor_by_ext(&ext, StateFilter::InStateAnyExceptInvalid, |n| {
                    radio_selector::update_on_send_done(n, RadioType::Ieee802154, acked);
                });
        }
        if let Err(ecode) = result {
            kernel::debug!("[stack] datagram send failed: {:?}", ecode);
        }
        self.schedule_drain();
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> device::RxClient for ThreadStack<'a, M, A> {
    fn receive(&self, buf: &[u8], header: Header, _lqi: u8, data_offset: usize, data_len: usize) {
        let payload = &buf[data_offset..data_offset + data_len];
        match header.frame_type {
            FrameType::MACCommand => {
                // Data request: flush the indirect queue for this child.
                if payload.first() == Some(&0x04) {
                    if let Some(src) = header.src_addr {
                        let dst = match src {
                            MacAddress::Short(_) => src,
                            MacAddress::Long(ext) => {
                                // Children queue under their short address.
                                self.neighbors
                                    .find_child_by_ext(&ext, StateFilter::InStateValid)
                                    .and_then(|i| {
                                        self.neighbors.with_child(i, |c| c.neighbor.rloc16)
                                    })
                                    .map(MacAddress::Short)
                                    .unwrap_or(src)
                            }
                        };
                        self.indirect.on_data_request(dst);
                    }
                }
            }
            FrameType::Data => {
                // MLE has its own dispatch; everything else is a datagram.
                if payload.first() == Some(&0) {
                    return;
                }
                if let Some((hdr_len, ip6_header)) = IP6Header::decode(payload).done() {
                    let body = &payload[hdr_len..];
                    // An EID source plus a short MAC source reveals a
                    // mapping worth snooping.
                    let src = &ip6_header.src_addr;
                    if ip_utils::rloc16_of(&self.mesh_local_prefix.get(), src).is_none()
                        && !src.is_unicast_link_local()
                        && !src.is_multicast()
                    {
                        if let Some(MacAddress::Short(rloc)) = header.src_addr {
                            self.resolver.snoop(src, rloc);
                        }
                    }
                    self.handle_datagram(&ip6_header, body, header.security.is_some());
                }
            }
            _ => {}
        }
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> AddressQuerySender for ThreadStack<'a, M, A> {
    fn send_address_query(&self, target: &IPAddr) {
        let _ = self.send_datagram(LINK_LOCAL_ALL_ROUTERS, PROTO_ADDRESS_QUERY, &target.0);
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> IndirectTxClient for ThreadStack<'a, M, A> {
    fn indirect_send_done(
        &self,
        _dst: MacAddress,
        buf: &'static mut [u8],
        _acked: bool,
        _result: Result<(), ErrorCode>,
    ) {
        self.tx_buf.replace(buf);
        self.schedule_drain();
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> DeferredCallClient for ThreadStack<'a, M, A> {
    fn handle_deferred_call(&self) {
        self.drain_tx_queue();
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> MleObserver for ThreadStack<'a, M, A> {
    fn role_changed(&self, role: Role) {
        match role {
            Role::Child | Role::Router | Role::Leader => {
                // Configure the mesh-local RLOC for the new role.
                let rloc_addr = make_rloc(&self.mesh_local_prefix.get(), self.mle.rloc16());
                let _ = self.ip6.add_unicast(rloc_addr, 64);
            }
            _ => {}
        }
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> NeighborObserver for ThreadStack<'a, M, A> {
    fn neighbor_event(&self, event: NeighborEvent, _ext_addr: &[u8; 8], rloc16: u16) {
        match event {
            NeighborEvent::ChildRemoved => {
                // Departed children lose their queued frames and stale
                // address mappings.
                self.indirect.purge(MacAddress::Short(rloc16));
                self.resolver.invalidate_rloc(rloc16);
            }
            NeighborEvent::RouterRemoved => {
                self.resolver.invalidate_rloc(rloc16);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ieee802154::framer::Framer;
    use crate::ieee802154::mac::CsmaMac;
    use crate::ieee802154::mac::Mac;
    use crate::ieee802154::source_match::SourceMatch;
    use kernel::hil::radio::RadioConfig;
    use kernel::hil::radio::RadioData;
    use kernel::hil::symmetric_encryption::AES128CCM;
    use crate::ieee802154::virtual_mac::{MacUser, MuxMac};
    use crate::net::ipv6::Ip6RxClient;
    use crate::net::thread::network_data::NetworkData;
    use crate::net::thread::radio_selector::{HIGH_PREFERENCE, INIT_PREFERENCE};
    use crate::settings::test::FakeStore;
    use crate::symmetric_encryption::aes_ccm::Aes128CcmSw;
    use crate::test::fake_radio::FakeRadio;
    use crate::test::fake_rng::FakeRng;
    use capsules_core::test::fake_alarm::FakeAlarm;
    use capsules_core::virtualizers::virtual_alarm::{MuxAlarm, VirtualMuxAlarm};
    use kernel::hil::radio as hil_radio;
    use kernel::utilities::cells::MapCell;
    use std::boxed::Box;

    const PAN: u16 = 0x1234;
    const OUR_EXT: [u8; 8] = [0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11];
    const MASTER: [u8; 16] = [0x42; 16];

    fn leak_buf() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; hil_radio::MAX_BUF_SIZE]))
    }

    macro_rules! fixture {
        ($radio:ident, $mac_alarm:ident, $mle_alarm:ident, $res_alarm:ident, $rng:ident,
         $sm:ident, $ccm:ident, $store:ident, $settings:ident, $km:ident, $nt:ident, $nd:ident,
         $pool:ident, $ip6:ident, $mac:ident, $framer:ident, $mux:ident, $mle_user:ident,
         $stack_user:ident, $mle:ident, $resolver:ident, $indirect:ident, $deferred:ident,
         $stack:ident) => {
            let $radio = FakeRadio::new();
            let $mac_alarm = FakeAlarm::new();
            let $mle_alarm = FakeAlarm::new();
            let $res_alarm = FakeAlarm::new();
            let $rng = FakeRng::counting_from(0);
            let $sm = SourceMatch::new();
            let $ccm = Aes128CcmSw::new();
            let $store = FakeStore::new();
            let $settings = Settings::new(&$store);
            let $km = KeyManager::new();
            let $nt = NeighborTable::new();
            let $nd = NetworkData::new();
            let $pool = MessagePool::new();
            let $ip6 = IP6Interface::new();
            let $mac = CsmaMac::new(&$radio, &$mac_alarm, &$rng, &$sm, leak_buf());
            let $framer = Framer::new(&$mac, &$ccm);
            let $mux = MuxMac::new(&$framer);
            let $mle_user = MacUser::new(&$mux);
            let $stack_user = MacUser::new(&$mux);
            let $mle = Mle::new(
                &$mle_user,
                &$mle_alarm,
                &$rng,
                &$km,
                &$nt,
                &$nd,
                &$settings,
                leak_buf(),
            );
            let $resolver = AddressResolver::new(&$res_alarm);
            let $indirect = IndirectSender::new(&$stack_user, &$sm);
            let $deferred = DeferredCallQueue::new();
            let $stack = ThreadStack::new(
                &$stack_user,
                &$mle,
                &$km,
                &$nt,
                &$ip6,
                &$pool,
                &$resolver,
                &$indirect,
                &$settings,
                &$rng,
                leak_buf(),
            );
            $stack.register_deferred_call(&$deferred);
            $radio.set_transmit_client(&$mac);
            $radio.set_receive_client(&$mac);
            $mac_alarm.set_alarm_client(&$mac);
            $ccm.set_client(&$framer);
            $mac.set_transmit_client(&$framer);
            $mac.set_receive_client(&$framer);
            $framer.set_transmit_client(&$mux);
            $framer.set_receive_client(&$mux);
            $framer.set_key_procedure(&$km);
            $framer.set_device_procedure(&$nt);
            $mux.add_user(&$mle_user);
            $mux.add_user(&$stack_user);
            $mle_user.set_transmit_client(&$mle);
            $mle_user.set_receive_client(&$mle);
            $stack_user.set_transmit_client(&$stack);
            $stack_user.set_receive_client(&$stack);
            $mle_alarm.set_alarm_client(&$mle);
            $res_alarm.set_alarm_client(&$resolver);
            $resolver.set_query_sender(&$stack);
            $indirect.set_client(&$stack);
            $nt.set_observer(&$stack);
            $mle.set_observer(&$stack);
            $radio.set_address_long(OUR_EXT);
            $radio.set_address(0x0001);
            $mac.set_pan(PAN);
            $km.set_master_key(MASTER);
            $mac.start().unwrap();
            $ip6.set_enabled(true);
            let ll = generate_link_local(&OUR_EXT);
            let _ = $ip6.add_unicast(ll, 64);
        };
    }

    #[test]
    fn link_local_datagram_is_secured_and_framed() {
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );

        let peer_ext = [0x77u8; 8];
        let dst = generate_link_local(&peer_ext);
        stack.send_datagram(dst, 17, b"hello mesh").unwrap();
        // The drain is a tasklet: nothing happens until the queue is
        // serviced, then the frame enters CSMA.
        assert!(!mac_alarm.trigger_next());
        assert!(deferred.service());
        assert!(mac_alarm.trigger_next());
        assert!(radio.pending_tx());
        radio.inspect_tx(|frame| {
            let (off, header) = Header::decode(frame).done().unwrap();
            assert_eq!(header.dst_addr, Some(MacAddress::Long(peer_ext)));
            // Datagram frames carry link security.
            assert!(header.security.is_some());
            // The payload is encrypted: the plaintext must not show.
            assert!(!frame[off..].windows(10).any(|w| w == b"hello mesh"));
        });
        radio.complete_tx();
        deferred.service();
        // The message returned to the pool once the frame went out.
        assert_eq!(pool.free_buffer_count(), crate::net::message::NUM_BUFFERS);
    }

    #[test]
    fn unknown_eid_queries_then_delivers() {
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );

        let eid = IPAddr::parse("fd00:aaaa::1234").unwrap();
        stack.send_datagram(eid, 17, b"payload").unwrap();
        assert!(deferred.service());
        // The datagram parks; an address query broadcast goes out instead.
        assert!(mac_alarm.trigger_next());
        let mut is_query = false;
        radio.inspect_tx(|frame| {
            let (off, header) = Header::decode(frame).done().unwrap();
            assert!(header.dst_addr.unwrap().is_broadcast());
            // Multicasts are still secured; decode the IP header after the
            // framer's view: header.security present.
            assert!(header.security.is_some());
            let _ = off;
            is_query = true;
        });
        assert!(is_query);
        radio.complete_tx();
        deferred.service();

        // Answer the query with a notification datagram from the owner.
        let owner_rloc: u16 = 0x0c00;
        let mut notify = [0u8; 18];
        notify[..16].copy_from_slice(&eid.0);
        notify[16..18].copy_from_slice(&owner_rloc.to_be_bytes());
        let src_ip = make_rloc(&DEFAULT_MESH_LOCAL_PREFIX, owner_rloc);
        let our_ll = generate_link_local(&OUR_EXT);
        let ip6_header = IP6Header::new(src_ip, our_ll, PROTO_ADDRESS_NOTIFY, 18);
        let mut payload = [0u8; IP6_HDR_LEN + 18];
        let (hlen, ()) = ip6_header.encode(&mut payload).done().unwrap();
        payload[hlen..hlen + 18].copy_from_slice(&notify);

        let mac_header = Header {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_requested: false,
            version: crate::net::ieee802154::FrameVersion::V2006,
            seq: Some(9),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Long(OUR_EXT)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Short(owner_rloc)),
            security: None,
        };
        let mut frame = [0u8; 127];
        let (mut flen, ()) = mac_header.encode(&mut frame).done().unwrap();
        frame[flen..flen + payload.len()].copy_from_slice(&payload[..hlen + 18]);
        flen += hlen + 18;
        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&frame[..flen], 100);
        assert!(deferred.service());

        // Resolution completed and the parked datagram went out to the
        // resolved RLOC.
        assert!(mac_alarm.trigger_next());
        radio.inspect_tx(|frame| {
            let (_, header) = Header::decode(frame).done().unwrap();
            assert_eq!(header.dst_addr, Some(MacAddress::Short(owner_rloc)));
        });
        radio.complete_tx();
        assert_eq!(resolver.resolve(&eid), Ok(owner_rloc));
    }

    struct DeliverySpy {
        count: Cell<u32>,
        last_proto: Cell<u8>,
    }

    impl Ip6RxClient for DeliverySpy {
        fn datagram_received(&self, header: &IP6Header, payload: &[u8], _link_secured: bool) {
            self.count.set(self.count.get() + 1);
            self.last_proto.set(header.next_header);
            assert_eq!(payload, b"ping");
        }
    }

    #[test]
    fn inbound_datagram_reaches_the_ip6_client() {
        let spy = DeliverySpy {
            count: Cell::new(0),
            last_proto: Cell::new(0),
        };
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );
        ip6.set_receive_client(&spy);

        let peer_ll = generate_link_local(&[0x66u8; 8]);
        let our_ll = generate_link_local(&OUR_EXT);
        let ip6_header = IP6Header::new(peer_ll, our_ll, 17, 4);
        let mut payload = [0u8; IP6_HDR_LEN + 4];
        let (hlen, ()) = ip6_header.encode(&mut payload).done().unwrap();
        payload[hlen..hlen + 4].copy_from_slice(b"ping");

        let mac_header = Header {
            frame_type: FrameType::Data,
            frame_pending: false,
            ack_requested: false,
            version: crate::net::ieee802154::FrameVersion::V2006,
            seq: Some(3),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Long(OUR_EXT)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Long([0x66u8; 8])),
            security: None,
        };
        let mut frame = [0u8; 127];
        let (mut flen, ()) = mac_header.encode(&mut frame).done().unwrap();
        frame[flen..flen + hlen + 4].copy_from_slice(&payload[..hlen + 4]);
        flen += hlen + 4;
        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&frame[..flen], 120);

        assert_eq!(spy.count.get(), 1);
        assert_eq!(spy.last_proto.get(), 17);
    }

    #[test]
    fn datagram_to_sleepy_child_waits_for_poll() {
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );

        // A sleepy child in the table.
        let child_ext = [0x55u8; 8];
        let child_rloc: u16 = 0x0401;
        let idx = nt
            .allocate_child(child_ext, crate::net::thread::neighbor::NeighborState::Valid)
            .unwrap();
        nt.with_child(idx, |child| {
            child.neighbor.rloc16 = child_rloc;
            // Mode without rx-on-when-idle.
            child.neighbor.mode = crate::net::thread::neighbor::DeviceMode(0x02);
        });

        let dst = make_rloc(&DEFAULT_MESH_LOCAL_PREFIX, child_rloc);
        stack.send_datagram(dst, 17, b"for child").unwrap();
        assert!(deferred.service());
        // Nothing transmits directly; the frame sits in the indirect queue.
        assert!(!radio.pending_tx());
        assert_eq!(indirect.pending_for(MacAddress::Short(child_rloc)), 1);
        assert!(sm.find_short(child_rloc) >= 0);

        // The child polls: a MAC data-request command arrives.
        let poll = Header {
            frame_type: FrameType::MACCommand,
            frame_pending: false,
            ack_requested: true,
            version: crate::net::ieee802154::FrameVersion::V2006,
            seq: Some(1),
            dst_pan: Some(PAN),
            dst_addr: Some(MacAddress::Short(0x0001)),
            src_pan: Some(PAN),
            src_addr: Some(MacAddress::Short(child_rloc)),
            security: None,
        };
        let mut frame = [0u8; 64];
        let (mut flen, ()) = poll.encode(&mut frame).done().unwrap();
        frame[flen] = 0x04;
        flen += 1;
        mac.set_receive_buffer(leak_buf());
        radio.deliver_frame(&frame[..flen], 90);

        // The MAC acks the poll with frame-pending, then the queued frame
        // starts its CSMA transmission.
        assert!(radio.pending_tx());
        radio.inspect_tx(|ack| {
            let (_, header) = Header::decode(ack).done().unwrap();
            assert_eq!(header.frame_type, FrameType::Acknowledgement);
            assert!(header.frame_pending);
        });
        radio.complete_tx();
        assert!(mac_alarm.trigger_next());
        assert!(radio.pending_tx());
        radio.inspect_tx(|frame| {
            let (_, header) = Header::decode(frame).done().unwrap();
            assert_eq!(header.dst_addr, Some(MacAddress::Short(child_rloc)));
        });
        assert_eq!(indirect.pending_for(MacAddress::Short(child_rloc)), 0);
        assert!(sm.find_short(child_rloc) < 0);
    }

    #[test]
    fn ack_outcome_moves_radio_preference() {
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );

        // An rx-on child reachable over the radio.
        let peer_ext = [0x31u8; 8];
        let peer_rloc: u16 = 0x0402;
        let idx = nt
            .allocate_child(peer_ext, crate::net::thread::neighbor::NeighborState::Valid)
            .unwrap();
        nt.with_child(idx, |child| {
            child.neighbor.rloc16 = peer_rloc;
            child.neighbor.mode = crate::net::thread::neighbor::DeviceMode(0x0a);
        });

        let dst = make_rloc(&DEFAULT_MESH_LOCAL_PREFIX, peer_rloc);
        let deliver_acked_send = || {
            stack.send_datagram(dst, 17, b"x").unwrap();
            deferred.service();
            assert!(mac_alarm.trigger_next());
            let mut seq = 0;
            radio.inspect_tx(|frame| {
                let (_, header) = Header::decode(frame).done().unwrap();
                seq = header.seq.unwrap();
            });
            radio.complete_tx();
            let ack = Header {
                frame_type: FrameType::Acknowledgement,
                frame_pending: false,
                ack_requested: false,
                version: crate::net::ieee802154::FrameVersion::V2006,
                seq: Some(seq),
                dst_pan: None,
                dst_addr: None,
                src_pan: None,
                src_addr: None,
                security: None,
            };
            let mut bytes = [0u8; 8];
            let (len, ()) = ack.encode(&mut bytes).done().unwrap();
            mac.set_receive_buffer(leak_buf());
            radio.deliver_frame(&bytes[..len], 255);
            deferred.service();
        };

        // The first acknowledged send registers the radio link at the
        // initial preference; each further ack moves it up by one.
        deliver_acked_send();
        let pref = nt
            .with_child(idx, |c| c.neighbor.radios.preference[0])
            .unwrap();
        assert_eq!(pref, INIT_PREFERENCE);

        deliver_acked_send();
        let pref = nt
            .with_child(idx, |c| c.neighbor.radios.preference[0])
            .unwrap();
        assert_eq!(pref, INIT_PREFERENCE + 1);
    }

    struct FakeTrel {
        sends: Cell<u32>,
        last_peer: Cell<[u8; 8]>,
        last_frame: MapCell<([u8; 180], usize)>,
    }

    impl FakeTrel {
        fn new() -> FakeTrel {
            FakeTrel {
                sends: Cell::new(0),
                last_peer: Cell::new([0; 8]),
                last_frame: MapCell::empty(),
            }
        }
    }

    impl kernel::hil::trel::TrelSender for FakeTrel {
        fn send(&self, peer: &[u8; 8], frame: &[u8]) -> Result<(), ErrorCode> {
            self.sends.set(self.sends.get() + 1);
            self.last_peer.set(*peer);
            let mut bytes = [0u8; 180];
            bytes[..frame.len()].copy_from_slice(frame);
            self.last_frame.put((bytes, frame.len()));
            Ok(())
        }
    }

    #[test]
    fn trel_selection_and_deferred_ack_fallback() {
        let trel = FakeTrel::new();
        fixture!(
            radio, mac_alarm, mle_alarm, res_alarm, rng, sm, ccm, store, settings, km, nt, nd,
            pool, ip6, mac, framer, mux, mle_user, stack_user, mle, resolver, indirect, deferred,
            stack
        );
        stack.set_trel_transport(&trel);

        // A neighbor reachable over both links, TREL at high preference.
        let peer_ext = [0x32u8; 8];
        let peer_rloc: u16 = 0x0403;
        let idx = nt
            .allocate_child(peer_ext, crate::net::thread::neighbor::NeighborState::Valid)
            .unwrap();
        nt.with_child(idx, |child| {
            child.neighbor.rloc16 = peer_rloc;
            child.neighbor.mode = crate::net::thread::neighbor::DeviceMode(0x0a);
            child.neighbor.radios.supported = 0b11;
            child.neighbor.radios.preference = [INIT_PREFERENCE, HIGH_PREFERENCE];
        });

        // The datagram rides TREL; the radio stays idle.
        let dst = make_rloc(&DEFAULT_MESH_LOCAL_PREFIX, peer_rloc);
        stack.send_datagram(dst, 17, b"over trel").unwrap();
        deferred.service();
        assert_eq!(trel.sends.get(), 1);
        assert_eq!(trel.last_peer.get(), peer_ext);
        trel.last_frame.map(|(bytes, len)| {
            // TREL carries the whole IPv6 datagram.
            assert!(*len >= IP6_HDR_LEN);
            assert_eq!(bytes[0] >> 4, 6);
        });
        assert!(!radio.pending_tx());
        assert!(!mac_alarm.trigger_next());
        let pending = nt
            .with_child(idx, |c| c.neighbor.radios.pending_acks)
            .unwrap();
        assert_eq!(pending, 1);

        // Three deferred-ack timeouts drag TREL below the radio link.
        for _ in 0..3 {
            stack.trel_ack_received(&peer_ext, false);
        }
        let pending = nt
            .with_child(idx, |c| c.neighbor.radios.pending_acks)
            .unwrap();
        assert_eq!(pending, 0);
        let trel_pref = nt
            .with_child(idx, |c| c.neighbor.radios.preference[1])
            .unwrap();
        assert_eq!(trel_pref, HIGH_PREFERENCE - 12);

        // Selection now favors the radio link.
        stack.send_datagram(dst, 17, b"over radio").unwrap();
        deferred.service();
        assert_eq!(trel.sends.get(), 1);
        assert!(mac_alarm.trigger_next());
        assert!(radio.pending_tx());
        radio.inspect_tx(|frame| {
            let (_, header) = Header::decode(frame).done().unwrap();
            assert_eq!(header.dst_addr, Some(MacAddress::Short(peer_rloc)));
        });
    }

    #[test]
    fn soft_timers_share_one_hardware_alarm() {
        // One hardware alarm; every component timer is a virtual alarm
        // multiplexed over it.
        let hw_alarm = FakeAlarm::new();
        let mux_alarm = MuxAlarm::new(&hw_alarm);
        hw_alarm.set_alarm_client(&mux_alarm);
        let mac_valarm = VirtualMuxAlarm::new(&mux_alarm);
        mac_valarm.setup();
        let mle_valarm = VirtualMuxAlarm::new(&mux_alarm);
        mle_valarm.setup();
        let res_valarm = VirtualMuxAlarm::new(&mux_alarm);
        res_valarm.setup();

        let radio = FakeRadio::new();
        let rng = FakeRng::counting_from(0);
        let sm = SourceMatch::new();
        let ccm = Aes128CcmSw::new();
        let store = FakeStore::new();
        let settings = Settings::new(&store);
        let km = KeyManager::new();
        let nt = NeighborTable::new();
        let nd = NetworkData::new();
        let pool = MessagePool::new();
        let ip6 = IP6Interface::new();
        let mac = CsmaMac::new(&radio, &mac_valarm, &rng, &sm, leak_buf());
        let framer = Framer::new(&mac, &ccm);
        let mux = MuxMac::new(&framer);
        let mle_user = MacUser::new(&mux);
        let stack_user = MacUser::new(&mux);
        let mle = Mle::new(
            &mle_user,
            &mle_valarm,
            &rng,
            &km,
            &nt,
            &nd,
            &settings,
            leak_buf(),
        );
        let resolver = AddressResolver::new(&res_valarm);
        let indirect = IndirectSender::new(&stack_user, &sm);
        let deferred = DeferredCallQueue::new();
        let stack = ThreadStack::new(
            &stack_user,
            &mle,
            &km,
            &nt,
            &ip6,
            &pool,
            &resolver,
            &indirect,
            &settings,
            &rng,
            leak_buf(),
        );
        stack.register_deferred_call(&deferred);
        radio.set_transmit_client(&mac);
        radio.set_receive_client(&mac);
        mac_valarm.set_alarm_client(&mac);
        ccm.set_client(&framer);
        mac.set_transmit_client(&framer);
        mac.set_receive_client(&framer);
        framer.set_transmit_client(&mux);
        framer.set_receive_client(&mux);
        framer.set_key_procedure(&km);
        framer.set_device_procedure(&nt);
        mux.add_user(&mle_user);
        mux.add_user(&stack_user);
        mle_user.set_transmit_client(&mle);
        mle_user.set_receive_client(&mle);
        stack_user.set_transmit_client(&stack);
        stack_user.set_receive_client(&stack);
        mle_valarm.set_alarm_client(&mle);
        res_valarm.set_alarm_client(&resolver);
        resolver.set_query_sender(&stack);
        indirect.set_client(&stack);
        nt.set_observer(&stack);
        mle.set_observer(&stack);
        radio.set_address_long(OUR_EXT);
        radio.set_address(crate::net::ieee802154::SHORT_ADDR_UNSPECIFIED);
        mac.set_pan(PAN);
        km.set_master_key(MASTER);
        mac.start().unwrap();
        ip6.set_enabled(true);

        // An outstanding address query arms the resolver's retry clock on
        // the shared alarm too.
        let eid = IPAddr::parse("fd00:bbbb::77").unwrap();
        let _ = resolver.resolve(&eid);
        assert!(res_valarm.is_armed());

        // Attaching arms the MAC backoff and the attach window; a single
        // hardware alarm is programmed to the earliest of them.
        mle.start().unwrap();
        assert!(hw_alarm.is_armed());
        assert!(hw_alarm.trigger_next());
        assert!(radio.pending_tx());
        radio.complete_tx();

        // With nobody answering, the engine's window and backoff timers
        // fire through the same hardware alarm until a second Parent
        // Request reaches the radio.
        let mut second_request = false;
        for _ in 0..100 {
            if radio.pending_tx() {
                second_request = true;
                break;
            }
            if !hw_alarm.trigger_next() {
                break;
            }
        }
        assert!(second_request);
    }
}
