// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Mesh Link Establishment: attach, role election, advertisements and
//! partition maintenance.
//!
//! The engine drives the role machine Disabled -> Detached -> {Child,
//! Router, Leader}. Every multi-step operation is a state plus a timer:
//! attaching broadcasts a Parent Request, collects Parent Responses for a
//! window, picks the best candidate (ties keep the most recently received
//! response) and completes the Child Id handshake; routers advertise their
//! leader data and Route64 on a trickle timer; children keep their parent
//! alive with Child Update exchanges; sleepy children poll with MAC data
//! requests.
//!
//! MLE messages travel directly in 802.15.4 data frames (6LoWPAN and the
//! UDP shim are out of scope here) and carry their own security: a
//! 802.15.4-style auxiliary header with the key sequence as a 4-byte key
//! source, AES-CCM* with a 4-byte MIC, and authenticated data
//! `src-ip6 || dst-ip6 || aux header`. Link-local addresses derive from the
//! extended MAC addresses on both sides; a broadcast destination stands for
//! the link-local all-routers group.

use crate::ieee802154::device::{self, LinkController, MacDevice};
use crate::ieee802154::framer::get_ccm_nonce;
use crate::net::ieee802154::{
    FrameType, Header, KeyId, MacAddress, Security, SecurityLevel, BROADCAST_ADDR,
};
use crate::net::ipv6::ip_utils::{generate_link_local, IPAddr, LINK_LOCAL_ALL_ROUTERS};
use crate::net::thread::key_manager::{key_index_for, KeyManager};
use crate::net::thread::neighbor::{
    DeviceMode, NeighborState, NeighborTable, RouterIdMap, StateFilter, MAX_ROUTER_ID,
};
use crate::net::thread::network_data::{NetworkData, MAX_NETWORK_DATA_SIZE};
use crate::net::thread::radio_selector;
use crate::net::thread::tlv::{
    self, Connectivity, LeaderData, MulticastResponder, Route64, Tlv, TlvReader,
    unwrap_tlv_offset,
};
use crate::settings::{NetworkInfo, ParentInfo, Settings};
use crate::symmetric_encryption::aes_ccm::ccm_crypt_inline;

use kernel::hil::rng::Rng;
use kernel::hil::time::{Alarm, AlarmClient, ConvertTicks, Ticks};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::ErrorCode;

use core::cell::Cell;

/// MLE command identifiers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MleCommand {
    LinkRequest = 0,
    LinkAccept = 1,
    LinkAcceptAndRequest = 2,
    Advertisement = 4,
    DataRequest = 7,
    DataResponse = 8,
    ParentRequest = 9,
    ParentResponse = 10,
    ChildIdRequest = 11,
    ChildIdResponse = 12,
    ChildUpdateRequest = 13,
    ChildUpdateResponse = 14,
}

impl MleCommand {
    fn from_u8(byte: u8) -> Option<MleCommand> {
        match byte {
            0 => Some(MleCommand::LinkRequest),
            1 => Some(MleCommand::LinkAccept),
            2 => Some(MleCommand::LinkAcceptAndRequest),
            4 => Some(MleCommand::Advertisement),
            7 => Some(MleCommand::DataRequest),
            8 => Some(MleCommand::DataResponse),
            9 => Some(MleCommand::ParentRequest),
            10 => Some(MleCommand::ParentResponse),
            11 => Some(MleCommand::ChildIdRequest),
            12 => Some(MleCommand::ChildIdResponse),
            13 => Some(MleCommand::ChildUpdateRequest),
            14 => Some(MleCommand::ChildUpdateResponse),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Disabled,
    Detached,
    Child,
    Router,
    Leader,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum AttachStage {
    Idle,
    /// Parent Request sent; collecting responses until the window closes.
    ParentRequest,
    /// Child Id Request sent; awaiting the response.
    ChildIdRequest,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum TxKind {
    Mle,
    Poll,
}

/// The best parent seen so far during an attach window.
#[derive(Copy, Clone, Debug)]
struct ParentCandidate {
    ext_addr: [u8; 8],
    rloc16: u16,
    link_margin: u8,
    connectivity: Connectivity,
    leader_data: LeaderData,
    /// Their challenge, echoed in our Child Id Request.
    challenge: [u8; 8],
}

/// Security suite byte preceding the auxiliary header.
const SECURITY_SUITE_154: u8 = 0;
/// Aux header: control, frame counter, 4-byte key source, key index.
const AUX_SEC_HEADER_LEN: usize = 10;
/// Authenticated data: source ip, destination ip, aux header.
const AUTH_DATA_LEN: usize = 16 + 16 + AUX_SEC_HEADER_LEN;
const MIC_LEN: usize = 4;
/// Body budget for one MLE message.
pub const MAX_MLE_BODY: usize = 88;

const PARENT_RESPONSE_WINDOW_MS: u32 = 1000;
const CHILD_ID_TIMEOUT_MS: u32 = 2000;
const ATTACH_BACKOFF_MS: u32 = 5000;
const MAX_ATTACH_ATTEMPTS: u8 = 4;
/// Advertisement trickle bounds.
const ADVERT_INTERVAL_MIN_MS: u32 = 1000;
const ADVERT_INTERVAL_MAX_MS: u32 = 32_000;
/// Housekeeping tick.
const TICK_MS: u32 = 1000;
/// A router neighbor unheard for this long is removed.
const MAX_NEIGHBOR_AGE_S: u32 = 100;
const DEFAULT_CHILD_TIMEOUT_S: u32 = 240;
const DEFAULT_POLL_PERIOD_MS: u32 = 1000;
const THREAD_VERSION: u16 = 4;
const DEFAULT_LEADER_WEIGHT: u8 = 64;

/// Role-change notifications to the embedder.
pub trait MleObserver {
    fn role_changed(&self, role: Role);
}

/// Seal an MLE body into a frame payload: security suite byte, auxiliary
/// header, encrypted body, MIC. Returns the payload length.
pub fn seal_mle_frame(
    mle_key: &[u8; 16],
    key_seq: u32,
    counter: u32,
    src_ext: &[u8; 8],
    src_ip: &IPAddr,
    dst_ip: &IPAddr,
    body: &[u8],
    out: &mut [u8],
) -> Option<usize> {
    let security = Security {
        level: SecurityLevel::EncMic32,
        frame_counter: counter,
        key_id: KeyId::Source4Index(key_seq.to_be_bytes(), key_index_for(key_seq)),
    };
    let mut aux = [0u8; AUX_SEC_HEADER_LEN];
    let aux_len = security.encode(&mut aux).done()?.0;
    if aux_len != AUX_SEC_HEADER_LEN || body.len() > MAX_MLE_BODY {
        return None;
    }

    let mut scratch = [0u8; AUTH_DATA_LEN + MAX_MLE_BODY + MIC_LEN];
    scratch[..16].copy_from_slice(&src_ip.0);
    scratch[16..32].copy_from_slice(&dst_ip.0);
    scratch[32..42].copy_from_slice(&aux);
    scratch[42..42 + body.len()].copy_from_slice(body);

    let nonce = get_ccm_nonce(src_ext, counter, SecurityLevel::EncMic32);
    if !ccm_crypt_inline(
        mle_key,
        &nonce,
        &mut scratch[..AUTH_DATA_LEN + body.len() + MIC_LEN],
        AUTH_DATA_LEN,
        body.len(),
        MIC_LEN,
        true,
    ) {
        return None;
    }

    let total = 1 + AUX_SEC_HEADER_LEN + body.len() + MIC_LEN;
    if out.len() < total {
        return None;
    }
    out[0] = SECURITY_SUITE_154;
    out[1..11].copy_from_slice(&aux);
    out[11..11 + body.len() + MIC_LEN]
        .copy_from_slice(&scratch[AUTH_DATA_LEN..AUTH_DATA_LEN + body.len() + MIC_LEN]);
    Some(total)
}

/// Open a sealed MLE frame payload. Returns the body length written into
/// `out` plus the key sequence and frame counter of the message.
pub fn open_mle_frame(
    keys: &KeyManager,
    src_ext: &[u8; 8],
    src_ip: &IPAddr,
    dst_ip: &IPAddr,
    payload: &[u8],
    out: &mut [u8],
) -> Option<(usize, u32, u32)> {
    if payload.len() < 1 + AUX_SEC_HEADER_LEN + MIC_LEN || payload[0] != SECURITY_SUITE_154 {
        return None;
    }
    let (aux_len, security) = Security::decode(&payload[1..]).done()?;
    if aux_len != AUX_SEC_HEADER_LEN || security.level != SecurityLevel::EncMic32 {
        return None;
    }
    let key_seq = match security.key_id {
        KeyId::Source4Index(source, _) => u32::from_be_bytes(source),
        _ => return None,
    };
    let mle_key = keys.mle_key_for_seq(key_seq)?;
    let body_len = payload.len() - 1 - AUX_SEC_HEADER_LEN - MIC_LEN;
    if body_len > MAX_MLE_BODY || out.len() < body_len {
        return None;
    }

    let mut scratch = [0u8; AUTH_DATA_LEN + MAX_MLE_BODY + MIC_LEN];
    scratch[..16].copy_from_slice(&src_ip.0);
    scratch[16..32].copy_from_slice(&dst_ip.0);
    scratch[32..42].copy_from_slice(&payload[1..11]);
    scratch[42..42 + body_len + MIC_LEN].copy_from_slice(&payload[11..]);

    let nonce = get_ccm_nonce(src_ext, security.frame_counter, SecurityLevel::EncMic32);
    if !ccm_crypt_inline(
        &mle_key,
        &nonce,
        &mut scratch[..AUTH_DATA_LEN + body_len + MIC_LEN],
        AUTH_DATA_LEN,
        body_len,
        MIC_LEN,
        false,
    ) {
        return None;
    }
    out[..body_len].copy_from_slice(&scratch[AUTH_DATA_LEN..AUTH_DATA_LEN + body_len]);
    Some((body_len, key_seq, security.frame_counter))
}

pub struct Mle<'a, M: MacDevice<'a>, A: Alarm<'a>> {
    mac: &'a M,
    alarm: &'a A,
    rng: &'a dyn Rng,
    keys: &'a KeyManager<'a>,
    neighbors: &'a NeighborTable<'a>,
    network_data: &'a NetworkData,
    settings: &'a Settings<'a>,
    link: OptionalCell<&'a dyn LinkController>,
    observer: OptionalCell<&'a dyn MleObserver>,

    role: Cell<Role>,
    device_mode: Cell<DeviceMode>,
    attach: Cell<AttachStage>,
    attach_attempts: Cell<u8>,
    rloc16: Cell<u16>,
    leader_data: Cell<LeaderData>,
    attached_once: Cell<bool>,
    /// Router-id allocation (meaningful on the leader).
    pub router_ids: RouterIdMap,
    router_id_seq: Cell<u8>,
    own_challenge: Cell<[u8; 8]>,
    parent_candidate: Cell<Option<ParentCandidate>>,
    /// Outgoing MLE frame counter.
    mle_counter: Cell<u32>,
    /// Last MAC frame counter reported by the link layer, echoed in
    /// handshakes.
    mac_counter_hint: Cell<u32>,
    timeout_s: Cell<u32>,
    poll_period_ms: Cell<u32>,
    leader_weight: Cell<u8>,

    tx_buf: TakeCell<'static, [u8]>,
    tx_kind: Cell<TxKind>,

    // Soft timers, as alarm tick targets.
    attach_deadline: Cell<Option<u32>>,
    advert_deadline: Cell<Option<u32>>,
    tick_deadline: Cell<Option<u32>>,
    poll_deadline: Cell<Option<u32>>,
    advert_interval_ms: Cell<u32>,
    /// Uptime in seconds, advanced by the housekeeping tick.
    seconds: Cell<u32>,
    parent_last_heard_s: Cell<u32>,
    keepalive_outstanding: Cell<bool>,
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> Mle<'a, M, A> {
    pub fn new(
        mac: &'a M,
        alarm: &'a A,
        rng: &'a dyn Rng,
        keys: &'a KeyManager<'a>,
        neighbors: &'a NeighborTable<'a>,
        network_data: &'a NetworkData,
        settings: &'a Settings<'a>,
        tx_buf: &'static mut [u8],
    ) -> Mle<'a, M, A> {
        Mle {
            mac,
            alarm,
            rng,
            keys,
            neighbors,
            network_data,
            settings,
            link: OptionalCell::empty(),
            observer: OptionalCell::empty(),
            role: Cell::new(Role::Disabled),
            device_mode: Cell::new(DeviceMode(
                DeviceMode::RX_ON_WHEN_IDLE
                    | DeviceMode::FULL_THREAD_DEVICE
                    | DeviceMode::FULL_NETWORK_DATA
                    | DeviceMode::SECURE_DATA_REQUESTS,
            )),
            attach: Cell::new(AttachStage::Idle),
            attach_attempts: Cell::new(0),
            rloc16: Cell::new(crate::net::ieee802154::SHORT_ADDR_UNSPECIFIED),
            leader_data: Cell::new(LeaderData {
                partition_id: 0,
                weighting: 0,
                data_version: 0,
                stable_data_version: 0,
                leader_router_id: 0,
            }),
            attached_once: Cell::new(false),
            router_ids: RouterIdMap::new(),
            router_id_seq: Cell::new(0),
            own_challenge: Cell::new([0; 8]),
            parent_candidate: Cell::new(None),
            mle_counter: Cell::new(0),
            mac_counter_hint: Cell::new(0),
            timeout_s: Cell::new(DEFAULT_CHILD_TIMEOUT_S),
            poll_period_ms: Cell::new(DEFAULT_POLL_PERIOD_MS),
            leader_weight: Cell::new(DEFAULT_LEADER_WEIGHT),
            tx_buf: TakeCell::new(tx_buf),
            tx_kind: Cell::new(TxKind::Mle),
            attach_deadline: Cell::new(None),
            advert_deadline: Cell::new(None),
            tick_deadline: Cell::new(None),
            poll_deadline: Cell::new(None),
            advert_interval_ms: Cell::new(ADVERT_INTERVAL_MIN_MS),
            seconds: Cell::new(0),
            parent_last_heard_s: Cell::new(0),
            keepalive_outstanding: Cell::new(false),
        }
    }

    pub fn set_link_controller(&self, link: &'a dyn LinkController) {
        self.link.set(link);
    }

    pub fn set_observer(&self, observer: &'a dyn MleObserver) {
        self.observer.set(observer);
    }

    pub fn role(&self) -> Role {
        self.role.get()
    }

    pub fn rloc16(&self) -> u16 {
        self.rloc16.get()
    }

    pub fn leader_data(&self) -> LeaderData {
        self.leader_data.get()
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.device_mode.get()
    }

    pub fn set_device_mode(&self, mode: DeviceMode) {
        self.device_mode.set(mode);
        self.apply_idle_mode();
    }

    pub fn set_timeout(&self, timeout_s: u32) {
        self.timeout_s.set(timeout_s);
    }

    pub fn set_poll_period(&self, period_ms: u32) {
        self.poll_period_ms.set(period_ms);
    }

    pub fn set_leader_weight(&self, weight: u8) {
        self.leader_weight.set(weight);
    }

    /// The link layer reports its outgoing frame counter so handshakes can
    /// carry it.
    pub fn note_mac_frame_counter(&self, counter: u32) {
        self.mac_counter_hint.set(counter);
    }

    /// Start the protocol: restore persisted counters and begin attaching.
    pub fn start(&self) -> Result<(), ErrorCode> {
        if self.role.get() != Role::Disabled {
            return Err(ErrorCode::ALREADY);
        }
        if let Ok(info) = self.settings.read_network_info() {
            // Never reuse frame counters after a reboot.
            self.mle_counter.set(info.mle_frame_counter.wrapping_add(1));
            self.keys.set_key_sequence(info.key_sequence);
        }
        self.set_role(Role::Detached);
        self.schedule_tick();
        self.begin_attach();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ErrorCode> {
        if self.role.get() == Role::Disabled {
            return Err(ErrorCode::ALREADY);
        }
        self.attach.set(AttachStage::Idle);
        self.attach_deadline.set(None);
        self.advert_deadline.set(None);
        self.tick_deadline.set(None);
        self.poll_deadline.set(None);
        let _ = self.alarm.disarm();
        self.neighbors.clear_parent();
        self.set_role(Role::Disabled);
        Ok(())
    }

    fn set_role(&self, role: Role) {
        if self.role.get() != role {
            kernel::debug!("[mle] role {:?} -> {:?}", self.role.get(), role);
            self.role.set(role);
            self.observer.map(|o| o.role_changed(role));
            self.apply_idle_mode();
        }
    }

    fn apply_idle_mode(&self) {
        // Sleepy children keep the receiver off between polls.
        let rx_on = self.device_mode.get().rx_on_when_idle() || self.role.get() != Role::Child;
        self.link.map(|link| link.set_rx_on_when_idle(rx_on));
        if !rx_on {
            self.schedule_poll();
        } else {
            self.poll_deadline.set(None);
        }
    }

    // --- soft timers ---

    fn now_ticks(&self) -> u32 {
        self.alarm.now().into_u32()
    }

    fn target_in_ms(&self, ms: u32) -> u32 {
        self.now_ticks()
            .wrapping_add(self.alarm.ticks_from_ms(ms).into_u32())
    }

    fn schedule_tick(&self) {
        self.tick_deadline.set(Some(self.target_in_ms(TICK_MS)));
        self.reschedule();
    }

    fn schedule_poll(&self) {
        self.poll_deadline
            .set(Some(self.target_in_ms(self.poll_period_ms.get())));
        self.reschedule();
    }

    fn schedule_advertisement(&self, reset_interval: bool) {
        if reset_interval {
            self.advert_interval_ms.set(ADVERT_INTERVAL_MIN_MS);
        }
        let interval = self.advert_interval_ms.get();
        // Fire in the second half of the trickle interval.
        let delay = interval / 2 + self.rng.get_u32() % (interval / 2).max(1);
        self.advert_deadline.set(Some(self.target_in_ms(delay)));
        self.reschedule();
    }

    fn reschedule(&self) {
        let now = self.now_ticks();
        let deadlines = [
            self.attach_deadline.get(),
            self.advert_deadline.get(),
            self.tick_deadline.get(),
            self.poll_deadline.get(),
        ];
        let next = deadlines
            .iter()
            .flatten()
            .map(|target| {
                let dt = target.wrapping_sub(now);
                // A target already in the past fires immediately.
                if dt >= u32::MAX / 2 {
                    0
                } else {
                    dt
                }
            })
            .min();
        if let Some(dt) = next {
            self.alarm
                .set_alarm(A::Ticks::from(now), A::Ticks::from(dt));
        }
    }

    fn expired(now: u32, target: Option<u32>) -> bool {
        target.is_some_and(|t| now.wrapping_sub(t) < u32::MAX / 2)
    }

    // --- attach ---

    fn begin_attach(&self) {
        if self.role.get() == Role::Disabled {
            return;
        }
        self.set_role(Role::Detached);
        self.neighbors.clear_parent();
        self.parent_candidate.set(None);
        self.attach.set(AttachStage::ParentRequest);
        self.keepalive_outstanding.set(false);
        self.send_parent_request();
        self.attach_deadline
            .set(Some(self.target_in_ms(PARENT_RESPONSE_WINDOW_MS)));
        self.reschedule();
    }

    fn next_challenge(&self) -> [u8; 8] {
        let mut challenge = [0u8; 8];
        let _ = self.rng.get_bytes(&mut challenge);
        challenge
    }

    fn send_parent_request(&self) {
        // The first attempts solicit routers only; later ones accept any
        // router-eligible device.
        let mut scan_mask = MulticastResponder::Router as u8;
        if self.attach_attempts.get() >= 2 {
            scan_mask |= MulticastResponder::EndDevice as u8;
        }
        let challenge = self.next_challenge();
        self.own_challenge.set(challenge);

        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ParentRequest as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::Mode(self.device_mode.get().0).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Challenge(challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::ScanMask(scan_mask).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Version(THREAD_VERSION).encode(&mut body[off..]));

        self.send_mle(MacAddress::Short(BROADCAST_ADDR), &body[..off]);
    }

    fn send_child_id_request(&self, candidate: &ParentCandidate) {
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ChildIdRequest as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::Response(candidate.challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LinkLayerFrameCounter(self.mac_counter_hint.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(
            Tlv::MleFrameCounter(self.mle_counter.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(Tlv::Mode(self.device_mode.get().0).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Timeout(self.timeout_s.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Version(THREAD_VERSION).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::TlvRequest(&[tlv::ADDRESS16, tlv::NETWORK_DATA, tlv::ROUTE64])
                .encode(&mut body[off..]),
        );

        self.send_mle(MacAddress::Long(candidate.ext_addr), &body[..off]);
    }

    fn send_parent_response(&self, dst_ext: [u8; 8], their_challenge: [u8; 8], margin: u8) {
        // Track the handshake in the child table so the Child Id Request
        // can be verified against our challenge.
        let Some(index) = self
            .neighbors
            .allocate_child(dst_ext, NeighborState::ParentRequest)
        else {
            kernel::debug!("[mle] child table full; ignoring parent request");
            return;
        };
        let challenge = self.next_challenge();
        self.neighbors.with_child(index, |child| {
            child.challenge = challenge;
            child.neighbor.last_heard_s = self.seconds.get();
        });

        let connectivity = self.our_connectivity();
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ParentResponse as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LeaderData(self.leader_data.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(Tlv::LinkMargin(margin).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Connectivity(connectivity).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Response(their_challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Challenge(challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LinkLayerFrameCounter(self.mac_counter_hint.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(
            Tlv::MleFrameCounter(self.mle_counter.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(Tlv::Version(THREAD_VERSION).encode(&mut body[off..]));

        self.send_mle(MacAddress::Long(dst_ext), &body[..off]);
    }

    fn send_child_id_response(&self, dst_ext: [u8; 8], child_rloc: u16) {
        let mut netdata = [0u8; MAX_NETWORK_DATA_SIZE];
        let netdata_len = self
            .network_data
            .serialize(&mut netdata)
            .unwrap_or(0);

        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ChildIdResponse as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Address16(child_rloc).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LeaderData(self.leader_data.get()).encode(&mut body[off..]),
        );
        let netdata_budget = MAX_MLE_BODY.saturating_sub(off + 2);
        let netdata_len = netdata_len.min(netdata_budget);
        off += unwrap_tlv_offset(
            Tlv::NetworkData(&netdata[..netdata_len]).encode(&mut body[off..]),
        );

        self.send_mle(MacAddress::Long(dst_ext), &body[..off]);
    }

    fn send_advertisement(&self) {
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::Advertisement as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LeaderData(self.leader_data.get()).encode(&mut body[off..]),
        );
        off += unwrap_tlv_offset(Tlv::Route64(self.our_route64()).encode(&mut body[off..]));

        self.send_mle(MacAddress::Short(BROADCAST_ADDR), &body[..off]);
    }

    fn send_data_request(&self, dst_ext: [u8; 8]) {
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::DataRequest as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::TlvRequest(&[tlv::NETWORK_DATA]).encode(&mut body[off..]));
        self.send_mle(MacAddress::Long(dst_ext), &body[..off]);
    }

    fn send_data_response(&self, dst: MacAddress) {
        let mut netdata = [0u8; MAX_NETWORK_DATA_SIZE];
        let netdata_len = self.network_data.serialize(&mut netdata).unwrap_or(0);
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::DataResponse as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LeaderData(self.leader_data.get()).encode(&mut body[off..]),
        );
        let netdata_budget = MAX_MLE_BODY.saturating_sub(off + 2);
        let netdata_len = netdata_len.min(netdata_budget);
        off += unwrap_tlv_offset(
            Tlv::NetworkData(&netdata[..netdata_len]).encode(&mut body[off..]),
        );
        self.send_mle(dst, &body[..off]);
    }

    fn send_child_update_request(&self) {
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ChildUpdateRequest as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::Mode(self.device_mode.get().0).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Timeout(self.timeout_s.get()).encode(&mut body[off..]));
        if let Some(parent) = self.neighbors.parent() {
            self.keepalive_outstanding.set(true);
            self.send_mle(MacAddress::Long(parent.ext_addr), &body[..off]);
        }
    }

    fn send_child_update_response(&self, dst_ext: [u8; 8], challenge: Option<[u8; 8]>) {
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::ChildUpdateResponse as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::Mode(self.device_mode.get().0).encode(&mut body[off..]));
        if let Some(challenge) = challenge {
            off += unwrap_tlv_offset(Tlv::Response(challenge).encode(&mut body[off..]));
        }
        off += unwrap_tlv_offset(Tlv::Timeout(self.timeout_s.get()).encode(&mut body[off..]));
        self.send_mle(MacAddress::Long(dst_ext), &body[..off]);
    }

    /// Ask the leader for a router id (the REED promotion handshake).
    pub fn become_router(&self) -> Result<(), ErrorCode> {
        if self.role.get() != Role::Child {
            return Err(ErrorCode::STATE);
        }
        if !self.device_mode.get().is_ftd() {
            return Err(ErrorCode::NOSUPPORT);
        }
        let challenge = self.next_challenge();
        self.own_challenge.set(challenge);
        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::LinkRequest as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Challenge(challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Version(THREAD_VERSION).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::TlvRequest(&[tlv::ADDRESS16, tlv::ROUTE64]).encode(&mut body[off..]),
        );
        match self.neighbors.parent() {
            Some(parent) => {
                self.send_mle(MacAddress::Long(parent.ext_addr), &body[..off]);
                Ok(())
            }
            None => Err(ErrorCode::STATE),
        }
    }

    /// Found a new partition with this device as leader.
    pub fn become_leader(&self) -> Result<(), ErrorCode> {
        if self.role.get() == Role::Disabled {
            return Err(ErrorCode::STATE);
        }
        if !self.device_mode.get().is_ftd() {
            return Err(ErrorCode::NOSUPPORT);
        }
        let router_id = self.router_ids.allocate().ok_or(ErrorCode::NOMEM)?;
        let rloc = (router_id as u16) << 10;
        self.rloc16.set(rloc);
        self.mac.set_address(rloc);
        self.mac.config_commit();
        self.leader_data.set(LeaderData {
            partition_id: self.rng.get_u32(),
            weighting: self.leader_weight.get(),
            data_version: self.network_data.version(),
            stable_data_version: self.network_data.stable_version(),
            leader_router_id: router_id,
        });
        self.attach.set(AttachStage::Idle);
        self.attach_deadline.set(None);
        self.attach_attempts.set(0);
        self.attached_once.set(true);
        self.set_role(Role::Leader);
        self.router_id_seq.set(self.router_id_seq.get().wrapping_add(1));
        self.schedule_advertisement(true);
        self.persist();
        Ok(())
    }

    fn persist(&self) {
        let mut info = self.settings.read_network_info().unwrap_or(NetworkInfo {
            ext_address: self.mac.get_address_long(),
            ..NetworkInfo::default()
        });
        info.role = self.role.get() as u8;
        info.device_mode = self.device_mode.get().0;
        info.rloc16 = self.rloc16.get();
        info.key_sequence = self.keys.key_sequence();
        info.mle_frame_counter = self.mle_counter.get();
        info.previous_partition_id = self.leader_data.get().partition_id;
        info.ext_address = self.mac.get_address_long();
        let _ = self.settings.save_network_info(&info);
    }

    fn our_connectivity(&self) -> Connectivity {
        Connectivity {
            parent_priority: 0,
            link_quality_3: self.neighbors.router_count(StateFilter::InStateValid) as u8,
            leader_cost: match self.role.get() {
                Role::Leader => 0,
                _ => 1,
            },
            id_sequence: self.router_id_seq.get(),
            active_routers: self.router_ids.count() as u8,
            ..Connectivity::default()
        }
    }

    fn our_route64(&self) -> Route64 {
        let mut route = Route64 {
            id_sequence: self.router_id_seq.get(),
            id_mask: self.router_ids.mask(),
            ..Route64::default()
        };
        let mut count = 0;
        for id in 0..=MAX_ROUTER_ID {
            if !self.router_ids.is_allocated(id) {
                continue;
            }
            let cost = if id == (self.rloc16.get() >> 10) as u8 {
                // Self entry: outbound quality nibbles are zero.
                0x01
            } else {
                self.neighbors
                    .find_router_by_id(id, StateFilter::InStateValid)
                    .and_then(|idx| self.neighbors.with_router(idx, |r| r.link_cost))
                    .unwrap_or(0x0f)
            };
            if count < route.route_data.len() {
                route.route_data[count] = cost;
                count += 1;
            }
        }
        route.route_count = count as u8;
        route
    }

    // --- transmission ---

    fn send_mle(&self, dst: MacAddress, body: &[u8]) {
        let Some(buf) = self.tx_buf.take() else {
            kernel::debug!("[mle] tx busy; dropping {:?}", MleCommand::from_u8(body[0]));
            return;
        };

        let counter = self.mle_counter.get();
        self.mle_counter.set(counter.wrapping_add(1));
        self.settings.record_mle_frame_counter(counter.wrapping_add(1));

        let our_ext = self.mac.get_address_long();
        let src_ip = generate_link_local(&our_ext);
        let dst_ip = match dst {
            MacAddress::Long(ext) => generate_link_local(&ext),
            // Broadcast frames stand for the all-routers group.
            MacAddress::Short(_) => LINK_LOCAL_ALL_ROUTERS,
        };

        let mut payload = [0u8; 1 + AUX_SEC_HEADER_LEN + MAX_MLE_BODY + MIC_LEN];
        let key_seq = self.keys.key_sequence();
        let sealed = seal_mle_frame(
            &self.keys.current_pair().mle,
            key_seq,
            counter,
            &our_ext,
            &src_ip,
            &dst_ip,
            body,
            &mut payload,
        );
        let Some(payload_len) = sealed else {
            self.tx_buf.replace(buf);
            return;
        };

        let pan = self.mac.get_pan();
        match self
            .mac
            .prepare_data_frame(buf, pan, dst, pan, MacAddress::Long(our_ext), None)
        {
            Ok(mut frame) => {
                if frame.append_payload(&payload[..payload_len]).is_ok() {
                    self.tx_kind.set(TxKind::Mle);
                    if let Err((_, buf)) = self.mac.transmit(frame) {
                        self.tx_buf.replace(buf);
                    }
                } else {
                    self.tx_buf.replace(frame.into_buf());
                }
            }
            Err(buf) => {
                self.tx_buf.replace(buf);
            }
        }
    }

    /// Sleepy-child poll: a MAC data-request command to the parent.
    fn send_poll(&self) {
        let Some(parent) = self.neighbors.parent() else {
            return;
        };
        // A parent reachable only over the deferred-ack link cannot be
        // polled with a MAC data request.
        if radio_selector::select_poll_radio(&parent) != radio_selector::RadioType::Ieee802154 {
            return;
        }
        let Some(buf) = self.tx_buf.take() else {
            return;
        };
        // Listen for the flushed frame until the poll outcome says sleep.
        self.link.map(|link| link.set_rx_on_when_idle(true));
        let pan = self.mac.get_pan();
        let security = Some((
            SecurityLevel::EncMic32,
            KeyId::Index(key_index_for(self.keys.key_sequence())),
        ));
        match self.mac.prepare_command_frame(
            buf,
            pan,
            MacAddress::Short(parent.rloc16),
            pan,
            MacAddress::Short(self.rloc16.get()),
            // MAC data-request command identifier.
            0x04,
            security,
        ) {
            Ok(frame) => {
                self.tx_kind.set(TxKind::Poll);
                if let Err((_, buf)) = self.mac.transmit(frame) {
                    self.tx_buf.replace(buf);
                }
            }
            Err(buf) => {
                self.tx_buf.replace(buf);
            }
        }
    }

    // --- attach window / candidate selection ---

    /// Quality bucket of a link margin, for parent ranking.
    fn margin_bucket(margin: u8) -> u8 {
        match margin {
            0..=1 => 0,
            2..=9 => 1,
            10..=19 => 2,
            _ => 3,
        }
    }

    /// Whether `new` displaces `cur`. Exact ties prefer the newer response
    /// (the most recently received one wins).
    fn candidate_better(new: &ParentCandidate, cur: &ParentCandidate) -> bool {
        let new_key = (
            Self::margin_bucket(new.link_margin),
            new.connectivity.parent_priority,
            -(new.connectivity.leader_cost as i16),
        );
        let cur_key = (
            Self::margin_bucket(cur.link_margin),
            cur.connectivity.parent_priority,
            -(cur.connectivity.leader_cost as i16),
        );
        new_key >= cur_key
    }

    fn attach_window_closed(&self) {
        match self.parent_candidate.get() {
            Some(candidate) => {
                self.attach.set(AttachStage::ChildIdRequest);
                self.send_child_id_request(&candidate);
                self.attach_deadline
                    .set(Some(self.target_in_ms(CHILD_ID_TIMEOUT_MS)));
                self.reschedule();
            }
            None => self.attach_failed(),
        }
    }

    fn attach_failed(&self) {
        let attempts = self.attach_attempts.get() + 1;
        self.attach_attempts.set(attempts);
        self.attach.set(AttachStage::Idle);
        if attempts >= MAX_ATTACH_ATTEMPTS && self.device_mode.get().is_ftd() {
            // No partition to join: found one.
            self.attach_attempts.set(0);
            let _ = self.become_leader();
            return;
        }
        // Bounded backoff, then try again.
        self.attach_deadline
            .set(Some(self.target_in_ms(ATTACH_BACKOFF_MS)));
        self.attach.set(AttachStage::Idle);
        self.reschedule();
    }

    // --- message handlers ---

    fn handle_parent_request(&self, src_ext: [u8; 8], reader: &TlvReader, lqi: u8) {
        let respond = match self.role.get() {
            Role::Router | Role::Leader => true,
            Role::Child => {
                // A REED answers when the scan mask includes end devices.
                self.device_mode.get().is_ftd()
                    && reader
                        .scan_mask()
                        .is_some_and(|mask| mask & MulticastResponder::EndDevice as u8 != 0)
            }
            _ => false,
        };
        if !respond {
            return;
        }
        let Some(challenge) = reader.challenge() else {
            return;
        };
        // Sampled link margin stands in for the radio's RSS measurement.
        let margin = lqi / 8;
        self.send_parent_response(src_ext, challenge, margin);
    }

    fn handle_parent_response(&self, src_ext: [u8; 8], reader: &TlvReader) {
        if self.attach.get() != AttachStage::ParentRequest {
            return;
        }
        // The response must answer our outstanding challenge.
        if reader.response() != Some(self.own_challenge.get()) {
            return;
        }
        let (Some(source), Some(leader_data), Some(challenge)) =
            (reader.source_address(), reader.leader_data(), reader.challenge())
        else {
            return;
        };
        let candidate = ParentCandidate {
            ext_addr: src_ext,
            rloc16: source,
            link_margin: reader.link_margin().unwrap_or(0),
            connectivity: reader.connectivity().unwrap_or_default(),
            leader_data,
            challenge,
        };
        let better = match self.parent_candidate.get() {
            Some(cur) => Self::candidate_better(&candidate, &cur),
            None => true,
        };
        if better {
            self.parent_candidate.set(Some(candidate));
        }
    }

    fn handle_child_id_request(&self, src_ext: [u8; 8], reader: &TlvReader) {
        if !matches!(self.role.get(), Role::Router | Role::Leader) {
            return;
        }
        let Some(index) = self
            .neighbors
            .find_child_by_ext(&src_ext, StateFilter::InStateAnyExceptInvalid)
        else {
            return;
        };
        let challenge_ok = self
            .neighbors
            .with_child(index, |child| Some(child.challenge) == reader.response())
            .unwrap_or(false);
        if !challenge_ok {
            return;
        }

        let child_rloc = self.rloc16.get() | (index as u16 + 1);
        let now_s = self.seconds.get();
        let timeout = reader.timeout().unwrap_or(DEFAULT_CHILD_TIMEOUT_S);
        let mode = DeviceMode(reader.mode().unwrap_or(0));
        self.neighbors.with_child(index, |child| {
            child.neighbor.state = NeighborState::Valid;
            child.neighbor.rloc16 = child_rloc;
            child.neighbor.mode = mode;
            child.neighbor.last_heard_s = now_s;
            child.neighbor.mle_frame_counter = reader.mle_frame_counter();
            child.timeout_s = timeout;
            child.clear_ip_addrs();
        });
        let _ = self.settings.add_child_info(&crate::settings::ChildInfo {
            ext_address: src_ext,
            timeout,
            rloc16: child_rloc,
            mode: mode.0,
            version: reader.version().unwrap_or(0) as u8,
        });
        self.send_child_id_response(src_ext, child_rloc);
    }

    fn handle_child_id_response(&self, src_ext: [u8; 8], reader: &TlvReader) {
        if self.attach.get() != AttachStage::ChildIdRequest {
            return;
        }
        let Some(candidate) = self.parent_candidate.get() else {
            return;
        };
        if candidate.ext_addr != src_ext {
            return;
        }
        let Some(rloc) = reader.address16() else {
            return;
        };

        self.rloc16.set(rloc);
        self.mac.set_address(rloc);
        self.mac.config_commit();
        self.leader_data.set(reader.leader_data().unwrap_or(candidate.leader_data));
        if let Some(blob) = reader.network_data() {
            let ld = self.leader_data.get();
            let _ = self
                .network_data
                .set_leader_blob(blob, ld.data_version, ld.stable_data_version);
        }

        let mut parent = crate::net::thread::neighbor::Neighbor::reset_to(
            candidate.ext_addr,
            NeighborState::Valid,
        );
        parent.rloc16 = candidate.rloc16;
        parent.last_heard_s = self.seconds.get();
        self.neighbors.set_parent(parent);
        self.parent_last_heard_s.set(self.seconds.get());

        self.attach.set(AttachStage::Idle);
        self.attach_deadline.set(None);
        self.attach_attempts.set(0);
        self.attached_once.set(true);
        self.set_role(Role::Child);
        self.persist();
        let _ = self.settings.save_parent_info(&ParentInfo {
            ext_address: candidate.ext_addr,
            version: THREAD_VERSION as u8,
        });
    }

    fn handle_advertisement(&self, src_ext: [u8; 8], reader: &TlvReader) {
        let Some(leader_data) = reader.leader_data() else {
            return;
        };
        let ours = self.leader_data.get();
        let now_s = self.seconds.get();

        if self.role.get() == Role::Child {
            if let Some(parent) = self.neighbors.parent() {
                if parent.ext_addr == src_ext {
                    self.parent_last_heard_s.set(now_s);
                    self.neighbors.with_parent(|p| p.last_heard_s = now_s);
                }
            }
        }

        if self.attached_once.get() && leader_data.partition_id != ours.partition_id {
            // Partition merge: the higher (id, weight, version) wins and
            // the loser re-attaches into it.
            let theirs_key = (
                leader_data.partition_id,
                leader_data.weighting,
                leader_data.data_version,
            );
            let ours_key = (ours.partition_id, ours.weighting, ours.data_version);
            if theirs_key > ours_key {
                kernel::debug!(
                    "[mle] partition 0x{:08x} beats ours; reattaching",
                    leader_data.partition_id
                );
                self.attach_attempts.set(0);
                self.begin_attach();
            }
            return;
        }

        // Same partition: track the router and fetch newer network data.
        if let Some(source) = reader.source_address() {
            let router_id = (source >> 10) as u8;
            if matches!(self.role.get(), Role::Router | Role::Leader) {
                if let Some(index) =
                    self.neighbors
                        .allocate_router(src_ext, router_id, NeighborState::Valid)
                {
                    self.neighbors.with_router(index, |router| {
                        router.neighbor.rloc16 = source;
                        router.neighbor.last_heard_s = now_s;
                    });
                }
                if let Some(route) = reader.route64() {
                    self.process_route64(router_id, &route);
                }
            }
        }
        if self.role.get() != Role::Leader
            && leader_data.data_version.wrapping_sub(ours.data_version) as i8 > 0
        {
            self.send_data_request(src_ext);
        }
    }

    fn process_route64(&self, from_router_id: u8, route: &Route64) {
        // Update next hops: a destination advertised by a neighbor router
        // is reachable through it.
        let mut entry_index = 0;
        for id in 0..=MAX_ROUTER_ID {
            if route.id_mask & (1 << id) == 0 {
                continue;
            }
            let advertised_cost = route
                .route_data
                .get(entry_index)
                .copied()
                .unwrap_or(0x0f);
            entry_index += 1;
            if id == (self.rloc16.get() >> 10) as u8 {
                continue;
            }
            if let Some(index) = self
                .neighbors
                .find_router_by_id(id, StateFilter::InStateAnyExceptInvalid)
            {
                self.neighbors.with_router(index, |router| {
                    let via_cost = advertised_cost.saturating_add(1);
                    if router.neighbor.state != NeighborState::Valid
                        || router.next_hop.is_none()
                        || via_cost < router.path_cost
                    {
                        router.next_hop = Some(from_router_id);
                        router.path_cost = via_cost;
                    }
                });
            }
        }
    }

    fn handle_data_request(&self, src: MacAddress) {
        if matches!(self.role.get(), Role::Router | Role::Leader) {
            self.send_data_response(src);
        }
    }

    fn handle_data_response(&self, reader: &TlvReader) {
        let Some(leader_data) = reader.leader_data() else {
            return;
        };
        if let Some(blob) = reader.network_data() {
            let _ = self.network_data.set_leader_blob(
                blob,
                leader_data.data_version,
                leader_data.stable_data_version,
            );
            self.leader_data.set(leader_data);
        }
    }

    fn handle_child_update_request(&self, src_ext: [u8; 8], reader: &TlvReader) {
        if matches!(self.role.get(), Role::Router | Role::Leader) {
            // Keep-alive from one of our children.
            if let Some(index) = self
                .neighbors
                .find_child_by_ext(&src_ext, StateFilter::InStateValid)
            {
                let now_s = self.seconds.get();
                self.neighbors.with_child(index, |child| {
                    child.neighbor.last_heard_s = now_s;
                    if let Some(timeout) = reader.timeout() {
                        child.timeout_s = timeout;
                    }
                    if let Some(mode) = reader.mode() {
                        child.neighbor.mode = DeviceMode(mode);
                    }
                });
                self.send_child_update_response(src_ext, reader.challenge());
            }
        } else if self.role.get() == Role::Child {
            // Our parent checking on us.
            self.send_child_update_response(src_ext, reader.challenge());
        }
    }

    fn handle_child_update_response(&self, src_ext: [u8; 8]) {
        if let Some(parent) = self.neighbors.parent() {
            if parent.ext_addr == src_ext {
                self.parent_last_heard_s.set(self.seconds.get());
                self.neighbors
                    .with_parent(|p| p.last_heard_s = self.seconds.get());
                self.keepalive_outstanding.set(false);
            }
        }
    }

    fn handle_link_request(&self, src_ext: [u8; 8], reader: &TlvReader) {
        if self.role.get() != Role::Leader {
            // Only the leader assigns router ids in this implementation;
            // router-router links form from advertisements.
            return;
        }
        let Some(challenge) = reader.challenge() else {
            return;
        };
        // A repeated request from a known router keeps its id.
        let existing = self
            .neighbors
            .find_router_by_ext(&src_ext, StateFilter::InStateAnyExceptInvalid)
            .and_then(|idx| self.neighbors.with_router(idx, |r| r.router_id));
        let router_id = match existing {
            Some(id) => id,
            None => match self.router_ids.allocate() {
                Some(id) => id,
                None => {
                    kernel::debug!("[mle] router id space exhausted");
                    return;
                }
            },
        };
        self.router_id_seq.set(self.router_id_seq.get().wrapping_add(1));
        let new_rloc = (router_id as u16) << 10;
        if let Some(index) =
            self.neighbors
                .allocate_router(src_ext, router_id, NeighborState::LinkRequest)
        {
            self.neighbors.with_router(index, |router| {
                router.neighbor.rloc16 = new_rloc;
                router.neighbor.state = NeighborState::Valid;
                router.neighbor.last_heard_s = self.seconds.get();
            });
        }

        let mut body = [0u8; MAX_MLE_BODY];
        let mut off = 0;
        body[off] = MleCommand::LinkAccept as u8;
        off += 1;
        off += unwrap_tlv_offset(Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Response(challenge).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Address16(new_rloc).encode(&mut body[off..]));
        off += unwrap_tlv_offset(Tlv::Route64(self.our_route64()).encode(&mut body[off..]));
        off += unwrap_tlv_offset(
            Tlv::LeaderData(self.leader_data.get()).encode(&mut body[off..]),
        );
        self.send_mle(MacAddress::Long(src_ext), &body[..off]);
    }

    fn handle_link_accept(&self, src_ext: [u8; 8], reader: &TlvReader, and_request: bool) {
        if self.role.get() == Role::Child {
            // Promotion completed: the leader assigned us a router id.
            if reader.response() != Some(self.own_challenge.get()) {
                return;
            }
            let Some(rloc) = reader.address16() else {
                return;
            };
            self.rloc16.set(rloc);
            self.mac.set_address(rloc);
            self.mac.config_commit();
            let router_id = (rloc >> 10) as u8;
            let _ = self.router_ids.claim(router_id);
            if let Some(route) = reader.route64() {
                // Adopt the leader's view of the id space.
                self.router_id_seq.set(route.id_sequence);
                for id in 0..=MAX_ROUTER_ID {
                    if route.id_mask & (1 << id) != 0 {
                        let _ = self.router_ids.claim(id);
                    }
                }
            }
            self.set_role(Role::Router);
            self.schedule_advertisement(true);
            self.persist();
        } else if matches!(self.role.get(), Role::Router | Role::Leader) {
            // A router link handshake completing.
            if let Some(source) = reader.source_address() {
                let router_id = (source >> 10) as u8;
                if let Some(index) =
                    self.neighbors
                        .allocate_router(src_ext, router_id, NeighborState::Valid)
                {
                    self.neighbors.with_router(index, |router| {
                        router.neighbor.rloc16 = source;
                        router.neighbor.last_heard_s = self.seconds.get();
                    });
                }
            }
            if and_request {
                if let Some(challenge) = reader.challenge() {
                    let mut body = [0u8; MAX_MLE_BODY];
                    let mut off = 0;
                    body[off] = MleCommand::LinkAccept as u8;
                    off += 1;
                    off += unwrap_tlv_offset(
                        Tlv::SourceAddress(self.rloc16.get()).encode(&mut body[off..]),
                    );
                    off += unwrap_tlv_offset(Tlv::Response(challenge).encode(&mut body[off..]));
                    self.send_mle(MacAddress::Long(src_ext), &body[..off]);
                }
            }
        }
    }

    // --- housekeeping ---

    fn tick(&self) {
        let now_s = self.seconds.get().wrapping_add(1);
        self.seconds.set(now_s);

        match self.role.get() {
            Role::Child => {
                let timeout = self.timeout_s.get();
                let silent = now_s.wrapping_sub(self.parent_last_heard_s.get());
                if silent > timeout {
                    kernel::debug!("[mle] parent lost; reattaching");
                    self.attach_attempts.set(0);
                    self.begin_attach();
                } else if silent > timeout / 2 && !self.keepalive_outstanding.get() {
                    self.send_child_update_request();
                }
            }
            Role::Router | Role::Leader => {
                self.age_children(now_s);
                self.age_routers(now_s);
            }
            _ => {}
        }
        self.schedule_tick();
    }

    fn age_children(&self, now_s: u32) {
        let mut expired = [None; crate::net::thread::neighbor::MAX_CHILDREN];
        let mut n = 0;
        self.neighbors
            .each_child(StateFilter::InStateAnyExceptInvalid, |i, child| {
                if now_s.wrapping_sub(child.neighbor.last_heard_s) > child.timeout_s && n < expired.len()
                {
                    expired[n] = Some(i);
                    n += 1;
                }
            });
        for index in expired.iter().flatten() {
            kernel::debug!("[mle] child {} timed out", index);
            self.neighbors.remove_child(*index);
        }
    }

    fn age_routers(&self, now_s: u32) {
        let mut expired = [None; 8];
        let mut n = 0;
        self.neighbors
            .each_router(StateFilter::InStateAnyExceptInvalid, |i, router| {
                if now_s.wrapping_sub(router.neighbor.last_heard_s) > MAX_NEIGHBOR_AGE_S
                    && n < expired.len()
                {
                    expired[n] = Some(i);
                    n += 1;
                }
            });
        for index in expired.iter().flatten() {
            self.neighbors.remove_router(*index);
        }
        // A router that can no longer hear any other router steps down and
        // attaches as a child again (REED downgrade). A leader stays: it
        // may simply have no peers.
        if self.role.get() == Role::Router
            && self.neighbors.router_count(StateFilter::InStateValid) == 0
        {
            kernel::debug!("[mle] no router neighbors; downgrading");
            self.attach_attempts.set(0);
            self.begin_attach();
        }
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> AlarmClient for Mle<'a, M, A> {
    fn alarm(&self) {
        let now = self.now_ticks();
        if Self::expired(now, self.attach_deadline.get()) {
            self.attach_deadline.set(None);
            match self.attach.get() {
                AttachStage::ParentRequest => self.attach_window_closed(),
                AttachStage::ChildIdRequest => self.attach_failed(),
                AttachStage::Idle => {
                    if self.role.get() == Role::Detached {
                        self.begin_attach();
                    }
                }
            }
        }
        if Self::expired(now, self.advert_deadline.get()) {
            self.advert_deadline.set(None);
            if matches!(self.role.get(), Role::Router | Role::Leader) {
                self.send_advertisement();
                self.advert_interval_ms.set(
                    (self.advert_interval_ms.get() * 2).min(ADVERT_INTERVAL_MAX_MS),
                );
                self.schedule_advertisement(false);
            }
        }
        if Self::expired(now, self.poll_deadline.get()) {
            self.poll_deadline.set(None);
            if self.role.get() == Role::Child && !self.device_mode.get().rx_on_when_idle() {
                self.send_poll();
                self.schedule_poll();
            }
        }
        if Self::expired(now, self.tick_deadline.get()) {
            self.tick_deadline.set(None);
            self.tick();
        }
        self.reschedule();
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> device::TxClient for Mle<'a, M, A> {
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        _result: Result<(), ErrorCode>,
    ) {
        self.tx_buf.replace(buf);
        if self.tx_kind.get() == TxKind::Poll {
            // The ack's frame-pending bit says whether the parent has a
            // frame queued; without one the receiver can sleep again.
            if !(acked && ack_frame_pending) && !self.device_mode.get().rx_on_when_idle() {
                self.link.map(|link| link.set_rx_on_when_idle(false));
            }
        }
    }
}

impl<'a, M: MacDevice<'a>, A: Alarm<'a>> device::RxClient for Mle<'a, M, A> {
    fn receive(&self, buf: &[u8], header: Header, lqi: u8, data_offset: usize, data_len: usize) {
        if self.role.get() == Role::Disabled || header.frame_type != FrameType::Data {
            return;
        }
        let payload = &buf[data_offset..data_offset + data_len];
        if payload.first() != Some(&SECURITY_SUITE_154) {
            // Not an MLE message; the datagram path handles it.
            return;
        }
        let src_ext = match header.src_addr {
            Some(MacAddress::Long(ext)) => ext,
            _ => return,
        };

        let our_ext = self.mac.get_address_long();
        let src_ip = generate_link_local(&src_ext);
        let dst_ip = match header.dst_addr {
            Some(addr) if addr.is_broadcast() => LINK_LOCAL_ALL_ROUTERS,
            _ => generate_link_local(&our_ext),
        };

        let mut body = [0u8; MAX_MLE_BODY];
        let Some((body_len, _key_seq, counter)) =
            open_mle_frame(self.keys, &src_ext, &src_ip, &dst_ip, payload, &mut body)
        else {
            kernel::debug!("[mle] dropped message failing security from {:02x?}", src_ext);
            return;
        };

        // Per-neighbor MLE counters advance monotonically.
        let fresh = self
            .neighbors
            .with_neighbor_by_ext(&src_ext, StateFilter::InStateAnyExceptInvalid, |n| {
                n.accept_mle_counter(counter)
            })
            .unwrap_or(true);
        if !fresh {
            kernel::debug!("[mle] replayed message from {:02x?}", src_ext);
            return;
        }

        let body = &body[..body_len];
        let Some(command) = body.first().copied().and_then(MleCommand::from_u8) else {
            return;
        };
        let reader = TlvReader::new(&body[1..]);

        match command {
            MleCommand::ParentRequest => self.handle_parent_request(src_ext, &reader, lqi),
            MleCommand::ParentResponse => self.handle_parent_response(src_ext, &reader),
            MleCommand::ChildIdRequest => self.handle_child_id_request(src_ext, &reader),
            MleCommand::ChildIdResponse => self.handle_child_id_response(src_ext, &reader),
            MleCommand::Advertisement => self.handle_advertisement(src_ext, &reader),
            MleCommand::DataRequest => {
                self.handle_data_request(header.src_addr.unwrap_or(MacAddress::Long(src_ext)))
            }
            MleCommand::DataResponse => self.handle_data_response(&reader),
            MleCommand::ChildUpdateRequest => self.handle_child_update_request(src_ext, &reader),
            MleCommand::ChildUpdateResponse => self.handle_child_update_response(src_ext),
            MleCommand::LinkRequest => self.handle_link_request(src_ext, &reader),
            MleCommand::LinkAccept => self.handle_link_accept(src_ext, &reader, false),
            MleCommand::LinkAcceptAndRequest => self.handle_link_accept(src_ext, &reader, true),
        }
    }
}
