// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Neighbor, child and router tables.
//!
//! All entries embed a shared [`Neighbor`] core by composition and are
//! addressed by slot indices; cross-references between entries are indices,
//! never pointers. Lookups take a [`StateFilter`] and never return `Invalid`
//! entries. Every state transition goes through the table so the observer
//! can be notified and an `Invalid` entry's slot is immediately reusable.

use crate::ieee802154::framer::DeviceProcedure;
use crate::net::ieee802154::{MacAddress, SHORT_ADDR_UNSPECIFIED};
use crate::net::ipv6::IPAddr;

use kernel::utilities::cells::{MapCell, OptionalCell};

use core::cell::Cell;

pub const MAX_CHILDREN: usize = 10;
pub const MAX_ROUTERS: usize = 63;
/// Router ids span 0..=62.
pub const MAX_ROUTER_ID: u8 = 62;
/// IPv6 addresses registered per child.
pub const MAX_CHILD_IP_ADDRS: usize = 10;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NeighborState {
    Invalid,
    /// Restored from non-volatile storage, handshake not yet refreshed.
    Restored,
    /// Created while soliciting a candidate parent.
    ParentRequest,
    /// A parent response was received and is being evaluated.
    ParentResponse,
    /// A child id handshake is in progress.
    ChildIdRequest,
    /// A router link handshake is in progress.
    LinkRequest,
    Valid,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StateFilter {
    InStateValid,
    InStateValidOrRestoring,
    InStateAnyExceptInvalid,
}

impl NeighborState {
    pub fn matches(&self, filter: StateFilter) -> bool {
        match filter {
            StateFilter::InStateValid => *self == NeighborState::Valid,
            StateFilter::InStateValidOrRestoring => {
                matches!(self, NeighborState::Valid | NeighborState::Restored)
            }
            StateFilter::InStateAnyExceptInvalid => *self != NeighborState::Invalid,
        }
    }
}

/// Device mode bits, as carried in the MLE Mode TLV.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct DeviceMode(pub u8);

impl DeviceMode {
    pub const FULL_NETWORK_DATA: u8 = 0x01;
    pub const FULL_THREAD_DEVICE: u8 = 0x02;
    pub const SECURE_DATA_REQUESTS: u8 = 0x04;
    pub const RX_ON_WHEN_IDLE: u8 = 0x08;

    pub fn rx_on_when_idle(&self) -> bool {
        self.0 & Self::RX_ON_WHEN_IDLE != 0
    }

    pub fn is_ftd(&self) -> bool {
        self.0 & Self::FULL_THREAD_DEVICE != 0
    }

    pub fn full_network_data(&self) -> bool {
        self.0 & Self::FULL_NETWORK_DATA != 0
    }
}

/// Exponentially smoothed link statistics.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LinkQuality {
    /// Average RSSI in dBm, scaled by 8.
    avg_rssi_x8: i16,
    /// Average LQI, scaled by 8.
    avg_lqi_x8: u16,
    samples: u8,
}

impl Default for LinkQuality {
    fn default() -> Self {
        LinkQuality {
            avg_rssi_x8: 0,
            avg_lqi_x8: 0,
            samples: 0,
        }
    }
}

impl LinkQuality {
    /// Fold in one sample: new = (3 * old + sample) / 4.
    pub fn add_sample(&mut self, rssi: i8, lqi: u8) {
        if self.samples == 0 {
            self.avg_rssi_x8 = rssi as i16 * 8;
            self.avg_lqi_x8 = lqi as u16 * 8;
        } else {
            self.avg_rssi_x8 = (self.avg_rssi_x8 * 3 + rssi as i16 * 8) / 4;
            self.avg_lqi_x8 = (self.avg_lqi_x8 * 3 + lqi as u16 * 8) / 4;
        }
        self.samples = self.samples.saturating_add(1);
    }

    pub fn average_rssi(&self) -> Option<i8> {
        if self.samples == 0 {
            None
        } else {
            Some((self.avg_rssi_x8 / 8) as i8)
        }
    }

    pub fn average_lqi(&self) -> Option<u8> {
        if self.samples == 0 {
            None
        } else {
            Some((self.avg_lqi_x8 / 8) as u8)
        }
    }
}

/// Radio-link bookkeeping for the multi-radio selector.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct RadioLinks {
    /// Bit per `RadioType`.
    pub supported: u8,
    /// Preference nibble per radio.
    pub preference: [u8; 2],
    /// Outstanding deferred acknowledgements.
    pub pending_acks: u8,
}

/// The state shared by every kind of neighbor, embedded by composition in
/// [`ChildEntry`] and [`RouterEntry`].
#[derive(Copy, Clone, Debug)]
pub struct Neighbor {
    pub state: NeighborState,
    pub ext_addr: [u8; 8],
    pub rloc16: u16,
    pub mode: DeviceMode,
    pub last_heard_s: u32,
    pub link: LinkQuality,
    /// Last accepted link-layer frame counter and the key sequence it
    /// belongs to.
    pub link_frame_counter: Option<u32>,
    pub link_counter_key_seq: u32,
    /// Last accepted MLE frame counter.
    pub mle_frame_counter: Option<u32>,
    pub radios: RadioLinks,
}

impl Default for Neighbor {
    fn default() -> Self {
        Neighbor {
            state: NeighborState::Invalid,
            ext_addr: [0; 8],
            rloc16: SHORT_ADDR_UNSPECIFIED,
            mode: DeviceMode::default(),
            last_heard_s: 0,
            link: LinkQuality::default(),
            link_frame_counter: None,
            link_counter_key_seq: 0,
            mle_frame_counter: None,
            radios: RadioLinks::default(),
        }
    }
}

impl Neighbor {
    pub fn reset_to(ext_addr: [u8; 8], state: NeighborState) -> Neighbor {
        Neighbor {
            state,
            ext_addr,
            ..Neighbor::default()
        }
    }

    /// Check and record an incoming MLE frame counter; false on replay.
    pub fn accept_mle_counter(&mut self, counter: u32) -> bool {
        match self.mle_frame_counter {
            Some(last) if counter <= last => false,
            _ => {
                self.mle_frame_counter = Some(counter);
                true
            }
        }
    }
}

/// Shared accessors over any neighbor-bearing entry.
pub trait NeighborOps {
    fn neighbor(&self) -> &Neighbor;
    fn neighbor_mut(&mut self) -> &mut Neighbor;
}

#[derive(Copy, Clone, Debug)]
pub struct ChildEntry {
    pub neighbor: Neighbor,
    pub ip_addrs: [Option<IPAddr>; MAX_CHILD_IP_ADDRS],
    /// Challenge sent in our Parent Response, echoed by the Child Id
    /// Request.
    pub challenge: [u8; 8],
    /// Keep-alive timeout requested by the child, in seconds.
    pub timeout_s: u32,
    /// CSL clock accuracy in ppm, when the child uses CSL.
    pub csl_accuracy_ppm: u8,
}

impl Default for ChildEntry {
    fn default() -> Self {
        ChildEntry {
            neighbor: Neighbor::default(),
            ip_addrs: [None; MAX_CHILD_IP_ADDRS],
            challenge: [0; 8],
            timeout_s: 240,
            csl_accuracy_ppm: 0,
        }
    }
}

impl NeighborOps for ChildEntry {
    fn neighbor(&self) -> &Neighbor {
        &self.neighbor
    }
    fn neighbor_mut(&mut self) -> &mut Neighbor {
        &mut self.neighbor
    }
}

impl ChildEntry {
    pub fn register_ip_addr(&mut self, addr: IPAddr) -> bool {
        if self.ip_addrs.iter().any(|a| *a == Some(addr)) {
            return true;
        }
        match self.ip_addrs.iter_mut().find(|a| a.is_none()) {
            Some(slot) => {
                *slot = Some(addr);
                true
            }
            None => false,
        }
    }

    pub fn clear_ip_addrs(&mut self) {
        self.ip_addrs = [None; MAX_CHILD_IP_ADDRS];
    }

    pub fn has_ip_addr(&self, addr: &IPAddr) -> bool {
        self.ip_addrs.iter().any(|a| *a == Some(*addr))
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RouterEntry {
    pub neighbor: Neighbor,
    pub router_id: u8,
    /// Next hop toward this router, as a router id.
    pub next_hop: Option<u8>,
    /// Cost of the link to this router, when it is a direct neighbor.
    pub link_cost: u8,
    /// Cost of the full path via `next_hop`.
    pub path_cost: u8,
}

impl Default for RouterEntry {
    fn default() -> Self {
        RouterEntry {
            neighbor: Neighbor::default(),
            router_id: 0,
            next_hop: None,
            link_cost: 0,
            path_cost: 0,
        }
    }
}

impl NeighborOps for RouterEntry {
    fn neighbor(&self) -> &Neighbor {
        &self.neighbor
    }
    fn neighbor_mut(&mut self) -> &mut Neighbor {
        &mut self.neighbor
    }
}

/// Leader-side router-id allocation: a subset of 0..=62 with no duplicates.
#[derive(Default)]
pub struct RouterIdMap {
    allocated: Cell<u64>,
}

impl RouterIdMap {
    pub fn new() -> RouterIdMap {
        RouterIdMap {
            allocated: Cell::new(0),
        }
    }

    /// Allocate the lowest free router id.
    pub fn allocate(&self) -> Option<u8> {
        let mask = self.allocated.get();
        (0..=MAX_ROUTER_ID).find(|&id| mask & (1 << id) == 0).inspect(|&id| {
            self.allocated.set(mask | (1 << id));
        })
    }

    /// Claim a specific id (e.g. when restoring state).
    pub fn claim(&self, id: u8) -> bool {
        if id > MAX_ROUTER_ID || self.allocated.get() & (1 << id) != 0 {
            return false;
        }
        self.allocated.set(self.allocated.get() | (1 << id));
        true
    }

    pub fn release(&self, id: u8) {
        if id <= MAX_ROUTER_ID {
            self.allocated.set(self.allocated.get() & !(1 << id));
        }
    }

    pub fn is_allocated(&self, id: u8) -> bool {
        id <= MAX_ROUTER_ID && self.allocated.get() & (1 << id) != 0
    }

    pub fn mask(&self) -> u64 {
        self.allocated.get()
    }

    pub fn count(&self) -> u32 {
        self.allocated.get().count_ones()
    }
}

/// Table lifecycle notifications.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NeighborEvent {
    ChildAdded,
    ChildRemoved,
    RouterAdded,
    RouterRemoved,
    ParentChanged,
}

pub trait NeighborObserver {
    fn neighbor_event(&self, event: NeighborEvent, ext_addr: &[u8; 8], rloc16: u16);
}

/// The combined neighbor database: one parent, the children, the routers.
pub struct NeighborTable<'a> {
    parent: Cell<Option<Neighbor>>,
    children: MapCell<[ChildEntry; MAX_CHILDREN]>,
    routers: MapCell<[RouterEntry; MAX_ROUTERS]>,
    observer: OptionalCell<&'a dyn NeighborObserver>,
}

impl<'a> NeighborTable<'a> {
    pub fn new() -> NeighborTable<'a> {
        NeighborTable {
            parent: Cell::new(None),
            children: MapCell::new([ChildEntry::default(); MAX_CHILDREN]),
            routers: MapCell::new([RouterEntry::default(); MAX_ROUTERS]),
            observer: OptionalCell::empty(),
        }
    }

    pub fn set_observer(&self, observer: &'a dyn NeighborObserver) {
        self.observer.set(observer);
    }

    // --- parent ---

    pub fn parent(&self) -> Option<Neighbor> {
        self.parent.get()
    }

    pub fn set_parent(&self, parent: Neighbor) {
        let ext = parent.ext_addr;
        let rloc = parent.rloc16;
        self.parent.set(Some(parent));
        self.observer
            .map(|o| o.neighbor_event(NeighborEvent::ParentChanged, &ext, rloc));
    }

    pub fn with_parent<R>(&self, f: impl FnOnce(&mut Neighbor) -> R) -> Option<R> {
        let mut parent = self.parent.get()?;
        let res = f(&mut parent);
        self.parent.set(Some(parent));
        Some(res)
    }

    pub fn clear_parent(&self) {
        if let Some(parent) = self.parent.take() {
            self.observer.map(|o| {
                o.neighbor_event(NeighborEvent::ParentChanged, &parent.ext_addr, parent.rloc16)
            });
        }
    }

    // --- children ---

    pub fn find_child_by_ext(&self, ext_addr: &[u8; 8], filter: StateFilter) -> Option<usize> {
        self.children.map_or(None, |children| {
            children.iter().position(|c| {
                c.neighbor.state.matches(filter) && c.neighbor.ext_addr == *ext_addr
            })
        })
    }

    pub fn find_child_by_short(&self, rloc16: u16, filter: StateFilter) -> Option<usize> {
        self.children.map_or(None, |children| {
            children
                .iter()
                .position(|c| c.neighbor.state.matches(filter) && c.neighbor.rloc16 == rloc16)
        })
    }

    /// Claim a free (Invalid) child slot for `ext_addr`, initializing it in
    /// the given state.
    pub fn allocate_child(&self, ext_addr: [u8; 8], state: NeighborState) -> Option<usize> {
        if let Some(existing) = self.find_child_by_ext(&ext_addr, StateFilter::InStateAnyExceptInvalid)
        {
            // One entry per extended address.
            self.with_child(existing, |child| child.neighbor.state = state);
            return Some(existing);
        }
        let slot = self.children.map_or(None, |children| {
            children
                .iter()
                .position(|c| c.neighbor.state == NeighborState::Invalid)
        })?;
        self.children.map(|children| {
            children[slot] = ChildEntry {
                neighbor: Neighbor::reset_to(ext_addr, state),
                ..ChildEntry::default()
            };
        });
        self.observer
            .map(|o| o.neighbor_event(NeighborEvent::ChildAdded, &ext_addr, SHORT_ADDR_UNSPECIFIED));
        Some(slot)
    }

    pub fn with_child<R>(&self, index: usize, f: impl FnOnce(&mut ChildEntry) -> R) -> Option<R> {
        self.children.map_or(None, |children| {
            children.get_mut(index).map(f)
        })
    }

    pub fn remove_child(&self, index: usize) {
        let removed = self.children.map_or(None, |children| {
            children.get_mut(index).and_then(|child| {
                if child.neighbor.state == NeighborState::Invalid {
                    None
                } else {
                    let ext = child.neighbor.ext_addr;
                    let rloc = child.neighbor.rloc16;
                    *child = ChildEntry::default();
                    Some((ext, rloc))
                }
            })
        });
        if let Some((ext, rloc)) = removed {
            self.observer
                .map(|o| o.neighbor_event(NeighborEvent::ChildRemoved, &ext, rloc));
        }
    }

    /// Visit children matching the filter. Removal during iteration is not
    /// supported; collect indices instead.
    pub fn each_child(&self, filter: StateFilter, mut f: impl FnMut(usize, &mut ChildEntry)) {
        self.children.map(|children| {
            for (i, child) in children.iter_mut().enumerate() {
                if child.neighbor.state.matches(filter) {
                    f(i, child);
                }
            }
        });
    }

    pub fn child_count(&self, filter: StateFilter) -> usize {
        self.children.map_or(0, |children| {
            children
                .iter()
                .filter(|c| c.neighbor.state.matches(filter))
                .count()
        })
    }

    // --- routers ---

    pub fn find_router_by_id(&self, router_id: u8, filter: StateFilter) -> Option<usize> {
        self.routers.map_or(None, |routers| {
            routers.iter().position(|r| {
                r.neighbor.state.matches(filter) && r.router_id == router_id
            })
        })
    }

    pub fn find_router_by_ext(&self, ext_addr: &[u8; 8], filter: StateFilter) -> Option<usize> {
        self.routers.map_or(None, |routers| {
            routers.iter().position(|r| {
                r.neighbor.state.matches(filter) && r.neighbor.ext_addr == *ext_addr
            })
        })
    }

    pub fn allocate_router(
        &self,
        ext_addr: [u8; 8],
        router_id: u8,
        state: NeighborState,
    ) -> Option<usize> {
        if let Some(existing) = self.find_router_by_ext(&ext_addr, StateFilter::InStateAnyExceptInvalid)
        {
            self.with_router(existing, |router| {
                router.router_id = router_id;
                router.neighbor.state = state;
            });
            return Some(existing);
        }
        let slot = self.routers.map_or(None, |routers| {
            routers
                .iter()
                .position(|r| r.neighbor.state == NeighborState::Invalid)
        })?;
        self.routers.map(|routers| {
            routers[slot] = RouterEntry {
                neighbor: Neighbor::reset_to(ext_addr, state),
                router_id,
                ..RouterEntry::default()
            };
        });
        self.observer
            .map(|o| o.neighbor_event(NeighborEvent::RouterAdded, &ext_addr, SHORT_ADDR_UNSPECIFIED));
        Some(slot)
    }

    pub fn with_router<R>(&self, index: usize, f: impl FnOnce(&mut RouterEntry) -> R) -> Option<R> {
        self.routers.map_or(None, |routers| {
            routers.get_mut(index).map(f)
        })
    }

    pub fn remove_router(&self, index: usize) {
        let removed = self.routers.map_or(None, |routers| {
            routers.get_mut(index).and_then(|router| {
                if router.neighbor.state == NeighborState::Invalid {
                    None
                } else {
                    let ext = router.neighbor.ext_addr;
                    let rloc = router.neighbor.rloc16;
                    *router = RouterEntry::default();
                    Some((ext, rloc))
                }
            })
        });
        if let Some((ext, rloc)) = removed {
            self.observer
                .map(|o| o.neighbor_event(NeighborEvent::RouterRemoved, &ext, rloc));
        }
    }

    pub fn each_router(&self, filter: StateFilter, mut f: impl FnMut(usize, &mut RouterEntry)) {
        self.routers.map(|routers| {
            for (i, router) in routers.iter_mut().enumerate() {
                if router.neighbor.state.matches(filter) {
                    f(i, router);
                }
            }
        });
    }

    pub fn router_count(&self, filter: StateFilter) -> usize {
        self.routers.map_or(0, |routers| {
            routers
                .iter()
                .filter(|r| r.neighbor.state.matches(filter))
                .count()
        })
    }

    // --- cross-table lookups ---

    /// Run `f` on whichever neighbor (parent, child or router) has this
    /// extended address and passes the filter.
    pub fn with_neighbor_by_ext<R>(
        &self,
        ext_addr: &[u8; 8],
        filter: StateFilter,
        f: impl FnOnce(&mut Neighbor) -> R,
    ) -> Option<R> {
        if let Some(parent) = self.parent.get() {
            if parent.state.matches(filter) && parent.ext_addr == *ext_addr {
                return self.with_parent(f);
            }
        }
        if let Some(index) = self.find_child_by_ext(ext_addr, filter) {
            return self.with_child(index, |child| f(&mut child.neighbor));
        }
        if let Some(index) = self.find_router_by_ext(ext_addr, filter) {
            return self.with_router(index, |router| f(&mut router.neighbor));
        }
        None
    }

    fn ext_for_short(&self, rloc16: u16) -> Option<[u8; 8]> {
        if let Some(parent) = self.parent.get() {
            if parent.state != NeighborState::Invalid && parent.rloc16 == rloc16 {
                return Some(parent.ext_addr);
            }
        }
        if let Some(index) = self.find_child_by_short(rloc16, StateFilter::InStateAnyExceptInvalid) {
            return self.with_child(index, |c| c.neighbor.ext_addr);
        }
        self.routers.map_or(None, |routers| {
            routers
                .iter()
                .find(|r| {
                    r.neighbor.state != NeighborState::Invalid && r.neighbor.rloc16 == rloc16
                })
                .map(|r| r.neighbor.ext_addr)
        })
    }
}

impl<'a> Default for NeighborTable<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> DeviceProcedure for NeighborTable<'a> {
    fn lookup_addr_long(&self, addr: MacAddress) -> Option<[u8; 8]> {
        match addr {
            MacAddress::Long(long) => self
                .with_neighbor_by_ext(&long, StateFilter::InStateAnyExceptInvalid, |_| ())
                .map(|()| long),
            MacAddress::Short(short) => self.ext_for_short(short),
        }
    }

    fn link_frame_counter(&self, addr: &[u8; 8], key_seq: u32) -> Option<u32> {
        self.with_neighbor_by_ext(addr, StateFilter::InStateAnyExceptInvalid, |n| {
            if n.link_counter_key_seq == key_seq {
                n.link_frame_counter
            } else {
                // A different key sequence starts a fresh counter window.
                None
            }
        })
        .flatten()
    }

    fn set_link_frame_counter(&self, addr: &[u8; 8], key_seq: u32, counter: u32) {
        self.with_neighbor_by_ext(addr, StateFilter::InStateAnyExceptInvalid, |n| {
            n.link_counter_key_seq = key_seq;
            n.link_frame_counter = Some(counter);
        });
    }
}
