// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! EID-to-RLOC16 resolution cache.
//!
//! Destinations inside the Thread network but outside the link are addressed
//! by a stable EID; delivery needs the current RLOC16. Entries move through
//! `Invalid -> Query -> Cached`, with snooped entries fed from received
//! datagrams' source information. Queries retry with exponential backoff; an
//! exhausted query invalidates the entry so the next datagram starts over.
//! The table is fixed-size with least-recently-used eviction of non-Query
//! entries.

use crate::net::ipv6::IPAddr;

use kernel::hil::time::{Alarm, AlarmClient, ConvertTicks};
use kernel::utilities::cells::{MapCell, OptionalCell};
use kernel::ErrorCode;

use core::cell::Cell;

pub const CACHE_SIZE: usize = 8;

/// First retry after this many seconds, doubling each time.
const INITIAL_RETRY_DELAY_S: u32 = 4;
/// Backoff ceiling; a query that would wait longer is abandoned.
pub const MAX_RETRY_DELAY_S: u32 = 120;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CacheState {
    Invalid,
    /// An address query is outstanding.
    Query,
    /// Learned passively from mesh traffic; unconfirmed.
    Snooped,
    Cached,
}

#[derive(Copy, Clone)]
struct CacheEntry {
    state: CacheState,
    target: IPAddr,
    rloc16: u16,
    /// LRU stamp; larger is more recent.
    last_used: u32,
    /// Seconds until the outstanding query retries.
    retry_in_s: u32,
    /// Next retry interval.
    retry_delay_s: u32,
}

impl Default for CacheEntry {
    fn default() -> Self {
        CacheEntry {
            state: CacheState::Invalid,
            target: IPAddr::new(),
            rloc16: 0xfffe,
            last_used: 0,
            retry_in_s: 0,
            retry_delay_s: INITIAL_RETRY_DELAY_S,
        }
    }
}

/// Sends the actual address-query message for the resolver.
pub trait AddressQuerySender {
    fn send_address_query(&self, target: &IPAddr);
}

pub struct AddressResolver<'a, A: Alarm<'a>> {
    alarm: &'a A,
    entries: MapCell<[CacheEntry; CACHE_SIZE]>,
    sender: OptionalCell<&'a dyn AddressQuerySender>,
    clock: Cell<u32>,
}

impl<'a, A: Alarm<'a>> AddressResolver<'a, A> {
    pub fn new(alarm: &'a A) -> AddressResolver<'a, A> {
        AddressResolver {
            alarm,
            entries: MapCell::new([CacheEntry::default(); CACHE_SIZE]),
            sender: OptionalCell::empty(),
            clock: Cell::new(0),
        }
    }

    pub fn set_query_sender(&self, sender: &'a dyn AddressQuerySender) {
        self.sender.set(sender);
    }

    fn touch(&self) -> u32 {
        let stamp = self.clock.get().wrapping_add(1);
        self.clock.set(stamp);
        stamp
    }

    fn find(&self, target: &IPAddr) -> Option<usize> {
        self.entries.map_or(None, |entries| {
            entries
                .iter()
                .position(|e| e.state != CacheState::Invalid && e.target == *target)
        })
    }

    /// Pick a slot for a new entry: a free one, else the least recently
    /// used entry that is not mid-query.
    fn allocate(&self) -> Option<usize> {
        self.entries.map_or(None, |entries| {
            if let Some(free) = entries
                .iter()
                .position(|e| e.state == CacheState::Invalid)
            {
                return Some(free);
            }
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.state != CacheState::Query)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
        })
    }

    fn ensure_timer(&self) {
        let pending = self.entries.map_or(false, |entries| {
            entries.iter().any(|e| e.state == CacheState::Query)
        });
        if pending && !self.alarm.is_armed() {
            self.alarm
                .set_alarm(self.alarm.now(), self.alarm.ticks_from_seconds(1));
        }
    }

    /// Resolve `target` to an RLOC16.
    ///
    /// `Cached` and `Snooped` entries answer immediately (snooped entries
    /// are promoted on first use). Otherwise an address query is launched
    /// and `BUSY` tells the caller to retry after resolution completes.
    pub fn resolve(&self, target: &IPAddr) -> Result<u16, ErrorCode> {
        let stamp = self.touch();
        if let Some(index) = self.find(target) {
            let outcome = self.entries.map_or(Err(ErrorCode::FAIL), |entries| {
                let entry = &mut entries[index];
                match entry.state {
                    CacheState::Cached => {
                        entry.last_used = stamp;
                        Ok(entry.rloc16)
                    }
                    CacheState::Snooped => {
                        entry.state = CacheState::Cached;
                        entry.last_used = stamp;
                        Ok(entry.rloc16)
                    }
                    CacheState::Query => Err(ErrorCode::BUSY),
                    CacheState::Invalid => Err(ErrorCode::FAIL),
                }
            });
            return outcome;
        }

        let index = self.allocate().ok_or(ErrorCode::NOMEM)?;
        self.entries.map(|entries| {
            entries[index] = CacheEntry {
                state: CacheState::Query,
                target: *target,
                last_used: stamp,
                retry_in_s: INITIAL_RETRY_DELAY_S,
                retry_delay_s: INITIAL_RETRY_DELAY_S,
                ..CacheEntry::default()
            };
        });
        self.sender.map(|sender| sender.send_address_query(target));
        self.ensure_timer();
        Err(ErrorCode::BUSY)
    }

    /// An address notification answered an outstanding query (or refreshed
    /// a known mapping).
    pub fn handle_notification(&self, target: &IPAddr, rloc16: u16) {
        let stamp = self.touch();
        match self.find(target) {
            Some(index) => {
                self.entries.map(|entries| {
                    let entry = &mut entries[index];
                    entry.state = CacheState::Cached;
                    entry.rloc16 = rloc16;
                    entry.last_used = stamp;
                    entry.retry_delay_s = INITIAL_RETRY_DELAY_S;
                });
            }
            None => {
                if let Some(index) = self.allocate() {
                    self.entries.map(|entries| {
                        entries[index] = CacheEntry {
                            state: CacheState::Cached,
                            target: *target,
                            rloc16,
                            last_used: stamp,
                            ..CacheEntry::default()
                        };
                    });
                }
            }
        }
    }

    /// Learn a mapping passively from a received datagram's source.
    pub fn snoop(&self, target: &IPAddr, rloc16: u16) {
        if self.find(target).is_some() {
            return;
        }
        let stamp = self.touch();
        if let Some(index) = self.allocate() {
            self.entries.map(|entries| {
                entries[index] = CacheEntry {
                    state: CacheState::Snooped,
                    target: *target,
                    rloc16,
                    last_used: stamp,
                    ..CacheEntry::default()
                };
            });
        }
    }

    /// Drop any mapping for `rloc16` (e.g. the device left the network).
    pub fn invalidate_rloc(&self, rloc16: u16) {
        self.entries.map(|entries| {
            for entry in entries.iter_mut() {
                if entry.state != CacheState::Invalid && entry.rloc16 == rloc16 {
                    *entry = CacheEntry::default();
                }
            }
        });
    }

    pub fn state_of(&self, target: &IPAddr) -> CacheState {
        match self.find(target) {
            Some(index) => self
                .entries
                .map_or(CacheState::Invalid, |entries| entries[index].state),
            None => CacheState::Invalid,
        }
    }
}

impl<'a, A: Alarm<'a>> AlarmClient for AddressResolver<'a, A> {
    fn alarm(&self) {
        // One-second resolution retry clock.
        let mut resend: [Option<IPAddr>; CACHE_SIZE] = [None; CACHE_SIZE];
        self.entries.map(|entries| {
            for (i, entry) in entries.iter_mut().enumerate() {
                if entry.state != CacheState::Query {
                    continue;
                }
                if entry.retry_in_s > 1 {
                    entry.retry_in_s -= 1;
                    continue;
                }
                let next_delay = entry.retry_delay_s.saturating_mul(2);
                if next_delay > MAX_RETRY_DELAY_S {
                    // Exhausted: the next datagram to this EID re-queries.
                    *entry = CacheEntry::default();
                } else {
                    entry.retry_delay_s = next_delay;
                    entry.retry_in_s = next_delay;
                    resend[i] = Some(entry.target);
                }
            }
        });
        for target in resend.iter().flatten() {
            self.sender.map(|sender| sender.send_address_query(target));
        }
        self.ensure_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsules_core::test::fake_alarm::FakeAlarm;

    struct QueryCounter {
        count: Cell<u32>,
        last: Cell<Option<IPAddr>>,
    }

    impl AddressQuerySender for QueryCounter {
        fn send_address_query(&self, target: &IPAddr) {
            self.count.set(self.count.get() + 1);
            self.last.set(Some(*target));
        }
    }

    fn eid(n: u8) -> IPAddr {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xfd;
        bytes[15] = n;
        IPAddr(bytes)
    }

    #[test]
    fn query_then_notification_then_cached() {
        let sender = QueryCounter {
            count: Cell::new(0),
            last: Cell::new(None),
        };
        let alarm = FakeAlarm::new();
        let resolver = AddressResolver::new(&alarm);
        alarm.set_alarm_client(&resolver);
        resolver.set_query_sender(&sender);

        assert_eq!(resolver.resolve(&eid(1)), Err(ErrorCode::BUSY));
        assert_eq!(sender.count.get(), 1);
        assert_eq!(resolver.state_of(&eid(1)), CacheState::Query);
        // Re-resolving does not flood queries.
        assert_eq!(resolver.resolve(&eid(1)), Err(ErrorCode::BUSY));
        assert_eq!(sender.count.get(), 1);

        resolver.handle_notification(&eid(1), 0x0c00);
        assert_eq!(resolver.resolve(&eid(1)), Ok(0x0c00));
    }

    #[test]
    fn retries_back_off_and_eventually_invalidate() {
        let sender = QueryCounter {
            count: Cell::new(0),
            last: Cell::new(None),
        };
        let alarm = FakeAlarm::new();
        let resolver = AddressResolver::new(&alarm);
        alarm.set_alarm_client(&resolver);
        resolver.set_query_sender(&sender);

        let _ = resolver.resolve(&eid(2));
        let initial = sender.count.get();
        // Tick the one-second clock until the backoff ceiling abandons the
        // query; delays 4, 8, ... double past MAX_RETRY_DELAY_S.
        for _ in 0..600 {
            if !alarm.trigger_next() {
                break;
            }
        }
        assert!(sender.count.get() > initial);
        assert_eq!(resolver.state_of(&eid(2)), CacheState::Invalid);
        // The next datagram re-queries from scratch.
        assert_eq!(resolver.resolve(&eid(2)), Err(ErrorCode::BUSY));
    }

    #[test]
    fn snooped_promotes_on_use() {
        let alarm = FakeAlarm::new();
        let resolver: AddressResolver<FakeAlarm> = AddressResolver::new(&alarm);
        resolver.snoop(&eid(3), 0x0800);
        assert_eq!(resolver.state_of(&eid(3)), CacheState::Snooped);
        assert_eq!(resolver.resolve(&eid(3)), Ok(0x0800));
        assert_eq!(resolver.state_of(&eid(3)), CacheState::Cached);
    }

    #[test]
    fn full_cache_evicts_lru_non_query() {
        let sender = QueryCounter {
            count: Cell::new(0),
            last: Cell::new(None),
        };
        let alarm = FakeAlarm::new();
        let resolver = AddressResolver::new(&alarm);
        alarm.set_alarm_client(&resolver);
        resolver.set_query_sender(&sender);

        // Entry 0 is mid-query and must survive eviction.
        let _ = resolver.resolve(&eid(0));
        for i in 1..CACHE_SIZE as u8 {
            resolver.handle_notification(&eid(i), 0x0100 + i as u16);
        }
        // Touch everything but eid(1), making it the LRU non-query entry.
        for i in 2..CACHE_SIZE as u8 {
            let _ = resolver.resolve(&eid(i));
        }
        resolver.handle_notification(&eid(0x42), 0x0142);
        assert_eq!(resolver.state_of(&eid(1)), CacheState::Invalid);
        assert_eq!(resolver.state_of(&eid(0)), CacheState::Query);
        assert_eq!(resolver.resolve(&eid(0x42)), Ok(0x0142));
    }

    #[test]
    fn invalidate_by_rloc() {
        let alarm = FakeAlarm::new();
        let resolver: AddressResolver<FakeAlarm> = AddressResolver::new(&alarm);
        resolver.handle_notification(&eid(7), 0x0700);
        resolver.invalidate_rloc(0x0700);
        assert_eq!(resolver.state_of(&eid(7)), CacheState::Invalid);
    }
}
