// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Multi-radio link selection.
//!
//! When a neighbor is reachable over both the 802.15.4 radio and a
//! TREL-style UDP-encapsulation link, a per-neighbor preference nibble per
//! link decides which one carries its traffic. Acknowledgement outcomes move
//! the preference; selection takes the first link (in a fixed order) whose
//! preference reaches the high threshold, falling back to the highest
//! preference. The non-selected link is probed probabilistically so a
//! recovered link is noticed.

use crate::net::thread::neighbor::Neighbor;

use kernel::hil::rng::Rng;

use core::cell::Cell;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RadioType {
    Ieee802154 = 0,
    TrelUdp6 = 1,
}

pub const MIN_PREFERENCE: u8 = 0;
pub const MAX_PREFERENCE: u8 = 15;
pub const INIT_PREFERENCE: u8 = 8;
/// A link at or above this preference is used unconditionally.
pub const HIGH_PREFERENCE: u8 = 14;

/// Preference deltas per acknowledgement outcome.
const CHANGE_ON_ACK: i16 = 1;
const CHANGE_ON_NO_ACK: i16 = -2;
const CHANGE_ON_DEFERRED_ACK: i16 = 2;
const CHANGE_ON_DEFERRED_TIMEOUT: i16 = -4;

/// Order in which links are considered for data transmission.
const SELECTION_ORDER: [RadioType; 2] = [RadioType::TrelUdp6, RadioType::Ieee802154];
/// Poll frames prefer the always-listening radio.
const POLL_ORDER: [RadioType; 2] = [RadioType::Ieee802154, RadioType::TrelUdp6];

/// Whether this neighbor has been seen on the given radio link.
pub fn supports(neighbor: &Neighbor, radio: RadioType) -> bool {
    neighbor.radios.supported & (1 << radio as u8) != 0
}

fn preference(neighbor: &Neighbor, radio: RadioType) -> u8 {
    neighbor.radios.preference[radio as usize]
}

fn adjust(neighbor: &mut Neighbor, radio: RadioType, delta: i16) {
    let old = preference(neighbor, radio) as i16;
    let new = (old + delta).clamp(MIN_PREFERENCE as i16, MAX_PREFERENCE as i16);
    neighbor.radios.preference[radio as usize] = new as u8;
}

/// Record that a radio link works for this neighbor, starting it at the
/// initial preference.
pub fn add_supported(neighbor: &mut Neighbor, radio: RadioType) {
    if !supports(neighbor, radio) {
        neighbor.radios.supported |= 1 << radio as u8;
        neighbor.radios.preference[radio as usize] = INIT_PREFERENCE;
    }
}

/// Acknowledgement outcome of a direct transmission.
pub fn update_on_send_done(neighbor: &mut Neighbor, radio: RadioType, acked: bool) {
    if !supports(neighbor, radio) {
        if acked {
            add_supported(neighbor, radio);
        }
        return;
    }
    adjust(
        neighbor,
        radio,
        if acked { CHANGE_ON_ACK } else { CHANGE_ON_NO_ACK },
    );
}

/// Outcome of a deferred acknowledgement on the TREL link.
///
/// Returns whether the neighbor may be removed: after a deferred-ack
/// timeout the neighbor is retained when another link still has high
/// preference, since it stays reachable there.
pub fn update_on_deferred_ack(neighbor: &mut Neighbor, acked: bool) -> bool {
    if !supports(neighbor, RadioType::TrelUdp6) {
        if acked {
            add_supported(neighbor, RadioType::TrelUdp6);
        }
        return true;
    }
    adjust(
        neighbor,
        RadioType::TrelUdp6,
        if acked {
            CHANGE_ON_DEFERRED_ACK
        } else {
            CHANGE_ON_DEFERRED_TIMEOUT
        },
    );
    if acked {
        return true;
    }
    !SELECTION_ORDER.iter().any(|&radio| {
        radio != RadioType::TrelUdp6
            && supports(neighbor, radio)
            && preference(neighbor, radio) >= HIGH_PREFERENCE
    })
}

/// Pick the link for a direct transmission to this neighbor.
pub fn select(neighbor: &Neighbor) -> RadioType {
    let mut best = SELECTION_ORDER[0];
    let mut best_preference = 0;
    let mut found = false;
    for &radio in SELECTION_ORDER.iter() {
        if !supports(neighbor, radio) {
            continue;
        }
        let preference = preference(neighbor, radio);
        if preference >= HIGH_PREFERENCE {
            return radio;
        }
        if !found || preference > best_preference {
            found = true;
            best = radio;
            best_preference = preference;
        }
    }
    best
}

/// Pick the link for a data-poll frame.
pub fn select_poll_radio(neighbor: &Neighbor) -> RadioType {
    for &radio in POLL_ORDER.iter() {
        if supports(neighbor, radio) {
            return radio;
        }
    }
    POLL_ORDER[0]
}

/// Probabilistic probing of the unselected TREL link.
pub struct ProbeConfig {
    /// Percentage of transmissions that also probe, 0 disables.
    percent: Cell<u8>,
}

impl ProbeConfig {
    pub const fn new(percent: u8) -> ProbeConfig {
        ProbeConfig {
            percent: Cell::new(percent),
        }
    }

    pub fn set_percent(&self, percent: u8) {
        self.percent.set(percent.min(100));
    }

    /// Whether this transmission should additionally probe TREL.
    pub fn should_probe(&self, neighbor: &Neighbor, selected: RadioType, rng: &dyn Rng) -> bool {
        selected != RadioType::TrelUdp6
            && supports(neighbor, RadioType::TrelUdp6)
            && self.percent.get() > 0
            && (rng.get_u32() % 100) < self.percent.get() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fake_rng::FakeRng;

    fn neighbor_with_both(trel: u8, ieee: u8) -> Neighbor {
        let mut n = Neighbor::default();
        add_supported(&mut n, RadioType::TrelUdp6);
        add_supported(&mut n, RadioType::Ieee802154);
        n.radios.preference[RadioType::TrelUdp6 as usize] = trel;
        n.radios.preference[RadioType::Ieee802154 as usize] = ieee;
        n
    }

    #[test]
    fn preference_moves_with_ack_outcomes() {
        // Both links start at 8.
        let mut n = neighbor_with_both(INIT_PREFERENCE, INIT_PREFERENCE);

        // Five successful TREL acknowledgements: 8 + 5 = 13.
        for _ in 0..5 {
            update_on_send_done(&mut n, RadioType::TrelUdp6, true);
        }
        assert_eq!(preference(&n, RadioType::TrelUdp6), 13);

        // Two deferred-ack timeouts: 13 - 8 = 5.
        update_on_deferred_ack(&mut n, false);
        update_on_deferred_ack(&mut n, false);
        assert_eq!(preference(&n, RadioType::TrelUdp6), 5);

        // Neither link reaches the high threshold; the higher preference
        // wins, which is now the 802.15.4 link.
        assert_eq!(select(&n), RadioType::Ieee802154);
    }

    #[test]
    fn preferences_saturate() {
        let mut n = neighbor_with_both(MAX_PREFERENCE - 1, 0);
        update_on_send_done(&mut n, RadioType::TrelUdp6, true);
        update_on_send_done(&mut n, RadioType::TrelUdp6, true);
        assert_eq!(preference(&n, RadioType::TrelUdp6), MAX_PREFERENCE);

        let mut n = neighbor_with_both(1, 0);
        update_on_deferred_ack(&mut n, false);
        assert_eq!(preference(&n, RadioType::TrelUdp6), MIN_PREFERENCE);
    }

    #[test]
    fn high_preference_link_wins_in_order() {
        let n = neighbor_with_both(HIGH_PREFERENCE, MAX_PREFERENCE);
        // TREL is first in the selection order and already high.
        assert_eq!(select(&n), RadioType::TrelUdp6);
    }

    #[test]
    fn deferred_timeout_retains_neighbor_with_high_alternate() {
        let mut n = neighbor_with_both(INIT_PREFERENCE, HIGH_PREFERENCE);
        assert!(!update_on_deferred_ack(&mut n, false));
        let mut n = neighbor_with_both(INIT_PREFERENCE, INIT_PREFERENCE);
        assert!(update_on_deferred_ack(&mut n, false));
    }

    #[test]
    fn poll_prefers_ieee802154() {
        let n = neighbor_with_both(MAX_PREFERENCE, 0);
        assert_eq!(select_poll_radio(&n), RadioType::Ieee802154);
    }

    #[test]
    fn probe_is_probabilistic_and_gated() {
        let probes = ProbeConfig::new(50);
        let n = neighbor_with_both(0, HIGH_PREFERENCE);
        let low = FakeRng::new(10);
        let high = FakeRng::new(90);
        assert!(probes.should_probe(&n, RadioType::Ieee802154, &low));
        assert!(!probes.should_probe(&n, RadioType::Ieee802154, &high));
        // Never probe when TREL is the selected link.
        assert!(!probes.should_probe(&n, RadioType::TrelUdp6, &low));
        probes.set_percent(0);
        assert!(!probes.should_probe(&n, RadioType::Ieee802154, &low));
    }
}
