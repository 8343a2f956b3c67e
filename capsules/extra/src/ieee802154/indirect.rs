// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Indirect (polled) transmission to sleepy children.
//!
//! Frames destined to a child that keeps its receiver off are queued here
//! instead of being transmitted directly. When the child polls with a MAC
//! DataRequest command, the oldest queued frame for it is sent. While a
//! child has queued frames its address is present in the source-match table,
//! so the acknowledgement of its data request carries the frame-pending bit
//! and the child knows to stay awake.

use crate::ieee802154::device::{self, MacDevice};
use crate::ieee802154::framer::Frame;
use crate::ieee802154::source_match::SourceMatch;
use crate::net::ieee802154::MacAddress;

use kernel::utilities::cells::{MapCell, OptionalCell};
use kernel::ErrorCode;

use core::cell::Cell;

/// Capacity of the shared pending-frame pool.
pub const MAX_PENDING_FRAMES: usize = 8;

struct PendingFrame {
    dst: MacAddress,
    /// Enqueue stamp, for FIFO order per destination.
    order: u32,
    frame: Frame,
}

/// Completion callback for indirect transmissions.
pub trait IndirectTxClient {
    fn indirect_send_done(
        &self,
        dst: MacAddress,
        buf: &'static mut [u8],
        acked: bool,
        result: Result<(), ErrorCode>,
    );
}

pub struct IndirectSender<'a, M: MacDevice<'a>> {
    mac: &'a M,
    source_match: &'a SourceMatch,
    client: OptionalCell<&'a dyn IndirectTxClient>,
    slots: MapCell<[Option<PendingFrame>; MAX_PENDING_FRAMES]>,
    next_order: Cell<u32>,
    /// Destination of the frame currently at the MAC, if any.
    current: Cell<Option<MacAddress>>,
}

impl<'a, M: MacDevice<'a>> IndirectSender<'a, M> {
    pub fn new(mac: &'a M, source_match: &'a SourceMatch) -> IndirectSender<'a, M> {
        IndirectSender {
            mac,
            source_match,
            client: OptionalCell::empty(),
            slots: MapCell::new([const { None }; MAX_PENDING_FRAMES]),
            next_order: Cell::new(0),
            current: Cell::new(None),
        }
    }

    pub fn set_client(&self, client: &'a dyn IndirectTxClient) {
        self.client.set(client);
    }

    /// Number of frames queued for `dst`.
    pub fn pending_for(&self, dst: MacAddress) -> usize {
        self.slots.map_or(0, |slots| {
            slots
                .iter()
                .filter(|slot| slot.as_ref().is_some_and(|p| p.dst == dst))
                .count()
        })
    }

    /// Queue a prepared frame for a sleepy child.
    pub fn queue_frame(&self, dst: MacAddress, frame: Frame) -> Result<(), (ErrorCode, Frame)> {
        let order = self.next_order.get();
        self.next_order.set(order.wrapping_add(1));
        let mut pending = Some(PendingFrame { dst, order, frame });
        let stored = self.slots.map_or(false, |slots| {
            match slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = pending.take();
                    true
                }
                None => false,
            }
        });
        if stored {
            self.mark_pending(dst);
            Ok(())
        } else {
            // The pool is full; the frame comes back to the caller.
            match pending.take() {
                Some(p) => Err((ErrorCode::NOMEM, p.frame)),
                None => unreachable!(),
            }
        }
    }

    /// A data request arrived from `src`: transmit its oldest queued frame.
    pub fn on_data_request(&self, src: MacAddress) {
        if self.current.get().is_some() {
            // One indirect transmission at a time; the child polls again.
            return;
        }
        let frame = self
            .slots
            .map(|slots| {
                let index = slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.as_ref().is_some_and(|p| p.dst == src))
                    .min_by_key(|(_, slot)| slot.as_ref().map_or(u32::MAX, |p| p.order))
                    .map(|(i, _)| i);
                index.and_then(|i| slots[i].take()).map(|p| p.frame)
            })
            .flatten();
        let Some(frame) = frame else {
            return;
        };
        if self.pending_for(src) == 0 {
            self.clear_pending(src);
        }
        self.current.set(Some(src));
        if let Err((ecode, buf)) = self.mac.transmit(frame) {
            self.current.set(None);
            kernel::debug!("[indirect] dropping frame for {:?}: {:?}", src, ecode);
            self.client.map(move |client| {
                client.indirect_send_done(src, buf, false, Err(ecode));
            });
        }
    }

    /// Drop everything queued for a removed child.
    pub fn purge(&self, dst: MacAddress) {
        self.slots.map(|slots| {
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|p| p.dst == dst) {
                    *slot = None;
                }
            }
        });
        self.clear_pending(dst);
    }

    fn mark_pending(&self, dst: MacAddress) {
        let _ = match dst {
            MacAddress::Short(addr) => {
                if self.source_match.find_short(addr) >= 0 {
                    Ok(())
                } else {
                    self.source_match.add_short(addr)
                }
            }
            MacAddress::Long(ref addr) => {
                if self.source_match.find_ext(addr) >= 0 {
                    Ok(())
                } else {
                    self.source_match.add_ext(addr)
                }
            }
        };
    }

    fn clear_pending(&self, dst: MacAddress) {
        let _ = match dst {
            MacAddress::Short(addr) => self.source_match.clear_short(addr),
            MacAddress::Long(ref addr) => self.source_match.clear_ext(addr),
        };
    }
}

impl<'a, M: MacDevice<'a>> device::TxClient for IndirectSender<'a, M> {
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        _ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        if let Some(dst) = self.current.take() {
            if result.is_err() {
                kernel::debug!("[indirect] send to {:?} failed: {:?}", dst, result);
            }
            self.client.map(move |client| {
                client.indirect_send_done(dst, buf, acked, result);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ieee802154::framer::Framer;
    use crate::ieee802154::mac::CsmaMac;
    use crate::ieee802154::mac::Mac;
    use crate::symmetric_encryption::aes_ccm::Aes128CcmSw;
    use crate::test::fake_radio::FakeRadio;
    use crate::test::fake_rng::FakeRng;
    use capsules_core::test::fake_alarm::FakeAlarm;
    use kernel::hil::radio as hil_radio;
    use kernel::hil::radio::RadioConfig;
    use kernel::hil::radio::RadioData;
    use kernel::hil::symmetric_encryption::AES128CCM;
    use kernel::hil::time::Alarm;
    use std::boxed::Box;

    const PAN: u16 = 0x1234;
    const OUR_SHORT: u16 = 0x0001;
    const CHILD_SHORT: u16 = 0x0005;

    fn leak_buf() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; hil_radio::MAX_BUF_SIZE]))
    }

    struct NullClient;
    impl IndirectTxClient for NullClient {
        fn indirect_send_done(
            &self,
            _dst: MacAddress,
            _buf: &'static mut [u8],
            _acked: bool,
            _result: Result<(), ErrorCode>,
        ) {
        }
    }

    #[test]
    fn queued_frame_waits_for_data_request_and_sets_pending() {
        let radio = FakeRadio::new();
        let alarm = FakeAlarm::new();
        let rng = FakeRng::new(0);
        let sm = SourceMatch::new();
        let ccm = Aes128CcmSw::new();
        let mac = CsmaMac::new(&radio, &alarm, &rng, &sm, leak_buf());
        let framer = Framer::new(&mac, &ccm);
        let indirect = IndirectSender::new(&framer, &sm);
        let client = NullClient;
        radio.set_transmit_client(&mac);
        radio.set_receive_client(&mac);
        alarm.set_alarm_client(&mac);
        ccm.set_client(&framer);
        mac.set_transmit_client(&framer);
        framer.set_transmit_client(&indirect);
        indirect.set_client(&client);
        radio.set_address(OUR_SHORT);
        mac.set_pan(PAN);
        mac.start().unwrap();

        let frame = framer
            .prepare_data_frame(
                leak_buf(),
                PAN,
                MacAddress::Short(CHILD_SHORT),
                PAN,
                MacAddress::Short(OUR_SHORT),
                None,
            )
            .ok()
            .unwrap();
        indirect
            .queue_frame(MacAddress::Short(CHILD_SHORT), frame)
            .unwrap();

        // Nothing transmits until the child polls, but the child is now in
        // the source-match table so its poll gets frame-pending in the ack.
        assert_eq!(radio.tx_count(), 0);
        assert!(sm.find_short(CHILD_SHORT) >= 0);
        assert_eq!(indirect.pending_for(MacAddress::Short(CHILD_SHORT)), 1);

        indirect.on_data_request(MacAddress::Short(CHILD_SHORT));
        // The frame entered CSMA; one backoff later it reaches the radio.
        assert!(alarm.trigger_next());
        assert_eq!(radio.tx_count(), 1);
        // Queue drained: the child's pending entry is cleared.
        assert_eq!(indirect.pending_for(MacAddress::Short(CHILD_SHORT)), 0);
        assert!(sm.find_short(CHILD_SHORT) < 0);
    }

    #[test]
    fn purge_discards_queued_frames() {
        let radio = FakeRadio::new();
        let alarm = FakeAlarm::new();
        let rng = FakeRng::new(0);
        let sm = SourceMatch::new();
        let ccm = Aes128CcmSw::new();
        let mac = CsmaMac::new(&radio, &alarm, &rng, &sm, leak_buf());
        let framer = Framer::new(&mac, &ccm);
        let indirect = IndirectSender::new(&framer, &sm);
        radio.set_transmit_client(&mac);
        alarm.set_alarm_client(&mac);
        ccm.set_client(&framer);
        mac.set_transmit_client(&framer);
        radio.set_address(OUR_SHORT);
        mac.set_pan(PAN);
        mac.start().unwrap();

        let frame = framer
            .prepare_data_frame(
                leak_buf(),
                PAN,
                MacAddress::Short(CHILD_SHORT),
                PAN,
                MacAddress::Short(OUR_SHORT),
                None,
            )
            .ok()
            .unwrap();
        indirect
            .queue_frame(MacAddress::Short(CHILD_SHORT), frame)
            .unwrap();
        indirect.purge(MacAddress::Short(CHILD_SHORT));
        assert_eq!(indirect.pending_for(MacAddress::Short(CHILD_SHORT)), 0);
        assert!(sm.find_short(CHILD_SHORT) < 0);
        indirect.on_data_request(MacAddress::Short(CHILD_SHORT));
        assert_eq!(radio.tx_count(), 0);
    }
}
