// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Virtual IEEE 802.15.4 MAC device.
//!
//! `MuxMac` provides multiplexed access to a single [`MacDevice`] so that
//! independent users (the MLE engine, the indirect sender, the application
//! datagram path) can each hold what behaves like their own MAC. Transmission
//! requests are sequenced, one in flight at a time; every received frame is
//! offered to all users, each applying its own dispatch logic.

use crate::ieee802154::device::{self, MacDevice};
use crate::ieee802154::framer::Frame;
use crate::net::ieee802154::{Header, KeyId, MacAddress, PanID, SecurityLevel};

use kernel::collections::list::{List, ListLink, ListNode};
use kernel::utilities::cells::{MapCell, OptionalCell};
use kernel::ErrorCode;

/// MAC device multiplexer.
pub struct MuxMac<'a, M: MacDevice<'a>> {
    mac: &'a M,
    users: List<'a, MacUser<'a, M>>,
    inflight: OptionalCell<&'a MacUser<'a, M>>,
}

impl<'a, M: MacDevice<'a>> device::TxClient for MuxMac<'a, M> {
    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        self.inflight.take().map(move |user| {
            user.send_done(buf, acked, ack_frame_pending, result);
        });
        self.do_next_op_async();
    }
}

impl<'a, M: MacDevice<'a>> device::RxClient for MuxMac<'a, M> {
    fn receive(&self, buf: &[u8], header: Header, lqi: u8, data_offset: usize, data_len: usize) {
        for user in self.users.iter() {
            user.receive(buf, header, lqi, data_offset, data_len);
        }
    }
}

impl<'a, M: MacDevice<'a>> MuxMac<'a, M> {
    pub const fn new(mac: &'a M) -> MuxMac<'a, M> {
        MuxMac {
            mac,
            users: List::new(),
            inflight: OptionalCell::empty(),
        }
    }

    /// Registers a MAC user with this mux. Each user is registered once.
    pub fn add_user(&self, user: &'a MacUser<'a, M>) {
        self.users.push_head(user);
    }

    /// Next pending operation, if nothing is in flight.
    fn get_next_op_if_idle(&self) -> Option<(&'a MacUser<'a, M>, Op)> {
        if self.inflight.is_some() {
            return None;
        }
        let node = self.users.iter().find(|node| {
            node.operation
                .map_or(false, |op| !matches!(op, Op::Idle))
        });
        node.and_then(|node| node.operation.replace(Op::Idle).map(|op| (node, op)))
    }

    /// Run an operation whose failure is reported through the user's
    /// transmit client.
    fn perform_op_async(&self, node: &'a MacUser<'a, M>, op: Op) {
        if let Op::Transmit(frame) = op {
            match self.mac.transmit(frame) {
                Ok(()) => self.inflight.set(node),
                Err((ecode, buf)) => {
                    node.send_done(buf, false, false, Err(ecode));
                }
            }
        }
    }

    /// Run an operation whose failure is reported synchronously.
    fn perform_op_sync(
        &self,
        node: &'a MacUser<'a, M>,
        op: Op,
    ) -> Option<Result<(), (ErrorCode, &'static mut [u8])>> {
        if let Op::Transmit(frame) = op {
            let result = self.mac.transmit(frame);
            if result.is_ok() {
                self.inflight.set(node);
            }
            Some(result)
        } else {
            None
        }
    }

    fn do_next_op_async(&self) {
        if let Some((node, op)) = self.get_next_op_if_idle() {
            self.perform_op_async(node, op);
        }
    }

    /// Like `do_next_op_async`, but when the operation chosen is the one the
    /// caller just enqueued its outcome is returned synchronously.
    fn do_next_op_sync(
        &self,
        new_node: &MacUser<'a, M>,
    ) -> Option<Result<(), (ErrorCode, &'static mut [u8])>> {
        self.get_next_op_if_idle().and_then(|(node, op)| {
            if core::ptr::eq(node, new_node) {
                self.perform_op_sync(node, op)
            } else {
                self.perform_op_async(node, op);
                None
            }
        })
    }
}

enum Op {
    Idle,
    Transmit(Frame),
}

/// One user of the multiplexed MAC. Behaves like an independent
/// [`MacDevice`] except that configuration state (addresses, PAN) is shared.
pub struct MacUser<'a, M: MacDevice<'a>> {
    mux: &'a MuxMac<'a, M>,
    operation: MapCell<Op>,
    next: ListLink<'a, MacUser<'a, M>>,
    tx_client: OptionalCell<&'a dyn device::TxClient>,
    rx_client: OptionalCell<&'a dyn device::RxClient>,
}

impl<'a, M: MacDevice<'a>> MacUser<'a, M> {
    pub const fn new(mux: &'a MuxMac<'a, M>) -> Self {
        Self {
            mux,
            operation: MapCell::new(Op::Idle),
            next: ListLink::empty(),
            tx_client: OptionalCell::empty(),
            rx_client: OptionalCell::empty(),
        }
    }

    fn send_done(
        &self,
        buf: &'static mut [u8],
        acked: bool,
        ack_frame_pending: bool,
        result: Result<(), ErrorCode>,
    ) {
        self.tx_client
            .map(move |client| client.send_done(buf, acked, ack_frame_pending, result));
    }

    fn receive(&self, buf: &[u8], header: Header, lqi: u8, data_offset: usize, data_len: usize) {
        self.rx_client
            .map(move |client| client.receive(buf, header, lqi, data_offset, data_len));
    }
}

impl<'a, M: MacDevice<'a>> ListNode<'a, MacUser<'a, M>> for MacUser<'a, M> {
    fn next(&'a self) -> &'a ListLink<'a, MacUser<'a, M>> {
        &self.next
    }
}

impl<'a, M: MacDevice<'a>> MacDevice<'a> for MacUser<'a, M> {
    fn set_transmit_client(&self, client: &'a dyn device::TxClient) {
        self.tx_client.set(client);
    }

    fn set_receive_client(&self, client: &'a dyn device::RxClient) {
        self.rx_client.set(client);
    }

    fn get_address(&self) -> u16 {
        self.mux.mac.get_address()
    }

    fn get_address_long(&self) -> [u8; 8] {
        self.mux.mac.get_address_long()
    }

    fn get_pan(&self) -> u16 {
        self.mux.mac.get_pan()
    }

    fn get_channel(&self) -> u8 {
        self.mux.mac.get_channel()
    }

    fn set_address(&self, addr: u16) {
        self.mux.mac.set_address(addr)
    }

    fn set_address_long(&self, addr: [u8; 8]) {
        self.mux.mac.set_address_long(addr)
    }

    fn set_pan(&self, id: u16) {
        self.mux.mac.set_pan(id)
    }

    fn set_channel(&self, chan: u8) -> Result<(), ErrorCode> {
        self.mux.mac.set_channel(chan)
    }

    fn config_commit(&self) {
        self.mux.mac.config_commit()
    }

    fn is_on(&self) -> bool {
        self.mux.mac.is_on()
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
        self.mux
            .mac
            .prepare_data_frame(buf, dst_pan, dst_addr, src_pan, src_addr, security_needed)
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
        self.mux.mac.prepare_command_frame(
            buf,
            dst_pan,
            dst_addr,
            src_pan,
            src_addr,
            command_id,
            security_needed,
        )
    }

    fn transmit(&self, frame: Frame) -> Result<(), (ErrorCode, &'static mut [u8])> {
        // Each user may hold only one pending transmission.
        match self.operation.take() {
            None => Err((ErrorCode::FAIL, frame.into_buf())),
            Some(Op::Idle) => {
                self.operation.replace(Op::Transmit(frame));
                self.mux.do_next_op_sync(self).unwrap_or(Ok(()))
            }
            Some(op @ Op::Transmit(_)) => {
                self.operation.replace(op);
                Err((ErrorCode::BUSY, frame.into_buf()))
            }
        }
    }
}
