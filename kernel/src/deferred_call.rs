// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Deferred calls: the tasklet queue of the cooperative scheduler.
//!
//! A capsule that must finish work outside the current callback (for example,
//! to report a transmit result without reentering the caller) registers a
//! [`DeferredCall`] with the queue and schedules it. The embedder services
//! the queue after every event dispatch, so a call scheduled while handling
//! event E runs strictly before the next event is delivered.
//!
//! Unlike a timer there is no delay semantic; a scheduled call runs at the
//! next service point, once.

use crate::collections::list::{List, ListLink, ListNode};
use crate::utilities::cells::OptionalCell;
use core::cell::Cell;

/// Implemented by capsules that receive deferred calls.
pub trait DeferredCallClient {
    fn handle_deferred_call(&self);
}

/// One schedulable slot, embedded in the owning capsule's allocation.
pub struct DeferredCall<'a> {
    pending: Cell<bool>,
    client: OptionalCell<&'a dyn DeferredCallClient>,
    next: ListLink<'a, DeferredCall<'a>>,
}

impl<'a> ListNode<'a, DeferredCall<'a>> for DeferredCall<'a> {
    fn next(&'a self) -> &'a ListLink<'a, DeferredCall<'a>> {
        &self.next
    }
}

impl<'a> DeferredCall<'a> {
    pub const fn new() -> DeferredCall<'a> {
        DeferredCall {
            pending: Cell::new(false),
            client: OptionalCell::empty(),
            next: ListLink::empty(),
        }
    }

    /// Mark this call to run at the next queue service.
    pub fn schedule(&self) {
        self.pending.set(true);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    /// Whether this call has been registered with a queue.
    pub fn is_registered(&self) -> bool {
        self.client.is_some()
    }
}

impl Default for DeferredCall<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry and dispatcher for all deferred calls of one stack instance.
pub struct DeferredCallQueue<'a> {
    calls: List<'a, DeferredCall<'a>>,
}

impl<'a> DeferredCallQueue<'a> {
    pub const fn new() -> DeferredCallQueue<'a> {
        DeferredCallQueue { calls: List::new() }
    }

    /// Register a call and bind its client. Each call is registered once.
    pub fn register(&self, call: &'a DeferredCall<'a>, client: &'a dyn DeferredCallClient) {
        call.client.set(client);
        self.calls.push_head(call);
    }

    /// Run every pending call. Returns whether any ran.
    ///
    /// Calls scheduled while servicing are run in the same pass, so the
    /// queue is drained when this returns.
    pub fn service(&self) -> bool {
        let mut any = false;
        let mut again = true;
        while again {
            again = false;
            for call in self.calls.iter() {
                if call.pending.get() {
                    call.pending.set(false);
                    any = true;
                    again = true;
                    call.client.map(|c| c.handle_deferred_call());
                }
            }
        }
        any
    }

    pub fn has_pending(&self) -> bool {
        self.calls.iter().any(|c| c.pending.get())
    }
}

impl Default for DeferredCallQueue<'_> {
    fn default() -> Self {
        Self::new()
    }
}
