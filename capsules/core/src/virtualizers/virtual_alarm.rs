// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Virtualize the Alarm interface to enable multiple users of an underlying
//! alarm hardware peripheral.
//!
//! Every soft timer in the stack is a [`VirtualMuxAlarm`] registered with the
//! single [`MuxAlarm`]; the mux keeps the hardware alarm programmed to the
//! earliest armed virtual alarm.

use kernel::collections::list::{List, ListLink, ListNode};
use kernel::hil::time::{self, Alarm, Ticks, Time};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use core::cell::Cell;

#[derive(Copy, Clone)]
struct TickDtReference<T: Ticks> {
    /// Time point this alarm was set relative to.
    reference: T,
    /// The alarm fires at `reference + dt`.
    dt: T,
    /// When `dt` exceeded half the tick range it was split; after this
    /// portion fires, another `half_max_value` remains.
    extended: bool,
}

impl<T: Ticks> TickDtReference<T> {
    fn expiration(&self) -> T {
        self.reference.wrapping_add(self.dt)
    }
}

/// A virtual alarm: one node in the mux's list of timers.
pub struct VirtualMuxAlarm<'a, A: Alarm<'a>> {
    mux: &'a MuxAlarm<'a, A>,
    when: Cell<TickDtReference<A::Ticks>>,
    armed: Cell<bool>,
    next: ListLink<'a, VirtualMuxAlarm<'a, A>>,
    client: OptionalCell<&'a dyn time::AlarmClient>,
}

impl<'a, A: Alarm<'a>> ListNode<'a, VirtualMuxAlarm<'a, A>> for VirtualMuxAlarm<'a, A> {
    fn next(&'a self) -> &'a ListLink<'a, VirtualMuxAlarm<'a, A>> {
        &self.next
    }
}

impl<'a, A: Alarm<'a>> VirtualMuxAlarm<'a, A> {
    /// After calling `new`, always call `setup`.
    pub fn new(mux: &'a MuxAlarm<'a, A>) -> VirtualMuxAlarm<'a, A> {
        let zero = A::Ticks::from(0);
        VirtualMuxAlarm {
            mux,
            when: Cell::new(TickDtReference {
                reference: zero,
                dt: zero,
                extended: false,
            }),
            armed: Cell::new(false),
            next: ListLink::empty(),
            client: OptionalCell::empty(),
        }
    }

    /// Link this alarm into the mux. Without this the alarm never fires.
    pub fn setup(&'a self) {
        self.mux.virtual_alarms.push_head(self);
    }
}

impl<'a, A: Alarm<'a>> Time for VirtualMuxAlarm<'a, A> {
    type Frequency = A::Frequency;
    type Ticks = A::Ticks;

    fn now(&self) -> Self::Ticks {
        self.mux.alarm.now()
    }
}

impl<'a, A: Alarm<'a>> Alarm<'a> for VirtualMuxAlarm<'a, A> {
    fn set_alarm_client(&self, client: &'a dyn time::AlarmClient) {
        self.client.set(client);
    }

    fn set_alarm(&self, reference: Self::Ticks, dt: Self::Ticks) {
        let half_max = Self::Ticks::half_max_value();
        // Split dts beyond half the counter range so expiry checks against a
        // possibly-late `now` stay unambiguous.
        let when = if dt > half_max.wrapping_add(self.minimum_dt()) {
            TickDtReference {
                reference,
                dt: dt.wrapping_sub(half_max),
                extended: true,
            }
        } else {
            TickDtReference {
                reference,
                dt,
                extended: false,
            }
        };
        self.when.set(when);
        self.armed.set(true);

        // If the mux is mid-dispatch it reprograms the hardware itself after
        // all expired alarms have fired.
        if !self.mux.firing.get() {
            self.mux.reprogram();
        }
    }

    fn get_alarm(&self) -> Self::Ticks {
        let when = self.when.get();
        let extension = if when.extended {
            Self::Ticks::half_max_value()
        } else {
            Self::Ticks::from(0)
        };
        when.expiration().wrapping_add(extension)
    }

    fn disarm(&self) -> Result<(), ErrorCode> {
        if self.armed.get() {
            self.armed.set(false);
            if !self.mux.firing.get() {
                self.mux.reprogram();
            }
        }
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.get()
    }

    fn minimum_dt(&self) -> Self::Ticks {
        self.mux.alarm.minimum_dt()
    }
}

impl<'a, A: Alarm<'a>> time::AlarmClient for VirtualMuxAlarm<'a, A> {
    fn alarm(&self) {
        self.client.map(|client| client.alarm());
    }
}

/// Multiplexer of virtual alarms over one hardware alarm.
pub struct MuxAlarm<'a, A: Alarm<'a>> {
    virtual_alarms: List<'a, VirtualMuxAlarm<'a, A>>,
    alarm: &'a A,
    /// Set while dispatching expirations, to defer hardware reprogramming.
    firing: Cell<bool>,
}

impl<'a, A: Alarm<'a>> MuxAlarm<'a, A> {
    pub const fn new(alarm: &'a A) -> MuxAlarm<'a, A> {
        MuxAlarm {
            virtual_alarms: List::new(),
            alarm,
            firing: Cell::new(false),
        }
    }

    /// Program the hardware alarm to the earliest armed virtual alarm, or
    /// disarm it when none is armed.
    fn reprogram(&self) {
        let now = self.alarm.now();
        let next = self
            .virtual_alarms
            .iter()
            .filter(|cur| cur.armed.get())
            .min_by_key(|cur| {
                let when = cur.when.get();
                if !now.within_range(when.reference, when.expiration()) {
                    // Already expired: fire as soon as possible.
                    A::Ticks::from(0u32)
                } else {
                    when.expiration().wrapping_sub(now)
                }
            });

        match next {
            Some(valarm) => {
                let when = valarm.when.get();
                self.alarm.set_alarm(when.reference, when.dt);
            }
            None => {
                let _ = self.alarm.disarm();
            }
        }
    }
}

impl<'a, A: Alarm<'a>> time::AlarmClient for MuxAlarm<'a, A> {
    fn alarm(&self) {
        // Alarms are one-shot at this level; a repeating client re-arms from
        // its callback, which is why reprogramming must wait until the end.
        self.firing.set(true);
        self.virtual_alarms
            .iter()
            .filter(|cur| {
                let when = cur.when.get();
                // Reading now() fresh per alarm: a callback above may have
                // consumed enough time to expire later entries.
                let now = self.alarm.now();
                cur.armed.get() && !now.within_range(when.reference, when.expiration())
            })
            .for_each(|cur| {
                let when = cur.when.get();
                if when.extended {
                    cur.when.set(TickDtReference {
                        reference: when.expiration(),
                        dt: A::Ticks::half_max_value(),
                        extended: false,
                    });
                } else {
                    cur.armed.set(false);
                    cur.alarm();
                }
            });
        self.firing.set(false);
        self.reprogram();
    }
}
