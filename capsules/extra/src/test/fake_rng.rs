// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Deterministic randomness for tests.

use kernel::hil::rng::Rng;
use kernel::ErrorCode;

use core::cell::Cell;

/// Returns a scripted constant, or a simple counter when seeded with one.
pub struct FakeRng {
    next: Cell<u32>,
    step: Cell<u32>,
}

impl FakeRng {
    pub fn new(value: u32) -> FakeRng {
        FakeRng {
            next: Cell::new(value),
            step: Cell::new(0),
        }
    }

    pub fn counting_from(value: u32) -> FakeRng {
        let rng = FakeRng::new(value);
        rng.step.set(1);
        rng
    }
}

impl Rng for FakeRng {
    fn get_u32(&self) -> u32 {
        let val = self.next.get();
        self.next.set(val.wrapping_add(self.step.get()));
        val
    }

    fn get_bytes(&self, buf: &mut [u8]) -> Result<(), ErrorCode> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (self.get_u32() >> ((i % 4) * 8)) as u8;
        }
        Ok(())
    }
}
