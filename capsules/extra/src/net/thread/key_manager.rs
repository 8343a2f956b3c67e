// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Key material and rotation.
//!
//! The network-wide master key and a key sequence counter derive, per
//! sequence, a MAC key (802.15.4 frame security) and an MLE key. Keys for
//! sequences N-1, N and N+1 are kept live so traffic keyed just before or
//! after a rotation still verifies. Derivation is
//! `AES-CMAC(master, seq_be32 || label)` with labels `"mac"` and `"mle"`.
//!
//! On the wire, the MAC layer identifies the key with key id mode 1 and
//! `key index = (seq mod 127) + 1`; MLE carries the full sequence as a
//! 4-byte key source.

use crate::ieee802154::framer::KeyProcedure;
use crate::net::ieee802154::{KeyId, SecurityLevel};
use crate::symmetric_encryption::aes_cmac::aes_cmac;

use kernel::utilities::cells::OptionalCell;

use core::cell::Cell;

/// The MAC/MLE key pair of one key sequence.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct KeyPair {
    pub mac: [u8; 16],
    pub mle: [u8; 16],
}

fn derive(master: &[u8; 16], seq: u32, label: &[u8; 3]) -> [u8; 16] {
    let mut input = [0u8; 7];
    input[..4].copy_from_slice(&seq.to_be_bytes());
    input[4..].copy_from_slice(label);
    aes_cmac(master, &input)
}

fn derive_pair(master: &[u8; 16], seq: u32) -> KeyPair {
    KeyPair {
        mac: derive(master, seq, b"mac"),
        mle: derive(master, seq, b"mle"),
    }
}

/// Thread-style key index for a sequence: `(seq mod 127) + 1`.
pub fn key_index_for(seq: u32) -> u8 {
    ((seq % 127) + 1) as u8
}

/// Notified when the key sequence rotates, so per-neighbor counters for
/// retired sequences can be reset and the new sequence persisted.
pub trait KeyRotationClient {
    fn key_sequence_changed(&self, seq: u32);
}

pub struct KeyManager<'a> {
    master_key: Cell<[u8; 16]>,
    key_seq: Cell<u32>,
    /// Keys for sequences `key_seq - 1`, `key_seq`, `key_seq + 1`.
    window: Cell<[KeyPair; 3]>,
    rotation_client: OptionalCell<&'a dyn KeyRotationClient>,
}

impl<'a> KeyManager<'a> {
    pub fn new() -> KeyManager<'a> {
        KeyManager {
            master_key: Cell::new([0; 16]),
            key_seq: Cell::new(0),
            window: Cell::new([KeyPair::default(); 3]),
            rotation_client: OptionalCell::empty(),
        }
    }

    pub fn set_rotation_client(&self, client: &'a dyn KeyRotationClient) {
        self.rotation_client.set(client);
    }

    pub fn set_master_key(&self, key: [u8; 16]) {
        self.master_key.set(key);
        self.rederive();
    }

    pub fn master_key(&self) -> [u8; 16] {
        self.master_key.get()
    }

    pub fn key_sequence(&self) -> u32 {
        self.key_seq.get()
    }

    /// Move to a new current sequence, re-deriving the window.
    pub fn set_key_sequence(&self, seq: u32) {
        if seq == self.key_seq.get() {
            return;
        }
        self.key_seq.set(seq);
        self.rederive();
        self.rotation_client.map(|c| c.key_sequence_changed(seq));
    }

    fn rederive(&self) {
        let master = self.master_key.get();
        let seq = self.key_seq.get();
        self.window.set([
            derive_pair(&master, seq.wrapping_sub(1)),
            derive_pair(&master, seq),
            derive_pair(&master, seq.wrapping_add(1)),
        ]);
    }

    /// Sequences currently covered by the window, oldest first.
    fn window_seqs(&self) -> [u32; 3] {
        let seq = self.key_seq.get();
        [seq.wrapping_sub(1), seq, seq.wrapping_add(1)]
    }

    fn pair_for_seq(&self, seq: u32) -> Option<KeyPair> {
        let seqs = self.window_seqs();
        let window = self.window.get();
        seqs.iter().position(|&s| s == seq).map(|i| window[i])
    }

    pub fn current_pair(&self) -> KeyPair {
        self.window.get()[1]
    }

    /// MLE key for a received message's 4-byte key source.
    pub fn mle_key_for_seq(&self, seq: u32) -> Option<[u8; 16]> {
        self.pair_for_seq(seq).map(|p| p.mle)
    }

    /// MAC key for a received frame's key index, with its sequence.
    pub fn mac_key_for_index(&self, index: u8) -> Option<([u8; 16], u32)> {
        let seqs = self.window_seqs();
        let window = self.window.get();
        seqs.iter()
            .position(|&s| key_index_for(s) == index)
            .map(|i| (window[i].mac, seqs[i]))
    }
}

impl<'a> Default for KeyManager<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> KeyProcedure for KeyManager<'a> {
    fn lookup_key(&self, _level: SecurityLevel, key_id: KeyId) -> Option<([u8; 16], u32)> {
        match key_id {
            KeyId::Index(index) => self.mac_key_for_index(index),
            // Key source modes carry the sequence explicitly.
            KeyId::Source4Index(source, _index) => {
                let seq = u32::from_be_bytes(source);
                self.pair_for_seq(seq).map(|p| (p.mac, seq))
            }
            _ => None,
        }
    }

    fn outgoing_key(&self) -> Option<(KeyId, [u8; 16], u32)> {
        let seq = self.key_seq.get();
        Some((
            KeyId::Index(key_index_for(seq)),
            self.current_pair().mac,
            seq,
        ))
    }
}
