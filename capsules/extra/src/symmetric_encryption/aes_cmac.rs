// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! AES-128 CMAC (RFC 4493), used by key derivation.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};

/// Double a value in GF(2^128) for subkey generation.
fn dbl(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut carry = 0u8;
    for i in (0..16).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if carry != 0 {
        out[15] ^= 0x87;
    }
    out
}

/// Compute CMAC(key, message).
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let cipher = match Aes128::new_from_slice(key) {
        Ok(cipher) => cipher,
        Err(_) => unreachable!(),
    };

    let mut l = Block::default();
    cipher.encrypt_block(&mut l);
    let k1 = dbl(&l.into());
    let k2 = dbl(&k1);

    let mut x = [0u8; 16];
    let n_full = message.len() / 16;
    let partial = message.len() % 16;
    // Every complete block except a final exact-fit one.
    let complete = if partial == 0 && n_full > 0 {
        n_full - 1
    } else {
        n_full
    };

    for chunk in message[..complete * 16].chunks(16) {
        for (x, m) in x.iter_mut().zip(chunk.iter()) {
            *x ^= *m;
        }
        let mut block = Block::from(x);
        cipher.encrypt_block(&mut block);
        x = block.into();
    }

    // Final block: exact-fit blocks mix with K1, padded blocks with K2.
    let mut last = [0u8; 16];
    if partial == 0 && !message.is_empty() {
        last.copy_from_slice(&message[complete * 16..]);
        for (l, k) in last.iter_mut().zip(k1.iter()) {
            *l ^= *k;
        }
    } else {
        last[..partial].copy_from_slice(&message[complete * 16..]);
        last[partial] = 0x80;
        for (l, k) in last.iter_mut().zip(k2.iter()) {
            *l ^= *k;
        }
    }

    for (x, l) in x.iter_mut().zip(last.iter()) {
        *x ^= *l;
    }
    let mut block = Block::from(x);
    cipher.encrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4493 test vectors.
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    #[test]
    fn empty_message() {
        let mac = aes_cmac(&KEY, &[]);
        assert_eq!(
            mac,
            [
                0xbb, 0x1d, 0x69, 0x29, 0xe9, 0x59, 0x37, 0x28, 0x7f, 0xa3, 0x7d, 0x12, 0x9b,
                0x75, 0x67, 0x46
            ]
        );
    }

    #[test]
    fn sixteen_byte_message() {
        let msg = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let mac = aes_cmac(&KEY, &msg);
        assert_eq!(
            mac,
            [
                0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44, 0xf7, 0x9b, 0xdd, 0x9d, 0xd0,
                0x4a, 0x28, 0x7c
            ]
        );
    }

    #[test]
    fn forty_byte_message() {
        let msg = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a, 0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac,
            0x45, 0xaf, 0x8e, 0x51, 0x30, 0xc8, 0x1c, 0x46, 0xa3, 0x5c, 0xe4, 0x11,
        ];
        let mac = aes_cmac(&KEY, &msg);
        assert_eq!(
            mac,
            [
                0xdf, 0xa6, 0x67, 0x47, 0xde, 0x9a, 0xe6, 0x30, 0x30, 0xca, 0x32, 0x61, 0x14,
                0x97, 0xc8, 0x27
            ]
        );
    }
}
