// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Software AES-128 CCM* (IEEE 802.15.4-2015, Appendix B.4.1).
//!
//! CCM* is two passes over the frame: a CBC-MAC authentication pass over
//! `B_0 | AuthData` producing the tag `T`, and a CTR pass over the private
//! payload with counter blocks `A_1, A_2, ...`. The tag is transmitted
//! encrypted as `U = T xor E(key, A_0)`. Unlike plain CCM, CCM* permits a
//! zero-length tag (security level `Enc`).
//!
//! This implementation runs on the RustCrypto `aes` block cipher and is
//! synchronous: `crypt` fires the client's `crypt_done` before returning.
//! It works in place on the frame buffer and needs no scratch buffer.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};

use kernel::hil::symmetric_encryption::{
    AES128CCM, AES128_KEY_SIZE, CCMClient, CCM_NONCE_LENGTH,
};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use core::cell::Cell;

/// Software CCM* engine. One lives below each security-using capsule; calls
/// complete synchronously so no sharing discipline is needed.
pub struct Aes128CcmSw<'a> {
    client: OptionalCell<&'a dyn CCMClient>,
    key: Cell<[u8; AES128_KEY_SIZE]>,
    nonce: Cell<[u8; CCM_NONCE_LENGTH]>,
}

impl<'a> Aes128CcmSw<'a> {
    pub fn new() -> Aes128CcmSw<'a> {
        Aes128CcmSw {
            client: OptionalCell::empty(),
            key: Cell::new([0; AES128_KEY_SIZE]),
            nonce: Cell::new([0; CCM_NONCE_LENGTH]),
        }
    }
}

impl<'a> Default for Aes128CcmSw<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// `B_0` flags: Adata | M' (tag length encoding) | L - 1, with L = 2.
fn auth_flags(a_len: usize, mic_len: usize) -> u8 {
    let mut flags = 1u8;
    if a_len != 0 {
        flags |= 1 << 6;
    }
    if mic_len != 0 {
        flags |= (((mic_len - 2) / 2) as u8) << 3;
    }
    flags
}

/// Incremental CBC-MAC over implicitly zero-padded 16-byte blocks.
struct CbcMac<'c> {
    cipher: &'c Aes128,
    x: Block,
    block: Block,
    fill: usize,
}

impl<'c> CbcMac<'c> {
    fn new(cipher: &'c Aes128) -> CbcMac<'c> {
        CbcMac {
            cipher,
            x: Block::default(),
            block: Block::default(),
            fill: 0,
        }
    }

    fn absorb(&mut self, data: &[u8]) {
        for &b in data {
            self.block[self.fill] = b;
            self.fill += 1;
            if self.fill == 16 {
                self.process();
            }
        }
    }

    /// Zero-pad the current partial block and process it.
    fn pad_block(&mut self) {
        if self.fill != 0 {
            for b in self.block.iter_mut().skip(self.fill) {
                *b = 0;
            }
            self.fill = 16;
            self.process();
        }
    }

    fn process(&mut self) {
        for (x, b) in self.x.iter_mut().zip(self.block.iter()) {
            *x ^= *b;
        }
        self.cipher.encrypt_block(&mut self.x);
        self.fill = 0;
    }

    fn finish(mut self) -> [u8; 16] {
        self.pad_block();
        self.x.into()
    }
}

/// Compute the unencrypted tag T over a data and m data.
fn compute_tag(
    cipher: &Aes128,
    nonce: &[u8; CCM_NONCE_LENGTH],
    mic_len: usize,
    a_data: &[u8],
    m_data: &[u8],
) -> [u8; 16] {
    let mut mac = CbcMac::new(cipher);

    let mut b0 = [0u8; 16];
    b0[0] = auth_flags(a_data.len(), mic_len);
    b0[1..14].copy_from_slice(nonce);
    b0[14..16].copy_from_slice(&(m_data.len() as u16).to_be_bytes());
    mac.absorb(&b0);

    if !a_data.is_empty() {
        // AddAuthData starts with L(a); frames never approach the longer
        // encodings (a < 0xff00).
        mac.absorb(&(a_data.len() as u16).to_be_bytes());
        mac.absorb(a_data);
        mac.pad_block();
    }
    mac.absorb(m_data);
    mac.finish()
}

/// Counter block `A_i` for the CTR transformation.
fn counter_block(nonce: &[u8; CCM_NONCE_LENGTH], i: u16) -> Block {
    let mut a = [0u8; 16];
    // Flags = L - 1 = 1.
    a[0] = 1;
    a[1..14].copy_from_slice(nonce);
    a[14..16].copy_from_slice(&i.to_be_bytes());
    Block::from(a)
}

/// CTR transform of the private payload in place, counters from `A_1`.
fn ctr_xcrypt(cipher: &Aes128, nonce: &[u8; CCM_NONCE_LENGTH], m_data: &mut [u8]) {
    for (i, chunk) in m_data.chunks_mut(16).enumerate() {
        let mut keystream = counter_block(nonce, (i + 1) as u16);
        cipher.encrypt_block(&mut keystream);
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= *k;
        }
    }
}

/// One-shot CCM* over a contiguous `a data || m data || tag` buffer.
///
/// Encrypting writes the tag into `buf[a_len + m_len..]`; decrypting
/// verifies it and returns whether it matched (always true when
/// encrypting). The MLE engine uses this directly since its messages are
/// assembled in scratch buffers.
pub fn ccm_crypt_inline(
    key: &[u8; AES128_KEY_SIZE],
    nonce: &[u8; CCM_NONCE_LENGTH],
    buf: &mut [u8],
    a_len: usize,
    m_len: usize,
    mic_len: usize,
    encrypting: bool,
) -> bool {
    let cipher = match Aes128::new_from_slice(key) {
        Ok(cipher) => cipher,
        Err(_) => return false,
    };
    let m_end = a_len + m_len;
    if encrypting {
        let tag = compute_tag(&cipher, nonce, mic_len, &buf[..a_len], &buf[a_len..m_end]);
        ctr_xcrypt(&cipher, nonce, &mut buf[a_len..m_end]);
        let mut a0 = counter_block(nonce, 0);
        cipher.encrypt_block(&mut a0);
        for i in 0..mic_len {
            buf[m_end + i] = tag[i] ^ a0[i];
        }
        true
    } else {
        ctr_xcrypt(&cipher, nonce, &mut buf[a_len..m_end]);
        let tag = compute_tag(&cipher, nonce, mic_len, &buf[..a_len], &buf[a_len..m_end]);
        let mut a0 = counter_block(nonce, 0);
        cipher.encrypt_block(&mut a0);
        (0..mic_len).all(|i| buf[m_end + i] == tag[i] ^ a0[i])
    }
}

impl<'a> AES128CCM<'a> for Aes128CcmSw<'a> {
    fn set_client(&self, client: &'a dyn CCMClient) {
        self.client.set(client);
    }

    fn set_key(&self, key: &[u8]) -> Result<(), ErrorCode> {
        if key.len() < AES128_KEY_SIZE {
            return Err(ErrorCode::INVAL);
        }
        let mut new_key = [0u8; AES128_KEY_SIZE];
        new_key.copy_from_slice(&key[..AES128_KEY_SIZE]);
        self.key.set(new_key);
        Ok(())
    }

    fn set_nonce(&self, nonce: &[u8]) -> Result<(), ErrorCode> {
        if nonce.len() < CCM_NONCE_LENGTH {
            return Err(ErrorCode::INVAL);
        }
        let mut new_nonce = [0u8; CCM_NONCE_LENGTH];
        new_nonce.copy_from_slice(&nonce[..CCM_NONCE_LENGTH]);
        self.nonce.set(new_nonce);
        Ok(())
    }

    fn crypt(
        &self,
        buf: &'static mut [u8],
        a_off: usize,
        m_off: usize,
        m_len: usize,
        mic_len: usize,
        _confidential: bool,
        encrypting: bool,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if !(a_off <= m_off && m_off + m_len + mic_len <= buf.len()) {
            return Err((ErrorCode::INVAL, buf));
        }

        let cipher = match Aes128::new_from_slice(&self.key.get()) {
            Ok(cipher) => cipher,
            Err(_) => return Err((ErrorCode::INVAL, buf)),
        };
        let nonce = self.nonce.get();
        let m_end = m_off + m_len;

        let tag_is_valid = if encrypting {
            let tag = compute_tag(&cipher, &nonce, mic_len, &buf[a_off..m_off], &buf[m_off..m_end]);
            ctr_xcrypt(&cipher, &nonce, &mut buf[m_off..m_end]);
            // U = T xor E(key, A_0), truncated to the MIC length.
            let mut a0 = counter_block(&nonce, 0);
            cipher.encrypt_block(&mut a0);
            for i in 0..mic_len {
                buf[m_end + i] = tag[i] ^ a0[i];
            }
            true
        } else {
            ctr_xcrypt(&cipher, &nonce, &mut buf[m_off..m_end]);
            let tag = compute_tag(&cipher, &nonce, mic_len, &buf[a_off..m_off], &buf[m_off..m_end]);
            let mut a0 = counter_block(&nonce, 0);
            cipher.encrypt_block(&mut a0);
            (0..mic_len).all(|i| buf[m_end + i] == tag[i] ^ a0[i])
        };

        // Software crypto is blocking, so completion is reported inline.
        match self.client.get() {
            Some(client) => {
                client.crypt_done(buf, Ok(()), tag_is_valid);
                Ok(())
            }
            None => Err((ErrorCode::FAIL, buf)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::utilities::cells::TakeCell;
    use std::boxed::Box;
    use std::vec::Vec;

    struct CryptResult {
        buf: TakeCell<'static, [u8]>,
        tag_is_valid: Cell<bool>,
        done: Cell<bool>,
    }

    impl CCMClient for CryptResult {
        fn crypt_done(&self, buf: &'static mut [u8], res: Result<(), ErrorCode>, tag_is_valid: bool) {
            assert!(res.is_ok());
            self.buf.replace(buf);
            self.tag_is_valid.set(tag_is_valid);
            self.done.set(true);
        }
    }

    impl CryptResult {
        fn new() -> CryptResult {
            CryptResult {
                buf: TakeCell::empty(),
                tag_is_valid: Cell::new(false),
                done: Cell::new(false),
            }
        }
    }

    fn leak_frame(parts: &[&[u8]], trailer: usize) -> &'static mut [u8] {
        let mut frame = Vec::new();
        for part in parts {
            frame.extend_from_slice(part);
        }
        frame.resize(frame.len() + trailer, 0);
        Box::leak(frame.into_boxed_slice())
    }

    const KEY: [u8; 16] = [
        0xc0, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xcb, 0xcc, 0xcd, 0xce,
        0xcf,
    ];
    const NONCE: [u8; 13] = [
        0xac, 0xde, 0x48, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x02,
    ];

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let header = [0x61u8, 0x88, 0x42, 0x34, 0x12, 0x01, 0x00];
        let payload = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03];
        let mic_len = 4;
        let buf = leak_frame(&[&header, &payload], mic_len);

        let result = CryptResult::new();
        let ccm = Aes128CcmSw::new();
        ccm.set_client(&result);
        ccm.set_key(&KEY).unwrap();
        ccm.set_nonce(&NONCE).unwrap();

        ccm.crypt(buf, 0, header.len(), payload.len(), mic_len, true, true)
            .unwrap();
        assert!(result.done.get());
        let buf = result.buf.take().unwrap();
        // Ciphertext must differ from the plaintext.
        assert_ne!(&buf[header.len()..header.len() + payload.len()], &payload);

        result.done.set(false);
        ccm.crypt(buf, 0, header.len(), payload.len(), mic_len, true, false)
            .unwrap();
        assert!(result.done.get());
        assert!(result.tag_is_valid.get());
        let buf = result.buf.take().unwrap();
        assert_eq!(&buf[header.len()..header.len() + payload.len()], &payload);
    }

    #[test]
    fn corrupted_mic_is_detected() {
        let header = [0x61u8, 0x88, 0x42];
        let payload = [1u8, 2, 3, 4];
        let mic_len = 8;
        let buf = leak_frame(&[&header, &payload], mic_len);

        let result = CryptResult::new();
        let ccm = Aes128CcmSw::new();
        ccm.set_client(&result);
        ccm.set_key(&KEY).unwrap();
        ccm.set_nonce(&NONCE).unwrap();

        ccm.crypt(buf, 0, header.len(), payload.len(), mic_len, true, true)
            .unwrap();
        let buf = result.buf.take().unwrap();
        buf[header.len() + payload.len()] ^= 0x01;

        ccm.crypt(buf, 0, header.len(), payload.len(), mic_len, true, false)
            .unwrap();
        assert!(!result.tag_is_valid.get());
    }

    #[test]
    fn mic_only_level_authenticates_whole_frame() {
        // MIC-only levels pass the whole frame as a data (m_len = 0).
        let frame_bytes = [0x41u8, 0x88, 0x01, 0xaa, 0xbb, 0xcc];
        let mic_len = 4;
        let buf = leak_frame(&[&frame_bytes], mic_len);

        let result = CryptResult::new();
        let ccm = Aes128CcmSw::new();
        ccm.set_client(&result);
        ccm.set_key(&KEY).unwrap();
        ccm.set_nonce(&NONCE).unwrap();

        ccm.crypt(buf, 0, frame_bytes.len(), 0, mic_len, false, true)
            .unwrap();
        let buf = result.buf.take().unwrap();
        // Open data must be untouched.
        assert_eq!(&buf[..frame_bytes.len()], &frame_bytes);

        ccm.crypt(buf, 0, frame_bytes.len(), 0, mic_len, false, false)
            .unwrap();
        assert!(result.tag_is_valid.get());
    }
}
