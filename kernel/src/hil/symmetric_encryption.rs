// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! AES-128 CCM* interface used by the link-layer and MLE security engines.

use crate::ErrorCode;

pub const AES128_KEY_SIZE: usize = 16;
pub const AES128_BLOCK_SIZE: usize = 16;
/// CCM* nonce length for 802.15.4 (L = 2).
pub const CCM_NONCE_LENGTH: usize = 13;

pub trait CCMClient {
    /// Completion of a `crypt` call.
    ///
    /// `tag_is_valid` is meaningful on decryption: `true` iff the MIC
    /// matched. On encryption it is `true` whenever `res` is `Ok`.
    fn crypt_done(&self, buf: &'static mut [u8], res: Result<(), ErrorCode>, tag_is_valid: bool);
}

/// AES-128 CCM* transformation over a caller-provided frame buffer.
///
/// The frame layout is `buf[a_off..m_off]` open (authenticated-only) data,
/// `buf[m_off..m_off + m_len]` private data, with `mic_len` bytes of tag
/// appended at `m_off + m_len` by encryption (or verified there by
/// decryption). A software implementation may complete synchronously; the
/// client callback fires either way.
pub trait AES128CCM<'a> {
    fn set_client(&self, client: &'a dyn CCMClient);

    fn set_key(&self, key: &[u8]) -> Result<(), ErrorCode>;

    fn set_nonce(&self, nonce: &[u8]) -> Result<(), ErrorCode>;

    fn crypt(
        &self,
        buf: &'static mut [u8],
        a_off: usize,
        m_off: usize,
        m_len: usize,
        mic_len: usize,
        confidential: bool,
        encrypting: bool,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;
}
