// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Software symmetric-crypto capsules built on the RustCrypto block cipher.

pub mod aes_ccm;
pub mod aes_cmac;
