// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Standard error codes shared by every layer of the stack.

/// Error returned by fallible stack operations.
///
/// Success is expressed as `Ok(())`; this enum only enumerates failures.
/// Operations that consume a `&'static mut` buffer return it alongside the
/// error so ownership is never lost: `Result<(), (ErrorCode, &'static mut
/// [u8])>`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(usize)]
pub enum ErrorCode {
    /// Generic failure condition
    FAIL = 1,
    /// Underlying system is busy; retry
    BUSY = 2,
    /// The state requested is already set
    ALREADY = 3,
    /// An invalid parameter was passed
    INVAL = 4,
    /// The component is not in a state to support the operation
    STATE = 5,
    /// Insufficient buffers available
    NOMEM = 6,
    /// No address slot available or address not present
    NOADDR = 7,
    /// The requested entry does not exist
    NOTFOUND = 8,
    /// Operation was cancelled or aborted
    CANCEL = 9,
    /// Input could not be parsed
    PARSE = 10,
    /// Security check (key lookup, replay window, or MIC) failed
    SECURITY = 11,
    /// No acknowledgement was received after all retransmissions
    NOACK = 12,
    /// CSMA/CA exhausted its backoffs without a clear channel
    CHANBUSY = 13,
    /// A response did not arrive within the expected window
    TIMEOUT = 14,
    /// The operation is not supported
    NOSUPPORT = 15,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}
