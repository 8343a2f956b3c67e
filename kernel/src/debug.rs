// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! In-stack debug output.
//!
//! Capsules emit diagnostics through the [`debug!`] macro. Output goes to a
//! single writer registered by the embedder at initialization; until one is
//! registered (and in production builds that never register one) the output is
//! discarded. Messages longer than the internal line buffer are truncated.

use core::fmt;
use core::fmt::Write;

/// Sink for `debug!` lines, implemented by the embedder.
pub trait DebugWriter {
    /// Write one formatted line (no trailing newline).
    fn write_line(&self, line: &str);
}

static mut DEBUG_WRITER: Option<&'static dyn DebugWriter> = None;

/// Register the sink for all subsequent `debug!` output.
///
/// # Safety
///
/// Must be called from the main (non-interrupt) context before the stack
/// runs, with no `debug!` call in progress.
pub unsafe fn set_debug_writer(writer: &'static dyn DebugWriter) {
    unsafe {
        DEBUG_WRITER = Some(writer);
    }
}

const LINE_BUF_LEN: usize = 256;

struct LineBuffer {
    buf: [u8; LINE_BUF_LEN],
    len: usize,
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = LINE_BUF_LEN - self.len;
        // Truncate at a char boundary so the buffer stays valid UTF-8.
        let take = (0..=s.len().min(remaining))
            .rev()
            .find(|&i| s.is_char_boundary(i))
            .unwrap_or(0);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Format and emit one debug line. Use through the [`debug!`] macro.
pub fn debug_print(args: fmt::Arguments) {
    let writer = unsafe { DEBUG_WRITER };
    if let Some(writer) = writer {
        let mut line = LineBuffer {
            buf: [0; LINE_BUF_LEN],
            len: 0,
        };
        let _ = line.write_fmt(args);
        // The buffer is only ever filled from &str data at char boundaries.
        let s = unsafe { core::str::from_utf8_unchecked(&line.buf[..line.len]) };
        writer.write_line(s);
    }
}

/// Emit a formatted diagnostic line through the registered [`DebugWriter`].
#[macro_export]
macro_rules! debug {
    () => {
        $crate::debug::debug_print(core::format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::debug::debug_print(core::format_args!($($arg)*))
    };
}
