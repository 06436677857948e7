// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (line formatting, level gating)
//! PUBLIC API: log_* macros, emit(level,target,args), LogSink, install_sink()
//! DEPENDS_ON: spin::Once
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; lines dropped until a sink exists
//!
//! The memory core has no console of its own. The platform glue installs a
//! [`LogSink`] (usually the secure UART) once during early boot.

use core::fmt::{self, Arguments, Write};

use spin::Once;

/// Logging severity used by the monitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    pub const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Destination for formatted log lines.
///
/// `write_line` receives one complete line without the trailing newline.
/// Implementations must not call back into the logger.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, line: &str);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Installs the process-wide sink. Later calls are ignored.
pub fn install_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

const LINE_CAPACITY: usize = 192;

/// Fixed-size line buffer; output past the capacity is truncated.
struct LineBuf {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self { bytes: [0; LINE_CAPACITY], len: 0 }
    }

    fn as_str(&self) -> &str {
        // Truncation in `write_str` only ever cuts on a char boundary.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("<log: invalid utf-8>")
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn format_line(buf: &mut LineBuf, level: Level, target: &str, args: Arguments<'_>) {
    let _ = write!(buf, "[{} {}] ", level.tag(), target);
    let _ = buf.write_fmt(args);
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let mut buf = LineBuf::new();
    format_line(&mut buf, level, target, args);
    sink.write_line(level, buf.as_str());
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
