//! Leveled stderr logging for the control plane.
//!
//! One process-global level, stored in an atomic so the datapath workers can
//! read it without locking. The daemon raises the level with repeated `-v`
//! flags; `GROUT_LOG_LEVEL` overrides it (numeric or level name).
//!
//! Output format: `[LEVEL] message`.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels, syslog-style.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Err = 1,
    Warning = 2,
    Notice = 3,
    Info = 4,
    Debug = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Err,
            2 => LogLevel::Warning,
            3 => LogLevel::Notice,
            4 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        if let Ok(n) = s.parse::<u8>() {
            return Some(Self::from_u8(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(LogLevel::Off),
            "err" | "error" => Some(LogLevel::Err),
            "warning" | "warn" => Some(LogLevel::Warning),
            "notice" => Some(LogLevel::Notice),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Notice as u8);

/// Set the global log level.
pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current global log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Map a `-v` repetition count onto a level (0 → NOTICE, 1 → INFO, 2+ → DEBUG),
/// then apply the `GROUT_LOG_LEVEL` override if present.
pub fn init(verbose: u8) {
    let mut level = LogLevel::from_u8((LogLevel::Notice as u8).saturating_add(verbose));
    if let Ok(v) = std::env::var("GROUT_LOG_LEVEL") {
        if let Some(l) = LogLevel::parse(&v) {
            level = l;
        }
    }
    set_level(level);
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: std::fmt::Arguments<'_>) {
    // Single write per line so concurrent producers do not interleave.
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "[{}] {}", level.tag(), args);
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Err) {
            $crate::log::_log($crate::log::LogLevel::Err, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Warning) {
            $crate::log::_log($crate::log::LogLevel::Warning, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Notice) {
            $crate::log::_log($crate::log::LogLevel::Notice, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Info) {
            $crate::log::_log($crate::log::LogLevel::Info, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::_log($crate::log::LogLevel::Debug, format_args!($($arg)*));
        }
    };
}
