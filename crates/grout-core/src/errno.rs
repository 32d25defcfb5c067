//! Errno-based error handling.
//!
//! Every fallible control-plane operation returns `Result<T>`; the error is
//! a raw POSIX errno so it can cross the API socket unchanged in the
//! response `status` field.

pub use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Errno>;

/// Log an error at WARNING and pass it through, for call sites that
/// propagate but still want a trace of where the failure happened.
pub fn errno_log(err: Errno, what: &str) -> Errno {
    crate::log_warning!("{}: {}", what, err.desc());
    err
}

/// Errno value as it travels on the wire.
#[inline]
pub fn errno_to_status(err: Errno) -> u32 {
    err as i32 as u32
}

/// Wire status back to an errno. Status 0 is not an error and must be
/// checked by the caller before converting.
#[inline]
pub fn status_to_errno(status: u32) -> Errno {
    Errno::from_raw(status as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for err in [Errno::ENOTSUP, Errno::ENODEV, Errno::EMSGSIZE, Errno::ERANGE] {
            assert_eq!(status_to_errno(errno_to_status(err)), err);
        }
    }
}
