//! Identifier validation.
//!
//! Names arrive from clients as fixed-size NUL-padded byte fields and must
//! be valid UTF-8 strictly shorter than the field.

use crate::errno::{Errno, Result};

/// Validate a name field and return it as a `&str`.
///
/// The name is the bytes up to the first NUL. Errors:
/// - `ENAMETOOLONG` if there is no NUL terminator within `maxlen`
/// - `EILSEQ` if the bytes are not valid UTF-8
/// - `EINVAL` if the name is empty
pub fn check_name(buf: &[u8], maxlen: usize) -> Result<&str> {
    let buf = if buf.len() > maxlen { &buf[..maxlen] } else { buf };
    let len = match buf.iter().position(|&b| b == 0) {
        Some(n) => n,
        None => return Err(Errno::ENAMETOOLONG),
    };
    let name = std::str::from_utf8(&buf[..len]).map_err(|_| Errno::EILSEQ)?;
    if name.is_empty() {
        return Err(Errno::EINVAL);
    }
    Ok(name)
}

/// Copy a name into a fixed-size NUL-padded wire field.
///
/// The name must fit with room for the terminator, `ENAMETOOLONG` otherwise.
pub fn put_name(out: &mut [u8], name: &str) -> Result<()> {
    if name.len() >= out.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    out.fill(0);
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name() {
        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(b"eth0");
        assert_eq!(check_name(&buf, 16), Ok("eth0"));
    }

    #[test]
    fn test_name_too_long() {
        let buf = [b'a'; 256];
        assert_eq!(check_name(&buf, 64), Err(Errno::ENAMETOOLONG));
        let mut out = [0u8; 8];
        assert_eq!(put_name(&mut out, "verylongname"), Err(Errno::ENAMETOOLONG));
    }

    #[test]
    fn test_name_bad_utf8() {
        let mut buf = [0u8; 16];
        buf[..3].copy_from_slice(&[0xff, 0xfe, 0x00]);
        assert_eq!(check_name(&buf, 16), Err(Errno::EILSEQ));
    }

    #[test]
    fn test_name_empty() {
        let buf = [0u8; 16];
        assert_eq!(check_name(&buf, 16), Err(Errno::EINVAL));
    }

    #[test]
    fn test_put_name_round_trip() {
        let mut buf = [0xaau8; 16];
        put_name(&mut buf, "bond0").unwrap();
        assert_eq!(check_name(&buf, 16), Ok("bond0"));
    }
}
