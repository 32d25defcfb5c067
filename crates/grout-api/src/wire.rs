//! POD payload (de)serialization.
//!
//! Payload structs are `#[repr(C)]`, laid out without implicit padding
//! (every gap is an explicit `_pad` field) and contain no types with
//! invalid bit patterns. That makes a plain byte copy both directions a
//! complete codec.

use grout_core::errno::{Errno, Result};

/// Marker for wire-safe payload structs.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, free of implicit padding, and valid
/// for every bit pattern (no references, no enums, no bools).
pub unsafe trait Pod: Copy + 'static {}

/// Decode a POD struct from the front of a payload buffer.
///
/// Trailing bytes are ignored so response structs may carry a variable
/// array after the fixed part. `EINVAL` if the buffer is too short.
pub fn from_bytes<T: Pod>(buf: &[u8]) -> Result<T> {
    if buf.len() < std::mem::size_of::<T>() {
        return Err(Errno::EINVAL);
    }
    // Safety: length checked above; T is Pod so any bit pattern is valid
    // and unaligned reads are handled by read_unaligned.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

/// View a POD struct as its wire bytes.
pub fn pod_bytes<T: Pod>(val: &T) -> &[u8] {
    // Safety: T is Pod, so every byte of the value is initialized.
    unsafe {
        std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Append a POD struct to a response buffer.
pub fn push_pod<T: Pod>(out: &mut Vec<u8>, val: &T) {
    out.extend_from_slice(pod_bytes(val));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Sample {
        a: u16,
        b: u16,
        c: u32,
    }
    unsafe impl Pod for Sample {}

    #[test]
    fn test_pod_round_trip() {
        let s = Sample { a: 1, b: 2, c: 0xdeadbeef };
        let decoded: Sample = from_bytes(pod_bytes(&s)).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn test_short_buffer() {
        let r: Result<Sample> = from_bytes(&[0u8; 4]);
        assert_eq!(r, Err(Errno::EINVAL));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = Vec::new();
        push_pod(&mut buf, &Sample { a: 9, b: 8, c: 7 });
        buf.extend_from_slice(&[0xff; 16]);
        let decoded: Sample = from_bytes(&buf).unwrap();
        assert_eq!(decoded.a, 9);
    }
}
