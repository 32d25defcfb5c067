//! API socket framing.
//!
//! Every message is a fixed 12-byte header followed by `payload_len` bytes.
//! Headers are host byte order: the socket never leaves the machine and the
//! peer is the same build.

use grout_core::errno::{Errno, Result};

/// Hard ceiling on a frame payload. Anything larger is refused with
/// `EMSGSIZE` by the codec and treated as protocol abuse by the server.
pub const MAX_MSG_LEN: u32 = 128 * 1024;

/// Size of both the request and the response header.
pub const HEADER_LEN: usize = 12;

/// Pack a request type from a module id and a per-module kind.
pub const fn req_type(module: u16, kind: u16) -> u32 {
    (module as u32) << 16 | kind as u32
}

/// Module half of a request type.
pub const fn req_module(req_type: u32) -> u16 {
    (req_type >> 16) as u16
}

/// Kind half of a request type.
pub const fn req_kind(req_type: u32) -> u16 {
    req_type as u16
}

/// Request frame header: `{ id, req_type, payload_len }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Client-chosen correlation id, echoed back in `ResponseHeader::for_id`.
    pub id: u32,
    pub req_type: u32,
    pub payload_len: u32,
}

/// Response frame header: `{ for_id, status, payload_len }`.
///
/// `status` is 0 on success, a raw POSIX errno otherwise.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub for_id: u32,
    pub status: u32,
    pub payload_len: u32,
}

/// Refuse payload lengths above the frame ceiling.
pub fn check_payload_len(len: u32) -> Result<()> {
    if len > MAX_MSG_LEN {
        return Err(Errno::EMSGSIZE);
    }
    Ok(())
}

impl RequestHeader {
    pub fn new(id: u32, req_type: u32, payload_len: u32) -> Self {
        Self { id, req_type, payload_len }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.id.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.req_type.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    /// Decode a header. `EBADMSG` if the buffer is shorter than a header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Errno::EBADMSG);
        }
        Ok(Self {
            id: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            req_type: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            payload_len: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

impl ResponseHeader {
    pub fn new(for_id: u32, status: u32, payload_len: u32) -> Self {
        Self { for_id, status, payload_len }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.for_id.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.status.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Errno::EBADMSG);
        }
        Ok(Self {
            for_id: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            status: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            payload_len: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_round_trip() {
        let req = RequestHeader::new(7, req_type(0x000a, 0x0001), 96);
        assert_eq!(RequestHeader::from_bytes(&req.to_bytes()), Ok(req));
    }

    #[test]
    fn test_response_header_round_trip() {
        let resp = ResponseHeader::new(7, Errno::ENOTSUP as i32 as u32, 0);
        assert_eq!(ResponseHeader::from_bytes(&resp.to_bytes()), Ok(resp));
    }

    #[test]
    fn test_short_header_rejected() {
        assert_eq!(RequestHeader::from_bytes(&[0u8; 11]), Err(Errno::EBADMSG));
    }

    #[test]
    fn test_req_type_packing() {
        let t = req_type(0xdead, 0x0001);
        assert_eq!(t, 0xdead0001);
        assert_eq!(req_module(t), 0xdead);
        assert_eq!(req_kind(t), 0x0001);
    }

    #[test]
    fn test_payload_ceiling() {
        assert_eq!(check_payload_len(MAX_MSG_LEN), Ok(()));
        assert_eq!(check_payload_len(MAX_MSG_LEN + 1), Err(Errno::EMSGSIZE));
    }
}
