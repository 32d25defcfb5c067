//! Blocking client for the API socket.
//!
//! One request in flight at a time: send a frame, read the matching
//! response. This is the contract the CLI front-end builds on, and what
//! the end-to-end tests drive the daemon with.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use grout_core::errno::{status_to_errno, Errno, Result};

use crate::frame::{check_payload_len, RequestHeader, ResponseHeader, HEADER_LEN};
use crate::wire::{from_bytes, pod_bytes, Pod};

pub struct ApiClient {
    sock: UnixStream,
    next_id: u32,
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

impl ApiClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let sock = UnixStream::connect(path).map_err(io_errno)?;
        Ok(Self { sock, next_id: 1 })
    }

    /// Send one request and wait for its response payload.
    ///
    /// A non-zero wire status comes back as `Err`; status 0 yields the raw
    /// response payload (possibly empty).
    pub fn send_recv(&mut self, req_type: u32, payload: &[u8]) -> Result<Vec<u8>> {
        check_payload_len(payload.len() as u32)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        // One buffer, one write: the daemon treats a header that is not
        // immediately followed by its payload as a protocol error.
        let header = RequestHeader::new(id, req_type, payload.len() as u32);
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        self.sock.write_all(&frame).map_err(io_errno)?;

        let mut buf = [0u8; HEADER_LEN];
        self.sock.read_exact(&mut buf).map_err(io_errno)?;
        let resp = ResponseHeader::from_bytes(&buf)?;
        if resp.for_id != id {
            return Err(Errno::EBADMSG);
        }
        check_payload_len(resp.payload_len)?;

        let mut payload = vec![0u8; resp.payload_len as usize];
        if resp.payload_len > 0 {
            self.sock.read_exact(&mut payload).map_err(io_errno)?;
        }
        if resp.status != 0 {
            return Err(status_to_errno(resp.status));
        }
        Ok(payload)
    }

    /// Typed request helper: POD in, POD out.
    pub fn request<Req: Pod, Resp: Pod>(&mut self, req_type: u32, req: &Req) -> Result<Resp> {
        let payload = self.send_recv(req_type, pod_bytes(req))?;
        from_bytes(&payload)
    }

    /// Typed request helper for operations that only acknowledge.
    pub fn request_ack<Req: Pod>(&mut self, req_type: u32, req: &Req) -> Result<()> {
        self.send_recv(req_type, pod_bytes(req))?;
        Ok(())
    }
}
