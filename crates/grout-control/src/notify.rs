//! Service supervisor readiness messages.
//!
//! Standard convention: a datagram per state change to the socket named by
//! `NOTIFY_SOCKET` (abstract namespace when the name starts with `@`).
//! Silently a no-op when not running under a supervisor.

use std::os::fd::AsRawFd;

use nix::sys::socket::{sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};

use grout_core::errno::Result;

fn notify(state: &str) -> Result<()> {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
        return Ok(());
    };
    let addr = match path.strip_prefix('@') {
        Some(name) => UnixAddr::new_abstract(name.as_bytes())?,
        None => UnixAddr::new(path.as_str())?,
    };
    let sock = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    sendto(sock.as_raw_fd(), state.as_bytes(), &addr, MsgFlags::empty())?;
    Ok(())
}

pub fn notify_ready(version: &str) -> Result<()> {
    notify(&format!("READY=1\nSTATUS=grout version {} started", version))
}

pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1\nSTATUS=shutting down...")
}

/// Only non-zero errors are reported.
pub fn notify_errno(err: grout_core::Errno) -> Result<()> {
    notify(&format!("ERRNO={}", err as i32))
}
