//! # grout-api
//!
//! Wire protocol spoken on the grout API socket. Shared by the daemon and
//! by clients (CLI front-ends, tests).
//!
//! The socket is local (`AF_UNIX`) and both ends are the same build, so
//! payloads are `#[repr(C)]` structs copied byte-for-byte in host order.
//!
//! ## Modules
//!
//! - `frame` - request/response framing and type codes
//! - `wire` - POD payload (de)serialization helpers
//! - `net` - network address types
//! - `infra` - interface management payloads
//! - `ip` - IPv4 NAT payloads
//! - `client` - blocking client for the request/response protocol

pub mod client;
pub mod frame;
pub mod infra;
pub mod ip;
pub mod net;
pub mod wire;

pub use client::ApiClient;
pub use frame::{RequestHeader, ResponseHeader, MAX_MSG_LEN};
pub use net::EthAddr;
pub use wire::{from_bytes, pod_bytes, push_pod, Pod};
