//! # grout-core
//!
//! Base types shared by every grout crate. Nothing in here knows about
//! interfaces, sockets or the API protocol.
//!
//! ## Modules
//!
//! - `log` - leveled stderr logging macros
//! - `errno` - errno-based `Result` alias and helpers
//! - `env` - environment variable utilities
//! - `string` - identifier validation

pub mod env;
pub mod errno;
pub mod log;
pub mod string;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use errno::{Errno, Result};
pub use log::LogLevel;
pub use string::check_name;
