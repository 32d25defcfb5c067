//! API request handler registry.
//!
//! Handlers are registered at module-registration time and looked up by
//! request type on every incoming frame. Registering two handlers for the
//! same type is a programming error and aborts.

use grout_core::errno::Result;

use crate::Control;

/// A handler returns the response payload on success (empty for a bare
/// acknowledgement) or the errno to put in the response status.
pub type ApiResult = Result<Vec<u8>>;

pub type ApiCallback = fn(&mut Control, &[u8]) -> ApiResult;

#[derive(Clone, Copy)]
pub struct ApiHandler {
    pub request_type: u32,
    pub name: &'static str,
    pub callback: ApiCallback,
}

pub fn register_api_handler(ctl: &mut Control, handler: ApiHandler) {
    for h in &ctl.handlers {
        if h.request_type == handler.request_type {
            panic!(
                "duplicate api handler type=0x{:08x} '{}'",
                handler.request_type, handler.name
            );
        }
    }
    ctl.handlers.push(handler);
}

/// Linear scan; the registry is small and lookups are off the hot path.
pub fn lookup_api_handler(ctl: &Control, request_type: u32) -> Option<&ApiHandler> {
    ctl.handlers.iter().find(|h| h.request_type == request_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn ack(_: &mut Control, _: &[u8]) -> ApiResult {
        Ok(Vec::new())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut ctl = Control::new(Config::default());
        register_api_handler(&mut ctl, ApiHandler { request_type: 0x000a0001, name: "x", callback: ack });
        register_api_handler(&mut ctl, ApiHandler { request_type: 0x000a0002, name: "y", callback: ack });

        assert_eq!(lookup_api_handler(&ctl, 0x000a0002).unwrap().name, "y");
        assert!(lookup_api_handler(&ctl, 0xdead0001).is_none());
    }

    #[test]
    fn test_handler_types_unique() {
        let mut ctl = crate::boot(Config::default());
        // registry built by the real modules: all request types distinct
        let handlers = std::mem::take(&mut ctl.handlers);
        for (i, a) in handlers.iter().enumerate() {
            for b in &handlers[i + 1..] {
                assert_ne!(a.request_type, b.request_type, "{} vs {}", a.name, b.name);
            }
        }
    }

    #[test]
    #[should_panic(expected = "duplicate api handler")]
    fn test_duplicate_handler_aborts() {
        let mut ctl = Control::new(Config::default());
        register_api_handler(&mut ctl, ApiHandler { request_type: 1, name: "x", callback: ack });
        register_api_handler(&mut ctl, ApiHandler { request_type: 1, name: "x2", callback: ack });
    }
}
