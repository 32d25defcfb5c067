//! # grout-control
//!
//! The control-plane kernel of the grout router: module lifecycle, event
//! bus, interface table, API dispatch server and the packet trace ring.
//!
//! Everything except the trace ring is owned by a single [`Control`] value
//! that lives on the reactor thread. Handlers and event callbacks receive
//! `&mut Control` and run to completion, so they are atomic with respect to
//! each other; the trace ring is the only structure shared with the
//! datapath workers.
//!
//! ## Modules
//!
//! - `module` - module records, ordered init/teardown
//! - `api` - request handler registry
//! - `event` - synchronous publish/subscribe
//! - `iface` - interface table, types and attribute dispatch
//! - `server` - the single-threaded API socket reactor
//! - `trace` - bounded per-packet trace pool and ring
//! - `dnat44` - static destination NAT rules
//! - `notify` - service supervisor readiness messages
//! - `config` - daemon configuration

pub mod api;
pub mod config;
pub mod dnat44;
pub mod event;
pub mod iface;
pub mod module;
pub mod notify;
pub mod server;
pub mod trace;

use api::ApiHandler;
use config::Config;
use dnat44::Dnat44State;
use event::EventSubscription;
use iface::IfaceTable;
use module::Module;
use trace::NodeRegistry;

/// Single-thread-owned control-plane state.
pub struct Control {
    pub cfg: Config,
    pub ifaces: IfaceTable,
    pub nodes: NodeRegistry,
    pub(crate) modules: Vec<Module>,
    pub(crate) handlers: Vec<ApiHandler>,
    pub(crate) subscriptions: Vec<EventSubscription>,
    pub(crate) dnat44: Dnat44State,
}

impl Control {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            ifaces: IfaceTable::new(),
            nodes: NodeRegistry::new(),
            modules: Vec::new(),
            handlers: Vec::new(),
            subscriptions: Vec::new(),
            dnat44: Dnat44State::new(),
        }
    }
}

/// Build a fully registered and initialized control plane.
pub fn boot(cfg: Config) -> Control {
    let mut ctl = Control::new(cfg);
    module::register_all(&mut ctl);
    module::modules_init(&mut ctl);
    ctl
}
