//! Module lifecycle.
//!
//! Modules register once at startup through [`register_all`], then
//! [`modules_init`] runs the `init` callbacks ordered by ascending
//! `init_prio` (stable on ties) and [`modules_fini`] the `fini` callbacks
//! by ascending `fini_prio`. An init failure is unrecoverable and aborts;
//! teardown is best-effort and keeps going.
//!
//! The `*_dp` hooks are the datapath-side counterparts, run in
//! registration order once the control side is up.

use grout_core::errno::Result;
use grout_core::log_debug;

use crate::Control;

#[derive(Clone, Copy)]
pub struct Module {
    pub name: &'static str,
    pub init: Option<fn(&mut Control) -> Result<()>>,
    pub fini: Option<fn(&mut Control)>,
    pub init_dp: Option<fn(&mut Control)>,
    pub fini_dp: Option<fn(&mut Control)>,
    pub init_prio: i32,
    pub fini_prio: i32,
}

impl Module {
    /// A module with no callbacks; fill in what you need.
    pub const fn empty(name: &'static str) -> Self {
        Self {
            name,
            init: None,
            fini: None,
            init_dp: None,
            fini_dp: None,
            init_prio: 0,
            fini_prio: 0,
        }
    }
}

pub fn register_module(ctl: &mut Control, module: Module) {
    if ctl.modules.iter().any(|m| m.name == module.name) {
        panic!("duplicate module '{}'", module.name);
    }
    ctl.modules.push(module);
}

/// One-shot inventory of every module in the daemon. Registration order
/// matters only for event subscriptions; init order is priority-driven.
pub fn register_all(ctl: &mut Control) {
    crate::iface::register(ctl);
    crate::iface::port::register(ctl);
    crate::iface::loopback::register(ctl);
    crate::iface::bond::register(ctl);
    crate::trace::register(ctl);
    crate::dnat44::register(ctl);
}

fn by_init_prio(ctl: &Control) -> Vec<Module> {
    let mut mods = ctl.modules.clone();
    mods.sort_by_key(|m| m.init_prio);
    mods
}

fn by_fini_prio(ctl: &Control) -> Vec<Module> {
    let mut mods = ctl.modules.clone();
    mods.sort_by_key(|m| m.fini_prio);
    mods
}

pub fn modules_init(ctl: &mut Control) {
    for module in by_init_prio(ctl) {
        if let Some(init) = module.init {
            log_debug!("{} init prio {}", module.name, module.init_prio);
            if let Err(err) = init(ctl) {
                panic!("module '{}' init failed: {}", module.name, err.desc());
            }
        }
    }
}

pub fn modules_fini(ctl: &mut Control) {
    for module in by_fini_prio(ctl) {
        if let Some(fini) = module.fini {
            log_debug!("{} fini prio {}", module.name, module.fini_prio);
            fini(ctl);
        }
    }
}

pub fn modules_dp_init(ctl: &mut Control) {
    let mods = ctl.modules.clone();
    for module in mods {
        if let Some(init_dp) = module.init_dp {
            log_debug!("{} init_dp", module.name);
            init_dp(ctl);
        }
    }
}

pub fn modules_dp_fini(ctl: &mut Control) {
    let mods = ctl.modules.clone();
    for module in mods {
        if let Some(fini_dp) = module.fini_dp {
            log_debug!("{} fini_dp", module.name);
            fini_dp(ctl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    // One recorder per test: the harness runs tests concurrently.
    static INIT_CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static FINI_CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn init_a(_: &mut Control) -> grout_core::Result<()> {
        INIT_CALLS.lock().unwrap().push("a");
        Ok(())
    }
    fn init_b(_: &mut Control) -> grout_core::Result<()> {
        INIT_CALLS.lock().unwrap().push("b");
        Ok(())
    }
    fn init_c(_: &mut Control) -> grout_core::Result<()> {
        INIT_CALLS.lock().unwrap().push("c");
        Ok(())
    }
    fn fini_a(_: &mut Control) {
        FINI_CALLS.lock().unwrap().push("fini_a");
    }
    fn fini_b(_: &mut Control) {
        FINI_CALLS.lock().unwrap().push("fini_b");
    }
    fn failing_init(_: &mut Control) -> grout_core::Result<()> {
        Err(grout_core::Errno::ENOMEM)
    }

    #[test]
    fn test_init_order_by_prio_stable() {
        let mut ctl = Control::new(Config::default());
        // b and c share a priority: registration order must be kept.
        register_module(&mut ctl, Module { init: Some(init_b), init_prio: 20, ..Module::empty("m_b") });
        register_module(&mut ctl, Module { init: Some(init_c), init_prio: 20, ..Module::empty("m_c") });
        register_module(&mut ctl, Module { init: Some(init_a), init_prio: 10, ..Module::empty("m_a") });

        modules_init(&mut ctl);
        let calls = INIT_CALLS.lock().unwrap().clone();
        assert_eq!(calls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fini_order_by_fini_prio() {
        let mut ctl = Control::new(Config::default());
        register_module(&mut ctl, Module { fini: Some(fini_a), fini_prio: 50, ..Module::empty("m_a") });
        register_module(&mut ctl, Module { fini: Some(fini_b), fini_prio: 40, ..Module::empty("m_b") });

        modules_fini(&mut ctl);
        let calls = FINI_CALLS.lock().unwrap().clone();
        assert_eq!(calls, vec!["fini_b", "fini_a"]);
    }

    #[test]
    #[should_panic(expected = "init failed")]
    fn test_init_failure_aborts() {
        let mut ctl = Control::new(Config::default());
        register_module(&mut ctl, Module { init: Some(failing_init), ..Module::empty("bad") });
        modules_init(&mut ctl);
    }

    #[test]
    #[should_panic(expected = "duplicate module")]
    fn test_duplicate_module_rejected() {
        let mut ctl = Control::new(Config::default());
        register_module(&mut ctl, Module::empty("twice"));
        register_module(&mut ctl, Module::empty("twice"));
    }
}
