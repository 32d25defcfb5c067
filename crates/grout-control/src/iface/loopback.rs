//! Loopback interfaces.
//!
//! The smallest interface type: no hardware address, no members. Most
//! vtable slots are intentionally absent so attribute requests surface
//! `ENOTSUP` instead of silently succeeding.

use grout_core::errno::{Errno, Result};

use grout_api::infra::{IFACE_TYPE_LOOPBACK, IFACE_F_UP};

use crate::module::{register_module, Module};
use crate::Control;

use super::{IfaceInfo, IfaceType};

#[derive(Debug, Default)]
pub struct LoopbackInfo {}

fn loopback_init(ctl: &mut Control, id: u16, _info: &[u8]) -> Result<()> {
    let iface = ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?;
    iface.info = IfaceInfo::Loopback(LoopbackInfo {});
    Ok(())
}

fn loopback_up_down(ctl: &mut Control, id: u16, up: bool) -> Result<()> {
    let iface = ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?;
    if up {
        iface.flags |= IFACE_F_UP;
    } else {
        iface.flags &= !IFACE_F_UP;
    }
    Ok(())
}

fn loopback_mtu_set(ctl: &mut Control, id: u16, mtu: u16) -> Result<()> {
    let iface = ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?;
    iface.mtu = mtu;
    Ok(())
}

const IFACE_TYPE: IfaceType = IfaceType {
    init: Some(loopback_init),
    set_up_down: Some(loopback_up_down),
    set_mtu: Some(loopback_mtu_set),
    ..IfaceType::new(IFACE_TYPE_LOOPBACK, "loopback")
};

pub fn register(ctl: &mut Control) {
    ctl.ifaces.register_type(IFACE_TYPE);
    register_module(
        ctl,
        Module { init_prio: 2100, fini_prio: 7900, ..Module::empty("loopback") },
    );
}
