//! Software port interfaces.
//!
//! A port models one datapath attachment point: a primary MAC, a MAC
//! filter table (extra unicast addresses the datapath accepts), VLAN
//! membership and an optional back-link to the bond that owns it. The
//! back-link is an id, resolved through the table on use.

use grout_core::errno::{Errno, Result};

use grout_api::infra::{ApiIfaceInfoPort, IFACE_ID_UNDEF, IFACE_TYPE_PORT, PORT_SET_MAC};
use grout_api::net::EthAddr;
use grout_api::wire::{from_bytes, pod_bytes};

use crate::module::{register_module, Module};
use crate::Control;

use super::{iface_info_port, iface_info_port_mut, Iface, IfaceInfo, IfaceType};

#[derive(Debug, Default)]
pub struct PortInfo {
    pub mac: EthAddr,
    /// Owning bond id, `IFACE_ID_UNDEF` when standalone.
    pub bond_iface_id: u16,
    /// Extra unicast addresses accepted by the datapath.
    pub eth_addrs: Vec<EthAddr>,
    pub vlans: Vec<u16>,
}

fn port_mut(ctl: &mut Control, id: u16) -> Result<&mut Iface> {
    ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)
}

fn port_init(ctl: &mut Control, id: u16, info: &[u8]) -> Result<()> {
    let api: ApiIfaceInfoPort = from_bytes(info)?;
    let mac = if api.mac.is_zero() { EthAddr::local_from_id(id) } else { api.mac };
    let iface = port_mut(ctl, id)?;
    iface.info = IfaceInfo::Port(PortInfo {
        mac,
        bond_iface_id: IFACE_ID_UNDEF,
        eth_addrs: Vec::new(),
        vlans: Vec::new(),
    });
    Ok(())
}

fn port_reconfig(
    ctl: &mut Control,
    id: u16,
    set_attrs: u64,
    _conf: &grout_api::infra::ApiIfaceBase,
    info: &[u8],
) -> Result<()> {
    let api: ApiIfaceInfoPort = from_bytes(info)?;
    if set_attrs & PORT_SET_MAC != 0 && !api.mac.is_zero() {
        port_mac_set(ctl, id, &api.mac)?;
    }
    Ok(())
}

fn port_mac_get(ctl: &Control, id: u16) -> Result<EthAddr> {
    let iface = ctl.ifaces.from_id(id).ok_or(Errno::ENODEV)?;
    Ok(iface_info_port(iface).mac)
}

fn port_mac_set(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    if mac.is_zero() {
        return Err(Errno::EINVAL);
    }
    let iface = port_mut(ctl, id)?;
    iface_info_port_mut(iface).mac = *mac;
    Ok(())
}

/// Adding an address that is already configured is a no-op: the datapath
/// filter is a set, and idempotence lets an aggregate retry a partially
/// applied configuration.
fn port_mac_add(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    if mac.is_zero() {
        return Err(Errno::EINVAL);
    }
    let port = iface_info_port_mut(port_mut(ctl, id)?);
    if !port.eth_addrs.contains(mac) {
        port.eth_addrs.push(*mac);
    }
    Ok(())
}

fn port_mac_del(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let port = iface_info_port_mut(port_mut(ctl, id)?);
    match port.eth_addrs.iter().position(|a| a == mac) {
        Some(pos) => {
            port.eth_addrs.remove(pos);
            Ok(())
        }
        None => Err(Errno::ENOENT),
    }
}

fn port_mtu_set(ctl: &mut Control, id: u16, mtu: u16) -> Result<()> {
    port_mut(ctl, id)?.mtu = mtu;
    Ok(())
}

fn port_flag_set(ctl: &mut Control, id: u16, flag: u16, enabled: bool) -> Result<()> {
    let iface = port_mut(ctl, id)?;
    if enabled {
        iface.flags |= flag;
    } else {
        iface.flags &= !flag;
    }
    Ok(())
}

fn port_promisc_set(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    port_flag_set(ctl, id, grout_api::infra::IFACE_F_PROMISC, enabled)
}

fn port_allmulti_set(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    port_flag_set(ctl, id, grout_api::infra::IFACE_F_ALLMULTI, enabled)
}

fn port_up_down(ctl: &mut Control, id: u16, up: bool) -> Result<()> {
    port_flag_set(ctl, id, grout_api::infra::IFACE_F_UP, up)
}

fn port_vlan_add(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    if vlan_id == 0 || vlan_id >= 4095 {
        return Err(Errno::EINVAL);
    }
    let port = iface_info_port_mut(port_mut(ctl, id)?);
    if port.vlans.contains(&vlan_id) {
        return Err(Errno::EEXIST);
    }
    port.vlans.push(vlan_id);
    Ok(())
}

fn port_vlan_del(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    let port = iface_info_port_mut(port_mut(ctl, id)?);
    match port.vlans.iter().position(|&v| v == vlan_id) {
        Some(pos) => {
            port.vlans.remove(pos);
            Ok(())
        }
        None => Err(Errno::ENOENT),
    }
}

fn port_to_api(_ctl: &Control, iface: &Iface, out: &mut [u8]) {
    let port = iface_info_port(iface);
    let api = ApiIfaceInfoPort { mac: port.mac, bond_iface_id: port.bond_iface_id };
    let bytes = pod_bytes(&api);
    out[..bytes.len()].copy_from_slice(bytes);
}

const IFACE_TYPE: IfaceType = IfaceType {
    init: Some(port_init),
    reconfig: Some(port_reconfig),
    get_eth_addr: Some(port_mac_get),
    set_eth_addr: Some(port_mac_set),
    add_eth_addr: Some(port_mac_add),
    del_eth_addr: Some(port_mac_del),
    set_mtu: Some(port_mtu_set),
    set_promisc: Some(port_promisc_set),
    set_allmulti: Some(port_allmulti_set),
    set_up_down: Some(port_up_down),
    add_vlan: Some(port_vlan_add),
    del_vlan: Some(port_vlan_del),
    to_api: Some(port_to_api),
    ..IfaceType::new(IFACE_TYPE_PORT, "port")
};

fn port_init_dp(ctl: &mut Control) {
    // rx/tx graph nodes exist per process, not per port
    crate::trace::register_node(ctl, crate::trace::NODE_PORT_RX, "port_rx", None);
    crate::trace::register_node(ctl, crate::trace::NODE_PORT_TX, "port_tx", None);
}

pub fn register(ctl: &mut Control) {
    ctl.ifaces.register_type(IFACE_TYPE);
    register_module(
        ctl,
        Module {
            init_dp: Some(port_init_dp),
            init_prio: 2000,
            fini_prio: 8000,
            ..Module::empty("port")
        },
    );
}
