//! Bond (link aggregation) interfaces.
//!
//! A bond groups ports under one MAC with a fail-over policy. Members are
//! stored as interface ids and resolved through the table; each enrolled
//! port carries the owning bond id as a back-link, which is what the
//! status-event handler uses to find the bond to re-evaluate.
//!
//! Reconfiguration takes an attribute mask so one call can change any
//! subset of {mode, mac, members, primary}. Member enrolment is resumable:
//! members enrolled before a mid-loop failure keep their back-links and
//! MAC configuration, and re-running the same reconfig finishes the job
//! (extra-address configuration on ports is idempotent).

use grout_core::errno::{errno_log, Errno, Result};
use grout_core::{log_debug, log_err, log_info, log_warning};

use grout_api::infra::{
    ApiIfaceBase, ApiIfaceInfoBond, BOND_MEMBERS_MAX, BOND_MEMBER_NONE,
    BOND_MODE_ACTIVE_BACKUP, BOND_SET_MAC, BOND_SET_MEMBERS, BOND_SET_MODE, BOND_SET_PRIMARY,
    IFACE_ID_UNDEF, IFACE_SET_ALL, IFACE_S_ACTIVE, IFACE_S_RUNNING, IFACE_TYPE_BOND,
    IFACE_TYPE_PORT, IFACE_F_UP,
};
use grout_api::net::EthAddr;
use grout_api::wire::{from_bytes, pod_bytes};

use crate::event::{subscribe, EventPayload, EventSubscription, EventType};
use crate::module::{register_module, Module};
use crate::Control;

use super::{
    iface_add_eth_addr, iface_add_vlan, iface_del_eth_addr, iface_del_vlan, iface_get_eth_addr,
    iface_info_bond, iface_info_bond_mut, iface_info_port, iface_info_port_mut, iface_set_allmulti,
    iface_set_mtu, iface_set_promisc, iface_set_up_down, iface_to_api_base, Iface, IfaceInfo,
    IfaceType,
};

#[derive(Debug)]
pub struct BondInfo {
    pub mode: u8,
    /// MAC currently presented by the bond (the active member's).
    pub mac: EthAddr,
    /// Member interface ids, in configuration order.
    pub members: Vec<u16>,
    pub primary_member: u8,
    /// Index into `members`, `BOND_MEMBER_NONE` when no member is eligible.
    pub active_member: u8,
    /// Extra addresses propagated to every member's filter table.
    pub extra_macs: Vec<EthAddr>,
}

impl Default for BondInfo {
    fn default() -> Self {
        Self {
            mode: BOND_MODE_ACTIVE_BACKUP,
            mac: EthAddr::ZERO,
            members: Vec::new(),
            primary_member: 0,
            active_member: BOND_MEMBER_NONE,
            extra_macs: Vec::new(),
        }
    }
}

fn bond_ref(ctl: &Control, id: u16) -> Result<&BondInfo> {
    Ok(iface_info_bond(ctl.ifaces.from_id(id).ok_or(Errno::ENODEV)?))
}

fn bond_mut(ctl: &mut Control, id: u16) -> Result<&mut BondInfo> {
    Ok(iface_info_bond_mut(ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?))
}

fn members_of(ctl: &Control, id: u16) -> Result<Vec<u16>> {
    Ok(bond_ref(ctl, id)?.members.clone())
}

fn bond_all_member_mac(ctl: &mut Control, members: &[u16], mac: &EthAddr, add: bool) -> Result<()> {
    for &member in members {
        let ret = if add {
            iface_add_eth_addr(ctl, member, mac)
        } else {
            iface_del_eth_addr(ctl, member, mac)
        };
        if let Err(err) = ret {
            return Err(errno_log(err, if add { "add member mac" } else { "del member mac" }));
        }
    }
    Ok(())
}

fn bond_mac_add(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let members = members_of(ctl, id)?;
    bond_all_member_mac(ctl, &members, mac, true)?;
    bond_mut(ctl, id)?.extra_macs.push(*mac);
    Ok(())
}

fn bond_mac_del(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let members = members_of(ctl, id)?;
    // best-effort on the members, the address may already be gone
    let _ = bond_all_member_mac(ctl, &members, mac, false);
    let bond = bond_mut(ctl, id)?;
    if let Some(pos) = bond.extra_macs.iter().position(|m| m == mac) {
        bond.extra_macs.remove(pos);
    }
    Ok(())
}

fn bond_mac_set(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let members = members_of(ctl, id)?;
    let old = bond_ref(ctl, id)?.mac;
    bond_all_member_mac(ctl, &members, &old, false)?;
    bond_all_member_mac(ctl, &members, mac, true)?;
    bond_mut(ctl, id)?.mac = *mac;
    Ok(())
}

fn bond_mac_get(ctl: &Control, id: u16) -> Result<EthAddr> {
    Ok(bond_ref(ctl, id)?.mac)
}

/// MTU 0 means "inherit from members": the first member with a set MTU
/// wins and is applied to the bond itself.
fn bond_mtu_set(ctl: &mut Control, id: u16, mtu: u16) -> Result<()> {
    let members = members_of(ctl, id)?;
    let mut mtu = mtu;
    for &member in &members {
        let member_mtu = ctl.ifaces.from_id(member).ok_or(Errno::ENODEV)?.mtu;
        if mtu == 0 && member_mtu != 0 {
            mtu = member_mtu;
        } else {
            iface_set_mtu(ctl, member, mtu)?;
        }
    }
    ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?.mtu = mtu;
    Ok(())
}

fn bond_all_members_flag(
    ctl: &mut Control,
    id: u16,
    flag: u16,
    enabled: bool,
    func: fn(&mut Control, u16, bool) -> Result<()>,
) -> Result<()> {
    let members = members_of(ctl, id)?;
    for &member in &members {
        func(ctl, member, enabled)?;
    }
    let iface = ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?;
    if enabled {
        iface.flags |= flag;
    } else {
        iface.flags &= !flag;
    }
    Ok(())
}

fn bond_promisc_set(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    bond_all_members_flag(ctl, id, grout_api::infra::IFACE_F_PROMISC, enabled, iface_set_promisc)
}

fn bond_allmulti_set(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    bond_all_members_flag(ctl, id, grout_api::infra::IFACE_F_ALLMULTI, enabled, iface_set_allmulti)
}

fn bond_up_down(ctl: &mut Control, id: u16, up: bool) -> Result<()> {
    bond_all_members_flag(ctl, id, IFACE_F_UP, up, iface_set_up_down)
}

fn bond_vlan_add(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    let members = members_of(ctl, id)?;
    for &member in &members {
        iface_add_vlan(ctl, member, vlan_id)?;
    }
    Ok(())
}

fn bond_vlan_del(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    let members = members_of(ctl, id)?;
    for &member in &members {
        iface_del_vlan(ctl, member, vlan_id)?;
    }
    Ok(())
}

/// Enrol members of `new_ids` that are not yet in the bond: check they are
/// ports, propagate every extra MAC, set the back-link. A failure leaves
/// the members enrolled so far in place for a retry.
fn bond_init_new_members(ctl: &mut Control, bond_id: u16, new_ids: &[u16]) -> Result<()> {
    let bond_name = ctl.ifaces.from_id(bond_id).ok_or(Errno::ENODEV)?.name.clone();
    let current = members_of(ctl, bond_id)?;
    let extra_macs = bond_ref(ctl, bond_id)?.extra_macs.clone();

    for &member_id in new_ids {
        let member = ctl.ifaces.from_id(member_id).ok_or(Errno::ENODEV)?;
        if member.type_id != IFACE_TYPE_PORT {
            return Err(Errno::EMEDIUMTYPE);
        }
        let member_name = member.name.clone();
        if current.contains(&member_id) {
            continue;
        }

        log_debug!("adding {} to bond {}", member_name, bond_name);
        for mac in &extra_macs {
            if let Err(err) = iface_add_eth_addr(ctl, member_id, mac) {
                log_err!(
                    "failed to configure mac address on member {}: {}",
                    member_name,
                    err.desc()
                );
                return Err(err);
            }
        }

        if let Some(member) = ctl.ifaces.from_id_mut(member_id) {
            iface_info_port_mut(member).bond_iface_id = bond_id;
        }
    }

    Ok(())
}

/// Unenrol current members missing from `new_ids`: unconfigure extra MACs
/// (best-effort, the port may no longer support it) and clear back-links.
fn bond_fini_old_members(ctl: &mut Control, bond_id: u16, new_ids: &[u16]) {
    let Some(bond_name) = ctl.ifaces.from_id(bond_id).map(|b| b.name.clone()) else {
        return;
    };
    let Ok(current) = members_of(ctl, bond_id) else {
        return;
    };
    let extra_macs = match bond_ref(ctl, bond_id) {
        Ok(bond) => bond.extra_macs.clone(),
        Err(_) => return,
    };

    for &member_id in &current {
        if new_ids.contains(&member_id) {
            continue;
        }
        let Some(member) = ctl.ifaces.from_id(member_id) else {
            continue;
        };
        let member_name = member.name.clone();

        log_debug!("removing {} from bond {}", member_name, bond_name);
        for mac in &extra_macs {
            match iface_del_eth_addr(ctl, member_id, mac) {
                Err(err) if err != Errno::ENOTSUP => log_warning!(
                    "failed to unconfigure mac address on member {}: {}",
                    member_name,
                    err.desc()
                ),
                _ => {}
            }
        }

        if let Some(member) = ctl.ifaces.from_id_mut(member_id) {
            iface_info_port_mut(member).bond_iface_id = IFACE_ID_UNDEF;
        }
    }
}

/// Re-run active member selection.
///
/// ACTIVE_BACKUP: the first member with `UP` and `RUNNING` wins, except
/// that an eligible primary always wins the tie. The chosen member's MAC
/// is read before any state is touched, then all state is updated in one
/// pass: bond MAC, exactly one ACTIVE bit, `active_member` index.
pub(crate) fn bond_set_active_members(ctl: &mut Control, bond_id: u16) -> Result<()> {
    let bond_name = ctl.ifaces.from_id(bond_id).ok_or(Errno::ENODEV)?.name.clone();
    let bond = bond_ref(ctl, bond_id)?;
    let mode = bond.mode;
    let primary = bond.primary_member;
    let members = bond.members.clone();

    match mode {
        BOND_MODE_ACTIVE_BACKUP => {
            let mut active = BOND_MEMBER_NONE;
            for (i, &member_id) in members.iter().enumerate() {
                let Some(member) = ctl.ifaces.from_id(member_id) else {
                    continue;
                };
                if member.flags & IFACE_F_UP != 0
                    && member.state & IFACE_S_RUNNING != 0
                    && (active == BOND_MEMBER_NONE || i as u8 == primary)
                {
                    active = i as u8;
                }
            }

            // Get the MAC address before updating any state
            let mut new_mac = EthAddr::ZERO;
            if active != BOND_MEMBER_NONE {
                new_mac = iface_get_eth_addr(ctl, members[active as usize])?;
            }

            for (i, &member_id) in members.iter().enumerate() {
                if i as u8 == active {
                    bond_mut(ctl, bond_id)?.mac = new_mac;
                    if let Some(member) = ctl.ifaces.from_id_mut(member_id) {
                        member.state |= IFACE_S_ACTIVE;
                        let member_name = member.name.clone();
                        log_info!("bond {} active member is now {}", bond_name, member_name);
                    }
                } else if let Some(member) = ctl.ifaces.from_id_mut(member_id) {
                    member.state &= !IFACE_S_ACTIVE;
                }
            }
            bond_mut(ctl, bond_id)?.active_member = active;
        }
        _ => return Err(Errno::EINVAL),
    }

    Ok(())
}

fn bond_reconfig(
    ctl: &mut Control,
    id: u16,
    set_attrs: u64,
    _conf: &ApiIfaceBase,
    info: &[u8],
) -> Result<()> {
    let api: ApiIfaceInfoBond = from_bytes(info)?;
    let reconfig = set_attrs != IFACE_SET_ALL;

    if set_attrs & BOND_SET_MAC != 0 && reconfig {
        // drop the old MAC from the members first, best-effort
        let members = members_of(ctl, id)?;
        let old = bond_ref(ctl, id)?.mac;
        let _ = bond_all_member_mac(ctl, &members, &old, false);
    }

    if set_attrs & BOND_SET_MODE != 0 {
        if api.mode != BOND_MODE_ACTIVE_BACKUP {
            return Err(Errno::EINVAL);
        }
        bond_mut(ctl, id)?.mode = api.mode;
    }

    if set_attrs & BOND_SET_MEMBERS != 0 {
        let n_members = api.n_members as usize;
        if n_members > BOND_MEMBERS_MAX {
            return Err(Errno::ERANGE);
        }
        let new_ids = &api.member_iface_ids[..n_members];

        bond_init_new_members(ctl, id, new_ids)?;
        bond_fini_old_members(ctl, id, new_ids);
        bond_mut(ctl, id)?.members = new_ids.to_vec();
    }

    if set_attrs & BOND_SET_PRIMARY != 0 {
        if api.primary_member as usize >= bond_ref(ctl, id)?.members.len() {
            return Err(Errno::ERANGE);
        }
        bond_mut(ctl, id)?.primary_member = api.primary_member;
    }

    // Re-evaluate the active member if members or primary changed
    if set_attrs & (BOND_SET_MEMBERS | BOND_SET_PRIMARY) != 0 {
        bond_set_active_members(ctl, id)?;
    }

    if set_attrs & BOND_SET_MAC != 0 && !api.mac.is_zero() {
        let members = members_of(ctl, id)?;
        bond_all_member_mac(ctl, &members, &api.mac, true)?;
        bond_mut(ctl, id)?.mac = api.mac;
    }

    Ok(())
}

fn bond_init(ctl: &mut Control, id: u16, info: &[u8]) -> Result<()> {
    {
        let iface = ctl.ifaces.from_id_mut(id).ok_or(Errno::ENODEV)?;
        iface.info = IfaceInfo::Bond(BondInfo::default());
    }
    let conf = iface_to_api_base(ctl.ifaces.from_id(id).ok_or(Errno::ENODEV)?);
    if let Err(err) = bond_reconfig(ctl, id, IFACE_SET_ALL, &conf, info) {
        // The record is about to be released. The membership list was never
        // committed, so scan for ports the failed enrolment already claimed
        // and release their back-links.
        let claimed: Vec<u16> = ctl
            .ifaces
            .iter()
            .filter(|iface| {
                iface.type_id == IFACE_TYPE_PORT && iface_info_port(iface).bond_iface_id == id
            })
            .map(|iface| iface.id)
            .collect();
        for member_id in claimed {
            if let Some(member) = ctl.ifaces.from_id_mut(member_id) {
                iface_info_port_mut(member).bond_iface_id = IFACE_ID_UNDEF;
            }
        }
        return Err(err);
    }
    Ok(())
}

fn bond_fini(ctl: &mut Control, id: u16) {
    bond_fini_old_members(ctl, id, &[]);
}

fn bond_to_api(_ctl: &Control, iface: &Iface, out: &mut [u8]) {
    let bond = iface_info_bond(iface);
    let mut api = ApiIfaceInfoBond {
        mode: bond.mode,
        mac: bond.mac,
        n_members: bond.members.len() as u8,
        primary_member: bond.primary_member,
        active_member: bond.active_member,
        ..ApiIfaceInfoBond::default()
    };
    for (i, &member_id) in bond.members.iter().enumerate() {
        api.member_iface_ids[i] = member_id;
    }
    let bytes = pod_bytes(&api);
    out[..bytes.len()].copy_from_slice(bytes);
}

const IFACE_TYPE: IfaceType = IfaceType {
    init: Some(bond_init),
    reconfig: Some(bond_reconfig),
    fini: Some(bond_fini),
    get_eth_addr: Some(bond_mac_get),
    set_eth_addr: Some(bond_mac_set),
    add_eth_addr: Some(bond_mac_add),
    del_eth_addr: Some(bond_mac_del),
    set_mtu: Some(bond_mtu_set),
    set_promisc: Some(bond_promisc_set),
    set_allmulti: Some(bond_allmulti_set),
    set_up_down: Some(bond_up_down),
    add_vlan: Some(bond_vlan_add),
    del_vlan: Some(bond_vlan_del),
    to_api: Some(bond_to_api),
    ..IfaceType::new(IFACE_TYPE_BOND, "bond")
};

/// Link status changed on some interface: if it is a port enrolled in a
/// bond, re-run that bond's active member selection.
fn bond_event(ctl: &mut Control, _ev_type: EventType, payload: &EventPayload) {
    let EventPayload::Iface(id) = payload else {
        return;
    };
    let Some(iface) = ctl.ifaces.from_id(*id) else {
        return;
    };
    if iface.type_id != IFACE_TYPE_PORT {
        return;
    }
    let bond_id = iface_info_port(iface).bond_iface_id;
    if bond_id == IFACE_ID_UNDEF {
        return;
    }
    if ctl.ifaces.from_id(bond_id).is_none() {
        // stale back-link, the bond is mid-teardown
        return;
    }
    if let Err(err) = bond_set_active_members(ctl, bond_id) {
        log_err!("bond active member selection: {}", err.desc());
    }
}

const BOND_EVENTS: &[EventType] = &[EventType::IfaceStatusUp, EventType::IfaceStatusDown];

pub fn register(ctl: &mut Control) {
    ctl.ifaces.register_type(IFACE_TYPE);
    subscribe(ctl, EventSubscription { callback: bond_event, ev_types: BOND_EVENTS });
    register_module(ctl, Module { init_prio: 3000, fini_prio: 7000, ..Module::empty("bond") });
}
