//! Interface table and typed dispatch.
//!
//! The table owns every interface record. Per-type behavior goes through
//! an [`IfaceType`] record of optional operations registered once at
//! startup; a missing operation means "not supported" (`ENOTSUP`).
//!
//! Operations take `(&mut Control, iface_id)` rather than `&mut Iface`:
//! aggregate types (bond) mutate sibling interfaces, so cross-references
//! are ids resolved through the table, never stored pointers.

pub mod api;
pub mod bond;
pub mod loopback;
pub mod port;

use grout_core::errno::{Errno, Result};
use grout_core::string::{check_name, put_name};

use grout_api::infra::{
    ApiIfaceBase, IFACE_INFO_MAX, IFACE_NAME_MAX, IFACE_SET_FLAGS, IFACE_SET_MTU,
    IFACE_SET_NAME, IFACE_SET_VRF, IFACE_F_ALLMULTI, IFACE_F_PROMISC, IFACE_F_UP,
    IFACE_ID_UNDEF, IFACE_S_RUNNING,
};
use grout_api::net::EthAddr;
use grout_api::infra as api_infra;

use crate::api::register_api_handler;
use crate::event::{publish, subscribe, EventPayload, EventSubscription, EventType};
use crate::module::{register_module, Module};
use crate::Control;

use self::bond::BondInfo;
use self::loopback::LoopbackInfo;
use self::port::PortInfo;

pub const MAX_IFACES: usize = 1024;

/// Type-specific private state.
#[derive(Debug)]
pub enum IfaceInfo {
    None,
    Port(PortInfo),
    Bond(BondInfo),
    Loopback(LoopbackInfo),
}

#[derive(Debug)]
pub struct Iface {
    pub id: u16,
    pub name: String,
    pub type_id: u16,
    pub vrf_id: u16,
    pub mtu: u16,
    pub flags: u16,
    /// Runtime condition bits, written only by event handlers and the
    /// subsystems reacting to them.
    pub state: u16,
    pub info: IfaceInfo,
}

/// Checked projection: the port view of an interface.
pub fn iface_info_port(iface: &Iface) -> &PortInfo {
    match &iface.info {
        IfaceInfo::Port(port) => port,
        _ => panic!("iface '{}' is not a port", iface.name),
    }
}

pub fn iface_info_port_mut(iface: &mut Iface) -> &mut PortInfo {
    match &mut iface.info {
        IfaceInfo::Port(port) => port,
        _ => panic!("iface '{}' is not a port", iface.name),
    }
}

/// Checked projection: the bond view of an interface.
pub fn iface_info_bond(iface: &Iface) -> &BondInfo {
    match &iface.info {
        IfaceInfo::Bond(bond) => bond,
        _ => panic!("iface '{}' is not a bond", iface.name),
    }
}

pub fn iface_info_bond_mut(iface: &mut Iface) -> &mut BondInfo {
    match &mut iface.info {
        IfaceInfo::Bond(bond) => bond,
        _ => panic!("iface '{}' is not a bond", iface.name),
    }
}

/// Per-type operations. Any of them may be absent; the generic dispatch
/// helpers map absence to `ENOTSUP`.
#[derive(Clone, Copy)]
pub struct IfaceType {
    pub id: u16,
    pub name: &'static str,
    pub init: Option<fn(&mut Control, u16, &[u8]) -> Result<()>>,
    pub reconfig: Option<fn(&mut Control, u16, u64, &ApiIfaceBase, &[u8]) -> Result<()>>,
    pub fini: Option<fn(&mut Control, u16)>,
    pub get_eth_addr: Option<fn(&Control, u16) -> Result<EthAddr>>,
    pub set_eth_addr: Option<fn(&mut Control, u16, &EthAddr) -> Result<()>>,
    pub add_eth_addr: Option<fn(&mut Control, u16, &EthAddr) -> Result<()>>,
    pub del_eth_addr: Option<fn(&mut Control, u16, &EthAddr) -> Result<()>>,
    pub set_mtu: Option<fn(&mut Control, u16, u16) -> Result<()>>,
    pub set_promisc: Option<fn(&mut Control, u16, bool) -> Result<()>>,
    pub set_allmulti: Option<fn(&mut Control, u16, bool) -> Result<()>>,
    pub set_up_down: Option<fn(&mut Control, u16, bool) -> Result<()>>,
    pub add_vlan: Option<fn(&mut Control, u16, u16) -> Result<()>>,
    pub del_vlan: Option<fn(&mut Control, u16, u16) -> Result<()>>,
    pub to_api: Option<fn(&Control, &Iface, &mut [u8])>,
}

impl IfaceType {
    pub const fn new(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            init: None,
            reconfig: None,
            fini: None,
            get_eth_addr: None,
            set_eth_addr: None,
            add_eth_addr: None,
            del_eth_addr: None,
            set_mtu: None,
            set_promisc: None,
            set_allmulti: None,
            set_up_down: None,
            add_vlan: None,
            del_vlan: None,
            to_api: None,
        }
    }
}

pub struct IfaceTable {
    slots: Vec<Option<Iface>>,
    types: Vec<IfaceType>,
    next_id: u16,
}

impl Default for IfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IfaceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_IFACES).map(|_| None).collect(),
            types: Vec::new(),
            next_id: 1,
        }
    }

    /// Register a type exactly once; a duplicate id is a programming error.
    pub fn register_type(&mut self, ty: IfaceType) {
        if self.types.iter().any(|t| t.id == ty.id) {
            panic!("duplicate iface type 0x{:04x} '{}'", ty.id, ty.name);
        }
        self.types.push(ty);
    }

    pub fn type_of(&self, type_id: u16) -> Option<&IfaceType> {
        self.types.iter().find(|t| t.id == type_id)
    }

    /// Type record of a live interface. The table never holds an interface
    /// whose type is unregistered, so a miss is a corrupted table.
    fn ty(&self, type_id: u16) -> IfaceType {
        *self
            .type_of(type_id)
            .unwrap_or_else(|| panic!("iface type 0x{:04x} not registered", type_id))
    }

    pub fn from_id(&self, id: u16) -> Option<&Iface> {
        if id == IFACE_ID_UNDEF || id as usize >= MAX_IFACES {
            return None;
        }
        self.slots[id as usize].as_ref()
    }

    pub fn from_id_mut(&mut self, id: u16) -> Option<&mut Iface> {
        if id == IFACE_ID_UNDEF || id as usize >= MAX_IFACES {
            return None;
        }
        self.slots[id as usize].as_mut()
    }

    pub fn from_name(&self, name: &str) -> Option<&Iface> {
        self.iter().find(|iface| iface.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Iface> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    fn alloc_id(&mut self) -> Result<u16> {
        // Wrap-around scan starting after the last allocation so freed ids
        // are not reused immediately.
        let start = self.next_id as usize;
        for off in 0..MAX_IFACES - 1 {
            let id = 1 + (start - 1 + off) % (MAX_IFACES - 1);
            if self.slots[id].is_none() {
                self.next_id = 1 + (id as u16) % (MAX_IFACES as u16 - 1);
                return Ok(id as u16);
            }
        }
        Err(Errno::ENOSPC)
    }

    fn insert(&mut self, mut iface: Iface) -> Result<u16> {
        let id = self.alloc_id()?;
        iface.id = id;
        self.slots[id as usize] = Some(iface);
        Ok(id)
    }

    fn remove(&mut self, id: u16) {
        self.slots[id as usize] = None;
    }
}

/// Create an interface from an API configuration. Emits `IfaceAdded` on
/// success and nothing on failure (the slot is released).
pub fn iface_create(ctl: &mut Control, conf: &ApiIfaceBase, info: &[u8]) -> Result<u16> {
    let name = check_name(&conf.name, IFACE_NAME_MAX)?.to_string();
    if ctl.ifaces.from_name(&name).is_some() {
        return Err(Errno::EEXIST);
    }
    let ty = *ctl.ifaces.type_of(conf.type_id).ok_or(Errno::EINVAL)?;

    let id = ctl.ifaces.insert(Iface {
        id: IFACE_ID_UNDEF,
        name,
        type_id: conf.type_id,
        vrf_id: conf.vrf_id,
        mtu: conf.mtu,
        flags: conf.flags,
        state: 0,
        info: IfaceInfo::None,
    })?;

    if let Some(init) = ty.init {
        if let Err(err) = init(ctl, id, info) {
            ctl.ifaces.remove(id);
            return Err(err);
        }
    }

    publish(ctl, EventType::IfaceAdded, &EventPayload::Iface(id));
    Ok(id)
}

/// Apply a partial update selected by `set_attrs`. Base attributes are
/// handled here, type attributes are delegated to the type's `reconfig`.
/// Emits `IfaceReconfigured` once on success.
pub fn iface_reconfig(
    ctl: &mut Control,
    id: u16,
    set_attrs: u64,
    conf: &ApiIfaceBase,
    info: &[u8],
) -> Result<()> {
    let iface = ctl.ifaces.from_id(id).ok_or(Errno::ENODEV)?;
    let ty = ctl.ifaces.ty(iface.type_id);
    let cur_flags = iface.flags;

    if set_attrs & IFACE_SET_NAME != 0 {
        let name = check_name(&conf.name, IFACE_NAME_MAX)?.to_string();
        if let Some(other) = ctl.ifaces.from_name(&name) {
            if other.id != id {
                return Err(Errno::EEXIST);
            }
        }
        if let Some(iface) = ctl.ifaces.from_id_mut(id) {
            iface.name = name;
        }
    }
    if set_attrs & IFACE_SET_VRF != 0 {
        if let Some(iface) = ctl.ifaces.from_id_mut(id) {
            iface.vrf_id = conf.vrf_id;
        }
    }
    if set_attrs & IFACE_SET_MTU != 0 {
        iface_set_mtu(ctl, id, conf.mtu)?;
    }
    if set_attrs & IFACE_SET_FLAGS != 0 {
        let diff = cur_flags ^ conf.flags;
        if diff & IFACE_F_UP != 0 {
            iface_set_up_down(ctl, id, conf.flags & IFACE_F_UP != 0)?;
        }
        if diff & IFACE_F_PROMISC != 0 {
            iface_set_promisc(ctl, id, conf.flags & IFACE_F_PROMISC != 0)?;
        }
        if diff & IFACE_F_ALLMULTI != 0 {
            iface_set_allmulti(ctl, id, conf.flags & IFACE_F_ALLMULTI != 0)?;
        }
    }
    if api_infra::has_type_attrs(set_attrs) {
        let reconfig = ty.reconfig.ok_or(Errno::ENOTSUP)?;
        reconfig(ctl, id, set_attrs, conf, info)?;
    }

    publish(ctl, EventType::IfaceReconfigured, &EventPayload::Iface(id));
    Ok(())
}

/// Destroy an interface. A port still enrolled in a bond is busy.
/// Emits `IfaceDeleted` after the type teardown, then frees the record.
pub fn iface_destroy(ctl: &mut Control, id: u16) -> Result<()> {
    let iface = ctl.ifaces.from_id(id).ok_or(Errno::ENODEV)?;
    if let IfaceInfo::Port(port) = &iface.info {
        if port.bond_iface_id != IFACE_ID_UNDEF {
            return Err(Errno::EBUSY);
        }
    }
    let ty = ctl.ifaces.ty(iface.type_id);
    if let Some(fini) = ty.fini {
        fini(ctl, id);
    }
    publish(ctl, EventType::IfaceDeleted, &EventPayload::Iface(id));
    ctl.ifaces.remove(id);
    Ok(())
}

/// Full API projection of one interface.
pub fn iface_to_api(ctl: &Control, iface: &Iface) -> grout_api::infra::ApiIface {
    let mut base = iface_to_api_base(iface);
    base.id = iface.id;
    let mut info = [0u8; IFACE_INFO_MAX];
    if let Some(to_api) = ctl.ifaces.ty(iface.type_id).to_api {
        to_api(ctl, iface, &mut info);
    }
    grout_api::infra::ApiIface { base, info }
}

pub fn iface_to_api_base(iface: &Iface) -> ApiIfaceBase {
    let mut base = ApiIfaceBase {
        id: iface.id,
        type_id: iface.type_id,
        flags: iface.flags,
        state: iface.state,
        mtu: iface.mtu,
        vrf_id: iface.vrf_id,
        name: [0; IFACE_NAME_MAX],
    };
    // Names in the table were validated against the same limit.
    put_name(&mut base.name, &iface.name).expect("stored iface name fits the wire field");
    base
}

macro_rules! dispatch {
    ($ctl:expr, $id:expr, $op:ident) => {{
        let iface = $ctl.ifaces.from_id($id).ok_or(Errno::ENODEV)?;
        $ctl.ifaces.ty(iface.type_id).$op.ok_or(Errno::ENOTSUP)?
    }};
}

pub fn iface_get_eth_addr(ctl: &Control, id: u16) -> Result<EthAddr> {
    let op = dispatch!(ctl, id, get_eth_addr);
    op(ctl, id)
}

pub fn iface_set_eth_addr(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let op = dispatch!(ctl, id, set_eth_addr);
    op(ctl, id, mac)
}

pub fn iface_add_eth_addr(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let op = dispatch!(ctl, id, add_eth_addr);
    op(ctl, id, mac)
}

pub fn iface_del_eth_addr(ctl: &mut Control, id: u16, mac: &EthAddr) -> Result<()> {
    let op = dispatch!(ctl, id, del_eth_addr);
    op(ctl, id, mac)
}

pub fn iface_set_mtu(ctl: &mut Control, id: u16, mtu: u16) -> Result<()> {
    let op = dispatch!(ctl, id, set_mtu);
    op(ctl, id, mtu)
}

pub fn iface_set_promisc(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    let op = dispatch!(ctl, id, set_promisc);
    op(ctl, id, enabled)
}

pub fn iface_set_allmulti(ctl: &mut Control, id: u16, enabled: bool) -> Result<()> {
    let op = dispatch!(ctl, id, set_allmulti);
    op(ctl, id, enabled)
}

pub fn iface_set_up_down(ctl: &mut Control, id: u16, up: bool) -> Result<()> {
    let op = dispatch!(ctl, id, set_up_down);
    op(ctl, id, up)
}

pub fn iface_add_vlan(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    let op = dispatch!(ctl, id, add_vlan);
    op(ctl, id, vlan_id)
}

pub fn iface_del_vlan(ctl: &mut Control, id: u16, vlan_id: u16) -> Result<()> {
    let op = dispatch!(ctl, id, del_vlan);
    op(ctl, id, vlan_id)
}

/// Keep `IFACE_S_RUNNING` in sync with link status events. This is the
/// only writer of that bit, so subscribing it first means later
/// subscribers (bond) observe the updated state.
fn iface_status_event(ctl: &mut Control, ev_type: EventType, payload: &EventPayload) {
    let EventPayload::Iface(id) = payload else {
        return;
    };
    if let Some(iface) = ctl.ifaces.from_id_mut(*id) {
        match ev_type {
            EventType::IfaceStatusUp => iface.state |= IFACE_S_RUNNING,
            EventType::IfaceStatusDown => iface.state &= !IFACE_S_RUNNING,
            _ => {}
        }
    }
}

const STATUS_EVENTS: &[EventType] = &[EventType::IfaceStatusUp, EventType::IfaceStatusDown];

/// Destroy every remaining interface, aggregates first so member
/// back-links are cleared before their ports go away.
fn iface_fini(ctl: &mut Control) {
    let bonds: Vec<u16> = ctl
        .ifaces
        .iter()
        .filter(|iface| iface.type_id == api_infra::IFACE_TYPE_BOND)
        .map(|iface| iface.id)
        .collect();
    for id in bonds {
        let _ = iface_destroy(ctl, id);
    }
    let rest: Vec<u16> = ctl.ifaces.iter().map(|iface| iface.id).collect();
    for id in rest {
        let _ = iface_destroy(ctl, id);
    }
}

pub fn register(ctl: &mut Control) {
    register_module(
        ctl,
        Module {
            fini: Some(iface_fini),
            init_prio: 1000,
            fini_prio: 9000,
            ..Module::empty("iface")
        },
    );
    subscribe(ctl, EventSubscription { callback: iface_status_event, ev_types: STATUS_EVENTS });
    for handler in api::HANDLERS {
        register_api_handler(ctl, handler);
    }
}
