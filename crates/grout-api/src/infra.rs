//! Interface management payloads (`infra` module).

use crate::frame::req_type;
use crate::net::EthAddr;
use crate::wire::Pod;

pub const INFRA_MODULE: u16 = 0x000a;

pub const IFACE_ADD: u32 = req_type(INFRA_MODULE, 0x0001);
pub const IFACE_DEL: u32 = req_type(INFRA_MODULE, 0x0002);
pub const IFACE_SET: u32 = req_type(INFRA_MODULE, 0x0003);
pub const IFACE_GET: u32 = req_type(INFRA_MODULE, 0x0004);
pub const IFACE_LIST: u32 = req_type(INFRA_MODULE, 0x0005);
pub const TRACE_SET: u32 = req_type(INFRA_MODULE, 0x0006);
pub const TRACE_DUMP: u32 = req_type(INFRA_MODULE, 0x0007);
pub const TRACE_CLEAR: u32 = req_type(INFRA_MODULE, 0x0008);

/// Reserved interface id, never allocated.
pub const IFACE_ID_UNDEF: u16 = 0;
/// VRF wildcard, only meaningful in queries.
pub const VRF_ID_ALL: u16 = u16::MAX;
/// Interface name field size, terminator included.
pub const IFACE_NAME_MAX: usize = 64;

// Interface types.
pub const IFACE_TYPE_UNDEF: u16 = 0x0000;
pub const IFACE_TYPE_PORT: u16 = 0x0001;
pub const IFACE_TYPE_LOOPBACK: u16 = 0x0002;
pub const IFACE_TYPE_BOND: u16 = 0x0003;

// Configuration flags (client writable).
pub const IFACE_F_UP: u16 = 1 << 0;
pub const IFACE_F_PROMISC: u16 = 1 << 1;
pub const IFACE_F_ALLMULTI: u16 = 1 << 2;

// Runtime state bits (owned by the daemon, read-only for clients).
pub const IFACE_S_RUNNING: u16 = 1 << 0;
pub const IFACE_S_ACTIVE: u16 = 1 << 1;

// Attribute mask for partial reconfiguration. Base attributes live in the
// low word, type-specific attributes start at bit 32.
pub const IFACE_SET_NAME: u64 = 1 << 0;
pub const IFACE_SET_FLAGS: u64 = 1 << 1;
pub const IFACE_SET_MTU: u64 = 1 << 2;
pub const IFACE_SET_VRF: u64 = 1 << 3;
pub const IFACE_SET_ALL: u64 = u64::MAX;

const fn iface_type_attr(bit: u32) -> u64 {
    1u64 << (32 + bit)
}

pub const PORT_SET_MAC: u64 = iface_type_attr(0);

pub const BOND_SET_MODE: u64 = iface_type_attr(0);
pub const BOND_SET_MAC: u64 = iface_type_attr(1);
pub const BOND_SET_MEMBERS: u64 = iface_type_attr(2);
pub const BOND_SET_PRIMARY: u64 = iface_type_attr(3);

/// True if any type-specific attribute bit is set.
pub const fn has_type_attrs(set_attrs: u64) -> bool {
    set_attrs != IFACE_SET_ALL && (set_attrs >> 32) != 0
}

pub const BOND_MEMBERS_MAX: usize = 8;
/// "No active member" sentinel for `active_member`.
pub const BOND_MEMBER_NONE: u8 = u8::MAX;

pub const BOND_MODE_ACTIVE_BACKUP: u8 = 0;

/// Type-independent part of an interface, as seen on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiIfaceBase {
    pub id: u16,
    pub type_id: u16,
    pub flags: u16,
    pub state: u16,
    pub mtu: u16,
    pub vrf_id: u16,
    pub name: [u8; IFACE_NAME_MAX],
}

unsafe impl Pod for ApiIfaceBase {}

impl Default for ApiIfaceBase {
    fn default() -> Self {
        Self {
            id: IFACE_ID_UNDEF,
            type_id: IFACE_TYPE_UNDEF,
            flags: 0,
            state: 0,
            mtu: 1500,
            vrf_id: 0,
            name: [0; IFACE_NAME_MAX],
        }
    }
}

/// Size of the type-specific info blob carried next to the base. Each type
/// interprets it as its own `ApiIfaceInfo*` struct; unused tail is zero.
pub const IFACE_INFO_MAX: usize = 64;

/// Full interface projection returned by get/list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIface {
    pub base: ApiIfaceBase,
    pub info: [u8; IFACE_INFO_MAX],
}

unsafe impl Pod for ApiIface {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiIfaceInfoPort {
    pub mac: EthAddr,
    /// Id of the owning bond, `IFACE_ID_UNDEF` when standalone.
    pub bond_iface_id: u16,
}

unsafe impl Pod for ApiIfaceInfoPort {}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiIfaceInfoBond {
    pub mode: u8,
    pub _pad0: u8,
    pub mac: EthAddr,
    pub n_members: u8,
    pub primary_member: u8,
    pub active_member: u8,
    pub _pad1: u8,
    pub member_iface_ids: [u16; BOND_MEMBERS_MAX],
}

unsafe impl Pod for ApiIfaceInfoBond {}

impl Default for ApiIfaceInfoBond {
    fn default() -> Self {
        Self {
            mode: BOND_MODE_ACTIVE_BACKUP,
            _pad0: 0,
            mac: EthAddr::ZERO,
            n_members: 0,
            primary_member: 0,
            active_member: BOND_MEMBER_NONE,
            _pad1: 0,
            member_iface_ids: [IFACE_ID_UNDEF; BOND_MEMBERS_MAX],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceAddReq {
    /// `id` and `state` are ignored, the daemon assigns both.
    pub iface: ApiIfaceBase,
    pub info: [u8; IFACE_INFO_MAX],
}

unsafe impl Pod for ApiIfaceAddReq {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceAddResp {
    pub iface_id: u16,
}

unsafe impl Pod for ApiIfaceAddResp {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceDelReq {
    pub iface_id: u16,
}

unsafe impl Pod for ApiIfaceDelReq {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceSetReq {
    pub set_attrs: u64,
    /// `iface.id` selects the interface; masked fields carry new values.
    pub iface: ApiIfaceBase,
    pub info: [u8; IFACE_INFO_MAX],
    pub _pad: [u8; 4],
}

unsafe impl Pod for ApiIfaceSetReq {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceGetReq {
    pub iface_id: u16,
}

unsafe impl Pod for ApiIfaceGetReq {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceListReq {
    /// `IFACE_TYPE_UNDEF` lists every type.
    pub type_id: u16,
    /// `VRF_ID_ALL` lists every routing domain.
    pub vrf_id: u16,
}

unsafe impl Pod for ApiIfaceListReq {}

/// Followed by `n_ifaces` packed `ApiIface` entries.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiIfaceListResp {
    pub n_ifaces: u16,
}

unsafe impl Pod for ApiIfaceListResp {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiTraceSetReq {
    pub enabled: u8,
}

unsafe impl Pod for ApiTraceSetReq {}

/// Response payload is plain UTF-8 text, one block per traced packet.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApiTraceDumpReq {
    pub max_packets: u16,
}

unsafe impl Pod for ApiTraceDumpReq {}
