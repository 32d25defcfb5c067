//! Interface management request handlers.

use grout_core::errno::Errno;

use grout_api::infra::{
    ApiIfaceAddReq, ApiIfaceAddResp, ApiIfaceDelReq, ApiIfaceGetReq, ApiIfaceListReq,
    ApiIfaceListResp, ApiIfaceSetReq, IFACE_ADD, IFACE_DEL, IFACE_GET, IFACE_LIST, IFACE_SET,
    IFACE_TYPE_UNDEF, VRF_ID_ALL,
};
use grout_api::wire::{from_bytes, push_pod};

use crate::api::{ApiHandler, ApiResult};
use crate::Control;

use super::{iface_create, iface_destroy, iface_reconfig, iface_to_api};

fn iface_add(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiIfaceAddReq = from_bytes(payload)?;
    let iface_id = iface_create(ctl, &req.iface, &req.info)?;
    let mut out = Vec::new();
    push_pod(&mut out, &ApiIfaceAddResp { iface_id });
    Ok(out)
}

fn iface_del(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiIfaceDelReq = from_bytes(payload)?;
    iface_destroy(ctl, req.iface_id)?;
    Ok(Vec::new())
}

fn iface_set(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiIfaceSetReq = from_bytes(payload)?;
    iface_reconfig(ctl, req.iface.id, req.set_attrs, &req.iface, &req.info)?;
    Ok(Vec::new())
}

fn iface_get(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiIfaceGetReq = from_bytes(payload)?;
    let iface = ctl.ifaces.from_id(req.iface_id).ok_or(Errno::ENODEV)?;
    let mut out = Vec::new();
    push_pod(&mut out, &iface_to_api(ctl, iface));
    Ok(out)
}

fn iface_list(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiIfaceListReq = from_bytes(payload)?;

    let matching: Vec<_> = ctl
        .ifaces
        .iter()
        .filter(|iface| req.type_id == IFACE_TYPE_UNDEF || iface.type_id == req.type_id)
        .filter(|iface| req.vrf_id == VRF_ID_ALL || iface.vrf_id == req.vrf_id)
        .collect();

    let n_ifaces = u16::try_from(matching.len()).map_err(|_| Errno::EOVERFLOW)?;
    let mut out = Vec::new();
    push_pod(&mut out, &ApiIfaceListResp { n_ifaces });
    for iface in matching {
        push_pod(&mut out, &iface_to_api(ctl, iface));
    }
    Ok(out)
}

pub(super) const HANDLERS: [ApiHandler; 5] = [
    ApiHandler { request_type: IFACE_ADD, name: "iface add", callback: iface_add },
    ApiHandler { request_type: IFACE_DEL, name: "iface del", callback: iface_del },
    ApiHandler { request_type: IFACE_SET, name: "iface set", callback: iface_set },
    ApiHandler { request_type: IFACE_GET, name: "iface get", callback: iface_get },
    ApiHandler { request_type: IFACE_LIST, name: "iface list", callback: iface_list },
];
