//! Static destination NAT for IPv4.
//!
//! The exemplar API client module: it owns no interfaces, it only consumes
//! the dispatch and interface lookups. A rule rewrites the destination of
//! packets entering an interface; the reverse (source) mapping is kept in
//! a second table so replies can be translated back, and both tables must
//! stay consistent: an add that lands in the forward table but cannot take
//! the reverse slot is rolled back before the error is returned.

use std::collections::HashMap;

use grout_core::errno::{Errno, Result};

use grout_api::infra::VRF_ID_ALL;
use grout_api::ip::{
    Dnat44AddReq, Dnat44DelReq, Dnat44ListReq, Dnat44ListResp, Dnat44Rule, DNAT44_ADD,
    DNAT44_DEL, DNAT44_LIST,
};
use grout_api::wire::{from_bytes, push_pod};

use crate::api::{register_api_handler, ApiHandler, ApiResult};
use crate::module::{register_module, Module};
use crate::Control;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dnat44Entry {
    iface_id: u16,
    vrf_id: u16,
    match_ip: u32,
    replace: u32,
}

/// Forward (destination) and reverse (source) rule tables, keyed within a
/// routing domain.
#[derive(Default)]
pub struct Dnat44State {
    dnat: HashMap<(u16, u32), Dnat44Entry>,
    snat: HashMap<(u16, u32), u32>,
}

impl Dnat44State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dnat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dnat.is_empty()
    }
}

fn vrf_of(ctl: &Control, iface_id: u16) -> Result<u16> {
    Ok(ctl.ifaces.from_id(iface_id).ok_or(Errno::ENODEV)?.vrf_id)
}

fn dnat44_add(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: Dnat44AddReq = from_bytes(payload)?;
    let vrf_id = vrf_of(ctl, req.rule.iface_id)?;

    if let Some(entry) = ctl.dnat44.dnat.get(&(vrf_id, req.rule.match_ip)) {
        if entry.replace != req.rule.replace {
            return Err(Errno::EADDRINUSE);
        }
        if req.exist_ok != 0 {
            return Ok(Vec::new());
        }
        return Err(Errno::EEXIST);
    }

    let entry = Dnat44Entry {
        iface_id: req.rule.iface_id,
        vrf_id,
        match_ip: req.rule.match_ip,
        replace: req.rule.replace,
    };
    ctl.dnat44.dnat.insert((vrf_id, req.rule.match_ip), entry);

    // reverse mapping: one translated source per address and domain
    if ctl.dnat44.snat.contains_key(&(vrf_id, req.rule.replace)) {
        ctl.dnat44.dnat.remove(&(vrf_id, req.rule.match_ip));
        return Err(Errno::EADDRINUSE);
    }
    ctl.dnat44.snat.insert((vrf_id, req.rule.replace), req.rule.match_ip);

    Ok(Vec::new())
}

fn dnat44_del(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: Dnat44DelReq = from_bytes(payload)?;
    let vrf_id = vrf_of(ctl, req.rule.iface_id)?;

    let Some(entry) = ctl.dnat44.dnat.get(&(vrf_id, req.rule.match_ip)).copied() else {
        if req.missing_ok != 0 {
            return Ok(Vec::new());
        }
        return Err(Errno::ENOENT);
    };
    if entry.replace != req.rule.replace {
        return Err(Errno::EADDRINUSE);
    }

    ctl.dnat44.dnat.remove(&(vrf_id, req.rule.match_ip));
    ctl.dnat44.snat.remove(&(vrf_id, entry.replace));

    Ok(Vec::new())
}

fn dnat44_list(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: Dnat44ListReq = from_bytes(payload)?;

    let mut rules: Vec<Dnat44Rule> = ctl
        .dnat44
        .dnat
        .values()
        .filter(|entry| req.vrf_id == VRF_ID_ALL || entry.vrf_id == req.vrf_id)
        .map(|entry| Dnat44Rule {
            iface_id: entry.iface_id,
            _pad: 0,
            match_ip: entry.match_ip,
            replace: entry.replace,
        })
        .collect();
    rules.sort_by_key(|rule| (rule.iface_id, rule.match_ip));

    let n_rules = u16::try_from(rules.len()).map_err(|_| Errno::EOVERFLOW)?;
    let mut out = Vec::new();
    push_pod(&mut out, &Dnat44ListResp { n_rules, _pad: 0 });
    for rule in &rules {
        push_pod(&mut out, rule);
    }
    Ok(out)
}

fn dnat44_fini(ctl: &mut Control) {
    ctl.dnat44.dnat.clear();
    ctl.dnat44.snat.clear();
}

pub fn register(ctl: &mut Control) {
    register_module(
        ctl,
        Module {
            fini: Some(dnat44_fini),
            init_prio: 5000,
            fini_prio: 5000,
            ..Module::empty("dnat44")
        },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: DNAT44_ADD, name: "dnat44 add", callback: dnat44_add },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: DNAT44_DEL, name: "dnat44 del", callback: dnat44_del },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: DNAT44_LIST, name: "dnat44 list", callback: dnat44_list },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::lookup_api_handler;
    use crate::config::Config;
    use crate::iface::iface_create;
    use grout_api::infra::{ApiIfaceBase, IFACE_INFO_MAX, IFACE_TYPE_PORT};
    use grout_api::wire::pod_bytes;
    use grout_core::string::put_name;
    use std::net::Ipv4Addr;

    fn boot_with_port() -> (Control, u16) {
        let mut ctl = crate::boot(Config::default());
        let mut base = ApiIfaceBase { type_id: IFACE_TYPE_PORT, ..ApiIfaceBase::default() };
        put_name(&mut base.name, "p0").unwrap();
        let id = iface_create(&mut ctl, &base, &[0u8; IFACE_INFO_MAX]).unwrap();
        (ctl, id)
    }

    fn call(ctl: &mut Control, req_type: u32, payload: &[u8]) -> ApiResult {
        let handler = *lookup_api_handler(ctl, req_type).unwrap();
        (handler.callback)(ctl, payload)
    }

    fn rule(iface_id: u16, match_ip: Ipv4Addr, replace: Ipv4Addr) -> Dnat44Rule {
        Dnat44Rule {
            iface_id,
            _pad: 0,
            match_ip: u32::from(match_ip),
            replace: u32::from(replace),
        }
    }

    #[test]
    fn test_idempotent_add() {
        let (mut ctl, port) = boot_with_port();
        let r = rule(port, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 1));
        let add = Dnat44AddReq { rule: r, exist_ok: 1, _pad: [0; 3] };

        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)).is_ok());
        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)).is_ok());

        // same match, different replacement
        let conflict = Dnat44AddReq {
            rule: rule(port, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 2)),
            exist_ok: 1,
            _pad: [0; 3],
        };
        assert_eq!(call(&mut ctl, DNAT44_ADD, pod_bytes(&conflict)), Err(Errno::EADDRINUSE));
    }

    #[test]
    fn test_add_without_exist_ok() {
        let (mut ctl, port) = boot_with_port();
        let add = Dnat44AddReq {
            rule: rule(port, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 3)),
            exist_ok: 0,
            _pad: [0; 3],
        };
        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)).is_ok());
        assert_eq!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)), Err(Errno::EEXIST));
    }

    #[test]
    fn test_reverse_conflict_rolls_back() {
        let (mut ctl, port) = boot_with_port();
        let first = Dnat44AddReq {
            rule: rule(port, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 1)),
            exist_ok: 0,
            _pad: [0; 3],
        };
        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&first)).is_ok());

        // different match, same replacement: reverse table refuses
        let second = Dnat44AddReq {
            rule: rule(port, Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(192, 168, 1, 1)),
            exist_ok: 0,
            _pad: [0; 3],
        };
        assert_eq!(call(&mut ctl, DNAT44_ADD, pod_bytes(&second)), Err(Errno::EADDRINUSE));
        // the forward half of the failed add must not linger
        assert_eq!(ctl.dnat44.len(), 1);
        assert!(!ctl.dnat44.dnat.contains_key(&(0, u32::from(Ipv4Addr::new(10, 0, 0, 9)))));
    }

    #[test]
    fn test_idempotent_del() {
        let (mut ctl, port) = boot_with_port();
        let r = rule(port, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 1));
        let add = Dnat44AddReq { rule: r, exist_ok: 0, _pad: [0; 3] };
        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)).is_ok());

        let del = Dnat44DelReq { rule: r, missing_ok: 1, _pad: [0; 3] };
        assert!(call(&mut ctl, DNAT44_DEL, pod_bytes(&del)).is_ok());
        assert!(call(&mut ctl, DNAT44_DEL, pod_bytes(&del)).is_ok());

        let strict = Dnat44DelReq { rule: r, missing_ok: 0, _pad: [0; 3] };
        assert_eq!(call(&mut ctl, DNAT44_DEL, pod_bytes(&strict)), Err(Errno::ENOENT));
        assert!(ctl.dnat44.is_empty());
    }

    #[test]
    fn test_unknown_iface() {
        let (mut ctl, _) = boot_with_port();
        let add = Dnat44AddReq {
            rule: rule(999, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 1)),
            exist_ok: 0,
            _pad: [0; 3],
        };
        assert_eq!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)), Err(Errno::ENODEV));
    }

    #[test]
    fn test_list_filters_by_vrf() {
        let (mut ctl, port) = boot_with_port();
        let add = Dnat44AddReq {
            rule: rule(port, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 1)),
            exist_ok: 0,
            _pad: [0; 3],
        };
        assert!(call(&mut ctl, DNAT44_ADD, pod_bytes(&add)).is_ok());

        let list = Dnat44ListReq { vrf_id: VRF_ID_ALL, _pad: 0 };
        let out = call(&mut ctl, DNAT44_LIST, pod_bytes(&list)).unwrap();
        let resp: Dnat44ListResp = from_bytes(&out).unwrap();
        assert_eq!(resp.n_rules, 1);
        let entry: Dnat44Rule = from_bytes(&out[std::mem::size_of::<Dnat44ListResp>()..]).unwrap();
        assert_eq!(entry.match_ip, u32::from(Ipv4Addr::new(10, 0, 0, 1)));

        // port is in vrf 0; another domain sees nothing
        let list = Dnat44ListReq { vrf_id: 7, _pad: 0 };
        let out = call(&mut ctl, DNAT44_LIST, pod_bytes(&list)).unwrap();
        let resp: Dnat44ListResp = from_bytes(&out).unwrap();
        assert_eq!(resp.n_rules, 0);
    }
}
