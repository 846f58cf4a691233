//! The composition engine (spec.md §4.3, component C5).
//!
//! Computes the cross-product program/delete between an Aux's ingress-flow
//! table and tunnel-pop-flow table, with two-phase rollback: tag every
//! counterpart with a transient status, program, then walk again to either
//! commit (`Full` entries stay, refcount bumped) or revert (`Full` deleted,
//! `Failed` orphans freed).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::action::ActionFlags;
use crate::aux::{composed_ufid, CompositionAux, IngressFlow, TnlPopFlow, TransientStatus};
use crate::driver::{Driver, PutInfo};
use crate::flow::FlowHandle;
use crate::netdev::Netdev;
use crate::status::BaseStatus;

/// spec.md §4.3.1: a fresh flow whose actions popped a tunnel is being
/// added to the Aux of the tunnel vport it targets.
pub fn ingress_add(
    flow: FlowHandle,
    in_netdev: Arc<dyn Netdev>,
    tunnel_netdev: Arc<dyn Netdev>,
    aux: &CompositionAux,
    driver: &dyn Driver,
    flags: ActionFlags,
) -> BaseStatus {
    let ufid = flow.ufid();

    if aux.read().ingress.contains_key(&ufid) {
        warn!(ufid = %format_args!("{ufid:032x}"), "ingress flow already present, second producer");
        return BaseStatus::Failed;
    }

    let m = flow.match_descriptor();
    match driver.flow_put(in_netdev.as_ref(), &m, &[], ufid, PutInfo { mark_set: true }) {
        Ok(_) => {
            let _ = driver.flow_del(in_netdev.as_ref(), ufid);
        }
        Err(e) => {
            debug!(ufid = %format_args!("{ufid:032x}"), error = %e, "ingress validate rejected");
            return BaseStatus::Failed;
        }
    }

    let ingress = IngressFlow {
        flow: flow.clone(),
        ingress_netdev: in_netdev,
        action_flags: flags,
        transient_status: TransientStatus::None,
    };

    let outer = ingress.flow.outer_header().unwrap_or_default();
    let mut tables = aux.write();

    for t in tables.tnlpop.values_mut() {
        t.transient_status = TransientStatus::None;
    }

    let mut need_rollback = false;
    let tnlpop_ufids: Vec<_> = tables.tnlpop.keys().copied().collect();
    for t_ufid in &tnlpop_ufids {
        let (t_match, t_actions, composed) = {
            let t = tables.tnlpop.get(t_ufid).unwrap();
            (
                t.flow.match_descriptor().with_outer(outer),
                t.flow.actions(),
                composed_ufid(ufid, *t_ufid),
            )
        };
        let result = driver.flow_put(
            tunnel_netdev.as_ref(),
            &t_match,
            &t_actions,
            composed,
            PutInfo::default(),
        );
        let t = tables.tnlpop.get_mut(t_ufid).unwrap();
        match result {
            Ok(_) => {
                t.ref_count += 1;
                t.transient_status = TransientStatus::Full;
            }
            Err(e) => {
                debug!(composed = %format_args!("{composed:032x}"), error = %e, "compose put rejected");
                need_rollback = true;
                t.transient_status = TransientStatus::Failed;
            }
        }
    }

    if need_rollback {
        for t_ufid in &tnlpop_ufids {
            let entry = tables.tnlpop.get(t_ufid).unwrap();
            match entry.transient_status {
                TransientStatus::Failed => {
                    if entry.ref_count == 0 {
                        entry.flow.status().set_base(BaseStatus::Failed);
                        let removed = tables.tnlpop.remove(t_ufid).unwrap();
                        removed.flow.unref();
                    } else {
                        warn!(
                            ufid = %format_args!("{t_ufid:032x}"),
                            ref_count = entry.ref_count,
                            "tnlpop failed with nonzero refcount, leaving in place"
                        );
                        aux.anomalies.record_tnlpop_anomaly();
                    }
                }
                TransientStatus::Full => {
                    let composed = composed_ufid(ufid, *t_ufid);
                    let _ = driver.flow_del(tunnel_netdev.as_ref(), composed);
                    tables.tnlpop.get_mut(t_ufid).unwrap().ref_count -= 1;
                }
                TransientStatus::None => {}
            }
        }
        return BaseStatus::Failed;
    }

    if !ingress.flow.try_ref() {
        warn!(ufid = %format_args!("{ufid:032x}"), "flow died right before commit, aborting ingress add");
        return BaseStatus::Failed;
    }
    tables.ingress.insert(ufid, ingress);
    BaseStatus::Full
}

/// spec.md §4.3.2: a flow whose match sits on a tunnel vport is added (or
/// modified) against that vport's Aux.
pub fn tnlpop_add_mod(
    flow: FlowHandle,
    tunnel_netdev: Arc<dyn Netdev>,
    aux: &CompositionAux,
    driver: &dyn Driver,
    flags: ActionFlags,
) -> BaseStatus {
    let ufid = flow.ufid();
    let actions = flow.actions();
    let mut tables = aux.write();

    let is_new = match tables.tnlpop.get(&ufid) {
        Some(existing) if !Arc::ptr_eq(&existing.flow, &flow) => {
            warn!(ufid = %format_args!("{ufid:032x}"), "tnlpop flow bound to a different handle, second producer");
            return BaseStatus::Failed;
        }
        Some(_) => false,
        None => true,
    };

    if is_new {
        if !flow.try_ref() {
            warn!(ufid = %format_args!("{ufid:032x}"), "flow died right before tnlpop allocation");
            return BaseStatus::Failed;
        }
        tables.tnlpop.insert(
            ufid,
            TnlPopFlow {
                flow: flow.clone(),
                action_flags: flags,
                ref_count: 0,
                transient_status: TransientStatus::None,
            },
        );
    } else if let Some(t) = tables.tnlpop.get_mut(&ufid) {
        t.action_flags = flags;
    }

    for i in tables.ingress.values_mut() {
        i.transient_status = TransientStatus::None;
    }

    let mut need_rollback = false;
    let ingress_ufids: Vec<_> = tables.ingress.keys().copied().collect();
    let mut ingress_processed = Vec::new();
    for i_ufid in &ingress_ufids {
        let (i_match, composed) = {
            let i = tables.ingress.get(i_ufid).unwrap();
            let outer = i.flow.outer_header().unwrap_or_default();
            (
                flow.match_descriptor().with_outer(outer),
                composed_ufid(*i_ufid, ufid),
            )
        };
        let result = driver.flow_put(
            tunnel_netdev.as_ref(),
            &i_match,
            &actions,
            composed,
            PutInfo::default(),
        );
        ingress_processed.push(*i_ufid);
        match result {
            Ok(_) => {
                tables.tnlpop.get_mut(&ufid).unwrap().ref_count += 1;
                tables.ingress.get_mut(i_ufid).unwrap().transient_status = TransientStatus::Full;
                tables
                    .ingress
                    .get(i_ufid)
                    .unwrap()
                    .flow
                    .status()
                    .set_base(BaseStatus::Full);
            }
            Err(e) => {
                debug!(composed = %format_args!("{composed:032x}"), error = %e, "compose put rejected");
                tables.ingress.get_mut(i_ufid).unwrap().transient_status = TransientStatus::Failed;
                need_rollback = true;
                break;
            }
        }
    }

    if need_rollback {
        for i_ufid in &ingress_processed {
            if tables.ingress.get(i_ufid).unwrap().transient_status == TransientStatus::Full {
                let composed = composed_ufid(*i_ufid, ufid);
                let _ = driver.flow_del(tunnel_netdev.as_ref(), composed);
                tables.tnlpop.get_mut(&ufid).unwrap().ref_count -= 1;
            }
        }
        if is_new {
            let removed = tables.tnlpop.remove(&ufid).unwrap();
            removed.flow.unref();
        } else {
            // MOD whose cross-product failed: the pre-existing entry is
            // dropped too, per spec.md §4.3.2 step 5.
            if let Some(removed) = tables.tnlpop.remove(&ufid) {
                removed.flow.unref();
            }
        }
        return BaseStatus::Failed;
    }

    BaseStatus::Full
}

/// spec.md §4.3.3, ingress half: resolve the tunnel vport from the flow's
/// *prior* action list, delete every composed entry, and drop the ingress
/// entry.
pub fn ingress_del(
    flow: &FlowHandle,
    tunnel_netdev: &dyn Netdev,
    aux: &CompositionAux,
    driver: &dyn Driver,
) {
    let ufid = flow.ufid();
    let mut tables = aux.write();
    if tables.ingress.remove(&ufid).is_none() {
        return;
    }

    let tnlpop_ufids: Vec<_> = tables.tnlpop.keys().copied().collect();
    for t_ufid in tnlpop_ufids {
        let composed = composed_ufid(ufid, t_ufid);
        let _ = driver.flow_del(tunnel_netdev, composed);
        if let Some(t) = tables.tnlpop.get_mut(&t_ufid) {
            t.ref_count = t.ref_count.saturating_sub(1);
        }
    }
    drop(tables);
    flow.unref();
}

/// spec.md §4.3.3, tnlpop half.
pub fn tnlpop_del(
    flow: &FlowHandle,
    tunnel_netdev: &dyn Netdev,
    aux: &CompositionAux,
    driver: &dyn Driver,
) {
    let ufid = flow.ufid();
    let mut tables = aux.write();
    if tables.tnlpop.remove(&ufid).is_none() {
        return;
    }

    let ingress_ufids: Vec<_> = tables.ingress.keys().copied().collect();
    for i_ufid in ingress_ufids {
        let composed = composed_ufid(i_ufid, ufid);
        let _ = driver.flow_del(tunnel_netdev, composed);
    }
    drop(tables);
    flow.unref();
}

/// spec.md §4.3.4: a MOD whose *prior* actions popped a tunnel is handled by
/// tearing the old ingress composition down entirely and letting the worker
/// reclassify the new action list from scratch.
pub fn ingress_mod_teardown(
    flow: &FlowHandle,
    tunnel_netdev: &dyn Netdev,
    aux: &CompositionAux,
    driver: &dyn Driver,
) {
    // Reuse ingress_del's logic, but without releasing the flow's enqueue
    // reference: the worker still owns dispatch for this item and will
    // re-evaluate it against the new action list.
    let ufid = flow.ufid();
    let mut tables = aux.write();
    if tables.ingress.remove(&ufid).is_none() {
        return;
    }
    let tnlpop_ufids: Vec<_> = tables.tnlpop.keys().copied().collect();
    for t_ufid in tnlpop_ufids {
        let composed = composed_ufid(ufid, t_ufid);
        let _ = driver.flow_del(tunnel_netdev, composed);
        if let Some(t) = tables.tnlpop.get_mut(&t_ufid) {
            t.ref_count = t.ref_count.saturating_sub(1);
        }
    }
    drop(tables);
    flow.unref();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::driver::test_support::MockDriver;
    use crate::flow::test_support::FakeFlow;
    use crate::netdev::test_support::FakePorts;

    #[test]
    fn first_ingress_add_on_empty_aux_succeeds() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let tunnel_netdev = ports.get(vxlan).unwrap();
        let aux = ports.aux_of(vxlan).unwrap();
        let driver = MockDriver::new();

        let flow = FakeFlow::new(0xF1, phys, vec![Action::TunnelPop(vxlan)]);
        let status = ingress_add(
            flow.clone(),
            in_netdev,
            tunnel_netdev,
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        assert_eq!(status, BaseStatus::Full);
        assert_eq!(aux.read().ingress.len(), 1);
        assert_eq!(driver.put_calls().len(), 1, "only the validate put, no T yet");
        assert_eq!(driver.del_calls().len(), 1, "validate delete");
    }

    #[test]
    fn ingress_then_tnlpop_composes_one_entry() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let tunnel_netdev = ports.get(vxlan).unwrap();
        let aux = ports.aux_of(vxlan).unwrap();
        let driver = MockDriver::new();

        let f1 = FakeFlow::new(0x10, phys, vec![Action::TunnelPop(vxlan)]);
        ingress_add(
            f1.clone(),
            in_netdev,
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );

        let f2 = FakeFlow::new(0x20, vxlan, vec![Action::Output(phys)]);
        let status = tnlpop_add_mod(
            f2.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        assert_eq!(status, BaseStatus::Full);
        let composed = composed_ufid(f1.ufid(), f2.ufid());
        assert!(driver.is_programmed("vxlan0", composed));
        assert_eq!(aux.read().tnlpop.get(&f2.ufid()).unwrap().ref_count, 1);
        assert_eq!(f1.status().base(), BaseStatus::Full);
    }

    #[test]
    fn tnlpop_add_rolls_back_on_second_ingress_rejection() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let tunnel_netdev = ports.get(vxlan).unwrap();
        let aux = ports.aux_of(vxlan).unwrap();
        let driver = MockDriver::new();

        let f1 = FakeFlow::new(0x10, phys, vec![Action::TunnelPop(vxlan)]);
        ingress_add(
            f1.clone(),
            in_netdev.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        let f3 = FakeFlow::new(0x30, phys, vec![Action::TunnelPop(vxlan)]);
        ingress_add(
            f3.clone(),
            in_netdev,
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );

        let f2 = FakeFlow::new(0x20, vxlan, vec![Action::Output(phys)]);
        let composed_with_f3 = composed_ufid(f3.ufid(), f2.ufid());
        driver.reject(composed_with_f3);

        let status = tnlpop_add_mod(
            f2.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        assert_eq!(status, BaseStatus::Failed);
        assert!(!aux.read().tnlpop.contains_key(&f2.ufid()));
        let composed_with_f1 = composed_ufid(f1.ufid(), f2.ufid());
        assert!(
            !driver.is_programmed("vxlan0", composed_with_f1),
            "first compose must be rolled back"
        );
    }

    #[test]
    fn del_cascade_removes_ingress_and_decrements_refcount() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let tunnel_netdev = ports.get(vxlan).unwrap();
        let aux = ports.aux_of(vxlan).unwrap();
        let driver = MockDriver::new();

        let f1 = FakeFlow::new(0x10, phys, vec![Action::TunnelPop(vxlan)]);
        ingress_add(
            f1.clone(),
            in_netdev,
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        let f2 = FakeFlow::new(0x20, vxlan, vec![Action::Output(phys)]);
        tnlpop_add_mod(
            f2.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );

        let f1_handle: FlowHandle = f1.clone();
        ingress_del(&f1_handle, tunnel_netdev.as_ref(), &aux, driver.as_ref());

        assert!(!aux.read().ingress.contains_key(&f1.ufid()));
        assert_eq!(aux.read().tnlpop.get(&f2.ufid()).unwrap().ref_count, 0);
        assert_eq!(f2.status().base(), BaseStatus::Full);
        assert_eq!(f1.hw_ref_count(), 0, "ingress_del releases the extra hw ref");
    }
}
