//! The worker loop and its lifecycle controls (spec.md §4.5, §4.6,
//! component C7).

use std::sync::Arc;

use tracing::{debug, error};

use crate::action::classify;
use crate::compose;
use crate::driver::Driver;
use crate::flow::{FlowHandle, Ufid};
use crate::item::{Op, OffloadItem};
use crate::netdev::NetdevProvider;
use crate::normal;
use crate::queue::OffloadQueue;
use crate::status::BaseStatus;

/// Shared state reachable from the worker thread and from producer calls.
/// Everything here is `Send + Sync`; the worker owns no thread-local state.
pub(crate) struct Shared {
    pub(crate) queue: Arc<OffloadQueue>,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) ports: Arc<dyn NetdevProvider>,
    /// Extra reference held on normal-path flows while they are offloaded
    /// (spec.md §4.5 step 5). Composed flows get the equivalent via the
    /// Aux tables themselves, so only the normal path needs this.
    pub(crate) normal_refs: std::sync::Mutex<std::collections::HashMap<Ufid, FlowHandle>>,
}

/// `std::thread::spawn`-driven loop: pop, dispatch, repeat; drain on exit.
/// Mirrors the worker-thread shape of `compio-dispatcher::Dispatcher`, with
/// a blocking `Mutex`+`Condvar` queue in place of its async channel, per
/// spec.md §4.5.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        match shared.queue.wait_pop() {
            Some(item) => dispatch(&shared, item),
            None => break,
        }
    }
    shared.queue.drain();
}

fn dispatch(shared: &Shared, item: OffloadItem) {
    let OffloadItem {
        flow,
        op,
        captured_prior_actions,
    } = item;

    let result = match op {
        Op::Add | Op::Mod => dispatch_add_mod(shared, &flow, op, captured_prior_actions),
        Op::Del => dispatch_del(shared, &flow),
    };

    flow.status().finish(result);
    flow.unref();
}

fn dispatch_add_mod(
    shared: &Shared,
    flow: &FlowHandle,
    op: Op,
    captured_prior_actions: Option<Vec<crate::action::Action>>,
) -> BaseStatus {
    // spec.md §4.3.4: a MOD whose prior actions popped a tunnel is torn
    // down first, then re-evaluated from scratch against the new actions.
    if op == Op::Mod {
        if let Some(prior) = &captured_prior_actions {
            if let Some(prior_pop_port) = prior.iter().find_map(|a| match a {
                crate::action::Action::TunnelPop(port) => Some(*port),
                _ => None,
            }) {
                if let Some(netdev) = shared.ports.port_to_netdev(prior_pop_port) {
                    if let Some(aux) = netdev.offload_aux() {
                        compose::ingress_mod_teardown(
                            flow,
                            netdev.as_ref(),
                            &aux,
                            shared.driver.as_ref(),
                        );
                    }
                }
            }
        }
    }

    let in_port = flow.in_port();
    let Some(in_netdev) = shared.ports.port_to_netdev(in_port) else {
        debug!(ufid = %format_args!("{:032x}", flow.ufid()), in_port, "ingress netdev gone");
        // The netdev is gone, so there is nothing left to issue a driver
        // delete against; still drop our own pinning reference so a
        // previously-offloaded normal-path flow doesn't leak.
        release_stale_normal_ref(shared, flow, None);
        return BaseStatus::Failed;
    };

    let actions = flow.actions();
    let classified = classify(&actions, in_netdev.as_ref(), shared.ports.as_ref());
    if !classified.offloadable {
        release_stale_normal_ref(shared, flow, Some(in_netdev.as_ref()));
        return BaseStatus::Failed;
    }

    if let Some(tunnel_port) = classified.tunnel_pop_port {
        if let Some(tunnel_netdev) = shared.ports.port_to_netdev(tunnel_port) {
            if let Some(aux) = tunnel_netdev.offload_aux() {
                return compose::ingress_add(
                    flow.clone(),
                    in_netdev,
                    tunnel_netdev,
                    &aux,
                    shared.driver.as_ref(),
                    classified.flags,
                );
            }
        }
    }

    if let Some(aux) = in_netdev.offload_aux() {
        return compose::tnlpop_add_mod(
            flow.clone(),
            in_netdev,
            &aux,
            shared.driver.as_ref(),
            classified.flags,
        );
    }

    let status = normal::offload(flow, in_netdev.as_ref(), &actions, shared.driver.as_ref());
    if matches!(status, BaseStatus::Full | BaseStatus::Mask) {
        let already_held = shared
            .normal_refs
            .lock()
            .unwrap()
            .contains_key(&flow.ufid());
        if !already_held {
            if flow.try_ref() {
                shared
                    .normal_refs
                    .lock()
                    .unwrap()
                    .insert(flow.ufid(), flow.clone());
            } else {
                error!(ufid = %format_args!("{:032x}", flow.ufid()), "failed to pin offloaded normal-path flow");
            }
        }
    }
    status
}

/// Remove and unref a stale `shared.normal_refs` pin left over from a
/// previous normal-path offload of `flow`, deleting its driver entry too
/// when a netdev is still available to address the delete against.
/// Mirrors the `normal_refs` cleanup in `dispatch_del`.
fn release_stale_normal_ref(shared: &Shared, flow: &FlowHandle, in_netdev: Option<&dyn crate::netdev::Netdev>) {
    let held = shared.normal_refs.lock().unwrap().remove(&flow.ufid());
    if let Some(held) = held {
        if let Some(netdev) = in_netdev {
            normal::delete(&held, netdev, shared.driver.as_ref());
        }
        held.unref();
    }
}

fn dispatch_del(shared: &Shared, flow: &FlowHandle) -> BaseStatus {
    let in_port = flow.in_port();
    if let Some(in_netdev) = shared.ports.port_to_netdev(in_port) {
        if let Some(aux) = in_netdev.offload_aux() {
            // TnlPop DEL: the flow's match sits on the tunnel vport itself.
            compose::tnlpop_del(flow, in_netdev.as_ref(), &aux, shared.driver.as_ref());
            if let Some(held) = shared.normal_refs.lock().unwrap().remove(&flow.ufid()) {
                held.unref();
            }
            return BaseStatus::None;
        }
    }

    // Ingress DEL resolves the tunnel vport from the flow's live actions;
    // the classifier already validated these while the flow was alive.
    let actions = flow.actions();
    if let Some(pop_port) = actions.iter().find_map(|a| match a {
        crate::action::Action::TunnelPop(port) => Some(*port),
        _ => None,
    }) {
        if let Some(tunnel_netdev) = shared.ports.port_to_netdev(pop_port) {
            if let Some(aux) = tunnel_netdev.offload_aux() {
                compose::ingress_del(flow, tunnel_netdev.as_ref(), &aux, shared.driver.as_ref());
                return BaseStatus::None;
            }
        }
    }

    if let Some(in_netdev) = shared.ports.port_to_netdev(in_port) {
        normal::delete(flow, in_netdev.as_ref(), shared.driver.as_ref());
    }
    if let Some(held) = shared.normal_refs.lock().unwrap().remove(&flow.ufid()) {
        held.unref();
    }
    BaseStatus::None
}
