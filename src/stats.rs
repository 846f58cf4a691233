//! Stats aggregation (spec.md §4.7, component C8).

use crate::action::Action;
use crate::aux::{composed_ufid, CompositionAux};
use crate::driver::{Driver, DriverStats};
use crate::flow::FlowHandle;
use crate::netdev::Netdev;

/// Resolve a flow's packet/byte counters.
///
/// - If the flow's live actions contain `TUNNEL_POP`, it is an ingress
///   flow: sum the driver's counters for every composed entry keyed off
///   its ufid across the tunnel vport's Aux.
/// - If the flow's own input netdev is a tunnel vport with an Aux, its own
///   ufid is registered as that Aux's T, and at least one ingress flow is
///   present, it is a tnlpop flow: sum across every composed entry on the
///   other side.
/// - Otherwise query the driver directly by the flow's own ufid.
pub fn query(
    flow: &FlowHandle,
    in_netdev: &dyn Netdev,
    tunnel_netdev_for_pop: Option<(&dyn Netdev, &CompositionAux)>,
    own_aux: Option<&CompositionAux>,
    driver: &dyn Driver,
) -> DriverStats {
    let ufid = flow.ufid();
    let actions = flow.actions();

    let pops_tunnel = actions
        .iter()
        .any(|a| matches!(a, Action::TunnelPop(_)));

    if pops_tunnel {
        if let Some((tunnel_netdev, aux)) = tunnel_netdev_for_pop {
            let tables = aux.read();
            let mut total = DriverStats::default();
            for t_ufid in tables.tnlpop.keys() {
                let composed = composed_ufid(ufid, *t_ufid);
                if let Ok(s) = driver.flow_get(tunnel_netdev, composed) {
                    total.n_packets += s.n_packets;
                    total.n_bytes += s.n_bytes;
                }
            }
            return total;
        }
    }

    if let Some(aux) = own_aux {
        let tables = aux.read();
        if tables.tnlpop.contains_key(&ufid) && !tables.ingress.is_empty() {
            let mut total = DriverStats::default();
            for i_ufid in tables.ingress.keys() {
                let composed = composed_ufid(*i_ufid, ufid);
                if let Ok(s) = driver.flow_get(in_netdev, composed) {
                    total.n_packets += s.n_packets;
                    total.n_bytes += s.n_bytes;
                }
            }
            return total;
        }
    }

    driver.flow_get(in_netdev, ufid).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{ingress_add, tnlpop_add_mod};
    use crate::action::{Action as A, ActionFlags};
    use crate::driver::test_support::MockDriver;
    use crate::driver::PutInfo;
    use crate::flow::test_support::FakeFlow;
    use crate::netdev::test_support::FakePorts;

    #[test]
    fn ingress_stats_sum_over_composed_entries() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let tunnel_netdev = ports.get(vxlan).unwrap();
        let aux = ports.aux_of(vxlan).unwrap();
        let driver = MockDriver::new();

        let f1 = FakeFlow::new(0x10, phys, vec![A::TunnelPop(vxlan)]);
        ingress_add(
            f1.clone(),
            in_netdev.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );
        let f2 = FakeFlow::new(0x20, vxlan, vec![A::Output(phys)]);
        tnlpop_add_mod(
            f2.clone(),
            tunnel_netdev.clone(),
            &aux,
            driver.as_ref(),
            ActionFlags::default(),
        );

        let composed = composed_ufid(f1.ufid(), f2.ufid());
        driver.set_stats("vxlan0", composed, DriverStats { n_packets: 7, n_bytes: 700 });

        let f1_handle: FlowHandle = f1.clone();
        let stats = query(
            &f1_handle,
            in_netdev.as_ref(),
            Some((tunnel_netdev.as_ref(), &aux)),
            None,
            driver.as_ref(),
        );
        assert_eq!(stats.n_packets, 7);
        assert_eq!(stats.n_bytes, 700);
    }

    #[test]
    fn non_composed_flow_queries_driver_directly() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let netdev = ports.get(phys).unwrap();
        let driver = MockDriver::new();
        let flow = FakeFlow::new(0x42, phys, vec![A::Output(phys)]);
        let handle: FlowHandle = flow.clone();
        driver
            .flow_put(netdev.as_ref(), &flow.match_descriptor(), &flow.actions(), 0x42, PutInfo::default())
            .unwrap();
        driver.set_stats("eth0", 0x42, DriverStats { n_packets: 3, n_bytes: 300 });

        let stats = query(&handle, netdev.as_ref(), None, None, driver.as_ref());
        assert_eq!(stats.n_packets, 3);
    }
}
