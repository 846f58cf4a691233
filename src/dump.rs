//! `offload/dump-vtp` introspection (spec.md §4.8, component C9).

use crate::aux::CompositionAux;
use crate::flow::Ufid;
use crate::netdev::Netdev;

#[derive(Debug, Clone)]
pub struct IngressRow {
    pub ufid: Ufid,
    pub netdev_name: String,
}

#[derive(Debug, Clone)]
pub struct TnlPopRow {
    pub ufid: Ufid,
    pub ref_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VtpDump {
    pub ingress: Vec<IngressRow>,
    pub tnlpop: Vec<TnlPopRow>,
    pub composed: Vec<Ufid>,
}

/// Take the Aux's read lock once and render every row from the snapshot,
/// so a concurrent composition cannot produce a dump with mismatched
/// ingress/tnlpop/composed sections.
pub fn dump_vtp(tunnel_netdev: &dyn Netdev, aux: &CompositionAux) -> VtpDump {
    let _ = tunnel_netdev;
    let tables = aux.read();

    let ingress = tables
        .ingress
        .values()
        .map(|i| IngressRow {
            ufid: i.ufid(),
            netdev_name: i.ingress_netdev.name().to_owned(),
        })
        .collect();

    let tnlpop: Vec<TnlPopRow> = tables
        .tnlpop
        .values()
        .map(|t| TnlPopRow {
            ufid: t.ufid(),
            ref_count: t.ref_count,
        })
        .collect();

    let mut composed = Vec::new();
    for i in tables.ingress.values() {
        for t in tables.tnlpop.values() {
            composed.push(crate::aux::composed_ufid(i.ufid(), t.ufid()));
        }
    }

    VtpDump {
        ingress,
        tnlpop,
        composed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionFlags};
    use crate::compose::{ingress_add, tnlpop_add_mod};
    use crate::driver::test_support::MockDriver;
    use crate::flow::test_support::FakeFlow;
    use crate::netdev::test_support::FakePorts;

    #[test]
    fn dump_lists_composed_pair() {
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

        let dump = dump_vtp(tunnel_netdev.as_ref(), &aux);
        assert_eq!(dump.ingress.len(), 1);
        assert_eq!(dump.ingress[0].netdev_name, "eth0");
        assert_eq!(dump.tnlpop.len(), 1);
        assert_eq!(dump.tnlpop[0].ref_count, 1);
        assert_eq!(dump.composed, vec![crate::aux::composed_ufid(f1.ufid(), f2.ufid())]);
    }
}
