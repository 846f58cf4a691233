//! Action lists and the offloadability classifier (spec.md §4.2, component C3).

use crate::netdev::{Netdev, NetdevKind, NetdevProvider, PortId};

/// A single action in a flow's action list. Parsing the wire representation
/// of actions is out of scope (spec.md §1); this enum carries only the
/// discrimination the classifier needs.
#[derive(Debug, Clone)]
pub enum Action {
    Output(PortId),
    /// `CLONE` with a well-formed inner block. A malformed clone (modeled
    /// here as absent from the action list entirely, since parsing lives
    /// upstream) disables offload.
    Clone(Vec<Action>),
    TunnelPop(PortId),
    PushVlan,
}

/// Feature flags derived while walking an action list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionFlags {
    pub vxlan_decap: bool,
    pub vlan_push: bool,
    pub drop: bool,
    pub has_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyResult {
    pub offloadable: bool,
    pub flags: ActionFlags,
    /// Set when a `TUNNEL_POP` action targets a tunnel vport: the ingress
    /// case of §4.3.1.
    pub tunnel_pop_port: Option<PortId>,
}

/// Walk `actions` applying spec.md §4.2 rules 1-6.
pub fn classify(
    actions: &[Action],
    in_netdev: &dyn Netdev,
    ports: &dyn NetdevProvider,
) -> ClassifyResult {
    let mut flags = ActionFlags::default();
    let mut tunnel_pop_port = None;
    let mut offloadable = true;

    if !walk(actions, ports, &mut flags, &mut tunnel_pop_port) {
        offloadable = false;
    }

    if matches!(in_netdev.kind(), NetdevKind::Vxlan) {
        flags.vxlan_decap = true;
    }

    if actions.is_empty() || !flags.has_output {
        flags.drop = true;
        offloadable = true;
    }

    ClassifyResult {
        offloadable,
        flags,
        tunnel_pop_port,
    }
}

/// Returns `false` if the list contains something non-offloadable (rule 1's
/// tap case, or a malformed clone).
fn walk(
    actions: &[Action],
    ports: &dyn NetdevProvider,
    flags: &mut ActionFlags,
    tunnel_pop_port: &mut Option<PortId>,
) -> bool {
    for action in actions {
        match action {
            Action::Output(port) => match ports.port_to_netdev(*port) {
                Some(netdev) if !netdev.is_tap() => {
                    flags.has_output = true;
                }
                Some(_) => return false,
                None => return false,
            },
            Action::Clone(inner) => {
                if inner.is_empty() {
                    return false;
                }
                if !walk(inner, ports, flags, tunnel_pop_port) {
                    return false;
                }
            }
            Action::TunnelPop(port) => {
                if let Some(netdev) = ports.port_to_netdev(*port) {
                    if matches!(netdev.kind(), NetdevKind::Vxlan) {
                        flags.vxlan_decap = true;
                    }
                }
                flags.has_output = true;
                *tunnel_pop_port = Some(*port);
            }
            Action::PushVlan => {
                flags.vlan_push = true;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::test_support::FakePorts;

    #[test]
    fn output_to_real_port_is_offloadable() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let in_netdev = ports.get(phys).unwrap();
        let result = classify(&[Action::Output(phys)], in_netdev.as_ref(), &ports);
        assert!(result.offloadable);
        assert!(result.flags.has_output);
        assert!(!result.flags.drop);
    }

    #[test]
    fn output_to_tap_is_not_offloadable() {
        let ports = FakePorts::new();
        let tap = ports.add_tap("tap0");
        let in_netdev = ports.get(tap).unwrap();
        let result = classify(&[Action::Output(tap)], in_netdev.as_ref(), &ports);
        assert!(!result.offloadable);
    }

    #[test]
    fn empty_action_list_is_drop_and_offloadable() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let in_netdev = ports.get(phys).unwrap();
        let result = classify(&[], in_netdev.as_ref(), &ports);
        assert!(result.offloadable);
        assert!(result.flags.drop);
    }

    #[test]
    fn tunnel_pop_marks_ingress_candidate() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let vxlan = ports.add_vxlan("vxlan0");
        let in_netdev = ports.get(phys).unwrap();
        let result = classify(&[Action::TunnelPop(vxlan)], in_netdev.as_ref(), &ports);
        assert!(result.offloadable);
        assert_eq!(result.tunnel_pop_port, Some(vxlan));
        assert!(result.flags.vxlan_decap);
    }

    #[test]
    fn malformed_clone_disables_offload() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let in_netdev = ports.get(phys).unwrap();
        let result = classify(&[Action::Clone(vec![])], in_netdev.as_ref(), &ports);
        assert!(!result.offloadable);
    }
}
