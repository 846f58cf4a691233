//! Normal-path offload for flows that are neither ingress nor tnlpop
//! composition candidates (spec.md §4.4, component C6).

use crate::action::Action;
use crate::driver::{Driver, PutInfo};
use crate::flow::FlowHandle;
use crate::netdev::Netdev;
use crate::status::BaseStatus;

/// Program a single driver entry keyed by the flow's own ufid, with its
/// expanded match and full action list.
pub fn offload(
    flow: &FlowHandle,
    netdev: &dyn Netdev,
    actions: &[Action],
    driver: &dyn Driver,
) -> BaseStatus {
    let ufid = flow.ufid();
    let m = flow.match_descriptor();
    match driver.flow_put(netdev, &m, actions, ufid, PutInfo::default()) {
        Ok(outcome) if outcome.actions_offloaded => BaseStatus::Full,
        Ok(_) => BaseStatus::Mask,
        Err(_) => BaseStatus::Failed,
    }
}

/// Delete a normal-path entry.
pub fn delete(flow: &FlowHandle, netdev: &dyn Netdev, driver: &dyn Driver) {
    let _ = driver.flow_del(netdev, flow.ufid());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::MockDriver;
    use crate::flow::test_support::FakeFlow;
    use crate::netdev::test_support::FakePorts;

    #[test]
    fn single_normal_flow_is_programmed_once() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let netdev = ports.get(phys).unwrap();
        let driver = MockDriver::new();
        let flow = FakeFlow::new(0x42, phys, vec![Action::Output(phys)]);
        let handle: FlowHandle = flow.clone();

        let status = offload(&handle, netdev.as_ref(), &flow.actions(), driver.as_ref());
        assert_eq!(status, BaseStatus::Full);
        assert_eq!(driver.put_calls(), vec![0x42]);
        assert!(driver.is_programmed("eth0", 0x42));
    }
}
