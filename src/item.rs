//! The offload request item (spec.md §3/§4.1, component C1).

use crate::action::Action;
use crate::flow::FlowHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Mod,
    Del,
}

/// Bundles a flow handle, the requested operation, and (for `Mod`) a
/// snapshot of the prior action list taken at enqueue time, since the live
/// list may be freed while the item sits in the queue (§9 "Captured-actions
/// hazard").
pub struct OffloadItem {
    pub flow: FlowHandle,
    pub op: Op,
    pub captured_prior_actions: Option<Vec<Action>>,
}

impl OffloadItem {
    pub fn new(flow: FlowHandle, op: Op, captured_prior_actions: Option<Vec<Action>>) -> Self {
        Self {
            flow,
            op,
            captured_prior_actions,
        }
    }
}
