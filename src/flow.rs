//! The flow handle collaborator (spec.md §3: "Flow handle (external)").
//!
//! Flows are owned by the classifier upstream of this crate; we only depend
//! on the attributes §3 lists, expressed as a trait so the worker, the
//! composition engine, and tests can all talk to the same shape without this
//! crate owning flow storage.

use std::net::IpAddr;
use std::sync::Arc;

use crate::action::Action;
use crate::netdev::PortId;
use crate::status::AtomicOffloadStatus;

pub type Ufid = u128;

/// Outer-header constraints an ingress flow's match carries, used to
/// supplement a tunnel-pop flow's match during composition (spec.md §4.3
/// intro: destination IP, destination MAC, destination port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OuterHeader {
    pub dst_ip: Option<IpAddr>,
    pub dst_mac: Option<[u8; 6]>,
    pub dst_port: Option<u16>,
}

/// A flow's match descriptor. Parsing match attributes is out of scope
/// (spec.md §1); this crate only needs to carry and expand the descriptor,
/// not interpret its fields.
#[derive(Debug, Clone, Default)]
pub struct MatchDescriptor {
    pub in_port: PortId,
    pub outer: Option<OuterHeader>,
}

impl MatchDescriptor {
    /// Expand this match with an ingress flow's outer-header constraints,
    /// as the composition engine does when building a composed entry.
    pub fn with_outer(&self, outer: OuterHeader) -> Self {
        let mut m = self.clone();
        m.outer = Some(outer);
        m
    }
}

/// The external flow-handle contract: a stable `ufid`, a match/action pair,
/// a version counter, an atomic status word, a liveness flag, and a
/// refcount interface whose acquisition can fail.
pub trait Flow: Send + Sync + std::fmt::Debug {
    fn ufid(&self) -> Ufid;

    fn in_port(&self) -> PortId;

    fn match_descriptor(&self) -> MatchDescriptor;

    /// Outer-header constraints carried by this flow's match, if it is (or
    /// was, for a captured-prior-actions MOD) an ingress flow.
    fn outer_header(&self) -> Option<OuterHeader> {
        None
    }

    /// The flow's live action list. The worker re-fetches this right before
    /// dispatch (§4.5 step 3); MOD items additionally carry a captured
    /// snapshot taken at enqueue time (§4.1, §9 "Captured-actions hazard").
    fn actions(&self) -> Vec<Action>;

    fn version(&self) -> u64;

    fn status(&self) -> &AtomicOffloadStatus;

    fn is_dead(&self) -> bool;

    /// Acquire a hardware-path reference. Returns `false` if the flow is
    /// being torn down concurrently, in which case the caller must abort
    /// without enqueueing (§4.1).
    fn try_ref(&self) -> bool;

    fn unref(&self);
}

pub type FlowHandle = Arc<dyn Flow>;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// A flow handle usable directly in tests, with a refcount that can be
    /// made to fail acquisition on demand.
    #[derive(Debug)]
    pub struct FakeFlow {
        ufid: Ufid,
        in_port: PortId,
        outer: Mutex<Option<OuterHeader>>,
        actions: Mutex<Vec<Action>>,
        version: AtomicU64,
        status: AtomicOffloadStatus,
        dead: AtomicBool,
        hw_refs: AtomicUsize,
        refuse_ref: AtomicBool,
    }

    impl FakeFlow {
        pub fn new(ufid: Ufid, in_port: PortId, actions: Vec<Action>) -> Arc<Self> {
            Arc::new(Self {
                ufid,
                in_port,
                outer: Mutex::new(None),
                actions: Mutex::new(actions),
                version: AtomicU64::new(0),
                status: AtomicOffloadStatus::new(),
                dead: AtomicBool::new(false),
                hw_refs: AtomicUsize::new(0),
                refuse_ref: AtomicBool::new(false),
            })
        }

        pub fn with_outer(self: &Arc<Self>, outer: OuterHeader) -> &Arc<Self> {
            *self.outer.lock().unwrap() = Some(outer);
            self
        }

        pub fn set_actions(&self, actions: Vec<Action>) {
            *self.actions.lock().unwrap() = actions;
        }

        pub fn set_refuse_ref(&self, refuse: bool) {
            self.refuse_ref.store(refuse, Ordering::SeqCst);
        }

        pub fn hw_ref_count(&self) -> usize {
            self.hw_refs.load(Ordering::SeqCst)
        }

        pub fn kill(&self) {
            self.dead.store(true, Ordering::SeqCst);
        }
    }

    impl Flow for FakeFlow {
        fn ufid(&self) -> Ufid {
            self.ufid
        }

        fn in_port(&self) -> PortId {
            self.in_port
        }

        fn match_descriptor(&self) -> MatchDescriptor {
            MatchDescriptor {
                in_port: self.in_port,
                outer: *self.outer.lock().unwrap(),
            }
        }

        fn outer_header(&self) -> Option<OuterHeader> {
            *self.outer.lock().unwrap()
        }

        fn actions(&self) -> Vec<Action> {
            self.actions.lock().unwrap().clone()
        }

        fn version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }

        fn status(&self) -> &AtomicOffloadStatus {
            &self.status
        }

        fn is_dead(&self) -> bool {
            self.dead.load(Ordering::SeqCst)
        }

        fn try_ref(&self) -> bool {
            if self.refuse_ref.load(Ordering::SeqCst) {
                return false;
            }
            self.hw_refs.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn unref(&self) {
            self.hw_refs.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
