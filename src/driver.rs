//! The NIC driver collaborator (spec.md §6). Vendor drivers behind
//! "program flow", "delete flow", "query flow" are explicitly out of scope
//! (§1); this module only defines the contract this crate calls through.

use std::sync::Arc;

use crate::action::Action;
use crate::flow::{MatchDescriptor, Ufid};
use crate::netdev::Netdev;

/// Errors a driver call can return. Never propagated to producers (§7); the
/// composition engine and worker translate every variant into a flow status
/// and a log line.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver rejected flow {ufid:032x}")]
    Rejected { ufid: Ufid },
    #[error("netdev {0} is gone")]
    NetdevGone(String),
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extra programming hints. `mark_set` models the match-only validation
/// probe of spec.md §4.3.1 step 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutInfo {
    pub mark_set: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOutcome {
    pub actions_offloaded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub n_packets: u64,
    pub n_bytes: u64,
}

pub trait Driver: Send + Sync {
    fn flow_put(
        &self,
        netdev: &dyn Netdev,
        m: &MatchDescriptor,
        actions: &[Action],
        ufid: Ufid,
        info: PutInfo,
    ) -> Result<PutOutcome, DriverError>;

    fn flow_del(&self, netdev: &dyn Netdev, ufid: Ufid) -> Result<(), DriverError>;

    fn flow_get(&self, netdev: &dyn Netdev, ufid: Ufid) -> Result<DriverStats, DriverError>;
}

pub type DriverHandle = Arc<dyn Driver>;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// An in-memory driver for tests. Tracks every currently-programmed
    /// ufid per netdev name so tests can assert on rollback behavior, and
    /// can be told to reject specific ufids to force failures.
    #[derive(Default)]
    pub struct MockDriver {
        programmed: Mutex<HashSet<(String, Ufid)>>,
        reject: Mutex<HashSet<Ufid>>,
        put_calls: Mutex<Vec<Ufid>>,
        del_calls: Mutex<Vec<Ufid>>,
        stats: Mutex<HashMap<(String, Ufid), DriverStats>>,
    }

    impl MockDriver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn reject(&self, ufid: Ufid) {
            self.reject.lock().unwrap().insert(ufid);
        }

        pub fn allow(&self, ufid: Ufid) {
            self.reject.lock().unwrap().remove(&ufid);
        }

        pub fn is_programmed(&self, netdev: &str, ufid: Ufid) -> bool {
            self.programmed
                .lock()
                .unwrap()
                .contains(&(netdev.to_owned(), ufid))
        }

        pub fn programmed_count(&self) -> usize {
            self.programmed.lock().unwrap().len()
        }

        pub fn put_calls(&self) -> Vec<Ufid> {
            self.put_calls.lock().unwrap().clone()
        }

        pub fn del_calls(&self) -> Vec<Ufid> {
            self.del_calls.lock().unwrap().clone()
        }

        pub fn set_stats(&self, netdev: &str, ufid: Ufid, stats: DriverStats) {
            self.stats
                .lock()
                .unwrap()
                .insert((netdev.to_owned(), ufid), stats);
        }
    }

    impl Driver for MockDriver {
        fn flow_put(
            &self,
            netdev: &dyn Netdev,
            _m: &MatchDescriptor,
            actions: &[Action],
            ufid: Ufid,
            _info: PutInfo,
        ) -> Result<PutOutcome, DriverError> {
            self.put_calls.lock().unwrap().push(ufid);
            if self.reject.lock().unwrap().contains(&ufid) {
                return Err(DriverError::Rejected { ufid });
            }
            self.programmed
                .lock()
                .unwrap()
                .insert((netdev.name().to_owned(), ufid));
            Ok(PutOutcome {
                actions_offloaded: !actions.is_empty(),
            })
        }

        fn flow_del(&self, netdev: &dyn Netdev, ufid: Ufid) -> Result<(), DriverError> {
            self.del_calls.lock().unwrap().push(ufid);
            self.programmed
                .lock()
                .unwrap()
                .remove(&(netdev.name().to_owned(), ufid));
            Ok(())
        }

        fn flow_get(&self, netdev: &dyn Netdev, ufid: Ufid) -> Result<DriverStats, DriverError> {
            Ok(self
                .stats
                .lock()
                .unwrap()
                .get(&(netdev.name().to_owned(), ufid))
                .copied()
                .unwrap_or_default())
        }
    }
}
