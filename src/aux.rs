//! Per-tunnel-port composition tables (spec.md §3/§4.3, component C4).
//!
//! One [`CompositionAux`] exists per tunnel vport. It holds the ingress-flow
//! and tunnel-pop-flow tables behind a single read/write lock shared by the
//! composition engine, the stats aggregator, and the introspection dump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::action::ActionFlags;
use crate::flow::{FlowHandle, Ufid};
use crate::netdev::Netdev;

/// Per-operation bookkeeping used by the two-phase compose/rollback
/// protocol in §4.3.1/§4.3.2 and §9 ("Rollback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientStatus {
    None,
    Full,
    Failed,
}

/// A software flow whose actions contain a `TUNNEL_POP` targeting this
/// Aux's vport (spec.md §3, C4a).
pub struct IngressFlow {
    pub flow: FlowHandle,
    pub ingress_netdev: Arc<dyn Netdev>,
    pub action_flags: ActionFlags,
    pub transient_status: TransientStatus,
}

impl IngressFlow {
    pub fn ufid(&self) -> Ufid {
        self.flow.ufid()
    }
}

/// A software flow whose match sits on this Aux's tunnel vport, i.e. a
/// post-decap flow (spec.md §3, C4b).
pub struct TnlPopFlow {
    pub flow: FlowHandle,
    pub action_flags: ActionFlags,
    pub ref_count: u32,
    pub transient_status: TransientStatus,
}

impl TnlPopFlow {
    pub fn ufid(&self) -> Ufid {
        self.flow.ufid()
    }
}

/// The composed ufid for a programmed `(Ingress, TnlPop)` pair. Commutative
/// by construction (spec.md §8).
pub fn composed_ufid(a: Ufid, b: Ufid) -> Ufid {
    a ^ b
}

/// Counters for the invariant anomaly discussed in spec.md §9: a
/// `TnlPopFlow` that fails composition while some *other* ingress flow still
/// holds it composed (nonzero `ref_count`). The source treats this as a
/// logged warning with unclear intent; we preserve that behavior but make it
/// observable for tests.
#[derive(Debug, Default)]
pub struct AnomalyCounters {
    pub tnlpop_failed_nonzero_refcount: AtomicU64,
}

impl AnomalyCounters {
    pub fn record_tnlpop_anomaly(&self) {
        self.tnlpop_failed_nonzero_refcount
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tnlpop_anomaly_count(&self) -> u64 {
        self.tnlpop_failed_nonzero_refcount.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct AuxTables {
    pub ingress: HashMap<Ufid, IngressFlow>,
    pub tnlpop: HashMap<Ufid, TnlPopFlow>,
}

/// Per-tunnel-vport composition state (spec.md §3, C4). Created with the
/// port, destroyed with it; destruction flushes both tables (see
/// [`CompositionAux::flush`]).
pub struct CompositionAux {
    tables: RwLock<AuxTables>,
    pub anomalies: AnomalyCounters,
}

impl CompositionAux {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(AuxTables::default()),
            anomalies: AnomalyCounters::default(),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AuxTables> {
        self.tables.read().expect("aux lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AuxTables> {
        self.tables.write().expect("aux lock poisoned")
    }

    /// Release every entry, unref-ing their flows. Called when the owning
    /// tunnel port is destroyed (spec.md §3 "Lifecycle").
    pub fn flush(&self) {
        let mut tables = self.write();
        for (_, ingress) in tables.ingress.drain() {
            ingress.flow.unref();
        }
        for (_, tnlpop) in tables.tnlpop.drain() {
            tnlpop.flow.unref();
        }
    }
}

impl Default for CompositionAux {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompositionAux {
    fn drop(&mut self) {
        self.flush();
    }
}
