//! Top-level facade: configuration, the builder, and the process-wide
//! worker singleton (spec.md §4.6, §4.9 "Global worker singleton", §6
//! Producer contract).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::action::Action;
use crate::driver::{Driver, DriverStats};
use crate::dump::{self, VtpDump};
use crate::error::BuildError;
use crate::flow::FlowHandle;
use crate::item::Op;
use crate::netdev::{Netdev, NetdevProvider, PortId};
use crate::queue::OffloadQueue;
use crate::stats;
use crate::worker::{self, Shared};

/// Engine configuration. Mirrors the teacher's `DispatcherBuilder` shape:
/// a handful of named knobs with sane defaults, set through a consuming
/// builder.
#[derive(Clone)]
pub struct EngineConfig {
    feature_enabled: bool,
    worker_thread_name: String,
    track_anomalies: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feature_enabled: true,
            worker_thread_name: "offload-worker".to_owned(),
            track_anomalies: true,
        }
    }
}

/// Builder for [`OffloadEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    driver: Option<Arc<dyn Driver>>,
    ports: Option<Arc<dyn NetdevProvider>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            driver: None,
            ports: None,
        }
    }

    /// Disable the engine entirely. `queue_put`/`queue_del` become no-ops
    /// that return `false`, as if the queue were permanently paused.
    pub fn feature_enabled(mut self, enabled: bool) -> Self {
        self.config.feature_enabled = enabled;
        self
    }

    /// Name given to the worker thread (useful in panic messages and
    /// thread dumps).
    pub fn worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_thread_name = name.into();
        self
    }

    /// Whether the §9 TnlPop-anomaly counter is tracked. Disabling this
    /// does not change behavior, only whether the counter is incremented.
    pub fn track_anomalies(mut self, track: bool) -> Self {
        self.config.track_anomalies = track;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn ports(mut self, ports: Arc<dyn NetdevProvider>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Build the engine and spawn its worker thread.
    ///
    /// # Panics
    ///
    /// Panics if `driver` or `ports` were not set.
    pub fn build(self) -> Result<OffloadEngine, BuildError> {
        let driver = self.driver.expect("EngineBuilder::driver is required");
        let ports = self.ports.expect("EngineBuilder::ports is required");
        OffloadEngine::new_impl(self.config, driver, ports)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine: a request queue, its worker thread, and the driver/port
/// collaborators the worker dispatches through.
pub struct OffloadEngine {
    config: EngineConfig,
    queue: Arc<OffloadQueue>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OffloadEngine {
    fn new_impl(
        config: EngineConfig,
        driver: Arc<dyn Driver>,
        ports: Arc<dyn NetdevProvider>,
    ) -> Result<Self, BuildError> {
        let queue = Arc::new(OffloadQueue::new());
        let shared = Arc::new(Shared {
            queue: queue.clone(),
            driver,
            ports,
            normal_refs: Mutex::new(HashMap::new()),
        });
        let thread = spawn_worker(&config, shared.clone())?;
        Ok(Self {
            config,
            queue,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// `queue_put` (spec.md §4.1): enqueue an ADD or MOD for `flow`.
    pub fn queue_put(
        &self,
        flow: FlowHandle,
        op: Op,
        prior_actions: Option<Vec<Action>>,
    ) -> bool {
        if !self.config.feature_enabled {
            return false;
        }
        self.queue.put(flow, prior_actions, op)
    }

    /// `queue_del` (spec.md §4.1): enqueue a DEL for `flow`.
    pub fn queue_del(&self, flow: FlowHandle) -> bool {
        if !self.config.feature_enabled {
            return false;
        }
        self.queue.del(flow)
    }

    /// Block until `flow` is no longer `IN_PROGRESS`, i.e. the worker has
    /// finished whatever was last enqueued for it.
    pub fn wait_done(&self, flow: &FlowHandle) {
        while flow.status().in_progress() {
            std::thread::yield_now();
        }
    }

    /// `pause` (spec.md §4.6).
    pub fn pause(&self) -> bool {
        self.queue.pause()
    }

    /// `resume` (spec.md §4.6).
    pub fn resume(&self, prev: bool) {
        self.queue.resume(prev)
    }

    /// `join` (spec.md §4.6): drain and stop the worker thread.
    pub fn join(&self) {
        self.queue.set_exit(true);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("offload worker thread panicked");
            }
        }
    }

    /// `restart` (spec.md §4.6): clear `exit` and spawn a fresh worker.
    pub fn restart(&self) -> Result<(), BuildError> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return Ok(());
        }
        self.queue.set_exit(false);
        *thread = Some(spawn_worker(&self.config, self.shared.clone())?);
        Ok(())
    }

    /// `stats_for` (spec.md §4.7). `tunnel_netdev_for_pop` and `own_aux` are
    /// resolved by the caller from the flow's `in_port` / tunnel-pop target,
    /// since only the caller's port table knows those associations.
    pub fn stats_for(
        &self,
        flow: &FlowHandle,
        in_netdev: &dyn Netdev,
        tunnel_netdev_for_pop: Option<(&dyn Netdev, &crate::aux::CompositionAux)>,
        own_aux: Option<&crate::aux::CompositionAux>,
    ) -> DriverStats {
        stats::query(
            flow,
            in_netdev,
            tunnel_netdev_for_pop,
            own_aux,
            self.shared.driver.as_ref(),
        )
    }

    /// `offload/dump-vtp` (spec.md §4.8).
    pub fn dump_vtp(&self, port: PortId) -> Option<VtpDump> {
        let netdev = self.shared.ports.port_to_netdev(port)?;
        let aux = netdev.offload_aux()?;
        Some(dump::dump_vtp(netdev.as_ref(), &aux))
    }
}

impl Drop for OffloadEngine {
    fn drop(&mut self) {
        self.join();
    }
}

fn spawn_worker(config: &EngineConfig, shared: Arc<Shared>) -> Result<JoinHandle<()>, BuildError> {
    std::thread::Builder::new()
        .name(config.worker_thread_name.clone())
        .spawn(move || worker::run(shared))
        .map_err(BuildError::Spawn)
}

static GLOBAL: OnceLock<OffloadEngine> = OnceLock::new();

/// Initialize the process-wide engine singleton. Subsequent calls are
/// no-ops; the engine built on the first call wins (spec.md §9 "Global
/// worker singleton").
pub fn global_init(driver: Arc<dyn Driver>, ports: Arc<dyn NetdevProvider>) -> &'static OffloadEngine {
    GLOBAL.get_or_init(|| {
        info!("initializing offload engine singleton");
        OffloadEngine::builder()
            .driver(driver)
            .ports(ports)
            .build()
            .expect("failed to initialize offload engine")
    })
}

/// Access the process-wide engine singleton. Panics if [`global_init`] has
/// not been called yet.
pub fn global() -> &'static OffloadEngine {
    GLOBAL.get().expect("offload engine not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action as A;
    use crate::driver::test_support::MockDriver;
    use crate::flow::test_support::FakeFlow;
    use crate::netdev::test_support::FakePorts;
    use crate::status::BaseStatus;

    #[test]
    fn builder_requires_driver_and_ports() {
        let result = std::panic::catch_unwind(|| EngineBuilder::new().build());
        assert!(result.is_err());
    }

    #[test]
    fn engine_offloads_a_normal_flow_end_to_end() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let driver = MockDriver::new();
        let engine = OffloadEngine::builder()
            .driver(driver.clone())
            .ports(ports.clone())
            .build()
            .unwrap();

        let flow = FakeFlow::new(0x99, phys, vec![A::Output(phys)]);
        let handle: FlowHandle = flow.clone();
        assert!(engine.queue_put(handle.clone(), Op::Add, None));
        engine.wait_done(&handle);

        assert_eq!(flow.status().base(), BaseStatus::Full);
        engine.join();
    }

    #[test]
    fn join_then_restart_accepts_new_work() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let driver = MockDriver::new();
        let engine = OffloadEngine::builder()
            .driver(driver.clone())
            .ports(ports.clone())
            .build()
            .unwrap();

        engine.join();
        engine.restart().unwrap();

        let flow = FakeFlow::new(0x1, phys, vec![A::Output(phys)]);
        let handle: FlowHandle = flow.clone();
        assert!(engine.queue_put(handle.clone(), Op::Add, None));
        engine.wait_done(&handle);
        assert_eq!(flow.status().base(), BaseStatus::Full);
        engine.join();
    }

    #[test]
    fn disabled_engine_rejects_all_work() {
        let ports = FakePorts::new();
        let phys = ports.add_physical("eth0");
        let driver = MockDriver::new();
        let engine = OffloadEngine::builder()
            .driver(driver.clone())
            .ports(ports.clone())
            .feature_enabled(false)
            .build()
            .unwrap();

        let flow = FakeFlow::new(0x2, phys, vec![A::Output(phys)]);
        let handle: FlowHandle = flow.clone();
        assert!(!engine.queue_put(handle, Op::Add, None));
        engine.join();
    }
}
