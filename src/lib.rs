//! Asynchronous hardware flow-offload worker with tunnel-aware composition.
//!
//! A single background thread ([`engine`]) drains a producer/consumer
//! queue ([`queue`]) of software-installed flow changes and programs them
//! into NIC hardware through a [`driver::Driver`]. Flows whose actions pop
//! a tunnel and flows that match on the decapsulated side are composed
//! into single hardware entries by [`compose`]; everything else goes
//! through the [`normal`] path unmodified.
//!
//! External collaborators this crate depends on but does not own —
//! flows, netdevs, and the driver itself — are expressed as traits
//! ([`flow::Flow`], [`netdev::Netdev`]/[`netdev::NetdevProvider`],
//! [`driver::Driver`]) with in-memory fakes under each module's
//! `test_support`, so the engine is exercised end-to-end without any
//! real hardware.

pub mod action;
pub mod aux;
pub mod compose;
pub mod driver;
pub mod dump;
pub mod engine;
pub mod error;
pub mod flow;
pub mod item;
pub mod netdev;
pub mod normal;
pub mod queue;
pub mod stats;
pub mod status;
mod worker;

pub use driver::{Driver, DriverError, DriverStats, PutInfo, PutOutcome};
pub use dump::VtpDump;
pub use engine::{global, global_init, EngineBuilder, EngineConfig, OffloadEngine};
pub use error::BuildError;
pub use flow::{Flow, FlowHandle, Ufid};
pub use item::Op;
pub use netdev::{Netdev, NetdevProvider, PortId};
pub use status::{AtomicOffloadStatus, BaseStatus};
