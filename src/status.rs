//! Offload status word.
//!
//! A flow's status is a small enum plus an `IN_PROGRESS` bit, matching the
//! producer/worker coalescing scheme in spec.md §4.1. Writers use release
//! ordering, readers use acquire, so that a consumer observing `FULL`/`MASK`
//! also observes every side effect the worker performed to get there.

use std::sync::atomic::{AtomicU8, Ordering};

/// The base offload state of a flow, independent of whether a request for it
/// is currently queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BaseStatus {
    /// Not offloaded, and nothing in flight.
    None = 0,
    /// Match-only offload: the NIC steers matching packets but actions still
    /// run in software.
    Mask = 1,
    /// Match and actions both offloaded.
    Full = 2,
    /// The driver rejected the flow (or a dependent composition rolled back).
    Failed = 3,
}

impl BaseStatus {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => BaseStatus::None,
            1 => BaseStatus::Mask,
            2 => BaseStatus::Full,
            3 => BaseStatus::Failed,
            _ => unreachable!("status word carries only two base bits"),
        }
    }
}

const IN_PROGRESS_BIT: u8 = 0x80;
const BASE_MASK: u8 = 0x7f;

/// An atomic `{ BaseStatus, IN_PROGRESS }` pair, as described in spec.md §3.
#[derive(Debug, Default)]
pub struct AtomicOffloadStatus(AtomicU8);

impl AtomicOffloadStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(BaseStatus::None as u8))
    }

    /// Current base status, ignoring `IN_PROGRESS`.
    pub fn base(&self) -> BaseStatus {
        BaseStatus::from_bits(self.0.load(Ordering::Acquire) & BASE_MASK)
    }

    /// Whether a producer request for this flow is queued or being worked.
    pub fn in_progress(&self) -> bool {
        self.0.load(Ordering::Acquire) & IN_PROGRESS_BIT != 0
    }

    /// Set `IN_PROGRESS` if not already set. Returns `true` if this call set
    /// it (the caller should enqueue), `false` if it was already set (the
    /// caller should coalesce, per §4.1).
    pub fn try_set_in_progress(&self) -> bool {
        let prev = self.0.fetch_or(IN_PROGRESS_BIT, Ordering::AcqRel);
        prev & IN_PROGRESS_BIT == 0
    }

    /// Clear `IN_PROGRESS` and commit a final base status. Used by the
    /// worker on completion and on drain (§4.5, §4.6).
    pub fn finish(&self, base: BaseStatus) {
        self.0.store(base as u8, Ordering::Release);
    }

    /// Set the base status of a flow that is *not* the one currently being
    /// dispatched (a composition counterpart touched as a side effect),
    /// preserving whatever `IN_PROGRESS` state it already has.
    pub fn set_base(&self, base: BaseStatus) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = (cur & IN_PROGRESS_BIT) | (base as u8);
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }
}
