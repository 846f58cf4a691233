//! The request queue and producer API (spec.md §3/§4.1, component C2).
//!
//! Single consumer, many producers. `processing` is true strictly while the
//! worker holds an item outside the mutex; `accepting` is the pause switch;
//! `exit` triggers an unconditional drain. All three live under the same
//! mutex as the FIFO so a pause is never racy with a push.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::debug;

use crate::action::Action;
use crate::flow::FlowHandle;
use crate::item::{Op, OffloadItem};
use crate::status::BaseStatus;

struct QueueState {
    items: VecDeque<OffloadItem>,
    processing: bool,
    exit: bool,
}

pub struct OffloadQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    accepting: AtomicBool,
}

impl OffloadQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                processing: false,
                exit: false,
            }),
            cv: Condvar::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// `queue_put` / `queue_del` (spec.md §4.1). `op` is `Add`/`Mod` for the
    /// former and `Del` for the latter; `queue_del` never carries prior
    /// actions.
    pub fn put(&self, flow: FlowHandle, prior_actions: Option<Vec<Action>>, op: Op) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }

        let mut state = self.state.lock().unwrap();
        if flow.status().in_progress() {
            debug!(ufid = %format_args!("{:032x}", flow.ufid()), ?op, "coalescing: already in progress");
            return false;
        }
        if !flow.try_ref() {
            debug!(ufid = %format_args!("{:032x}", flow.ufid()), "flow ref acquisition failed, aborting enqueue");
            return false;
        }
        flow.status().try_set_in_progress();
        state.items.push_back(OffloadItem::new(flow, op, prior_actions));
        let should_wake = !state.processing;
        drop(state);
        if should_wake {
            self.cv.notify_one();
        }
        true
    }

    pub fn del(&self, flow: FlowHandle) -> bool {
        self.put(flow, None, Op::Del)
    }

    /// Block until an item is available or `exit` is set. Returns `None`
    /// only when told to exit with an empty queue.
    pub(crate) fn wait_pop(&self) -> Option<OffloadItem> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                state.processing = true;
                return Some(item);
            }
            if state.exit {
                return None;
            }
            state.processing = false;
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Drain every remaining item, resetting each flow's status to `NONE`
    /// (spec.md §4.5 "Drain").
    pub(crate) fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(item) = state.items.pop_front() {
            item.flow.status().finish(BaseStatus::None);
            item.flow.unref();
        }
        state.processing = false;
    }

    pub(crate) fn set_exit(&self, exit: bool) {
        let mut state = self.state.lock().unwrap();
        state.exit = exit;
        drop(state);
        self.cv.notify_all();
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// `pause`: CAS `accepting` false, then spin until the worker is idle
    /// and the queue is empty (spec.md §4.6).
    pub fn pause(&self) -> bool {
        let prev = self.accepting.swap(false, Ordering::SeqCst);
        loop {
            let state = self.state.lock().unwrap();
            if !state.processing && state.items.is_empty() {
                return prev;
            }
            drop(state);
            self.cv.notify_all();
            std::thread::yield_now();
        }
    }

    pub fn resume(&self, prev: bool) {
        self.accepting.store(prev, Ordering::SeqCst);
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.state.lock().unwrap().processing
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }
}

impl Default for OffloadQueue {
    fn default() -> Self {
        Self::new()
    }
}
