// Copyright 2025 the rhiza authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred-work queues with bounded capacity and abort semantics.
//!
//! A [`DispatchQueue`] holds a FIFO ready sub-queue plus a delayed sub-queue
//! ordered by absolute readiness time (ties broken by pend order). Consumers
//! either poll with [`DispatchQueue::dispatch_one`] /
//! [`DispatchQueue::dispatch_all`] or block in
//! [`DispatchQueue::wait_dispatch`], which recomputes its wakeup deadline
//! whenever a nearer delayed item arrives.
//!
//! Capacity is a backpressure policy, not an error: once the ready queue is
//! at cap — and permanently once the queue is aborted — a pend reports
//! `false` and the work is dropped. Aborting closes the queue for good and
//! discards everything still queued without running it.

use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::fault::{Fault, FaultOrigin};
use crate::sync::{cv_wait, cv_wait_timeout, locked};

/// Boxed unit of deferred work.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Hook consulted when dispatched work panics; returns `true` when the fault
/// was consumed. Installed by the owner that knows which context the queue
/// serves.
pub type FaultHook = Arc<dyn Fn(&Fault) -> bool + Send + Sync>;

/// Default bound on the ready sub-queue.
pub const DEFAULT_DISPATCH_CAP: usize = 1024;

struct Delayed {
    ready_at: Instant,
    seq: u64,
    thunk: Thunk,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the std max-heap pops the earliest deadline, and within a
    // deadline the earliest pend.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    ready: VecDeque<Thunk>,
    delayed: BinaryHeap<Delayed>,
    cap: usize,
    aborted: bool,
    next_seq: u64,
}

impl QueueState {
    /// Moves every due delayed item into the ready queue. Promotion ignores
    /// the cap: the item was admitted when it was pended.
    fn promote_ready(&mut self, now: Instant) {
        if self.aborted {
            return;
        }
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(due) = self.delayed.pop() {
                self.ready.push_back(due.thunk);
            }
        }
    }

    fn soonest(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.ready_at)
    }
}

/// Why a blocking wait on a queue returned without dispatching.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue was aborted; nothing will ever be dispatched again.
    #[error("dispatch queue aborted")]
    Aborted,
    /// The caller's timeout elapsed with no ready work.
    #[error("timed out waiting for dispatchable work")]
    TimedOut,
}

/// A per-owner queue of deferred work items, immediate and time-delayed.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    updated: Condvar,
    fault_hook: Mutex<Option<FaultHook>>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    /// Creates an empty queue with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                cap: DEFAULT_DISPATCH_CAP,
                aborted: false,
                next_seq: 0,
            }),
            updated: Condvar::new(),
            fault_hook: Mutex::new(None),
        }
    }

    /// Caps the ready sub-queue. Shrinking below the current length only
    /// affects future pends.
    pub fn set_cap(&self, cap: usize) {
        let mut state = locked(&self.state);
        if !state.aborted {
            state.cap = cap;
        }
    }

    /// Installs the hook consulted when dispatched work panics.
    pub fn set_fault_hook(&self, hook: FaultHook) {
        *locked(&self.fault_hook) = Some(hook);
    }

    /// Queues `work` for immediate dispatch. Returns `false` — dropping the
    /// work — when the ready queue is at cap or the queue was aborted.
    pub fn pend(&self, work: impl FnOnce() + Send + 'static) -> bool {
        {
            let mut state = locked(&self.state);
            if state.ready.len() >= state.cap {
                drop(state);
                log::warn!("dispatch queue at capacity; dropping pended work");
                return false;
            }
            state.ready.push_back(Box::new(work));
        }
        self.updated.notify_all();
        true
    }

    /// Queues `work` to become ready at `when`. Returns `false` when the
    /// queue was aborted.
    pub fn pend_at(&self, when: Instant, work: impl FnOnce() + Send + 'static) -> bool {
        let wake;
        {
            let mut state = locked(&self.state);
            if state.aborted {
                drop(state);
                log::warn!("dispatch queue closed; dropping delayed work");
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.delayed.push(Delayed {
                ready_at: when,
                seq,
                thunk: Box::new(work),
            });
            // Wake a blocked waiter only when this item became the soonest
            // deadline while no ready work exists: the waiter may be asleep
            // until a far-future item and has to recompute.
            wake = state.ready.is_empty() && state.delayed.peek().is_some_and(|d| d.seq == seq);
        }
        if wake {
            self.updated.notify_all();
        }
        true
    }

    /// Queues `work` to become ready after `delay`.
    pub fn pend_after(&self, delay: Duration, work: impl FnOnce() + Send + 'static) -> bool {
        self.pend_at(Instant::now() + delay, work)
    }

    /// Promotes due delayed items, then runs exactly one ready item with the
    /// queue unlocked. Returns `false` when nothing was ready.
    pub fn dispatch_one(&self) -> bool {
        let (thunk, emptied) = {
            let mut state = locked(&self.state);
            state.promote_ready(Instant::now());
            let Some(thunk) = state.ready.pop_front() else {
                return false;
            };
            (thunk, state.ready.is_empty())
        };
        self.run_thunk(thunk, emptied);
        true
    }

    /// Dispatches until nothing is ready; returns how many items ran.
    pub fn dispatch_all(&self) -> usize {
        let mut count = 0;
        while self.dispatch_one() {
            count += 1;
        }
        count
    }

    /// Blocks until one item is dispatched, the queue aborts, or `timeout`
    /// elapses. The wait deadline tracks the soonest delayed item and is
    /// recomputed whenever a nearer one is pended.
    pub fn wait_dispatch(&self, timeout: Option<Duration>) -> Result<(), DispatchError> {
        let overall = timeout.map(|t| Instant::now() + t);
        let mut state = locked(&self.state);
        loop {
            state.promote_ready(Instant::now());
            if let Some(thunk) = state.ready.pop_front() {
                let emptied = state.ready.is_empty();
                drop(state);
                self.run_thunk(thunk, emptied);
                return Ok(());
            }
            if state.aborted {
                return Err(DispatchError::Aborted);
            }
            let now = Instant::now();
            if overall.is_some_and(|deadline| now >= deadline) {
                return Err(DispatchError::TimedOut);
            }
            let next = match (overall, state.soonest()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, b) => b,
            };
            state = match next {
                None => cv_wait(&self.updated, state),
                Some(deadline) => {
                    cv_wait_timeout(&self.updated, state, deadline.saturating_duration_since(now)).0
                }
            };
        }
    }

    /// Permanently closes the queue: drops every queued item uninvoked, caps
    /// future pends at zero, and wakes all waiters so they observe closure.
    pub fn abort(&self) {
        let (ready_n, delayed_n) = {
            let mut state = locked(&self.state);
            state.aborted = true;
            state.cap = 0;
            let counts = (state.ready.len(), state.delayed.len());
            state.ready.clear();
            state.delayed.clear();
            counts
        };
        if ready_n + delayed_n > 0 {
            log::debug!("dispatch queue aborted; dropped {ready_n} ready and {delayed_n} delayed items");
        }
        self.updated.notify_all();
    }

    /// Whether [`DispatchQueue::abort`] has run.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        locked(&self.state).aborted
    }

    /// Items currently queued, ready plus delayed.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = locked(&self.state);
        state.ready.len() + state.delayed.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one thunk outside the lock, notifying waiters when it emptied the
    /// ready queue (whether or not the thunk panicked). An unhandled panic
    /// resumes unwinding into the caller.
    fn run_thunk(&self, thunk: Thunk, emptied: bool) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(thunk));
        if emptied {
            self.updated.notify_all();
        }
        if let Err(payload) = outcome {
            let fault = Fault::from_panic(FaultOrigin::Dispatch, payload);
            let hook = locked(&self.fault_hook).clone();
            let handled = hook.is_some_and(|hook| hook(&fault));
            if !handled {
                panic::resume_unwind(fault.into_payload());
            }
            log::warn!("dispatched work panicked; fault consumed by filter chain");
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = locked(&self.state);
        f.debug_struct("DispatchQueue")
            .field("ready", &state.ready.len())
            .field("delayed", &state.delayed.len())
            .field("cap", &state.cap)
            .field("aborted", &state.aborted)
            .finish()
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Queued thunks are dropped, never run, on owner destruction.
        let state = locked(&self.state);
        if !state.ready.is_empty() || !state.delayed.is_empty() {
            log::trace!(
                "dispatch queue dropped with {} ready and {} delayed items",
                state.ready.len(),
                state.delayed.len()
            );
        }
    }
}
