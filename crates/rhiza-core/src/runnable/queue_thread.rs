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

//! Runnable that drains a private dispatch queue on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::KeepAlive;
use crate::dispatch::DispatchQueue;
use crate::sync::locked;

use super::Runnable;

/// [`Runnable`] wrapping a [`DispatchQueue`] and the thread that serves it.
///
/// Work may be pended before the owning context runs; it sits in the queue
/// until the thread comes up. Faults raised by dispatched work are routed
/// through the owning context's fault filters.
///
/// A graceful [`stop`](Runnable::stop) pends the shutdown behind everything
/// already queued, so the backlog drains first; an immediate stop aborts the
/// queue and discards the backlog. Neither joins the thread; the join happens
/// on drop, unless the `QueueThread` is dropped from its own thread.
pub struct QueueThread {
    name: String,
    queue: Arc<DispatchQueue>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl QueueThread {
    /// Creates a queue thread. The serving thread starts with the context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(DispatchQueue::new()),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        }
    }

    /// The underlying queue.
    #[must_use]
    pub fn queue(&self) -> Arc<DispatchQueue> {
        Arc::clone(&self.queue)
    }

    /// Pends `work` for the serving thread. See [`DispatchQueue::pend`].
    pub fn pend(&self, work: impl FnOnce() + Send + 'static) -> bool {
        self.queue.pend(work)
    }

    /// Pends `work` to become ready at `ready_at`.
    pub fn pend_at(&self, ready_at: Instant, work: impl FnOnce() + Send + 'static) -> bool {
        self.queue.pend_at(ready_at, work)
    }

    /// Pends `work` to become ready after `delay`.
    pub fn pend_after(&self, delay: Duration, work: impl FnOnce() + Send + 'static) -> bool {
        self.queue.pend_after(delay, work)
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Runnable for QueueThread {
    fn start(&self, keep: KeepAlive) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("queue thread '{}' started twice", self.name);
            return false;
        }

        // Dispatch faults consult the owning context's filters. Weak so the
        // hook does not keep the context alive through the queue.
        let owner = Arc::downgrade(&keep.context());
        self.queue.set_fault_hook(Arc::new(move |fault| {
            owner.upgrade().is_some_and(|ctx| ctx.filter_fault(fault))
        }));

        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            while queue.wait_dispatch(None).is_ok() {}
            running.store(false, Ordering::SeqCst);
            drop(keep);
        });
        match spawned {
            Ok(handle) => {
                *locked(&self.join) = Some(handle);
                true
            }
            Err(err) => {
                log::error!("failed to spawn queue thread '{}': {err}", self.name);
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn stop(&self, graceful: bool) {
        if graceful {
            let queue = Arc::clone(&self.queue);
            if self.queue.pend(move || queue.abort()) {
                return;
            }
            // Full or already aborted; fall through to the hard stop.
        }
        self.queue.abort();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for QueueThread {
    fn drop(&mut self) {
        self.queue.abort();
        if let Some(handle) = locked(&self.join).take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("queue thread '{}' panicked", self.name);
            }
        }
    }
}

impl std::fmt::Debug for QueueThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use crate::context::Context;
    use crate::runnable::StopSignal;

    use super::*;

    #[test]
    fn pended_work_runs_on_the_serving_thread() {
        let root = Context::root();
        let qt = QueueThread::new("qt-serve");
        assert!(qt.start(root.keep_alive()));

        let (tx, rx) = mpsc::channel();
        assert!(qt.pend(move || {
            let name = thread::current().name().map(String::from);
            tx.send(name).ok();
        }));

        let served_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(served_on.as_deref(), Some("qt-serve"));

        qt.stop(false);
        drop(qt);
        assert!(root.is_quiescent());
    }

    #[test]
    fn graceful_stop_drains_the_backlog() {
        let root = Context::root();
        let qt = QueueThread::new("qt-drain");

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            assert!(qt.pend(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(qt.start(root.keep_alive()));
        qt.stop(true);
        drop(qt);

        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert!(root.is_quiescent());
    }

    #[test]
    fn immediate_stop_discards_the_backlog() {
        let root = Context::root();
        let qt = QueueThread::new("qt-abort");
        assert!(qt.start(root.keep_alive()));

        let (started_tx, started_rx) = mpsc::channel();
        let gate = StopSignal::new();
        let held = gate.clone();
        assert!(qt.pend(move || {
            started_tx.send(()).ok();
            held.wait();
        }));

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let hits = Arc::clone(&hits);
            qt.pend(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Wait until the gate item is actually running, then cut the rest.
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        qt.stop(false);
        gate.raise();
        drop(qt);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(root.is_quiescent());
    }

    #[test]
    fn second_start_is_refused() {
        let root = Context::root();
        let qt = QueueThread::new("qt-once");
        assert!(qt.start(root.keep_alive()));
        assert!(!qt.start(root.keep_alive()));
        qt.stop(false);
    }
}
