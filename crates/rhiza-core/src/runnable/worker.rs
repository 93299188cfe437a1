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

//! Dedicated-thread runnable driven by a stop signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::KeepAlive;
use crate::sync::{cv_wait, cv_wait_timeout, locked};

use super::Runnable;

struct SignalInner {
    stopped: Mutex<bool>,
    changed: Condvar,
}

/// Cooperative stop flag shared between a [`WorkerThread`] and its body.
///
/// Clones observe the same flag. The body polls it (or parks on it) and
/// returns once it is raised.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<SignalInner>,
}

impl StopSignal {
    /// Creates a signal that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                stopped: Mutex::new(false),
                changed: Condvar::new(),
            }),
        }
    }

    /// Raises the signal and wakes every waiter. Idempotent.
    pub fn raise(&self) {
        *locked(&self.inner.stopped) = true;
        self.inner.changed.notify_all();
    }

    /// True once the signal has been raised.
    #[must_use]
    pub fn raised(&self) -> bool {
        *locked(&self.inner.stopped)
    }

    /// Parks until the signal is raised.
    pub fn wait(&self) {
        let mut stopped = locked(&self.inner.stopped);
        while !*stopped {
            stopped = cv_wait(&self.inner.changed, stopped);
        }
    }

    /// Parks for at most `timeout`; returns `true` if the signal was raised.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = locked(&self.inner.stopped);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cv_wait_timeout(&self.inner.changed, stopped, deadline - now);
            stopped = guard;
        }
        true
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("raised", &self.raised())
            .finish()
    }
}

type WorkerBody = Box<dyn FnOnce(&StopSignal) + Send>;

/// [`Runnable`] that runs one closure on its own named OS thread.
///
/// The body receives a [`StopSignal`] and is expected to return promptly once
/// it is raised. [`stop`](Runnable::stop) only raises the signal; the thread
/// is joined when the `WorkerThread` is dropped, except when it is dropped
/// from its own thread, in which case the thread is detached.
pub struct WorkerThread {
    name: String,
    signal: StopSignal,
    body: Mutex<Option<WorkerBody>>,
    join: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl WorkerThread {
    /// Creates a worker that will run `body` once started.
    pub fn new(name: impl Into<String>, body: impl FnOnce(&StopSignal) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            signal: StopSignal::new(),
            body: Mutex::new(Some(Box::new(body))),
            join: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The stop signal handed to the body.
    #[must_use]
    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Runnable for WorkerThread {
    fn start(&self, keep: KeepAlive) -> bool {
        let Some(body) = locked(&self.body).take() else {
            log::warn!("worker thread '{}' started twice", self.name);
            return false;
        };

        let signal = self.signal.clone();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            body(&signal);
            running.store(false, Ordering::SeqCst);
            drop(keep);
        });
        match spawned {
            Ok(handle) => {
                *locked(&self.join) = Some(handle);
                true
            }
            Err(err) => {
                log::error!("failed to spawn worker thread '{}': {err}", self.name);
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn stop(&self, _graceful: bool) {
        // Both modes raise the signal; how quickly to wind down is the
        // body's call.
        self.signal.raise();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.signal.raise();
        if let Some(handle) = locked(&self.join).take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from its own body; joining would deadlock.
                return;
            }
            if handle.join().is_err() {
                log::warn!("worker thread '{}' panicked", self.name);
            }
        }
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use crate::context::Context;

    use super::*;

    #[test]
    fn signal_wait_for_times_out_until_raised() {
        let signal = StopSignal::new();
        assert!(!signal.wait_for(Duration::from_millis(10)));

        let waiter = signal.clone();
        let handle = thread::spawn(move || waiter.wait_for(Duration::from_secs(5)));
        signal.raise();
        assert!(handle.join().unwrap());
        assert!(signal.raised());
    }

    #[test]
    fn body_runs_until_signalled() {
        let root = Context::root();
        let (tx, rx) = mpsc::channel();
        let worker = WorkerThread::new("test-worker", move |signal| {
            tx.send(()).ok();
            signal.wait();
        });

        assert!(worker.start(root.keep_alive()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(()));
        assert!(worker.is_running());

        worker.stop(true);
        drop(worker);
        assert!(root.is_quiescent());
    }

    #[test]
    fn second_start_is_refused() {
        let root = Context::root();
        let worker = WorkerThread::new("one-shot", |signal| signal.wait());
        assert!(worker.start(root.keep_alive()));
        assert!(!worker.start(root.keep_alive()));
        worker.stop(false);
    }

    #[test]
    fn keep_alive_held_while_body_runs() {
        let root = Context::root();
        let gate = StopSignal::new();
        let body_gate = gate.clone();
        let worker = WorkerThread::new("holder", move |_signal| body_gate.wait());

        assert!(worker.start(root.keep_alive()));
        assert!(!root.is_quiescent());

        gate.raise();
        drop(worker);
        assert!(root.is_quiescent());
    }
}
