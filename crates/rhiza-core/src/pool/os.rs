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

//! Executor backed by a fixed set of OS threads.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::dispatch::Thunk;
use crate::fault::{Fault, FaultOrigin};
use crate::sync::{cv_wait, locked};

use super::{PoolToken, ThreadPool};

struct PoolQueue {
    work: VecDeque<Thunk>,
    /// Outstanding liveness tokens. Workers exit once this reaches zero
    /// and the backlog is drained.
    tokens: usize,
    /// Worker threads currently alive.
    workers: usize,
}

struct PoolCore {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

/// Fixed-width pool of named OS threads.
///
/// Worker threads are spawned lazily on [`ThreadPool::start`] and wind down
/// once every [`PoolToken`] is dropped, draining any remaining backlog on the
/// way out. A later `start` revives the pool.
pub struct OsPool {
    core: Arc<PoolCore>,
    threads: usize,
}

impl OsPool {
    /// Creates a pool that will run at most `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            core: Arc::new(PoolCore {
                queue: Mutex::new(PoolQueue {
                    work: VecDeque::new(),
                    tokens: 0,
                    workers: 0,
                }),
                available: Condvar::new(),
            }),
            threads: threads.max(1),
        }
    }

    /// Configured worker count.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl ThreadPool for OsPool {
    fn start(self: Arc<Self>) -> PoolToken {
        let mut queue = locked(&self.core.queue);
        queue.tokens += 1;
        while queue.workers < self.threads {
            queue.workers += 1;
            let name = format!("rhiza-pool-{}", queue.workers);
            let core = Arc::clone(&self.core);
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(core));
            if let Err(err) = spawned {
                queue.workers -= 1;
                log::error!("failed to spawn pool worker: {err}");
                break;
            }
        }
        drop(queue);
        PoolToken::new(Arc::new(TokenGuard {
            core: Arc::clone(&self.core),
        }))
    }

    fn submit(&self, work: Thunk) {
        locked(&self.core.queue).work.push_back(work);
        self.core.available.notify_one();
    }
}

impl std::fmt::Debug for OsPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = locked(&self.core.queue);
        f.debug_struct("OsPool")
            .field("threads", &self.threads)
            .field("workers", &queue.workers)
            .field("tokens", &queue.tokens)
            .field("backlog", &queue.work.len())
            .finish()
    }
}

struct TokenGuard {
    core: Arc<PoolCore>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        let mut queue = locked(&self.core.queue);
        queue.tokens = queue.tokens.saturating_sub(1);
        let idle_out = queue.tokens == 0;
        drop(queue);
        if idle_out {
            self.core.available.notify_all();
        }
    }
}

fn worker_loop(core: Arc<PoolCore>) {
    let mut queue = locked(&core.queue);
    loop {
        if let Some(work) = queue.work.pop_front() {
            drop(queue);
            run_pooled(work);
            queue = locked(&core.queue);
            continue;
        }
        if queue.tokens == 0 {
            queue.workers -= 1;
            break;
        }
        queue = cv_wait(&core.available, queue);
    }
}

fn run_pooled(work: Thunk) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
        let fault = Fault::from_panic(FaultOrigin::Pool, payload);
        log::warn!("pooled work panicked: {}", fault.message());
    }
}

/// Process-wide pool sized to the machine, shared by contexts that were never
/// told which executor to use.
pub fn default_pool() -> Arc<OsPool> {
    static DEFAULT: OnceLock<Arc<OsPool>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| {
        let threads = thread::available_parallelism().map_or(4, NonZeroUsize::get);
        Arc::new(OsPool::new(threads))
    }))
}
