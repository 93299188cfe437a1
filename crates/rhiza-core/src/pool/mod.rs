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

//! Pluggable executors a context forwards work to.
//!
//! Every context starts with a [`BufferPool`] placeholder that simply holds
//! submitted work. When the context reaches its running state it adopts a
//! real executor — an explicitly attached successor, the parent's pool, or
//! the process-wide [`default_pool`] — and the buffered backlog moves over in
//! one hand-off.
//!
//! Liveness is token-counted: [`ThreadPool::start`] returns a [`PoolToken`],
//! and an executor may wind down once every token it handed out is gone.
//! Contexts hold one token per adoption, so a pool shared down a context
//! subtree outlives every context still using it.

mod buffer;
mod os;

pub use buffer::BufferPool;
pub use os::{default_pool, OsPool};

use std::any::Any;
use std::sync::Arc;

use crate::dispatch::Thunk;

/// Keeps an executor alive. Clones share the same underlying token; the
/// executor may stop once the last clone drops.
#[derive(Clone)]
pub struct PoolToken {
    _keep: Arc<dyn Any + Send + Sync>,
}

impl PoolToken {
    pub(crate) fn new(keep: Arc<dyn Any + Send + Sync>) -> Self {
        Self { _keep: keep }
    }
}

impl std::fmt::Debug for PoolToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PoolToken")
    }
}

/// An executor that accepts fire-and-forget work.
pub trait ThreadPool: Send + Sync {
    /// Ensures the pool is running and returns a liveness token.
    fn start(self: Arc<Self>) -> PoolToken;

    /// Hands `work` to the pool. Never blocks on the work itself.
    fn submit(&self, work: Thunk);

    /// The placeholder pool returns itself here so a context can recognize
    /// it at adoption time without downcasting.
    fn as_buffer(&self) -> Option<&BufferPool> {
        None
    }
}
