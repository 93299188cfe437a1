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

//! Placeholder executor that buffers work until a real pool takes over.

use std::sync::{Arc, Mutex};

use crate::dispatch::Thunk;
use crate::sync::locked;

use super::{PoolToken, ThreadPool};

#[derive(Default)]
struct BufferState {
    buffered: Vec<Thunk>,
    successor: Option<Arc<dyn ThreadPool>>,
}

/// Inert [`ThreadPool`] every context starts with.
///
/// Work submitted before the owning context runs lands here. The context
/// may be told ahead of time which executor to adopt via [`set_successor`];
/// at adoption it calls [`hand_off`] and replays the backlog into whichever
/// pool won.
///
/// [`set_successor`]: BufferPool::set_successor
/// [`hand_off`]: BufferPool::hand_off
#[derive(Default)]
pub struct BufferPool {
    state: Mutex<BufferState>,
}

impl BufferPool {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the executor the owning context should adopt when it runs.
    pub fn set_successor(&self, pool: Arc<dyn ThreadPool>) {
        locked(&self.state).successor = Some(pool);
    }

    /// Takes the designated successor (if any) and the buffered backlog,
    /// leaving the buffer empty.
    pub fn hand_off(&self) -> (Option<Arc<dyn ThreadPool>>, Vec<Thunk>) {
        let mut state = locked(&self.state);
        (state.successor.take(), std::mem::take(&mut state.buffered))
    }

    /// Number of buffered items, for diagnostics.
    #[must_use]
    pub fn backlog(&self) -> usize {
        locked(&self.state).buffered.len()
    }
}

impl ThreadPool for BufferPool {
    fn start(self: Arc<Self>) -> PoolToken {
        // Nothing to spin up; the token only pins the buffer itself.
        PoolToken::new(self)
    }

    fn submit(&self, work: Thunk) {
        locked(&self.state).buffered.push(work);
    }

    fn as_buffer(&self) -> Option<&BufferPool> {
        Some(self)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = locked(&self.state);
        f.debug_struct("BufferPool")
            .field("backlog", &state.buffered.len())
            .field("has_successor", &state.successor.is_some())
            .finish()
    }
}
