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

//! Mutable state behind each context's single lock.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::fault::FaultFilter;
use crate::junction::RouteRecord;
use crate::pool::{BufferPool, PoolToken, ThreadPool};
use crate::runnable::Runnable;
use crate::sync::locked;
use crate::wiring::{Descriptor, MemoEntry};

use super::{Context, ContextState, CreationWatcher, Member};

/// One position in a parent's child table.
///
/// A slot is reserved before the child is built, goes live once the child's
/// initializer succeeds, and is vacated exactly once — either by the failed
/// construction or by the child's own drop (guarded by pointer identity, so
/// a reused slot is never clobbered by a stale drop).
pub(crate) enum ChildSlot {
    Reserved,
    Live(Weak<Context>),
    Empty,
}

pub(crate) struct RunnableEntry {
    pub runnable: Arc<dyn Runnable>,
    /// Set once a launch was attempted, so promotion and concurrent adds
    /// never race the same runnable into two starts.
    pub launched: bool,
}

pub(crate) struct WatcherEntry {
    /// Restricts the watcher to children carrying this name; `None` watches
    /// every child.
    pub name: Option<&'static str>,
    pub watcher: Arc<dyn CreationWatcher>,
}

/// Everything a context guards with its one mutex.
pub(crate) struct ContextBody {
    pub state: ContextState,
    pub children: Vec<ChildSlot>,
    pub memos: HashMap<TypeId, MemoEntry>,
    pub concretes: Vec<Descriptor>,
    pub members: Vec<Arc<dyn Member>>,
    pub runnables: Vec<RunnableEntry>,
    /// Indices of runnables currently inside their `start` call. The
    /// teardown pass skips them; each launcher observes the terminal state
    /// when `start` returns and stops its runnable itself.
    pub starting: Vec<usize>,
    pub local_routes: Vec<RouteRecord>,
    /// Routes registered before initiation; attached when the context leaves
    /// its dormant states.
    pub delayed_routes: Vec<RouteRecord>,
    pub filters: Vec<Arc<dyn FaultFilter>>,
    pub watchers: Vec<WatcherEntry>,
    pub pool: Option<Arc<dyn ThreadPool>>,
    pub pool_token: Option<PoolToken>,
    /// Tracks live [`KeepAlive`] handles without owning them. Quiescence
    /// checks read the strong count; upgrading here is never safe because the
    /// upgraded handle could become the last one and re-enter this lock on
    /// drop.
    pub outstanding: Weak<KeepAliveCore>,
}

impl ContextBody {
    pub fn new(initial: ContextState) -> Self {
        Self {
            state: initial,
            children: Vec::new(),
            memos: HashMap::new(),
            concretes: Vec::new(),
            members: Vec::new(),
            runnables: Vec::new(),
            starting: Vec::new(),
            local_routes: Vec::new(),
            delayed_routes: Vec::new(),
            filters: Vec::new(),
            watchers: Vec::new(),
            pool: Some(Arc::new(BufferPool::new())),
            pool_token: None,
            outstanding: Weak::new(),
        }
    }

    /// Claims a child slot, reusing the first vacated one.
    pub fn reserve_child_slot(&mut self) -> usize {
        if let Some(index) = self
            .children
            .iter()
            .position(|slot| matches!(slot, ChildSlot::Empty))
        {
            self.children[index] = ChildSlot::Reserved;
            index
        } else {
            self.children.push(ChildSlot::Reserved);
            self.children.len() - 1
        }
    }

    /// Snapshot of the children still alive.
    pub fn live_children(&self) -> Vec<Arc<Context>> {
        self.children
            .iter()
            .filter_map(|slot| match slot {
                ChildSlot::Live(weak) => weak.upgrade(),
                _ => None,
            })
            .collect()
    }
}

/// A context's lock and the condvar its state transitions pulse.
pub(crate) struct StateBlock {
    pub body: Mutex<ContextBody>,
    pub changed: Condvar,
}

impl StateBlock {
    pub fn new(initial: ContextState) -> Self {
        Self {
            body: Mutex::new(ContextBody::new(initial)),
            changed: Condvar::new(),
        }
    }
}

/// Marks its context as having outstanding work.
///
/// Runnables hold the handle they were started with for as long as they are
/// genuinely active; [`Context::wait`] completes only once the context is
/// terminal and every handle is gone. Clones share one underlying count.
#[derive(Clone)]
pub struct KeepAlive {
    core: Arc<KeepAliveCore>,
}

impl KeepAlive {
    pub(crate) fn new(core: Arc<KeepAliveCore>) -> Self {
        Self { core }
    }

    /// The context this handle keeps busy.
    #[must_use]
    pub fn context(&self) -> Arc<Context> {
        Arc::clone(&self.core.ctx)
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("context", &self.core.ctx.id())
            .finish()
    }
}

pub(crate) struct KeepAliveCore {
    pub ctx: Arc<Context>,
}

impl Drop for KeepAliveCore {
    fn drop(&mut self) {
        // The count is already zero. Wake waiters on this context and every
        // ancestor, taking each lock briefly so a waiter between its check
        // and its park cannot miss the pulse.
        let mut scope: Option<&Context> = Some(&self.ctx);
        while let Some(ctx) = scope {
            drop(locked(&ctx.block.body));
            ctx.block.changed.notify_all();
            scope = ctx.parent.as_deref();
        }
    }
}
