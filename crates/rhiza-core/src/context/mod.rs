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

//! The context tree and its lifecycle.
//!
//! A [`Context`] is one scope in a tree: it owns injected objects, the memo
//! table that resolves types against its lineage, the event junctions for its
//! scope, its runnables, and an executor binding. Children hold their parent
//! alive; parents refer to children weakly through reserved slots, so a
//! dropped child vacates exactly its own slot.
//!
//! # Lifecycle
//!
//! Every context moves through a one-way state machine:
//!
//! ```text
//! NotStarted ──initiate──> Initiated ──parent runs──> Running ──> Shutdown
//!     │                                                  ▲
//!     └──parent already running──> CanRun ──initiate─────┘
//!
//! any non-terminal state ──shutdown──> Abandoned (never ran) / Shutdown (ran)
//! ```
//!
//! A root context has no parent to wait for, so initiating it runs it
//! directly and promotes its subtree. Initiating a child under a dormant
//! parent parks it in `Initiated`; the context holds itself alive from that
//! point, because initiation is a promise to run that the parent redeems
//! later. Terminal states are permanent.
//!
//! Teardown walks the subtree with an explicit worklist, never holding two
//! context locks at once: one pass marks states and detaches routes top-down,
//! a second stops runnables bottom-up, newest first, so children wind down
//! before the machinery under them goes away. [`Context::wait`] then parks
//! until every [`KeepAlive`] handed to runnables has been dropped.

mod current;
mod routes;
mod state;
mod wiring;

pub use current::CurrentGuard;
pub use state::KeepAlive;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::attr::AttrStore;
use crate::error::ContextError;
use crate::fault::{Fault, FaultFilter};
use crate::junction::JunctionManager;
use crate::observe::{self, RuntimeEvent};
use crate::pool::{default_pool, ThreadPool};
use crate::runnable::Runnable;
use crate::sync::{cv_wait, cv_wait_timeout, locked};

use state::{ChildSlot, KeepAliveCore, RunnableEntry, StateBlock, WatcherEntry};

/// Unique identity of a context, stable for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of a context in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Created; neither this context nor its parent has been told to run.
    NotStarted,
    /// The parent is running; this context starts the moment it is initiated.
    CanRun,
    /// Initiated ahead of its parent; runs as soon as the parent does.
    Initiated,
    /// Actively running: runnables started, executor adopted, routes live.
    Running,
    /// Terminal. Was running, then shut down.
    Shutdown,
    /// Terminal. Torn down without ever running.
    Abandoned,
}

impl ContextState {
    /// Whether this state can never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextState::Shutdown | ContextState::Abandoned)
    }

    /// Whether the context is actively running.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, ContextState::Running)
    }
}

/// How eagerly a shutdown treats in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let queued work drain before threads exit.
    Graceful,
    /// Discard queued work; wind down as fast as an orderly exit allows.
    Immediate,
}

/// An injected object that wants to hear about its context's teardown.
///
/// Called once, after the context has gone terminal, while the context is
/// being dropped.
pub trait Member: Send + Sync {
    /// The owning context is going away.
    fn on_teardown(&self, ctx: &Context);
}

/// Observer of child construction in a context's subtree.
pub trait CreationWatcher: Send + Sync {
    /// A child context finished construction anywhere below the context this
    /// watcher was registered on.
    fn context_created(&self, child: &Arc<Context>);
}

/// One scope in the context tree.
///
/// Contexts are always handled through `Arc`; most operations take
/// `&Arc<Self>` because they hand the context to other threads or record it
/// in children. See the [module docs](self) for the lifecycle.
pub struct Context {
    id: ContextId,
    name: Option<&'static str>,
    parent: Option<Arc<Context>>,
    /// Index of this context in its parent's child table.
    slot: Option<usize>,
    block: StateBlock,
    junctions: JunctionManager,
    attrs: AttrStore,
}

impl Context {
    /// Creates an unnamed root context in [`ContextState::NotStarted`].
    #[must_use]
    pub fn root() -> Arc<Self> {
        Self::build(None, None, ContextState::NotStarted, None)
    }

    /// Creates a named root context.
    #[must_use]
    pub fn root_named(name: &'static str) -> Arc<Self> {
        Self::build(None, None, ContextState::NotStarted, Some(name))
    }

    fn build(
        parent: Option<Arc<Context>>,
        slot: Option<usize>,
        initial: ContextState,
        name: Option<&'static str>,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            id: ContextId::fresh(),
            name,
            parent,
            slot,
            block: StateBlock::new(initial),
            junctions: JunctionManager::default(),
            attrs: AttrStore::new(),
        });

        // Attributes inherit at creation time, nearest ancestor winning.
        let mut scope = ctx.parent.as_deref();
        while let Some(ancestor) = scope {
            ctx.attrs.seed_missing_from(&ancestor.attrs);
            scope = ancestor.parent.as_deref();
        }

        observe::emit(RuntimeEvent::ContextCreated {
            id: ctx.id,
            parent: ctx.parent.as_ref().map(|p| p.id),
            name,
        });
        log::debug!(
            "context {} created (name: {:?}, parent: {:?})",
            ctx.id,
            name,
            ctx.parent.as_ref().map(|p| p.id)
        );
        ctx
    }

    /// Creates an unnamed child. See [`create_child_named`].
    ///
    /// [`create_child_named`]: Context::create_child_named
    pub fn create_child<F>(self: &Arc<Self>, initializer: F) -> Result<Arc<Context>, ContextError>
    where
        F: FnOnce(&Arc<Context>) -> anyhow::Result<()>,
    {
        self.create_child_inner(None, initializer)
    }

    /// Creates a named child context and runs `initializer` against it with
    /// the child current on this thread.
    ///
    /// The child's slot in this context is reserved before the initializer
    /// runs; on failure the slot is vacated, the partial child is torn down,
    /// and the error is returned. Creation watchers fire only after the
    /// child is fully constructed and linked.
    ///
    /// Creating a child under a terminal context still builds and
    /// initializes it, but the child comes back already terminal, is never
    /// linked into the tree, and no watcher hears about it.
    pub fn create_child_named<F>(
        self: &Arc<Self>,
        name: &'static str,
        initializer: F,
    ) -> Result<Arc<Context>, ContextError>
    where
        F: FnOnce(&Arc<Context>) -> anyhow::Result<()>,
    {
        self.create_child_inner(Some(name), initializer)
    }

    fn create_child_inner<F>(
        self: &Arc<Self>,
        name: Option<&'static str>,
        initializer: F,
    ) -> Result<Arc<Context>, ContextError>
    where
        F: FnOnce(&Arc<Context>) -> anyhow::Result<()>,
    {
        let (slot, initial) = {
            let mut body = locked(&self.block.body);
            if body.state.is_terminal() {
                (None, ContextState::NotStarted)
            } else {
                let initial = if body.state.is_running() {
                    ContextState::CanRun
                } else {
                    ContextState::NotStarted
                };
                (Some(body.reserve_child_slot()), initial)
            }
        };

        let child = Self::build(Some(Arc::clone(self)), slot, initial, name);

        let seeded = {
            let _current = child.make_current();
            initializer(&child)
        };
        if let Err(source) = seeded {
            if let Some(slot) = slot {
                self.vacate_reserved(slot);
            }
            return Err(ContextError::Initializer {
                name: name.unwrap_or("<unnamed>").to_string(),
                source,
            });
        }

        let Some(slot) = slot else {
            // Parent is already gone; hand back a child that is already over.
            child.signal_shutdown(false, ShutdownMode::Graceful);
            return Ok(child);
        };

        let parent_terminal = {
            let mut body = locked(&self.block.body);
            if let Some(entry) = body.children.get_mut(slot) {
                *entry = ChildSlot::Live(Arc::downgrade(&child));
            }
            body.state.is_terminal()
        };
        if parent_terminal {
            // Teardown raced the construction; the cascade missed a slot
            // that was still reserved, so finish the job here.
            child.signal_shutdown(false, ShutdownMode::Graceful);
            return Ok(child);
        }

        self.notify_created(&child);
        Ok(child)
    }

    /// Fires creation watchers on this context and its ancestors.
    fn notify_created(&self, child: &Arc<Context>) {
        let mut scope: Option<&Context> = Some(self);
        while let Some(ctx) = scope {
            let watchers: Vec<Arc<dyn CreationWatcher>> = {
                let body = locked(&ctx.block.body);
                body.watchers
                    .iter()
                    .filter(|entry| entry.name.is_none() || entry.name == child.name)
                    .map(|entry| Arc::clone(&entry.watcher))
                    .collect()
            };
            for watcher in watchers {
                watcher.context_created(child);
            }
            scope = ctx.parent.as_deref();
        }
    }

    /// Registers a watcher for every child created in this subtree.
    pub fn watch_children(&self, watcher: Arc<dyn CreationWatcher>) {
        locked(&self.block.body).watchers.push(WatcherEntry {
            name: None,
            watcher,
        });
    }

    /// Registers a watcher for children created with the given name.
    pub fn watch_children_named(&self, name: &'static str, watcher: Arc<dyn CreationWatcher>) {
        locked(&self.block.body).watchers.push(WatcherEntry {
            name: Some(name),
            watcher,
        });
    }

    /// Declares that this context should run.
    ///
    /// A root (or a child whose parent is already running) starts
    /// immediately: it adopts an executor, starts its runnables, attaches
    /// delayed event routes, and promotes its descendants. A child whose
    /// parent is still dormant parks in [`ContextState::Initiated`] and holds
    /// itself alive until the parent runs. Initiating a context twice, or a
    /// terminal context, does nothing.
    pub fn initiate(self: &Arc<Self>) {
        let (next, delayed) = {
            let mut body = locked(&self.block.body);
            let next = match body.state {
                ContextState::NotStarted if self.parent.is_none() => ContextState::Running,
                ContextState::NotStarted => ContextState::Initiated,
                ContextState::CanRun => ContextState::Running,
                _ => return,
            };
            body.state = next;
            (next, std::mem::take(&mut body.delayed_routes))
        };
        self.block.changed.notify_all();
        observe::emit(RuntimeEvent::StateChanged {
            id: self.id,
            state: next,
        });
        log::debug!("context {} initiated -> {:?}", self.id, next);

        if !delayed.is_empty() {
            self.attach_routes(&delayed);
            locked(&self.block.body).local_routes.extend(delayed);
        }

        if next == ContextState::Initiated {
            self.add_runnable(Arc::new(InitiateHold::new(Arc::clone(self))));
        } else {
            self.finish_running();
            self.transition_children();
        }
    }

    /// Completes the transition into [`ContextState::Running`]: adopts a real
    /// executor and starts every runnable registered while dormant.
    fn finish_running(self: &Arc<Self>) {
        let placeholder = locked(&self.block.body).pool.clone();
        if let Some(current) = placeholder {
            if let Some(buffer) = current.as_buffer() {
                let (successor, backlog) = buffer.hand_off();
                let target = successor.unwrap_or_else(|| self.inherited_pool());
                let token = Arc::clone(&target).start();
                {
                    let mut body = locked(&self.block.body);
                    let unchanged = body
                        .pool
                        .as_ref()
                        .is_some_and(|pool| Arc::ptr_eq(pool, &current));
                    if unchanged && !body.state.is_terminal() {
                        body.pool = Some(target);
                        body.pool_token = Some(token);
                    }
                    // A racing set_pool or shutdown won; our token unwinds.
                }
                for work in backlog {
                    self.submit_boxed(work);
                }
            }
        }

        let pending: Vec<(usize, Arc<dyn Runnable>)> = {
            let mut body = locked(&self.block.body);
            body.runnables
                .iter_mut()
                .enumerate()
                .filter(|(_, entry)| !entry.launched)
                .map(|(index, entry)| {
                    entry.launched = true;
                    (index, Arc::clone(&entry.runnable))
                })
                .collect()
        };
        for (index, runnable) in pending {
            self.launch_runnable(index, runnable);
        }
    }

    /// Nearest running ancestor's executor, or the process default.
    fn inherited_pool(&self) -> Arc<dyn ThreadPool> {
        let mut scope = self.parent.as_deref();
        while let Some(ctx) = scope {
            if let Some(pool) = locked(&ctx.block.body).pool.clone() {
                if pool.as_buffer().is_none() {
                    return pool;
                }
            }
            scope = ctx.parent.as_deref();
        }
        default_pool()
    }

    /// Promotes descendants after this context started running: `NotStarted`
    /// children become `CanRun`, `Initiated` children start running and
    /// promote their own subtrees in turn.
    fn transition_children(self: &Arc<Self>) {
        let mut worklist: Vec<Arc<Context>> = vec![Arc::clone(self)];
        while let Some(ctx) = worklist.pop() {
            let children = locked(&ctx.block.body).live_children();
            for child in children {
                let promoted = {
                    let mut body = locked(&child.block.body);
                    match body.state {
                        ContextState::NotStarted => {
                            body.state = ContextState::CanRun;
                            Some(ContextState::CanRun)
                        }
                        ContextState::Initiated => {
                            body.state = ContextState::Running;
                            Some(ContextState::Running)
                        }
                        _ => None,
                    }
                };
                let Some(next) = promoted else { continue };
                child.block.changed.notify_all();
                observe::emit(RuntimeEvent::StateChanged {
                    id: child.id,
                    state: next,
                });
                log::debug!("context {} promoted -> {:?}", child.id, next);
                if next == ContextState::Running {
                    child.finish_running();
                    worklist.push(child);
                }
            }
        }
    }

    /// Registers `runnable` with this context.
    ///
    /// Started immediately if the context is running, otherwise when it
    /// starts. On a terminal context the runnable is not kept; it receives an
    /// immediate `stop(false)` so it can release anything it holds.
    pub fn add_runnable(self: &Arc<Self>, runnable: Arc<dyn Runnable>) {
        let launch = {
            let mut body = locked(&self.block.body);
            if body.state.is_terminal() {
                None
            } else {
                let index = body.runnables.len();
                let launch_now = body.state.is_running();
                body.runnables.push(RunnableEntry {
                    runnable: Arc::clone(&runnable),
                    launched: launch_now,
                });
                Some(launch_now.then_some(index))
            }
        };
        match launch {
            Some(Some(index)) => self.launch_runnable(index, runnable),
            Some(None) => {}
            None => runnable.stop(false),
        }
    }

    fn launch_runnable(self: &Arc<Self>, index: usize, runnable: Arc<dyn Runnable>) {
        {
            let mut body = locked(&self.block.body);
            if !body.state.is_running() {
                return;
            }
            body.starting.push(index);
        }
        let started = runnable.start(self.keep_alive());
        let now_terminal = {
            let mut body = locked(&self.block.body);
            body.starting.retain(|&i| i != index);
            body.state.is_terminal()
        };
        if started && now_terminal {
            // Shutdown swept past while this start was in flight; it skipped
            // us, so deliver the stop it owed.
            runnable.stop(false);
        }
    }

    /// Shuts down this context and its entire subtree.
    ///
    /// States flip top-down and every route detaches; runnables then stop
    /// bottom-up, newest first, so child machinery is gone before what it
    /// depends on. With `wait`, blocks until the subtree is terminal and
    /// quiescent. Safe to call repeatedly; later calls only wait.
    pub fn signal_shutdown(self: &Arc<Self>, wait: bool, mode: ShutdownMode) {
        let mut stack: Vec<Arc<Context>> = vec![Arc::clone(self)];
        let mut visited: Vec<Vec<Arc<dyn Runnable>>> = Vec::new();

        while let Some(ctx) = stack.pop() {
            if let Some((to_stop, children)) = ctx.shutdown_mark(mode) {
                visited.push(to_stop);
                // Pushed newest-first so marking visits oldest subtrees
                // first; the reversed pass below then stops newest-first,
                // children before parents.
                stack.extend(children.into_iter().rev());
            }
        }

        let graceful = mode == ShutdownMode::Graceful;
        for to_stop in visited.iter().rev() {
            for runnable in to_stop.iter().rev() {
                runnable.stop(graceful);
            }
        }

        if wait {
            self.wait();
        }
    }

    /// Flips this context terminal and strips it: takes the executor, drains
    /// the route lists, and reports what phase two must stop.
    fn shutdown_mark(
        self: &Arc<Self>,
        mode: ShutdownMode,
    ) -> Option<(Vec<Arc<dyn Runnable>>, Vec<Arc<Context>>)> {
        let (next, to_stop, children, routes, pool, token) = {
            let mut body = locked(&self.block.body);
            if body.state.is_terminal() {
                return None;
            }
            let next = if body.state.is_running() {
                ContextState::Shutdown
            } else {
                ContextState::Abandoned
            };
            body.state = next;
            let to_stop: Vec<Arc<dyn Runnable>> = body
                .runnables
                .iter()
                .enumerate()
                .filter(|(index, _)| !body.starting.contains(index))
                .map(|(_, entry)| Arc::clone(&entry.runnable))
                .collect();
            let children = body.live_children();
            let mut routes = std::mem::take(&mut body.local_routes);
            routes.extend(std::mem::take(&mut body.delayed_routes));
            let pool = body.pool.take();
            let token = body.pool_token.take();
            (next, to_stop, children, routes, pool, token)
        };
        self.block.changed.notify_all();
        observe::emit(RuntimeEvent::StateChanged {
            id: self.id,
            state: next,
        });
        log::debug!("context {} -> {:?} ({:?})", self.id, next, mode);

        self.detach_routes(&routes);
        drop(pool);
        drop(token);
        Some((to_stop, children))
    }

    /// Blocks until this context is terminal and its subtree has no
    /// outstanding work.
    pub fn wait(&self) {
        let mut body = locked(&self.block.body);
        while !(body.state.is_terminal() && self.quiescent_locked(&body)) {
            body = cv_wait(&self.block.changed, body);
        }
    }

    /// Like [`wait`](Context::wait) with a deadline. Returns `false` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut body = locked(&self.block.body);
        while !(body.state.is_terminal() && self.quiescent_locked(&body)) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cv_wait_timeout(&self.block.changed, body, deadline - now);
            body = guard;
        }
        true
    }

    /// True when no [`KeepAlive`] is outstanding here or below.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let body = locked(&self.block.body);
        self.quiescent_locked(&body)
    }

    fn quiescent_locked(&self, body: &state::ContextBody) -> bool {
        if body.outstanding.strong_count() != 0 {
            return false;
        }
        body.children.iter().all(|slot| match slot {
            ChildSlot::Live(weak) => weak.upgrade().map_or(true, |child| child.is_quiescent()),
            _ => true,
        })
    }

    /// Returns a handle marking this context as having outstanding work.
    ///
    /// All live handles share one count; [`wait`](Context::wait) completes
    /// only after the last one drops.
    #[must_use]
    pub fn keep_alive(self: &Arc<Self>) -> KeepAlive {
        let mut body = locked(&self.block.body);
        if let Some(core) = body.outstanding.upgrade() {
            return KeepAlive::new(core);
        }
        let core = Arc::new(KeepAliveCore {
            ctx: Arc::clone(self),
        });
        body.outstanding = Arc::downgrade(&core);
        KeepAlive::new(core)
    }

    /// Hands `work` to this context's executor.
    ///
    /// Before the context runs, work buffers and replays on the adopted
    /// executor in submission order. After teardown the work is dropped.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) {
        self.submit_boxed(Box::new(work));
    }

    fn submit_boxed(&self, work: crate::dispatch::Thunk) {
        let pool = locked(&self.block.body).pool.clone();
        match pool {
            Some(pool) => pool.submit(work),
            None => log::debug!("work dropped: context {} has no executor", self.id),
        }
    }

    /// Binds the executor this context should use.
    ///
    /// Before the context runs this designates the pool adopted at start;
    /// while running it swaps executors live (in-flight work finishes on the
    /// old pool). No effect on a terminal context.
    pub fn set_pool(&self, pool: Arc<dyn ThreadPool>) {
        let install_live = {
            let body = locked(&self.block.body);
            if body.state.is_terminal() {
                return;
            }
            match body.pool.as_ref().and_then(|p| p.as_buffer()) {
                Some(buffer) => {
                    buffer.set_successor(Arc::clone(&pool));
                    false
                }
                None => true,
            }
        };
        if !install_live {
            return;
        }
        let token = Arc::clone(&pool).start();
        let mut body = locked(&self.block.body);
        if body.state.is_terminal() {
            return;
        }
        body.pool = Some(pool);
        body.pool_token = Some(token);
    }

    /// Adds a filter consulted for faults raised in this subtree.
    pub fn add_fault_filter(&self, filter: Arc<dyn FaultFilter>) {
        locked(&self.block.body).filters.push(filter);
    }

    /// Runs `fault` through every filter here and up the lineage. Every
    /// filter sees the fault; the verdicts are OR-ed.
    pub fn filter_fault(&self, fault: &Fault) -> bool {
        let mut handled = false;
        let mut scope: Option<&Context> = Some(self);
        while let Some(ctx) = scope {
            let filters: Vec<Arc<dyn FaultFilter>> = {
                let body = locked(&ctx.block.body);
                body.filters.iter().map(Arc::clone).collect()
            };
            for filter in filters {
                handled |= filter.filter(fault);
            }
            scope = ctx.parent.as_deref();
        }
        handled
    }

    /// This context's identity.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The name given at creation, if any.
    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        locked(&self.block.body).state
    }

    /// The parent context, absent for roots.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    /// This context's attribute store.
    #[must_use]
    pub fn attrs(&self) -> &AttrStore {
        &self.attrs
    }

    /// Snapshot of the currently live children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Context>> {
        locked(&self.block.body).live_children()
    }

    /// Number of live children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Clears a slot whose child construction failed.
    fn vacate_reserved(&self, slot: usize) {
        let mut body = locked(&self.block.body);
        if let Some(entry) = body.children.get_mut(slot) {
            if matches!(entry, ChildSlot::Reserved) {
                *entry = ChildSlot::Empty;
            }
        }
    }

    /// Clears `child`'s slot on drop, but only if the slot still refers to
    /// that exact child; a vacated slot may have been reused since.
    fn vacate_child(&self, slot: usize, child: &Context) {
        {
            let mut body = locked(&self.block.body);
            if let Some(entry) = body.children.get_mut(slot) {
                let ours = match entry {
                    ChildSlot::Live(weak) => std::ptr::eq(weak.as_ptr(), child as *const Context),
                    _ => false,
                };
                if ours {
                    *entry = ChildSlot::Empty;
                }
            }
        }
        self.block.changed.notify_all();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = locked(&self.block.body);
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &body.state)
            .field(
                "children",
                &body
                    .children
                    .iter()
                    .filter(|slot| matches!(slot, ChildSlot::Live(_)))
                    .count(),
            )
            .field("objects", &body.concretes.len())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let (members, routes, pending) = {
            let mut body = locked(&self.block.body);
            let members = std::mem::take(&mut body.members);
            let mut routes = std::mem::take(&mut body.local_routes);
            routes.extend(std::mem::take(&mut body.delayed_routes));
            let pending: Vec<Arc<crate::wiring::DeferredSlot>> = body
                .memos
                .values_mut()
                .flat_map(|entry| std::mem::take(&mut entry.chain))
                .collect();
            (members, routes, pending)
        };

        for member in members {
            member.on_teardown(self);
        }
        // Requests that never resolved are cancelled now; each finalize step
        // runs exactly once.
        for slot in pending {
            if let Some(finalize) = slot.cancel() {
                finalize();
            }
        }
        self.detach_routes(&routes);

        if let (Some(parent), Some(slot)) = (self.parent.as_ref(), self.slot) {
            parent.vacate_child(slot, self);
        }

        observe::emit(RuntimeEvent::ContextExpired { id: self.id });
        log::trace!("context {} expired", self.id);
    }
}

/// Keeps an initiated context alive until its parent runs it or the tree
/// comes down. Registered as an ordinary runnable so both release paths fall
/// out of the existing start/stop plumbing.
struct InitiateHold {
    held: Mutex<Option<Arc<Context>>>,
}

impl InitiateHold {
    fn new(ctx: Arc<Context>) -> Self {
        Self {
            held: Mutex::new(Some(ctx)),
        }
    }
}

impl Runnable for InitiateHold {
    fn start(&self, _keep: KeepAlive) -> bool {
        // Promotion to Running redeems the promise; nothing actually runs.
        let held = locked(&self.held).take();
        drop(held);
        false
    }

    fn stop(&self, _graceful: bool) {
        let held = locked(&self.held).take();
        drop(held);
    }

    fn is_running(&self) -> bool {
        false
    }
}
