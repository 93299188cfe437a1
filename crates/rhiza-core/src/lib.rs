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

//! # Rhiza Core
//!
//! A hierarchical dependency-injection and execution runtime. Applications
//! are organized as a tree of [`Context`]s; each context is a scope that
//! owns injected objects, resolves types against its lineage, routes typed
//! events through its subtree, and runs work on threads bound to its
//! lifetime.
//!
//! ## Architecture
//!
//! - [`context`] — the tree itself: creation, the one-way lifecycle state
//!   machine, teardown, and quiescence tracking.
//! - [`wiring`] — type-erased value slots, injection descriptors, and the
//!   deferred consumers that let code request a type before it exists.
//! - [`junction`] — typed event fan-out; registration climbs the tree so
//!   publishes reach the publisher's whole subtree.
//! - [`dispatch`] — per-owner queues of immediate and time-delayed work.
//! - [`runnable`] — the start/stop contract contexts drive, plus the
//!   thread-backed implementations shipped with the crate.
//! - [`pool`] — executors a context can adopt, including the buffering
//!   placeholder that holds work pended before the context runs.
//! - [`fault`] — contained panics from user callbacks and the filter chain
//!   that decides whether anyone handled them.
//! - [`attr`] — per-context attribute store with creation-time inheritance.
//! - [`observe`] — a serializable diagnostic event stream for tooling.
//!
//! ```
//! use rhiza_core::Context;
//! use std::sync::Arc;
//!
//! let root = Context::root_named("app");
//! root.inject(Arc::new(42_u32)).unwrap();
//! root.initiate();
//!
//! let child = root.create_child(|_| Ok(())).unwrap();
//! assert_eq!(*child.resolve::<u32>().unwrap().unwrap(), 42);
//!
//! root.signal_shutdown(true, rhiza_core::ShutdownMode::Graceful);
//! ```

#![warn(missing_docs)]

pub mod attr;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod junction;
pub mod observe;
pub mod pool;
pub mod runnable;
pub mod wiring;

mod sync;

pub use context::{
    Context, ContextId, ContextState, CreationWatcher, CurrentGuard, KeepAlive, Member,
    ShutdownMode,
};
pub use dispatch::{DispatchError, DispatchQueue, Thunk};
pub use error::{ContextError, WiringError};
pub use fault::{Fault, FaultFilter, FaultOrigin};
pub use junction::EventSink;
pub use pool::{BufferPool, OsPool, PoolToken, ThreadPool};
pub use runnable::{QueueThread, Runnable, StopSignal, WorkerThread};
pub use wiring::{DeferredSlot, Injection, WiredValue};
