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

//! Long-running members of a context.
//!
//! A [`Runnable`] is started when its context starts running and stopped when
//! the context shuts down. While active it holds the [`KeepAlive`] it was
//! started with, which keeps the context from reporting quiescence until the
//! runnable has genuinely wound down.
//!
//! Two ready-made runnables cover the common shapes: [`WorkerThread`] runs a
//! caller-supplied body on a dedicated thread until signalled, and
//! [`QueueThread`] drains a private [`DispatchQueue`](crate::DispatchQueue)
//! until aborted.

mod queue_thread;
mod worker;

pub use queue_thread::QueueThread;
pub use worker::{StopSignal, WorkerThread};

use crate::context::KeepAlive;

/// A unit of long-running work owned by a context.
pub trait Runnable: Send + Sync {
    /// Begins the work. Holds `keep` until the work has fully wound down.
    ///
    /// Returns `false` when the runnable could not start (already started,
    /// spawn failure); the caller then treats it as never having run.
    fn start(&self, keep: KeepAlive) -> bool;

    /// Requests the work to end. `graceful` asks for queued work to finish
    /// first; `false` asks for the fastest orderly exit.
    ///
    /// Never blocks on the work actually ending.
    fn stop(&self, graceful: bool);

    /// True between a successful [`start`](Runnable::start) and the moment
    /// the work winds down.
    fn is_running(&self) -> bool;
}
