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

//! Process-wide diagnostics stream.
//!
//! The runtime announces coarse milestones (context creation, state changes,
//! injections, expiry) to every subscriber. Subscribing is cheap and the
//! stream is best-effort: a subscriber that falls away is pruned on the next
//! emission, and with no subscribers emission is a no-op.

use std::sync::Mutex;

use serde::Serialize;

use crate::context::{ContextId, ContextState};
use crate::sync::locked;

/// One milestone in the life of the context tree.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A context finished construction.
    ContextCreated {
        /// The new context.
        id: ContextId,
        /// Its parent, absent for a root.
        parent: Option<ContextId>,
        /// Optional human-readable label.
        name: Option<&'static str>,
    },
    /// A context's lifecycle state changed.
    StateChanged {
        /// The context that changed.
        id: ContextId,
        /// The state it entered.
        state: ContextState,
    },
    /// A value was injected into a context.
    ObjectInjected {
        /// The receiving context.
        id: ContextId,
        /// Type name of the injected value.
        type_name: &'static str,
    },
    /// A context was dropped.
    ContextExpired {
        /// The expired context.
        id: ContextId,
    },
}

static SINKS: Mutex<Vec<flume::Sender<RuntimeEvent>>> = Mutex::new(Vec::new());

/// Subscribes to the diagnostics stream from this point on.
#[must_use]
pub fn subscribe() -> flume::Receiver<RuntimeEvent> {
    let (tx, rx) = flume::unbounded();
    locked(&SINKS).push(tx);
    rx
}

/// Delivers `event` to every live subscriber.
pub(crate) fn emit(event: RuntimeEvent) {
    let mut sinks = locked(&SINKS);
    if sinks.is_empty() {
        return;
    }
    sinks.retain(|tx| tx.send(event.clone()).is_ok());
}
