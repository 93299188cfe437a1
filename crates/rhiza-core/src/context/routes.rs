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

//! Event routing against the context tree.
//!
//! A sink registered through a context attaches to that context's junction
//! and to every ancestor's; publishing fires only the publisher's own
//! junction. Events therefore flow down: a publish reaches every sink
//! registered at the publishing context or anywhere in its subtree.
//!
//! Sinks registered before a context is initiated are parked as *delayed
//! routes* and only go live when the context does.

use std::sync::Arc;

use crate::junction::{EventSink, RouteRecord};
use crate::sync::locked;

use super::{Context, ContextState};

impl Context {
    /// Registers `sink` to receive events of type `E` published at this
    /// context or below.
    ///
    /// On a context that has not been initiated yet, the registration is
    /// held back and attaches when the context leaves its dormant state; a
    /// terminal context ignores the registration entirely.
    pub fn add_event_sink<E: Send + Sync + 'static>(self: &Arc<Self>, sink: Arc<dyn EventSink<E>>) {
        let record = RouteRecord::new::<E>(self.id, sink);
        let attach_now = {
            let mut body = locked(&self.block.body);
            match body.state {
                ContextState::NotStarted | ContextState::CanRun => {
                    body.delayed_routes.push(record.clone());
                    false
                }
                ContextState::Initiated | ContextState::Running => {
                    body.local_routes.push(record.clone());
                    true
                }
                ContextState::Shutdown | ContextState::Abandoned => {
                    log::debug!(
                        "event sink registered on terminated context {}; ignored",
                        self.id
                    );
                    return;
                }
            }
        };
        if attach_now {
            self.attach_routes(std::slice::from_ref(&record));
        }
    }

    /// Unregisters `sink` for events of type `E`. A sink that was never
    /// registered is ignored.
    pub fn remove_event_sink<E: Send + Sync + 'static>(
        self: &Arc<Self>,
        sink: &Arc<dyn EventSink<E>>,
    ) {
        let record = RouteRecord::new::<E>(self.id, Arc::clone(sink));
        {
            let mut body = locked(&self.block.body);
            body.local_routes.retain(|r| r.key != record.key);
            body.delayed_routes.retain(|r| r.key != record.key);
        }
        // Detaching is idempotent, so a delayed (never attached) route is
        // fine to pass through here.
        self.detach_routes(std::slice::from_ref(&record));
    }

    /// Delivers `event` to every sink registered at this context or in its
    /// subtree. Panicking sinks are contained; their faults run through the
    /// filter chain and are logged if nothing claims them.
    pub fn publish<E: Send + Sync + 'static>(self: &Arc<Self>, event: &E) {
        let Some(junction) = self.junctions.existing::<E>() else {
            return;
        };
        for fault in junction.fire(event) {
            if !self.filter_fault(&fault) {
                log::warn!(
                    "unhandled event fault in context {}: {}",
                    self.id,
                    fault.message()
                );
            }
        }
    }

    /// Adds `records` to the junctions of this context and every ancestor.
    pub(crate) fn attach_routes(&self, records: &[RouteRecord]) {
        let mut scope: Option<&Context> = Some(self);
        while let Some(ctx) = scope {
            for record in records {
                record.attach_to(&ctx.junctions);
            }
            scope = ctx.parent.as_deref();
        }
    }

    /// Removes `records` from the junctions of this context and every
    /// ancestor.
    pub(crate) fn detach_routes(&self, records: &[RouteRecord]) {
        let mut scope: Option<&Context> = Some(self);
        while let Some(ctx) = scope {
            for record in records {
                record.detach_from(&ctx.junctions);
            }
            scope = ctx.parent.as_deref();
        }
    }
}
