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

//! Typed event fan-out.
//!
//! Each context owns one [`JunctionManager`]: a map from event type to the
//! [`Junction`] that fans that type out to registered sinks. Registering a
//! sink attaches it to the junction of its own context and of every
//! ancestor; publishing fires only the publisher's own junction. An event
//! therefore reaches every sink registered at the publishing context or
//! anywhere in its subtree, and nothing above it.
//!
//! Routes carry the identity of the context that registered them (the
//! *origin*) so that tearing one context down detaches exactly its sinks from
//! ancestor junctions and nothing else.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::context::ContextId;
use crate::fault::{Fault, FaultOrigin};
use crate::sync::locked;

/// Receiver for events of type `E`.
pub trait EventSink<E>: Send + Sync {
    /// Called once per published event, on the publisher's thread.
    fn receive(&self, event: &E);
}

struct Route<E> {
    origin: ContextId,
    sink: Arc<dyn EventSink<E>>,
}

/// Fan-out point for a single event type.
pub struct Junction<E> {
    routes: Mutex<Vec<Route<E>>>,
}

fn sink_addr<E>(sink: &Arc<dyn EventSink<E>>) -> usize {
    Arc::as_ptr(sink) as *const () as usize
}

impl<E> Junction<E> {
    fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Registers `sink` under `origin`. Re-adding the same sink for the same
    /// origin is a no-op.
    pub fn add(&self, origin: ContextId, sink: Arc<dyn EventSink<E>>) {
        let mut routes = locked(&self.routes);
        let addr = sink_addr(&sink);
        if routes
            .iter()
            .any(|r| r.origin == origin && sink_addr(&r.sink) == addr)
        {
            return;
        }
        routes.push(Route { origin, sink });
    }

    /// Removes the route for `(origin, addr)` if present.
    pub fn remove(&self, origin: ContextId, addr: usize) {
        locked(&self.routes)
            .retain(|r| !(r.origin == origin && sink_addr(&r.sink) == addr));
    }

    /// Drops every route registered under `origin`.
    pub fn remove_origin(&self, origin: ContextId) {
        locked(&self.routes).retain(|r| r.origin != origin);
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        locked(&self.routes).len()
    }

    /// True when no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        locked(&self.routes).is_empty()
    }

    /// Delivers `event` to every registered sink, containing per-sink panics.
    ///
    /// Delivery continues past a panicking sink; the collected faults are
    /// returned for the caller to route through its fault filters.
    pub fn fire(&self, event: &E) -> Vec<Fault> {
        // Snapshot so sinks may add or remove routes while we deliver.
        let sinks: Vec<Arc<dyn EventSink<E>>> = locked(&self.routes)
            .iter()
            .map(|r| Arc::clone(&r.sink))
            .collect();

        let mut faults = Vec::new();
        for sink in sinks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.receive(event))) {
                faults.push(Fault::from_panic(FaultOrigin::Event, payload));
            }
        }
        faults
    }
}

impl<E> std::fmt::Debug for Junction<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Junction")
            .field("routes", &locked(&self.routes).len())
            .finish()
    }
}

/// Per-context map from event type to its [`Junction`].
#[derive(Default)]
pub(crate) struct JunctionManager {
    boxes: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl JunctionManager {
    /// Returns the junction for `E`, creating it on first use.
    pub(crate) fn junction<E: Send + Sync + 'static>(&self) -> Arc<Junction<E>> {
        let erased = Arc::clone(
            locked(&self.boxes)
                .entry(TypeId::of::<E>())
                .or_insert_with(|| Arc::new(Junction::<E>::new())),
        );
        // Keyed by TypeId::of::<E>, so the stored type is always Junction<E>.
        Arc::downcast(erased).expect("junction map entry of mismatched type")
    }

    /// Returns the junction for `E` only if one was ever registered against,
    /// keeping publication of unheard event types allocation-free.
    pub(crate) fn existing<E: Send + Sync + 'static>(&self) -> Option<Arc<Junction<E>>> {
        let erased = locked(&self.boxes).get(&TypeId::of::<E>()).cloned()?;
        Arc::downcast(erased).ok()
    }
}

impl std::fmt::Debug for JunctionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JunctionManager")
            .field("event_types", &locked(&self.boxes).len())
            .finish()
    }
}

/// Identity of one registered route: event type, registering context, and
/// sink address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteKey {
    pub event: TypeId,
    pub origin: ContextId,
    pub sink_addr: usize,
}

/// Type-erased handle to one sink registration.
///
/// A context keeps records for its own sinks; attaching or detaching replays
/// the typed operation against any [`JunctionManager`] up the ancestor chain.
#[derive(Clone)]
pub(crate) struct RouteRecord {
    pub key: RouteKey,
    attach: Arc<dyn Fn(&JunctionManager) + Send + Sync>,
    detach: Arc<dyn Fn(&JunctionManager) + Send + Sync>,
}

impl RouteRecord {
    pub(crate) fn new<E: Send + Sync + 'static>(
        origin: ContextId,
        sink: Arc<dyn EventSink<E>>,
    ) -> Self {
        let addr = sink_addr(&sink);
        let key = RouteKey {
            event: TypeId::of::<E>(),
            origin,
            sink_addr: addr,
        };
        let attach_sink = Arc::clone(&sink);
        Self {
            key,
            attach: Arc::new(move |mgr| {
                mgr.junction::<E>().add(origin, Arc::clone(&attach_sink));
            }),
            detach: Arc::new(move |mgr| {
                mgr.junction::<E>().remove(origin, addr);
            }),
        }
    }

    pub(crate) fn attach_to(&self, mgr: &JunctionManager) {
        (self.attach)(mgr);
    }

    pub(crate) fn detach_from(&self, mgr: &JunctionManager) {
        (self.detach)(mgr);
    }
}

impl std::fmt::Debug for RouteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRecord").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Ping(u32);

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
        last: AtomicUsize,
    }

    impl EventSink<Ping> for Counter {
        fn receive(&self, event: &Ping) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.last.store(event.0 as usize, Ordering::SeqCst);
        }
    }

    struct Exploder;

    impl EventSink<Ping> for Exploder {
        fn receive(&self, _event: &Ping) {
            panic!("sink boom");
        }
    }

    #[test]
    fn fans_out_to_every_sink() {
        let junction = Junction::<Ping>::new();
        let origin = ContextId::fresh();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        junction.add(origin, a.clone());
        junction.add(origin, b.clone());

        let faults = junction.fire(&Ping(3));
        assert!(faults.is_empty());
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.last.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn same_sink_same_origin_registers_once() {
        let junction = Junction::<Ping>::new();
        let origin = ContextId::fresh();
        let sink = Arc::new(Counter::default());
        junction.add(origin, sink.clone());
        junction.add(origin, sink.clone());

        junction.fire(&Ping(0));
        assert_eq!(sink.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_sink_hears_nothing() {
        let junction = Junction::<Ping>::new();
        let origin = ContextId::fresh();
        let sink: Arc<dyn EventSink<Ping>> = Arc::new(Counter::default());
        let addr = sink_addr(&sink);
        junction.add(origin, Arc::clone(&sink));
        junction.remove(origin, addr);

        junction.fire(&Ping(1));
        assert!(junction.is_empty());
    }

    #[test]
    fn panicking_sink_does_not_block_the_rest() {
        let junction = Junction::<Ping>::new();
        let origin = ContextId::fresh();
        let healthy = Arc::new(Counter::default());
        junction.add(origin, Arc::new(Exploder));
        junction.add(origin, healthy.clone());

        let faults = junction.fire(&Ping(9));
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].origin(), FaultOrigin::Event);
        assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn record_attaches_and_detaches_through_manager() {
        let mgr = JunctionManager::default();
        let origin = ContextId::fresh();
        let sink = Arc::new(Counter::default());
        let record = RouteRecord::new::<Ping>(origin, sink.clone());

        record.attach_to(&mgr);
        mgr.junction::<Ping>().fire(&Ping(5));
        assert_eq!(sink.hits.load(Ordering::SeqCst), 1);

        record.detach_from(&mgr);
        mgr.junction::<Ping>().fire(&Ping(6));
        assert_eq!(sink.hits.load(Ordering::SeqCst), 1);
        assert_eq!(sink.last.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn junctions_are_per_event_type() {
        struct Other;
        let mgr = JunctionManager::default();
        let first = mgr.junction::<Ping>();
        let again = mgr.junction::<Ping>();
        let other = mgr.junction::<Other>();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(other.len(), 0);
        assert!(first.is_empty());
    }
}
