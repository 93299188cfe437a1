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

//! Injection and resolution against the context tree.
//!
//! Each context owns the objects registered into it and a memo table keyed
//! by `TypeId`. A lookup consults its own memo, scans its own objects, then
//! repeats the same probe up the lineage; whatever it finds is memoized at
//! the asking context so the next lookup is a map hit. Registration pushes
//! the new value back down: every descendant memo not already satisfied by
//! something closer records it, and parked consumers fire.
//!
//! Consumer chains always release outside the context lock, because a
//! satisfaction callback is free to re-enter the very context that fired it.

use std::any::TypeId;
use std::sync::Arc;

use crate::error::WiringError;
use crate::observe::{self, RuntimeEvent};
use crate::sync::locked;
use crate::wiring::{run_chain, DeferredSlot, Descriptor, Injection, WiredValue};

use super::state::ContextBody;
use super::Context;

/// Chains detached under a lock, paired with the value that satisfies them.
type Releases = Vec<(WiredValue, Vec<Arc<DeferredSlot>>)>;

impl Context {
    /// Registers `value` as an injectable object of this context.
    ///
    /// Shorthand for [`inject_with`](Context::inject_with) with a bare
    /// [`Injection`].
    pub fn inject<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        value: Arc<T>,
    ) -> Result<(), WiringError> {
        self.inject_with(Injection::of(value))
    }

    /// Registers an object described by `injection`: its concrete slot, any
    /// facet slots, and the context roles it takes on.
    ///
    /// Registration satisfies waiting consumers here and in every descendant
    /// context that has no closer provider; their callbacks run before this
    /// returns, outside all runtime locks. Registering a second object of an
    /// already-bound concrete type (or the same object twice) is refused.
    pub fn inject_with(self: &Arc<Self>, injection: Injection) -> Result<(), WiringError> {
        let Injection {
            concrete,
            facets,
            member,
            runnable,
            filter,
        } = injection;
        let type_name = concrete.type_name();

        let mut slots: Vec<(TypeId, WiredValue)> = Vec::with_capacity(1 + facets.len());
        slots.push((concrete.type_id(), concrete.clone()));
        slots.extend(facets.iter().map(|facet| (facet.type_id(), facet.clone())));

        let releases: Releases = {
            let mut body = locked(&self.block.body);
            for existing in &body.concretes {
                if existing.concrete.data_addr() == concrete.data_addr() {
                    return Err(WiringError::DuplicateValue { type_name });
                }
                if existing.concrete.type_id() == concrete.type_id() {
                    return Err(WiringError::DuplicateType { type_name });
                }
            }
            body.concretes.push(Descriptor { concrete, facets });
            if let Some(member) = member {
                body.members.push(member);
            }
            if let Some(filter) = filter {
                body.filters.push(filter);
            }

            let mut releases = Releases::new();
            for (key, value) in &slots {
                if let Some(entry) = body.memos.get_mut(key) {
                    if let Some(chain) = entry.satisfy(value, true) {
                        if !chain.is_empty() {
                            releases.push((value.clone(), chain));
                        }
                    }
                }
            }
            releases
        };

        observe::emit(RuntimeEvent::ObjectInjected {
            id: self.id,
            type_name,
        });
        log::trace!("context {}: injected {}", self.id, type_name);

        for (value, chain) in releases {
            run_chain(&value, chain);
        }
        self.satisfy_descendants(slots);

        if let Some(runnable) = runnable {
            self.add_runnable(runnable);
        }
        Ok(())
    }

    /// Resolves a value of type `T` against this context and its lineage.
    ///
    /// `Ok(None)` when nothing anywhere up the tree provides `T`. Two local
    /// objects both providing `T` make the scan refuse to choose; the
    /// ambiguity is reported and the request stays unsatisfied. A value
    /// memoized before the second provider arrived keeps winning, since only
    /// fresh scans can see the conflict.
    pub fn resolve<T>(&self) -> Result<Option<Arc<T>>, WiringError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Ok(self
            .lookup(TypeId::of::<T>(), std::any::type_name::<T>())?
            .and_then(|value| value.extract::<T>()))
    }

    /// Calls `on_wired` with the value of type `T` once it is available:
    /// immediately if resolution already succeeds, otherwise when a matching
    /// object is registered here or in an ancestor.
    ///
    /// The returned slot can be handed to
    /// [`cancel_consumer`](Context::cancel_consumer) to withdraw the request.
    pub fn when_wired<T, F>(&self, on_wired: F) -> Result<Arc<DeferredSlot>, WiringError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let slot = DeferredSlot::new::<T>(on_wired);
        self.register_consumer(Arc::clone(&slot))?;
        Ok(slot)
    }

    /// Links a prepared consumer slot into this context's memo table,
    /// firing it on the spot when its type already resolves.
    pub fn register_consumer(&self, slot: Arc<DeferredSlot>) -> Result<(), WiringError> {
        if let Some(value) = self.lookup(slot.key(), slot.key_name())? {
            run_chain(&value, vec![slot]);
            return Ok(());
        }
        // The miss and this parking are separate lock acquisitions; a
        // registration can land in between, so check the entry again.
        let settled = {
            let mut body = locked(&self.block.body);
            let entry = body.memos.entry(slot.key()).or_default();
            match &entry.value {
                Some(value) => Some(value.clone()),
                None => {
                    entry.chain.push(Arc::clone(&slot));
                    None
                }
            }
        };
        match settled {
            Some(value) => run_chain(&value, vec![slot]),
            None => log::trace!(
                "context {}: consumer waiting on {}",
                self.id,
                slot.key_name()
            ),
        }
        Ok(())
    }

    /// Withdraws a consumer registered on this context.
    ///
    /// The slot's finalize step runs exactly once across its whole life,
    /// whether satisfaction, this cancellation, or context teardown gets
    /// there first. Cancelling an already-satisfied or unknown slot does
    /// nothing further.
    pub fn cancel_consumer(&self, slot: &Arc<DeferredSlot>) {
        {
            let mut body = locked(&self.block.body);
            if let Some(entry) = body.memos.get_mut(&slot.key()) {
                entry.chain.retain(|parked| !Arc::ptr_eq(parked, slot));
            }
        }
        if let Some(finalize) = slot.cancel() {
            finalize();
        }
    }

    /// Full resolution walk: this context first, then each ancestor, one
    /// lock at a time. An ancestor find is memoized here as non-local.
    fn lookup(
        &self,
        key: TypeId,
        requested: &'static str,
    ) -> Result<Option<WiredValue>, WiringError> {
        let hit = {
            let mut body = locked(&self.block.body);
            let hit = probe(&mut body, key, requested)?;
            if hit.is_none() {
                // Park an empty entry: a registration descending from an
                // ancestor records its value into it from here on.
                body.memos.entry(key).or_default();
            }
            hit
        };
        if let Some((value, chain)) = hit {
            run_chain(&value, chain);
            return Ok(Some(value));
        }

        let mut scope = self.parent.clone();
        while let Some(ctx) = scope {
            let hit = {
                let mut body = locked(&ctx.block.body);
                probe(&mut body, key, requested)?
            };
            if let Some((value, chain)) = hit {
                run_chain(&value, chain);
                return Ok(Some(self.memoize_from_ancestor(key, value)));
            }
            scope = ctx.parent.clone();
        }
        Ok(None)
    }

    /// Records an ancestor-sourced value at this context. A registration
    /// that raced the walk and satisfied the entry in the meantime wins.
    fn memoize_from_ancestor(&self, key: TypeId, value: WiredValue) -> WiredValue {
        let (settled, chain) = {
            let mut body = locked(&self.block.body);
            let entry = body.memos.entry(key).or_default();
            match &entry.value {
                Some(existing) => (existing.clone(), Vec::new()),
                None => {
                    entry.value = Some(value.clone());
                    entry.local = false;
                    (value, std::mem::take(&mut entry.chain))
                }
            }
        };
        if !chain.is_empty() {
            run_chain(&settled, chain);
        }
        settled
    }

    /// Pushes freshly registered slots into the subtree: every existing
    /// memo entry without a closer value records the new one, and its
    /// consumers fire. A context whose own objects provide a key shadows
    /// the new value for itself and everything below it.
    fn satisfy_descendants(&self, slots: Vec<(TypeId, WiredValue)>) {
        let mut worklist: Vec<(Arc<Context>, Vec<(TypeId, WiredValue)>)> =
            locked(&self.block.body)
                .live_children()
                .into_iter()
                .map(|child| (child, slots.clone()))
                .collect();

        while let Some((ctx, keys)) = worklist.pop() {
            let (releases, surviving, children) = {
                let mut body = locked(&ctx.block.body);
                let mut releases = Releases::new();
                let mut surviving: Vec<(TypeId, WiredValue)> = Vec::new();
                for (key, value) in keys {
                    let shadowed = body
                        .concretes
                        .iter()
                        .any(|descriptor| descriptor.slot_for(key).is_some());
                    if shadowed {
                        continue;
                    }
                    if let Some(entry) = body.memos.get_mut(&key) {
                        if let Some(chain) = entry.satisfy(&value, false) {
                            if !chain.is_empty() {
                                releases.push((value.clone(), chain));
                            }
                        }
                    }
                    surviving.push((key, value));
                }
                let children = if surviving.is_empty() {
                    Vec::new()
                } else {
                    body.live_children()
                };
                (releases, surviving, children)
            };
            for (value, chain) in releases {
                run_chain(&value, chain);
            }
            for child in children {
                worklist.push((child, surviving.clone()));
            }
        }
    }
}

/// One context's share of a lookup: the memoized value if there is one,
/// else a scan over the objects registered here. A scan hit is memoized
/// locally so the next lookup is a map hit; a scan meeting two providers
/// refuses to choose between them.
fn probe(
    body: &mut ContextBody,
    key: TypeId,
    requested: &'static str,
) -> Result<Option<(WiredValue, Vec<Arc<DeferredSlot>>)>, WiringError> {
    if let Some(entry) = body.memos.get(&key) {
        if let Some(value) = &entry.value {
            return Ok(Some((value.clone(), Vec::new())));
        }
    }

    let mut hits = body.concretes.iter().filter_map(|descriptor| {
        descriptor
            .slot_for(key)
            .map(|slot| (slot.clone(), descriptor.concrete.type_name()))
    });
    let Some((value, first)) = hits.next() else {
        return Ok(None);
    };
    if let Some((_, second)) = hits.next() {
        return Err(WiringError::Ambiguous {
            requested,
            first,
            second,
        });
    }
    drop(hits);

    let entry = body.memos.entry(key).or_default();
    entry.value = Some(value.clone());
    entry.local = true;
    Ok(Some((value, std::mem::take(&mut entry.chain))))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::context::{KeepAlive, ShutdownMode};
    use crate::runnable::Runnable;

    use super::*;

    trait Transport: Send + Sync + std::fmt::Debug {
        fn scheme(&self) -> &'static str;
    }

    #[derive(Debug)]
    struct Tcp;
    impl Transport for Tcp {
        fn scheme(&self) -> &'static str {
            "tcp"
        }
    }

    #[derive(Debug)]
    struct Udp;
    impl Transport for Udp {
        fn scheme(&self) -> &'static str {
            "udp"
        }
    }

    struct Config {
        endpoint: &'static str,
    }

    #[test]
    fn inject_then_resolve_returns_the_same_object() {
        let root = Context::root();
        let cfg = Arc::new(Config { endpoint: "alpha" });
        root.inject(Arc::clone(&cfg)).unwrap();

        let found = root.resolve::<Config>().unwrap().unwrap();
        assert!(Arc::ptr_eq(&cfg, &found));
        assert_eq!(found.endpoint, "alpha");
    }

    #[test]
    fn missing_type_resolves_to_none() {
        let root = Context::root();
        assert!(root.resolve::<Config>().unwrap().is_none());
    }

    #[test]
    fn facet_resolves_as_trait_object() {
        let root = Context::root();
        let tcp = Arc::new(Tcp);
        root.inject_with(Injection::of(Arc::clone(&tcp)).facet(tcp as Arc<dyn Transport>))
            .unwrap();

        let transport = root.resolve::<dyn Transport>().unwrap().unwrap();
        assert_eq!(transport.scheme(), "tcp");
        assert!(root.resolve::<Tcp>().unwrap().is_some());
    }

    #[test]
    fn double_registration_is_rejected() {
        let root = Context::root();
        let cfg = Arc::new(Config { endpoint: "a" });
        root.inject(Arc::clone(&cfg)).unwrap();

        let same = root.inject(cfg).unwrap_err();
        assert!(matches!(same, WiringError::DuplicateValue { .. }));

        let other = root.inject(Arc::new(Config { endpoint: "b" })).unwrap_err();
        assert!(matches!(other, WiringError::DuplicateType { .. }));
    }

    #[test]
    fn resolution_walks_the_lineage() {
        let root = Context::root();
        let child = root.create_child(|_| Ok(())).unwrap();
        let grandchild = child.create_child(|_| Ok(())).unwrap();

        let cfg = Arc::new(Config { endpoint: "up-top" });
        root.inject(Arc::clone(&cfg)).unwrap();

        let found = grandchild.resolve::<Config>().unwrap().unwrap();
        assert!(Arc::ptr_eq(&cfg, &found));
    }

    #[test]
    fn later_local_registration_wins() {
        let root = Context::root();
        let child = root.create_child(|_| Ok(())).unwrap();

        root.inject(Arc::new(Config { endpoint: "above" })).unwrap();
        // The child memoizes the ancestor value...
        assert_eq!(
            child.resolve::<Config>().unwrap().unwrap().endpoint,
            "above"
        );

        // ...then registers its own, which shadows it from here down.
        child.inject(Arc::new(Config { endpoint: "own" })).unwrap();
        assert_eq!(child.resolve::<Config>().unwrap().unwrap().endpoint, "own");
        assert_eq!(root.resolve::<Config>().unwrap().unwrap().endpoint, "above");
    }

    #[test]
    fn nearest_provider_wins_for_descendants() {
        let root = Context::root();
        let mid = root.create_child(|_| Ok(())).unwrap();
        let leaf = mid.create_child(|_| Ok(())).unwrap();

        // The leaf asks early, parking an empty entry.
        assert!(leaf.resolve::<Config>().unwrap().is_none());

        mid.inject(Arc::new(Config { endpoint: "near" })).unwrap();
        root.inject(Arc::new(Config { endpoint: "far" })).unwrap();

        // The top-level registration stops at `mid`, which provides its own.
        assert_eq!(leaf.resolve::<Config>().unwrap().unwrap().endpoint, "near");
        assert_eq!(mid.resolve::<Config>().unwrap().unwrap().endpoint, "near");
        assert_eq!(root.resolve::<Config>().unwrap().unwrap().endpoint, "far");
    }

    #[test]
    fn ambiguous_facet_refuses_to_choose() {
        let root = Context::root();
        let tcp = Arc::new(Tcp);
        let udp = Arc::new(Udp);
        root.inject_with(Injection::of(Arc::clone(&tcp)).facet(tcp as Arc<dyn Transport>))
            .unwrap();
        root.inject_with(Injection::of(Arc::clone(&udp)).facet(udp as Arc<dyn Transport>))
            .unwrap();

        let err = root.resolve::<dyn Transport>().unwrap_err();
        assert!(matches!(err, WiringError::Ambiguous { .. }));
        // The concrete slots stay unambiguous.
        assert!(root.resolve::<Tcp>().unwrap().is_some());
        assert!(root.resolve::<Udp>().unwrap().is_some());
    }

    #[test]
    fn consumer_after_injection_fires_at_once() {
        let root = Context::root();
        root.inject(Arc::new(Config { endpoint: "ready" })).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let slot = root
            .when_wired::<Config, _>(move |cfg| {
                *locked(&sink) = Some(cfg.endpoint);
            })
            .unwrap();

        assert!(slot.is_satisfied());
        assert_eq!(*locked(&seen), Some("ready"));
    }

    #[test]
    fn consumer_before_injection_fires_on_inject() {
        let root = Context::root();
        let count = Arc::new(AtomicUsize::new(0));
        let bump = Arc::clone(&count);
        let slot = root
            .when_wired::<Config, _>(move |cfg| {
                assert_eq!(cfg.endpoint, "late");
                bump.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(!slot.is_satisfied());

        root.inject(Arc::new(Config { endpoint: "late" })).unwrap();
        assert!(slot.is_satisfied());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ancestor_injection_reaches_waiting_descendant() {
        let root = Context::root();
        let child = root.create_child(|_| Ok(())).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let bump = Arc::clone(&count);
        child
            .when_wired::<Config, _>(move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        root.inject(Arc::new(Config { endpoint: "down" })).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(child.resolve::<Config>().unwrap().unwrap().endpoint, "down");
    }

    #[test]
    fn cancel_runs_finalize_exactly_once() {
        let root = Context::root();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let f1 = Arc::clone(&fired);
        let f2 = Arc::clone(&finalized);
        let slot = DeferredSlot::new::<Config>(move |_| {
            f1.fetch_add(1, Ordering::SeqCst);
        })
        .with_finalize(move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        root.register_consumer(Arc::clone(&slot)).unwrap();

        root.cancel_consumer(&slot);
        root.cancel_consumer(&slot);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        // The type arriving later no longer reaches the withdrawn consumer.
        root.inject(Arc::new(Config { endpoint: "x" })).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finalize_not_doubled_when_cancel_follows_satisfaction() {
        let root = Context::root();
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finalized);
        let slot = DeferredSlot::new::<Config>(|_| {}).with_finalize(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        root.register_consumer(Arc::clone(&slot)).unwrap();

        root.inject(Arc::new(Config { endpoint: "y" })).unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        root.cancel_consumer(&slot);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_cancels_parked_consumers() {
        let root = Context::root();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        {
            let child = root.create_child(|_| Ok(())).unwrap();
            let f1 = Arc::clone(&fired);
            let f2 = Arc::clone(&finalized);
            let slot = DeferredSlot::new::<Config>(move |_| {
                f1.fetch_add(1, Ordering::SeqCst);
            })
            .with_finalize(move || {
                f2.fetch_add(1, Ordering::SeqCst);
            });
            child.register_consumer(slot).unwrap();
        }
        // The child dropped with the request still open: finalize ran, the
        // satisfaction callback never did.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sibling_registrations_stay_isolated() {
        let root = Context::root();
        let a = root.create_child(|_| Ok(())).unwrap();
        let b = root.create_child(|_| Ok(())).unwrap();

        a.inject(Arc::new(Config { endpoint: "a-only" })).unwrap();
        assert!(b.resolve::<Config>().unwrap().is_none());
        assert!(root.resolve::<Config>().unwrap().is_none());
    }

    #[derive(Default)]
    struct Probe {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl Runnable for Probe {
        fn start(&self, _keep: KeepAlive) -> bool {
            self.started.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn stop(&self, _graceful: bool) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.started.load(Ordering::SeqCst) > self.stopped.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn injected_runnable_starts_and_stops_with_the_context() {
        let root = Context::root();
        let probe = Arc::new(Probe::default());
        root.inject_with(
            Injection::of(Arc::clone(&probe)).as_runnable(Arc::clone(&probe) as Arc<dyn Runnable>),
        )
        .unwrap();
        assert_eq!(probe.started.load(Ordering::SeqCst), 0);

        root.initiate();
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        root.signal_shutdown(true, ShutdownMode::Graceful);
        assert_eq!(probe.stopped.load(Ordering::SeqCst), 1);
    }
}
