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

//! Building blocks of the dependency wiring layer.
//!
//! A registered object is described by an [`Injection`]: its concrete type
//! slot plus any *facet* slots (trait objects the same object also satisfies).
//! Each slot is carried as a [`WiredValue`], a type-erased `Arc<T>` keyed by
//! the `TypeId` of `T` — the same erasure that backs the per-context memo
//! table, so a single lookup path serves concrete types and trait objects
//! alike.
//!
//! [`DeferredSlot`] is the pending side of the table: one outstanding request
//! for a type, linked into a memo entry's consumer chain until the type shows
//! up. Consumers form trees — a slot can carry dependents attached after the
//! fact — and [`run_chain`] walks a released tree with an explicit stack,
//! entirely outside any context lock.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

use crate::context::Member;
use crate::fault::FaultFilter;
use crate::runnable::Runnable;
use crate::sync::locked;

/// A type-erased shared reference to a wired object.
///
/// The payload's concrete type is always `Arc<T>` for the `T` named by
/// [`WiredValue::type_id`], so extraction is a checked downcast back to
/// `Arc<T>`. Works uniformly for sized types and trait objects.
#[derive(Clone)]
pub struct WiredValue {
    type_id: TypeId,
    type_name: &'static str,
    data_addr: usize,
    payload: Arc<dyn Any + Send + Sync>,
}

impl WiredValue {
    /// Erases `value` under the slot type `T`.
    pub fn of<T>(value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            data_addr: Arc::as_ptr(&value) as *const () as usize,
            payload: Arc::new(value),
        }
    }

    /// Recovers the typed reference. Returns `None` when `T` is not the slot
    /// type this value was erased under.
    #[must_use]
    pub fn extract<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.payload.downcast_ref::<Arc<T>>().cloned()
    }

    /// The slot type this value satisfies.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable name of the slot type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Address of the referenced object, used for identity comparison.
    pub(crate) fn data_addr(&self) -> usize {
        self.data_addr
    }
}

impl std::fmt::Debug for WiredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredValue")
            .field("type", &self.type_name)
            .field("addr", &format_args!("{:#x}", self.data_addr))
            .finish()
    }
}

/// The slots one registered object contributes to the resolution scan.
pub(crate) struct Descriptor {
    pub(crate) concrete: WiredValue,
    pub(crate) facets: Vec<WiredValue>,
}

impl Descriptor {
    /// The value to record for `key`, if this object satisfies it.
    pub(crate) fn slot_for(&self, key: TypeId) -> Option<&WiredValue> {
        if self.concrete.type_id() == key {
            return Some(&self.concrete);
        }
        self.facets.iter().find(|f| WiredValue::type_id(f) == key)
    }
}

/// Everything a single object registers with a context: its concrete slot,
/// optional facet slots, and the context roles it takes on.
///
/// ```rust,ignore
/// let engine = Arc::new(AudioEngine::new());
/// ctx.inject_with(
///     Injection::of(engine.clone())
///         .facet(engine.clone() as Arc<dyn Mixer>)
///         .as_member(engine),
/// )?;
/// ```
pub struct Injection {
    pub(crate) concrete: WiredValue,
    pub(crate) facets: Vec<WiredValue>,
    pub(crate) member: Option<Arc<dyn Member>>,
    pub(crate) runnable: Option<Arc<dyn Runnable>>,
    pub(crate) filter: Option<Arc<dyn FaultFilter>>,
}

impl Injection {
    /// Describes `value` as a plain injectable object.
    pub fn of<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            concrete: WiredValue::of(value),
            facets: Vec::new(),
            member: None,
            runnable: None,
            filter: None,
        }
    }

    /// Adds a facet slot: an additional type (typically a trait object over
    /// the same value) this object satisfies during resolution.
    #[must_use]
    pub fn facet<T>(mut self, facet: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.facets.push(WiredValue::of(facet));
        self
    }

    /// Registers the object for teardown notification.
    #[must_use]
    pub fn as_member(mut self, member: Arc<dyn Member>) -> Self {
        self.member = Some(member);
        self
    }

    /// Registers the object as a runnable the context starts and stops.
    #[must_use]
    pub fn as_runnable(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.runnable = Some(runnable);
        self
    }

    /// Registers the object on the context's fault filter chain.
    #[must_use]
    pub fn as_filter(mut self, filter: Arc<dyn FaultFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Per-type resolution state inside a context: the current value (if any)
/// plus the chain of consumers waiting on it. Entries are created on first
/// reference and never removed.
#[derive(Default)]
pub(crate) struct MemoEntry {
    pub(crate) value: Option<WiredValue>,
    /// Whether the recorded value came from an object registered in this
    /// context. Non-local values yield to a later local registration.
    pub(crate) local: bool,
    pub(crate) chain: Vec<Arc<DeferredSlot>>,
}

impl MemoEntry {
    /// Records `value`, handing back the consumer chain to release. Returns
    /// `None` without touching the entry when it already holds a locally
    /// sourced value; a local record never yields to a later registration.
    pub(crate) fn satisfy(
        &mut self,
        value: &WiredValue,
        local: bool,
    ) -> Option<Vec<Arc<DeferredSlot>>> {
        if self.value.is_some() && self.local {
            return None;
        }
        self.value = Some(value.clone());
        self.local = local;
        Some(std::mem::take(&mut self.chain))
    }
}

type SatisfyFn = Box<dyn FnOnce(&WiredValue) + Send>;
type FinalizeFn = Box<dyn FnOnce() + Send>;

struct SlotState {
    cancelled: bool,
    satisfied: bool,
    on_satisfied: Option<SatisfyFn>,
    finalize: Option<FinalizeFn>,
    dependents: Vec<Arc<DeferredSlot>>,
}

/// One outstanding deferred request for a typed value.
///
/// A slot fires its satisfaction callback at most once, and its finalize step
/// exactly once — on satisfaction or on cancellation, whichever comes first.
/// Dependent slots attached to a live slot ride along when it is satisfied;
/// dependents of a cancelled slot are never released.
pub struct DeferredSlot {
    key: TypeId,
    key_name: &'static str,
    state: Mutex<SlotState>,
}

impl DeferredSlot {
    /// Creates a slot for type `T` whose callback receives the satisfied
    /// value.
    pub fn new<T>(on_satisfied: impl FnOnce(Arc<T>) + Send + 'static) -> Arc<Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Arc::new(Self {
            key: TypeId::of::<T>(),
            key_name: std::any::type_name::<T>(),
            state: Mutex::new(SlotState {
                cancelled: false,
                satisfied: false,
                on_satisfied: Some(Box::new(move |value: &WiredValue| {
                    if let Some(typed) = value.extract::<T>() {
                        on_satisfied(typed);
                    }
                })),
                finalize: None,
                dependents: Vec::new(),
            }),
        })
    }

    /// Attaches a one-shot finalize step, run after satisfaction or on
    /// cancellation, always outside runtime locks.
    #[must_use]
    pub fn with_finalize(self: Arc<Self>, finalize: impl FnOnce() + Send + 'static) -> Arc<Self> {
        locked(&self.state).finalize = Some(Box::new(finalize));
        self
    }

    /// Links `dependent` so it is satisfied together with this slot. Returns
    /// `false` when this slot is already satisfied or cancelled — the caller
    /// must then handle the dependent itself (fire it or drop it).
    pub fn attach_dependent(&self, dependent: &Arc<DeferredSlot>) -> bool {
        let mut state = locked(&self.state);
        if state.satisfied || state.cancelled {
            return false;
        }
        state.dependents.push(Arc::clone(dependent));
        true
    }

    /// The requested type.
    #[must_use]
    pub fn key(&self) -> TypeId {
        self.key
    }

    /// Human-readable name of the requested type.
    #[must_use]
    pub fn key_name(&self) -> &'static str {
        self.key_name
    }

    /// Whether the satisfaction callback has fired.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        locked(&self.state).satisfied
    }

    /// Marks the slot satisfied, fires its callback, and hands back the
    /// pieces the chain walk still has to process. `None` when the slot was
    /// cancelled (or already satisfied): its dependents stay unreleased.
    pub(crate) fn complete(&self, value: &WiredValue) -> Option<SlotRelease> {
        let (callback, dependents, finalize) = {
            let mut state = locked(&self.state);
            if state.cancelled || state.satisfied {
                return None;
            }
            state.satisfied = true;
            (
                state.on_satisfied.take(),
                std::mem::take(&mut state.dependents),
                state.finalize.take(),
            )
        };
        if let Some(callback) = callback {
            callback(value);
        }
        Some(SlotRelease {
            dependents,
            finalize,
        })
    }

    /// Marks the slot cancelled and yields its finalize step if it has not
    /// run yet. Idempotent against satisfaction racing on another thread.
    pub(crate) fn cancel(&self) -> Option<FinalizeFn> {
        let mut state = locked(&self.state);
        if state.cancelled {
            return None;
        }
        state.cancelled = true;
        state.finalize.take()
    }
}

impl std::fmt::Debug for DeferredSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = locked(&self.state);
        f.debug_struct("DeferredSlot")
            .field("key", &self.key_name)
            .field("satisfied", &state.satisfied)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

/// What a completed slot leaves for the walk to carry on with.
pub(crate) struct SlotRelease {
    pub(crate) dependents: Vec<Arc<DeferredSlot>>,
    pub(crate) finalize: Option<FinalizeFn>,
}

/// Walks a detached consumer chain depth-first with an explicit stack,
/// firing callbacks in chain order and batching every finalize step to run
/// after the whole walk. Must be called with no context lock held: callbacks
/// routinely re-enter the context that released the chain.
pub(crate) fn run_chain(value: &WiredValue, chain: Vec<Arc<DeferredSlot>>) {
    let mut finalizers: Vec<FinalizeFn> = Vec::new();
    let mut work: Vec<Vec<Arc<DeferredSlot>>> = vec![chain];
    while let Some(chain) = work.pop() {
        for slot in chain {
            if let Some(release) = slot.complete(value) {
                if !release.dependents.is_empty() {
                    work.push(release.dependents);
                }
                if let Some(finalize) = release.finalize {
                    finalizers.push(finalize);
                }
            }
        }
    }
    for finalize in finalizers {
        finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn hello(&self) -> &'static str;
    }

    struct English;
    impl Greeter for English {
        fn hello(&self) -> &'static str {
            "hello"
        }
    }

    #[test]
    fn erased_value_round_trips_concrete_type() {
        let value = Arc::new(42u32);
        let wired = WiredValue::of(value.clone());
        assert_eq!(wired.type_id(), TypeId::of::<u32>());
        let back = wired.extract::<u32>().unwrap();
        assert_eq!(*back, 42);
        assert!(Arc::ptr_eq(&value, &back));
    }

    #[test]
    fn erased_value_round_trips_trait_object() {
        let greeter: Arc<dyn Greeter> = Arc::new(English);
        let wired = WiredValue::of(greeter);
        assert!(wired.extract::<u32>().is_none());
        let back = wired.extract::<dyn Greeter>().unwrap();
        assert_eq!(back.hello(), "hello");
    }

    #[test]
    fn descriptor_matches_concrete_and_facets() {
        let value = Arc::new(English);
        let desc = Descriptor {
            concrete: WiredValue::of(value.clone()),
            facets: vec![WiredValue::of(value as Arc<dyn Greeter>)],
        };
        assert!(desc.slot_for(TypeId::of::<English>()).is_some());
        assert!(desc.slot_for(TypeId::of::<dyn Greeter>()).is_some());
        assert!(desc.slot_for(TypeId::of::<u32>()).is_none());
    }

    #[test]
    fn slot_fires_callback_and_finalize_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let finalized2 = finalized.clone();
        let slot = DeferredSlot::new::<u32>(move |v| {
            assert_eq!(*v, 7);
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .with_finalize(move || {
            finalized2.fetch_add(1, Ordering::SeqCst);
        });

        let value = WiredValue::of(Arc::new(7u32));
        run_chain(&value, vec![slot.clone()]);
        // A second walk over the same slot is a no-op.
        run_chain(&value, vec![slot.clone()]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(slot.is_satisfied());
    }

    #[test]
    fn cancelled_slot_keeps_dependents_unreleased() {
        let parent_fired = Arc::new(AtomicUsize::new(0));
        let child_fired = Arc::new(AtomicUsize::new(0));
        let pf = parent_fired.clone();
        let cf = child_fired.clone();

        let parent = DeferredSlot::new::<u32>(move |_| {
            pf.fetch_add(1, Ordering::SeqCst);
        });
        let child = DeferredSlot::new::<u32>(move |_| {
            cf.fetch_add(1, Ordering::SeqCst);
        });
        assert!(parent.attach_dependent(&child));

        let finalize = parent.cancel();
        assert!(finalize.is_none()); // no finalize step was attached
        let value = WiredValue::of(Arc::new(1u32));
        run_chain(&value, vec![parent]);
        assert_eq!(parent_fired.load(Ordering::SeqCst), 0);
        assert_eq!(child_fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dependents_of_live_slot_ride_along() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let parent = DeferredSlot::new::<u32>(move |_| o1.lock().unwrap().push("parent"));
        let child = DeferredSlot::new::<u32>(move |_| o2.lock().unwrap().push("child"));
        assert!(parent.attach_dependent(&child));

        let value = WiredValue::of(Arc::new(3u32));
        run_chain(&value, vec![parent]);
        assert_eq!(*order.lock().unwrap(), vec!["parent", "child"]);
    }

    #[test]
    fn attach_to_satisfied_slot_is_refused() {
        let parent = DeferredSlot::new::<u32>(|_| {});
        let value = WiredValue::of(Arc::new(9u32));
        run_chain(&value, vec![parent.clone()]);
        let late = DeferredSlot::new::<u32>(|_| {});
        assert!(!parent.attach_dependent(&late));
    }
}
