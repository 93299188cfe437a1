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

//! Per-context key/value attributes.
//!
//! Attributes are free-form [`serde_json::Value`] slots keyed by string. A
//! freshly created context copies its ancestors' attributes (closest ancestor
//! wins), after which the stores are independent: setting an attribute on a
//! parent does not reach into children that already exist.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::sync::locked;

/// Callback invoked after an attribute changes.
pub type AttrHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// String-keyed attribute slots with change hooks.
#[derive(Default)]
pub struct AttrStore {
    slots: Mutex<HashMap<String, Value>>,
    hooks: Mutex<Vec<AttrHook>>,
}

impl AttrStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the value under `key`, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        locked(&self.slots).get(key).cloned()
    }

    /// Sets `key` to `value`, replacing any previous value, then fires the
    /// registered hooks.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        locked(&self.slots).insert(key.clone(), value.clone());

        // Hooks run outside the slot lock so they may read the store.
        let hooks: Vec<AttrHook> = locked(&self.hooks).iter().cloned().collect();
        for hook in hooks {
            hook(&key, &value);
        }
    }

    /// Registers a hook fired on every subsequent [`set`](AttrStore::set).
    pub fn watch(&self, hook: AttrHook) {
        locked(&self.hooks).push(hook);
    }

    /// Number of set attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        locked(&self.slots).len()
    }

    /// True when no attributes are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        locked(&self.slots).is_empty()
    }

    /// Copies entries from `other` for keys this store does not have yet.
    ///
    /// Walking ancestors closest-first and seeding from each gives the
    /// nearest ancestor's value priority.
    pub(crate) fn seed_missing_from(&self, other: &AttrStore) {
        let inherited: Vec<(String, Value)> = locked(&other.slots)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut slots = locked(&self.slots);
        for (key, value) in inherited {
            slots.entry(key).or_insert(value);
        }
    }
}

impl std::fmt::Debug for AttrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrStore")
            .field("slots", &locked(&self.slots).len())
            .field("hooks", &locked(&self.hooks).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let store = AttrStore::new();
        assert!(store.get("tier").is_none());

        store.set("tier", "fast");
        assert_eq!(store.get("tier"), Some(json!("fast")));

        store.set("tier", json!({"level": 2}));
        assert_eq!(store.get("tier"), Some(json!({"level": 2})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn hooks_fire_on_every_set() {
        let store = AttrStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        store.watch(Arc::new(move |key, value| {
            assert_eq!(key, "retries");
            assert_eq!(value, &json!(3));
            s.fetch_add(1, Ordering::SeqCst);
        }));

        store.set("retries", 3);
        store.set("retries", 3);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hook_may_read_the_store() {
        let store = Arc::new(AttrStore::new());
        let inner = Arc::clone(&store);
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        store.watch(Arc::new(move |key, _| {
            *locked(&o) = inner.get(key);
        }));

        store.set("mode", "burst");
        assert_eq!(*locked(&observed), Some(json!("burst")));
    }

    #[test]
    fn seeding_keeps_local_values() {
        let parent = AttrStore::new();
        parent.set("region", "eu");
        parent.set("tier", "slow");

        let child = AttrStore::new();
        child.set("tier", "fast");
        child.seed_missing_from(&parent);

        assert_eq!(child.get("region"), Some(json!("eu")));
        assert_eq!(child.get("tier"), Some(json!("fast")));
    }
}
