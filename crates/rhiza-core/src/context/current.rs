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

//! Thread-local current-context tracking.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use super::Context;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
}

/// Restores the previously current context when dropped.
///
/// Returned by [`Context::make_current`]; scoped strictly to the thread that
/// created it.
pub struct CurrentGuard {
    prev: Option<Arc<Context>>,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

impl std::fmt::Debug for CurrentGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CurrentGuard")
    }
}

impl Context {
    /// The context most recently made current on this thread, if any.
    ///
    /// Child initializers run with the child current, so factories called
    /// from one can discover where they are being built.
    #[must_use]
    pub fn current() -> Option<Arc<Context>> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Makes this context current on the calling thread until the guard
    /// drops. Guards nest.
    #[must_use]
    pub fn make_current(self: &Arc<Self>) -> CurrentGuard {
        let prev = CURRENT.with(|cell| cell.borrow_mut().replace(Arc::clone(self)));
        CurrentGuard {
            prev,
            _thread_bound: PhantomData,
        }
    }
}
