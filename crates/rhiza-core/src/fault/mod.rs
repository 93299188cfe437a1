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

//! Fault capture at framework boundaries.
//!
//! A panic inside dispatched work or an event-receiver callback is caught at
//! the boundary that invoked it and wrapped into a [`Fault`]. The owning
//! context walks its filter chain from itself to the root; every filter sees
//! the fault and reports whether it consumed it, and the combined verdict is
//! an explicit boolean rather than an unwound stack. Unhandled dispatch
//! faults resume unwinding into the dispatcher's caller; unhandled event
//! faults are logged and the broadcast continues.
//!
//! Filters never suppress teardown: a context that faulted while starting
//! still proceeds to its terminal state.

use std::any::Any;

/// The framework boundary a fault was captured at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// A thunk executed by a dispatch queue.
    Dispatch,
    /// An event-receiver callback during publication.
    Event,
    /// Work executed on a thread pool.
    Pool,
}

/// A captured panic, carrying its original payload.
pub struct Fault {
    origin: FaultOrigin,
    payload: Box<dyn Any + Send>,
}

impl Fault {
    pub(crate) fn from_panic(origin: FaultOrigin, payload: Box<dyn Any + Send>) -> Self {
        Self { origin, payload }
    }

    /// Where this fault was captured.
    #[must_use]
    pub fn origin(&self) -> FaultOrigin {
        self.origin
    }

    /// Best-effort view of the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s
        } else {
            "non-string panic payload"
        }
    }

    /// Surrenders the payload, e.g. to resume unwinding.
    pub(crate) fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl std::fmt::Debug for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fault")
            .field("origin", &self.origin)
            .field("message", &self.message())
            .finish()
    }
}

/// A link in a context's fault filter chain.
///
/// Returns `true` when the filter consumed the fault. Every filter in the
/// chain runs regardless of earlier verdicts; consumption verdicts are OR-ed.
pub trait FaultFilter: Send + Sync {
    /// Inspects one captured fault.
    fn filter(&self, fault: &Fault) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_extraction_covers_common_payloads() {
        let f = Fault::from_panic(FaultOrigin::Dispatch, Box::new("static str"));
        assert_eq!(f.message(), "static str");

        let f = Fault::from_panic(FaultOrigin::Event, Box::new(String::from("owned")));
        assert_eq!(f.message(), "owned");

        let f = Fault::from_panic(FaultOrigin::Pool, Box::new(17u32));
        assert_eq!(f.message(), "non-string panic payload");
    }
}
