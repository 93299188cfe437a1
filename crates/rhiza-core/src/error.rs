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

//! Error types surfaced by the runtime.
//!
//! Wiring misuse (double registration, ambiguous resolution) is reported to
//! the caller and never retried internally. Capacity pressure on dispatch
//! queues is not an error type: a rejected pend reports `false` to its caller
//! and the work is dropped, which is the documented backpressure policy.

use thiserror::Error;

/// Errors raised by injection and resolution against a context.
#[derive(Debug, Error)]
pub enum WiringError {
    /// A value of this type is already bound locally in the target context.
    #[error("type `{type_name}` is already bound in this context")]
    DuplicateType {
        /// Name of the already-bound type.
        type_name: &'static str,
    },

    /// The exact same value was injected into the same context twice.
    #[error("value of type `{type_name}` was already injected into this context")]
    DuplicateValue {
        /// Name of the doubly-injected type.
        type_name: &'static str,
    },

    /// Two distinct registered objects both satisfy the requested type, so
    /// the lookup refuses to pick one. The request is left unsatisfied.
    #[error("resolution of `{requested}` is ambiguous: `{first}` and `{second}` both satisfy it")]
    Ambiguous {
        /// The type that was asked for.
        requested: &'static str,
        /// Concrete type of the first matching object.
        first: &'static str,
        /// Concrete type of the second matching object.
        second: &'static str,
    },
}

/// Errors raised by context lifecycle operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A child initializer returned an error; the reserved child slot was
    /// vacated and the partially built child is torn down with the error.
    #[error("initializer for context `{name}` failed")]
    Initializer {
        /// Name of the child that failed to initialize.
        name: String,
        /// The initializer's own error.
        #[source]
        source: anyhow::Error,
    },
}
