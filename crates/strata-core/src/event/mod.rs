// Copyright 2025 Strata Contributors
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

//! Event-driven observability for the resource system.
//!
//! Events are queued through a channel and drained by subscribers on their
//! own schedule, never delivered synchronously while the resource manager
//! holds its lock. That makes it safe for a handler to call back into the
//! manager; there is no broadcast-under-lock reentrancy hazard.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{ResourceEvent, ResourceEventKind, ResourceManagerEvent};
