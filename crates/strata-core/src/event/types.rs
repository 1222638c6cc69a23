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

use crate::resource::{ResourceId, ResourceState, TypeToken};

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEventKind {
    /// A resource instance was registered for the first time.
    Created,
    /// The pipeline finished loading the resource content.
    Loaded,
    /// The resource content was unloaded.
    Unloaded,
    /// The resource was evicted from the registry.
    Deleted,
    /// Re-announcement of an existing resource, for late subscribers.
    Exists,
    /// A resource ended up missing and was acquired without a registered
    /// missing fallback for its type.
    MissingFallbackRequired,
}

/// A state change on an individual resource.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    /// What happened.
    pub kind: ResourceEventKind,
    /// The resource type.
    pub type_token: TypeToken,
    /// The resource id.
    pub id: ResourceId,
    /// State before the change.
    pub old_state: ResourceState,
    /// State after the change.
    pub new_state: ResourceState,
}

/// A manager-wide event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceManagerEvent {
    /// The manager is shutting down; no further loads will complete.
    ManagerShuttingDown,
    /// A reload-all pass changed at least one resource.
    ReloadAllResources,
}
