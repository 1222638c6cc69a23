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

//! The base lifecycle contract for all resources.
//!
//! A resource is a lazily-loaded, reference-counted unit of content (a mesh,
//! a texture, an animation clip) with a lifecycle independent of any single
//! owner. This module defines the state machine every resource moves
//! through, the [`Resource`] trait that concrete resource types implement,
//! and the small value types the resource manager uses to drive them.

mod id;
mod priority;
mod token;

pub use id::ResourceId;
pub use priority::ResourcePriority;
pub use token::TypeToken;

use std::any::Any;
use std::io::Read;

/// The loading state of a resource.
///
/// Legal transitions are `Unloaded -> {Loaded, LoadedResourceMissing}` and
/// `{Loaded, LoadedResourceMissing} -> Unloaded`. A resource never moves
/// from `Loaded` to `LoadedResourceMissing` directly; a reload always clears
/// it to `Unloaded` before a new load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No content is resident. The initial state, and the state after a
    /// full unload. While a load is pending the resource stays `Unloaded`;
    /// "loading" is represented by its presence in the queue or in an
    /// in-flight task, not by a separate state.
    Unloaded,
    /// The load pipeline ran but the resource data could not be found or
    /// decoded. This is a reported, recoverable condition, not an error.
    LoadedResourceMissing,
    /// Content is resident and usable.
    Loaded,
}

/// What a resource should unload when asked to release data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unload {
    /// Release everything; the resource must end up `Unloaded`.
    AllQualityLevels,
    /// Release only the least important resident quality level.
    OneQualityLevel,
}

/// The thread on which a resource type's content update must run.
///
/// Some resource types can finalize their content on any worker thread,
/// others must run on the thread that owns an external context (a rendering
/// device, for instance) and declare `MainThread` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateThread {
    /// Content updates may run on any worker thread.
    AnyThread,
    /// Content updates must run on the manager's main thread.
    MainThread,
}

/// Reported CPU/GPU memory estimates for a resource.
///
/// These are reported numbers, not owned allocations; the manager records
/// them for observability and never acts on them directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Estimated bytes of CPU-side memory held by the resource.
    pub cpu_bytes: u64,
    /// Estimated bytes of GPU-side memory held by the resource.
    pub gpu_bytes: u64,
}

/// The outcome of a content update or unload, reported by the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLoadDesc {
    /// The state the resource is in after the operation.
    pub state: ResourceState,
    /// How many quality levels could currently be discarded.
    pub quality_levels_discardable: u8,
    /// How many additional quality levels could still be loaded.
    pub quality_levels_loadable: u8,
}

impl ResourceLoadDesc {
    /// Convenience constructor for the common single-level case.
    pub fn simple(state: ResourceState) -> Self {
        let loaded = state == ResourceState::Loaded;
        Self {
            state,
            quality_levels_discardable: u8::from(loaded),
            quality_levels_loadable: 0,
        }
    }
}

/// The lifecycle contract implemented by every concrete resource type.
///
/// Implementations hold the actual decoded content. The resource manager
/// owns state bookkeeping (id, refcount, priority, timestamps) separately,
/// so a `Resource` implementation only deals with its own data.
///
/// `Send + 'static` is required so content updates can run on worker
/// threads; all access is serialized by the manager.
pub trait Resource: Send + 'static {
    /// Consume a byte stream produced by the type loader and replace the
    /// resource content with what it describes.
    ///
    /// `stream` is `None` when opening the data stream failed; the
    /// implementation must report [`ResourceState::LoadedResourceMissing`]
    /// in that case and must not panic; a missing resource is an expected,
    /// recoverable condition.
    ///
    /// The leading bytes of every stream are the standard header (absolute
    /// source path, then content hash). Implementations must consume it via
    /// [`crate::loader::read_stream_header`] before their own content, even
    /// if they ignore it, to keep the stream position consistent.
    fn update_content(&mut self, stream: Option<&mut dyn Read>) -> ResourceLoadDesc;

    /// Release owned memory for one or all quality levels.
    ///
    /// Must be safe to call on an already unloaded resource (no-op), and
    /// must report [`ResourceState::Unloaded`] once all levels are gone.
    fn unload_data(&mut self, what: Unload) -> ResourceLoadDesc;

    /// Report current memory estimates. Pure query; must not mutate state.
    fn update_memory_usage(&self) -> MemoryUsage;

    /// Upcast for typed access through acquire guards.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed access through acquire guards.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A resource type with a process-wide token of its own.
///
/// Implemented by concrete resource types so that typed APIs (typed handles,
/// typed load calls) can name the type without carrying a token around.
pub trait TypedResource: Resource {
    /// The token identifying this resource type.
    fn type_token() -> TypeToken;
}
