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

//! # Strata Resource
//!
//! The orchestration layer of the Strata resource system: reference-counted
//! handles, the resource registry, the priority-sorted loading queue, the
//! two-stage worker pipeline, acquisition with fallbacks, reloading and the
//! auto-unload sweep.
//!
//! The contracts this crate orchestrates (the
//! [`strata_core::resource::Resource`] trait, loaders, events) live in
//! `strata-core`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_resource::{
//!     AcquireMode, FileResourceLoader, ResourceManager, ResourceManagerConfig,
//!     ResourceTypeDescriptor,
//! };
//! # use strata_core::resource::{
//! #     MemoryUsage, Resource, ResourceLoadDesc, ResourceState, TypedResource, TypeToken, Unload,
//! # };
//! # #[derive(Default)]
//! # struct Mesh;
//! # impl Resource for Mesh {
//! #     fn update_content(&mut self, _: Option<&mut dyn std::io::Read>) -> ResourceLoadDesc {
//! #         ResourceLoadDesc::simple(ResourceState::Loaded)
//! #     }
//! #     fn unload_data(&mut self, _: Unload) -> ResourceLoadDesc {
//! #         ResourceLoadDesc::simple(ResourceState::Unloaded)
//! #     }
//! #     fn update_memory_usage(&self) -> MemoryUsage { MemoryUsage::default() }
//! #     fn as_any(&self) -> &dyn std::any::Any { self }
//! #     fn as_any_mut(&mut self) -> &mut dyn std::any::Any { self }
//! # }
//! # impl TypedResource for Mesh {
//! #     fn type_token() -> TypeToken { TypeToken::new("Mesh") }
//! # }
//!
//! let mut manager = ResourceManager::new(ResourceManagerConfig::default());
//! manager.register_resource_type(ResourceTypeDescriptor::new::<Mesh>());
//! manager.set_default_resource_loader(Arc::new(FileResourceLoader::new("assets")));
//!
//! let rock = manager.load::<Mesh>("meshes/rock.mesh");
//! let (guard, _result) = manager.begin_acquire(&rock, AcquireMode::BlockTillLoaded, None);
//! if let Some(guard) = guard {
//!     let content = guard.lock();
//!     let _mesh: &Mesh = content.get::<Mesh>().unwrap();
//! }
//! manager.update();
//! manager.shutdown();
//! ```

#![warn(missing_docs)]

mod acquire;
mod config;
mod file_loader;
mod handle;
mod manager;
mod pipeline;
mod state;

pub use acquire::{AcquireGuard, AcquireMode, AcquireResult, ResourceGuard};
pub use config::ResourceManagerConfig;
pub use file_loader::FileResourceLoader;
pub use handle::{ResourceHandle, TypedResourceHandle};
pub use manager::{ResourceManager, ResourceTypeDescriptor};
