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

//! Scoped access to resource content.
//!
//! [`crate::ResourceManager::begin_acquire`] hands out an [`AcquireGuard`];
//! the acquisition ends when the guard is dropped, on every exit path. The
//! guard holds the content cell itself, so content stays alive and readable
//! even if the resource is evicted from the registry mid-acquisition.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;

use strata_core::resource::{Resource, TypedResource};

use crate::state::{lock, ContentCell};

/// How hard an acquire tries to produce usable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return the content object in whatever state it is in. Never blocks,
    /// never falls back, does not count as a use for recency tracking.
    PointerOnly,
    /// Return final content if loaded, otherwise a fallback resource while
    /// loading continues in the background. Fails loudly if the resource
    /// turns out missing and no missing-fallback exists.
    AllowLoadingFallback,
    /// Like [`AcquireMode::AllowLoadingFallback`], but a missing resource
    /// without a fallback yields nothing, silently.
    AllowLoadingFallbackNeverFail,
    /// Block until the resource is loaded (or missing). Fails loudly if it
    /// turns out missing and no missing-fallback exists.
    BlockTillLoaded,
    /// Like [`AcquireMode::BlockTillLoaded`], but a missing resource without
    /// a fallback yields nothing, silently.
    BlockTillLoadedNeverFail,
}

/// What kind of content an acquire produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// No content at all.
    None,
    /// A loading fallback stands in; the real content is still loading.
    LoadingFallback,
    /// The missing fallback stands in; the real content does not exist.
    MissingFallback,
    /// The requested content itself.
    Final,
}

/// RAII token for one acquisition. Content access goes through
/// [`AcquireGuard::lock`]; the acquisition ends when the guard drops.
pub struct AcquireGuard {
    cell: ContentCell,
    result: AcquireResult,
}

impl AcquireGuard {
    pub(crate) fn new(cell: ContentCell, result: AcquireResult) -> Self {
        Self { cell, result }
    }

    /// What kind of content this guard gives access to.
    pub fn result(&self) -> AcquireResult {
        self.result
    }

    /// Locks the content for access. The lock is per-resource and held only
    /// as long as the returned guard; keep it short.
    pub fn lock(&self) -> ResourceGuard<'_> {
        ResourceGuard {
            guard: lock(&self.cell),
        }
    }
}

impl fmt::Debug for AcquireGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireGuard")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Locked access to a resource's content.
pub struct ResourceGuard<'a> {
    guard: MutexGuard<'a, Box<dyn Resource>>,
}

impl ResourceGuard<'_> {
    /// Downcasts to the concrete resource type.
    pub fn get<T: TypedResource>(&self) -> Option<&T> {
        self.guard.as_any().downcast_ref::<T>()
    }

    /// Mutably downcasts to the concrete resource type.
    pub fn get_mut<T: TypedResource>(&mut self) -> Option<&mut T> {
        self.guard.as_any_mut().downcast_mut::<T>()
    }
}

impl Deref for ResourceGuard<'_> {
    type Target = dyn Resource;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref()
    }
}

impl DerefMut for ResourceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut()
    }
}
