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

//! Reference-counted resource handles.
//!
//! A valid handle contributes exactly one to its resource's reference count.
//! `Clone` increments, `Drop` and [`ResourceHandle::invalidate`] decrement,
//! and moves transfer the handle without touching the count at all, so the
//! count always equals the number of live valid handles (plus the manager's
//! own internal fallback references).

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use strata_core::resource::{ResourceId, TypedResource, TypeToken};

use crate::state::{lock, ResourceKey, Shared};

struct HandleInner {
    shared: Arc<Shared>,
    key: ResourceKey,
    type_token: TypeToken,
    id_hash: u64,
}

/// A type-erased, reference-counted handle to a resource.
///
/// Handles are cheap identity tokens; they never expose the resource content
/// directly. Access goes through
/// [`crate::ResourceManager::begin_acquire`].
pub struct ResourceHandle {
    inner: Option<HandleInner>,
}

impl ResourceHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: ResourceKey,
        type_token: TypeToken,
        id_hash: u64,
    ) -> Self {
        Self {
            inner: Some(HandleInner {
                shared,
                key,
                type_token,
                id_hash,
            }),
        }
    }

    /// A handle that references nothing.
    pub fn invalid() -> Self {
        Self { inner: None }
    }

    /// Whether the handle references a resource.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Releases the reference and leaves the handle invalid. Safe to call on
    /// an already invalid handle.
    pub fn invalidate(&mut self) {
        if let Some(inner) = self.inner.take() {
            release(&inner);
        }
    }

    /// The type of the referenced resource; [`TypeToken::NULL`] when invalid.
    pub fn type_token(&self) -> TypeToken {
        self.inner
            .as_ref()
            .map_or(TypeToken::NULL, |inner| inner.type_token)
    }

    /// The stable 64-bit hash of the resource id; 0 when invalid.
    pub fn id_hash(&self) -> u64 {
        self.inner.as_ref().map_or(0, |inner| inner.id_hash)
    }

    /// The full resource id. Requires a live resource, hence a lock.
    pub fn resource_id(&self) -> Option<ResourceId> {
        let inner = self.inner.as_ref()?;
        let st = lock(&inner.shared.state);
        st.slots.get(inner.key).map(|slot| slot.id.clone())
    }

    /// Reinterprets the handle as a typed one. Debug-asserts that the
    /// handle's type is `T` or the registered derived redirection of `T`,
    /// so typed loads keep working for redirected ids; content access stays
    /// downcast-checked either way.
    pub fn into_typed<T: TypedResource>(self) -> TypedResourceHandle<T> {
        #[cfg(debug_assertions)]
        if let Some(inner) = &self.inner {
            if inner.type_token != T::type_token() {
                let st = lock(&inner.shared.state);
                let redirected = st
                    .derived
                    .get(&T::type_token())
                    .is_some_and(|mapping| mapping.derived == inner.type_token);
                assert!(
                    redirected,
                    "handle of type {} reinterpreted as {}",
                    inner.type_token,
                    T::type_token(),
                );
            }
        }
        TypedResourceHandle {
            raw: self,
            _marker: PhantomData,
        }
    }

    pub(crate) fn key(&self) -> Option<ResourceKey> {
        self.inner.as_ref().map(|inner| inner.key)
    }

    pub(crate) fn shared(&self) -> Option<&Arc<Shared>> {
        self.inner.as_ref().map(|inner| &inner.shared)
    }
}

fn release(inner: &HandleInner) {
    let mut st = lock(&inner.shared.state);
    if let Some(slot) = st.slots.get_mut(inner.key) {
        debug_assert!(slot.ref_count > 0, "handle refcount underflow");
        slot.ref_count = slot.ref_count.saturating_sub(1);
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        if let Some(inner) = &self.inner {
            let mut st = lock(&inner.shared.state);
            if let Some(slot) = st.slots.get_mut(inner.key) {
                slot.ref_count += 1;
            }
        }
        Self {
            inner: self.inner.as_ref().map(|inner| HandleInner {
                shared: Arc::clone(&inner.shared),
                key: inner.key,
                type_token: inner.type_token,
                id_hash: inner.id_hash,
            }),
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            release(&inner);
        }
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => a.key == b.key,
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for ResourceHandle {}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(
                f,
                "ResourceHandle({}, {:#018x})",
                inner.type_token, inner.id_hash
            ),
            None => f.write_str("ResourceHandle(invalid)"),
        }
    }
}

/// A strongly typed handle to a resource of type `T`.
///
/// Behaves exactly like [`ResourceHandle`] (it wraps one) and derefs to it,
/// so it can be passed anywhere a raw handle is expected.
pub struct TypedResourceHandle<T: TypedResource> {
    raw: ResourceHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedResource> TypedResourceHandle<T> {
    /// A typed handle that references nothing.
    pub fn invalid() -> Self {
        Self {
            raw: ResourceHandle::invalid(),
            _marker: PhantomData,
        }
    }

    /// Borrows the underlying type-erased handle.
    pub fn untyped(&self) -> &ResourceHandle {
        &self.raw
    }

    /// Unwraps into the underlying type-erased handle.
    pub fn into_untyped(self) -> ResourceHandle {
        self.raw
    }

    /// Releases the reference and leaves the handle invalid.
    pub fn invalidate(&mut self) {
        self.raw.invalidate();
    }
}

impl<T: TypedResource> Deref for TypedResourceHandle<T> {
    type Target = ResourceHandle;

    fn deref(&self) -> &ResourceHandle {
        &self.raw
    }
}

impl<T: TypedResource> Clone for TypedResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: TypedResource> Default for TypedResourceHandle<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T: TypedResource> PartialEq for TypedResourceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: TypedResource> Eq for TypedResourceHandle<T> {}

impl<T: TypedResource> fmt::Debug for TypedResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}
