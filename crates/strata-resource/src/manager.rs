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

//! The resource manager: registry, lifecycle, acquisition and the per-frame
//! tick that drives the loading pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use strata_core::event::{EventBus, ResourceEvent, ResourceEventKind, ResourceManagerEvent};
use strata_core::loader::{ResourceRequest, ResourceTypeLoader};
use strata_core::resource::{
    MemoryUsage, Resource, ResourceId, ResourcePriority, ResourceState, TypedResource, TypeToken,
    Unload, UpdateThread,
};
use strata_core::time::{Clock, SystemClock};

use crate::acquire::{AcquireGuard, AcquireMode, AcquireResult};
use crate::config::ResourceManagerConfig;
use crate::handle::{ResourceHandle, TypedResourceHandle};
use crate::pipeline::{
    self, pump_main_thread_tasks, spawn_workers, updating_type_on_this_thread,
};
use crate::state::{
    lock, DeferredUnload, DerivedMapping, ManagerState, ResourceKey, Shared, Slot, TypeRow,
};

/// How many queue entries get their priority recomputed per tick. The rest
/// keep their cached value until the stride comes back around.
const QUEUE_REFRESH_STRIDE: usize = 50;

/// A resource acquired within this window of its reload counts as "in use"
/// and is queued for loading again right after the reload unloads it.
const RELOAD_REPRELOAD_WINDOW: Duration = Duration::from_secs(30);

/// Everything the manager needs to know about a resource type before the
/// first resource of that type is requested.
pub struct ResourceTypeDescriptor {
    token: TypeToken,
    create: Box<dyn Fn() -> Box<dyn Resource> + Send + Sync>,
    update_thread: UpdateThread,
    default_priority: ResourcePriority,
    incremental_unload: bool,
}

impl ResourceTypeDescriptor {
    /// Descriptor for a type constructible via `Default`.
    pub fn new<T: TypedResource + Default>() -> Self {
        Self::with_factory(T::type_token(), || Box::<T>::default())
    }

    /// Descriptor with an explicit factory, for types that need constructor
    /// arguments captured in the closure.
    pub fn with_factory(
        token: TypeToken,
        create: impl Fn() -> Box<dyn Resource> + Send + Sync + 'static,
    ) -> Self {
        Self {
            token,
            create: Box::new(create),
            update_thread: UpdateThread::AnyThread,
            default_priority: ResourcePriority::default(),
            incremental_unload: true,
        }
    }

    /// Restricts content updates for this type to the manager's main thread.
    pub fn update_thread(mut self, update_thread: UpdateThread) -> Self {
        self.update_thread = update_thread;
        self
    }

    /// Sets the priority class resources of this type start with.
    pub fn default_priority(mut self, priority: ResourcePriority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Allows or forbids unloading individual quality levels. Types that
    /// forbid it are also skipped by the timed unused-resource sweep; only
    /// [`ResourceManager::free_all_unused_resources`] frees them.
    pub fn incremental_unload(mut self, allowed: bool) -> Self {
        self.incremental_unload = allowed;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Loaded,
    Missing,
    Aborted,
}

/// The asynchronous resource manager.
///
/// Owns the resource registry, the loading queue and the worker pipeline.
/// Create one with [`ResourceManager::new`], call [`ResourceManager::update`]
/// once per frame from the thread that created it, and call
/// [`ResourceManager::shutdown`] (or drop the manager) when done.
pub struct ResourceManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    config: ResourceManagerConfig,
    shut_down: bool,
}

impl ResourceManager {
    /// Creates a manager with the default wall clock. The creating thread
    /// becomes the manager's main thread.
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates a manager with an injected clock (simulated time in tests).
    pub fn with_clock(config: ResourceManagerConfig, clock: Arc<dyn Clock>) -> Self {
        let (load_signal_tx, load_signal_rx) = crossbeam_channel::unbounded();
        let (update_any_tx, update_any_rx) = crossbeam_channel::unbounded();
        let (main_tx, main_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState::new()),
            load_cond: Condvar::new(),
            clock,
            resource_events: EventBus::new(),
            manager_events: EventBus::new(),
            load_signal_tx,
            update_any_tx,
            update_any_rx,
            main_tx,
            main_rx,
            critical_missing_cb: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            main_thread: std::thread::current().id(),
        });
        let workers = spawn_workers(&shared, &config, load_signal_rx);
        Self {
            shared,
            workers,
            config,
            shut_down: false,
        }
    }

    // ---- type and loader registration -----------------------------------

    /// Registers a resource type. Must happen before the first resource of
    /// that type is requested.
    pub fn register_resource_type(&self, descriptor: ResourceTypeDescriptor) {
        let mut st = lock(&self.shared.state);
        if st.types.contains_key(&descriptor.token) {
            log::warn!(
                "Resource type {} registered twice; replacing the registration.",
                descriptor.token
            );
        }
        st.types.insert(
            descriptor.token,
            TypeRow {
                create: descriptor.create,
                update_thread: descriptor.update_thread,
                default_priority: descriptor.default_priority,
                incremental_unload: descriptor.incremental_unload,
                loader: None,
                loading_fallback: None,
                missing_fallback: None,
            },
        );
    }

    /// Sets the loader used for types without a loader of their own.
    pub fn set_default_resource_loader(&self, loader: Arc<dyn ResourceTypeLoader>) {
        lock(&self.shared.state).default_loader = Some(loader);
    }

    /// Sets or clears the loader for one resource type.
    pub fn set_resource_type_loader(
        &self,
        token: TypeToken,
        loader: Option<Arc<dyn ResourceTypeLoader>>,
    ) {
        let mut st = lock(&self.shared.state);
        match st.types.get_mut(&token) {
            Some(row) => row.loader = loader,
            None => {
                log::error!("Cannot set a loader for unregistered type {token}.");
                debug_assert!(false, "resource type not registered");
            }
        }
    }

    /// Sets or clears the resource handed out while resources of this type
    /// are still loading. The fallback is held referenced by the manager
    /// until cleared or shutdown.
    pub fn set_resource_type_loading_fallback(
        &self,
        token: TypeToken,
        fallback: Option<&ResourceHandle>,
    ) {
        self.set_type_fallback(token, fallback, true);
    }

    /// Sets or clears the resource handed out for resources of this type
    /// that turn out missing.
    pub fn set_resource_type_missing_fallback(
        &self,
        token: TypeToken,
        fallback: Option<&ResourceHandle>,
    ) {
        self.set_type_fallback(token, fallback, false);
    }

    fn set_type_fallback(&self, token: TypeToken, fallback: Option<&ResourceHandle>, loading: bool) {
        let new_key = fallback.and_then(|h| h.key());
        let mut st = lock(&self.shared.state);
        let ManagerState { types, slots, .. } = &mut *st;
        let Some(row) = types.get_mut(&token) else {
            log::error!("Cannot set a fallback for unregistered type {token}.");
            debug_assert!(false, "resource type not registered");
            return;
        };
        let target = if loading {
            &mut row.loading_fallback
        } else {
            &mut row.missing_fallback
        };
        if let Some(old) = target.take() {
            if let Some(slot) = slots.get_mut(old) {
                slot.ref_count = slot.ref_count.saturating_sub(1);
            }
        }
        if let Some(new) = new_key {
            *target = Some(new);
            if let Some(slot) = slots.get_mut(new) {
                slot.ref_count += 1;
            }
        }
    }

    /// Sets the priority class newly requested resources of this type get.
    pub fn set_resource_type_default_priority(&self, token: TypeToken, priority: ResourcePriority) {
        let mut st = lock(&self.shared.state);
        match st.types.get_mut(&token) {
            Some(row) => row.default_priority = priority,
            None => {
                log::error!("Cannot set a default priority for unregistered type {token}.");
                debug_assert!(false, "resource type not registered");
            }
        }
    }

    /// Installs a callback invoked when a resource turns out missing, no
    /// missing-fallback exists and the acquire was not a never-fail one.
    pub fn set_critical_resources_missing_callback(
        &self,
        callback: Option<Box<dyn Fn(TypeToken, &ResourceId) + Send>>,
    ) {
        *lock(&self.shared.critical_missing_cb) = callback;
    }

    /// Permits blocking acquires of `acquired`-type resources while a
    /// content update of an `updating`-type resource runs on the same
    /// thread. Without this, such nested acquires are a debug assertion.
    pub fn allow_acquire_during_update_content(&self, updating: TypeToken, acquired: TypeToken) {
        lock(&self.shared.state)
            .nested_acquire_allowed
            .insert((updating, acquired));
    }

    /// Redirects requests for `base`-type resources whose id the decider
    /// accepts to `derived`. At most one active mapping per base type.
    pub fn register_derived_type(
        &self,
        base: TypeToken,
        derived: TypeToken,
        decider: impl Fn(&ResourceId) -> bool + Send + Sync + 'static,
    ) {
        let mut st = lock(&self.shared.state);
        if st.derived.insert(
            base,
            DerivedMapping {
                derived,
                decider: Box::new(decider),
            },
        ).is_some()
        {
            log::warn!("Replacing the derived-type mapping for base type {base}.");
        }
    }

    // ---- names and ids --------------------------------------------------

    /// Redirects requests for `name` to `target`. Applied during id lookup,
    /// before the registry is consulted.
    pub fn register_named_resource(&self, name: &str, target: &str) {
        let name = ResourceId::new(name);
        let target = ResourceId::new(target);
        lock(&self.shared.state).named.insert(name.hash(), target);
    }

    /// Removes a named-resource redirection.
    pub fn unregister_named_resource(&self, name: &str) {
        let name = ResourceId::new(name);
        lock(&self.shared.state).named.remove(&name.hash());
    }

    /// Produces a process-unique resource id with the given prefix. Useful
    /// for manually created resources.
    pub fn generate_unique_resource_id(&self, prefix: &str) -> ResourceId {
        let mut st = lock(&self.shared.state);
        st.unique_id_counter += 1;
        ResourceId::new(format!("{prefix}-{}", st.unique_id_counter))
    }

    // ---- lookup and creation --------------------------------------------

    /// Returns a handle to the resource, creating and queueing it for
    /// loading on first request. Loading is asynchronous; the returned
    /// handle is valid immediately.
    pub fn load_resource(&self, token: TypeToken, id: &str) -> ResourceHandle {
        self.get_or_create(token, ResourceId::new(id), None)
    }

    /// Like [`ResourceManager::load_resource`], additionally attaching a
    /// per-instance loading fallback used while this resource loads.
    pub fn load_resource_with_fallback(
        &self,
        token: TypeToken,
        id: &str,
        fallback: &ResourceHandle,
    ) -> ResourceHandle {
        self.get_or_create(token, ResourceId::new(id), Some(fallback))
    }

    /// Typed convenience for [`ResourceManager::load_resource`].
    pub fn load<T: TypedResource>(&self, id: &str) -> TypedResourceHandle<T> {
        self.load_resource(T::type_token(), id).into_typed()
    }

    /// Typed convenience for [`ResourceManager::load_resource_with_fallback`].
    pub fn load_with_fallback<T: TypedResource>(
        &self,
        id: &str,
        fallback: &ResourceHandle,
    ) -> TypedResourceHandle<T> {
        self.load_resource_with_fallback(T::type_token(), id, fallback)
            .into_typed()
    }

    /// Returns a handle to an already registered resource, or `None`. Never
    /// creates anything.
    pub fn get_existing_resource(&self, token: TypeToken, id: &str) -> Option<ResourceHandle> {
        let id = ResourceId::new(id);
        let shared = Arc::clone(&self.shared);
        let mut st = lock(&shared.state);
        let id = st.named.get(&id.hash()).cloned().unwrap_or(id);
        let token = match st.derived.get(&token) {
            Some(mapping) if (mapping.decider)(&id) => mapping.derived,
            _ => token,
        };
        let key = *st.registry.get(&(token, id.hash()))?;
        let slot = st.slots.get_mut(key)?;
        slot.ref_count += 1;
        drop(st);
        Some(ResourceHandle::new(shared, key, token, id.hash()))
    }

    /// Registers a resource whose content the caller produced. Created
    /// resources start `Loaded` and are never queued for file loading.
    pub fn create_resource(
        &self,
        token: TypeToken,
        id: &str,
        resource: Box<dyn Resource>,
    ) -> ResourceHandle {
        let id = ResourceId::new(id);
        debug_assert!(!token.is_null(), "creating a resource with the null type");
        debug_assert!(!id.is_empty(), "creating a resource with an empty id");
        if token.is_null() || id.is_empty() {
            return ResourceHandle::invalid();
        }

        let shared = Arc::clone(&self.shared);
        let mut st = lock(&shared.state);
        if let Some(&key) = st.registry.get(&(token, id.hash())) {
            debug_assert!(false, "resource '{id}' already exists");
            log::error!("Cannot create resource '{id}': it already exists.");
            if let Some(slot) = st.slots.get_mut(key) {
                slot.ref_count += 1;
            }
            drop(st);
            return ResourceHandle::new(shared, key, token, id.hash());
        }

        let memory = resource.update_memory_usage();
        let now = shared.clock.now();
        let key = st.slots.insert(Slot {
            id: id.clone(),
            type_token: token,
            resource: Arc::new(Mutex::new(resource)),
            state: ResourceState::Loaded,
            ref_count: 1,
            priority: None,
            last_acquire: now,
            queued: false,
            in_flight: false,
            memory,
            change_counter: 1,
            quality_levels_discardable: 0,
            quality_levels_loadable: 0,
            is_created: true,
            prevent_file_reload: true,
            custom_loader: None,
            instance_loading_fallback: None,
            loaded_modification_time: None,
            description: None,
        });
        st.registry.insert((token, id.hash()), key);
        drop(st);

        shared.resource_events.publish(ResourceEvent {
            kind: ResourceEventKind::Created,
            type_token: token,
            id: id.clone(),
            old_state: ResourceState::Unloaded,
            new_state: ResourceState::Loaded,
        });
        ResourceHandle::new(shared, key, token, id.hash())
    }

    /// Typed convenience for [`ResourceManager::create_resource`].
    pub fn create<T: TypedResource>(&self, id: &str, resource: T) -> TypedResourceHandle<T> {
        self.create_resource(T::type_token(), id, Box::new(resource))
            .into_typed()
    }

    fn get_or_create(
        &self,
        token: TypeToken,
        id: ResourceId,
        instance_fallback: Option<&ResourceHandle>,
    ) -> ResourceHandle {
        debug_assert!(!token.is_null(), "requesting a resource with the null type");
        debug_assert!(!id.is_empty(), "requesting a resource with an empty id");
        if token.is_null() || id.is_empty() {
            return ResourceHandle::invalid();
        }

        let shared = Arc::clone(&self.shared);
        let mut st = lock(&shared.state);
        let id = st.named.get(&id.hash()).cloned().unwrap_or(id);
        let token = match st.derived.get(&token) {
            Some(mapping) if (mapping.decider)(&id) => mapping.derived,
            _ => token,
        };

        if let Some(&key) = st.registry.get(&(token, id.hash())) {
            if let Some(slot) = st.slots.get_mut(key) {
                if slot.id != id {
                    log::warn!(
                        "Resource id hash collision: '{}' vs '{}'; returning the registered one.",
                        slot.id,
                        id
                    );
                }
                slot.ref_count += 1;
                if instance_fallback.is_some() {
                    set_instance_fallback(&mut st, key, instance_fallback.and_then(|h| h.key()));
                }
                drop(st);
                return ResourceHandle::new(shared, key, token, id.hash());
            }
        }

        let Some(row) = st.types.get(&token) else {
            log::error!("Resource type {token} is not registered; cannot create '{id}'.");
            debug_assert!(false, "resource type not registered");
            return ResourceHandle::invalid();
        };
        let resource = (row.create)();
        let now = shared.clock.now();
        let key = st.slots.insert(Slot {
            id: id.clone(),
            type_token: token,
            resource: Arc::new(Mutex::new(resource)),
            state: ResourceState::Unloaded,
            ref_count: 1,
            priority: None,
            last_acquire: now,
            queued: false,
            in_flight: false,
            memory: MemoryUsage::default(),
            change_counter: 0,
            quality_levels_discardable: 0,
            quality_levels_loadable: 0,
            is_created: false,
            prevent_file_reload: false,
            custom_loader: None,
            instance_loading_fallback: None,
            loaded_modification_time: None,
            description: None,
        });
        st.registry.insert((token, id.hash()), key);
        if instance_fallback.is_some() {
            set_instance_fallback(&mut st, key, instance_fallback.and_then(|h| h.key()));
        }
        enqueue_for_loading(&shared, &mut st, key, false);
        drop(st);

        shared.resource_events.publish(ResourceEvent {
            kind: ResourceEventKind::Created,
            type_token: token,
            id: id.clone(),
            old_state: ResourceState::Unloaded,
            new_state: ResourceState::Unloaded,
        });
        ResourceHandle::new(shared, key, token, id.hash())
    }

    // ---- loading --------------------------------------------------------

    /// Queues the resource for loading without blocking. Calling this again
    /// refreshes the queued priority.
    pub fn preload(&self, handle: &ResourceHandle) {
        let Some(key) = handle.key() else { return };
        let mut st = lock(&self.shared.state);
        enqueue_for_loading(&self.shared, &mut st, key, false);
    }

    /// Moves the resource to the front of the queue and blocks until its
    /// load completed, one way or the other.
    pub fn force_load_resource_now(&self, handle: &ResourceHandle) {
        let Some(key) = handle.key() else { return };
        {
            let mut st = lock(&self.shared.state);
            let Some(slot) = st.slots.get(key) else { return };
            if slot.state != ResourceState::Unloaded {
                return;
            }
            if slot.queued {
                st.queue.move_to_front(key);
            } else {
                enqueue_for_loading(&self.shared, &mut st, key, true);
            }
        }
        let _ = self.wait_for_load(key);
    }

    /// Whether any load is queued or in flight.
    pub fn is_any_loading_in_progress(&self) -> bool {
        let st = lock(&self.shared.state);
        !st.queue.is_empty() || st.loads_in_flight > 0
    }

    // ---- acquisition ----------------------------------------------------

    /// Acquires the resource's content for the duration of the returned
    /// guard.
    ///
    /// `call_site_fallback` slots into the fallback preference order between
    /// the per-instance fallback and the per-type one. The result tells
    /// which content the guard actually carries; `None` comes with no guard.
    pub fn begin_acquire(
        &self,
        handle: &ResourceHandle,
        mode: AcquireMode,
        call_site_fallback: Option<&ResourceHandle>,
    ) -> (Option<AcquireGuard>, AcquireResult) {
        let Some(key) = handle.key() else {
            debug_assert!(false, "begin_acquire on an invalid handle");
            return (None, AcquireResult::None);
        };
        debug_assert!(
            handle.shared().is_some_and(|s| Arc::ptr_eq(s, &self.shared)),
            "handle belongs to a different manager"
        );

        let shared = &self.shared;
        let mut st = lock(&shared.state);

        let mode = if st.force_no_fallback_frames > 0 {
            match mode {
                AcquireMode::AllowLoadingFallback => AcquireMode::BlockTillLoaded,
                AcquireMode::AllowLoadingFallbackNeverFail => AcquireMode::BlockTillLoadedNeverFail,
                other => other,
            }
        } else {
            mode
        };

        let now = shared.clock.now();
        let Some(slot) = st.slots.get_mut(key) else {
            return (None, AcquireResult::None);
        };
        if mode != AcquireMode::PointerOnly {
            slot.last_acquire = now;
        }
        let state = slot.state;
        let cell = slot.resource.clone();

        if state == ResourceState::Loaded || mode == AcquireMode::PointerOnly {
            return (
                Some(AcquireGuard::new(cell, AcquireResult::Final)),
                AcquireResult::Final,
            );
        }

        if state == ResourceState::LoadedResourceMissing {
            return self.acquire_missing(st, key, mode);
        }

        // Unloaded: a load must be pending before anything else.
        let blocking = matches!(
            mode,
            AcquireMode::BlockTillLoaded | AcquireMode::BlockTillLoadedNeverFail
        );
        enqueue_for_loading(shared, &mut st, key, blocking);

        if !blocking {
            // instance fallback, then call-site, then type fallback
            let fallback_key = st.slots.get(key).and_then(|slot| {
                slot.instance_loading_fallback
                    .or_else(|| call_site_fallback.and_then(|h| h.key()))
                    .or_else(|| {
                        st.types
                            .get(&slot.type_token)
                            .and_then(|row| row.loading_fallback)
                    })
            });
            if let Some(fb) = fallback_key {
                drop(st);
                return self.acquire_loading_fallback(fb, now);
            }
            // No fallback anywhere: degrade to blocking.
        }

        if let Some(updating) = updating_type_on_this_thread() {
            let token = handle.type_token();
            let allowed = st.nested_acquire_allowed.contains(&(updating, token));
            if !allowed {
                log::error!(
                    "Blocking acquire of a {token} resource during a content update of a \
                     {updating} resource; allow this pair explicitly if it is intended."
                );
                debug_assert!(allowed, "nested blocking acquire during a content update");
            }
        }
        drop(st);

        match self.wait_for_load(key) {
            WaitOutcome::Loaded => {
                let st = lock(&shared.state);
                match st.slots.get(key) {
                    Some(slot) => {
                        let cell = slot.resource.clone();
                        (
                            Some(AcquireGuard::new(cell, AcquireResult::Final)),
                            AcquireResult::Final,
                        )
                    }
                    None => (None, AcquireResult::None),
                }
            }
            WaitOutcome::Missing => {
                let st = lock(&shared.state);
                self.acquire_missing(st, key, mode)
            }
            WaitOutcome::Aborted => (None, AcquireResult::None),
        }
    }

    /// Resolves an acquire against a resource that is `LoadedResourceMissing`.
    fn acquire_missing(
        &self,
        st: MutexGuard<'_, ManagerState>,
        key: ResourceKey,
        mode: AcquireMode,
    ) -> (Option<AcquireGuard>, AcquireResult) {
        let mut st = st;
        let Some(slot) = st.slots.get(key) else {
            return (None, AcquireResult::None);
        };
        let token = slot.type_token;
        let id = slot.id.clone();

        if let Some(fb) = st.types.get(&token).and_then(|row| row.missing_fallback) {
            if let Some(fb_slot) = st.slots.get_mut(fb) {
                let now = self.shared.clock.now();
                fb_slot.last_acquire = now;
                if fb_slot.state == ResourceState::Loaded {
                    let cell = fb_slot.resource.clone();
                    return (
                        Some(AcquireGuard::new(cell, AcquireResult::MissingFallback)),
                        AcquireResult::MissingFallback,
                    );
                }
                drop(st);
                if self.wait_for_load(fb) == WaitOutcome::Loaded {
                    let st = lock(&self.shared.state);
                    if let Some(fb_slot) = st.slots.get(fb) {
                        let cell = fb_slot.resource.clone();
                        return (
                            Some(AcquireGuard::new(cell, AcquireResult::MissingFallback)),
                            AcquireResult::MissingFallback,
                        );
                    }
                }
                log::error!("The missing-fallback for type {token} failed to load.");
                return (None, AcquireResult::None);
            }
        }

        if matches!(
            mode,
            AcquireMode::AllowLoadingFallbackNeverFail | AcquireMode::BlockTillLoadedNeverFail
        ) {
            return (None, AcquireResult::None);
        }

        drop(st);
        self.shared.resource_events.publish(ResourceEvent {
            kind: ResourceEventKind::MissingFallbackRequired,
            type_token: token,
            id: id.clone(),
            old_state: ResourceState::LoadedResourceMissing,
            new_state: ResourceState::LoadedResourceMissing,
        });
        {
            let callback = lock(&self.shared.critical_missing_cb);
            if let Some(callback) = callback.as_ref() {
                callback(token, &id);
            }
        }
        log::error!(
            "Resource '{id}' of type {token} is missing and no missing-fallback is registered."
        );
        debug_assert!(
            false,
            "missing resource without a missing-fallback: '{id}' ({token})"
        );
        (None, AcquireResult::None)
    }

    /// Hands out a loading fallback, loading it first if necessary.
    fn acquire_loading_fallback(
        &self,
        fb: ResourceKey,
        now: Duration,
    ) -> (Option<AcquireGuard>, AcquireResult) {
        {
            let mut st = lock(&self.shared.state);
            let Some(fb_slot) = st.slots.get_mut(fb) else {
                return (None, AcquireResult::None);
            };
            fb_slot.last_acquire = now;
            if fb_slot.state == ResourceState::Loaded {
                let cell = fb_slot.resource.clone();
                return (
                    Some(AcquireGuard::new(cell, AcquireResult::LoadingFallback)),
                    AcquireResult::LoadingFallback,
                );
            }
        }
        if self.wait_for_load(fb) == WaitOutcome::Loaded {
            let st = lock(&self.shared.state);
            if let Some(fb_slot) = st.slots.get(fb) {
                let cell = fb_slot.resource.clone();
                return (
                    Some(AcquireGuard::new(cell, AcquireResult::LoadingFallback)),
                    AcquireResult::LoadingFallback,
                );
            }
        }
        log::warn!("A loading fallback failed to load; acquire yields nothing.");
        (None, AcquireResult::None)
    }

    /// Waits until the load of `key` resolved. Pumps main-thread update
    /// tasks while waiting on the main thread, so main-thread-restricted
    /// content updates cannot deadlock a blocking acquire.
    fn wait_for_load(&self, key: ResourceKey) -> WaitOutcome {
        let shared = &self.shared;
        let on_main = shared.is_main_thread();
        let mut st = lock(&shared.state);
        loop {
            if shared.shutdown.load(Ordering::Relaxed) || st.shutting_down {
                return WaitOutcome::Aborted;
            }
            let Some(slot) = st.slots.get(key) else {
                return WaitOutcome::Aborted;
            };
            match slot.state {
                ResourceState::Loaded => return WaitOutcome::Loaded,
                ResourceState::LoadedResourceMissing => return WaitOutcome::Missing,
                ResourceState::Unloaded => {
                    if !slot.queued && !slot.in_flight {
                        enqueue_for_loading(shared, &mut st, key, true);
                    }
                }
            }
            if on_main {
                drop(st);
                if pump_main_thread_tasks(shared) == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                st = lock(&shared.state);
            } else {
                let (guard, _) = shared
                    .load_cond
                    .wait_timeout(st, Duration::from_millis(10))
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                st = guard;
            }
        }
    }

    // ---- per-frame tick -------------------------------------------------

    /// The per-frame tick. Call from the main thread.
    ///
    /// Processes deferred main-thread unloads, refreshes a stride of queued
    /// priorities and advances the queue order one sort pass, pumps
    /// main-thread content updates, and runs the automatic sweep when
    /// configured.
    pub fn update(&self) {
        debug_assert!(
            self.shared.is_main_thread(),
            "update() called off the main thread"
        );
        let shared = &self.shared;
        let now = shared.clock.now();
        let mut events = Vec::new();
        let deferred = {
            let mut st = lock(&shared.state);
            if st.force_no_fallback_frames > 0 {
                st.force_no_fallback_frames -= 1;
            }

            if st.exists_broadcast_pending {
                st.exists_broadcast_pending = false;
                for (_, slot) in st.slots.iter() {
                    events.push(ResourceEvent {
                        kind: ResourceEventKind::Exists,
                        type_token: slot.type_token,
                        id: slot.id.clone(),
                        old_state: slot.state,
                        new_state: slot.state,
                    });
                }
            }

            std::mem::take(&mut st.deferred_unloads)
        };

        for unload in deferred {
            if let Some(event) = self.unload_resident(unload.key) {
                events.push(event);
            }
            if unload.requeue {
                let mut st = lock(&shared.state);
                enqueue_for_loading(shared, &mut st, unload.key, false);
            }
        }

        {
            let mut st = lock(&shared.state);
            let ManagerState {
                queue,
                slots,
                types,
                ..
            } = &mut *st;
            let len = queue.entries.len();
            if len > 0 {
                let start = queue.refresh_cursor % len;
                let count = len.min(QUEUE_REFRESH_STRIDE);
                for i in 0..count {
                    let entry = &mut queue.entries[(start + i) % len];
                    if let Some(slot) = slots.get(entry.key) {
                        let priority = slot.priority.unwrap_or_else(|| {
                            types
                                .get(&slot.type_token)
                                .map(|row| row.default_priority)
                                .unwrap_or_default()
                        });
                        entry.priority_value =
                            priority.loading_priority(now.saturating_sub(slot.last_acquire));
                    }
                }
                queue.refresh_cursor = (start + count) % len;
                queue.sort_step();
            }
        }
        for event in events {
            shared.resource_events.publish(event);
        }

        pump_main_thread_tasks(shared);

        if let Some(budget) = self.config.auto_free_sweep_budget {
            self.free_unused_resources(Some(budget), self.config.auto_free_idle_threshold);
        }
    }

    // ---- unloading ------------------------------------------------------

    /// Frees resources that have no references and were not acquired for at
    /// least `idle_threshold`. Types that forbid incremental unloading are
    /// skipped; only [`ResourceManager::free_all_unused_resources`] frees
    /// them. Stops once `budget` is exceeded and resumes where it stopped
    /// on the next call. Returns the number freed.
    pub fn free_unused_resources(
        &self,
        budget: Option<Duration>,
        idle_threshold: Duration,
    ) -> usize {
        self.sweep_unused(budget, idle_threshold, true)
    }

    /// Frees unused resources until nothing more can be freed, regardless
    /// of per-type sweep opt-outs. Freeing one resource can release the
    /// last reference to another (fallbacks), so this loops to a fixpoint.
    /// Returns the total freed.
    pub fn free_all_unused_resources(&self) -> usize {
        let mut total = 0;
        loop {
            let freed = self.sweep_unused(None, Duration::ZERO, false);
            total += freed;
            if freed == 0 {
                return total;
            }
        }
    }

    /// One sweep over the registry. The state lock is taken per slot and
    /// released before the evicted resource's `unload_data` runs, so a
    /// thread holding a content guard can keep calling into the manager
    /// while a sweep is in progress. The budget is checked every iteration,
    /// whether or not the slot was evictable.
    fn sweep_unused(
        &self,
        budget: Option<Duration>,
        idle_threshold: Duration,
        respect_type_opt_out: bool,
    ) -> usize {
        let shared = &self.shared;
        let started = Instant::now();
        let now = shared.clock.now();
        let on_main = shared.is_main_thread();
        let mut freed = 0;

        let (keys, start) = {
            let mut st = lock(&shared.state);
            let keys: Vec<ResourceKey> = st.slots.keys().collect();
            if keys.is_empty() {
                st.sweep_resume = None;
                return 0;
            }
            let start = st
                .sweep_resume
                .and_then(|k| keys.iter().position(|&x| x == k))
                .unwrap_or(0);
            (keys, start)
        };

        for i in 0..keys.len() {
            let key = keys[(start + i) % keys.len()];

            let mut st = lock(&shared.state);
            let evictable = st.slots.get(key).is_some_and(|slot| {
                if slot.ref_count > 0 || slot.queued || slot.in_flight {
                    return false;
                }
                if now.saturating_sub(slot.last_acquire) < idle_threshold {
                    return false;
                }
                let row = st.types.get(&slot.type_token);
                if respect_type_opt_out && row.is_some_and(|row| !row.incremental_unload) {
                    return false;
                }
                let main_only =
                    row.is_some_and(|row| row.update_thread == UpdateThread::MainThread);
                !(main_only && !on_main)
            });
            let mut removed = None;
            if evictable {
                if let Some(slot) = st.slots.remove(key) {
                    st.registry.remove(&(slot.type_token, slot.id.hash()));
                    if let Some(fb) = slot.instance_loading_fallback {
                        st.release_slot(fb);
                    }
                    removed = Some(slot);
                }
            }
            drop(st);

            if let Some(slot) = removed {
                let old_state = slot.state;
                {
                    let mut content = lock(&slot.resource);
                    content.unload_data(Unload::AllQualityLevels);
                }
                log::debug!(
                    "Freed unused resource '{}' ({}).",
                    slot.display_name(),
                    slot.type_token
                );
                if old_state != ResourceState::Unloaded {
                    shared.resource_events.publish(ResourceEvent {
                        kind: ResourceEventKind::Unloaded,
                        type_token: slot.type_token,
                        id: slot.id.clone(),
                        old_state,
                        new_state: ResourceState::Unloaded,
                    });
                }
                shared.resource_events.publish(ResourceEvent {
                    kind: ResourceEventKind::Deleted,
                    type_token: slot.type_token,
                    id: slot.id,
                    old_state: ResourceState::Unloaded,
                    new_state: ResourceState::Unloaded,
                });
                freed += 1;
            }

            if let Some(budget) = budget {
                if started.elapsed() >= budget && i + 1 < keys.len() {
                    lock(&shared.state).sweep_resume =
                        Some(keys[(start + i + 1) % keys.len()]);
                    return freed;
                }
            }
        }
        lock(&shared.state).sweep_resume = None;
        freed
    }

    /// Discards the least important resident quality level of a loaded
    /// resource, if its type allows incremental unloading. Returns whether
    /// anything was discarded.
    pub fn unload_one_quality_level(&self, handle: &ResourceHandle) -> bool {
        let Some(key) = handle.key() else { return false };
        let (cell, old_state) = {
            let st = lock(&self.shared.state);
            let Some(slot) = st.slots.get(key) else {
                return false;
            };
            let allowed = st
                .types
                .get(&slot.type_token)
                .map_or(true, |row| row.incremental_unload);
            if !allowed
                || slot.state != ResourceState::Loaded
                || slot.quality_levels_discardable == 0
            {
                return false;
            }
            (slot.resource.clone(), slot.state)
        };

        // Content work runs without the state lock; the caller's handle
        // keeps the slot alive across the gap.
        let (desc, memory) = {
            let mut content = lock(&cell);
            let desc = content.unload_data(Unload::OneQualityLevel);
            (desc, content.update_memory_usage())
        };

        let mut st = lock(&self.shared.state);
        let event = st.slots.get_mut(key).map(|slot| {
            slot.state = desc.state;
            slot.quality_levels_discardable = desc.quality_levels_discardable;
            slot.quality_levels_loadable = desc.quality_levels_loadable;
            slot.memory = memory;
            ResourceEvent {
                kind: ResourceEventKind::Unloaded,
                type_token: slot.type_token,
                id: slot.id.clone(),
                old_state,
                new_state: desc.state,
            }
        });
        drop(st);
        if let Some(event) = event {
            if event.new_state == ResourceState::Unloaded {
                self.shared.resource_events.publish(event);
            }
        }
        true
    }

    // ---- reloading ------------------------------------------------------

    /// Unloads the resource so it reloads with fresh data. Without `force`,
    /// only acts when the loader reports the data outdated. Returns whether
    /// the resource was touched.
    pub fn reload_resource(&self, handle: &ResourceHandle, force: bool) -> bool {
        let Some(key) = handle.key() else { return false };
        self.reload_one(key, force)
    }

    /// Reloads all resources of one type. Returns how many were touched.
    pub fn reload_resources_of_type(&self, token: TypeToken, force: bool) -> usize {
        let keys: Vec<ResourceKey> = {
            let st = lock(&self.shared.state);
            st.slots
                .iter()
                .filter(|(_, slot)| slot.type_token == token)
                .map(|(key, _)| key)
                .collect()
        };
        keys.into_iter()
            .filter(|&key| self.reload_one(key, force))
            .count()
    }

    /// Reloads every registered resource. Returns how many were touched and
    /// broadcasts [`ResourceManagerEvent::ReloadAllResources`] if any were.
    pub fn reload_all_resources(&self, force: bool) -> usize {
        let keys: Vec<ResourceKey> = lock(&self.shared.state).slots.keys().collect();
        let count = keys
            .into_iter()
            .filter(|&key| self.reload_one(key, force))
            .count();
        if count > 0 {
            self.shared
                .manager_events
                .publish(ResourceManagerEvent::ReloadAllResources);
        }
        count
    }

    /// Decides under the state lock whether one resource reloads, then runs
    /// the actual content unload after releasing it.
    fn reload_one(&self, key: ResourceKey, force: bool) -> bool {
        let shared = &self.shared;
        let recently_used;
        {
            let mut st = lock(&shared.state);
            let Some(slot) = st.slots.get(key) else {
                return false;
            };
            if slot.in_flight {
                return false;
            }
            if slot.prevent_file_reload && slot.custom_loader.is_none() {
                return false;
            }
            if slot.state == ResourceState::Unloaded {
                // Nothing resident; a pending or future load gets fresh data
                // anyway.
                return false;
            }
            if !force {
                let Some(loader) = st.effective_loader(slot) else {
                    return false;
                };
                let request = ResourceRequest {
                    id: &slot.id,
                    type_token: slot.type_token,
                };
                if !loader.is_resource_outdated(&request, slot.loaded_modification_time) {
                    return false;
                }
                log::debug!(
                    "Resource '{}' is outdated and will be reloaded.",
                    slot.display_name()
                );
            }

            let now = shared.clock.now();
            recently_used = now.saturating_sub(slot.last_acquire) < RELOAD_REPRELOAD_WINDOW
                || slot.ref_count > 0;
            let main_only = st
                .types
                .get(&slot.type_token)
                .is_some_and(|row| row.update_thread == UpdateThread::MainThread);

            if main_only && !shared.is_main_thread() {
                st.deferred_unloads.push(DeferredUnload {
                    key,
                    requeue: recently_used,
                });
                return true;
            }
        }

        let event = self.unload_resident(key);
        if recently_used {
            let mut st = lock(&shared.state);
            enqueue_for_loading(shared, &mut st, key, false);
        }
        if let Some(event) = event {
            shared.resource_events.publish(event);
        }
        true
    }

    /// Unloads a slot's resident content and resets its bookkeeping to
    /// `Unloaded`. The content cell's `unload_data` runs between two state
    /// lock scopes, never under one. Returns the event to publish, if
    /// anything was resident.
    fn unload_resident(&self, key: ResourceKey) -> Option<ResourceEvent> {
        let (cell, old_state) = {
            let st = lock(&self.shared.state);
            let slot = st.slots.get(key)?;
            if slot.state == ResourceState::Unloaded {
                return None;
            }
            (slot.resource.clone(), slot.state)
        };
        {
            let mut content = lock(&cell);
            content.unload_data(Unload::AllQualityLevels);
        }
        let mut st = lock(&self.shared.state);
        let slot = st.slots.get_mut(key)?;
        slot.state = ResourceState::Unloaded;
        slot.memory = MemoryUsage::default();
        slot.quality_levels_discardable = 0;
        slot.quality_levels_loadable = 0;
        slot.loaded_modification_time = None;
        Some(ResourceEvent {
            kind: ResourceEventKind::Unloaded,
            type_token: slot.type_token,
            id: slot.id.clone(),
            old_state,
            new_state: ResourceState::Unloaded,
        })
    }

    /// Replaces the resource's loader with a custom one and reloads it
    /// through that loader. The resource stops following its file until
    /// restored.
    pub fn update_resource_with_custom_loader(
        &self,
        handle: &ResourceHandle,
        loader: Arc<dyn ResourceTypeLoader>,
    ) {
        let Some(key) = handle.key() else { return };
        let unloaded = {
            let mut st = lock(&self.shared.state);
            let Some(slot) = st.slots.get_mut(key) else {
                return;
            };
            slot.custom_loader = Some(loader);
            slot.prevent_file_reload = true;
            if slot.state == ResourceState::Unloaded {
                enqueue_for_loading(&self.shared, &mut st, key, false);
                true
            } else {
                false
            }
        };
        if !unloaded {
            self.reload_one(key, true);
        }
    }

    /// Drops a custom loader installed by
    /// [`ResourceManager::update_resource_with_custom_loader`] and reloads
    /// the resource from its original data.
    pub fn restore_resource(&self, handle: &ResourceHandle) {
        let Some(key) = handle.key() else { return };
        let reload = {
            let mut st = lock(&self.shared.state);
            let Some(slot) = st.slots.get_mut(key) else {
                return;
            };
            if slot.custom_loader.take().is_none() {
                return;
            }
            slot.prevent_file_reload = slot.is_created;
            if slot.is_created {
                false
            } else if slot.state == ResourceState::Unloaded {
                enqueue_for_loading(&self.shared, &mut st, key, false);
                false
            } else {
                true
            }
        };
        if reload {
            self.reload_one(key, true);
        }
    }

    // ---- per-resource tweaks and queries --------------------------------

    /// Overrides the priority class of one resource.
    pub fn set_priority(&self, handle: &ResourceHandle, priority: ResourcePriority) {
        let Some(key) = handle.key() else { return };
        let now = self.shared.clock.now();
        let mut st = lock(&self.shared.state);
        if let Some(slot) = st.slots.get_mut(key) {
            slot.priority = Some(priority);
            if slot.queued {
                let value = priority.loading_priority(now.saturating_sub(slot.last_acquire));
                st.queue.refresh_entry(key, value);
            }
        }
    }

    /// Attaches a human-readable description used in log output.
    pub fn set_resource_description(&self, handle: &ResourceHandle, description: &str) {
        let Some(key) = handle.key() else { return };
        let mut st = lock(&self.shared.state);
        if let Some(slot) = st.slots.get_mut(key) {
            slot.description = Some(description.to_string());
        }
    }

    /// For the next `frames` calls to [`ResourceManager::update`], loading
    /// fallbacks are bypassed and fallback-allowing acquires block instead.
    /// Lets a loading screen end with final content everywhere.
    pub fn force_no_fallback_acquisition(&self, frames: u32) {
        let mut st = lock(&self.shared.state);
        st.force_no_fallback_frames = st.force_no_fallback_frames.max(frames);
    }

    /// Re-announces every registered resource with an `Exists` event on the
    /// next [`ResourceManager::update`], for late subscribers.
    pub fn broadcast_exists_event(&self) {
        lock(&self.shared.state).exists_broadcast_pending = true;
    }

    /// The loading state of the referenced resource.
    pub fn resource_state(&self, handle: &ResourceHandle) -> Option<ResourceState> {
        let key = handle.key()?;
        let st = lock(&self.shared.state);
        st.slots.get(key).map(|slot| slot.state)
    }

    /// The current reference count of the referenced resource.
    pub fn resource_ref_count(&self, handle: &ResourceHandle) -> u32 {
        let Some(key) = handle.key() else { return 0 };
        let st = lock(&self.shared.state);
        st.slots.get(key).map_or(0, |slot| slot.ref_count)
    }

    /// The last reported memory usage of the referenced resource.
    pub fn resource_memory_usage(&self, handle: &ResourceHandle) -> Option<MemoryUsage> {
        let key = handle.key()?;
        let st = lock(&self.shared.state);
        st.slots.get(key).map(|slot| slot.memory)
    }

    /// How many content updates the referenced resource has seen. Bumped on
    /// every load and reload; lets dependent systems notice changes.
    pub fn resource_change_counter(&self, handle: &ResourceHandle) -> u32 {
        let Some(key) = handle.key() else { return 0 };
        let st = lock(&self.shared.state);
        st.slots.get(key).map_or(0, |slot| slot.change_counter)
    }

    /// Number of registered resources.
    pub fn resource_count(&self) -> usize {
        lock(&self.shared.state).slots.len()
    }

    // ---- events ---------------------------------------------------------

    /// Per-resource state-change events. Drain with `try_iter`.
    pub fn resource_events(&self) -> &flume::Receiver<ResourceEvent> {
        self.shared.resource_events.receiver()
    }

    /// Manager-wide events.
    pub fn manager_events(&self) -> &flume::Receiver<ResourceManagerEvent> {
        self.shared.manager_events.receiver()
    }

    // ---- shutdown -------------------------------------------------------

    /// Stops the pipeline, frees everything unreferenced and reports what
    /// is still alive. Handles stay safe to drop afterwards; all other
    /// operations become no-ops.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let shared = &self.shared;

        shared
            .manager_events
            .publish(ResourceManagerEvent::ManagerShuttingDown);
        shared.shutdown.store(true, Ordering::Relaxed);

        {
            let mut st = lock(&shared.state);
            st.shutting_down = true;
            st.queue.clear();
            let mut released = Vec::new();
            for slot in st.slots.values_mut() {
                slot.queued = false;
                if let Some(fb) = slot.instance_loading_fallback.take() {
                    released.push(fb);
                }
            }
            for row in st.types.values_mut() {
                if let Some(fb) = row.loading_fallback.take() {
                    released.push(fb);
                }
                if let Some(fb) = row.missing_fallback.take() {
                    released.push(fb);
                }
            }
            for fb in released {
                st.release_slot(fb);
            }
        }
        shared.load_cond.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        // Tasks the workers never consumed.
        while let Ok(task) = shared.update_any_rx.try_recv() {
            pipeline::abandon_update_task(shared, task);
        }
        while let Ok(task) = shared.main_rx.try_recv() {
            pipeline::abandon_update_task(shared, task);
        }

        self.free_all_unused_resources();

        let st = lock(&shared.state);
        if !st.slots.is_empty() {
            log::error!(
                "{} resources are still referenced at shutdown:",
                st.slots.len()
            );
            for slot in st.slots.values() {
                log::error!(
                    "  '{}' ({}), {} references",
                    slot.display_name(),
                    slot.type_token,
                    slot.ref_count
                );
            }
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queues a slot for loading if it has nothing resident and nothing
/// pending. `front` pushes past everything already queued.
fn enqueue_for_loading(shared: &Shared, st: &mut ManagerState, key: ResourceKey, front: bool) {
    if st.shutting_down {
        return;
    }
    let now = shared.clock.now();
    let Some(slot) = st.slots.get(key) else { return };
    if slot.queued {
        if front {
            st.queue.move_to_front(key);
        } else {
            let priority = st.effective_priority(slot);
            let value = priority.loading_priority(now.saturating_sub(slot.last_acquire));
            st.queue.refresh_entry(key, value);
        }
        return;
    }
    if slot.in_flight || slot.state != ResourceState::Unloaded {
        return;
    }
    if slot.is_created && slot.custom_loader.is_none() {
        return;
    }
    let priority = st.effective_priority(slot);
    let value = priority.loading_priority(now.saturating_sub(slot.last_acquire));
    if let Some(slot) = st.slots.get_mut(key) {
        slot.queued = true;
    }
    if front {
        st.queue.push_front(key, 0.0);
    } else {
        st.queue.push_back(key, value);
    }
    let _ = shared.load_signal_tx.send(());
}

/// Replaces a slot's per-instance loading fallback, adjusting the internal
/// reference counts of the old and new targets.
fn set_instance_fallback(st: &mut ManagerState, key: ResourceKey, fallback: Option<ResourceKey>) {
    let old = match st.slots.get_mut(key) {
        Some(slot) => {
            let old = slot.instance_loading_fallback.take();
            slot.instance_loading_fallback = fallback;
            old
        }
        None => return,
    };
    if let Some(old) = old {
        st.release_slot(old);
    }
    if let Some(new) = fallback {
        st.retain_slot(new);
    }
}
