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

//! The manager's shared state: the slot arena, the registry maps and the
//! loading queue, all behind one coarse mutex.
//!
//! The state lock and a resource's content-cell lock are never held at the
//! same time. Bookkeeping clones the content cell's `Arc` under the state
//! lock, releases it, runs the content operation, and re-locks the state to
//! record the outcome. A thread may therefore hold a content guard
//! indefinitely without stalling anyone else's manager calls.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::{Duration, SystemTime};

use ahash::{HashMap, HashSet};
use crossbeam_channel::{Receiver, Sender};
use slotmap::SlotMap;
use strata_core::event::{EventBus, ResourceEvent, ResourceManagerEvent};
use strata_core::loader::ResourceTypeLoader;
use strata_core::resource::{
    MemoryUsage, Resource, ResourceId, ResourcePriority, ResourceState, TypeToken, UpdateThread,
};
use strata_core::time::Clock;

use crate::pipeline::UpdateTask;

use std::sync::Arc;

slotmap::new_key_type! {
    /// Generation-checked key into the resource arena.
    pub(crate) struct ResourceKey;
}

/// Locks a mutex, shrugging off poisoning. A panic inside a resource's
/// `update_content` must not wedge the whole manager.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The content cell: the actual resource object, shared between the arena
/// slot and any acquire guards that outlive an eviction.
pub(crate) type ContentCell = Arc<Mutex<Box<dyn Resource>>>;

/// Per-resource bookkeeping. Everything here is guarded by the manager lock;
/// only the content behind `resource` has its own lock.
pub(crate) struct Slot {
    pub id: ResourceId,
    pub type_token: TypeToken,
    pub resource: ContentCell,
    pub state: ResourceState,
    /// Number of live handles. The invariant: exactly one increment per
    /// valid handle, plus one per internal fallback reference to this slot.
    pub ref_count: u32,
    /// Per-instance priority override; falls back to the type default.
    pub priority: Option<ResourcePriority>,
    pub last_acquire: Duration,
    pub queued: bool,
    pub in_flight: bool,
    pub memory: MemoryUsage,
    pub change_counter: u32,
    pub quality_levels_discardable: u8,
    pub quality_levels_loadable: u8,
    /// Content was provided by the caller, not loaded from data.
    pub is_created: bool,
    /// Reloads may only go through a custom loader, never the file path.
    pub prevent_file_reload: bool,
    pub custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
    /// Raw key plus a manual refcount on the target; storing a handle here
    /// would recurse into this very lock on drop.
    pub instance_loading_fallback: Option<ResourceKey>,
    pub loaded_modification_time: Option<SystemTime>,
    pub description: Option<String>,
}

impl Slot {
    /// The string the manager uses when talking about this resource in logs.
    pub fn display_name(&self) -> &str {
        match &self.description {
            Some(desc) if !desc.is_empty() => desc,
            _ => self.id.as_str(),
        }
    }
}

/// Everything the manager knows about one registered resource type.
pub(crate) struct TypeRow {
    pub create: Box<dyn Fn() -> Box<dyn Resource> + Send + Sync>,
    pub update_thread: UpdateThread,
    pub default_priority: ResourcePriority,
    pub incremental_unload: bool,
    pub loader: Option<Arc<dyn ResourceTypeLoader>>,
    pub loading_fallback: Option<ResourceKey>,
    pub missing_fallback: Option<ResourceKey>,
}

/// An active base-to-derived type redirection.
pub(crate) struct DerivedMapping {
    pub derived: TypeToken,
    pub decider: Box<dyn Fn(&ResourceId) -> bool + Send + Sync>,
}

/// An unload that must wait for the main thread.
pub(crate) struct DeferredUnload {
    pub key: ResourceKey,
    pub requeue: bool,
}

/// One pending load. `priority_value` is a cached snapshot; the strided
/// refresh in `update()` keeps it current enough for sorting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueEntry {
    pub key: ResourceKey,
    pub priority_value: f32,
}

/// The loading queue: a deque kept roughly sorted (best candidate at the
/// front) by one cheap sort pass per tick rather than a full sort.
#[derive(Default)]
pub(crate) struct LoadingQueue {
    pub entries: VecDeque<QueueEntry>,
    pub refresh_cursor: usize,
}

impl LoadingQueue {
    pub fn push_back(&mut self, key: ResourceKey, priority_value: f32) {
        self.entries.push_back(QueueEntry {
            key,
            priority_value,
        });
    }

    pub fn push_front(&mut self, key: ResourceKey, priority_value: f32) {
        self.entries.push_front(QueueEntry {
            key,
            priority_value,
        });
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, key: ResourceKey) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn move_to_front(&mut self, key: ResourceKey) {
        self.remove(key);
        self.push_front(key, 0.0);
    }

    /// Updates the cached priority of a queued entry. Returns false if the
    /// key is not queued.
    pub fn refresh_entry(&mut self, key: ResourceKey, priority_value: f32) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.priority_value = priority_value;
            true
        } else {
            false
        }
    }

    /// One backward bubble pass. Carries the current best entry all the way
    /// to the front; everything else advances at most one position per tick,
    /// which bounds the per-frame sorting cost regardless of queue length.
    pub fn sort_step(&mut self) {
        for i in (1..self.entries.len()).rev() {
            if self.entries[i].priority_value < self.entries[i - 1].priority_value {
                self.entries.swap(i, i - 1);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.refresh_cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All mutable manager state, guarded by [`Shared::state`].
pub(crate) struct ManagerState {
    pub slots: SlotMap<ResourceKey, Slot>,
    /// (type, id-hash) -> slot. At most one resource per pair; collisions on
    /// the 64-bit hash are detected by a full-string compare and logged.
    pub registry: HashMap<(TypeToken, u64), ResourceKey>,
    pub types: HashMap<TypeToken, TypeRow>,
    pub queue: LoadingQueue,
    /// Requested-id-hash -> redirected id.
    pub named: HashMap<u64, ResourceId>,
    pub derived: HashMap<TypeToken, DerivedMapping>,
    pub default_loader: Option<Arc<dyn ResourceTypeLoader>>,
    /// (type doing an update, type it may acquire while doing so).
    pub nested_acquire_allowed: HashSet<(TypeToken, TypeToken)>,
    pub unique_id_counter: u64,
    /// While > 0, loading-fallback acquisition behaves as block-till-loaded.
    pub force_no_fallback_frames: u32,
    pub exists_broadcast_pending: bool,
    pub deferred_unloads: Vec<DeferredUnload>,
    /// Dequeued loads whose content update has not completed yet.
    pub loads_in_flight: usize,
    /// Where the last interrupted sweep stopped; the next one resumes here.
    pub sweep_resume: Option<ResourceKey>,
    pub shutting_down: bool,
}

impl ManagerState {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            registry: HashMap::default(),
            types: HashMap::default(),
            queue: LoadingQueue::default(),
            named: HashMap::default(),
            derived: HashMap::default(),
            default_loader: None,
            nested_acquire_allowed: HashSet::default(),
            unique_id_counter: 0,
            force_no_fallback_frames: 0,
            exists_broadcast_pending: false,
            deferred_unloads: Vec::new(),
            loads_in_flight: 0,
            sweep_resume: None,
            shutting_down: false,
        }
    }

    /// The priority class in effect for a slot.
    pub fn effective_priority(&self, slot: &Slot) -> ResourcePriority {
        slot.priority.unwrap_or_else(|| {
            self.types
                .get(&slot.type_token)
                .map(|row| row.default_priority)
                .unwrap_or_default()
        })
    }

    /// The loader in effect for a slot: custom, then per-type, then default.
    pub fn effective_loader(&self, slot: &Slot) -> Option<Arc<dyn ResourceTypeLoader>> {
        slot.custom_loader
            .clone()
            .or_else(|| self.types.get(&slot.type_token).and_then(|r| r.loader.clone()))
            .or_else(|| self.default_loader.clone())
    }

    /// Adds one internal reference to a slot (fallback registrations).
    pub fn retain_slot(&mut self, key: ResourceKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.ref_count += 1;
        }
    }

    /// Drops one internal reference from a slot.
    pub fn release_slot(&mut self, key: ResourceKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            debug_assert!(slot.ref_count > 0, "refcount underflow");
            slot.ref_count = slot.ref_count.saturating_sub(1);
        }
    }
}

/// State shared between the manager, its handles and the worker threads.
pub(crate) struct Shared {
    pub state: Mutex<ManagerState>,
    /// Signaled on every pipeline state flip; blocking acquires wait here.
    pub load_cond: Condvar,
    pub clock: Arc<dyn Clock>,
    pub resource_events: EventBus<ResourceEvent>,
    pub manager_events: EventBus<ResourceManagerEvent>,
    /// Wakes data-load workers when the queue gains entries.
    pub load_signal_tx: Sender<()>,
    pub update_any_tx: Sender<UpdateTask>,
    pub update_any_rx: Receiver<UpdateTask>,
    pub main_tx: Sender<UpdateTask>,
    pub main_rx: Receiver<UpdateTask>,
    /// Outside the state lock so the callback can call back into the
    /// manager without deadlocking.
    pub critical_missing_cb: Mutex<Option<Box<dyn Fn(TypeToken, &ResourceId) + Send>>>,
    pub shutdown: AtomicBool,
    pub main_thread: ThreadId,
}

impl Shared {
    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }
}
