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

//! The two-stage loading pipeline.
//!
//! Data-load workers pop the best queue entry, open the data stream through
//! the resolved loader and route an update task. Update-content workers run
//! the resource's own `update_content` and flip the bookkeeping state. Types
//! with a main-thread restriction route their update tasks to a queue the
//! main thread pumps during `update()` (and cooperatively while it blocks
//! on a load).
//!
//! Per resource the two stages are strictly ordered because the second task
//! only exists once the first produced it; there is no ordering between
//! different resources.

use std::cell::RefCell;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use strata_core::loader::{LoadData, ResourceRequest, ResourceTypeLoader};
use strata_core::resource::{ResourceId, ResourceState, TypeToken, UpdateThread};

use crate::config::ResourceManagerConfig;
use crate::state::{lock, ResourceKey, Shared};

/// How long idle workers sleep between shutdown-flag checks.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// A dequeued load on its way through the data-load stage.
struct LoadTask {
    key: ResourceKey,
    id: ResourceId,
    token: TypeToken,
    loader: Option<Arc<dyn ResourceTypeLoader>>,
    update_thread: UpdateThread,
}

/// A load that finished its data stage and awaits the content update.
pub(crate) struct UpdateTask {
    pub key: ResourceKey,
    pub id: ResourceId,
    pub token: TypeToken,
    pub loader: Option<Arc<dyn ResourceTypeLoader>>,
    /// `None` when the stream could not be opened; the resource must then
    /// report itself missing.
    pub data: Option<LoadData>,
}

thread_local! {
    static UPDATING: RefCell<Vec<TypeToken>> = const { RefCell::new(Vec::new()) };
}

/// The resource type whose `update_content` is running on this thread, if
/// any. Used to detect nested blocking acquires from inside an update.
pub(crate) fn updating_type_on_this_thread() -> Option<TypeToken> {
    UPDATING.with(|stack| stack.borrow().last().copied())
}

struct UpdateScope;

impl UpdateScope {
    fn enter(token: TypeToken) -> Self {
        UPDATING.with(|stack| stack.borrow_mut().push(token));
        Self
    }
}

impl Drop for UpdateScope {
    fn drop(&mut self) {
        UPDATING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Spawns the configured data-load and update-content workers.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    config: &ResourceManagerConfig,
    load_signal_rx: Receiver<()>,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();
    for i in 0..config.data_load_workers.max(1) {
        let shared = Arc::clone(shared);
        let signal = load_signal_rx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("strata-data-load-{i}"))
            .spawn(move || data_load_worker(&shared, &signal))
            .expect("failed to spawn data-load worker");
        workers.push(handle);
    }
    for i in 0..config.update_content_workers.max(1) {
        let shared = Arc::clone(shared);
        let tasks = shared.update_any_rx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("strata-update-{i}"))
            .spawn(move || update_content_worker(&shared, &tasks))
            .expect("failed to spawn update-content worker");
        workers.push(handle);
    }
    workers
}

fn data_load_worker(shared: &Shared, signal: &Receiver<()>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        while let Some(task) = next_load_task(shared) {
            run_data_load(shared, task);
            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }
        }
        match signal.recv_timeout(WORKER_IDLE_WAIT) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn update_content_worker(shared: &Shared, tasks: &Receiver<UpdateTask>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        match tasks.recv_timeout(WORKER_IDLE_WAIT) {
            Ok(task) => execute_update_task(shared, task),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Claims the front queue entry, marking it in flight. Returns `None` when
/// the queue has nothing runnable.
fn next_load_task(shared: &Shared) -> Option<LoadTask> {
    let mut st = lock(&shared.state);
    if st.shutting_down {
        return None;
    }
    while let Some(entry) = st.queue.pop_front() {
        let Some(slot) = st.slots.get(entry.key) else {
            continue;
        };
        if !slot.queued || slot.in_flight || slot.state != ResourceState::Unloaded {
            continue;
        }
        let loader = st.effective_loader(slot);
        let update_thread = st
            .types
            .get(&slot.type_token)
            .map_or(UpdateThread::AnyThread, |row| row.update_thread);
        let (id, token) = (slot.id.clone(), slot.type_token);

        if let Some(slot) = st.slots.get_mut(entry.key) {
            slot.queued = false;
            slot.in_flight = true;
        }
        st.loads_in_flight += 1;
        return Some(LoadTask {
            key: entry.key,
            id,
            token,
            loader,
            update_thread,
        });
    }
    None
}

/// Runs the data-load stage for one task and routes the content update.
fn run_data_load(shared: &Shared, task: LoadTask) {
    let request = ResourceRequest {
        id: &task.id,
        type_token: task.token,
    };
    let data = match &task.loader {
        Some(loader) => match loader.open_data_stream(&request) {
            Ok(data) => Some(data),
            Err(err) => {
                log::warn!("Failed to open data for resource '{}': {err}", task.id);
                None
            }
        },
        None => {
            log::warn!(
                "No loader registered for resource '{}' of type {}.",
                task.id,
                task.token
            );
            None
        }
    };

    let update = UpdateTask {
        key: task.key,
        id: task.id,
        token: task.token,
        loader: task.loader,
        data,
    };
    let tx = match task.update_thread {
        UpdateThread::MainThread => &shared.main_tx,
        UpdateThread::AnyThread => &shared.update_any_tx,
    };
    if let Err(err) = tx.send(update) {
        // Channel gone means shutdown; roll the bookkeeping back so sweeps
        // do not wait on a load that will never finish.
        abandon_update_task(shared, err.into_inner());
    }
}

/// Runs the update-content stage for one task: content update, stream
/// close, state flip, wakeup, event.
pub(crate) fn execute_update_task(shared: &Shared, mut task: UpdateTask) {
    let Some(cell) = ({
        let st = lock(&shared.state);
        st.slots.get(task.key).map(|slot| slot.resource.clone())
    }) else {
        abandon_update_task(shared, task);
        return;
    };

    let had_stream = task.data.is_some();
    let modification_time: Option<SystemTime> =
        task.data.as_ref().and_then(|data| data.modification_time);

    let (mut desc, memory) = {
        let mut content = lock(&cell);
        let _scope = UpdateScope::enter(task.token);
        let stream = task.data.as_mut().map(|data| &mut *data.stream as &mut dyn Read);
        let desc = content.update_content(stream);
        let memory = content.update_memory_usage();
        (desc, memory)
    };

    if !had_stream && desc.state == ResourceState::Loaded {
        log::warn!(
            "Resource '{}' reported Loaded without a data stream; treating it as missing.",
            task.id
        );
        desc.state = ResourceState::LoadedResourceMissing;
    }

    if let (Some(loader), Some(data)) = (&task.loader, task.data.take()) {
        let request = ResourceRequest {
            id: &task.id,
            type_token: task.token,
        };
        loader.close_data_stream(&request, data);
    }

    let mut st = lock(&shared.state);
    st.loads_in_flight = st.loads_in_flight.saturating_sub(1);
    let event = st.slots.get_mut(task.key).map(|slot| {
        let old_state = slot.state;
        slot.state = desc.state;
        slot.quality_levels_discardable = desc.quality_levels_discardable;
        slot.quality_levels_loadable = desc.quality_levels_loadable;
        slot.memory = memory;
        slot.change_counter = slot.change_counter.wrapping_add(1);
        slot.loaded_modification_time = modification_time;
        slot.in_flight = false;
        strata_core::event::ResourceEvent {
            kind: strata_core::event::ResourceEventKind::Loaded,
            type_token: slot.type_token,
            id: slot.id.clone(),
            old_state,
            new_state: slot.state,
        }
    });
    // Published before the lock drops so nobody can observe the new state
    // and emit a later event ahead of this one.
    if let Some(event) = event {
        shared.resource_events.publish(event);
    }
    drop(st);

    shared.load_cond.notify_all();
}

/// Rolls back the in-flight bookkeeping for a task that will never run.
pub(crate) fn abandon_update_task(shared: &Shared, task: UpdateTask) {
    if let (Some(loader), Some(data)) = (&task.loader, task.data) {
        let request = ResourceRequest {
            id: &task.id,
            type_token: task.token,
        };
        loader.close_data_stream(&request, data);
    }
    let mut st = lock(&shared.state);
    st.loads_in_flight = st.loads_in_flight.saturating_sub(1);
    if let Some(slot) = st.slots.get_mut(task.key) {
        slot.in_flight = false;
    }
    drop(st);
    shared.load_cond.notify_all();
}

/// Drains and executes all pending main-thread update tasks. Returns how
/// many ran.
pub(crate) fn pump_main_thread_tasks(shared: &Shared) -> usize {
    let mut executed = 0;
    while let Ok(task) = shared.main_rx.try_recv() {
        execute_update_task(shared, task);
        executed += 1;
    }
    executed
}
