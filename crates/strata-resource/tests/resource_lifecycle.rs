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

//! End-to-end tests of the resource manager: loading, acquisition with
//! fallbacks, refcounts, sweeps and reloads, driven by an in-memory loader
//! and a manual clock.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use strata_core::event::ResourceEventKind;
use strata_core::loader::{
    read_stream_header, write_stream_header, LoadData, LoaderError, ResourceRequest,
    ResourceTypeLoader, StreamHeader,
};
use strata_core::resource::{
    MemoryUsage, Resource, ResourceLoadDesc, ResourceState, TypedResource, TypeToken, Unload,
    UpdateThread,
};
use strata_core::time::ManualClock;
use strata_resource::{
    AcquireMode, AcquireResult, ResourceManager, ResourceManagerConfig, ResourceTypeDescriptor,
};

// ---- fixtures -----------------------------------------------------------

/// A resource holding a piece of text.
#[derive(Default)]
struct Text {
    content: String,
}

impl Resource for Text {
    fn update_content(&mut self, stream: Option<&mut dyn Read>) -> ResourceLoadDesc {
        let Some(stream) = stream else {
            self.content.clear();
            return ResourceLoadDesc::simple(ResourceState::LoadedResourceMissing);
        };
        if read_stream_header(stream).is_err() {
            return ResourceLoadDesc::simple(ResourceState::LoadedResourceMissing);
        }
        self.content.clear();
        if stream.read_to_string(&mut self.content).is_err() {
            return ResourceLoadDesc::simple(ResourceState::LoadedResourceMissing);
        }
        ResourceLoadDesc::simple(ResourceState::Loaded)
    }

    fn unload_data(&mut self, _what: Unload) -> ResourceLoadDesc {
        self.content.clear();
        ResourceLoadDesc::simple(ResourceState::Unloaded)
    }

    fn update_memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            cpu_bytes: self.content.len() as u64,
            gpu_bytes: 0,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl TypedResource for Text {
    fn type_token() -> TypeToken {
        TypeToken::new("Text")
    }
}

impl Text {
    fn with_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }
}

/// Same shape as [`Text`] under a different type token, for derived-type
/// mapping tests.
#[derive(Default)]
struct FancyText {
    inner: Text,
}

impl Resource for FancyText {
    fn update_content(&mut self, stream: Option<&mut dyn Read>) -> ResourceLoadDesc {
        self.inner.update_content(stream)
    }
    fn unload_data(&mut self, what: Unload) -> ResourceLoadDesc {
        self.inner.unload_data(what)
    }
    fn update_memory_usage(&self) -> MemoryUsage {
        self.inner.update_memory_usage()
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl TypedResource for FancyText {
    fn type_token() -> TypeToken {
        TypeToken::new("FancyText")
    }
}

/// An in-memory loader with versioned entries, so outdated checks work
/// without touching the file system.
#[derive(Default)]
struct MemoryLoader {
    files: Mutex<HashMap<String, (Vec<u8>, u64)>>,
}

impl MemoryLoader {
    fn insert(&self, id: &str, content: &str) {
        let mut files = self.files.lock().unwrap();
        let version = files.get(id).map_or(1, |(_, v)| v + 1);
        files.insert(id.to_string(), (content.as_bytes().to_vec(), version));
    }

    fn version_time(version: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(version)
    }
}

impl ResourceTypeLoader for MemoryLoader {
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError> {
        let files = self.files.lock().unwrap();
        let (bytes, version) =
            files
                .get(request.id.as_str())
                .ok_or_else(|| LoaderError::NotFound {
                    id: request.id.as_str().to_string(),
                })?;
        let mut buffer = Vec::new();
        write_stream_header(
            &mut buffer,
            &StreamHeader {
                source_path: String::new(),
                content_hash: *version,
            },
        )?;
        buffer.extend_from_slice(bytes);
        Ok(LoadData {
            stream: Box::new(Cursor::new(buffer)),
            modification_time: Some(Self::version_time(*version)),
        })
    }

    fn is_resource_outdated(
        &self,
        request: &ResourceRequest<'_>,
        loaded_modification_time: Option<SystemTime>,
    ) -> bool {
        let files = self.files.lock().unwrap();
        match (files.get(request.id.as_str()), loaded_modification_time) {
            (Some((_, version)), Some(loaded)) => Self::version_time(*version) != loaded,
            _ => true,
        }
    }
}

/// A loader that always fails to open anything.
struct FailingLoader;

impl ResourceTypeLoader for FailingLoader {
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError> {
        Err(LoaderError::NotFound {
            id: request.id.as_str().to_string(),
        })
    }
}

/// Wraps another loader and holds every open until the gate is released.
struct GatedLoader {
    inner: MemoryLoader,
    gate: Arc<AtomicBool>,
}

impl ResourceTypeLoader for GatedLoader {
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError> {
        let started = Instant::now();
        while !self.gate.load(Ordering::Relaxed) && started.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.inner.open_data_stream(request)
    }
}

/// Records the order in which ids are opened and holds every open until the
/// gate is released.
struct RecordingLoader {
    inner: MemoryLoader,
    order: Mutex<Vec<String>>,
    gate: Arc<AtomicBool>,
}

impl ResourceTypeLoader for RecordingLoader {
    fn open_data_stream(&self, request: &ResourceRequest<'_>) -> Result<LoadData, LoaderError> {
        self.order
            .lock()
            .unwrap()
            .push(request.id.as_str().to_string());
        let started = Instant::now();
        while !self.gate.load(Ordering::Relaxed) && started.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.inner.open_data_stream(request)
    }
}

struct Fixture {
    manager: ResourceManager,
    clock: Arc<ManualClock>,
    loader: Arc<MemoryLoader>,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new());
    let manager = ResourceManager::with_clock(ResourceManagerConfig::default(), clock.clone());
    manager.register_resource_type(ResourceTypeDescriptor::new::<Text>());
    let loader = Arc::new(MemoryLoader::default());
    manager.set_default_resource_loader(loader.clone());
    Fixture {
        manager,
        clock,
        loader,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn acquired_text(manager: &ResourceManager, handle: &strata_resource::ResourceHandle) -> String {
    let (guard, result) = manager.begin_acquire(handle, AcquireMode::BlockTillLoaded, None);
    assert_eq!(result, AcquireResult::Final);
    let guard = guard.expect("final acquire must produce a guard");
    let content = guard.lock();
    content.get::<Text>().expect("Text resource").content.clone()
}

// ---- scenario: basic load ----------------------------------------------

#[test]
fn loads_a_resource_and_serves_its_content() {
    let fx = fixture();
    fx.loader.insert("greeting.txt", "hello");

    let handle = fx.manager.load::<Text>("greeting.txt");
    assert!(handle.is_valid());
    assert_eq!(acquired_text(&fx.manager, &handle), "hello");
    assert_eq!(
        fx.manager.resource_state(&handle),
        Some(ResourceState::Loaded)
    );

    let usage = fx.manager.resource_memory_usage(&handle).unwrap();
    assert_eq!(usage.cpu_bytes, 5);
    assert_eq!(fx.manager.resource_change_counter(&handle), 1);
}

#[test]
fn loading_eventually_settles_without_blocking() {
    let fx = fixture();
    fx.loader.insert("bg.txt", "background");

    let handle = fx.manager.load::<Text>("bg.txt");
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        !fx.manager.is_any_loading_in_progress()
    }));
}

// ---- refcounts (handles are the count) ----------------------------------

#[test]
fn refcount_tracks_live_handles_exactly() {
    let fx = fixture();
    fx.loader.insert("counted.txt", "x");

    let a = fx.manager.load::<Text>("counted.txt");
    assert_eq!(fx.manager.resource_ref_count(&a), 1);

    let b = a.clone();
    assert_eq!(fx.manager.resource_ref_count(&a), 2);

    // a move is not a new reference
    let c = b;
    assert_eq!(fx.manager.resource_ref_count(&a), 2);

    drop(c);
    assert_eq!(fx.manager.resource_ref_count(&a), 1);

    let mut d = a.clone();
    d.invalidate();
    d.invalidate();
    assert!(!d.is_valid());
    assert_eq!(fx.manager.resource_ref_count(&a), 1);
}

#[test]
fn same_type_and_id_share_one_resource() {
    let fx = fixture();
    fx.loader.insert("shared.txt", "x");

    let a = fx.manager.load::<Text>("shared.txt");
    let b = fx.manager.load::<Text>("shared.txt");
    assert_eq!(a, b);
    assert_eq!(fx.manager.resource_ref_count(&a), 2);
    assert_eq!(fx.manager.resource_count(), 1);
}

#[test]
fn concurrent_requests_for_one_id_share_a_single_slot() {
    let fx = fixture();
    fx.loader.insert("popular.txt", "p");

    let handles: Vec<_> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..8)
            .map(|_| s.spawn(|| fx.manager.load::<Text>("popular.txt")))
            .collect();
        threads
            .into_iter()
            .map(|t| t.join().expect("load thread panicked"))
            .collect()
    });

    assert_eq!(fx.manager.resource_count(), 1);
    assert_eq!(fx.manager.resource_ref_count(&handles[0]), 8);
    assert!(handles.iter().all(|h| *h == handles[0]));

    let created = fx
        .manager
        .resource_events()
        .try_iter()
        .filter(|e| e.kind == ResourceEventKind::Created)
        .count();
    assert_eq!(created, 1);
}

// ---- scenario: loading fallback -----------------------------------------

#[test]
fn loading_fallback_stands_in_until_the_real_content_arrives() {
    let fx = fixture();

    let fallback = fx.manager.create("builtin/placeholder", Text::with_content("placeholder"));
    fx.manager
        .set_resource_type_loading_fallback(Text::type_token(), Some(fallback.untyped()));

    let gate = Arc::new(AtomicBool::new(false));
    let gated = GatedLoader {
        inner: MemoryLoader::default(),
        gate: gate.clone(),
    };
    gated.inner.insert("slow.txt", "finally");
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(gated)));

    let handle = fx.manager.load::<Text>("slow.txt");
    let (guard, result) =
        fx.manager
            .begin_acquire(&handle, AcquireMode::AllowLoadingFallback, None);
    assert_eq!(result, AcquireResult::LoadingFallback);
    let guard = guard.unwrap();
    assert_eq!(guard.lock().get::<Text>().unwrap().content, "placeholder");
    drop(guard);

    gate.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "finally");
}

#[test]
fn call_site_fallback_is_used_when_nothing_else_is_registered() {
    let fx = fixture();

    let fallback = fx.manager.create("builtin/site", Text::with_content("site"));

    let gate = Arc::new(AtomicBool::new(false));
    let gated = GatedLoader {
        inner: MemoryLoader::default(),
        gate: gate.clone(),
    };
    gated.inner.insert("slow2.txt", "done");
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(gated)));

    let handle = fx.manager.load::<Text>("slow2.txt");
    let (guard, result) = fx.manager.begin_acquire(
        &handle,
        AcquireMode::AllowLoadingFallback,
        Some(fallback.untyped()),
    );
    assert_eq!(result, AcquireResult::LoadingFallback);
    assert_eq!(
        guard.unwrap().lock().get::<Text>().unwrap().content,
        "site"
    );

    gate.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
    }));
}

// ---- scenario: missing resources ----------------------------------------

#[test]
fn missing_resource_without_fallback_yields_nothing_in_never_fail_mode() {
    let fx = fixture();
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(FailingLoader)));

    let handle = fx.manager.load::<Text>("absent.txt");
    let (guard, result) =
        fx.manager
            .begin_acquire(&handle, AcquireMode::BlockTillLoadedNeverFail, None);
    assert!(guard.is_none());
    assert_eq!(result, AcquireResult::None);
    assert_eq!(
        fx.manager.resource_state(&handle),
        Some(ResourceState::LoadedResourceMissing)
    );
}

#[test]
fn missing_resource_with_fallback_serves_the_fallback() {
    let fx = fixture();
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(FailingLoader)));

    let fallback = fx.manager.create("builtin/missing", Text::with_content("missing!"));
    fx.manager
        .set_resource_type_missing_fallback(Text::type_token(), Some(fallback.untyped()));

    let handle = fx.manager.load::<Text>("absent2.txt");
    let (guard, result) =
        fx.manager
            .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None);
    assert_eq!(result, AcquireResult::MissingFallback);
    assert_eq!(
        guard.unwrap().lock().get::<Text>().unwrap().content,
        "missing!"
    );
}

#[test]
fn open_failure_never_reports_loaded() {
    let fx = fixture();
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(FailingLoader)));

    let handle = fx.manager.load::<Text>("broken.txt");
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::LoadedResourceMissing)
    }));
    assert_ne!(
        fx.manager.resource_state(&handle),
        Some(ResourceState::Loaded)
    );
}

// ---- pointer-only and force-load ----------------------------------------

#[test]
fn pointer_only_returns_content_without_waiting() {
    let fx = fixture();
    fx.loader.insert("lazy.txt", "later");

    let handle = fx.manager.load::<Text>("lazy.txt");
    let (guard, result) = fx.manager.begin_acquire(&handle, AcquireMode::PointerOnly, None);
    assert_eq!(result, AcquireResult::Final);
    assert!(guard.is_some());
}

#[test]
fn force_load_resource_now_completes_the_load() {
    let fx = fixture();
    fx.loader.insert("urgent.txt", "now");

    let handle = fx.manager.load::<Text>("urgent.txt");
    fx.manager.force_load_resource_now(&handle);
    assert_eq!(
        fx.manager.resource_state(&handle),
        Some(ResourceState::Loaded)
    );
}

// ---- main-thread-restricted content updates ------------------------------

#[test]
fn main_thread_restricted_types_load_through_the_cooperative_pump() {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new());
    let manager = ResourceManager::with_clock(ResourceManagerConfig::default(), clock);
    manager.register_resource_type(
        ResourceTypeDescriptor::new::<Text>().update_thread(UpdateThread::MainThread),
    );
    let loader = Arc::new(MemoryLoader::default());
    loader.insert("gpu.txt", "device data");
    manager.set_default_resource_loader(loader);

    // The blocking acquire runs on the manager's main thread; the content
    // update can only run there too. The wait loop must pump it itself.
    let handle = manager.load::<Text>("gpu.txt");
    assert_eq!(acquired_text(&manager, &handle), "device data");
}

// ---- scenario: auto-unload sweep ----------------------------------------

#[test]
fn sweep_frees_only_idle_unreferenced_resources() {
    let fx = fixture();
    fx.loader.insert("old.txt", "old");
    fx.loader.insert("fresh.txt", "fresh");

    let old = fx.manager.load::<Text>("old.txt");
    let fresh = fx.manager.load::<Text>("fresh.txt");
    fx.manager.force_load_resource_now(&old);
    fx.manager.force_load_resource_now(&fresh);

    drop(old);
    fx.clock.advance(Duration::from_secs(120));
    // touch "fresh" so only "old" is idle; keep its handle alive too
    let _ = acquired_text(&fx.manager, &fresh);

    let freed = fx
        .manager
        .free_unused_resources(None, Duration::from_secs(60));
    assert_eq!(freed, 1);
    assert_eq!(fx.manager.resource_count(), 1);
    assert_eq!(
        fx.manager.resource_state(&fresh),
        Some(ResourceState::Loaded)
    );

    let kinds: Vec<ResourceEventKind> = fx
        .manager
        .resource_events()
        .try_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&ResourceEventKind::Unloaded));
    assert!(kinds.contains(&ResourceEventKind::Deleted));
}

#[test]
fn evicted_resource_comes_back_as_a_fresh_instance() {
    let fx = fixture();
    fx.loader.insert("phoenix.txt", "v1");

    let handle = fx.manager.load::<Text>("phoenix.txt");
    fx.manager.force_load_resource_now(&handle);
    assert_eq!(fx.manager.resource_change_counter(&handle), 1);
    drop(handle);

    fx.clock.advance(Duration::from_secs(120));
    assert_eq!(fx.manager.free_all_unused_resources(), 1);

    let reborn = fx.manager.load::<Text>("phoenix.txt");
    assert_eq!(fx.manager.resource_change_counter(&reborn), 0);
    assert_eq!(acquired_text(&fx.manager, &reborn), "v1");
}

#[test]
fn registered_fallbacks_survive_the_sweep() {
    let fx = fixture();

    let fallback = fx.manager.create("builtin/kept", Text::with_content("kept"));
    fx.manager
        .set_resource_type_loading_fallback(Text::type_token(), Some(fallback.untyped()));
    drop(fallback);

    fx.clock.advance(Duration::from_secs(3600));
    assert_eq!(fx.manager.free_all_unused_resources(), 0);
    assert_eq!(fx.manager.resource_count(), 1);

    // clearing the registration releases the manager's reference
    fx.manager
        .set_resource_type_loading_fallback(Text::type_token(), None);
    assert_eq!(fx.manager.free_all_unused_resources(), 1);
}

#[test]
fn types_forbidding_incremental_unload_are_skipped_by_the_timed_sweep() {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new());
    let manager = ResourceManager::with_clock(ResourceManagerConfig::default(), clock.clone());
    manager.register_resource_type(ResourceTypeDescriptor::new::<Text>().incremental_unload(false));
    let loader = Arc::new(MemoryLoader::default());
    loader.insert("atlas.txt", "pixels");
    manager.set_default_resource_loader(loader);

    let handle = manager.load::<Text>("atlas.txt");
    manager.force_load_resource_now(&handle);
    drop(handle);
    clock.advance(Duration::from_secs(3600));

    // The timed sweep leaves the type alone no matter how idle it is.
    assert_eq!(
        manager.free_unused_resources(None, Duration::from_secs(60)),
        0
    );
    assert_eq!(manager.resource_count(), 1);

    // The explicit free-everything pass still reclaims it.
    assert_eq!(manager.free_all_unused_resources(), 1);
    assert_eq!(manager.resource_count(), 0);
}

#[test]
fn queued_resources_are_not_swept() {
    let fx = fixture();

    let gate = Arc::new(AtomicBool::new(false));
    let gated = GatedLoader {
        inner: MemoryLoader::default(),
        gate: gate.clone(),
    };
    gated.inner.insert("pending.txt", "p");
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(gated)));

    let handle = fx.manager.load::<Text>("pending.txt");
    drop(handle);

    // Queued or in flight, without handles: must still load, not vanish.
    fx.clock.advance(Duration::from_secs(3600));
    fx.manager.free_unused_resources(None, Duration::ZERO);
    assert_eq!(fx.manager.resource_count(), 1);

    gate.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        !fx.manager.is_any_loading_in_progress()
    }));
    // Once settled it is sweepable.
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.free_unused_resources(None, Duration::ZERO) == 1
    }));
}

// ---- scenario: reload ----------------------------------------------------

#[test]
fn forced_reload_picks_up_new_content() {
    let fx = fixture();
    fx.loader.insert("live.txt", "v1");

    let handle = fx.manager.load::<Text>("live.txt");
    assert_eq!(acquired_text(&fx.manager, &handle), "v1");

    fx.loader.insert("live.txt", "v2");
    assert!(fx.manager.reload_resource(&handle, true));

    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_change_counter(&handle) >= 2
            && fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "v2");
}

#[test]
fn unforced_reload_only_acts_on_outdated_data() {
    let fx = fixture();
    fx.loader.insert("stable.txt", "same");

    let handle = fx.manager.load::<Text>("stable.txt");
    fx.manager.force_load_resource_now(&handle);

    assert!(!fx.manager.reload_resource(&handle, false));

    fx.loader.insert("stable.txt", "changed");
    assert!(fx.manager.reload_resource(&handle, false));
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
            && fx.manager.resource_change_counter(&handle) >= 2
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "changed");
}

#[test]
fn reload_all_reports_and_broadcasts() {
    let fx = fixture();
    fx.loader.insert("a.txt", "a1");
    fx.loader.insert("b.txt", "b1");

    let a = fx.manager.load::<Text>("a.txt");
    let b = fx.manager.load::<Text>("b.txt");
    fx.manager.force_load_resource_now(&a);
    fx.manager.force_load_resource_now(&b);

    assert_eq!(fx.manager.reload_all_resources(true), 2);
    let manager_events: Vec<_> = fx.manager.manager_events().try_iter().collect();
    assert!(manager_events
        .contains(&strata_core::event::ResourceManagerEvent::ReloadAllResources));
}

#[test]
fn in_flight_resources_are_skipped_by_reload() {
    let fx = fixture();

    let gate = Arc::new(AtomicBool::new(false));
    let gated = GatedLoader {
        inner: MemoryLoader::default(),
        gate: gate.clone(),
    };
    gated.inner.insert("busy.txt", "b");
    fx.manager
        .set_resource_type_loader(Text::type_token(), Some(Arc::new(gated)));

    let handle = fx.manager.load::<Text>("busy.txt");
    // give a worker time to dequeue and block inside the loader
    std::thread::sleep(Duration::from_millis(50));
    assert!(!fx.manager.reload_resource(&handle, true));

    gate.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
    }));
}

#[test]
fn state_queries_stay_live_while_a_reload_waits_on_held_content() {
    let fx = fixture();
    fx.loader.insert("contended.txt", "v1");

    let handle = fx.manager.load::<Text>("contended.txt");
    assert_eq!(acquired_text(&fx.manager, &handle), "v1");
    fx.loader.insert("contended.txt", "v2");

    let (guard, result) = fx
        .manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None);
    assert_eq!(result, AcquireResult::Final);
    let guard = guard.unwrap();
    let content = guard.lock();

    // The reload cannot unload content someone holds a guard on; it must
    // wait without taking the manager's state hostage.
    std::thread::scope(|s| {
        let reload = s.spawn(|| fx.manager.reload_resource(&handle, true));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            fx.manager.resource_state(&handle),
            Some(ResourceState::Loaded)
        );
        assert_eq!(fx.manager.resource_ref_count(&handle), 1);
        drop(content);
        assert!(reload.join().expect("reload thread panicked"));
    });

    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
            && fx.manager.resource_change_counter(&handle) >= 2
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "v2");
}

// ---- custom loaders ------------------------------------------------------

#[test]
fn custom_loader_overrides_and_restore_returns_to_the_file() {
    let fx = fixture();
    fx.loader.insert("doc.txt", "from file");

    let handle = fx.manager.load::<Text>("doc.txt");
    assert_eq!(acquired_text(&fx.manager, &handle), "from file");

    let patch = Arc::new(MemoryLoader::default());
    patch.insert("doc.txt", "patched");
    fx.manager
        .update_resource_with_custom_loader(&handle, patch);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
            && fx.manager.resource_change_counter(&handle) >= 2
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "patched");

    fx.manager.restore_resource(&handle);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.manager.resource_state(&handle) == Some(ResourceState::Loaded)
            && fx.manager.resource_change_counter(&handle) >= 3
    }));
    assert_eq!(acquired_text(&fx.manager, &handle), "from file");
}

// ---- created resources ---------------------------------------------------

#[test]
fn created_resources_are_loaded_immediately_and_never_queued() {
    let fx = fixture();

    let handle = fx.manager.create("generated/banner", Text::with_content("made up"));
    assert_eq!(
        fx.manager.resource_state(&handle),
        Some(ResourceState::Loaded)
    );
    assert!(!fx.manager.is_any_loading_in_progress());
    assert_eq!(acquired_text(&fx.manager, &handle), "made up");

    // a file reload must not touch caller-provided content
    assert!(!fx.manager.reload_resource(&handle, true));
}

#[test]
fn get_existing_resource_never_creates() {
    let fx = fixture();
    fx.loader.insert("known.txt", "k");

    assert!(fx
        .manager
        .get_existing_resource(Text::type_token(), "known.txt")
        .is_none());

    let handle = fx.manager.load::<Text>("known.txt");
    let again = fx
        .manager
        .get_existing_resource(Text::type_token(), "known.txt")
        .expect("registered resource must be found");
    assert_eq!(again, *handle);
    assert_eq!(fx.manager.resource_ref_count(&handle), 2);
}

// ---- redirection and ids -------------------------------------------------

#[test]
fn named_resources_redirect_during_lookup() {
    let fx = fixture();
    fx.loader.insert("texts/hero_name.txt", "Arden");

    fx.manager
        .register_named_resource("HeroName", "texts/hero_name.txt");
    let handle = fx.manager.load::<Text>("HeroName");
    assert_eq!(
        handle.resource_id().unwrap().as_str(),
        "texts/hero_name.txt"
    );
    assert_eq!(acquired_text(&fx.manager, &handle), "Arden");

    // the direct id resolves to the same resource
    let direct = fx.manager.load::<Text>("texts/hero_name.txt");
    assert_eq!(direct, handle);
}

#[test]
fn unique_ids_never_repeat() {
    let fx = fixture();
    let a = fx.manager.generate_unique_resource_id("gen");
    let b = fx.manager.generate_unique_resource_id("gen");
    assert_ne!(a, b);
    assert!(a.as_str().starts_with("gen-"));
}

#[test]
fn derived_type_mapping_redirects_matching_ids() {
    let fx = fixture();
    fx.manager
        .register_resource_type(ResourceTypeDescriptor::new::<FancyText>());
    fx.loader.insert("plain.txt", "plain");
    fx.loader.insert("shiny.fancy", "shiny");
    fx.manager.register_derived_type(
        Text::type_token(),
        FancyText::type_token(),
        |id| id.as_str().ends_with(".fancy"),
    );

    let plain = fx.manager.load_resource(Text::type_token(), "plain.txt");
    assert_eq!(plain.type_token(), Text::type_token());

    let fancy = fx.manager.load_resource(Text::type_token(), "shiny.fancy");
    assert_eq!(fancy.type_token(), FancyText::type_token());
}

#[test]
fn typed_load_follows_derived_redirection() {
    let fx = fixture();
    fx.manager
        .register_resource_type(ResourceTypeDescriptor::new::<FancyText>());
    fx.loader.insert("gilded.fancy", "gilded");
    fx.manager.register_derived_type(
        Text::type_token(),
        FancyText::type_token(),
        |id| id.as_str().ends_with(".fancy"),
    );

    // A typed load of a redirected id yields the derived type, and the
    // typed handle keeps working against it.
    let handle = fx.manager.load::<Text>("gilded.fancy");
    assert_eq!(handle.type_token(), FancyText::type_token());

    let (guard, result) = fx
        .manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None);
    assert_eq!(result, AcquireResult::Final);
    let guard = guard.unwrap();
    let content = guard.lock();
    assert!(content.get::<Text>().is_none());
    assert_eq!(content.get::<FancyText>().unwrap().inner.content, "gilded");
}

// ---- queue ordering ------------------------------------------------------

#[test]
fn recently_acquired_resources_load_before_long_idle_ones() {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new());
    let config = ResourceManagerConfig {
        data_load_workers: 1,
        ..ResourceManagerConfig::default()
    };
    let manager = ResourceManager::with_clock(config, clock.clone());
    manager.register_resource_type(ResourceTypeDescriptor::new::<Text>());
    let gate = Arc::new(AtomicBool::new(false));
    let loader = Arc::new(RecordingLoader {
        inner: MemoryLoader::default(),
        order: Mutex::new(Vec::new()),
        gate: gate.clone(),
    });
    loader.inner.insert("first.txt", "f");
    loader.inner.insert("idle.txt", "i");
    loader.inner.insert("recent.txt", "r");
    manager.set_default_resource_loader(loader.clone());

    // The only data worker blocks inside the gate on "first.txt"; everything
    // requested afterwards piles up in the queue.
    let _first = manager.load::<Text>("first.txt");
    assert!(wait_until(Duration::from_secs(5), || {
        loader.order.lock().unwrap().first().map(String::as_str) == Some("first.txt")
    }));

    let _idle = manager.load::<Text>("idle.txt");
    clock.advance(Duration::from_secs(100));
    let _recent = manager.load::<Text>("recent.txt");

    // Ticks refresh queued priorities against the advanced clock; the long
    // wait since "idle" was requested pushes it behind "recent".
    manager.update();
    manager.update();

    gate.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        !manager.is_any_loading_in_progress()
    }));
    assert_eq!(
        *loader.order.lock().unwrap(),
        ["first.txt", "recent.txt", "idle.txt"]
    );
}

// ---- events --------------------------------------------------------------

#[test]
fn lifecycle_events_arrive_in_order_for_one_resource() {
    let fx = fixture();
    fx.loader.insert("observed.txt", "o");

    let handle = fx.manager.load::<Text>("observed.txt");
    fx.manager.force_load_resource_now(&handle);
    drop(handle);
    fx.clock.advance(Duration::from_secs(120));
    fx.manager.free_all_unused_resources();

    let kinds: Vec<ResourceEventKind> = fx
        .manager
        .resource_events()
        .try_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ResourceEventKind::Created,
            ResourceEventKind::Loaded,
            ResourceEventKind::Unloaded,
            ResourceEventKind::Deleted,
        ]
    );
}

#[test]
fn exists_broadcast_reannounces_everything_on_the_next_tick() {
    let fx = fixture();
    fx.loader.insert("one.txt", "1");
    fx.loader.insert("two.txt", "2");

    let _one = fx.manager.load::<Text>("one.txt");
    let _two = fx.manager.load::<Text>("two.txt");
    fx.manager.resource_events().try_iter().for_each(drop);

    fx.manager.broadcast_exists_event();
    fx.manager.update();

    let exists = fx
        .manager
        .resource_events()
        .try_iter()
        .filter(|e| e.kind == ResourceEventKind::Exists)
        .count();
    assert_eq!(exists, 2);
}

// ---- force-no-fallback window -------------------------------------------

#[test]
fn force_no_fallback_blocks_instead_of_serving_the_fallback() {
    let fx = fixture();
    fx.loader.insert("final_only.txt", "final");

    let fallback = fx.manager.create("builtin/skip", Text::with_content("skip me"));
    fx.manager
        .set_resource_type_loading_fallback(Text::type_token(), Some(fallback.untyped()));

    fx.manager.force_no_fallback_acquisition(2);
    let handle = fx.manager.load::<Text>("final_only.txt");
    let (guard, result) =
        fx.manager
            .begin_acquire(&handle, AcquireMode::AllowLoadingFallback, None);
    assert_eq!(result, AcquireResult::Final);
    assert_eq!(
        guard.unwrap().lock().get::<Text>().unwrap().content,
        "final"
    );
}

// ---- shutdown ------------------------------------------------------------

#[test]
fn shutdown_announces_clears_and_leaves_handles_safe() {
    let fx = fixture();
    fx.loader.insert("held.txt", "h");

    let held = fx.manager.load::<Text>("held.txt");
    fx.manager.force_load_resource_now(&held);

    let mut manager = fx.manager;
    manager.shutdown();

    let manager_events: Vec<_> = manager.manager_events().try_iter().collect();
    assert!(manager_events
        .contains(&strata_core::event::ResourceManagerEvent::ManagerShuttingDown));

    // still-referenced resources survive shutdown; dropping the handle
    // afterwards must be safe
    assert_eq!(manager.resource_count(), 1);
    drop(held);
    drop(manager);
}

#[test]
fn shutdown_frees_everything_unreferenced() {
    let fx = fixture();
    fx.loader.insert("temp.txt", "t");

    let handle = fx.manager.load::<Text>("temp.txt");
    fx.manager.force_load_resource_now(&handle);
    drop(handle);

    let mut manager = fx.manager;
    manager.shutdown();
    assert_eq!(manager.resource_count(), 0);
}
