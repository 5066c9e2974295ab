use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use crate::config::SurfaceConfig;
use crate::host::{HostGuard, TileBuffer, TileStore};
use crate::request::TileRequest;
use crate::surface::{Surface, TiledSurface, TILE_SAMPLES};

/// Tile-surface backend that delegates storage to a host object.
///
/// The engine addresses this through the embedded [`TiledSurface`] base
/// (first field, `#[repr(C)]`). The host object is borrowed for `'h` and
/// never retained beyond it; the borrow is the whole ownership story, the
/// caller keeps the host alive.
///
/// Host-call failures never propagate to the engine: a failed fetch leaves
/// the request without a buffer ("tile unavailable this round") and a failed
/// commit is logged and dropped.
#[repr(C)]
pub struct ProxySurface<'h> {
    base: TiledSurface,
    host: &'h dyn TileStore,
}

impl<'h> ProxySurface<'h> {
    pub fn new(host: &'h dyn TileStore) -> Box<Self> {
        Self::with_config(host, SurfaceConfig::default())
    }

    pub fn with_config(host: &'h dyn TileStore, config: SurfaceConfig) -> Box<Self> {
        let mut base = TiledSurface::init(Self::tile_request_start, Self::tile_request_end);
        base.threadsafe_tile_requests = config.threadsafe_tile_requests;
        base.worker_limit = config.worker_threads.unwrap_or(0);
        Box::new(Self { base, host })
    }

    /// Engine-facing base pointer, valid while the box stays put.
    pub fn base_mut(&mut self) -> *mut TiledSurface {
        &mut self.base
    }

    /// Hand the surface to an engine that drives destruction through the
    /// vtable `destroy` slot. The returned pointer owns the surface.
    pub fn into_engine(mut self: Box<Self>) -> *mut TiledSurface {
        self.base.parent.destroy = Some(Self::destroy);
        Box::into_raw(self) as *mut TiledSurface
    }

    /// Forward a batch to the engine's bulk routine, suspending the host
    /// lock for exactly the span of the delegate call.
    ///
    /// `guard` must belong to [`TileStore::host_lock`] of this surface's
    /// host; the engine's workers reacquire that lock per tile through the
    /// host's own capability calls.
    pub fn process_tiles(&self, guard: &mut HostGuard<'_>, requests: &mut [TileRequest]) {
        let mut queue: Vec<*mut TileRequest> =
            requests.iter_mut().map(|r| r as *mut TileRequest).collect();
        let process = self.base.process_tiles;
        // The callbacks never write surface state, only the request they are
        // handed, so a shared borrow is enough even in threaded mode.
        let surface = &self.base as *const TiledSurface as *mut TiledSurface;
        log::trace!("processing {} tile requests", queue.len());
        guard.suspended(|| unsafe { process(surface, queue.as_mut_ptr(), queue.len() as c_int) });
    }

    unsafe extern "C" fn tile_request_start(surface: *mut TiledSurface, request: *mut TileRequest) {
        let this = &*(surface as *const Self);
        let request = &mut *request;

        match this
            .host
            .fetch_tile(request.tx, request.ty, request.readonly)
        {
            Ok(tile) => {
                debug_assert_eq!(
                    tile.samples(),
                    TILE_SAMPLES,
                    "host returned a tile of the wrong geometry"
                );
                request.buffer = tile.pixels().as_ptr();
                // The buffer object stays retained until the end callback.
                request.context = Box::into_raw(Box::new(tile)) as *mut c_void;
            }
            Err(err) => {
                request.buffer = ptr::null_mut();
                request.context = ptr::null_mut();
                log::error!(
                    "Tile fetch failed for ({}, {}): {}",
                    request.tx,
                    request.ty,
                    err
                );
            }
        }
    }

    unsafe extern "C" fn tile_request_end(surface: *mut TiledSurface, request: *mut TileRequest) {
        let this = &*(surface as *const Self);
        let request = &mut *request;

        let retained: Option<Box<Arc<dyn TileBuffer>>> = if request.context.is_null() {
            None
        } else {
            Some(Box::from_raw(request.context as *mut Arc<dyn TileBuffer>))
        };

        // Commit runs even with no buffer attached; strict hosts report the
        // absence and the failure is absorbed like any other.
        let tile: Option<&dyn TileBuffer> = retained.as_deref().map(|tile| &**tile);
        if let Err(err) = this
            .host
            .commit_tile(request.tx, request.ty, tile, request.readonly)
        {
            log::error!(
                "Tile commit failed for ({}, {}): {}",
                request.tx,
                request.ty,
                err
            );
        }

        // Release the reference taken at start, commit outcome aside.
        drop(retained);
        request.context = ptr::null_mut();
        request.buffer = ptr::null_mut();
    }

    unsafe extern "C" fn destroy(surface: *mut Surface) {
        if !surface.is_null() {
            drop(Box::from_raw(surface as *mut Self));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HostError;
    use crate::host::{HostLock, TileStore};
    use crate::mem::{MemoryTile, MemoryTileStore};
    use std::sync::Mutex;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // Scripted host used to observe the proxy's exact call pattern.
    struct ScriptedStore {
        lock: HostLock,
        tile: Arc<MemoryTile>,
        fail_fetch: bool,
        fail_commit: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedStore {
        fn new() -> Self {
            Self {
                lock: HostLock::new(),
                tile: Arc::new(MemoryTile::new()),
                fail_fetch: false,
                fail_commit: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TileStore for ScriptedStore {
        fn host_lock(&self) -> &HostLock {
            &self.lock
        }

        fn fetch_tile(
            &self,
            tx: i32,
            ty: i32,
            readonly: bool,
        ) -> Result<Arc<dyn TileBuffer>, HostError> {
            let _host = self.lock.acquire();
            self.calls
                .lock()
                .unwrap()
                .push(format!("fetch({}, {}, ro={})", tx, ty, readonly));
            if self.fail_fetch {
                return Err(HostError::CallFailed {
                    capability: "fetch_tile",
                    detail: "scripted failure".into(),
                });
            }
            Ok(self.tile.clone())
        }

        fn commit_tile(
            &self,
            tx: i32,
            ty: i32,
            tile: Option<&dyn TileBuffer>,
            readonly: bool,
        ) -> Result<(), HostError> {
            let _host = self.lock.acquire();
            self.calls
                .lock()
                .unwrap()
                .push(format!("commit({}, {}, buf={}, ro={})", tx, ty, tile.is_some(), readonly));
            if self.fail_commit {
                return Err(HostError::CallFailed {
                    capability: "commit_tile",
                    detail: "scripted failure".into(),
                });
            }
            tile.map(|_| ()).ok_or(HostError::MissingBuffer { tx, ty })
        }
    }

    fn start(surface: &mut ProxySurface<'_>, request: &mut TileRequest) {
        let base = surface.base_mut();
        unsafe { ((*base).tile_request_start)(base, request) };
    }

    fn end(surface: &mut ProxySurface<'_>, request: &mut TileRequest) {
        let base = surface.base_mut();
        unsafe { ((*base).tile_request_end)(base, request) };
    }

    #[test]
    fn begin_end_retains_and_releases_exactly_once() {
        init_logging();
        let store = ScriptedStore::new();
        let mut surface = ProxySurface::new(&store);
        let mut request = TileRequest::new(2, 3, true);

        assert_eq!(Arc::strong_count(&store.tile), 1);
        start(&mut surface, &mut request);
        assert!(request.has_buffer());
        assert_eq!(request.buffer, store.tile.pixels().as_ptr());
        assert_eq!(Arc::strong_count(&store.tile), 2); // retained in context

        end(&mut surface, &mut request);
        assert_eq!(Arc::strong_count(&store.tile), 1); // released
        assert!(!request.has_buffer());
        assert!(request.context.is_null());

        // Commit still sees the original readonly flag and the buffer.
        assert_eq!(
            store.calls(),
            vec![
                "fetch(2, 3, ro=true)".to_string(),
                "commit(2, 3, buf=true, ro=true)".to_string(),
            ]
        );
    }

    #[test]
    fn failed_fetch_degrades_to_an_unavailable_tile() {
        init_logging();
        let mut store = ScriptedStore::new();
        store.fail_fetch = true;
        let mut surface = ProxySurface::new(&store);
        let mut request = TileRequest::new(5, 5, false);

        start(&mut surface, &mut request);
        assert!(!request.has_buffer());
        assert!(request.context.is_null());
        assert_eq!(Arc::strong_count(&store.tile), 1); // nothing retained

        // End must stay safely callable and still invoke commit, bufferless.
        end(&mut surface, &mut request);
        assert!(!request.has_buffer());
        assert!(request.context.is_null());
        assert_eq!(
            store.calls(),
            vec![
                "fetch(5, 5, ro=false)".to_string(),
                "commit(5, 5, buf=false, ro=false)".to_string(),
            ]
        );
    }

    #[test]
    fn commit_failure_still_releases_and_clears() {
        init_logging();
        let mut store = ScriptedStore::new();
        store.fail_commit = true;
        let mut surface = ProxySurface::new(&store);
        let mut request = TileRequest::new(0, 0, false);

        start(&mut surface, &mut request);
        assert_eq!(Arc::strong_count(&store.tile), 2);
        end(&mut surface, &mut request);
        assert_eq!(Arc::strong_count(&store.tile), 1);
        assert!(!request.has_buffer());
        assert!(request.context.is_null());
    }

    #[test]
    fn pixel_views_alias_host_storage() {
        init_logging();
        let store = MemoryTileStore::new();
        store.write_tile(2, 3, &[41, 42, 43]);
        store.clear_dirty();
        let mut surface = ProxySurface::new(&store);

        // Read-only access observes what the host wrote.
        let mut peek = TileRequest::new(2, 3, true);
        start(&mut surface, &mut peek);
        let first = unsafe { *peek.buffer };
        assert_eq!(first, 41);
        end(&mut surface, &mut peek);
        assert!(store.dirty_tiles().is_empty());

        // Writes through the raw view land in host storage.
        let mut edit = TileRequest::new(2, 3, false);
        start(&mut surface, &mut edit);
        unsafe { *edit.buffer.add(1) = 99 };
        end(&mut surface, &mut edit);
        assert_eq!(store.snapshot(2, 3).unwrap()[1], 99);
        assert_eq!(store.dirty_tiles(), vec![(2, 3)]);
    }

    #[test]
    fn process_tiles_suspends_the_lock_once_per_call() {
        init_logging();
        let store = ScriptedStore::new();
        let surface = ProxySurface::with_config(
            &store,
            SurfaceConfig {
                threadsafe_tile_requests: false,
                worker_threads: None,
            },
        );

        let mut requests: Vec<TileRequest> =
            (0..3).map(|i| TileRequest::new(i, i, false)).collect();
        let mut guard = store.host_lock().acquire();
        surface.process_tiles(&mut guard, &mut requests);
        assert_eq!(store.lock.suspensions(), 1);

        // Empty batches still pay exactly one suspension.
        surface.process_tiles(&mut guard, &mut []);
        assert_eq!(store.lock.suspensions(), 2);
        drop(guard);

        let fetches = store.calls().iter().filter(|c| c.starts_with("fetch")).count();
        let commits = store.calls().iter().filter(|c| c.starts_with("commit")).count();
        assert_eq!(fetches, 3);
        assert_eq!(commits, 3);
        for request in &requests {
            assert!(!request.has_buffer());
            assert!(request.context.is_null());
        }
    }

    #[test]
    fn threaded_processing_of_disjoint_tiles_keeps_the_store_consistent() {
        init_logging();
        let store = MemoryTileStore::new();
        let surface = ProxySurface::with_config(
            &store,
            SurfaceConfig {
                threadsafe_tile_requests: true,
                worker_threads: Some(4),
            },
        );

        let mut requests: Vec<TileRequest> =
            (0..16).map(|i| TileRequest::new(i % 4, i / 4, false)).collect();
        let mut guard = store.host_lock().acquire();
        surface.process_tiles(&mut guard, &mut requests);
        drop(guard);

        assert_eq!(store.tile_count(), 16);
        assert_eq!(store.dirty_tiles().len(), 16);
        for request in &requests {
            assert!(!request.has_buffer());
            assert!(request.context.is_null());
        }
    }

    #[test]
    fn engine_owned_surfaces_are_destroyed_through_the_vtable() {
        init_logging();
        let store = MemoryTileStore::new();
        let base = ProxySurface::new(&store).into_engine();
        let mut request = TileRequest::new(1, 1, false);
        unsafe {
            ((*base).tile_request_start)(base, &mut request);
            ((*base).tile_request_end)(base, &mut request);
            let destroy = (*base).parent.destroy.expect("ownership transfer wires destroy");
            destroy(base as *mut Surface);
        }
        // The host object is untouched by surface teardown.
        assert_eq!(store.tile_count(), 1);
    }
}
