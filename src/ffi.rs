use std::os::raw::{c_int, c_void};
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::SurfaceConfig;
use crate::errors::HostError;
use crate::host::{HostLock, TileBuffer, TileStore};
use crate::proxy::ProxySurface;
use crate::request::TileRequest;
use crate::surface::{Surface, TiledSurface, TILE_SAMPLES};

/// Capability table a C host registers with [`tilehost_surface_new`].
///
/// `fetch` returns an opaque buffer-object handle, retained for the caller,
/// and writes the pixel pointer through `pixels`; a null handle signals
/// failure. `commit` returns `false` on failure; the `tile` argument is null
/// when the matching fetch failed. `release` drops the reference taken by
/// `fetch` and must be safe to call from engine worker threads.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TileStoreCallbacks {
    pub ctx: *mut c_void,
    pub fetch: Option<
        unsafe extern "C" fn(
            ctx: *mut c_void,
            tx: c_int,
            ty: c_int,
            readonly: bool,
            pixels: *mut *mut u16,
        ) -> *mut c_void,
    >,
    pub commit: Option<
        unsafe extern "C" fn(
            ctx: *mut c_void,
            tx: c_int,
            ty: c_int,
            tile: *mut c_void,
            readonly: bool,
        ) -> bool,
    >,
    pub release: Option<unsafe extern "C" fn(ctx: *mut c_void, tile: *mut c_void)>,
}

/// Buffer object fetched through the C callback table. Dropping the last
/// reference hands the handle back through `release`.
struct ForeignTile {
    pixels: NonNull<u16>,
    handle: *mut c_void,
    callbacks: TileStoreCallbacks,
}

// Handles cross engine worker threads; the host promises its release
// callback is a plain refcount operation.
unsafe impl Send for ForeignTile {}
unsafe impl Sync for ForeignTile {}

impl TileBuffer for ForeignTile {
    fn pixels(&self) -> NonNull<u16> {
        self.pixels
    }

    fn samples(&self) -> usize {
        // Fixed geometry is part of the callback contract.
        TILE_SAMPLES
    }

    fn foreign_handle(&self) -> *mut c_void {
        self.handle
    }
}

impl Drop for ForeignTile {
    fn drop(&mut self) {
        if let Some(release) = self.callbacks.release {
            unsafe { release(self.callbacks.ctx, self.handle) };
        }
    }
}

/// Adapts a C callback table to the [`TileStore`] contract.
pub struct CallbackTileStore {
    lock: HostLock,
    callbacks: TileStoreCallbacks,
}

// The callback table is shared with engine worker threads; every capability
// call is serialized through the host lock.
unsafe impl Send for CallbackTileStore {}
unsafe impl Sync for CallbackTileStore {}

impl CallbackTileStore {
    /// Returns `None` unless both mandatory capabilities are present.
    pub fn new(callbacks: TileStoreCallbacks) -> Option<Self> {
        if callbacks.fetch.is_none() || callbacks.commit.is_none() {
            return None;
        }
        Some(Self {
            lock: HostLock::new(),
            callbacks,
        })
    }
}

impl TileStore for CallbackTileStore {
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
        let fetch = self.callbacks.fetch.ok_or(HostError::CallFailed {
            capability: "fetch_tile",
            detail: "no fetch callback registered".into(),
        })?;
        let mut pixels: *mut u16 = ptr::null_mut();
        let handle = unsafe { fetch(self.callbacks.ctx, tx, ty, readonly, &mut pixels) };
        if handle.is_null() {
            return Err(HostError::CallFailed {
                capability: "fetch_tile",
                detail: format!("host returned no buffer for ({}, {})", tx, ty),
            });
        }
        let Some(pixels) = NonNull::new(pixels) else {
            // A handle was retained but there is no pixel view behind it;
            // give the reference back before reporting.
            if let Some(release) = self.callbacks.release {
                unsafe { release(self.callbacks.ctx, handle) };
            }
            return Err(HostError::MissingBuffer { tx, ty });
        };
        Ok(Arc::new(ForeignTile {
            pixels,
            handle,
            callbacks: self.callbacks,
        }))
    }

    fn commit_tile(
        &self,
        tx: i32,
        ty: i32,
        tile: Option<&dyn TileBuffer>,
        readonly: bool,
    ) -> Result<(), HostError> {
        let _host = self.lock.acquire();
        let commit = self.callbacks.commit.ok_or(HostError::CallFailed {
            capability: "commit_tile",
            detail: "no commit callback registered".into(),
        })?;
        let handle = tile.map(|t| t.foreign_handle()).unwrap_or(ptr::null_mut());
        let ok = unsafe { commit(self.callbacks.ctx, tx, ty, handle, readonly) };
        if ok {
            Ok(())
        } else {
            Err(HostError::CallFailed {
                capability: "commit_tile",
                detail: format!("host rejected tile ({}, {})", tx, ty),
            })
        }
    }
}

struct ExportedSurface {
    base: *mut TiledSurface,
    store: *mut CallbackTileStore,
}

/// Opaque handle for C embedders.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TilehostSurfaceHandle(*mut ExportedSurface);

#[no_mangle]
pub extern "C" fn tilehost_surface_new(
    callbacks: TileStoreCallbacks,
    threadsafe: bool,
) -> TilehostSurfaceHandle {
    let Some(store) = CallbackTileStore::new(callbacks) else {
        return TilehostSurfaceHandle(ptr::null_mut());
    };
    let store = Box::into_raw(Box::new(store));
    let config = SurfaceConfig {
        threadsafe_tile_requests: threadsafe,
        ..SurfaceConfig::default()
    };
    // The store box outlives the surface; both are torn down in _free.
    let host: &CallbackTileStore = unsafe { &*store };
    let base = ProxySurface::with_config(host, config).into_engine();
    TilehostSurfaceHandle(Box::into_raw(Box::new(ExportedSurface { base, store })))
}

#[no_mangle]
pub extern "C" fn tilehost_surface_base(handle: TilehostSurfaceHandle) -> *mut TiledSurface {
    if handle.0.is_null() {
        return ptr::null_mut();
    }
    unsafe { (*handle.0).base }
}

#[no_mangle]
pub extern "C" fn tilehost_surface_process_tiles(
    handle: TilehostSurfaceHandle,
    requests: *mut *mut TileRequest,
    count: c_int,
) {
    if handle.0.is_null() {
        return;
    }
    let exported = unsafe { &*handle.0 };
    let store = unsafe { &*exported.store };
    let base = exported.base;
    let mut guard = store.host_lock().acquire();
    guard.suspended(|| unsafe { ((*base).process_tiles)(base, requests, count) });
}

#[no_mangle]
pub extern "C" fn tilehost_surface_free(handle: TilehostSurfaceHandle) {
    if handle.0.is_null() {
        return;
    }
    unsafe {
        let exported = Box::from_raw(handle.0);
        if let Some(destroy) = (*exported.base).parent.destroy {
            destroy(exported.base as *mut Surface);
        }
        drop(Box::from_raw(exported.store));
    }
}
