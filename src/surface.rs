use std::os::raw::c_int;
use std::slice;

use crossbeam_channel::unbounded;
use static_assertions::const_assert;

use crate::request::TileRequest;

/// Tile edge length in pixels, fixed at engine compile time.
pub const TILE_SIZE: usize = 64;
/// Channels per pixel (RGBA, premultiplied 16-bit).
pub const TILE_CHANNELS: usize = 4;
/// Total `u16` samples in one tile buffer.
pub const TILE_SAMPLES: usize = TILE_SIZE * TILE_SIZE * TILE_CHANNELS;

const_assert!(TILE_SIZE.is_power_of_two());

/// Per-tile callback slot: begin or end access to the request's tile.
pub type TileRequestFn = unsafe extern "C" fn(surface: *mut TiledSurface, request: *mut TileRequest);

/// Bulk-processing slot: drive a batch of tile requests to completion.
pub type ProcessTilesFn =
    unsafe extern "C" fn(surface: *mut TiledSurface, requests: *mut *mut TileRequest, count: c_int);

/// Teardown slot on the outer surface vtable.
pub type DestroyFn = unsafe extern "C" fn(surface: *mut Surface);

/// Outermost surface vtable the engine drives destruction through.
///
/// `destroy` is left unset for surfaces whose lifetime is managed on the
/// Rust side (a plain `Box` drop); ownership-transferring constructors fill
/// it in.
#[repr(C)]
pub struct Surface {
    pub destroy: Option<DestroyFn>,
}

/// Tiled-surface base state.
///
/// Backends embed this as their first field (`#[repr(C)]`) so the engine can
/// address them through the base pointer. The engine invokes
/// `tile_request_start` / `tile_request_end` once per tile access and routes
/// batches through the `process_tiles` slot.
#[repr(C)]
pub struct TiledSurface {
    pub parent: Surface,
    pub tile_request_start: TileRequestFn,
    pub tile_request_end: TileRequestFn,
    pub process_tiles: ProcessTilesFn,
    /// Whether tile requests may be issued from multiple worker threads.
    pub threadsafe_tile_requests: bool,
    /// Upper bound on bulk-processing workers. 0 sizes to the CPU count.
    pub worker_limit: usize,
    /// Tile edge length; always [`TILE_SIZE`] in this engine revision.
    pub tile_size: usize,
}

impl TiledSurface {
    /// Base state wired to the given per-tile callbacks, with the generic
    /// bulk routine installed and threaded requests off.
    pub fn init(start: TileRequestFn, end: TileRequestFn) -> Self {
        Self {
            parent: Surface { destroy: None },
            tile_request_start: start,
            tile_request_end: end,
            process_tiles: generic_process_tiles,
            threadsafe_tile_requests: false,
            worker_limit: 0,
            tile_size: TILE_SIZE,
        }
    }
}

/// The engine's generic bulk-processing routine.
///
/// Runs start-then-end once per request. When the surface advertises
/// threadsafe tile requests and more than one request is queued, the batch
/// is fanned out over a bounded worker pool; ordering across requests is
/// then unspecified, but each request still sees start before end.
///
/// # Safety
///
/// `surface` must point to a live surface whose callbacks tolerate the
/// advertised threading mode, and `requests` must reference `count` valid
/// requests that stay untouched by the caller until this returns.
pub unsafe extern "C" fn generic_process_tiles(
    surface: *mut TiledSurface,
    requests: *mut *mut TileRequest,
    count: c_int,
) {
    if surface.is_null() || requests.is_null() || count <= 0 {
        return;
    }
    let surf = &*surface;
    let queue = slice::from_raw_parts(requests, count as usize);

    if surf.threadsafe_tile_requests && queue.len() > 1 {
        let workers = effective_workers(surf.worker_limit, queue.len());
        let (tx, rx) = unbounded::<ReqPtr>();
        for &request in queue {
            if !request.is_null() {
                tx.send(ReqPtr(request)).expect("worker queue receiver alive");
            }
        }
        drop(tx);

        let shared = SurfacePtr(surface);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                scope.spawn(move || {
                    // Capture the whole `SurfacePtr` (which is `Send`), not the
                    // bare `*mut` field that edition-2021 disjoint capture would
                    // otherwise move in.
                    let shared = shared;
                    while let Ok(ReqPtr(request)) = rx.recv() {
                        // Each request is delivered to exactly one worker.
                        unsafe {
                            ((*shared.0).tile_request_start)(shared.0, request);
                            ((*shared.0).tile_request_end)(shared.0, request);
                        }
                    }
                });
            }
        });
    } else {
        for &request in queue {
            if request.is_null() {
                continue;
            }
            (surf.tile_request_start)(surface, request);
            (surf.tile_request_end)(surface, request);
        }
    }
}

fn effective_workers(limit: usize, pending: usize) -> usize {
    let cap = if limit == 0 { num_cpus::get() } else { limit };
    cap.clamp(1, pending)
}

struct ReqPtr(*mut TileRequest);
// Requests are partitioned across workers; no pointer is shared.
unsafe impl Send for ReqPtr {}

#[derive(Clone, Copy)]
struct SurfacePtr(*mut TiledSurface);
// Workers only read the base state and call its callbacks.
unsafe impl Send for SurfacePtr {}
unsafe impl Sync for SurfacePtr {}
