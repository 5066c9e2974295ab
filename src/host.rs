use std::os::raw::c_void;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::HostError;

/// Refcounted pixel buffer owned by the host.
///
/// The view behind [`pixels`](Self::pixels) must stay valid and contiguous
/// for as long as any reference to the buffer object is held.
pub trait TileBuffer: Send + Sync {
    /// Pointer to the first sample of the contiguous
    /// `tile_size × tile_size × 4` buffer of `u16` samples.
    fn pixels(&self) -> NonNull<u16>;

    /// Number of `u16` samples behind [`pixels`](Self::pixels).
    fn samples(&self) -> usize;

    /// Identity cookie for buffers that live across an FFI boundary; stores
    /// whose buffers are plain Rust objects leave this null.
    fn foreign_handle(&self) -> *mut c_void {
        ptr::null_mut()
    }
}

/// Host-managed tile storage, addressed through exactly two capabilities.
///
/// Implementations serialize their own state through the host lock; callers
/// re-enter the host through these methods from engine worker threads, so
/// both capabilities must take [`host_lock`](Self::host_lock) themselves.
pub trait TileStore: Send + Sync {
    /// The host environment's single-writer lock.
    fn host_lock(&self) -> &HostLock;

    /// Fetch the buffer object backing tile `(tx, ty)`, retained for the
    /// caller.
    fn fetch_tile(
        &self,
        tx: i32,
        ty: i32,
        readonly: bool,
    ) -> Result<Arc<dyn TileBuffer>, HostError>;

    /// Commit a previously fetched buffer back to tile `(tx, ty)`. `tile` is
    /// absent when the matching fetch failed; strict stores report that as
    /// an error.
    fn commit_tile(
        &self,
        tx: i32,
        ty: i32,
        tile: Option<&dyn TileBuffer>,
        readonly: bool,
    ) -> Result<(), HostError>;
}

/// The host environment's single-writer lock.
///
/// Only one host-side operation may execute at a time. The designated yield
/// point is [`HostGuard::suspended`], which releases the lock around a
/// delegate call and reacquires it before returning.
#[derive(Default)]
pub struct HostLock {
    mutex: Mutex<()>,
    suspensions: AtomicUsize,
}

impl HostLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is held.
    pub fn acquire(&self) -> HostGuard<'_> {
        HostGuard {
            lock: self,
            held: Some(self.mutex.lock().unwrap()),
        }
    }

    /// Take the lock only if it is free.
    pub fn try_acquire(&self) -> Option<HostGuard<'_>> {
        let held = self.mutex.try_lock().ok()?;
        Some(HostGuard {
            lock: self,
            held: Some(held),
        })
    }

    /// How many times the lock has been suspended. Diagnostic only.
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::Relaxed)
    }
}

/// Proof of holding a [`HostLock`].
pub struct HostGuard<'l> {
    lock: &'l HostLock,
    held: Option<MutexGuard<'l, ()>>,
}

impl HostGuard<'_> {
    /// Release the lock for the duration of `f`, then reacquire it.
    ///
    /// This is the narrow critical-section boundary delegate calls run
    /// inside: release before the delegate, reacquire after, exactly once.
    pub fn suspended<R>(&mut self, f: impl FnOnce() -> R) -> R {
        drop(self.held.take());
        self.lock.suspensions.fetch_add(1, Ordering::Relaxed);
        let out = f();
        self.held = Some(self.lock.mutex.lock().unwrap());
        out
    }
}
