use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::errors::HostError;
use crate::host::{HostLock, TileBuffer, TileStore};
use crate::surface::TILE_SAMPLES;

/// Heap-backed tile buffer object.
pub struct MemoryTile {
    data: UnsafeCell<Box<[u16]>>,
}

// Concurrent requests target disjoint tiles per the engine contract, so a
// tile sees at most one writer at a time.
unsafe impl Send for MemoryTile {}
unsafe impl Sync for MemoryTile {}

impl MemoryTile {
    pub fn new() -> Self {
        Self {
            data: UnsafeCell::new(vec![0u16; TILE_SAMPLES].into_boxed_slice()),
        }
    }

    fn fill(&self, samples: &[u16]) {
        let data = unsafe { &mut *self.data.get() };
        data[..samples.len()].copy_from_slice(samples);
    }

    fn copy_out(&self) -> Vec<u16> {
        unsafe { (&(*self.data.get())).to_vec() }
    }
}

impl Default for MemoryTile {
    fn default() -> Self {
        Self::new()
    }
}

impl TileBuffer for MemoryTile {
    fn pixels(&self) -> NonNull<u16> {
        unsafe { NonNull::new_unchecked((&mut *self.data.get()).as_mut_ptr()) }
    }

    fn samples(&self) -> usize {
        unsafe { (&(*self.data.get())).len() }
    }
}

/// Self-contained canvas backend: tiles materialize zeroed on first writable
/// fetch, read-only misses are served from one shared blank tile, and
/// writable commits are tracked as dirty coordinates.
pub struct MemoryTileStore {
    lock: HostLock,
    tiles: Mutex<HashMap<(i32, i32), Arc<MemoryTile>>>,
    blank: Arc<MemoryTile>,
    dirty: Mutex<HashSet<(i32, i32)>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self {
            lock: HostLock::new(),
            tiles: Mutex::new(HashMap::new()),
            blank: Arc::new(MemoryTile::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Number of materialized tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles.lock().unwrap().len()
    }

    /// Coordinates committed writable since the last [`clear_dirty`](Self::clear_dirty).
    pub fn dirty_tiles(&self) -> Vec<(i32, i32)> {
        let mut coords: Vec<(i32, i32)> = self.dirty.lock().unwrap().iter().copied().collect();
        coords.sort_unstable(); // deterministic for callers diffing regions
        coords
    }

    pub fn clear_dirty(&self) {
        self.dirty.lock().unwrap().clear();
    }

    /// Host-side write access, e.g. for loading document data.
    pub fn write_tile(&self, tx: i32, ty: i32, samples: &[u16]) {
        let _host = self.lock.acquire();
        let mut tiles = self.tiles.lock().unwrap();
        let tile = tiles
            .entry((tx, ty))
            .or_insert_with(|| Arc::new(MemoryTile::new()));
        tile.fill(samples);
        self.dirty.lock().unwrap().insert((tx, ty));
    }

    /// Copy of a materialized tile's samples, or `None` if never written.
    pub fn snapshot(&self, tx: i32, ty: i32) -> Option<Vec<u16>> {
        let _host = self.lock.acquire();
        let tiles = self.tiles.lock().unwrap();
        tiles.get(&(tx, ty)).map(|tile| tile.copy_out())
    }
}

impl Default for MemoryTileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TileStore for MemoryTileStore {
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
        let mut tiles = self.tiles.lock().unwrap();
        if readonly {
            if let Some(tile) = tiles.get(&(tx, ty)) {
                return Ok(tile.clone());
            }
            // Read-only miss: no storage materialized for a peek.
            return Ok(self.blank.clone());
        }
        Ok(tiles
            .entry((tx, ty))
            .or_insert_with(|| Arc::new(MemoryTile::new()))
            .clone())
    }

    fn commit_tile(
        &self,
        tx: i32,
        ty: i32,
        tile: Option<&dyn TileBuffer>,
        readonly: bool,
    ) -> Result<(), HostError> {
        let _host = self.lock.acquire();
        let tile = tile.ok_or(HostError::MissingBuffer { tx, ty })?;
        if tile.samples() != TILE_SAMPLES {
            return Err(HostError::Geometry {
                expected: TILE_SAMPLES,
                actual: tile.samples(),
            });
        }
        if !readonly {
            self.dirty.lock().unwrap().insert((tx, ty));
        }
        Ok(())
    }
}
