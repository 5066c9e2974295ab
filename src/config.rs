/// Construction options for a proxy surface.
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    /// Allow the engine to issue tile requests from multiple worker threads.
    pub threadsafe_tile_requests: bool,
    /// Worker pool size for bulk processing. `None` sizes to the CPU count.
    pub worker_threads: Option<usize>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            threadsafe_tile_requests: true,
            worker_threads: None,
        }
    }
}
