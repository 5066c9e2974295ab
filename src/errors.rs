#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host call {capability} failed: {detail}")]
    CallFailed {
        capability: &'static str,
        detail: String,
    },

    #[error("tile ({tx}, {ty}) has no backing buffer")]
    MissingBuffer { tx: i32, ty: i32 },

    #[error("tile buffer has {actual} samples, expected {expected}")]
    Geometry { expected: usize, actual: usize },
}
