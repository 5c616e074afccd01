//! Queue error types.

use thiserror::Error;

use crate::fence::FenceError;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Every pool slot is locked for display. A persistent occurrence means
    /// the downstream is leaking frame releases.
    #[error("no free frame: all {pool} pool frames are locked for display")]
    PoolExhausted { pool: usize },

    /// A layer snapshot could not take ownership of its resources; the frame
    /// was reset and the pool is unchanged.
    #[error("failed to snapshot layer {layer}: {source}")]
    LayerSnapshot {
        layer: usize,
        #[source]
        source: FenceError,
    },
}
