//! Queue tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of frames in the pool.
///
/// The pool is fixed at construction so peak memory is bounded and a
/// downstream that leaks frame releases is detectable.
pub const FRAME_POOL_COUNT: usize = 8;

/// Minimum number of layer slots allocated per frame, to allow for various
/// display arrangements while minimising reallocation. Layer storage can
/// grow beyond this.
pub(crate) const MIN_LAYER_ALLOC: usize = 8;

/// Settings governing pool pressure and the queue's bounded waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of frame slots in the pool.
    pub frame_pool_count: usize,
    /// Used-frame count at which producers stall to give the display a
    /// chance to drain before the oldest queued frame gets dropped.
    pub frame_pool_limit: u32,
    /// How long a producer waits for the worker to drain the pool before
    /// giving up and letting the oldest frame be recycled.
    pub timeout_for_limit: Duration,
    /// Bound on the worker's not-ready wait, covering readiness signals lost
    /// to a stalled display.
    pub timeout_for_ready: Duration,
    /// Bound on the per-layer rendering wait before a synchronised flip.
    pub timeout_wait_rendering: Duration,
    /// How many frames the display may fall behind the producer before each
    /// enqueue logs the lag.
    pub stale_frame_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            frame_pool_count: FRAME_POOL_COUNT,
            frame_pool_limit: FRAME_POOL_COUNT as u32,
            timeout_for_limit: Duration::from_millis(100),
            timeout_for_ready: Duration::from_secs(1),
            timeout_wait_rendering: Duration::from_secs(3),
            stale_frame_threshold: 16,
        }
    }
}
