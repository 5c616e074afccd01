//! The downstream display boundary.
//!
//! The queue drives exactly one display consumer. The consumer reports
//! whether it can take the next work item, accepts frames and events in
//! queue order, and synchronises flip completion on request. All calls
//! arrive without any queue lock held, so implementations are free to call
//! back into the queue (release a frame, queue more work, flush).

use crate::queue::{DisplayFrame, QueueEvent};

pub trait DisplayBackend: Send + Sync {
    /// True when the display can accept the next work item. Expected to stay
    /// false from a flip until that flip completes.
    fn ready_for_next_work(&self) -> bool;

    /// Commit a frame to scanout.
    ///
    /// On success the display keeps the frame and returns it to the queue
    /// via `release_frame` once scanout moves off its buffers. On failure
    /// the frame comes straight back and the queue releases it.
    fn consume_frame(&self, frame: DisplayFrame) -> Result<(), DisplayFrame>;

    /// Deliver a non-frame work item.
    fn consume_event(&self, event: QueueEvent);

    /// Block until the most recently committed flip is on screen.
    fn sync_flip(&self);
}
