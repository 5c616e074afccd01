//! Test doubles for the queue's external collaborators.
//!
//! [`MockDisplay`] records every work item it is handed, in order, and can
//! be steered mid-test: readiness pinned on or off, flips made to fail,
//! frames auto-released as scanout would. [`TestFence`] is a pipe-backed
//! fence that exercises the same poll-based readiness logic as production
//! sync files.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::backend::DisplayBackend;
use crate::buffer::{AcquiredBuffer, BufferHandle, BufferManager, BufferUsage};
use crate::fence::FenceRef;
use crate::queue::{DisplayFrame, DisplayQueue, QueueEvent};
use crate::sequence::FrameId;

/// A fence whose signal the test controls.
///
/// The read end of a pipe polls not-ready until [`TestFence::signal`] writes
/// a byte. The queue duplicates the descriptor on enqueue, so dropping the
/// fence after queueing is safe.
#[derive(Debug)]
pub struct TestFence {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl TestFence {
    pub fn new() -> Self {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("failed to create fence pipe");
        Self { read_fd, write_fd }
    }

    /// A fence that is already signalled.
    pub fn signalled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn fence_ref(&self) -> FenceRef {
        FenceRef::from_fd(self.read_fd)
    }

    pub fn signal(&self) {
        nix::unistd::write(self.write_fd, &[1u8]).expect("failed to signal fence");
    }
}

impl Default for TestFence {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestFence {
    fn drop(&mut self) {
        for fd in [self.read_fd, self.write_fd] {
            if let Err(e) = nix::unistd::close(fd) {
                warn!("TestFence: error closing fd {}: {}", fd, e);
            }
        }
    }
}

#[derive(Debug)]
struct MockAcquiredBuffer {
    #[allow(dead_code)]
    handle: BufferHandle,
}

impl AcquiredBuffer for MockAcquiredBuffer {}

/// Records buffer acquisitions and usage hints.
#[derive(Default)]
pub struct MockBufferManager {
    acquired: Mutex<Vec<BufferHandle>>,
    usages: Mutex<Vec<(BufferHandle, BufferUsage)>>,
    outstanding: Mutex<Vec<Weak<MockAcquiredBuffer>>>,
}

impl MockBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handle ever acquired, in order.
    pub fn acquired_handles(&self) -> Vec<BufferHandle> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn usages(&self) -> Vec<(BufferHandle, BufferUsage)> {
        self.usages.lock().unwrap().clone()
    }

    /// How many acquired references are still alive.
    pub fn outstanding_references(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl BufferManager for MockBufferManager {
    fn acquire_buffer(&self, handle: BufferHandle) -> Arc<dyn AcquiredBuffer> {
        let buffer = Arc::new(MockAcquiredBuffer { handle });
        self.acquired.lock().unwrap().push(handle);
        self.outstanding.lock().unwrap().push(Arc::downgrade(&buffer));
        buffer
    }

    fn set_buffer_usage(&self, handle: BufferHandle, usage: BufferUsage) {
        self.usages.lock().unwrap().push((handle, usage));
    }
}

/// What the mock display received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedItem {
    Frame { id: FrameId, layer_count: usize },
    Event { id: u32, effective_frame: FrameId },
}

/// A display consumer whose behaviour the test steers.
pub struct MockDisplay {
    ready: AtomicBool,
    fail_flips: AtomicBool,
    auto_release_previous: AtomicBool,
    not_ready_after_flip: AtomicBool,
    flush_in_consume: AtomicBool,
    sync_flips: AtomicU32,
    consumed: Mutex<Vec<ConsumedItem>>,
    held: Mutex<Vec<DisplayFrame>>,
    queue: Mutex<Option<Weak<DisplayQueue>>>,
}

impl MockDisplay {
    pub fn new() -> Arc<MockDisplay> {
        Arc::new(MockDisplay {
            ready: AtomicBool::new(true),
            fail_flips: AtomicBool::new(false),
            auto_release_previous: AtomicBool::new(false),
            not_ready_after_flip: AtomicBool::new(false),
            flush_in_consume: AtomicBool::new(false),
            sync_flips: AtomicU32::new(0),
            consumed: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            queue: Mutex::new(None),
        })
    }

    /// Give the mock a way back into the queue for releases and self-flush.
    pub fn attach(&self, queue: &Arc<DisplayQueue>) {
        *self.queue.lock().unwrap() = Some(Arc::downgrade(queue));
    }

    fn queue(&self) -> Option<Arc<DisplayQueue>> {
        self.queue.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_fail_flips(&self, fail: bool) {
        self.fail_flips.store(fail, Ordering::SeqCst);
    }

    /// Release the previously flipped frame whenever a new one arrives,
    /// the way scanout frees the outgoing buffers on flip completion.
    pub fn set_auto_release_previous(&self, on: bool) {
        self.auto_release_previous.store(on, Ordering::SeqCst);
    }

    /// Go not-ready on every flip, the way a real display stays busy until
    /// the flip completes. The test re-arms readiness with `set_ready`.
    pub fn set_not_ready_after_flip(&self, on: bool) {
        self.not_ready_after_flip.store(on, Ordering::SeqCst);
    }

    /// Call `flush(0, None)` from inside the next `consume_frame`.
    pub fn set_flush_in_consume(&self, on: bool) {
        self.flush_in_consume.store(on, Ordering::SeqCst);
    }

    pub fn consumed(&self) -> Vec<ConsumedItem> {
        self.consumed.lock().unwrap().clone()
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.lock().unwrap().len()
    }

    pub fn held_frames(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn sync_flips(&self) -> u32 {
        self.sync_flips.load(Ordering::SeqCst)
    }

    /// Return every held frame to the pool.
    pub fn release_all(&self) {
        let Some(queue) = self.queue() else { return };
        let frames: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for frame in frames {
            queue.release_frame(frame);
        }
    }
}

impl DisplayBackend for MockDisplay {
    fn ready_for_next_work(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn consume_frame(&self, frame: DisplayFrame) -> Result<(), DisplayFrame> {
        self.consumed.lock().unwrap().push(ConsumedItem::Frame {
            id: frame.frame_id(),
            layer_count: frame.layers().len(),
        });

        if self.fail_flips.load(Ordering::SeqCst) {
            return Err(frame);
        }

        if self.not_ready_after_flip.load(Ordering::SeqCst) {
            self.ready.store(false, Ordering::SeqCst);
        }

        if self.flush_in_consume.swap(false, Ordering::SeqCst) {
            if let Some(queue) = self.queue() {
                queue.flush(0, None);
            }
        }

        if self.auto_release_previous.load(Ordering::SeqCst) {
            let previous = {
                let mut held = self.held.lock().unwrap();
                (!held.is_empty()).then(|| held.remove(0))
            };
            if let Some(previous) = previous {
                if let Some(queue) = self.queue() {
                    queue.release_frame(previous);
                }
            }
        }

        self.held.lock().unwrap().push(frame);
        Ok(())
    }

    fn consume_event(&self, event: QueueEvent) {
        self.consumed.lock().unwrap().push(ConsumedItem::Event {
            id: event.id,
            effective_frame: event.effective_frame,
        });
    }

    fn sync_flip(&self) {
        self.sync_flips.fetch_add(1, Ordering::SeqCst);
    }
}
