//! The display queue: a bounded, pipelined handoff between frame producers
//! and a single display consumer.
//!
//! Producers queue frames, events and drops; a dedicated worker thread
//! drives the queue toward the display. The queue owns a fixed pool of
//! frame slots, drops frames that become redundant before they flip, and
//! coalesces dropped frames into the effective id of the last live work
//! item so the issued-frame marker never misses them.
//!
//! Locking: one mutex (`state`) protects every queue field except the layer
//! state of a frame currently locked for display. The consume path releases
//! the lock around every downstream call so producers are never blocked on
//! the display.

mod frame;
mod work;
mod worker;

pub use self::frame::{DisplayFrame, FrameConfig, FrameLayer, QueueEvent};

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};

use crate::backend::DisplayBackend;
use crate::buffer::BufferManager;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::fence;
use crate::layer::Layer;
use crate::sequence::{signed_delta, FrameId};
use self::work::WorkList;
use self::worker::Worker;

bitflags! {
    /// Queue behaviours selected by the display at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BehaviourFlags: u32 {
        /// Wait for every layer's rendering to complete before flipping.
        const SYNC_BEFORE_FLIP = 1 << 0;
    }
}

/// Point-in-time queue counters, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued_work: u32,
    pub queued_frames: u32,
    pub frames_locked_for_display: u32,
    pub frame_pool_used: u32,
    pub frame_pool_peak: u32,
    pub consumed_work: u32,
    pub consumed_frames_since_init: u32,
    pub last_queued_frame: FrameId,
    pub last_issued_frame: FrameId,
    pub last_dropped_frame: FrameId,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "work:{} frames:{} locked:{} pool-used:{} (peak {}) consumed:{} last-queued {} last-issued {} last-dropped {}",
            self.queued_work,
            self.queued_frames,
            self.frames_locked_for_display,
            self.frame_pool_used,
            self.frame_pool_peak,
            self.consumed_work,
            self.last_queued_frame,
            self.last_issued_frame,
            self.last_dropped_frame
        )
    }
}

struct QueueState {
    work: WorkList,
    queued_work: u32,
    queued_frames: u32,
    frames_locked_for_display: u32,
    frame_pool_used: u32,
    frame_pool_peak: u32,
    consumed_work: u32,
    consumed_frames_since_init: u32,
    last_queued: FrameId,
    last_issued: FrameId,
    last_dropped: FrameId,
    consumer_blocked: bool,
}

impl QueueState {
    fn new(pool_count: usize) -> Self {
        QueueState {
            work: WorkList::new(pool_count),
            queued_work: 0,
            queued_frames: 0,
            frames_locked_for_display: 0,
            frame_pool_used: 0,
            frame_pool_peak: 0,
            consumed_work: 0,
            consumed_frames_since_init: 0,
            last_queued: FrameId::default(),
            last_issued: FrameId::default(),
            last_dropped: FrameId::default(),
            consumer_blocked: false,
        }
    }
}

pub struct DisplayQueue {
    name: String,
    behaviour: BehaviourFlags,
    config: QueueConfig,
    backend: Arc<dyn DisplayBackend>,
    buffers: Arc<dyn BufferManager>,
    state: Mutex<QueueState>,
    /// Broadcast on every dequeue, drop, issued-frame advance and consumer
    /// block/unblock transition.
    work_consumed: Condvar,
    /// Broadcast when a pool frame returns from the display.
    frame_released: Condvar,
    worker: Mutex<Option<Worker>>,
}

impl DisplayQueue {
    pub fn new(
        name: impl Into<String>,
        behaviour: BehaviourFlags,
        config: QueueConfig,
        backend: Arc<dyn DisplayBackend>,
        buffers: Arc<dyn BufferManager>,
    ) -> Arc<DisplayQueue> {
        let name = name.into();
        info!(
            "queue {}: created [pool x{}, behaviour {:?}]",
            name, config.frame_pool_count, behaviour
        );
        Arc::new(DisplayQueue {
            state: Mutex::new(QueueState::new(config.frame_pool_count)),
            name,
            behaviour,
            config,
            backend,
            buffers,
            work_consumed: Condvar::new(),
            frame_released: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the display can take the next work item right now.
    pub fn ready_for_next_work(&self) -> bool {
        self.backend.ready_for_next_work()
    }

    pub fn queued_work(&self) -> u32 {
        self.state.lock().unwrap().queued_work
    }

    pub fn stats(&self) -> QueueStats {
        Self::stats_of(&self.state.lock().unwrap())
    }

    fn stats_of(st: &QueueState) -> QueueStats {
        QueueStats {
            queued_work: st.queued_work,
            queued_frames: st.queued_frames,
            frames_locked_for_display: st.frames_locked_for_display,
            frame_pool_used: st.frame_pool_used,
            frame_pool_peak: st.frame_pool_peak,
            consumed_work: st.consumed_work,
            consumed_frames_since_init: st.consumed_frames_since_init,
            last_queued_frame: st.last_queued,
            last_issued_frame: st.last_issued,
            last_dropped_frame: st.last_dropped,
        }
    }

    /// Queue a non-frame work item.
    ///
    /// The event's effective frame is a repeat of the last queued frame, so
    /// consuming it advances the issued marker across any drops queued
    /// before it.
    pub fn queue_event(self: &Arc<Self>, id: u32) {
        let mut st = self.state.lock().unwrap();
        let effective = st.last_queued;
        let index = st.work.alloc_event(id, effective);
        self.do_queue_work(&mut st, index);
    }

    /// Snapshot `stack` into a pool frame and queue it for display.
    pub fn queue_frame(
        self: &Arc<Self>,
        stack: &[Layer],
        z_order: u32,
        id: FrameId,
        config: FrameConfig,
    ) -> Result<(), QueueError> {
        let st = self.state.lock().unwrap();

        // Queued frame sequence can not go backwards.
        st.last_queued.validate_future(id);

        let lag = signed_delta(st.last_issued.frame_index(), id.frame_index());
        if st.consumed_frames_since_init > 0
            && st.frames_locked_for_display > 0
            && lag > self.config.stale_frame_threshold as i32
        {
            error!(
                "queue {}: display is {} frames behind [last issued {}, new frame {}]",
                self.name, lag, st.last_issued, id
            );
        }

        let mut st = self.limit_used_frames(st);

        let Some(slot) = self.find_free(&mut st) else {
            error!("queue {}: failed to find free frame", self.name);
            return Err(QueueError::PoolExhausted {
                pool: st.work.pool_count() as usize,
            });
        };

        st.frame_pool_used += 1;
        if st.frame_pool_used > st.frame_pool_peak {
            st.frame_pool_peak = st.frame_pool_used;
            debug!("queue {}: peak pool use {}", self.name, st.frame_pool_peak);
        }

        if let Err(e) = st
            .work
            .frame_mut(slot)
            .set(stack, z_order, id, config, &*self.buffers)
        {
            st.work.frame_mut(slot).reset(true);
            st.frame_pool_used -= 1;
            error!("queue {}: failed to set display frame: {}", self.name, e);
            return Err(e);
        }

        // A frame's effective id is (obviously) its own id.
        st.work.set_effective(slot, id);
        st.last_queued = id;
        self.do_queue_work(&mut st, slot);
        Ok(())
    }

    /// Record a frame the producer dropped without queueing.
    ///
    /// With no queued work the issued marker advances immediately;
    /// otherwise the drop is coalesced into the newest queued item's
    /// effective id and the marker advances when that item is consumed.
    pub fn queue_drop(&self, id: FrameId) {
        let mut st = self.state.lock().unwrap();
        st.last_queued.validate_future(id);
        match st.work.tail() {
            None => {
                debug!("queue {}: drop frame {}", self.name, id);
                self.do_advance_issued(&mut st, id);
            }
            Some(tail) => {
                st.work.set_effective(tail, id);
                debug!(
                    "queue {}: drop frame, updated tail item to effective {}",
                    self.name, id
                );
            }
        }
        st.last_queued = id;
        self.validate(&st);
    }

    /// Drop every queued frame that is not locked for display.
    pub fn drop_all_frames(&self) {
        let mut st = self.state.lock().unwrap();
        self.validate(&st);
        let mut work = st.work.head();
        let mut done = work.is_none();
        while !done {
            let current = work.unwrap();
            let next = st.work.next(current);
            done = Some(next) == st.work.head();
            if st.work.is_frame(current) && !st.work.frame(current).is_locked_for_display() {
                self.drop_frame(&mut st, current);
            }
            work = Some(next);
        }
        self.validate(&st);
    }

    /// Drop queued frames made redundant by a newer render-complete frame.
    pub fn drop_redundant_frames(&self) {
        let mut st = self.state.lock().unwrap();
        self.do_drop_redundant(&mut st);
    }

    /// Synchronously consume the head work item. Returns false if the list
    /// is empty. Called from the worker.
    pub fn consume_work(&self) -> bool {
        let guard = self.state.lock().unwrap();
        self.validate(&guard);
        let Some(head) = guard.work.head() else {
            debug_assert_eq!(guard.queued_work, 0);
            return false;
        };
        debug_assert!(guard.queued_work > 0);
        if guard.work.is_frame(head) {
            self.do_consume_frame(guard, head);
        } else {
            self.do_consume_event(guard, head);
        }
        true
    }

    /// Wait until the worker has consumed through `frame_index` (0 = all
    /// queued work), then synchronise the flip.
    ///
    /// Falls back to invalidating queued frames when called from the worker
    /// thread itself, when the consumer is blocked, or when the bounded wait
    /// times out; the producer never deadlocks on a thread it is running on
    /// or on a display that has stalled.
    pub fn flush(&self, frame_index: u32, timeout: Option<Duration>) {
        let guard = self.state.lock().unwrap();

        // The worker thread cannot flush itself synchronously.
        let self_flush = self
            .worker_thread_id()
            .map_or(false, |id| id == thread::current().id());

        let (mut guard, flushed) = if self_flush || guard.consumer_blocked {
            (guard, false)
        } else {
            self.do_flush(guard, frame_index, timeout)
        };

        if !flushed {
            self.do_invalidate_frames(&mut guard);
        }
    }

    /// Mark the display consumer as unable to make progress. Flushers are
    /// woken so they can fall back instead of waiting on a dead consumer.
    pub fn consumer_blocked(&self) {
        let mut st = self.state.lock().unwrap();
        st.consumer_blocked = true;
        self.work_consumed.notify_all();
    }

    pub fn consumer_unblocked(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.consumer_blocked);
        st.consumer_blocked = false;
        self.work_consumed.notify_all();
    }

    /// The display's readiness changed; wake the worker to re-poll it.
    pub fn notify_ready(&self) {
        trace!("queue {}: notified ready", self.name);
        self.signal_worker();
    }

    /// Return a frame the display has finished with to the pool.
    pub fn release_frame(&self, frame: DisplayFrame) {
        let mut st = self.state.lock().unwrap();
        self.do_release_frame(&mut st, frame);
    }

    /// Wait until the pool has a free slot, bounded by `timeout`. Returns
    /// whether a slot was free when the wait ended.
    pub fn wait_for_free_frame(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        loop {
            if st.frame_pool_used < st.work.pool_count() {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return false;
            };
            let (guard, _) = self.frame_released.wait_timeout(st, remaining).unwrap();
            st = guard;
        }
    }

    // ------------------------------------------------------------------
    // Internals. Every helper below runs with the state lock held unless it
    // takes and returns the guard explicitly.
    // ------------------------------------------------------------------

    fn do_queue_work(self: &Arc<Self>, st: &mut QueueState, index: u32) {
        let is_frame = st.work.is_frame(index);
        debug!(
            "queue {}: queue {} {} [work:{} frames:{} pool-used:{}]",
            self.name,
            if is_frame { "frame" } else { "event" },
            st.work.effective(index),
            st.queued_work + 1,
            if is_frame { st.queued_frames + 1 } else { st.queued_frames },
            st.frame_pool_used
        );

        debug_assert_eq!(st.queued_work == 0, st.work.head().is_none());

        // Issued frame indices must always trail queued frame indices.
        st.last_issued.validate_future(st.work.effective(index));

        st.work.push_back(index);
        st.queued_work += 1;
        if is_frame {
            st.queued_frames += 1;
        }

        self.ensure_worker_and_signal();
        self.validate(st);
    }

    fn ensure_worker_and_signal(self: &Arc<Self>) {
        let mut guard = self.worker.lock().unwrap();
        let worker = guard.get_or_insert_with(|| {
            Worker::spawn(&self.name, Arc::downgrade(self), self.config.timeout_for_ready)
        });
        worker.signal_work();
    }

    fn signal_worker(&self) {
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.signal_work();
        }
    }

    fn worker_thread_id(&self) -> Option<thread::ThreadId> {
        self.worker.lock().unwrap().as_ref().map(Worker::thread_id)
    }

    /// Producer-side pool pressure valve, run before every allocation.
    ///
    /// Drops redundant frames first; if the pool is still at its limit,
    /// stalls briefly so the display can drain. After the timeout the caller
    /// proceeds and `find_free` recycles the oldest queued frame.
    fn limit_used_frames<'a>(
        &self,
        mut guard: MutexGuard<'a, QueueState>,
    ) -> MutexGuard<'a, QueueState> {
        self.do_drop_redundant(&mut guard);

        if guard.frame_pool_used < self.config.frame_pool_limit {
            return guard;
        }
        let begin = Instant::now();
        loop {
            let elapsed = begin.elapsed();
            if elapsed >= self.config.timeout_for_limit {
                debug!("queue {}: limit wait timeout", self.name);
                return guard;
            }
            debug!(
                "queue {}: limit [used {}/{}]",
                self.name, guard.frame_pool_used, self.config.frame_pool_limit
            );
            let (g, _) = self
                .work_consumed
                .wait_timeout(guard, self.config.timeout_for_limit - elapsed)
                .unwrap();
            guard = g;
            if guard.frame_pool_used < self.config.frame_pool_limit {
                return guard;
            }
        }
    }

    /// Find a non-locked pool slot: any unqueued slot first, else the oldest
    /// queued slot is dropped and recycled. None means every slot is on
    /// display, which is a downstream release leak.
    fn find_free(&self, st: &mut QueueState) -> Option<u32> {
        let mut oldest: Option<u32> = None;
        for slot in 0..st.work.pool_count() {
            if st.work.frame(slot).is_locked_for_display() {
                continue;
            }
            if !st.work.is_queued(slot) {
                return Some(slot);
            }
            oldest = match oldest {
                None => Some(slot),
                Some(o) => {
                    let o_timeline = st.work.frame(o).frame_id().timeline_index();
                    let s_timeline = st.work.frame(slot).frame_id().timeline_index();
                    if signed_delta(s_timeline, o_timeline) > 0 {
                        Some(slot)
                    } else {
                        Some(o)
                    }
                }
            };
        }
        let Some(oldest) = oldest else {
            error!(
                "queue {}: all frames on display - check release_frame is being called [queued {}, on display {}, pool {}]",
                self.name, st.queued_frames, st.frames_locked_for_display, st.work.pool_count()
            );
            return None;
        };
        self.drop_frame(st, oldest);
        Some(oldest)
    }

    fn drop_frame(&self, st: &mut QueueState, slot: u32) {
        debug_assert!(st.work.is_frame(slot));
        debug_assert!(st.work.is_queued(slot));
        debug_assert!(!st.work.frame(slot).is_locked_for_display());

        st.last_dropped = st.work.frame(slot).frame_id();
        debug!(
            "queue {}: drop {} [work:{} frames:{} pool-used:{}]",
            self.name,
            st.last_dropped,
            st.queued_work - 1,
            st.queued_frames - 1,
            st.frame_pool_used - 1
        );

        st.work.unlink(slot);
        debug_assert!(st.queued_frames > 0);
        debug_assert!(st.queued_work > 0);
        debug_assert!(st.frame_pool_used > 0);
        st.queued_frames -= 1;
        st.queued_work -= 1;
        st.frame_pool_used -= 1;

        // Reset with cancel: the buffers were never flipped, so the queue's
        // release references are dropped explicitly.
        st.work.frame_mut(slot).reset(true);

        self.work_consumed.notify_all();
    }

    /// Retire an invalidated head frame without flipping it.
    ///
    /// The frame's effective id may carry coalesced drops forward, so the
    /// issued marker must still advance through it; a flush waiting on one
    /// of those ids would otherwise never complete, since no surviving work
    /// item carries them.
    fn retire_invalid_frame(&self, st: &mut QueueState, slot: u32) {
        debug!(
            "queue {}: retire invalidated frame {}",
            self.name,
            st.work.frame(slot).frame_id()
        );
        let effective = st.work.effective(slot);
        self.drop_frame(st, slot);
        self.do_advance_issued(st, effective);
    }

    /// Never flip a frame when a later frame is already ready to flip.
    ///
    /// Walks newest to oldest, dropping every unlocked frame that has at
    /// least one newer render-complete frame behind it.
    fn do_drop_redundant(&self, st: &mut QueueState) {
        let Some(head) = st.work.head() else { return };
        let newest = st.work.prev(head);
        if newest == head {
            return;
        }

        let mut newer_complete =
            st.work.is_frame(newest) && st.work.frame(newest).is_rendering_complete();

        let mut current = st.work.prev(newest);
        loop {
            let reached_head = current == head;
            let next = st.work.prev(current);
            if st.work.is_frame(current) {
                if newer_complete {
                    if !st.work.frame(current).is_locked_for_display() {
                        self.drop_frame(st, current);
                    }
                } else {
                    newer_complete = st.work.frame(current).is_rendering_complete();
                }
            }
            if reached_head {
                break;
            }
            current = next;
        }
    }

    fn do_advance_issued(&self, st: &mut QueueState, id: FrameId) {
        // Issued frame sequence can not go backwards.
        st.last_issued.validate_future(id);
        st.last_issued = id;
        self.work_consumed.notify_all();
    }

    fn do_consume_event(&self, mut guard: MutexGuard<'_, QueueState>, head: u32) {
        let event = QueueEvent {
            id: guard.work.event(head).id,
            effective_frame: guard.work.effective(head),
        };
        guard.last_issued.validate_future(event.effective_frame);
        debug!(
            "queue {}: consume event {} [work:{} frames:{} pool-used:{}]",
            self.name,
            event.id,
            guard.queued_work - 1,
            guard.queued_frames,
            guard.frame_pool_used
        );

        // Issue without the lock so future work can continue to be queued.
        drop(guard);
        self.backend.consume_event(event);
        let mut guard = self.state.lock().unwrap();

        self.validate(&guard);
        debug_assert!(guard.queued_work > 0);
        guard.work.unlink(head);
        guard.queued_work -= 1;
        guard.consumed_work += 1;

        // A drop queued during the callback may have advanced our effective
        // id; advance from the current value, not the delivered copy.
        let effective = guard.work.effective(head);
        self.do_advance_issued(&mut guard, effective);
        guard.work.free_event(head);
    }

    fn do_consume_frame<'a>(&'a self, mut guard: MutexGuard<'a, QueueState>, head: u32) {
        debug_assert!(guard.queued_frames > 0);
        // The display should not ask for more work until the previous flip
        // completed.
        debug_assert!(guard.frames_locked_for_display <= 1);

        let mut slot = head;

        // Retire a frame invalidated by a producer flush without flipping.
        if !guard.work.frame(slot).is_valid() {
            self.retire_invalid_frame(&mut guard, slot);
            return;
        }

        // Issued frame sequence can not go backwards.
        guard.last_issued.validate_future(guard.work.effective(slot));
        guard.last_issued.validate_future(guard.work.frame(slot).frame_id());

        // Lock immediately so the frame can not be reused or removed during
        // consume.
        self.lock_frame_for_display(&mut guard, slot);

        if self.behaviour.contains(BehaviourFlags::SYNC_BEFORE_FLIP) {
            // Wait for source rendering without the lock; the locked frame
            // can not be dropped or recycled meanwhile, so its fence
            // descriptors stay open.
            let fds = guard.work.frame(slot).pending_acquire_fds();
            drop(guard);
            for fd in fds {
                fence::wait_raw(fd, self.config.timeout_wait_rendering);
            }
            guard = self.state.lock().unwrap();

            self.validate(&guard);
            // The head work item can not have changed while it was locked.
            debug_assert_eq!(guard.work.head(), Some(slot));
            self.unlock_frame_for_display(&mut guard, slot);

            // Newer frames may have finished rendering while we waited:
            // always flip the newest ready frame, dropping the older ones.
            self.do_drop_redundant(&mut guard);
            debug_assert!(guard.work.head().is_some());

            // The producer may also have invalidated queued frames while the
            // lock was released; retire any that surface at the head rather
            // than flipping them.
            loop {
                let Some(new_head) = guard.work.head() else {
                    return;
                };
                if !guard.work.is_frame(new_head) {
                    // An event reached the head; it is consumed on the next
                    // pass.
                    return;
                }
                if guard.work.frame(new_head).is_valid() {
                    slot = new_head;
                    break;
                }
                self.retire_invalid_frame(&mut guard, new_head);
            }
            self.lock_frame_for_display(&mut guard, slot);
        }

        // Dequeue before flipping: a failed flip returns the frame to the
        // pool for immediate reuse.
        let effective = guard.work.effective(slot);
        debug_assert!(guard.queued_frames > 0);
        debug_assert!(guard.queued_work > 0);
        guard.work.unlink(slot);
        guard.queued_frames -= 1;
        guard.queued_work -= 1;
        guard.consumed_frames_since_init += 1;
        guard.consumed_work += 1;

        let frame = guard.work.frame_mut(slot);
        // Coalesced drops can advance the effective id past the frame's own,
        // never behind it.
        debug_assert!(frame.frame_id().precedes(effective));
        let display_frame = frame.take_for_display(slot);
        debug!(
            "queue {}: consume frame {} effective {} [work:{} frames:{} pool-used:{}]",
            self.name,
            display_frame.frame_id(),
            effective,
            guard.queued_work,
            guard.queued_frames,
            guard.frame_pool_used
        );

        // Issue the flip without the lock.
        drop(guard);
        if let Err(failed) = self.backend.consume_frame(display_frame) {
            warn!(
                "queue {}: flip failed, frame {} returned to pool",
                self.name,
                failed.frame_id()
            );
            let mut guard = self.state.lock().unwrap();
            self.do_release_frame(&mut guard, failed);
        }

        let mut guard = self.state.lock().unwrap();
        self.validate(&guard);
        self.do_advance_issued(&mut guard, effective);
    }

    fn lock_frame_for_display(&self, st: &mut QueueState, slot: u32) {
        debug_assert!(!st.work.frame(slot).is_locked_for_display());
        st.work.frame_mut(slot).set_locked_for_display(true);
        st.frames_locked_for_display += 1;
    }

    fn unlock_frame_for_display(&self, st: &mut QueueState, slot: u32) {
        debug_assert!(st.work.frame(slot).is_locked_for_display());
        debug_assert!(st.frames_locked_for_display > 0);
        st.work.frame_mut(slot).set_locked_for_display(false);
        st.frames_locked_for_display -= 1;
    }

    fn do_release_frame(&self, st: &mut QueueState, mut frame: DisplayFrame) {
        let slot = frame.slot;
        debug_assert!(slot < st.work.pool_count());
        debug_assert!(st.work.frame(slot).is_locked_for_display());
        self.validate(st);

        debug!(
            "queue {}: release {} [work:{} frames:{} pool-used:{}]",
            self.name,
            frame.frame_id(),
            st.queued_work,
            st.queued_frames,
            st.frame_pool_used - 1
        );

        // Reset without cancel: release is signalled by the timeline advance.
        for layer in &mut frame.layers {
            layer.reset(false);
        }
        frame.layers.clear();

        let pool_frame = st.work.frame_mut(slot);
        pool_frame.restore_layers(std::mem::take(&mut frame.layers));
        pool_frame.set_locked_for_display(false);

        debug_assert!(st.frames_locked_for_display > 0);
        debug_assert!(st.frame_pool_used > 0);
        st.frames_locked_for_display -= 1;
        st.frame_pool_used -= 1;

        self.validate(st);
        self.frame_released.notify_all();
    }

    /// Wait for the worker to drain, then synchronise flip completion.
    /// Returns false (without syncing) when the wait cannot complete.
    fn do_flush<'a>(
        &'a self,
        mut guard: MutexGuard<'a, QueueState>,
        frame_index: u32,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, bool) {
        trace!(
            "queue {}: flush [to frame {}, timeout {:?}] {}",
            self.name,
            frame_index,
            timeout,
            Self::stats_of(&guard)
        );

        if self.worker_thread_id().is_some() {
            // Consume at most the work that was queued when the flush began;
            // items queued during the flush are not waited for.
            let max_consume = guard.queued_work;
            let start_consume_count = guard.consumed_work;

            while !guard.consumer_blocked
                && guard.queued_work > 0
                && guard.consumed_work.wrapping_sub(start_consume_count) < max_consume
                && (frame_index == 0
                    || signed_delta(guard.last_issued.frame_index(), frame_index) > 0)
            {
                self.signal_worker();
                match timeout {
                    Some(t) => {
                        let (g, wait) = self.work_consumed.wait_timeout(guard, t).unwrap();
                        guard = g;
                        if wait.timed_out() {
                            warn!("queue {}: flush wait timed out", self.name);
                            return (guard, false);
                        }
                    }
                    None => {
                        guard = self.work_consumed.wait(guard).unwrap();
                    }
                }
            }
        }

        if guard.consumer_blocked {
            return (guard, false);
        }

        debug!(
            "queue {}: flushed through frame {}",
            self.name,
            guard.last_issued.frame_index()
        );

        // Synchronise the flip completion without the lock.
        drop(guard);
        self.backend.sync_flip();
        let guard = self.state.lock().unwrap();

        debug!(
            "queue {}: completed flip to frame {}",
            self.name,
            guard.last_issued.frame_index()
        );
        (guard, true)
    }

    /// Mark every queued, unlocked pool frame invalid so the worker retires
    /// it instead of flipping.
    fn do_invalidate_frames(&self, st: &mut QueueState) {
        trace!("queue {}: invalidate queued frames", self.name);
        self.validate(st);
        let Some(head) = st.work.head() else { return };
        let mut current = head;
        loop {
            if st.work.is_frame(current) && !st.work.frame(current).is_locked_for_display() {
                st.work.frame_mut(current).invalidate();
            }
            current = st.work.next(current);
            if current == head {
                break;
            }
        }
        self.validate(st);
    }

    /// Walk the whole queue and check counter and ordering invariants.
    /// Debug builds only.
    fn validate(&self, st: &QueueState) {
        if cfg!(debug_assertions) {
            let mut work = 0u32;
            let mut frames = 0u32;
            if let Some(head) = st.work.head() {
                let mut current = head;
                loop {
                    work += 1;
                    if st.work.is_frame(current) {
                        frames += 1;
                    }
                    let next = st.work.next(current);
                    if next == head {
                        break;
                    }
                    // Effective ids along the list never decrease.
                    st.work
                        .effective(current)
                        .validate_future(st.work.effective(next));
                    current = next;
                }
            }
            debug_assert_eq!(work, st.queued_work);
            debug_assert_eq!(frames, st.queued_frames);
            // A flipped frame is no longer in the list but still counts
            // against the pool until released.
            debug_assert!(frames <= st.frame_pool_used);
            // Issued frame indices must always trail queued frame indices.
            st.last_issued.validate_future(st.last_queued);
        }
    }

    fn stop_worker(&self) {
        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            debug!("queue {}: stopping worker", self.name);
            worker.stop();
        }
    }
}

impl Drop for DisplayQueue {
    fn drop(&mut self) {
        if let Ok(st) = self.state.lock() {
            if st.queued_work != 0 || st.frames_locked_for_display != 0 {
                warn!(
                    "queue {}: dropped with {} queued items, {} frames on display",
                    self.name, st.queued_work, st.frames_locked_for_display
                );
            }
        }
        self.stop_worker();
    }
}
