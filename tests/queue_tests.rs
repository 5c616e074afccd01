//! Integration scenarios for the display queue.
//!
//! Every scenario runs against the mock display and buffer manager from the
//! `testing` module, with a small pool and short timeouts so back-pressure
//! paths complete quickly. Debug builds additionally run the queue's
//! internal invariant walk after every operation, so each scenario also
//! checks counter consistency and effective-id ordering along the list.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use display_queue::testing::{ConsumedItem, MockBufferManager, MockDisplay, TestFence};
use display_queue::{
    BehaviourFlags, BufferHandle, DisplayQueue, FrameConfig, FrameId, Layer, QueueConfig,
    QueueError, ReleaseHandler, ReleaseReturn,
};

// ============================================================================
// Fixtures
// ============================================================================

fn setup(pool: usize, behaviour: BehaviourFlags) -> (Arc<DisplayQueue>, Arc<MockDisplay>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let display = MockDisplay::new();
    let config = QueueConfig {
        frame_pool_count: pool,
        frame_pool_limit: pool as u32,
        timeout_for_limit: Duration::from_millis(5),
        timeout_for_ready: Duration::from_millis(50),
        timeout_wait_rendering: Duration::from_millis(500),
        ..QueueConfig::default()
    };
    let queue = DisplayQueue::new(
        "test-queue",
        behaviour,
        config,
        display.clone(),
        Arc::new(MockBufferManager::new()),
    );
    display.attach(&queue);
    (queue, display)
}

fn id(n: u32) -> FrameId {
    FrameId::new(n, n)
}

fn layer(handle: u64) -> Layer {
    Layer::new(BufferHandle(handle), handle)
}

fn fenced_layer(handle: u64, fence: &TestFence) -> Layer {
    layer(handle).with_acquire_fence(fence.fence_ref())
}

/// Poll `cond` until it holds or the test deadline passes.
fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Wait for the issued marker to reach `n`. The marker advances only after
/// the display callback returns, so this also orders the mock's records.
fn wait_issued(queue: &Arc<DisplayQueue>, n: u32) {
    wait_until(
        || queue.stats().last_issued_frame.frame_index() == n,
        "issued marker to advance",
    );
}

#[derive(Default)]
struct CountingRelease {
    cancels: AtomicU32,
}

impl ReleaseHandler for CountingRelease {
    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Steady state
// ============================================================================

#[test]
fn steady_state_consumes_every_frame() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_auto_release_previous(true);

    for n in 1u32..=10 {
        queue
            .queue_frame(&[layer(n as u64)], 0, id(n), FrameConfig::default())
            .unwrap();
        wait_issued(&queue, n);
    }

    let stats = queue.stats();
    assert_eq!(stats.consumed_work, 10);
    assert_eq!(stats.consumed_frames_since_init, 10);
    assert_eq!(stats.queued_work, 0);
    // The last frame stays locked on display until released.
    assert_eq!(stats.frame_pool_used, 1);
    assert_eq!(stats.frames_locked_for_display, 1);
    assert_eq!(stats.last_issued_frame.frame_index(), 10);
    assert_eq!(display.held_frames(), 1);

    display.release_all();
    assert_eq!(queue.stats().frame_pool_used, 0);
}

// ============================================================================
// Back-pressure
// ============================================================================

#[test]
fn backpressure_recycles_oldest_frames() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);

    // Unsignalled fences keep the frames out of redundant-drop's reach;
    // only pool recycling may drop them.
    let fences: Vec<TestFence> = (0..12).map(|_| TestFence::new()).collect();
    for n in 1u32..=12 {
        queue
            .queue_frame(
                &[fenced_layer(n as u64, &fences[n as usize - 1])],
                0,
                id(n),
                FrameConfig::default(),
            )
            .unwrap();
    }

    let stats = queue.stats();
    assert_eq!(stats.queued_frames, 4);
    assert_eq!(stats.frame_pool_used, 4);
    assert_eq!(stats.frame_pool_peak, 4);
    // The oldest eight were recycled into the newest four.
    assert_eq!(stats.last_dropped_frame.frame_index(), 8);
    assert_eq!(stats.last_queued_frame.frame_index(), 12);
    assert_eq!(stats.consumed_work, 0);
    assert_eq!(display.consumed_count(), 0);
}

#[test]
fn pool_exhaustion_reports_error_when_display_leaks_releases() {
    let (queue, display) = setup(2, BehaviourFlags::empty());
    display.set_not_ready_after_flip(true);

    // Flip two frames without ever releasing them: both slots end up locked.
    queue
        .queue_frame(&[layer(1)], 0, id(1), FrameConfig::default())
        .unwrap();
    wait_issued(&queue, 1);
    queue
        .queue_frame(&[layer(2)], 0, id(2), FrameConfig::default())
        .unwrap();
    display.set_ready(true);
    queue.notify_ready();
    wait_issued(&queue, 2);
    assert_eq!(queue.stats().frames_locked_for_display, 2);

    let err = queue
        .queue_frame(&[layer(3)], 0, id(3), FrameConfig::default())
        .unwrap_err();
    assert!(matches!(err, QueueError::PoolExhausted { pool: 2 }));

    // Releasing recovers the pool.
    display.release_all();
    queue
        .queue_frame(&[layer(3)], 0, id(3), FrameConfig::default())
        .unwrap();
}

// ============================================================================
// Drop coalescing
// ============================================================================

#[test]
fn drops_coalesce_into_the_newest_queued_item() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);
    display.set_auto_release_previous(true);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(&[fenced_layer(1, &fences[0])], 0, id(1), FrameConfig::default())
        .unwrap();
    queue
        .queue_frame(&[fenced_layer(2, &fences[1])], 0, id(2), FrameConfig::default())
        .unwrap();
    queue.queue_drop(id(3));
    queue.queue_drop(id(4));

    let stats = queue.stats();
    assert_eq!(stats.last_queued_frame.frame_index(), 4);
    assert_eq!(stats.queued_frames, 2);
    assert_eq!(stats.last_issued_frame.frame_index(), 0);

    display.set_ready(true);
    queue.notify_ready();
    // Frame 2 carries the dropped range 3..=4 forward.
    wait_issued(&queue, 4);
    assert_eq!(queue.stats().consumed_work, 2);
    assert_eq!(
        display.consumed(),
        vec![
            ConsumedItem::Frame { id: id(1), layer_count: 1 },
            ConsumedItem::Frame { id: id(2), layer_count: 1 },
        ]
    );
}

#[test]
fn drop_with_empty_queue_advances_issued_marker_directly() {
    let (queue, _display) = setup(4, BehaviourFlags::empty());

    queue.queue_drop(id(5));

    let stats = queue.stats();
    assert_eq!(stats.last_issued_frame.frame_index(), 5);
    assert_eq!(stats.last_queued_frame.frame_index(), 5);
    assert_eq!(stats.queued_work, 0);
    assert_eq!(stats.consumed_work, 0);
}

#[test]
fn event_carries_coalesced_drops_forward() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);

    queue.queue_drop(id(1));
    assert_eq!(queue.stats().last_issued_frame.frame_index(), 1);

    queue.queue_event(7);
    queue.queue_drop(id(2));

    display.set_ready(true);
    queue.notify_ready();
    wait_until(|| queue.stats().consumed_work == 1, "event consumed");

    assert_eq!(
        display.consumed(),
        vec![ConsumedItem::Event { id: 7, effective_frame: id(2) }]
    );
    assert_eq!(queue.stats().last_issued_frame.frame_index(), 2);
}

// ============================================================================
// Redundant-frame dropping
// ============================================================================

#[test]
fn redundant_frames_never_reach_the_display() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);

    let fences: Vec<TestFence> = (0..3).map(|_| TestFence::signalled()).collect();
    for n in 1u32..=3 {
        queue
            .queue_frame(
                &[fenced_layer(n as u64, &fences[n as usize - 1])],
                0,
                id(n),
                FrameConfig::default(),
            )
            .unwrap();
    }

    display.set_ready(true);
    queue.notify_ready();
    wait_issued(&queue, 3);

    // Frames 1 and 2 were redundant: frame 3 was already render-complete.
    assert_eq!(
        display.consumed(),
        vec![ConsumedItem::Frame { id: id(3), layer_count: 1 }]
    );
    assert_eq!(queue.stats().consumed_frames_since_init, 1);
}

#[test]
fn sync_before_flip_takes_the_newest_ready_frame() {
    let (queue, display) = setup(4, BehaviourFlags::SYNC_BEFORE_FLIP);
    display.set_ready(false);
    display.set_auto_release_previous(true);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(&[fenced_layer(1, &fences[0])], 0, id(1), FrameConfig::default())
        .unwrap();
    queue
        .queue_frame(&[fenced_layer(2, &fences[1])], 0, id(2), FrameConfig::default())
        .unwrap();

    display.set_ready(true);
    queue.notify_ready();

    // Let the worker reach its pre-flip rendering wait, then finish both
    // frames. Frame 2 completes first, so by the time the wait on frame 1
    // returns there is always a newer ready frame; whichever side wins the
    // race, only frame 2 may flip.
    thread::sleep(Duration::from_millis(10));
    fences[1].signal();
    fences[0].signal();

    wait_issued(&queue, 2);
    assert_eq!(
        display.consumed(),
        vec![ConsumedItem::Frame { id: id(2), layer_count: 1 }]
    );
    assert_eq!(queue.stats().consumed_frames_since_init, 1);
    assert_eq!(queue.stats().last_dropped_frame.frame_index(), 1);
}

#[test]
fn invalidated_frame_promoted_after_rendering_wait_is_retired() {
    let (queue, display) = setup(4, BehaviourFlags::SYNC_BEFORE_FLIP);
    display.set_ready(false);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(&[fenced_layer(1, &fences[0])], 0, id(1), FrameConfig::default())
        .unwrap();
    queue
        .queue_frame(&[fenced_layer(2, &fences[1])], 0, id(2), FrameConfig::default())
        .unwrap();

    display.set_ready(true);
    queue.notify_ready();

    // The worker takes frame 1 and parks in its pre-flip rendering wait,
    // with frame 1 locked for display. A bounded flush from here times out
    // and invalidates frame 2 (frame 1 is locked, so it is skipped).
    thread::sleep(Duration::from_millis(10));
    queue.flush(0, Some(Duration::from_millis(10)));

    // Finish both frames: the redundant pass after the wait drops frame 1
    // in favour of frame 2, and the promoted frame 2 is invalid, so it is
    // retired instead of flipped.
    fences[1].signal();
    fences[0].signal();

    wait_until(|| queue.stats().queued_work == 0, "queue drained");
    assert_eq!(display.consumed_count(), 0);
    let stats = queue.stats();
    assert_eq!(stats.consumed_frames_since_init, 0);
    assert_eq!(stats.last_dropped_frame.frame_index(), 2);
    assert_eq!(stats.last_issued_frame.frame_index(), 2);
    assert_eq!(stats.frame_pool_used, 0);
}

// ============================================================================
// Flush
// ============================================================================

#[test]
fn flush_drains_queued_work_and_syncs_the_flip() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_auto_release_previous(true);
    display.set_ready(false);

    let fences: Vec<TestFence> = (0..3).map(|_| TestFence::new()).collect();
    for n in 1u32..=3 {
        queue
            .queue_frame(
                &[fenced_layer(n as u64, &fences[n as usize - 1])],
                0,
                id(n),
                FrameConfig::default(),
            )
            .unwrap();
    }
    display.set_ready(true);
    queue.notify_ready();

    queue.flush(0, None);

    let stats = queue.stats();
    assert_eq!(stats.queued_work, 0);
    assert_eq!(stats.consumed_work, 3);
    assert_eq!(stats.last_issued_frame.frame_index(), 3);
    assert_eq!(display.sync_flips(), 1);
}

#[test]
fn flush_timeout_invalidates_queued_frames() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);

    let fences: Vec<TestFence> = (0..3).map(|_| TestFence::new()).collect();
    for n in 1u32..=3 {
        queue
            .queue_frame(
                &[fenced_layer(n as u64, &fences[n as usize - 1])],
                0,
                id(n),
                FrameConfig::default(),
            )
            .unwrap();
    }

    // The display never goes ready, so the bounded flush gives up.
    queue.flush(3, Some(Duration::from_millis(10)));

    let stats = queue.stats();
    assert_eq!(stats.last_issued_frame.frame_index(), 0);
    assert_eq!(stats.queued_frames, 3);
    assert_eq!(display.sync_flips(), 0);

    // The invalidated frames are retired, never flipped; retirement still
    // advances the issued marker through their effective ids so a later
    // flush to one of them cannot wait forever.
    display.set_ready(true);
    queue.notify_ready();
    wait_until(|| queue.stats().queued_work == 0, "invalidated frames retired");
    assert_eq!(display.consumed_count(), 0);
    assert_eq!(queue.stats().consumed_work, 0);
    assert_eq!(queue.stats().frame_pool_used, 0);
    assert_eq!(queue.stats().last_issued_frame.frame_index(), 3);
}

#[test]
fn self_flush_from_consume_falls_back_without_deadlock() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);
    display.set_auto_release_previous(true);
    display.set_flush_in_consume(true);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(&[fenced_layer(1, &fences[0])], 0, id(1), FrameConfig::default())
        .unwrap();
    queue
        .queue_frame(&[fenced_layer(2, &fences[1])], 0, id(2), FrameConfig::default())
        .unwrap();

    display.set_ready(true);
    queue.notify_ready();

    // The worker flushes from inside frame 1's consume callback: the flush
    // must fall back to invalidation, so frame 2 is retired unflipped.
    wait_until(|| queue.stats().queued_work == 0, "queue drained");
    assert_eq!(
        display.consumed(),
        vec![ConsumedItem::Frame { id: id(1), layer_count: 1 }]
    );
    let stats = queue.stats();
    assert_eq!(stats.consumed_work, 1);
    assert_eq!(stats.last_dropped_frame.frame_index(), 2);
    assert_eq!(stats.last_issued_frame.frame_index(), 2);
    assert_eq!(display.sync_flips(), 0);
}

#[test]
fn flush_with_blocked_consumer_invalidates_immediately() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);

    let fence = TestFence::new();
    queue
        .queue_frame(&[fenced_layer(1, &fence)], 0, id(1), FrameConfig::default())
        .unwrap();

    queue.consumer_blocked();
    let begin = Instant::now();
    queue.flush(0, None);
    // An unbounded flush returns at once instead of waiting on a consumer
    // that cannot make progress.
    assert!(begin.elapsed() < Duration::from_secs(1));
    queue.consumer_unblocked();

    display.set_ready(true);
    queue.notify_ready();
    wait_until(|| queue.stats().queued_work == 0, "invalidated frame retired");
    assert_eq!(display.consumed_count(), 0);
    assert_eq!(queue.stats().last_issued_frame.frame_index(), 1);
}

// ============================================================================
// Event ordering
// ============================================================================

#[test]
fn events_deliver_in_order_between_frames() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_ready(false);
    display.set_auto_release_previous(true);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(&[fenced_layer(1, &fences[0])], 0, id(1), FrameConfig::default())
        .unwrap();
    queue.queue_event(100);
    queue
        .queue_frame(&[fenced_layer(2, &fences[1])], 0, id(2), FrameConfig::default())
        .unwrap();

    display.set_ready(true);
    queue.notify_ready();
    wait_issued(&queue, 2);

    assert_eq!(
        display.consumed(),
        vec![
            ConsumedItem::Frame { id: id(1), layer_count: 1 },
            ConsumedItem::Event { id: 100, effective_frame: id(1) },
            ConsumedItem::Frame { id: id(2), layer_count: 1 },
        ]
    );
    assert_eq!(queue.stats().consumed_work, 3);
}

// ============================================================================
// Dropping and release
// ============================================================================

#[test]
fn drop_all_frames_releases_everything_not_on_display() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_not_ready_after_flip(true);

    let release_2 = Arc::new(CountingRelease::default());
    let release_3 = Arc::new(CountingRelease::default());

    queue
        .queue_frame(&[layer(1)], 0, id(1), FrameConfig::default())
        .unwrap();
    wait_issued(&queue, 1);

    let fences = [TestFence::new(), TestFence::new()];
    queue
        .queue_frame(
            &[fenced_layer(2, &fences[0])
                .with_release_return(ReleaseReturn::Composition(release_2.clone()))],
            0,
            id(2),
            FrameConfig::default(),
        )
        .unwrap();
    queue
        .queue_frame(
            &[fenced_layer(3, &fences[1])
                .with_release_return(ReleaseReturn::Composition(release_3.clone()))],
            0,
            id(3),
            FrameConfig::default(),
        )
        .unwrap();

    queue.drop_all_frames();

    let stats = queue.stats();
    assert_eq!(stats.queued_work, 0);
    // Only the frame locked on display still counts against the pool.
    assert_eq!(stats.frame_pool_used, 1);
    assert_eq!(stats.frames_locked_for_display, 1);
    // Dropped frames cancel their composition release references so the
    // buffers can be reused immediately.
    assert_eq!(release_2.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(release_3.cancels.load(Ordering::SeqCst), 1);

    display.release_all();
    assert_eq!(queue.stats().frame_pool_used, 0);
}

#[test]
fn failed_flip_returns_the_frame_to_the_pool() {
    let (queue, display) = setup(4, BehaviourFlags::empty());
    display.set_fail_flips(true);

    queue
        .queue_frame(&[layer(1)], 0, id(1), FrameConfig::default())
        .unwrap();
    // The issued marker still advances: the frame was consumed, just not
    // shown.
    wait_issued(&queue, 1);

    let stats = queue.stats();
    assert_eq!(stats.consumed_work, 1);
    assert_eq!(stats.frame_pool_used, 0);
    assert_eq!(stats.frames_locked_for_display, 0);
    assert_eq!(display.held_frames(), 0);
}

#[test]
fn wait_for_free_frame_observes_releases() {
    let (queue, display) = setup(1, BehaviourFlags::empty());
    display.set_not_ready_after_flip(true);

    queue
        .queue_frame(&[layer(1)], 0, id(1), FrameConfig::default())
        .unwrap();
    wait_issued(&queue, 1);
    assert_eq!(queue.stats().frames_locked_for_display, 1);
    assert!(!queue.wait_for_free_frame(Duration::from_millis(10)));

    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || queue.wait_for_free_frame(Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(5));
    display.release_all();
    assert!(waiter.join().unwrap());
}
