//! The queue's consumer thread.
//!
//! One worker per queue. The worker spins: drop redundant frames, then
//! either consume the head item or wait. Waiting-for-work blocks until
//! signalled; waiting-for-ready is bounded so a readiness signal lost to a
//! stalled display cannot park the thread forever. A signalled counter
//! absorbs wakeups that arrive while the worker is between waits.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, error, trace};

use super::DisplayQueue;

#[derive(Default)]
struct Signal {
    signalled: u32,
    stop: bool,
}

struct WorkerShared {
    signal: Mutex<Signal>,
    work: Condvar,
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Worker {
    pub fn spawn(name: &str, queue: Weak<DisplayQueue>, timeout_for_ready: Duration) -> Worker {
        let shared = Arc::new(WorkerShared {
            signal: Mutex::new(Signal::default()),
            work: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(queue, thread_shared, timeout_for_ready))
            .expect("failed to spawn display queue worker thread");
        let thread_id = join.thread().id();
        debug!("worker {}: started", name);
        Worker {
            shared,
            join: Some(join),
            thread_id,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Wake the worker; wakeups are counted so none is lost between waits.
    pub fn signal_work(&self) {
        let mut signal = self.shared.signal.lock().unwrap();
        debug_assert!(!signal.stop);
        signal.signalled += 1;
        self.shared.work.notify_all();
    }

    /// Request exit and join, unless called from the worker thread itself
    /// (the thread is already unwinding towards exit in that case).
    pub fn stop(&mut self) {
        {
            let mut signal = self.shared.signal.lock().unwrap();
            signal.stop = true;
            self.shared.work.notify_all();
        }
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                trace!("worker stopping from its own thread; not joining");
            } else if join.join().is_err() {
                error!("display queue worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(queue: Weak<DisplayQueue>, shared: Arc<WorkerShared>, timeout_for_ready: Duration) {
    'outer: loop {
        // Spin until work is available and the display is ready.
        loop {
            let Some(queue) = queue.upgrade() else {
                break 'outer;
            };

            // Drop redundant frames as early as possible.
            queue.drop_redundant_frames();

            let wait_for_ready = !queue.ready_for_next_work();
            let wait_for_work = !wait_for_ready && queue.queued_work() == 0;
            if !wait_for_ready && !wait_for_work {
                break;
            }

            // Do not pin the queue alive while blocked.
            let name = queue.name().to_string();
            drop(queue);

            let mut signal = shared.signal.lock().unwrap();
            if signal.stop {
                break 'outer;
            }
            if signal.signalled > 0 {
                signal.signalled -= 1;
                continue;
            }
            if wait_for_ready {
                // Display is not ready. Block until signalled ready, or time
                // out to cover a lost readiness signal.
                trace!("queue {}: not ready", name);
                let (guard, timeout) = shared
                    .work
                    .wait_timeout(signal, timeout_for_ready)
                    .unwrap();
                signal = guard;
                if timeout.timed_out() {
                    trace!("queue {}: timeout waiting for display to signal ready", name);
                }
            } else {
                // Display is ready but there is no work yet.
                trace!("queue {}: out of work", name);
                signal = shared.work.wait(signal).unwrap();
            }
            if signal.stop {
                break 'outer;
            }
            if signal.signalled > 0 {
                signal.signalled -= 1;
            }
        }

        let Some(queue) = queue.upgrade() else {
            break;
        };
        queue.consume_work();
    }
    trace!("display queue worker exiting");
}
