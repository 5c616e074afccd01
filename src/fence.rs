//! Acquire-fence file descriptors.
//!
//! A producer layer carries a borrowed sync-file descriptor that signals when
//! rendering into its buffer has finished. When a layer is queued, the queue
//! duplicates that descriptor so the snapshot owns an independent reference;
//! the duplicate is closed exactly once, either by an explicit reset of the
//! owning layer or when the fence value is dropped.

use std::os::unix::io::RawFd;
use std::time::Duration;

use log::warn;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use thiserror::Error;

/// Errors from fence descriptor operations.
#[derive(Debug, Error)]
pub enum FenceError {
    /// The producer's fence descriptor could not be duplicated.
    #[error("failed to duplicate fence fd {fd}: {source}")]
    Dup {
        fd: RawFd,
        #[source]
        source: nix::Error,
    },
}

/// Borrowed reference to a producer-owned sync fence.
///
/// The queue never closes this descriptor; it takes its own reference with
/// [`FenceRef::dup`] at enqueue time.
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceRef {
    fd: Option<RawFd>,
}

impl FenceRef {
    /// A layer with no fence: its buffer is ready as soon as it is queued.
    pub fn none() -> Self {
        Self { fd: None }
    }

    /// Wrap a producer fence descriptor. Negative values mean "no fence".
    pub fn from_fd(fd: RawFd) -> Self {
        Self {
            fd: (fd >= 0).then_some(fd),
        }
    }

    pub fn is_some(&self) -> bool {
        self.fd.is_some()
    }

    /// Duplicate into an owned [`AcquireFence`].
    pub fn dup(&self) -> Result<Option<AcquireFence>, FenceError> {
        match self.fd {
            None => Ok(None),
            Some(fd) => nix::unistd::dup(fd)
                .map(|dup| Some(AcquireFence { fd: dup }))
                .map_err(|source| FenceError::Dup { fd, source }),
        }
    }
}

/// Owned, duplicated acquire fence.
///
/// Closing is idempotent: an explicit [`AcquireFence::close`] disarms the
/// `Drop` close.
#[derive(Debug)]
pub struct AcquireFence {
    fd: RawFd,
}

impl AcquireFence {
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Poll the fence with a zero timeout.
    pub fn is_signalled(&self) -> bool {
        wait_raw(self.fd, Duration::ZERO)
    }

    /// Block until the fence signals or `timeout` elapses. Returns the
    /// signalled state.
    pub fn wait(&self, timeout: Duration) -> bool {
        wait_raw(self.fd, timeout)
    }

    /// Close the descriptor now instead of at drop.
    pub fn close(mut self) {
        self.close_fd();
    }

    fn close_fd(&mut self) {
        if self.fd >= 0 {
            log::trace!("fence: closing acquire fd {}", self.fd);
            if let Err(e) = nix::unistd::close(self.fd) {
                warn!("fence: error closing acquire fd {}: {}", self.fd, e);
            }
            self.fd = -1;
        }
    }
}

impl Drop for AcquireFence {
    fn drop(&mut self) {
        self.close_fd();
    }
}

/// Poll `fd` for readiness, retrying on `EINTR`.
///
/// An unpollable descriptor is reported as signalled so a broken fence can
/// never stall scanout indefinitely.
pub(crate) fn wait_raw(fd: RawFd, timeout: Duration) -> bool {
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return false,
            Ok(_) => {
                return fds[0].revents().map_or(false, |r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("fence: poll on fd {} failed: {}", fd, e);
                return true;
            }
        }
    }
}
