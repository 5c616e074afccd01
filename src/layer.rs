//! Producer layers and their queued snapshots.
//!
//! A [`Layer`] is what the compositor submits in a layer stack. The queue
//! never keeps a reference to it; enqueueing takes a value snapshot that is
//! fully disjoint from the producer's copy, so composition state can change
//! freely while the frame waits to flip.

use std::sync::Arc;

use crate::buffer::BufferHandle;
use crate::fence::FenceRef;

/// Receives out-of-order release notification for a composition buffer.
///
/// Cancelling tells the owner the queue has dropped its reference without
/// flipping the buffer, so the buffer can be reused immediately.
pub trait ReleaseHandler: Send + Sync {
    fn cancel(&self);
}

impl std::fmt::Debug for dyn ReleaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReleaseHandler")
    }
}

/// Where buffer release should be reported for a layer.
#[derive(Default, Clone)]
pub enum ReleaseReturn {
    /// Release is implied by the display fence timeline advancing.
    #[default]
    Timeline,
    /// The producer expects a native release fence. Never retained by a
    /// snapshot: once queued, release is signalled via the timeline instead.
    Native,
    /// Composition buffer released out of order through an explicit handler.
    Composition(Arc<dyn ReleaseHandler>),
}

impl std::fmt::Debug for ReleaseReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeline => write!(f, "Timeline"),
            Self::Native => write!(f, "Native"),
            Self::Composition(_) => write!(f, "Composition"),
        }
    }
}

/// One layer of a submitted stack.
#[derive(Debug, Default, Clone)]
pub struct Layer {
    handle: Option<BufferHandle>,
    device_id: u64,
    disabled: bool,
    acquire: FenceRef,
    release: ReleaseReturn,
}

impl Layer {
    pub fn new(handle: BufferHandle, device_id: u64) -> Self {
        Self {
            handle: Some(handle),
            device_id,
            ..Self::default()
        }
    }

    /// A layer with no buffer; it contributes nothing to the frame.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn with_acquire_fence(mut self, fence: FenceRef) -> Self {
        self.acquire = fence;
        self
    }

    pub fn with_release_return(mut self, release: ReleaseReturn) -> Self {
        self.release = release;
        self
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn acquire_fence(&self) -> FenceRef {
        self.acquire
    }

    /// Value snapshot sharing nothing mutable with the producer copy.
    ///
    /// Native release returns are dropped here: once a frame is queued its
    /// release is signalled by advancing the display timeline, and the
    /// producer fence may not outlive the frame. Composition returns are
    /// retained to support out-of-order composition-buffer release.
    pub(crate) fn snapshot(&self) -> LayerSnapshot {
        let release = match &self.release {
            ReleaseReturn::Composition(handler) => Some(Arc::clone(handler)),
            ReleaseReturn::Timeline | ReleaseReturn::Native => None,
        };
        LayerSnapshot {
            handle: self.handle,
            device_id: self.device_id,
            disabled: self.disabled,
            release,
        }
    }
}

/// The queue-owned copy of a layer's identity.
#[derive(Debug, Default)]
pub(crate) struct LayerSnapshot {
    pub(crate) handle: Option<BufferHandle>,
    pub(crate) device_id: u64,
    pub(crate) disabled: bool,
    release: Option<Arc<dyn ReleaseHandler>>,
}

impl LayerSnapshot {
    /// Drop the queue's release reference, notifying the handler so the
    /// composition buffer can be reused without waiting for the timeline.
    pub(crate) fn cancel_release(&mut self) {
        if let Some(handler) = self.release.take() {
            handler.cancel();
        }
    }

    #[cfg(test)]
    fn has_release(&self) -> bool {
        self.release.is_some()
    }
}
