//! Buffer-manager boundary.
//!
//! The queue never allocates buffers. While a layer snapshot sits in the
//! queue it holds a reference acquired through the caller-supplied manager,
//! with the display usage hint applied; resetting the snapshot drops the
//! reference.

use std::fmt::Debug;
use std::sync::Arc;

/// Opaque native buffer handle, as passed around by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Usage hint applied to a buffer while the queue holds a reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Buffer is queued for (or on) the display.
    Display,
    /// Buffer is owned by the composition engine.
    Composition,
}

/// A strong reference to a native buffer, held for the lifetime of a queued
/// layer snapshot.
pub trait AcquiredBuffer: Send + Sync + Debug {}

/// The buffer manager the queue acquires and releases references through.
pub trait BufferManager: Send + Sync {
    /// Take a strong reference on `handle`.
    fn acquire_buffer(&self, handle: BufferHandle) -> Arc<dyn AcquiredBuffer>;

    /// Apply a usage hint to `handle`.
    fn set_buffer_usage(&self, handle: BufferHandle, usage: BufferUsage);

    /// Consistency check between an acquired reference and the handle it was
    /// acquired from. Only called in debug builds; the default does nothing.
    fn validate(&self, _acquired: &Arc<dyn AcquiredBuffer>, _handle: BufferHandle, _device_id: u64) {
    }
}
