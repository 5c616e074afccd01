//! Pool frames, their layer snapshots, and the forms work items take when
//! handed to the display.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::trace;

use crate::buffer::{AcquiredBuffer, BufferHandle, BufferManager, BufferUsage};
use crate::config::MIN_LAYER_ALLOC;
use crate::error::QueueError;
use crate::fence::AcquireFence;
use crate::layer::{Layer, LayerSnapshot};
use crate::sequence::FrameId;

/// Per-frame display configuration captured at enqueue.
///
/// A requested timing change is applied by the display once frames composed
/// against it arrive, so every frame names the timing it was composed for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub timing_index: u32,
}

/// Snapshot of one producer layer at the moment of enqueue.
///
/// Owns a duplicated acquire fence and a strong buffer reference for as long
/// as the snapshot is set; both are dropped on reset. The snapshot shares no
/// mutable state with the producer's layer.
#[derive(Debug, Default)]
pub struct FrameLayer {
    snapshot: LayerSnapshot,
    acquire: Option<AcquireFence>,
    buffer: Option<Arc<dyn AcquiredBuffer>>,
    set: bool,
}

impl FrameLayer {
    pub(crate) fn set(
        &mut self,
        layer: &Layer,
        buffers: &dyn BufferManager,
    ) -> Result<(), crate::fence::FenceError> {
        debug_assert!(!self.set);
        debug_assert!(self.buffer.is_none());
        debug_assert!(self.acquire.is_none());

        let snapshot = layer.snapshot();
        let acquire = layer.acquire_fence().dup()?;
        trace!(
            "fence: layer fb{} acquire {:?}",
            snapshot.device_id,
            acquire.as_ref().map(AcquireFence::raw_fd)
        );

        if let Some(handle) = snapshot.handle {
            let acquired = buffers.acquire_buffer(handle);
            #[cfg(debug_assertions)]
            {
                debug_assert!(snapshot.device_id != 0 || snapshot.disabled);
                buffers.validate(&acquired, handle, snapshot.device_id);
            }
            buffers.set_buffer_usage(handle, BufferUsage::Display);
            self.buffer = Some(acquired);
        }

        self.snapshot = snapshot;
        self.acquire = acquire;
        self.set = true;
        Ok(())
    }

    /// Release everything the snapshot owns.
    ///
    /// `cancel` distinguishes "release naturally via the timeline advance"
    /// (false) from "explicitly drop our reference" (true, used when the
    /// frame is dropped instead of flipped).
    pub(crate) fn reset(&mut self, cancel: bool) {
        trace!(
            "fence: reset layer fb{} acquire {:?} cancel {}",
            self.snapshot.device_id,
            self.acquire.as_ref().map(AcquireFence::raw_fd),
            cancel
        );
        if let Some(fence) = self.acquire.take() {
            fence.close();
        }
        if cancel {
            self.snapshot.cancel_release();
        }
        self.snapshot = LayerSnapshot::default();
        self.buffer = None;
        self.set = false;
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.snapshot.handle
    }

    pub fn device_id(&self) -> u64 {
        self.snapshot.device_id
    }

    /// A layer that contributes nothing to scanout.
    pub fn is_disabled(&self) -> bool {
        self.snapshot.disabled || self.snapshot.device_id == 0
    }

    /// The owned acquire fence descriptor, if the producer supplied one.
    pub fn acquire_fence_fd(&self) -> Option<RawFd> {
        self.acquire.as_ref().map(AcquireFence::raw_fd)
    }

    /// Zero-timeout poll; disabled layers are always complete.
    pub fn is_rendering_complete(&self) -> bool {
        if self.snapshot.disabled {
            return true;
        }
        self.acquire.as_ref().map_or(true, AcquireFence::is_signalled)
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        self.set
    }
}

/// One slot of the frame pool.
///
/// The layer storage persists across reuse so steady-state enqueue does not
/// reallocate.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    frame_id: FrameId,
    z_order: u32,
    config: FrameConfig,
    layers: Vec<FrameLayer>,
    locked_for_display: bool,
    valid: bool,
}

impl Frame {
    /// Snapshot `stack` into this slot.
    ///
    /// On error the partially built snapshot is left for the caller to
    /// reset; nothing in the pool accounting has changed.
    pub(crate) fn set(
        &mut self,
        stack: &[Layer],
        z_order: u32,
        id: FrameId,
        config: FrameConfig,
        buffers: &dyn BufferManager,
    ) -> Result<(), QueueError> {
        debug_assert!(!self.locked_for_display);
        debug_assert!(self.layers.is_empty());

        self.frame_id = id;
        self.z_order = z_order;
        self.config = config;
        self.valid = true;

        if self.layers.capacity() < stack.len() {
            self.layers.reserve(stack.len().max(MIN_LAYER_ALLOC));
        }
        trace!("frame {}: snapshot x{} layers", id, stack.len());
        for (index, layer) in stack.iter().enumerate() {
            let mut frame_layer = FrameLayer::default();
            frame_layer
                .set(layer, buffers)
                .map_err(|source| QueueError::LayerSnapshot {
                    layer: index,
                    source,
                })?;
            self.layers.push(frame_layer);
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self, cancel: bool) {
        self.locked_for_display = false;
        self.valid = false;
        for layer in &mut self.layers {
            layer.reset(cancel);
        }
        self.layers.clear();
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub(crate) fn is_locked_for_display(&self) -> bool {
        self.locked_for_display
    }

    pub(crate) fn set_locked_for_display(&mut self, locked: bool) {
        self.locked_for_display = locked;
    }

    pub(crate) fn is_rendering_complete(&self) -> bool {
        self.layers.iter().all(FrameLayer::is_rendering_complete)
    }

    /// Acquire descriptors of enabled layers still worth waiting on.
    ///
    /// The descriptors stay owned by this slot; callers may only poll them
    /// while the frame is locked for display.
    pub(crate) fn pending_acquire_fds(&self) -> Vec<RawFd> {
        self.layers
            .iter()
            .filter(|l| !l.is_disabled())
            .filter_map(FrameLayer::acquire_fence_fd)
            .collect()
    }

    /// Move the snapshot out for handing to the display.
    pub(crate) fn take_for_display(&mut self, slot: u32) -> DisplayFrame {
        DisplayFrame {
            slot,
            frame_id: self.frame_id,
            z_order: self.z_order,
            config: self.config,
            valid: self.valid,
            layers: std::mem::take(&mut self.layers),
        }
    }

    /// Return the (already reset) layer storage after release, preserving
    /// its allocation for the next use of this slot.
    pub(crate) fn restore_layers(&mut self, layers: Vec<FrameLayer>) {
        debug_assert!(self.layers.is_empty());
        self.layers = layers;
    }
}

/// A frame exclusively owned by the display between consume and release.
#[derive(Debug)]
pub struct DisplayFrame {
    pub(crate) slot: u32,
    frame_id: FrameId,
    z_order: u32,
    config: FrameConfig,
    valid: bool,
    pub(crate) layers: Vec<FrameLayer>,
}

impl DisplayFrame {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    pub fn config(&self) -> FrameConfig {
        self.config
    }

    /// False once the producer has flushed past this frame; the display may
    /// skip the flip.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn layers(&self) -> &[FrameLayer] {
        &self.layers
    }
}

/// A non-frame work item delivered to the display in queue order.
///
/// `effective_frame` carries the id the issued-frame marker advances to once
/// the event is consumed: the last frame queued before it, plus any frames
/// dropped since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEvent {
    pub id: u32,
    pub effective_frame: FrameId,
}
