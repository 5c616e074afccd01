//! Bounded, pipelined handoff between a frame producer and a display.
//!
//! A compositor prepares layer stacks; a single display consumer performs
//! the actual flip. [`DisplayQueue`] sits between them: it owns the lifetime
//! of in-flight frames, arbitrates between newly produced frames and
//! in-progress scanout, drops frames that become redundant, and keeps
//! producer and consumer synchronised around acquire fences and buffer
//! references.
//!
//! The queue is a library, not a process. Its boundary is five contracts:
//! the producer API on [`DisplayQueue`], the [`DisplayBackend`] the caller
//! supplies, the [`BufferManager`] references are acquired through, fence
//! descriptor ownership ([`fence`]), and layer snapshotting ([`layer`]).

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod layer;
pub mod queue;
pub mod sequence;
pub mod testing;

pub use backend::DisplayBackend;
pub use buffer::{AcquiredBuffer, BufferHandle, BufferManager, BufferUsage};
pub use config::{QueueConfig, FRAME_POOL_COUNT};
pub use error::QueueError;
pub use fence::{AcquireFence, FenceError, FenceRef};
pub use layer::{Layer, ReleaseHandler, ReleaseReturn};
pub use queue::{
    BehaviourFlags, DisplayFrame, DisplayQueue, FrameConfig, FrameLayer, QueueEvent, QueueStats,
};
pub use sequence::FrameId;
