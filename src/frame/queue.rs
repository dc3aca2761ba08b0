// Device-side collaborators
//
// The frame driver only needs a handful of things from the graphics API: a queue that
// can execute recorded work and signal a fence, recording allocators that can be reset
// and closed, and fences it can poll or block on. Anything else that recycles memory
// per frame hooks in as a FrameListener.

use super::fence::Fence;
use crate::barrier::CommandRecorder;
use crate::error::DeviceError;

/// One reusable recording context (command pool + command list).
pub trait CommandAllocator: CommandRecorder {
    /// Throw away previous contents and begin recording. Only valid once the GPU is
    /// done with everything recorded before.
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// Finish recording so the work can be executed.
    fn close(&mut self) -> Result<(), DeviceError>;
}

pub trait CommandQueue {
    type Allocator: CommandAllocator;
    type Fence: Fence;

    fn create_fence(&self) -> Result<Self::Fence, DeviceError>;

    fn create_allocator(&self) -> Result<Self::Allocator, DeviceError>;

    /// Submit closed work for execution.
    fn execute(&self, allocator: &mut Self::Allocator) -> Result<(), DeviceError>;

    /// Ask the queue to set `fence` to `value` once all prior work completes.
    fn signal(&self, fence: &Self::Fence, value: u64) -> Result<(), DeviceError>;
}

/// A pooled allocator that recycles its own regions by fence value.
pub trait FrameListener: Send {
    /// `completed` frames are done on the GPU; `submitted` is the last value signaled.
    fn on_reclaim(&mut self, completed: u64, submitted: u64);
}
