// Frame pacing
//
// Fence bookkeeping, the command-list ring, deferred destruction and the session
// that drives them once per frame.

pub mod fence;
pub mod queue;
pub mod release;
pub mod ring;
pub mod session;

pub use fence::{Fence, FenceCounters};
pub use queue::{CommandAllocator, CommandQueue, FrameListener};
pub use release::{ReleaseQueue, Retired};
pub use ring::{CommandListRing, FrameSlot, SlotState};
pub use session::DeviceSession;
