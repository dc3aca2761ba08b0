// =============================================================================
// GPU RESOURCE STATE TRACKER
// =============================================================================
//
// Per-subresource usage-state tracking with automatic transition barriers, plus the
// frame-pacing layer that keeps GPU objects alive until the fence says they are safe
// to destroy.
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  DeviceSession (one per device, rebuilt on device loss)         │
// │    ├── TrackerRegistry ── ResourceStateTracker ── lock counts   │
// │    ├── BarrierBatch    ── one barrier call per commit           │
// │    ├── CommandListRing ── N+1 slots, reset only when reclaimed  │
// │    └── ReleaseQueue    ── destroyed when their frame completes  │
// └─────────────────────────────────────────────────────────────────┘
//
// Backends: `backend` (Vulkan via ash) and `sim` (no GPU, records what happened).

pub mod backend;
pub mod barrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod resource;
pub mod sim;
pub mod state;
pub mod upload;

pub use barrier::{Barrier, BarrierBatch, BarrierSubresources, CommandRecorder};
pub use config::Config;
pub use error::{is_device_lost, AllocationError, DeviceError, OperationError, ScopeOutOfRange, StateConflict, StateError};
pub use frame::DeviceSession;
pub use resource::{ResourceDesc, ResourceId, ResourceKind};
pub use state::{ResourceStateLock, ResourceStateTracker, Scope, Subresource, SubresourceLayout, UsageState, ViewDesc};
pub use upload::{UploadAllocation, UploadRing};
