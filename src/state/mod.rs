// Resource state tracking
//
// Per-subresource usage states, the trackers that own them, the RAII locks that keep
// them from changing underneath a pass, and the registry that maps resources to
// trackers.

pub mod lock;
pub mod registry;
pub mod subresource;
pub mod tracker;
pub mod usage;
pub mod view;

pub use lock::ResourceStateLock;
pub use registry::TrackerRegistry;
pub use subresource::{Subresource, SubresourceLayout, SubresourceRange, SubresourceState, SubresourceTable};
pub use tracker::ResourceStateTracker;
pub use usage::UsageState;
pub use view::{Scope, ViewDesc, REMAINING};
