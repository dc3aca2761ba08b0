// Error channels
//
// Three kinds of failure, kept apart on purpose:
// - StateError: a logic error in how a frame was recorded (a conflicting lock, or a
//   scope naming subresources the resource doesn't have). Aborts one operation.
// - AllocationError: a pooled allocator ran dry. Aborts one operation.
// - DeviceError: the device itself failed. Only the frame driver may handle it, by
//   tearing everything down.

use crate::resource::ResourceId;
use crate::state::{Scope, Subresource, SubresourceLayout, UsageState};

/// A subresource is locked in one state and someone asked for another.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "state conflict on resource '{resource_name}' ({resource}) subresource {index} ({subresource}): \
     locked in {current}, requested {requested}"
)]
pub struct StateConflict {
    pub resource: ResourceId,
    pub resource_name: String,
    pub index: u32,
    pub subresource: Subresource,
    pub current: UsageState,
    pub requested: UsageState,
}

/// A scope that resolves to nothing, or reaches past the end of the resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "scope {scope:?} does not fit resource '{resource_name}' ({resource}) with {} mips, {} slices, {} planes",
    layout.mip_levels,
    layout.array_size,
    layout.plane_count
)]
pub struct ScopeOutOfRange {
    pub resource: ResourceId,
    pub resource_name: String,
    pub scope: Scope,
    pub layout: SubresourceLayout,
}

/// Why EnterState refused. Either way nothing was changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Conflict(#[from] StateConflict),
    #[error(transparent)]
    OutOfRange(#[from] ScopeOutOfRange),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("allocation of {requested} bytes can never fit in a {capacity} byte ring")]
    TooLarge { requested: u64, capacity: u64 },
    #[error("ring exhausted: {requested} bytes requested, {available} available until the GPU catches up")]
    OutOfSpace { requested: u64, available: u64 },
    #[error("memory allocator failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("graphics device lost")]
    Lost,
    #[error("graphics backend call failed: {0}")]
    Backend(String),
}

impl DeviceError {
    pub fn is_lost(&self) -> bool {
        matches!(self, DeviceError::Lost)
    }
}

/// Everything one rendering operation can fail with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// True if `err` (anywhere in its chain) is a lost device.
pub fn is_device_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<DeviceError>(), Some(DeviceError::Lost))
            || matches!(
                cause.downcast_ref::<OperationError>(),
                Some(OperationError::Device(DeviceError::Lost))
            )
    })
}
