// Vulkan backend
//
// Headless device, timeline-semaphore fence, per-slot command pools with barrier
// lowering, and allocator-backed images / buffers for the tracker to look after.

pub mod commands;
pub mod device;
pub mod resources;
pub mod sync;

pub use commands::{VulkanCommandAllocator, VulkanQueue};
pub use device::VulkanDevice;
pub use resources::{UploadHeap, VulkanBuffer, VulkanImage};
pub use sync::TimelineFence;
