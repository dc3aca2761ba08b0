// Command recording and submission
//
// One command pool + primary command buffer per ring slot. Resetting the pool is the
// cheapest way to recycle everything a frame recorded, and is only legal once the
// fence says the GPU is done with it - which is exactly what the ring guarantees.
//
// Barriers arrive as UsageState transitions and are lowered here to synchronization2
// image / buffer barriers, all in one vkCmdPipelineBarrier2 call per commit.

use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use super::sync::{device_error, TimelineFence};
use super::VulkanDevice;
use crate::barrier::{Barrier, CommandRecorder};
use crate::error::DeviceError;
use crate::frame::{CommandAllocator, CommandQueue};
use crate::resource::ResourceKind;
use crate::state::{SubresourceRange, UsageState};

/// Vulkan view of a usage state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkUsage {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl VkUsage {
    const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }
}

const DEPTH_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
);

/// Access bits that make memory visible to later work
const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

fn lower_bit(bit: UsageState) -> VkUsage {
    use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};

    let table = [
        (
            UsageState::VERTEX_AND_CONSTANT_BUFFER,
            VkUsage::new(
                S::VERTEX_INPUT | S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
                A::VERTEX_ATTRIBUTE_READ | A::UNIFORM_READ,
                L::UNDEFINED,
            ),
        ),
        (UsageState::INDEX_BUFFER, VkUsage::new(S::INDEX_INPUT, A::INDEX_READ, L::UNDEFINED)),
        (
            UsageState::RENDER_TARGET,
            VkUsage::new(
                S::COLOR_ATTACHMENT_OUTPUT,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
                L::COLOR_ATTACHMENT_OPTIMAL,
            ),
        ),
        (
            UsageState::UNORDERED_ACCESS,
            VkUsage::new(
                S::COMPUTE_SHADER | S::FRAGMENT_SHADER,
                A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
                L::GENERAL,
            ),
        ),
        (
            UsageState::DEPTH_WRITE,
            VkUsage::new(
                DEPTH_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
        ),
        (
            UsageState::DEPTH_READ,
            VkUsage::new(DEPTH_TESTS, A::DEPTH_STENCIL_ATTACHMENT_READ, L::DEPTH_STENCIL_READ_ONLY_OPTIMAL),
        ),
        (
            UsageState::NON_PIXEL_SHADER_RESOURCE,
            VkUsage::new(
                S::VERTEX_SHADER | S::COMPUTE_SHADER,
                A::SHADER_SAMPLED_READ,
                L::SHADER_READ_ONLY_OPTIMAL,
            ),
        ),
        (
            UsageState::PIXEL_SHADER_RESOURCE,
            VkUsage::new(S::FRAGMENT_SHADER, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL),
        ),
        (
            UsageState::INDIRECT_ARGUMENT,
            VkUsage::new(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::UNDEFINED),
        ),
        (UsageState::COPY_DEST, VkUsage::new(S::COPY, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL)),
        (UsageState::COPY_SOURCE, VkUsage::new(S::COPY, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL)),
        (UsageState::PRESENT, VkUsage::new(S::NONE, A::NONE, L::PRESENT_SRC_KHR)),
    ];

    table
        .into_iter()
        .find_map(|(flag, usage)| (flag == bit).then_some(usage))
        .unwrap_or_else(|| unreachable!("no lowering for {}", bit))
}

/// Stage, access and layout for a (possibly combined) usage state.
///
/// COMMON as a destination is GENERAL with full memory access. The layout of a
/// combination is the shared layout of its bits, the depth read-only layout if depth
/// is being read, and GENERAL otherwise.
pub fn lower_state(state: UsageState) -> VkUsage {
    if state.is_empty() {
        return VkUsage::new(
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::ImageLayout::GENERAL,
        );
    }

    let mut stage = vk::PipelineStageFlags2::NONE;
    let mut access = vk::AccessFlags2::NONE;
    let mut layout = None;
    let mut mixed = false;
    for bit in state.iter() {
        let usage = lower_bit(bit);
        stage |= usage.stage;
        access |= usage.access;
        if usage.layout == vk::ImageLayout::UNDEFINED {
            continue;
        }
        match layout {
            None => layout = Some(usage.layout),
            Some(current) if current != usage.layout => mixed = true,
            Some(_) => {}
        }
    }

    let layout = if !mixed {
        layout.unwrap_or(vk::ImageLayout::GENERAL)
    } else if state.contains(UsageState::DEPTH_READ) && state.is_read_only() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    };
    VkUsage::new(stage, access, layout)
}

/// Source half of a transition. Only a discarding barrier (first use of a fresh
/// resource) may start from UNDEFINED; a COMMON source that was written keeps GENERAL.
fn lower_source(state: UsageState, discard: bool) -> VkUsage {
    let mut usage = lower_state(state);
    usage.access &= WRITE_ACCESS;
    if discard {
        usage.layout = vk::ImageLayout::UNDEFINED;
    }
    usage
}

fn aspect_for(kind: ResourceKind, range: &SubresourceRange) -> vk::ImageAspectFlags {
    match kind {
        ResourceKind::Texture { depth_stencil: true } => {
            let mut aspect = vk::ImageAspectFlags::empty();
            let planes = range.base_plane..range.base_plane + range.plane_count;
            if planes.contains(&0) {
                aspect |= vk::ImageAspectFlags::DEPTH;
            }
            if planes.contains(&1) {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
            aspect
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn image_barrier(barrier: &Barrier) -> vk::ImageMemoryBarrier2<'static> {
    let src = lower_source(barrier.before, barrier.discard);
    let dst = lower_state(barrier.after);
    let range = barrier.range();

    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .old_layout(src.layout)
        .new_layout(dst.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(vk::Image::from_raw(barrier.raw))
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for(barrier.kind, &range),
            base_mip_level: range.base_mip,
            level_count: range.mip_count,
            base_array_layer: range.base_array,
            layer_count: range.array_count,
        })
}

fn buffer_barrier(barrier: &Barrier) -> vk::BufferMemoryBarrier2<'static> {
    let src = lower_source(barrier.before, barrier.discard);
    let dst = lower_state(barrier.after);

    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(vk::Buffer::from_raw(barrier.raw))
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Command pool + primary command buffer for one ring slot
pub struct VulkanCommandAllocator {
    device: Arc<VulkanDevice>,
    pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
}

impl VulkanCommandAllocator {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self, DeviceError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            // TRANSIENT: everything is re-recorded every time the slot comes around
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }.map_err(device_error)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(device_error(e));
            }
        };

        Ok(Self {
            device,
            pool,
            command_buffer,
        })
    }
}

impl CommandRecorder for VulkanCommandAllocator {
    fn resource_barriers(&mut self, barriers: &[Barrier]) {
        let mut images = Vec::new();
        let mut buffers = Vec::new();
        for barrier in barriers {
            match barrier.kind {
                ResourceKind::Buffer => buffers.push(buffer_barrier(barrier)),
                ResourceKind::Texture { .. } => images.push(image_barrier(barrier)),
            }
        }

        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(&images)
            .buffer_memory_barriers(&buffers);
        unsafe {
            self.device.device.cmd_pipeline_barrier2(self.command_buffer, &dependency);
        }
    }
}

impl CommandAllocator for VulkanCommandAllocator {
    fn reset(&mut self) -> Result<(), DeviceError> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(device_error)?;
            self.device
                .device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(device_error)
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        unsafe { self.device.device.end_command_buffer(self.command_buffer) }.map_err(device_error)
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        unsafe {
            // Frees the command buffer with it
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// The graphics queue, as the frame driver sees it
pub struct VulkanQueue {
    device: Arc<VulkanDevice>,
}

impl VulkanQueue {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

impl CommandQueue for VulkanQueue {
    type Allocator = VulkanCommandAllocator;
    type Fence = TimelineFence;

    fn create_fence(&self) -> Result<TimelineFence, DeviceError> {
        TimelineFence::new(self.device.clone())
    }

    fn create_allocator(&self) -> Result<VulkanCommandAllocator, DeviceError> {
        VulkanCommandAllocator::new(self.device.clone())
    }

    fn execute(&self, allocator: &mut VulkanCommandAllocator) -> Result<(), DeviceError> {
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(allocator.command_buffer)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);

        unsafe {
            self.device
                .device
                .queue_submit2(self.device.graphics_queue, &[submit], vk::Fence::null())
        }
        .map_err(device_error)
    }

    fn signal(&self, fence: &TimelineFence, value: u64) -> Result<(), DeviceError> {
        // Queue order: fires once everything submitted before it has completed
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(fence.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signals);

        unsafe {
            self.device
                .device
                .queue_submit2(self.device.graphics_queue, &[submit], vk::Fence::null())
        }
        .map_err(device_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierSubresources;
    use crate::resource::{ResourceDesc, ResourceId};
    use crate::state::Subresource;

    #[test]
    fn test_lower_single_states() {
        let rt = lower_state(UsageState::RENDER_TARGET);
        assert_eq!(rt.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(rt.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));

        let srv = lower_state(UsageState::PIXEL_SHADER_RESOURCE);
        assert_eq!(srv.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(srv.stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn test_lower_combined_states() {
        let both = lower_state(UsageState::ALL_SHADER_RESOURCE);
        assert_eq!(both.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(both.stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));

        let depth_sampled = lower_state(UsageState::DEPTH_READ | UsageState::PIXEL_SHADER_RESOURCE);
        assert_eq!(depth_sampled.layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);

        let copy_both = lower_state(UsageState::COPY_SOURCE | UsageState::COPY_DEST);
        assert_eq!(copy_both.layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_only_fresh_common_discards() {
        let src = lower_source(UsageState::COMMON, true);
        assert_eq!(src.layout, vk::ImageLayout::UNDEFINED);
        let dst = lower_state(UsageState::COMMON);
        assert_eq!(dst.layout, vk::ImageLayout::GENERAL);

        // Written, parked in COMMON, now sampled: the layout must be carried over
        let src = lower_source(UsageState::COMMON, false);
        assert_eq!(src.layout, vk::ImageLayout::GENERAL);
        assert!(src.access.contains(vk::AccessFlags2::MEMORY_WRITE));
    }

    #[test]
    fn test_common_round_trip_lowers_to_general() {
        let desc = ResourceDesc::texture("history", crate::state::SubresourceLayout::new(1, 1, 1), 0x20);
        let to_common = Barrier::transition(
            ResourceId(3),
            &desc,
            BarrierSubresources::All,
            UsageState::RENDER_TARGET,
            UsageState::COMMON,
        );
        let to_read = Barrier::transition(
            ResourceId(3),
            &desc,
            BarrierSubresources::All,
            UsageState::COMMON,
            UsageState::PIXEL_SHADER_RESOURCE,
        );
        let first = image_barrier(&to_common);
        let second = image_barrier(&to_read);
        assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(second.old_layout, first.new_layout);
        assert_eq!(second.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_source_keeps_only_writes() {
        let src = lower_source(UsageState::COPY_SOURCE, false);
        assert_eq!(src.access, vk::AccessFlags2::NONE);
        let src = lower_source(UsageState::UNORDERED_ACCESS, false);
        assert_eq!(src.access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
    }

    #[test]
    fn test_stencil_plane_aspect() {
        let desc = ResourceDesc::depth_stencil("depth", 1, 1, 0x10);
        let stencil = Barrier::transition(
            ResourceId(1),
            &desc,
            BarrierSubresources::Index(desc.layout.index_of(Subresource::new(0, 0, 1))),
            UsageState::DEPTH_WRITE,
            UsageState::DEPTH_READ,
        );
        let lowered = image_barrier(&stencil);
        assert_eq!(lowered.subresource_range.aspect_mask, vk::ImageAspectFlags::STENCIL);

        let all = Barrier::transition(
            ResourceId(1),
            &desc,
            BarrierSubresources::All,
            UsageState::COMMON,
            UsageState::DEPTH_WRITE,
        )
        .discarding(true);
        let lowered = image_barrier(&all);
        assert_eq!(
            lowered.subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(lowered.old_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_depth_only_aspect() {
        let desc = ResourceDesc::depth("shadow-map", 1, 4, 0x11);
        let barrier = Barrier::transition(
            ResourceId(2),
            &desc,
            BarrierSubresources::All,
            UsageState::DEPTH_WRITE,
            UsageState::PIXEL_SHADER_RESOURCE,
        );
        let lowered = image_barrier(&barrier);
        assert_eq!(lowered.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(lowered.subresource_range.layer_count, 4);
    }
}
