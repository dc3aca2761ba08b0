// GPU resources for tracked images and buffers
//
// Memory comes from gpu-allocator instead of one vkAllocateMemory per resource.
// Every object frees its allocation and destroys its handle on Drop, so retiring one
// is just handing it to DeviceSession::destroy_resource.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::AllocationError;
use crate::resource::ResourceDesc;
use crate::state::SubresourceLayout;
use crate::upload::{UploadAllocation, UploadRing};

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, AllocationError> {
    let mut guard = device.allocator();
    let allocator = guard
        .as_mut()
        .ok_or_else(|| AllocationError::Backend("allocator already destroyed".to_string()))?;

    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| AllocationError::Backend(e.to_string()))
}

fn free(device: &VulkanDevice, allocation: Allocation) {
    if let Some(allocator) = device.allocator().as_mut() {
        if let Err(e) = allocator.free(allocation) {
            log::warn!("Failed to free allocation: {}", e);
        }
    }
}

/// Number of depth/stencil planes in `format`, `None` for color formats.
fn depth_planes(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => Some(2),
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => Some(1),
        _ => None,
    }
}

/// Tracker description for an image of `format`. Depth formats get one plane per
/// aspect whatever planes the caller asked for.
fn image_desc(name: &str, format: vk::Format, layout: SubresourceLayout, raw: u64) -> ResourceDesc {
    match depth_planes(format) {
        Some(2) => ResourceDesc::depth_stencil(name, layout.mip_levels, layout.array_size, raw),
        Some(_) => ResourceDesc::depth(name, layout.mip_levels, layout.array_size, raw),
        None => ResourceDesc::texture(name, layout, raw),
    }
}

/// 2D image (optionally mipped / layered) with device-local memory
pub struct VulkanImage {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    pub format: vk::Format,
    allocation: Option<Allocation>,
    desc: ResourceDesc,
}

impl VulkanImage {
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent2D,
        layout: SubresourceLayout,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(layout.mip_levels)
            .array_layers(layout.array_size)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match allocate(&device, name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        if let Err(e) = unsafe { device.device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            free(&device, allocation);
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        let desc = image_desc(name, format, layout, image.as_raw());
        log::debug!(
            "Created image '{}' {}x{} {:?} ({} subresources)",
            name,
            extent.width,
            extent.height,
            format,
            desc.layout.count()
        );

        Ok(Self {
            device,
            image,
            format,
            allocation: Some(allocation),
            desc,
        })
    }

    /// What the state tracker needs to know about this image
    pub fn desc(&self) -> ResourceDesc {
        self.desc.clone()
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_image(self.image, None);
        }
    }
}

/// Buffer with allocator-managed memory
pub struct VulkanBuffer {
    device: Arc<VulkanDevice>,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    name: String,
}

impl VulkanBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = match allocate(&device, name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        if let Err(e) =
            unsafe { device.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            free(&device, allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Self {
            device,
            buffer,
            size,
            allocation: Some(allocation),
            name: name.to_string(),
        })
    }

    pub fn desc(&self) -> ResourceDesc {
        ResourceDesc::buffer(self.name.clone(), self.buffer.as_raw())
    }

    /// Copy `data` to `offset`. Only valid for host-visible buffers.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocationError> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or_else(|| AllocationError::Backend(format!("buffer '{}' is not host visible", self.name)))?;

        if offset + data.len() as u64 > self.size {
            return Err(AllocationError::TooLarge {
                requested: offset + data.len() as u64,
                capacity: self.size,
            });
        }

        unsafe {
            let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Host-visible staging buffer carved up by an UploadRing
///
/// The ring decides where bytes go and when they may be overwritten; this only
/// owns the memory. Register `ring()` with the session so space comes back as
/// frames complete.
pub struct UploadHeap {
    buffer: VulkanBuffer,
    ring: UploadRing,
}

impl UploadHeap {
    pub fn new(device: Arc<VulkanDevice>, size: u64, alignment: u64) -> Result<Self> {
        let buffer = VulkanBuffer::new(
            device,
            "upload-heap",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        Ok(Self {
            buffer,
            ring: UploadRing::new(size, alignment),
        })
    }

    pub fn ring(&self) -> UploadRing {
        self.ring.clone()
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    /// Reserve space in the current frame and copy `data` into it
    pub fn write(&self, data: &[u8]) -> Result<UploadAllocation, AllocationError> {
        let allocation = self.ring.allocate(data.len() as u64)?;
        self.buffer.write(allocation.offset, data)?;
        Ok(allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use gpu_allocator::vulkan::AllocatorCreateDesc;

    #[test]
    fn test_depth_formats_by_aspect() {
        for format in [
            vk::Format::D16_UNORM_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::D32_SFLOAT_S8_UINT,
        ] {
            assert_eq!(depth_planes(format), Some(2), "{:?}", format);
        }
        for format in [
            vk::Format::D16_UNORM,
            vk::Format::X8_D24_UNORM_PACK32,
            vk::Format::D32_SFLOAT,
        ] {
            assert_eq!(depth_planes(format), Some(1), "{:?}", format);
        }
        assert_eq!(depth_planes(vk::Format::R16G16B16A16_SFLOAT), None);
    }

    #[test]
    fn test_image_desc_follows_format() {
        let layout = SubresourceLayout::new(3, 2, 1);

        let depth = image_desc("shadow", vk::Format::D32_SFLOAT, layout, 1);
        assert_eq!(depth.kind, ResourceKind::Texture { depth_stencil: true });
        assert_eq!(depth.layout, SubresourceLayout::new(3, 2, 1));

        let packed = image_desc("depth", vk::Format::D16_UNORM_S8_UINT, layout, 2);
        assert_eq!(packed.layout.plane_count, 2);

        let color = image_desc("hdr", vk::Format::R16G16B16A16_SFLOAT, layout, 3);
        assert_eq!(color.kind, ResourceKind::Texture { depth_stencil: false });
    }

    #[test]
    fn test_allocator_takes_our_ash_types() {
        // Fails to build if gpu-allocator pulls in a different ash than the device
        fn create_desc(
            instance: &ash::Instance,
            device: &ash::Device,
            physical_device: vk::PhysicalDevice,
        ) -> AllocatorCreateDesc {
            AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            }
        }
        let _ = create_desc;

        let requirements = vk::MemoryRequirements {
            size: 256,
            alignment: 64,
            memory_type_bits: 1,
        };
        let desc = AllocationCreateDesc {
            name: "staging",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(vk::Buffer::null()),
        };
        assert_eq!(desc.requirements.size, 256);
    }
}
