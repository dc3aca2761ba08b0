// Synchronization primitives
//
// The frame fence is a timeline semaphore: one monotonically increasing counter the
// queue signals once per frame and the CPU can poll or block on. Far simpler than a
// binary fence per frame slot, and it maps 1:1 onto fence values.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::DeviceError;
use crate::frame::Fence;

/// Map a Vulkan failure to the session's error channel
pub fn device_error(result: vk::Result) -> DeviceError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::Lost,
        other => DeviceError::Backend(format!("{:?}", other)),
    }
}

/// Timeline-semaphore fence
pub struct TimelineFence {
    device: Arc<VulkanDevice>,
    pub semaphore: vk::Semaphore,
}

impl TimelineFence {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self, DeviceError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }.map_err(device_error)?;

        Ok(Self { device, semaphore })
    }
}

impl Fence for TimelineFence {
    fn completed_value(&self) -> Result<u64, DeviceError> {
        unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }.map_err(device_error)
    }

    fn wait(&self, value: u64) -> Result<(), DeviceError> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        // Infinite timeout: a hang here is a lost device in all but name
        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(device_error)
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
