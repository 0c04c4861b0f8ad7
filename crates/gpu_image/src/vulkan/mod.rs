//! Vulkan backend
//!
//! [`VulkanContext`] owns the instance and device; [`VulkanBackend`] implements
//! [`crate::backend::DeviceBackend`] on top of it with ash.

mod backend;
pub mod context;

pub use backend::VulkanBackend;
pub use context::{DeviceExtensions, LogicalDevice, PhysicalDeviceInfo, VulkanContext, VulkanInstance};

use crate::config::ImageConfig;
use crate::device::{DeviceCapabilities, GpuDevice};
use crate::error::ImageResult;
use std::sync::Arc;

/// Open a headless device and wrap it for image management
///
/// Features the device lacks, or that `config` disables, are masked out of the
/// capability snapshot.
pub fn create_device(config: &ImageConfig) -> ImageResult<GpuDevice> {
    let context = VulkanContext::new(config)?;
    let capabilities = DeviceCapabilities::new(context.available_features(), config);
    let backend = Arc::new(VulkanBackend::new(context));
    Ok(GpuDevice::new(backend, capabilities))
}
