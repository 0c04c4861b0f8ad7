//! Headless Vulkan context
//!
//! Creates the instance, picks a physical device with a graphics queue and opens a
//! logical device with whichever dmabuf and external semaphore extensions it offers.
//! No surface is involved; presentation belongs to the caller.

use ash::extensions::ext::DebugUtils;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};

use crate::config::ImageConfig;
use crate::device::DeviceFeatures;
use crate::error::{ImageError, ImageResult};

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<DebugUtils>,
    debug_messenger: vk::DebugUtilsMessengerEXT,
}

impl VulkanInstance {
    /// Create a Vulkan 1.1 instance, with the validation layer when `enable_validation`
    pub fn new(app_name: &str, enable_validation: bool) -> ImageResult<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions beyond its presence
        let entry = unsafe { Entry::load() }
            .map_err(|e| ImageError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| ImageError::InitializationFailed(format!("Invalid application name {:?}", app_name)))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"gpu_image")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = Vec::new();
        let mut layers = Vec::new();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        // SAFETY: every pointer in `create_info` outlives the call
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| ImageError::api("vkCreateInstance", e))?;

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), messenger),
                Err(e) => {
                    log::warn!("Validation requested but no debug messenger: {}", e);
                    (None, vk::DebugUtilsMessengerEXT::null())
                }
            }
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> ImageResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        // SAFETY: the messenger is destroyed before the instance in `Drop`
        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| ImageError::api("vkCreateDebugUtilsMessengerEXT", e))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // SAFETY: all child objects are gone once the instance wrapper drops
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes valid callback data for the duration of the call
    let message = unsafe { CStr::from_ptr((*callback_data).p_message) }.to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Optional device extensions the image manager uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceExtensions {
    /// `VK_KHR_external_memory_fd`
    pub external_memory_fd: bool,
    /// `VK_EXT_external_memory_dma_buf`
    pub external_memory_dma_buf: bool,
    /// `VK_EXT_image_drm_format_modifier`
    pub image_drm_format_modifier: bool,
    /// `VK_KHR_image_format_list`, needed by the modifier extension before 1.2
    pub image_format_list: bool,
    /// `VK_KHR_external_semaphore_fd`
    pub external_semaphore_fd: bool,
    /// `samplerYcbcrConversion` device feature
    pub sampler_ycbcr_conversion: bool,
}

impl DeviceExtensions {
    fn query(instance: &Instance, device: vk::PhysicalDevice) -> ImageResult<Self> {
        // SAFETY: `device` was enumerated from `instance`
        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(|e| ImageError::api("vkEnumerateDeviceExtensionProperties", e))?;
        let has = |name: &CStr| {
            available.iter().any(|ext| {
                // SAFETY: extension names are NUL-terminated fixed arrays
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == name
            })
        };

        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut ycbcr);
        // SAFETY: the chained struct lives across the call
        unsafe { instance.get_physical_device_features2(device, &mut features) };

        Ok(Self {
            external_memory_fd: has(vk::KhrExternalMemoryFdFn::name()),
            external_memory_dma_buf: has(vk::ExtExternalMemoryDmaBufFn::name()),
            image_drm_format_modifier: has(vk::ExtImageDrmFormatModifierFn::name()),
            image_format_list: has(vk::KhrImageFormatListFn::name()),
            external_semaphore_fd: has(vk::KhrExternalSemaphoreFdFn::name()),
            sampler_ycbcr_conversion: ycbcr.sampler_ycbcr_conversion == vk::TRUE,
        })
    }

    /// Whether dmabufs can be imported and exported
    pub fn has_dmabuf(&self) -> bool {
        self.external_memory_fd
            && self.external_memory_dma_buf
            && self.image_drm_format_modifier
            && self.image_format_list
    }

    /// Device features these extensions make available
    pub fn features(&self) -> DeviceFeatures {
        let mut features = DeviceFeatures::empty();
        if self.has_dmabuf() {
            features |= DeviceFeatures::DMABUF;
        }
        if self.external_semaphore_fd {
            features |= DeviceFeatures::SEMAPHORE_IMPORT | DeviceFeatures::SEMAPHORE_EXPORT;
        }
        if self.sampler_ycbcr_conversion {
            features |= DeviceFeatures::YCBCR;
        }
        features
    }

    fn names(&self) -> Vec<*const std::ffi::c_char> {
        let mut names = Vec::new();
        if self.has_dmabuf() {
            names.push(vk::KhrExternalMemoryFdFn::name().as_ptr());
            names.push(vk::ExtExternalMemoryDmaBufFn::name().as_ptr());
            names.push(vk::ExtImageDrmFormatModifierFn::name().as_ptr());
            names.push(vk::KhrImageFormatListFn::name().as_ptr());
        }
        if self.external_semaphore_fd {
            names.push(vk::KhrExternalSemaphoreFdFn::name().as_ptr());
        }
        names
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Index of the graphics queue family
    pub queue_family: u32,
    /// Optional extensions the device offers
    pub extensions: DeviceExtensions,
}

impl PhysicalDeviceInfo {
    /// Pick the first Vulkan 1.1 device with a graphics queue, preferring discrete GPUs
    pub fn select(instance: &Instance) -> ImageResult<Self> {
        // SAFETY: plain enumeration on a live instance
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| ImageError::api("vkEnumeratePhysicalDevices", e))?;

        let mut candidates = Vec::new();
        for device in devices {
            match Self::evaluate_device(instance, device) {
                Ok(info) => candidates.push(info),
                Err(e) => log::debug!("Skipping physical device: {}", e),
            }
        }
        candidates.sort_by_key(|info| info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);

        let selected = candidates.into_iter().next().ok_or_else(|| {
            ImageError::InitializationFailed("No suitable GPU found".to_string())
        })?;
        log::info!(
            "Selected GPU: {} ({:?})",
            // SAFETY: device_name is a NUL-terminated fixed array
            unsafe { CStr::from_ptr(selected.properties.device_name.as_ptr()) }.to_string_lossy(),
            selected.extensions
        );
        Ok(selected)
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> ImageResult<Self> {
        // SAFETY: `device` was enumerated from `instance`
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_1 {
            return Err(ImageError::InitializationFailed(format!(
                "Vulkan {}.{} device, 1.1 required",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version)
            )));
        }

        // SAFETY: as above
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_family = queue_families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .ok_or_else(|| ImageError::InitializationFailed("No graphics queue family found".to_string()))?;

        Ok(Self {
            device,
            properties,
            queue_family: queue_family as u32,
            extensions: DeviceExtensions::query(instance, device)?,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue images are used on
    pub queue: vk::Queue,
}

impl LogicalDevice {
    /// Open the device with every optional extension it offers
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> ImageResult<Self> {
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical.queue_family)
            .queue_priorities(&[1.0])
            .build()];
        let extensions = physical.extensions.names();

        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::builder()
            .sampler_ycbcr_conversion(physical.extensions.sampler_ycbcr_conversion);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut ycbcr);

        // SAFETY: every pointer in `create_info` outlives the call
        let device = unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(|e| ImageError::api("vkCreateDevice", e))?;
        // SAFETY: one queue was requested from this family
        let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };

        Ok(Self { device, queue })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // SAFETY: the backend owning this device has released every child object
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns the instance and device
pub struct VulkanContext {
    /// Logical device; declared first so it drops before the instance
    pub device: LogicalDevice,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a headless context
    pub fn new(config: &ImageConfig) -> ImageResult<Self> {
        let instance = VulkanInstance::new(&config.application_name, config.enable_validation)?;
        let physical_device = PhysicalDeviceInfo::select(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            device,
            physical_device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the raw Device handle
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Features the device supports, before configuration masks them
    pub fn available_features(&self) -> DeviceFeatures {
        self.physical_device.extensions.features()
    }
}
