//! Per-device state shared by every image
//!
//! A [`GpuDevice`] owns the backend, the capability snapshot taken once at startup, the
//! memory allocators keyed by memory type, and the Y′CbCr conversions used for YUV
//! dmabuf imports. Images hold an `Arc` to the backend and to their allocator, never to
//! the `GpuDevice` itself.

use crate::backend::DeviceBackend;
use crate::config::ImageConfig;
use crate::error::{ImageError, ImageResult};
use crate::format::ImageFlags;
use crate::memory::{MemoryAllocator, MEMORY_MAPPABLE};
use crate::probe::{self, FormatQuery};
use ash::vk;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

bitflags! {
    /// Optional device capabilities discovered at initialization
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        /// dmabuf import/export with DRM format modifiers
        const DMABUF = 1 << 0;
        /// sync_file import into semaphores
        const SEMAPHORE_IMPORT = 1 << 1;
        /// sync_file export from semaphores
        const SEMAPHORE_EXPORT = 1 << 2;
        /// Sampler Y′CbCr conversion for multi-planar formats
        const YCBCR = 1 << 3;
    }
}

/// Capability snapshot of one device
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    /// Optional features that are both supported and enabled
    pub features: DeviceFeatures,
    /// Never hand out CPU mappings, forcing uploads through staging buffers
    pub force_staging: bool,
}

impl DeviceCapabilities {
    /// Build the snapshot, masking out features the configuration disables
    pub fn new(available: DeviceFeatures, config: &ImageConfig) -> Self {
        let mut features = available;
        if config.disable_dmabuf {
            features.remove(DeviceFeatures::DMABUF);
        }
        if config.disable_semaphore_import {
            features.remove(DeviceFeatures::SEMAPHORE_IMPORT);
        }
        if config.disable_ycbcr {
            features.remove(DeviceFeatures::YCBCR);
        }
        if features != available {
            log::info!("Device features {:?} reduced to {:?} by configuration", available, features);
        }
        Self {
            features,
            force_staging: config.force_staging,
        }
    }
}

/// Device-wide image manager state
pub struct GpuDevice {
    backend: Arc<dyn DeviceBackend>,
    capabilities: DeviceCapabilities,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocators: Mutex<HashMap<u32, Arc<MemoryAllocator>>>,
    external_allocator: Arc<MemoryAllocator>,
    conversions: Mutex<HashMap<vk::Format, vk::SamplerYcbcrConversion>>,
}

impl GpuDevice {
    /// Wrap a backend with its capability snapshot
    pub fn new(backend: Arc<dyn DeviceBackend>, capabilities: DeviceCapabilities) -> Self {
        let memory_properties = backend.memory_properties();
        let external_allocator = Arc::new(MemoryAllocator::external(backend.clone()));
        Self {
            backend,
            capabilities,
            memory_properties,
            allocators: Mutex::new(HashMap::new()),
            external_allocator,
            conversions: Mutex::new(HashMap::new()),
        }
    }

    /// Native backend
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Capability snapshot
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Whether an optional feature is available
    pub fn has_feature(&self, feature: DeviceFeatures) -> bool {
        self.capabilities.features.contains(feature)
    }

    /// Probe a format combination, see [`probe::supports`]
    pub fn supports_format(&self, query: &FormatQuery) -> Option<ImageFlags> {
        probe::supports(self.backend.as_ref(), query)
    }

    /// Allocator for the best memory type in `type_bits`
    ///
    /// Types must carry every `required` property; among those, the one sharing the most
    /// `desired` properties wins, ties going to the lower index.
    pub fn find_allocator(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        desired: vk::MemoryPropertyFlags,
    ) -> ImageResult<Arc<MemoryAllocator>> {
        let index = find_memory_type(&self.memory_properties, type_bits, required, desired)
            .ok_or(ImageError::NoSuitableMemoryType)?;
        let flags = self.memory_properties.memory_types[index as usize].property_flags;

        let mut allocators = self
            .allocators
            .lock()
            .map_err(|_| ImageError::InvalidOperation { reason: "allocator cache poisoned".into() })?;
        let allocator = allocators.entry(index).or_insert_with(|| {
            log::debug!("Creating allocator for memory type {} ({:?})", index, flags);
            Arc::new(MemoryAllocator::new(self.backend.clone(), index, flags))
        });
        Ok(allocator.clone())
    }

    /// Allocator used for imported and exportable dmabuf memory
    pub fn external_allocator(&self) -> Arc<MemoryAllocator> {
        self.external_allocator.clone()
    }

    /// Property flags of a memory type
    pub fn memory_type_flags(&self, index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties
            .memory_types
            .get(index as usize)
            .map(|t| t.property_flags)
            .unwrap_or_default()
    }

    /// Y′CbCr conversion for a multi-planar format, created on first use
    pub fn ycbcr_conversion(&self, format: vk::Format) -> ImageResult<vk::SamplerYcbcrConversion> {
        if !self.has_feature(DeviceFeatures::YCBCR) {
            return Err(ImageError::UnsupportedFeature(format!(
                "Y′CbCr conversion for {:?}",
                format
            )));
        }
        let mut conversions = self
            .conversions
            .lock()
            .map_err(|_| ImageError::InvalidOperation { reason: "conversion cache poisoned".into() })?;
        if let Some(conversion) = conversions.get(&format) {
            return Ok(*conversion);
        }
        let conversion = self
            .backend
            .create_ycbcr_conversion(format)
            .map_err(|e| ImageError::api("vkCreateSamplerYcbcrConversion", e))?;
        conversions.insert(format, conversion);
        Ok(conversion)
    }

    /// Preferred memory properties for an image with the given tiling
    pub fn desired_memory(tiling: vk::ImageTiling) -> vk::MemoryPropertyFlags {
        if tiling == vk::ImageTiling::LINEAR {
            MEMORY_MAPPABLE
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        }
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        if let Ok(conversions) = self.conversions.get_mut() {
            for (_, conversion) in conversions.drain() {
                self.backend.destroy_ycbcr_conversion(conversion);
            }
        }
    }
}

/// Pick a memory type, see [`GpuDevice::find_allocator`]
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    desired: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;
    for i in 0..memory_properties.memory_type_count {
        if type_bits & (1 << i) == 0 {
            continue;
        }
        let flags = memory_properties.memory_types[i as usize].property_flags;
        if !flags.contains(required) {
            continue;
        }
        let score = (flags & desired).as_raw().count_ones();
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((i, score));
        }
    }
    best.map(|(index, _)| index)
}
