//! Recording device backend for unit tests
//!
//! Hands out fake handles, keeps just enough state to answer layout and modifier
//! queries, and counts every call so tests can check what was created and released.

use crate::backend::{
    DeviceBackend, ExternalImage, ExternalMemory, FormatProperties, ImageBarrier, ImageCreateDesc,
    ImageFormatQuery, ImageViewDesc, MemoryAllocateDesc, ModifierProperties,
};
use crate::device::{DeviceCapabilities, DeviceFeatures};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Features of a format that can do everything the image layer asks for
pub const FULL_FEATURES: vk::FormatFeatureFlags = vk::FormatFeatureFlags::from_raw(
    vk::FormatFeatureFlags::SAMPLED_IMAGE.as_raw()
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR.as_raw()
        | vk::FormatFeatureFlags::COLOR_ATTACHMENT.as_raw()
        | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND.as_raw()
        | vk::FormatFeatureFlags::BLIT_SRC.as_raw()
        | vk::FormatFeatureFlags::BLIT_DST.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_SRC.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_DST.as_raw(),
);

const ROW_ALIGNMENT: u64 = 256;
const DEFAULT_MAX_EXTENT: u32 = 16384;

/// Object kinds in the order they were destroyed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destroyed {
    Framebuffer,
    ImageView,
    Sampler,
    Semaphore,
    Image,
    Memory,
}

/// Snapshot of everything the backend was asked to do
#[derive(Clone, Debug, Default)]
pub struct MockCalls {
    pub images_created: usize,
    pub images_destroyed: usize,
    pub memory_allocated: usize,
    pub memory_freed: usize,
    pub memory_imported: usize,
    pub memory_exportable: usize,
    pub views_created: usize,
    pub framebuffers_created: usize,
    pub conversions_created: usize,
    pub conversions_destroyed: usize,
    pub samplers_destroyed: usize,
    pub sync_files_exported: usize,
    pub semaphores_imported: usize,
    pub semaphores_destroyed: usize,
    pub barriers: Vec<ImageBarrier>,
    pub limits_queries: Vec<ImageFormatQuery>,
    pub last_image: Option<ImageCreateDesc>,
    pub last_view: Option<ImageViewDesc>,
    pub last_memory_type: Option<u32>,
    pub last_imported_fd: Option<i32>,
    pub destroyed: Vec<Destroyed>,
}

/// In-memory [`DeviceBackend`]
pub struct MockBackend {
    formats: HashMap<vk::Format, FormatProperties>,
    max_extent: u32,
    failing_limits: HashSet<vk::Format>,
    fail_bind: bool,
    sync_files: bool,
    next_handle: AtomicU64,
    images: Mutex<HashMap<u64, ImageCreateDesc>>,
    memory: Mutex<HashMap<u64, Box<[u8]>>>,
    calls: Mutex<MockCalls>,
}

impl MockBackend {
    /// Device-local memory type
    pub const DEVICE_LOCAL_TYPE: u32 = 0;
    /// Host-visible, coherent memory type; the lowest type dmabufs import into
    pub const FD_MEMORY_TYPE: u32 = 1;
    /// Host-visible, coherent and cached memory type
    pub const HOST_CACHED_TYPE: u32 = 2;

    /// Plain linear modifier
    pub const LINEAR_MODIFIER: u64 = 0;
    /// A vendor tiling that cannot be blitted from
    pub const TILED_MODIFIER: u64 = 0x0100_0000_0000_0001;
    /// A vendor tiling with an auxiliary compression plane
    pub const COMPRESSED_MODIFIER: u64 = 0x0100_0000_0000_0004;

    /// Backend supporting every four-channel and single/dual-channel format
    pub fn new() -> Self {
        let full = FormatProperties {
            linear: FULL_FEATURES,
            optimal: FULL_FEATURES,
            modifiers: Vec::new(),
        };
        let mut this = Self::empty();
        for format in [
            vk::Format::R8_UNORM,
            vk::Format::R8G8_UNORM,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::R16_UNORM,
            vk::Format::R16_SFLOAT,
            vk::Format::R16G16_UNORM,
            vk::Format::R16G16B16A16_UNORM,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::Format::R32_SFLOAT,
            vk::Format::R32G32B32A32_SFLOAT,
        ] {
            this.formats.insert(format, full.clone());
        }

        this.formats.insert(
            vk::Format::R8G8B8A8_UNORM,
            FormatProperties {
                modifiers: vec![
                    ModifierProperties {
                        modifier: Self::LINEAR_MODIFIER,
                        plane_count: 1,
                        features: FULL_FEATURES,
                    },
                    ModifierProperties {
                        modifier: Self::TILED_MODIFIER,
                        plane_count: 1,
                        features: FULL_FEATURES & !vk::FormatFeatureFlags::BLIT_SRC,
                    },
                    ModifierProperties {
                        modifier: Self::COMPRESSED_MODIFIER,
                        plane_count: 2,
                        features: FULL_FEATURES,
                    },
                ],
                ..full
            },
        );

        this.formats.insert(
            vk::Format::G8_B8R8_2PLANE_420_UNORM,
            FormatProperties {
                linear: vk::FormatFeatureFlags::empty(),
                optimal: vk::FormatFeatureFlags::SAMPLED_IMAGE,
                modifiers: vec![ModifierProperties {
                    modifier: Self::LINEAR_MODIFIER,
                    plane_count: 2,
                    features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
                }],
            },
        );
        this
    }

    /// Backend supporting no format at all
    pub fn empty() -> Self {
        Self {
            formats: HashMap::new(),
            max_extent: DEFAULT_MAX_EXTENT,
            failing_limits: HashSet::new(),
            fail_bind: false,
            sync_files: false,
            next_handle: AtomicU64::new(0x1000),
            images: Mutex::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            calls: Mutex::new(MockCalls::default()),
        }
    }

    /// Replace the properties of one format
    pub fn with_format(mut self, format: vk::Format, properties: FormatProperties) -> Self {
        self.formats.insert(format, properties);
        self
    }

    /// Drop support for one format
    pub fn without_format(mut self, format: vk::Format) -> Self {
        self.formats.remove(&format);
        self
    }

    /// Limit image sizes
    pub fn with_max_extent(mut self, max_extent: u32) -> Self {
        self.max_extent = max_extent;
        self
    }

    /// Make the limits query of one format fail with a driver error
    pub fn fail_limits_query(mut self, format: vk::Format) -> Self {
        self.failing_limits.insert(format);
        self
    }

    /// Make every memory bind fail
    pub fn fail_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// Hand out a sync_file for every dmabuf, like a kernel with sync_file export
    pub fn with_sync_files(mut self) -> Self {
        self.sync_files = true;
        self
    }

    /// Capabilities with every optional feature on
    pub fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            features: DeviceFeatures::all(),
            force_staging: false,
        }
    }

    /// Image handle the backend did not create, like a swapchain image
    pub fn foreign_image(&self) -> vk::Image {
        vk::Image::from_raw(self.handle())
    }

    pub fn render_pass() -> vk::RenderPass {
        vk::RenderPass::from_raw(0xa0)
    }

    pub fn command_buffer() -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(0xb0)
    }

    /// Snapshot of the recorded calls
    pub fn calls(&self) -> MockCalls {
        self.calls.lock().unwrap().clone()
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, f: impl FnOnce(&mut MockCalls)) {
        f(&mut self.calls.lock().unwrap());
    }

    fn destroyed(&self, kind: Destroyed) {
        self.record(|c| c.destroyed.push(kind));
    }

    fn row_pitch(desc: &ImageCreateDesc) -> u64 {
        let unaligned = u64::from(desc.width) * bytes_per_pixel(desc.format);
        unaligned.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
    }
}

fn bytes_per_pixel(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::G8_B8R8_2PLANE_420_UNORM => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

impl DeviceBackend for MockBackend {
    fn queue_family_index(&self) -> u32 {
        0
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 2,
            ..Default::default()
        };
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 32,
            flags: vk::MemoryHeapFlags::empty(),
        };
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
            heap_index: 1,
        };
        props
    }

    fn format_properties(&self, format: vk::Format, with_modifiers: bool) -> FormatProperties {
        let mut properties = self.formats.get(&format).cloned().unwrap_or_default();
        if !with_modifiers {
            properties.modifiers.clear();
        }
        properties
    }

    fn image_format_properties(
        &self,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        self.record(|c| c.limits_queries.push(*query));
        if self.failing_limits.contains(&query.format) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let properties = self
            .formats
            .get(&query.format)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        if query.tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT
            && !properties.modifiers.iter().any(|m| m.modifier == query.modifier)
        {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(vk::ImageFormatProperties {
            max_extent: vk::Extent3D {
                width: self.max_extent,
                height: self.max_extent,
                depth: 1,
            },
            max_mip_levels: 15,
            max_array_layers: 1,
            sample_counts: vk::SampleCountFlags::TYPE_1,
            max_resource_size: 1 << 31,
        })
    }

    fn create_image(&self, desc: &ImageCreateDesc) -> VkResult<vk::Image> {
        let raw = self.handle();
        self.images.lock().unwrap().insert(raw, desc.clone());
        self.record(|c| {
            c.images_created += 1;
            c.last_image = Some(desc.clone());
        });
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.images.lock().unwrap().remove(&image.as_raw());
        self.record(|c| c.images_destroyed += 1);
        self.destroyed(Destroyed::Image);
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let images = self.images.lock().unwrap();
        let size = images
            .get(&image.as_raw())
            .map_or(0, |desc| Self::row_pitch(desc) * u64::from(desc.height));
        vk::MemoryRequirements {
            size,
            alignment: ROW_ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    fn allocate_memory(&self, desc: MemoryAllocateDesc) -> VkResult<vk::DeviceMemory> {
        let raw = self.handle();
        let size = usize::try_from(desc.size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        self.memory
            .lock()
            .unwrap()
            .insert(raw, vec![0u8; size].into_boxed_slice());
        self.record(|c| {
            c.memory_allocated += 1;
            c.last_memory_type = Some(desc.memory_type_index);
            match &desc.external {
                ExternalMemory::None => {}
                ExternalMemory::ExportDmabuf => c.memory_exportable += 1,
                ExternalMemory::ImportDmabuf(fd) => {
                    c.memory_imported += 1;
                    c.last_imported_fd = Some(fd.as_raw_fd());
                }
            }
        });
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.memory.lock().unwrap().remove(&memory.as_raw());
        self.record(|c| c.memory_freed += 1);
        self.destroyed(Destroyed::Memory);
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        let mut blocks = self.memory.lock().unwrap();
        let block = blocks
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        NonNull::new(block.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> VkResult<()> {
        if self.fail_bind {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView> {
        self.record(|c| {
            c.views_created += 1;
            c.last_view = Some(*desc);
        });
        Ok(vk::ImageView::from_raw(self.handle()))
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.destroyed(Destroyed::ImageView);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _view: vk::ImageView,
        _width: u32,
        _height: u32,
    ) -> VkResult<vk::Framebuffer> {
        self.record(|c| c.framebuffers_created += 1);
        Ok(vk::Framebuffer::from_raw(self.handle()))
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.destroyed(Destroyed::Framebuffer);
    }

    fn create_ycbcr_conversion(
        &self,
        _format: vk::Format,
    ) -> VkResult<vk::SamplerYcbcrConversion> {
        self.record(|c| c.conversions_created += 1);
        Ok(vk::SamplerYcbcrConversion::from_raw(self.handle()))
    }

    fn destroy_ycbcr_conversion(&self, _conversion: vk::SamplerYcbcrConversion) {
        self.record(|c| c.conversions_destroyed += 1);
    }

    fn create_sampler(
        &self,
        _conversion: Option<vk::SamplerYcbcrConversion>,
    ) -> VkResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.handle()))
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.record(|c| c.samplers_destroyed += 1);
        self.destroyed(Destroyed::Sampler);
    }

    fn subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout {
        let images = self.images.lock().unwrap();
        let Some(desc) = images.get(&image.as_raw()) else {
            return vk::SubresourceLayout::default();
        };
        let row_pitch = Self::row_pitch(desc);
        let plane_size = row_pitch * u64::from(desc.height);
        let plane = match aspect {
            vk::ImageAspectFlags::MEMORY_PLANE_1_EXT => 1,
            vk::ImageAspectFlags::MEMORY_PLANE_2_EXT => 2,
            vk::ImageAspectFlags::MEMORY_PLANE_3_EXT => 3,
            _ => 0,
        };
        vk::SubresourceLayout {
            offset: plane * plane_size,
            size: plane_size,
            row_pitch,
            array_pitch: 0,
            depth_pitch: 0,
        }
    }

    fn memory_fd_properties(&self, _fd: BorrowedFd<'_>) -> VkResult<u32> {
        Ok(0b110)
    }

    fn export_memory_fd(&self, _memory: vk::DeviceMemory) -> VkResult<OwnedFd> {
        tempfile::tempfile()
            .map(OwnedFd::from)
            .map_err(|_| vk::Result::ERROR_TOO_MANY_OBJECTS)
    }

    fn image_drm_format_modifier(&self, image: vk::Image) -> VkResult<u64> {
        let images = self.images.lock().unwrap();
        match images.get(&image.as_raw()).and_then(|d| d.external.as_ref()) {
            Some(ExternalImage::ModifierList(modifiers)) => modifiers
                .first()
                .copied()
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED),
            Some(ExternalImage::ExplicitModifier { modifier, .. }) => Ok(*modifier),
            None => Err(vk::Result::ERROR_INITIALIZATION_FAILED),
        }
    }

    fn export_dmabuf_sync_file(&self, _dmabuf: BorrowedFd<'_>) -> std::io::Result<OwnedFd> {
        if !self.sync_files {
            return Err(std::io::Error::from_raw_os_error(libc::ENOTTY));
        }
        self.record(|c| c.sync_files_exported += 1);
        tempfile::tempfile().map(OwnedFd::from)
    }

    fn import_semaphore_sync_fd(&self, _fd: OwnedFd) -> VkResult<vk::Semaphore> {
        self.record(|c| c.semaphores_imported += 1);
        Ok(vk::Semaphore::from_raw(self.handle()))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.record(|c| c.semaphores_destroyed += 1);
        self.destroyed(Destroyed::Semaphore);
    }

    fn cmd_image_barrier(&self, _command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.record(|c| c.barriers.push(*barrier));
    }
}
