//! Device backend abstraction
//!
//! [`DeviceBackend`] is the narrow set of native calls the image layer needs: capability
//! queries, image/view/memory lifetime, external memory handles and the single barrier
//! command. The Vulkan implementation lives in [`crate::vulkan`]; tests use an in-crate
//! recording backend so allocation and sharing logic can be exercised without a GPU.
//!
//! Methods return raw `VkResult`s; callers attach the failing call name when turning them
//! into [`crate::ImageError`].

use ash::prelude::VkResult;
use ash::vk;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

/// Maximum number of memory planes a dmabuf may carry
pub const MAX_PLANES: usize = 4;

/// Per-modifier capabilities of a format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModifierProperties {
    /// DRM format modifier
    pub modifier: u64,
    /// Number of memory planes images with this modifier use
    pub plane_count: u32,
    /// Features available with this modifier
    pub features: vk::FormatFeatureFlags,
}

/// Format capabilities for every tiling mode
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatProperties {
    /// Features with `VK_IMAGE_TILING_LINEAR`
    pub linear: vk::FormatFeatureFlags,
    /// Features with `VK_IMAGE_TILING_OPTIMAL`
    pub optimal: vk::FormatFeatureFlags,
    /// Modifiers usable with `VK_IMAGE_TILING_DRM_FORMAT_MODIFIER_EXT`
    pub modifiers: Vec<ModifierProperties>,
}

/// Arguments of an image format properties query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageFormatQuery {
    /// Native format
    pub format: vk::Format,
    /// Tiling mode
    pub tiling: vk::ImageTiling,
    /// Intended usage
    pub usage: vk::ImageUsageFlags,
    /// Modifier, only consulted for DRM modifier tiling
    pub modifier: u64,
}

/// Layout of one dmabuf plane as seen by the image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane inside the buffer
    pub offset: u64,
    /// Row pitch in bytes
    pub stride: u64,
}

/// External memory setup for a new image
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalImage {
    /// Let the driver pick one of these modifiers; memory will be exportable
    ModifierList(Vec<u64>),
    /// Import memory laid out with exactly this modifier and plane layout
    ExplicitModifier {
        /// DRM format modifier
        modifier: u64,
        /// One layout per memory plane
        planes: Vec<PlaneLayout>,
    },
}

/// Parameters of a new 2D image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageCreateDesc {
    /// Native format
    pub format: vk::Format,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Tiling mode
    pub tiling: vk::ImageTiling,
    /// Usage bits
    pub usage: vk::ImageUsageFlags,
    /// Layout the image starts in
    pub initial_layout: vk::ImageLayout,
    /// dmabuf setup, `None` for device-local images
    pub external: Option<ExternalImage>,
}

/// How a memory allocation relates to external handles
#[derive(Debug)]
pub enum ExternalMemory {
    /// Plain device memory
    None,
    /// Memory that can later be exported as a dmabuf
    ExportDmabuf,
    /// Import the dmabuf; ownership of the fd passes to the driver on success
    ImportDmabuf(OwnedFd),
}

/// Parameters of a memory allocation
#[derive(Debug)]
pub struct MemoryAllocateDesc {
    /// Allocation size in bytes
    pub size: vk::DeviceSize,
    /// Memory type to allocate from
    pub memory_type_index: u32,
    /// External handle handling
    pub external: ExternalMemory,
    /// Image this allocation is dedicated to
    pub dedicated_image: Option<vk::Image>,
}

/// Parameters of an image view
#[derive(Clone, Copy, Debug)]
pub struct ImageViewDesc {
    /// Image the view looks at
    pub image: vk::Image,
    /// View format
    pub format: vk::Format,
    /// Channel swizzle
    pub components: vk::ComponentMapping,
    /// Number of mip levels visible through the view
    pub level_count: u32,
    /// Y′CbCr conversion, required for multi-planar YUV formats
    pub conversion: Option<vk::SamplerYcbcrConversion>,
}

impl PartialEq for ImageViewDesc {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && self.format == other.format
            && crate::format::components_eq(&self.components, &other.components)
            && self.level_count == other.level_count
            && self.conversion == other.conversion
    }
}

impl Eq for ImageViewDesc {}

/// A full-image layout/access barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image being transitioned
    pub image: vk::Image,
    /// Stage the previous access happened in
    pub src_stage: vk::PipelineStageFlags,
    /// Stage the next access happens in
    pub dst_stage: vk::PipelineStageFlags,
    /// Previous access
    pub src_access: vk::AccessFlags,
    /// Next access
    pub dst_access: vk::AccessFlags,
    /// Current layout
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
}

/// Native device operations used by the image manager
pub trait DeviceBackend: Send + Sync {
    /// Queue family images are created for
    fn queue_family_index(&self) -> u32;

    /// Memory heaps and types of the physical device
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Feature bits of `format` for all tilings; modifiers are only filled when requested
    fn format_properties(&self, format: vk::Format, with_modifiers: bool) -> FormatProperties;

    /// Limits of an exact (format, tiling, usage[, modifier]) combination
    fn image_format_properties(&self, query: &ImageFormatQuery)
        -> VkResult<vk::ImageFormatProperties>;

    /// Create a 2D image
    fn create_image(&self, desc: &ImageCreateDesc) -> VkResult<vk::Image>;

    /// Destroy an image created by [`DeviceBackend::create_image`]
    fn destroy_image(&self, image: vk::Image);

    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// Allocate device memory
    fn allocate_memory(&self, desc: MemoryAllocateDesc) -> VkResult<vk::DeviceMemory>;

    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Persistently map a whole allocation
    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>>;

    /// Bind memory to an image
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Create a 2D color view
    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Create a single-attachment framebuffer
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        width: u32,
        height: u32,
    ) -> VkResult<vk::Framebuffer>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Create a Y′CbCr conversion for a multi-planar format
    fn create_ycbcr_conversion(&self, format: vk::Format)
        -> VkResult<vk::SamplerYcbcrConversion>;

    /// Destroy a Y′CbCr conversion
    fn destroy_ycbcr_conversion(&self, conversion: vk::SamplerYcbcrConversion);

    /// Create a linear clamp-to-edge sampler, optionally bound to a conversion
    fn create_sampler(&self, conversion: Option<vk::SamplerYcbcrConversion>)
        -> VkResult<vk::Sampler>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Layout of mip 0 / layer 0 for the given aspect
    fn subresource_layout(&self, image: vk::Image, aspect: vk::ImageAspectFlags)
        -> vk::SubresourceLayout;

    /// Memory types a dmabuf fd can be imported into
    fn memory_fd_properties(&self, fd: BorrowedFd<'_>) -> VkResult<u32>;

    /// Export an allocation as a dmabuf fd
    fn export_memory_fd(&self, memory: vk::DeviceMemory) -> VkResult<OwnedFd>;

    /// Modifier the driver picked for an image created from a modifier list
    fn image_drm_format_modifier(&self, image: vk::Image) -> VkResult<u64>;

    /// Export the fences of pending writes to a dmabuf as a sync_file
    ///
    /// Kernels without `DMA_BUF_IOCTL_EXPORT_SYNC_FILE` return an error and the import
    /// proceeds without a semaphore.
    fn export_dmabuf_sync_file(&self, dmabuf: BorrowedFd<'_>) -> std::io::Result<OwnedFd> {
        crate::dmabuf::export_sync_file(dmabuf, crate::dmabuf::DMA_BUF_SYNC_READ)
    }

    /// Create a semaphore and import a sync_file into it with temporary permanence
    ///
    /// The fd is consumed on success.
    fn import_semaphore_sync_fd(&self, fd: OwnedFd) -> VkResult<vk::Semaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Record a single image memory barrier into a command buffer
    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier);
}
