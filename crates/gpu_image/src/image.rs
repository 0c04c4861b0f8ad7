//! GPU images
//!
//! [`GpuImage`] owns a Vulkan image together with its memory, default view and the
//! objects built on demand for it (framebuffer, sampler, import semaphore). Every
//! constructor resolves the requested [`MemoryFormat`] against the device first: the
//! candidates of the format table are probed in order and, when none fits, the format
//! falls back to a more general one until [`MemoryFormat::DEFAULT`] is reached.
//!
//! Images are torn down in dependency order when dropped. A swapchain image's
//! `VkImage` belongs to the swapchain and is left alone.

use crate::backend::{DeviceBackend, ImageCreateDesc, ImageViewDesc};
use crate::barrier::ImageState;
use crate::device::GpuDevice;
use crate::error::{ImageError, ImageResult};
use crate::format::{candidates_for, fallback_for, FormatCandidate, ImageFlags, MemoryFormat, IDENTITY_SWIZZLE};
use crate::memory::{Allocation, MemoryAllocator};
use crate::probe::FormatQuery;
use crate::sync::Semaphore;
use ash::vk;
use std::any::Any;
use std::sync::Arc;

/// How an image is created
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageParams {
    /// Candidate flags the caller can cope with
    pub allowed: ImageFlags,
    /// Requested tiling; anything but optimal may be upgraded to optimal
    pub tiling: vk::ImageTiling,
    /// Usage bits, `TRANSFER_SRC` is added for blittable formats
    pub usage: vk::ImageUsageFlags,
    /// State the image starts in
    pub initial: ImageState,
    /// Allocate a full mip chain
    pub mipmap: bool,
}

impl ImageParams {
    /// CPU-written images for uploads
    pub fn upload(mipmap: bool) -> Self {
        Self {
            allowed: ImageFlags::all(),
            tiling: vk::ImageTiling::LINEAR,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            initial: ImageState::new(
                vk::PipelineStageFlags::TRANSFER,
                vk::ImageLayout::PREINITIALIZED,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            mipmap,
        }
    }

    /// Texture atlases filled by copies
    pub fn atlas() -> Self {
        Self {
            allowed: ImageFlags::empty(),
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            initial: ImageState::new(
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            ),
            mipmap: false,
        }
    }

    /// Render targets
    pub fn offscreen(mipmap: bool) -> Self {
        Self {
            allowed: ImageFlags::empty(),
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            initial: ImageState::new(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            mipmap,
        }
    }
}

/// Outcome of format resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatSelection {
    /// Format the image will hold, possibly a fallback of the requested one
    pub memory_format: MemoryFormat,
    /// Chosen native format and swizzle
    pub candidate: FormatCandidate,
    /// Tiling after a possible upgrade to optimal
    pub tiling: vk::ImageTiling,
    /// Probe flags combined with the candidate's flags
    pub flags: ImageFlags,
}

/// Resolve `format` to the first native candidate the device supports
///
/// Candidates whose flags are not in `params.allowed` are skipped, as are swizzled ones
/// when the image will be rendered to. A candidate unsupported at the requested tiling is
/// retried with optimal tiling.
pub fn select_format(
    device: &GpuDevice,
    format: MemoryFormat,
    width: u32,
    height: u32,
    params: &ImageParams,
) -> ImageResult<FormatSelection> {
    let renders = params.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT);
    let mut format = format;

    loop {
        for candidate in candidates_for(format) {
            if !params.allowed.contains(candidate.flags) {
                continue;
            }
            if renders && !candidate.is_framebuffer_compatible() {
                continue;
            }

            let mut tiling = params.tiling;
            let mut query = FormatQuery::new(candidate.format, tiling, params.usage, width, height);
            let mut probed = device.supports_format(&query);
            if probed.is_none() && tiling != vk::ImageTiling::OPTIMAL {
                query.tiling = vk::ImageTiling::OPTIMAL;
                probed = device.supports_format(&query);
                if probed.is_some() {
                    tiling = vk::ImageTiling::OPTIMAL;
                }
            }

            if let Some(flags) = probed {
                return Ok(FormatSelection {
                    memory_format: format,
                    candidate: *candidate,
                    tiling,
                    flags: flags | candidate.flags,
                });
            }
        }

        if format == MemoryFormat::DEFAULT {
            return Err(ImageError::Unsupported(format!(
                "no usable format for a {}x{} image with {:?}",
                width, height, params.usage
            )));
        }
        let next = fallback_for(format);
        log::debug!("No Vulkan format for {:?}, falling back to {:?}", format, next);
        format = next;
    }
}

/// Number of mip levels of a full chain for a `width`×`height` image
pub fn mip_levels(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).leading_zeros()
}

/// CPU view of a mapped image
#[derive(Debug)]
pub struct MappedImage<'a> {
    /// Pixel rows, `stride` bytes apart
    pub data: &'a mut [u8],
    /// Row pitch in bytes
    pub stride: usize,
}

struct Framebuffer {
    framebuffer: vk::Framebuffer,
    view: vk::ImageView,
}

/// A Vulkan image with its memory and views
pub struct GpuImage {
    pub(crate) backend: Arc<dyn DeviceBackend>,
    pub(crate) memory_format: MemoryFormat,
    pub(crate) flags: ImageFlags,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) vk_format: vk::Format,
    pub(crate) tiling: vk::ImageTiling,
    pub(crate) usage: vk::ImageUsageFlags,
    pub(crate) state: ImageState,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    framebuffer: Option<Framebuffer>,
    pub(crate) sampler: Option<vk::Sampler>,
    pub(crate) semaphore: Option<Semaphore>,
    pub(crate) allocator: Option<Arc<MemoryAllocator>>,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) keep_alive: Option<Arc<dyn Any + Send + Sync>>,
    force_staging: bool,
}

impl GpuImage {
    /// Image record around an existing `VkImage`
    ///
    /// Views and memory are attached by the caller; whatever is attached when an error
    /// aborts construction is released by `Drop`.
    pub(crate) fn from_raw(
        device: &GpuDevice,
        image: vk::Image,
        vk_format: vk::Format,
        memory_format: MemoryFormat,
        width: u32,
        height: u32,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        state: ImageState,
    ) -> Self {
        Self {
            backend: device.backend().clone(),
            memory_format,
            flags: ImageFlags::empty(),
            width,
            height,
            vk_format,
            tiling,
            usage,
            state,
            image,
            view: vk::ImageView::null(),
            framebuffer: None,
            sampler: None,
            semaphore: None,
            allocator: None,
            allocation: None,
            keep_alive: None,
            force_staging: device.capabilities().force_staging,
        }
    }

    /// Linear image the CPU can write into, see [`GpuImage::mapped_data`]
    ///
    /// Devices that cannot map the format get an optimal-tiled image instead, which has to
    /// be filled through a staging buffer.
    pub fn new_for_upload(
        device: &GpuDevice,
        with_mipmap: bool,
        format: MemoryFormat,
        width: u32,
        height: u32,
    ) -> ImageResult<Self> {
        Self::new_resolved(device, format, width, height, &ImageParams::upload(with_mipmap))
    }

    /// Wrap an image owned by a swapchain
    ///
    /// Only the view and framebuffer belong to the returned image; the `VkImage` is never
    /// destroyed by it.
    pub fn new_for_swapchain(
        device: &GpuDevice,
        image: vk::Image,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> ImageResult<Self> {
        let mut this = Self::from_raw(
            device,
            image,
            format,
            MemoryFormat::DEFAULT,
            width,
            height,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ImageState::new(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            ),
        );
        this.view = this.create_view(IDENTITY_SWIZZLE, 1, None)?;
        Ok(this)
    }

    /// Atlas image in the default format
    pub fn new_for_atlas(device: &GpuDevice, width: u32, height: u32) -> ImageResult<Self> {
        Self::new_resolved(device, MemoryFormat::DEFAULT, width, height, &ImageParams::atlas())
    }

    /// Render target, in `preferred` format when the device can render to it
    pub fn new_for_offscreen(
        device: &GpuDevice,
        with_mipmap: bool,
        preferred: MemoryFormat,
        width: u32,
        height: u32,
    ) -> ImageResult<Self> {
        Self::new_resolved(device, preferred, width, height, &ImageParams::offscreen(with_mipmap))
    }

    fn new_resolved(
        device: &GpuDevice,
        format: MemoryFormat,
        width: u32,
        height: u32,
        params: &ImageParams,
    ) -> ImageResult<Self> {
        check_size(width, height)?;
        let selection = select_format(device, format, width, height, params)?;

        let mut flags = selection.flags;
        let levels = if params.mipmap {
            flags |= ImageFlags::CAN_MIPMAP;
            mip_levels(width, height)
        } else {
            1
        };
        let mut usage = params.usage;
        if !flags.contains(ImageFlags::NO_BLIT) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let backend = device.backend();
        let image = backend
            .create_image(&ImageCreateDesc {
                format: selection.candidate.format,
                width,
                height,
                mip_levels: levels,
                tiling: selection.tiling,
                usage,
                initial_layout: params.initial.layout,
                external: None,
            })
            .map_err(|e| ImageError::api("vkCreateImage", e))?;

        let requirements = backend.image_memory_requirements(image);
        let allocator = match device.find_allocator(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
            GpuDevice::desired_memory(selection.tiling),
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                backend.destroy_image(image);
                return Err(e);
            }
        };

        let mut this = Self::from_raw(
            device,
            image,
            selection.candidate.format,
            selection.memory_format,
            width,
            height,
            selection.tiling,
            usage,
            params.initial,
        );
        this.flags = flags;
        this.allocator = Some(allocator.clone());
        let allocation = allocator.alloc(&requirements)?;
        let (memory, offset) = (allocation.memory, allocation.offset);
        this.allocation = Some(allocation);

        backend
            .bind_image_memory(image, memory, offset)
            .map_err(|e| ImageError::api("vkBindImageMemory", e))?;

        this.view = this.create_view(selection.candidate.components, levels, None)?;

        log::debug!(
            "Created {}x{} {:?} image as {:?} ({:?}, {:?})",
            width,
            height,
            selection.memory_format,
            selection.candidate.format,
            selection.tiling,
            flags
        );
        Ok(this)
    }

    pub(crate) fn create_view(
        &self,
        components: vk::ComponentMapping,
        level_count: u32,
        conversion: Option<vk::SamplerYcbcrConversion>,
    ) -> ImageResult<vk::ImageView> {
        self.backend
            .create_image_view(&ImageViewDesc {
                image: self.image,
                format: self.vk_format,
                components,
                level_count,
                conversion,
            })
            .map_err(|e| ImageError::api("vkCreateImageView", e))
    }

    /// Whether [`GpuImage::mapped_data`] will succeed
    pub fn can_map(&self) -> bool {
        if self.force_staging || self.tiling != vk::ImageTiling::LINEAR {
            return false;
        }
        if self.state.layout != vk::ImageLayout::PREINITIALIZED
            && self.state.layout != vk::ImageLayout::GENERAL
        {
            return false;
        }
        self.allocation.as_ref().map_or(false, |a| {
            a.memory_flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) && a.mapped.is_some()
        })
    }

    /// Pixel storage of mip 0, for images the CPU can write directly
    pub fn mapped_data(&mut self) -> Option<MappedImage<'_>> {
        if !self.can_map() {
            return None;
        }
        let allocation = self.allocation.as_ref()?;
        let base = allocation.mapped?;
        let layout = self
            .backend
            .subresource_layout(self.image, vk::ImageAspectFlags::COLOR);

        let start = allocation.offset.checked_add(layout.offset)?;
        let end = start.checked_add(layout.size)?;
        if end > allocation.size {
            return None;
        }

        // SAFETY: the mapping covers the whole allocation, the range was checked against it
        // and `&mut self` keeps the slice unique.
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                base.as_ptr().add(usize::try_from(start).ok()?),
                usize::try_from(layout.size).ok()?,
            )
        };
        Some(MappedImage {
            data,
            stride: usize::try_from(layout.row_pitch).ok()?,
        })
    }

    /// Framebuffer for rendering into mip 0, created on first use
    ///
    /// Later calls return the same framebuffer, so all render passes used with one image
    /// have to be compatible.
    pub fn framebuffer(&mut self, render_pass: vk::RenderPass) -> ImageResult<vk::Framebuffer> {
        if let Some(fb) = &self.framebuffer {
            return Ok(fb.framebuffer);
        }

        let view = if self.flags.contains(ImageFlags::CAN_MIPMAP) {
            self.create_view(IDENTITY_SWIZZLE, 1, None)?
        } else {
            self.view
        };

        let framebuffer = match self
            .backend
            .create_framebuffer(render_pass, view, self.width, self.height)
        {
            Ok(fb) => fb,
            Err(e) => {
                if view != self.view {
                    self.backend.destroy_image_view(view);
                }
                return Err(ImageError::api("vkCreateFramebuffer", e));
            }
        };

        self.framebuffer = Some(Framebuffer { framebuffer, view });
        Ok(framebuffer)
    }

    /// Native image handle
    pub fn vk_image(&self) -> vk::Image {
        self.image
    }

    /// Default view covering all mips
    pub fn vk_image_view(&self) -> vk::ImageView {
        self.view
    }

    /// Native format
    pub fn vk_format(&self) -> vk::Format {
        self.vk_format
    }

    /// Tiling the image was created with
    pub fn vk_tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    /// Usage the image was created with
    pub fn vk_usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Sampler with a Y′CbCr conversion, only set for imported YUV images
    pub fn vk_sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    /// Stage of the last access
    pub fn vk_pipeline_stage(&self) -> vk::PipelineStageFlags {
        self.state.stage
    }

    /// Current layout
    pub fn vk_image_layout(&self) -> vk::ImageLayout {
        self.state.layout
    }

    /// Access mask of the last access
    pub fn vk_access(&self) -> vk::AccessFlags {
        self.state.access
    }

    /// Full tracked state
    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Record a state change made outside of [`GpuImage::transition`]
    ///
    /// Render passes move attachments into their final layout themselves.
    pub fn set_state(&mut self, state: ImageState) {
        self.state = state;
    }

    /// Resolved flags
    pub fn flags(&self) -> ImageFlags {
        self.flags
    }

    /// Format of the image contents
    pub fn memory_format(&self) -> MemoryFormat {
        self.memory_format
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Some(fb) = self.framebuffer.take() {
            self.backend.destroy_framebuffer(fb.framebuffer);
            if fb.view != self.view {
                self.backend.destroy_image_view(fb.view);
            }
        }

        if self.view != vk::ImageView::null() {
            self.backend.destroy_image_view(self.view);
        }

        if let Some(sampler) = self.sampler.take() {
            self.backend.destroy_sampler(sampler);
        }

        drop(self.semaphore.take());

        // swapchain images have no allocator and their VkImage is not ours
        if let Some(allocator) = self.allocator.take() {
            self.backend.destroy_image(self.image);
            if let Some(allocation) = self.allocation.take() {
                allocator.free(allocation);
            }
        }
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("memory_format", &self.memory_format)
            .field("vk_format", &self.vk_format)
            .field("size", &(self.width, self.height))
            .field("tiling", &self.tiling)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub(crate) fn check_size(width: u32, height: u32) -> ImageResult<()> {
    if width == 0 || height == 0 {
        return Err(ImageError::InvalidOperation {
            reason: format!("cannot create a {}x{} image", width, height),
        });
    }
    Ok(())
}
