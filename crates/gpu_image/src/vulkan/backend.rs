//! ash implementation of [`DeviceBackend`]

use ash::extensions::{ext, khr};
use ash::prelude::VkResult;
use ash::vk;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;

use super::context::VulkanContext;
use crate::backend::{
    DeviceBackend, ExternalImage, ExternalMemory, FormatProperties, ImageBarrier, ImageCreateDesc,
    ImageFormatQuery, ImageViewDesc, MemoryAllocateDesc, ModifierProperties,
};

const DMA_BUF: vk::ExternalMemoryHandleTypeFlags = vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;

/// Real device backend on top of a [`VulkanContext`]
pub struct VulkanBackend {
    memory_fd: Option<khr::ExternalMemoryFd>,
    semaphore_fd: Option<khr::ExternalSemaphoreFd>,
    drm_modifier: Option<ext::ImageDrmFormatModifier>,
    context: VulkanContext,
}

impl VulkanBackend {
    /// Load the extension entry points the context's device enabled
    pub fn new(context: VulkanContext) -> Self {
        let extensions = context.physical_device.extensions;
        let instance = context.instance();
        let device = context.device();

        let (memory_fd, drm_modifier) = if extensions.has_dmabuf() {
            (
                Some(khr::ExternalMemoryFd::new(instance, device)),
                Some(ext::ImageDrmFormatModifier::new(instance, device)),
            )
        } else {
            (None, None)
        };
        let semaphore_fd = extensions
            .external_semaphore_fd
            .then(|| khr::ExternalSemaphoreFd::new(instance, device));

        Self {
            memory_fd,
            semaphore_fd,
            drm_modifier,
            context,
        }
    }

    /// Underlying context
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        self.context.device()
    }

    fn physical(&self) -> vk::PhysicalDevice {
        self.context.physical_device.device
    }

    fn modifier_properties(&self, format: vk::Format) -> Vec<ModifierProperties> {
        let instance = self.context.instance();

        // first call sizes the list, second fills it
        let mut list = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut props = vk::FormatProperties2::builder().push_next(&mut list).build();
        // SAFETY: `list` is chained into `props` and outlives both calls
        unsafe {
            instance.get_physical_device_format_properties2(self.physical(), format, &mut props);
        }

        let count = list.drm_format_modifier_count as usize;
        if count == 0 {
            return Vec::new();
        }
        let mut modifiers = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
        list.p_drm_format_modifier_properties = modifiers.as_mut_ptr();
        // SAFETY: the array holds `drm_format_modifier_count` entries
        unsafe {
            instance.get_physical_device_format_properties2(self.physical(), format, &mut props);
        }
        modifiers.truncate(list.drm_format_modifier_count as usize);

        modifiers
            .into_iter()
            .map(|m| ModifierProperties {
                modifier: m.drm_format_modifier,
                plane_count: m.drm_format_modifier_plane_count,
                features: m.drm_format_modifier_tiling_features,
            })
            .collect()
    }
}

fn color_range(level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl DeviceBackend for VulkanBackend {
    fn queue_family_index(&self) -> u32 {
        self.context.physical_device.queue_family
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: plain query on a live physical device
        unsafe {
            self.context
                .instance()
                .get_physical_device_memory_properties(self.physical())
        }
    }

    fn format_properties(&self, format: vk::Format, with_modifiers: bool) -> FormatProperties {
        // SAFETY: plain query on a live physical device
        let props = unsafe {
            self.context
                .instance()
                .get_physical_device_format_properties(self.physical(), format)
        };
        let modifiers = if with_modifiers && self.drm_modifier.is_some() {
            self.modifier_properties(format)
        } else {
            Vec::new()
        };
        FormatProperties {
            linear: props.linear_tiling_features,
            optimal: props.optimal_tiling_features,
            modifiers,
        }
    }

    fn image_format_properties(
        &self,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        let mut drm_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::builder()
            .drm_format_modifier(query.modifier)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut external_info =
            vk::PhysicalDeviceExternalImageFormatInfo::builder().handle_type(DMA_BUF);
        let mut info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(query.format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(query.tiling)
            .usage(query.usage)
            .flags(vk::ImageCreateFlags::empty());
        if query.tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT {
            info = info.push_next(&mut drm_info).push_next(&mut external_info);
        }

        let mut properties = vk::ImageFormatProperties2::default();
        // SAFETY: chained structs live across the call
        unsafe {
            self.context.instance().get_physical_device_image_format_properties2(
                self.physical(),
                &info,
                &mut properties,
            )?;
        }
        Ok(properties.image_format_properties)
    }

    fn create_image(&self, desc: &ImageCreateDesc) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(desc.initial_layout);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder().handle_types(DMA_BUF);

        // SAFETY: chained structs live across each call
        match &desc.external {
            None => unsafe { self.device().create_image(&info, None) },
            Some(ExternalImage::ModifierList(modifiers)) => {
                let mut list = vk::ImageDrmFormatModifierListCreateInfoEXT::builder()
                    .drm_format_modifiers(modifiers);
                let info = info.push_next(&mut list).push_next(&mut external_info);
                unsafe { self.device().create_image(&info, None) }
            }
            Some(ExternalImage::ExplicitModifier { modifier, planes }) => {
                let layouts: Vec<vk::SubresourceLayout> = planes
                    .iter()
                    .map(|p| vk::SubresourceLayout {
                        offset: p.offset,
                        size: 0,
                        row_pitch: p.stride,
                        array_pitch: 0,
                        depth_pitch: 0,
                    })
                    .collect();
                let mut explicit = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
                    .drm_format_modifier(*modifier)
                    .plane_layouts(&layouts);
                let info = info.push_next(&mut explicit).push_next(&mut external_info);
                unsafe { self.device().create_image(&info, None) }
            }
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        // SAFETY: callers destroy each image once, after its views
        unsafe { self.device().destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: plain query on a live image
        unsafe { self.device().get_image_memory_requirements(image) }
    }

    fn allocate_memory(&self, desc: MemoryAllocateDesc) -> VkResult<vk::DeviceMemory> {
        let mut dedicated =
            vk::MemoryDedicatedAllocateInfo::builder().image(desc.dedicated_image.unwrap_or_default());
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(desc.size)
            .memory_type_index(desc.memory_type_index);
        if desc.dedicated_image.is_some() {
            info = info.push_next(&mut dedicated);
        }

        // SAFETY: chained structs live across each call
        match desc.external {
            ExternalMemory::None => unsafe { self.device().allocate_memory(&info, None) },
            ExternalMemory::ExportDmabuf => {
                let mut export = vk::ExportMemoryAllocateInfo::builder().handle_types(DMA_BUF);
                let info = info.push_next(&mut export);
                unsafe { self.device().allocate_memory(&info, None) }
            }
            ExternalMemory::ImportDmabuf(fd) => {
                let mut import = vk::ImportMemoryFdInfoKHR::builder()
                    .handle_type(DMA_BUF)
                    .fd(fd.as_raw_fd());
                let info = info.push_next(&mut import);
                let memory = unsafe { self.device().allocate_memory(&info, None) }?;
                // the driver owns the fd now
                let _ = fd.into_raw_fd();
                Ok(memory)
            }
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: callers free each allocation once, after destroying its image
        unsafe { self.device().free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        // SAFETY: the allocation is host visible and not mapped yet
        let ptr = unsafe {
            self.device()
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;
        NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        // SAFETY: the allocation satisfies the image's requirements
        unsafe { self.device().bind_image_memory(image, memory, offset) }
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView> {
        let mut conversion_info = vk::SamplerYcbcrConversionInfo::builder()
            .conversion(desc.conversion.unwrap_or_default());
        let mut info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .components(desc.components)
            .subresource_range(color_range(desc.level_count));
        if desc.conversion.is_some() {
            info = info.push_next(&mut conversion_info);
        }
        // SAFETY: chained structs live across the call
        unsafe { self.device().create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: framebuffers using the view are destroyed first
        unsafe { self.device().destroy_image_view(view, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        width: u32,
        height: u32,
    ) -> VkResult<vk::Framebuffer> {
        let attachments = [view];
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(width)
            .height(height)
            .layers(1);
        // SAFETY: `attachments` outlives the call
        unsafe { self.device().create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: the framebuffer is no longer referenced by pending work
        unsafe { self.device().destroy_framebuffer(framebuffer, None) }
    }

    fn create_ycbcr_conversion(
        &self,
        format: vk::Format,
    ) -> VkResult<vk::SamplerYcbcrConversion> {
        let info = vk::SamplerYcbcrConversionCreateInfo::builder()
            .format(format)
            .ycbcr_model(vk::SamplerYcbcrModelConversion::YCBCR_709)
            .ycbcr_range(vk::SamplerYcbcrRange::ITU_NARROW)
            .components(vk::ComponentMapping::default())
            .x_chroma_offset(vk::ChromaLocation::MIDPOINT)
            .y_chroma_offset(vk::ChromaLocation::MIDPOINT)
            .chroma_filter(vk::Filter::LINEAR)
            .force_explicit_reconstruction(false);
        // SAFETY: the samplerYcbcrConversion feature was enabled at device creation
        unsafe { self.device().create_sampler_ycbcr_conversion(&info, None) }
    }

    fn destroy_ycbcr_conversion(&self, conversion: vk::SamplerYcbcrConversion) {
        // SAFETY: samplers and views using the conversion are gone
        unsafe { self.device().destroy_sampler_ycbcr_conversion(conversion, None) }
    }

    fn create_sampler(
        &self,
        conversion: Option<vk::SamplerYcbcrConversion>,
    ) -> VkResult<vk::Sampler> {
        let mut conversion_info =
            vk::SamplerYcbcrConversionInfo::builder().conversion(conversion.unwrap_or_default());
        let mut info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false)
            .max_anisotropy(1.0)
            .min_lod(0.0)
            .max_lod(0.0);
        if conversion.is_some() {
            info = info.push_next(&mut conversion_info);
        }
        // SAFETY: chained structs live across the call
        unsafe { self.device().create_sampler(&info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: the sampler is no longer referenced by pending work
        unsafe { self.device().destroy_sampler(sampler, None) }
    }

    fn subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout {
        let subresource = vk::ImageSubresource {
            aspect_mask: aspect,
            mip_level: 0,
            array_layer: 0,
        };
        // SAFETY: only called for linear and modifier-tiled images
        unsafe { self.device().get_image_subresource_layout(image, subresource) }
    }

    fn memory_fd_properties(&self, fd: BorrowedFd<'_>) -> VkResult<u32> {
        let memory_fd = self
            .memory_fd
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: the fd stays open for the duration of the call
        let properties = unsafe { memory_fd.get_memory_fd_properties(DMA_BUF, fd.as_raw_fd()) }?;
        Ok(properties.memory_type_bits)
    }

    fn export_memory_fd(&self, memory: vk::DeviceMemory) -> VkResult<OwnedFd> {
        let memory_fd = self
            .memory_fd
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let info = vk::MemoryGetFdInfoKHR::builder()
            .memory(memory)
            .handle_type(DMA_BUF);
        // SAFETY: the memory was allocated exportable as a dmabuf
        let fd = unsafe { memory_fd.get_memory_fd(&info) }?;
        // SAFETY: vkGetMemoryFdKHR hands out a fresh fd owned by the caller
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn image_drm_format_modifier(&self, image: vk::Image) -> VkResult<u64> {
        let drm_modifier = self
            .drm_modifier
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let mut properties = vk::ImageDrmFormatModifierPropertiesEXT::default();
        // SAFETY: the image was created with DRM modifier tiling
        unsafe { drm_modifier.get_image_drm_format_modifier_properties(image, &mut properties) }?;
        Ok(properties.drm_format_modifier)
    }

    fn import_semaphore_sync_fd(&self, fd: OwnedFd) -> VkResult<vk::Semaphore> {
        let semaphore_fd = self
            .semaphore_fd
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;

        // SAFETY: plain object creation
        let semaphore = unsafe {
            self.device()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }?;
        let import = vk::ImportSemaphoreFdInfoKHR::builder()
            .semaphore(semaphore)
            .flags(vk::SemaphoreImportFlags::TEMPORARY)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
            .fd(fd.as_raw_fd());

        // SAFETY: the semaphore is fresh and unused
        match unsafe { semaphore_fd.import_semaphore_fd(&import) } {
            Ok(()) => {
                // the semaphore owns the payload now
                let _ = fd.into_raw_fd();
                Ok(semaphore)
            }
            Err(e) => {
                // SAFETY: nothing waits on a semaphore whose import failed
                unsafe { self.device().destroy_semaphore(semaphore, None) };
                Err(e)
            }
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: submissions waiting on the semaphore have completed
        unsafe { self.device().destroy_semaphore(semaphore, None) }
    }

    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(color_range(vk::REMAINING_MIP_LEVELS))
            .build();

        // SAFETY: the command buffer is in the recording state
        unsafe {
            self.device().cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("physical_device", &self.physical())
            .field("extensions", &self.context.physical_device.extensions)
            .finish_non_exhaustive()
    }
}
