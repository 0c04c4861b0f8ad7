//! dmabuf import and export
//!
//! Images can be created on top of a dmabuf another process or API produced, and
//! exportable images can be handed out as dmabufs. Buffers are described by a DRM
//! fourcc, a DRM format modifier and one fd/offset/stride triple per memory plane.
//!
//! Imports duplicate the fd, so the producer may close its own right after the call.
//! When the device can import sync_files, the producer's pending writes are turned into
//! a semaphore that the first use of the image waits on.

use crate::backend::{ExternalImage, ExternalMemory, ImageCreateDesc, PlaneLayout, MAX_PLANES};
use crate::barrier::ImageState;
use crate::device::{DeviceFeatures, GpuDevice};
use crate::error::{ImageError, ImageResult};
use crate::format::{candidates_for, fallback_for, AlphaKind, ImageFlags, MemoryFormat};
use crate::image::{check_size, GpuImage};
use crate::memory::lowest_memory_type;
use crate::probe::{export_modifiers, FormatQuery, EXPORT_USAGE};
use crate::sync::Semaphore;
use ash::vk;
use std::any::Any;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Build a DRM fourcc code from its four characters
pub const fn fourcc(a: char, b: char, c: char, d: char) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Printable form of a fourcc code
pub fn fourcc_name(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

/// Plain row-major layout
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
/// Modifier placeholder meaning "unknown"
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Vulkan view of a DRM fourcc
#[derive(Clone, Copy, Debug)]
pub struct FourccInfo {
    /// DRM fourcc code
    pub fourcc: u32,
    /// Native format holding the same bytes
    pub vk_format: vk::Format,
    /// Swizzle turning the stored channels into RGBA
    pub components: vk::ComponentMapping,
    /// Multi-planar or subsampled YUV, needs a Y′CbCr conversion
    pub is_yuv: bool,
    /// Memory format of the contents when alpha is premultiplied
    pub premultiplied: MemoryFormat,
    /// Memory format of the contents when alpha is straight
    pub straight: MemoryFormat,
}

impl PartialEq for FourccInfo {
    fn eq(&self, other: &Self) -> bool {
        self.fourcc == other.fourcc
            && self.vk_format == other.vk_format
            && crate::format::components_eq(&self.components, &other.components)
            && self.is_yuv == other.is_yuv
            && self.premultiplied == other.premultiplied
            && self.straight == other.straight
    }
}

impl Eq for FourccInfo {}

impl FourccInfo {
    /// Memory format for a buffer with the given alpha treatment
    pub fn memory_format(&self, premultiplied: bool) -> MemoryFormat {
        if premultiplied {
            self.premultiplied
        } else {
            self.straight
        }
    }
}

mod swizzle {
    use ash::vk::{ComponentMapping, ComponentSwizzle as S};

    const fn map(r: S, g: S, b: S, a: S) -> ComponentMapping {
        ComponentMapping { r, g, b, a }
    }

    pub const RGBA: ComponentMapping = map(S::R, S::G, S::B, S::A);
    pub const RGB1: ComponentMapping = map(S::R, S::G, S::B, S::ONE);
    pub const ABGR: ComponentMapping = map(S::A, S::B, S::G, S::R);
    pub const ABG1: ComponentMapping = map(S::A, S::B, S::G, S::ONE);
    pub const GBAR: ComponentMapping = map(S::G, S::B, S::A, S::R);
    pub const GBA1: ComponentMapping = map(S::G, S::B, S::A, S::ONE);
    pub const BGRA: ComponentMapping = map(S::B, S::G, S::R, S::A);
}

const fn rgb(
    code: u32,
    vk_format: vk::Format,
    components: vk::ComponentMapping,
    premultiplied: MemoryFormat,
    straight: MemoryFormat,
) -> FourccInfo {
    FourccInfo {
        fourcc: code,
        vk_format,
        components,
        is_yuv: false,
        premultiplied,
        straight,
    }
}

const fn opaque(code: u32, vk_format: vk::Format, components: vk::ComponentMapping, format: MemoryFormat) -> FourccInfo {
    rgb(code, vk_format, components, format, format)
}

const fn yuv(code: u32, vk_format: vk::Format, components: vk::ComponentMapping, format: MemoryFormat) -> FourccInfo {
    FourccInfo {
        fourcc: code,
        vk_format,
        components,
        is_yuv: true,
        premultiplied: format,
        straight: format,
    }
}

use swizzle::*;
use vk::Format as F;
use MemoryFormat as M;

static FOURCC_TABLE: [FourccInfo; 28] = [
    rgb(fourcc('A', 'R', '2', '4'), F::B8G8R8A8_UNORM, RGBA, M::B8G8R8A8Premultiplied, M::B8G8R8A8),
    opaque(fourcc('X', 'R', '2', '4'), F::B8G8R8A8_UNORM, RGB1, M::B8G8R8X8),
    rgb(fourcc('A', 'B', '2', '4'), F::R8G8B8A8_UNORM, RGBA, M::R8G8B8A8Premultiplied, M::R8G8B8A8),
    opaque(fourcc('X', 'B', '2', '4'), F::R8G8B8A8_UNORM, RGB1, M::R8G8B8X8),
    rgb(fourcc('R', 'A', '2', '4'), F::R8G8B8A8_UNORM, ABGR, M::A8B8G8R8Premultiplied, M::A8B8G8R8),
    opaque(fourcc('R', 'X', '2', '4'), F::R8G8B8A8_UNORM, ABG1, M::X8B8G8R8),
    rgb(fourcc('B', 'A', '2', '4'), F::R8G8B8A8_UNORM, GBAR, M::A8R8G8B8Premultiplied, M::A8R8G8B8),
    opaque(fourcc('B', 'X', '2', '4'), F::R8G8B8A8_UNORM, GBA1, M::X8R8G8B8),
    opaque(fourcc('R', 'G', '2', '4'), F::B8G8R8_UNORM, RGBA, M::B8G8R8),
    opaque(fourcc('B', 'G', '2', '4'), F::R8G8B8_UNORM, RGBA, M::R8G8B8),
    rgb(
        fourcc('A', 'B', '4', '8'),
        F::R16G16B16A16_UNORM,
        RGBA,
        M::R16G16B16A16Premultiplied,
        M::R16G16B16A16,
    ),
    rgb(
        fourcc('A', 'B', '4', 'H'),
        F::R16G16B16A16_SFLOAT,
        RGBA,
        M::R16G16B16A16FloatPremultiplied,
        M::R16G16B16A16Float,
    ),
    opaque(fourcc('R', '8', ' ', ' '), F::R8_UNORM, RGBA, M::G8),
    opaque(fourcc('G', 'R', '8', '8'), F::R8G8_UNORM, RGBA, M::R8G8B8),
    opaque(fourcc('R', '1', '6', ' '), F::R16_UNORM, RGBA, M::G16),
    opaque(fourcc('G', 'R', '3', '2'), F::R16G16_UNORM, RGBA, M::R16G16B16),
    yuv(fourcc('N', 'V', '1', '2'), F::G8_B8R8_2PLANE_420_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('N', 'V', '2', '1'), F::G8_B8R8_2PLANE_420_UNORM, BGRA, M::R8G8B8),
    yuv(fourcc('N', 'V', '1', '6'), F::G8_B8R8_2PLANE_422_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('N', 'V', '6', '1'), F::G8_B8R8_2PLANE_422_UNORM, BGRA, M::R8G8B8),
    yuv(fourcc('Y', 'U', 'Y', 'V'), F::G8B8G8R8_422_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('U', 'Y', 'V', 'Y'), F::B8G8R8G8_422_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('Y', 'U', '1', '2'), F::G8_B8_R8_3PLANE_420_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('Y', 'V', '1', '2'), F::G8_B8_R8_3PLANE_420_UNORM, BGRA, M::R8G8B8),
    yuv(fourcc('Y', 'U', '1', '6'), F::G8_B8_R8_3PLANE_422_UNORM, RGBA, M::R8G8B8),
    yuv(fourcc('Y', 'U', '2', '4'), F::G8_B8_R8_3PLANE_444_UNORM, RGBA, M::R8G8B8),
    yuv(
        fourcc('P', '0', '1', '0'),
        F::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16,
        RGBA,
        M::R16G16B16,
    ),
    yuv(fourcc('P', '0', '1', '6'), F::G16_B16R16_2PLANE_420_UNORM, RGBA, M::R16G16B16),
];

/// Look up how a fourcc maps onto Vulkan
pub fn fourcc_info(code: u32) -> Option<&'static FourccInfo> {
    FOURCC_TABLE.iter().find(|info| info.fourcc == code)
}

/// One memory plane of a dmabuf
#[derive(Debug)]
pub struct DmabufPlane {
    /// Buffer fd, closed when the plane is dropped
    pub fd: OwnedFd,
    /// Byte offset of the plane
    pub offset: u64,
    /// Row pitch in bytes
    pub stride: u32,
}

/// A dmabuf and the layout of its contents
#[derive(Debug)]
pub struct DmabufDescriptor {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// DRM fourcc
    pub fourcc: u32,
    /// DRM format modifier
    pub modifier: u64,
    /// Color channels are multiplied by alpha
    pub premultiplied: bool,
    /// Memory planes, at most [`MAX_PLANES`]
    pub planes: Vec<DmabufPlane>,
    /// Planes live in separate buffers
    pub disjoint: bool,
}

impl DmabufDescriptor {
    /// Number of memory planes
    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }
}

/// Anything backed by a dmabuf that can be imported
///
/// The importing image keeps the implementor alive for its own lifetime.
pub trait AsDmabuf {
    /// The buffer description
    fn dmabuf(&self) -> &DmabufDescriptor;
}

impl AsDmabuf for DmabufDescriptor {
    fn dmabuf(&self) -> &DmabufDescriptor {
        self
    }
}

/// Wraps an exported dmabuf into the caller's texture type
pub trait DmabufTextureBuilder {
    /// Texture produced on success
    type Texture;
    /// Reason the texture could not be built
    type Error: std::fmt::Display;

    /// Take ownership of `dmabuf`; its fds are closed when it is dropped on failure
    fn build(&self, dmabuf: DmabufDescriptor) -> Result<Self::Texture, Self::Error>;
}

/// Request read access for [`export_sync_file`]
pub const DMA_BUF_SYNC_READ: u32 = 1 << 0;
/// Request write access for [`export_sync_file`]
pub const DMA_BUF_SYNC_WRITE: u32 = 2 << 0;

/* Definitions from linux/dma-buf.h */
#[repr(C)]
struct DmaBufExportSyncFile {
    flags: u32,
    fd: i32,
}

const fn dma_buf_iowr<T>(code: u8) -> u32 {
    /* linux/ioctl.h */
    let typ = 'b' as u32;
    let size = std::mem::size_of::<T>() as u32;
    let dir = 0x1 | 0x2;
    (code as u32) | (typ << 8) | (size << 16) | (dir << 30)
}
const DMA_BUF_IOCTL_EXPORT_SYNC_FILE: u32 = dma_buf_iowr::<DmaBufExportSyncFile>(2);

/// Export the fences pending on a dmabuf as a sync_file
///
/// With [`DMA_BUF_SYNC_READ`] the sync_file signals once every pending write finished.
pub fn export_sync_file(dmabuf: BorrowedFd<'_>, flags: u32) -> io::Result<OwnedFd> {
    let mut arg = DmaBufExportSyncFile { flags, fd: -1 };
    loop {
        // SAFETY: `arg` matches the layout the ioctl expects and outlives the call
        let ret = unsafe {
            libc::ioctl(
                dmabuf.as_raw_fd(),
                DMA_BUF_IOCTL_EXPORT_SYNC_FILE as _,
                &mut arg as *mut DmaBufExportSyncFile,
            )
        };
        if ret == 0 {
            // SAFETY: the kernel just created this fd for us
            return Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) });
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR | libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

const PLANE_ASPECTS: [vk::ImageAspectFlags; MAX_PLANES] = [
    vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
];

fn unsupported(reason: String) -> ImageError {
    log::debug!("{}", reason);
    ImageError::UnsupportedFeature(reason)
}

impl GpuImage {
    /// Import a dmabuf-backed texture
    ///
    /// Fails with [`ImageError::UnsupportedFeature`] when the device has no dmabuf
    /// support, the fourcc is unknown or the buffer is disjoint, and with
    /// [`ImageError::Unsupported`] when the driver rejects the format/modifier pair. Both
    /// mean the caller should download the texture instead.
    pub fn new_for_dmabuf<T>(device: &GpuDevice, texture: &Arc<T>) -> ImageResult<Self>
    where
        T: AsDmabuf + Send + Sync + 'static,
    {
        if !device.has_feature(DeviceFeatures::DMABUF) {
            return Err(unsupported("Vulkan does not support dmabufs".into()));
        }

        let dmabuf = texture.dmabuf();
        let info = fourcc_info(dmabuf.fourcc).ok_or_else(|| {
            unsupported(format!("Vulkan doesn't support fourcc {}", fourcc_name(dmabuf.fourcc)))
        })?;
        if dmabuf.disjoint {
            return Err(unsupported("disjoint dmabufs are not supported".into()));
        }
        if dmabuf.planes.is_empty() || dmabuf.planes.len() > MAX_PLANES {
            return Err(ImageError::InvalidOperation {
                reason: format!("dmabuf with {} planes", dmabuf.planes.len()),
            });
        }
        check_size(dmabuf.width, dmabuf.height)?;
        if info.is_yuv && !device.has_feature(DeviceFeatures::YCBCR) {
            return Err(unsupported(format!(
                "no Y′CbCr conversion for {}",
                fourcc_name(dmabuf.fourcc)
            )));
        }

        let n_planes = dmabuf.planes.len() as u32;
        let query = FormatQuery::with_modifier(
            info.vk_format,
            dmabuf.modifier,
            n_planes,
            vk::ImageUsageFlags::SAMPLED,
            dmabuf.width,
            dmabuf.height,
        );
        let probed = device.supports_format(&query).ok_or_else(|| {
            let reason = format!(
                "Vulkan driver does not support format {}::{:016x} with {} planes",
                fourcc_name(dmabuf.fourcc),
                dmabuf.modifier,
                n_planes
            );
            log::debug!("{}", reason);
            ImageError::Unsupported(reason)
        })?;

        let mut flags = probed;
        if !dmabuf.premultiplied {
            flags |= ImageFlags::STRAIGHT_ALPHA;
        }
        if info.is_yuv {
            flags |= ImageFlags::EXTERNAL | ImageFlags::NO_BLIT;
        }
        let mut usage = vk::ImageUsageFlags::SAMPLED;
        if !flags.contains(ImageFlags::NO_BLIT) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let backend = device.backend().clone();
        let image = backend
            .create_image(&ImageCreateDesc {
                format: info.vk_format,
                width: dmabuf.width,
                height: dmabuf.height,
                mip_levels: 1,
                tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
                usage,
                initial_layout: vk::ImageLayout::UNDEFINED,
                external: Some(ExternalImage::ExplicitModifier {
                    modifier: dmabuf.modifier,
                    planes: dmabuf
                        .planes
                        .iter()
                        .map(|p| PlaneLayout {
                            offset: p.offset,
                            stride: u64::from(p.stride),
                        })
                        .collect(),
                }),
            })
            .map_err(|e| ImageError::api("vkCreateImage", e))?;

        let mut this = Self::from_raw(
            device,
            image,
            info.vk_format,
            info.memory_format(dmabuf.premultiplied),
            dmabuf.width,
            dmabuf.height,
            vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            usage,
            ImageState::new(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            ),
        );
        this.flags = flags;
        this.keep_alive = Some(texture.clone() as Arc<dyn Any + Send + Sync>);
        let allocator = device.external_allocator();
        this.allocator = Some(allocator.clone());

        let fd = dmabuf.planes[0].fd.try_clone()?;
        let type_bits = backend
            .memory_fd_properties(fd.as_fd())
            .map_err(|e| ImageError::api("vkGetMemoryFdPropertiesKHR", e))?;
        let memory_type = lowest_memory_type(type_bits).ok_or(ImageError::NoSuitableMemoryType)?;

        if device.has_feature(DeviceFeatures::SEMAPHORE_IMPORT) {
            match backend.export_dmabuf_sync_file(fd.as_fd()) {
                Ok(sync_file) => {
                    this.semaphore = Some(Semaphore::import_sync_file(backend.clone(), sync_file)?);
                }
                Err(e) => log::debug!("Failed to export sync_file from dmabuf: {}", e),
            }
        }

        let requirements = backend.image_memory_requirements(image);
        let allocation = allocator.alloc_external(
            requirements.size,
            memory_type,
            device.memory_type_flags(memory_type),
            ExternalMemory::ImportDmabuf(fd),
            image,
        )?;
        let (memory, offset) = (allocation.memory, allocation.offset);
        this.allocation = Some(allocation);
        backend
            .bind_image_memory(image, memory, offset)
            .map_err(|e| ImageError::api("vkBindImageMemory", e))?;

        if info.is_yuv {
            let conversion = device.ycbcr_conversion(info.vk_format)?;
            this.sampler = Some(
                backend
                    .create_sampler(Some(conversion))
                    .map_err(|e| ImageError::api("vkCreateSampler", e))?,
            );
            this.view = this.create_view(info.components, 1, Some(conversion))?;
        } else {
            this.view = this.create_view(info.components, 1, None)?;
        }

        log::debug!(
            "Imported {}x{} dmabuf {}::{:016x} as {:?}",
            dmabuf.width,
            dmabuf.height,
            fourcc_name(dmabuf.fourcc),
            dmabuf.modifier,
            info.vk_format
        );
        Ok(this)
    }

    /// Create an image that can later be exported with [`GpuImage::export_dmabuf`]
    pub fn new_dmabuf(
        device: &GpuDevice,
        format: MemoryFormat,
        width: u32,
        height: u32,
    ) -> ImageResult<Self> {
        if !device.has_feature(DeviceFeatures::DMABUF) {
            return Err(unsupported("Vulkan does not support dmabufs".into()));
        }
        check_size(width, height)?;

        let backend = device.backend().clone();
        let mut format = format;
        let (candidate, export) = loop {
            let found = candidates_for(format)
                .iter()
                .filter(|c| c.is_framebuffer_compatible())
                .find_map(|c| {
                    export_modifiers(backend.as_ref(), c.format, width, height).map(|m| (*c, m))
                });
            if let Some(found) = found {
                break found;
            }
            if format == MemoryFormat::DEFAULT {
                return Err(ImageError::Unsupported(format!(
                    "no exportable format for a {}x{} image",
                    width, height
                )));
            }
            format = fallback_for(format);
        };

        let mut flags = candidate.flags | ImageFlags::EXTERNAL;
        if format.alpha() == AlphaKind::Straight {
            flags |= ImageFlags::STRAIGHT_ALPHA;
        }
        let mut usage = EXPORT_USAGE;
        if export.can_blit {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        } else {
            flags |= ImageFlags::NO_BLIT;
        }

        let image = backend
            .create_image(&ImageCreateDesc {
                format: candidate.format,
                width,
                height,
                mip_levels: 1,
                tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
                usage,
                initial_layout: vk::ImageLayout::UNDEFINED,
                external: Some(ExternalImage::ModifierList(export.modifiers)),
            })
            .map_err(|e| ImageError::api("vkCreateImage", e))?;

        let mut this = Self::from_raw(
            device,
            image,
            candidate.format,
            format,
            width,
            height,
            vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            usage,
            ImageState::new(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            ),
        );
        this.flags = flags;
        let allocator = device.external_allocator();
        this.allocator = Some(allocator.clone());

        let requirements = backend.image_memory_requirements(image);
        let memory_type = lowest_memory_type(requirements.memory_type_bits)
            .ok_or(ImageError::NoSuitableMemoryType)?;
        let allocation = allocator.alloc_external(
            requirements.size,
            memory_type,
            device.memory_type_flags(memory_type),
            ExternalMemory::ExportDmabuf,
            image,
        )?;
        let (memory, offset) = (allocation.memory, allocation.offset);
        this.allocation = Some(allocation);
        backend
            .bind_image_memory(image, memory, offset)
            .map_err(|e| ImageError::api("vkBindImageMemory", e))?;

        this.view = this.create_view(candidate.components, 1, None)?;
        Ok(this)
    }

    /// Describe the image's memory as a dmabuf
    ///
    /// Every plane carries its own fd, independent of the image and of the other planes.
    pub fn export_dmabuf(&self) -> ImageResult<DmabufDescriptor> {
        if !self.flags.contains(ImageFlags::EXTERNAL) {
            return Err(ImageError::InvalidOperation {
                reason: "image was not created for export".into(),
            });
        }
        let fourcc = self.memory_format.dmabuf_fourcc().ok_or_else(|| {
            unsupported(format!("no fourcc for {:?}", self.memory_format))
        })?;
        let memory = self
            .allocation
            .as_ref()
            .map(|a| a.memory)
            .ok_or_else(|| ImageError::InvalidOperation {
                reason: "image has no memory to export".into(),
            })?;

        let modifier = self
            .backend
            .image_drm_format_modifier(self.image)
            .map_err(|e| ImageError::api("vkGetImageDrmFormatModifierPropertiesEXT", e))?;
        let n_planes = self
            .backend
            .format_properties(self.vk_format, true)
            .modifiers
            .iter()
            .find(|m| m.modifier == modifier)
            .map_or(0, |m| m.plane_count as usize);
        if n_planes == 0 || n_planes > MAX_PLANES {
            return Err(unsupported(format!(
                "modifier {:016x} of {:?} has {} planes",
                modifier, self.vk_format, n_planes
            )));
        }

        let fd = self
            .backend
            .export_memory_fd(memory)
            .map_err(|e| ImageError::api("vkGetMemoryFdKHR", e))?;

        let mut planes = Vec::with_capacity(n_planes);
        for aspect in &PLANE_ASPECTS[..n_planes] {
            let layout = self.backend.subresource_layout(self.image, *aspect);
            let stride = u32::try_from(layout.row_pitch).map_err(|_| ImageError::InvalidOperation {
                reason: format!("row pitch {} does not fit a dmabuf", layout.row_pitch),
            })?;
            planes.push(DmabufPlane {
                fd: fd.try_clone()?,
                offset: layout.offset,
                stride,
            });
        }

        Ok(DmabufDescriptor {
            width: self.width,
            height: self.height,
            fourcc,
            modifier,
            premultiplied: !self.flags.contains(ImageFlags::STRAIGHT_ALPHA),
            planes,
            disjoint: false,
        })
    }

    /// Export the image and wrap it with `builder`
    pub fn to_dmabuf_texture<B: DmabufTextureBuilder>(&self, builder: &B) -> ImageResult<B::Texture> {
        let dmabuf = self.export_dmabuf()?;
        builder.build(dmabuf).map_err(|e| {
            log::debug!("Failed to create dmabuf texture: {}", e);
            ImageError::InvalidOperation {
                reason: format!("failed to create dmabuf texture: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::sync::SemaphoreWaits;

    fn setup() -> (Arc<MockBackend>, GpuDevice) {
        let backend = Arc::new(MockBackend::new());
        let device = GpuDevice::new(backend.clone(), MockBackend::capabilities());
        (backend, device)
    }

    fn plane(stride: u32, offset: u64) -> DmabufPlane {
        DmabufPlane {
            fd: OwnedFd::from(tempfile::tempfile().unwrap()),
            offset,
            stride,
        }
    }

    fn rgba_dmabuf(width: u32, height: u32) -> DmabufDescriptor {
        DmabufDescriptor {
            width,
            height,
            fourcc: fourcc('A', 'B', '2', '4'),
            modifier: DRM_FORMAT_MOD_LINEAR,
            premultiplied: true,
            planes: vec![plane(width * 4, 0)],
            disjoint: false,
        }
    }

    fn fd_is_open(fd: i32) -> bool {
        // SAFETY: F_GETFD only inspects the descriptor table
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    struct Collect;

    impl DmabufTextureBuilder for Collect {
        type Texture = DmabufDescriptor;
        type Error = String;

        fn build(&self, dmabuf: DmabufDescriptor) -> Result<DmabufDescriptor, String> {
            Ok(dmabuf)
        }
    }

    struct Reject;

    impl DmabufTextureBuilder for Reject {
        type Texture = ();
        type Error = &'static str;

        fn build(&self, _dmabuf: DmabufDescriptor) -> Result<(), &'static str> {
            Err("compositor said no")
        }
    }

    #[test]
    fn test_fourcc_codes() {
        assert_eq!(fourcc('A', 'R', '2', '4'), 0x3432_5241);
        assert_eq!(fourcc_name(fourcc('N', 'V', '1', '2')), "NV12");
    }

    #[test]
    fn test_fourcc_table() {
        let argb = fourcc_info(fourcc('A', 'R', '2', '4')).unwrap();
        assert_eq!(argb.vk_format, vk::Format::B8G8R8A8_UNORM);
        assert!(!argb.is_yuv);
        assert_eq!(argb.memory_format(false), MemoryFormat::B8G8R8A8);

        let nv12 = fourcc_info(fourcc('N', 'V', '1', '2')).unwrap();
        assert!(nv12.is_yuv);
        assert_eq!(nv12.vk_format, vk::Format::G8_B8R8_2PLANE_420_UNORM);

        assert!(fourcc_info(fourcc('Z', 'Z', 'Z', 'Z')).is_none());
    }

    #[test]
    fn test_exportable_formats_round_trip_through_fourcc() {
        for format in MemoryFormat::ALL {
            if let Some(code) = format.dmabuf_fourcc() {
                let info = fourcc_info(code).unwrap();
                let premultiplied = format.alpha() != AlphaKind::Straight;
                assert_eq!(info.memory_format(premultiplied), format, "{:?}", format);
            }
        }
    }

    #[test]
    fn test_import_rgba() {
        let (backend, device) = setup();
        let texture = Arc::new(rgba_dmabuf(64, 32));
        let image = GpuImage::new_for_dmabuf(&device, &texture).unwrap();

        assert_eq!(image.vk_format(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(image.vk_tiling(), vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT);
        assert_eq!(image.vk_image_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(image.memory_format(), MemoryFormat::R8G8B8A8Premultiplied);
        assert!(!image.flags().contains(ImageFlags::STRAIGHT_ALPHA));
        assert!(image.vk_sampler().is_none());

        let calls = backend.calls();
        assert_eq!(calls.memory_imported, 1);
        assert_eq!(calls.last_memory_type, Some(MockBackend::FD_MEMORY_TYPE));
        match calls.last_image.unwrap().external {
            Some(ExternalImage::ExplicitModifier { modifier, planes }) => {
                assert_eq!(modifier, DRM_FORMAT_MOD_LINEAR);
                assert_eq!(planes, vec![PlaneLayout { offset: 0, stride: 256 }]);
            }
            other => panic!("unexpected external setup {:?}", other),
        }
    }

    #[test]
    fn test_import_waits_on_exported_sync_file() {
        let backend = Arc::new(MockBackend::new().with_sync_files());
        let device = GpuDevice::new(backend.clone(), MockBackend::capabilities());
        let texture = Arc::new(rgba_dmabuf(32, 32));
        let mut image = GpuImage::new_for_dmabuf(&device, &texture).unwrap();

        let calls = backend.calls();
        assert_eq!(calls.sync_files_exported, 1);
        assert_eq!(calls.semaphores_imported, 1);

        let mut waits = SemaphoreWaits::new();
        image.transition(&mut waits, MockBackend::command_buffer(), ImageState::SHADER_READ);
        assert_eq!(waits.len(), 1);
        assert_eq!(waits.stages(), &[vk::PipelineStageFlags::FRAGMENT_SHADER]);
        assert_eq!(backend.calls().barriers.len(), 1);

        image.transition(&mut waits, MockBackend::command_buffer(), ImageState::TRANSFER_SRC);
        assert_eq!(waits.len(), 1);

        drop(image);
        assert_eq!(backend.calls().semaphores_destroyed, 1);
    }

    #[test]
    fn test_import_without_sync_file_support() {
        let (backend, device) = setup();
        let texture = Arc::new(rgba_dmabuf(32, 32));
        let mut image = GpuImage::new_for_dmabuf(&device, &texture).unwrap();
        assert_eq!(backend.calls().semaphores_imported, 0);

        let mut waits = SemaphoreWaits::new();
        image.transition(&mut waits, MockBackend::command_buffer(), ImageState::SHADER_READ);
        assert!(waits.is_empty());
    }

    #[test]
    fn test_import_skips_sync_file_without_semaphore_import() {
        let backend = Arc::new(MockBackend::new().with_sync_files());
        let mut capabilities = MockBackend::capabilities();
        capabilities.features.remove(DeviceFeatures::SEMAPHORE_IMPORT);
        let device = GpuDevice::new(backend.clone(), capabilities);

        let texture = Arc::new(rgba_dmabuf(32, 32));
        GpuImage::new_for_dmabuf(&device, &texture).unwrap();
        let calls = backend.calls();
        assert_eq!(calls.sync_files_exported, 0);
        assert_eq!(calls.semaphores_imported, 0);
    }

    #[test]
    fn test_import_keeps_texture_alive() {
        let (_backend, device) = setup();
        let texture = Arc::new(rgba_dmabuf(16, 16));
        let image = GpuImage::new_for_dmabuf(&device, &texture).unwrap();
        assert_eq!(Arc::strong_count(&texture), 2);
        drop(image);
        assert_eq!(Arc::strong_count(&texture), 1);
    }

    #[test]
    fn test_import_duplicates_fd() {
        let (backend, device) = setup();
        let texture = Arc::new(rgba_dmabuf(16, 16));
        let original = texture.planes[0].fd.as_raw_fd();
        let _image = GpuImage::new_for_dmabuf(&device, &texture).unwrap();

        let imported = backend.calls().last_imported_fd.unwrap();
        assert_ne!(imported, original);
        assert!(fd_is_open(original));
    }

    #[test]
    fn test_import_straight_alpha() {
        let (_backend, device) = setup();
        let mut dmabuf = rgba_dmabuf(16, 16);
        dmabuf.premultiplied = false;
        let image = GpuImage::new_for_dmabuf(&device, &Arc::new(dmabuf)).unwrap();
        assert!(image.flags().contains(ImageFlags::STRAIGHT_ALPHA));
        assert_eq!(image.memory_format(), MemoryFormat::R8G8B8A8);
    }

    #[test]
    fn test_disjoint_import_is_rejected_early() {
        let (backend, device) = setup();
        let mut dmabuf = rgba_dmabuf(16, 16);
        dmabuf.disjoint = true;
        let result = GpuImage::new_for_dmabuf(&device, &Arc::new(dmabuf));
        assert!(matches!(result, Err(ImageError::UnsupportedFeature(_))));

        let calls = backend.calls();
        assert_eq!(calls.images_created, 0);
        assert_eq!(calls.memory_allocated, 0);
    }

    #[test]
    fn test_unknown_fourcc() {
        let (_backend, device) = setup();
        let mut dmabuf = rgba_dmabuf(16, 16);
        dmabuf.fourcc = fourcc('Q', '4', '1', '0');
        let err = GpuImage::new_for_dmabuf(&device, &Arc::new(dmabuf)).unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_import_without_dmabuf_feature() {
        let backend = Arc::new(MockBackend::new());
        let mut caps = MockBackend::capabilities();
        caps.features.remove(DeviceFeatures::DMABUF);
        let device = GpuDevice::new(backend.clone(), caps);

        let err = GpuImage::new_for_dmabuf(&device, &Arc::new(rgba_dmabuf(16, 16))).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedFeature(_)));
        assert!(GpuImage::new_dmabuf(&device, MemoryFormat::DEFAULT, 16, 16).is_err());
        assert_eq!(backend.calls().images_created, 0);
    }

    #[test]
    fn test_unsupported_modifier() {
        let (backend, device) = setup();
        let mut dmabuf = rgba_dmabuf(16, 16);
        dmabuf.modifier = 0x0123_4567;
        let result = GpuImage::new_for_dmabuf(&device, &Arc::new(dmabuf));
        assert!(matches!(result, Err(ImageError::Unsupported(_))));
        assert_eq!(backend.calls().images_created, 0);
    }

    #[test]
    fn test_import_nv12() {
        let (backend, device) = setup();
        let dmabuf = DmabufDescriptor {
            width: 64,
            height: 64,
            fourcc: fourcc('N', 'V', '1', '2'),
            modifier: DRM_FORMAT_MOD_LINEAR,
            premultiplied: true,
            planes: vec![plane(64, 0), plane(64, 64 * 64)],
            disjoint: false,
        };
        let image = GpuImage::new_for_dmabuf(&device, &Arc::new(dmabuf)).unwrap();

        assert!(image.flags().contains(ImageFlags::EXTERNAL | ImageFlags::NO_BLIT));
        assert!(!image.vk_usage().contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(image.vk_sampler().is_some());

        let calls = backend.calls();
        assert_eq!(calls.conversions_created, 1);
        assert!(calls.last_view.unwrap().conversion.is_some());

        drop(image);
        assert_eq!(backend.calls().samplers_destroyed, 1);
    }

    #[test]
    fn test_export_descriptor() {
        let (backend, device) = setup();
        let image = GpuImage::new_dmabuf(&device, MemoryFormat::DEFAULT, 64, 64).unwrap();
        assert!(image.flags().contains(ImageFlags::EXTERNAL));
        // the tiled modifier in the list cannot blit
        assert!(image.flags().contains(ImageFlags::NO_BLIT));
        assert!(!image.vk_usage().contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert_eq!(backend.calls().memory_exportable, 1);

        let dmabuf = image.export_dmabuf().unwrap();
        assert_eq!(dmabuf.width, 64);
        assert_eq!(dmabuf.height, 64);
        assert_eq!(dmabuf.fourcc, fourcc('A', 'B', '2', '4'));
        assert_eq!(dmabuf.modifier, MockBackend::LINEAR_MODIFIER);
        assert!(dmabuf.premultiplied);
        assert!(!dmabuf.disjoint);
        assert_eq!(dmabuf.n_planes(), 1);
        assert_eq!(dmabuf.planes[0].stride, 256);
        assert_eq!(dmabuf.planes[0].offset, 0);
    }

    #[test]
    fn test_export_plane_fds_outlive_image() {
        let (_backend, device) = setup();
        let image = GpuImage::new_dmabuf(&device, MemoryFormat::DEFAULT, 16, 16).unwrap();
        let dmabuf = image.export_dmabuf().unwrap();
        drop(image);

        let raw = dmabuf.planes[0].fd.as_raw_fd();
        assert!(fd_is_open(raw));
        drop(dmabuf);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn test_export_straight_format_falls_back_to_premultiplied() {
        let (_backend, device) = setup();
        let image = GpuImage::new_dmabuf(&device, MemoryFormat::R8G8B8A8, 16, 16).unwrap();
        // straight candidates carry a flag, so they cannot back a render target
        assert_eq!(image.memory_format(), MemoryFormat::R8G8B8A8Premultiplied);
        assert!(!image.flags().contains(ImageFlags::STRAIGHT_ALPHA));
        assert!(image.export_dmabuf().unwrap().premultiplied);
    }

    #[test]
    fn test_export_then_import() {
        let (_backend, device) = setup();
        let exported = GpuImage::new_dmabuf(&device, MemoryFormat::DEFAULT, 48, 32).unwrap();
        let dmabuf = Arc::new(exported.to_dmabuf_texture(&Collect).unwrap());

        let imported = GpuImage::new_for_dmabuf(&device, &dmabuf).unwrap();
        assert_eq!(imported.width(), exported.width());
        assert_eq!(imported.height(), exported.height());
        assert_eq!(
            imported.flags().contains(ImageFlags::STRAIGHT_ALPHA),
            exported.flags().contains(ImageFlags::STRAIGHT_ALPHA)
        );
        assert_eq!(imported.memory_format(), exported.memory_format());
    }

    #[test]
    fn test_export_requires_external_image() {
        let (_backend, device) = setup();
        let image = GpuImage::new_for_atlas(&device, 16, 16).unwrap();
        assert!(matches!(
            image.export_dmabuf(),
            Err(ImageError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_failed_texture_build() {
        let (_backend, device) = setup();
        let image = GpuImage::new_dmabuf(&device, MemoryFormat::DEFAULT, 16, 16).unwrap();
        let err = image.to_dmabuf_texture(&Reject).unwrap_err();
        assert!(err.to_string().contains("compositor said no"));
    }
}
