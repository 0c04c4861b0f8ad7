//! Device capability probing
//!
//! Answers "can this device hold a `width`×`height` image of this format, with this
//! tiling and usage" before any image is created. A negative answer is a normal outcome
//! that drives candidate skipping and fallback, so it is an `Option`, not an error.

use crate::backend::{DeviceBackend, ImageFormatQuery};
use crate::format::ImageFlags;
use ash::vk;

/// A format/tiling/usage/size combination to probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatQuery {
    /// Native format
    pub format: vk::Format,
    /// DRM modifier, only consulted for DRM modifier tiling
    pub modifier: u64,
    /// Memory plane count the modifier must report, only consulted for DRM modifier tiling
    pub plane_count: u32,
    /// Tiling mode
    pub tiling: vk::ImageTiling,
    /// Intended usage
    pub usage: vk::ImageUsageFlags,
    /// Required width
    pub width: u32,
    /// Required height
    pub height: u32,
}

impl FormatQuery {
    /// Query for optimal or linear tiling
    pub fn new(
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            format,
            modifier: 0,
            plane_count: 1,
            tiling,
            usage,
            width,
            height,
        }
    }

    /// Query for DRM modifier tiling
    pub fn with_modifier(
        format: vk::Format,
        modifier: u64,
        plane_count: u32,
        usage: vk::ImageUsageFlags,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            format,
            modifier,
            plane_count,
            tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            usage,
            width,
            height,
        }
    }
}

/// Format features a usage needs
pub fn required_features(usage: vk::ImageUsageFlags) -> vk::FormatFeatureFlags {
    let mut features = vk::FormatFeatureFlags::empty();
    if usage.contains(vk::ImageUsageFlags::SAMPLED) {
        features |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
    }
    if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND;
    }
    features
}

/// Whether the device supports `query`, and with which extra image flags
///
/// Returns `None` when the tiling lacks the features the usage needs, when no modifier
/// matches exactly, or when the device's maximum extent is too small. The only flag
/// produced is [`ImageFlags::NO_BLIT`], set when the format cannot be a blit source.
pub fn supports(backend: &dyn DeviceBackend, query: &FormatQuery) -> Option<ImageFlags> {
    let is_drm = query.tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT;
    let properties = backend.format_properties(query.format, is_drm);

    let features = match query.tiling {
        vk::ImageTiling::OPTIMAL => properties.optimal,
        vk::ImageTiling::LINEAR => properties.linear,
        vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT => {
            let found = properties
                .modifiers
                .iter()
                .find(|m| m.modifier == query.modifier && m.plane_count == query.plane_count);
            match found {
                Some(m) => m.features,
                None => {
                    log::debug!(
                        "{:?} has no modifier {:#018x} with {} planes",
                        query.format,
                        query.modifier,
                        query.plane_count
                    );
                    return None;
                }
            }
        }
        _ => return None,
    };

    let required = required_features(query.usage);
    if !features.contains(required) {
        return None;
    }

    let limits = match backend.image_format_properties(&ImageFormatQuery {
        format: query.format,
        tiling: query.tiling,
        usage: query.usage,
        modifier: query.modifier,
    }) {
        Ok(limits) => limits,
        Err(e) => {
            if e != vk::Result::ERROR_FORMAT_NOT_SUPPORTED {
                log::warn!("vkGetPhysicalDeviceImageFormatProperties2 failed for {:?}: {:?}", query.format, e);
            }
            return None;
        }
    };

    if limits.max_extent.width < query.width || limits.max_extent.height < query.height {
        log::debug!(
            "{:?} {:?} limited to {}x{}, {}x{} requested",
            query.format,
            query.tiling,
            limits.max_extent.width,
            limits.max_extent.height,
            query.width,
            query.height
        );
        return None;
    }

    let mut flags = ImageFlags::empty();
    if !features.contains(vk::FormatFeatureFlags::BLIT_SRC) {
        flags |= ImageFlags::NO_BLIT;
    }
    Some(flags)
}

/// Modifiers an exportable image of one format can be created with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportModifiers {
    /// Usable single-plane modifiers, in driver order
    pub modifiers: Vec<u64>,
    /// Every listed modifier supports blitting from the image
    pub can_blit: bool,
}

/// Usage of images created for export
pub const EXPORT_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::SAMPLED.as_raw() | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw(),
);

/// Collect the modifiers an exportable `width`×`height` image of `format` may use
///
/// Only single-plane modifiers that can be sampled and rendered to with blending are
/// offered. Size limits are checked for rendering only, the sampling side is covered by
/// the feature bits. Returns `None` when the list is empty.
pub fn export_modifiers(
    backend: &dyn DeviceBackend,
    format: vk::Format,
    width: u32,
    height: u32,
) -> Option<ExportModifiers> {
    let needed = vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND;
    let properties = backend.format_properties(format, true);

    let mut result = ExportModifiers {
        modifiers: Vec::with_capacity(properties.modifiers.len()),
        can_blit: true,
    };
    for m in &properties.modifiers {
        if m.plane_count != 1 || !m.features.contains(needed) {
            continue;
        }
        let query = FormatQuery::with_modifier(
            format,
            m.modifier,
            1,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            width,
            height,
        );
        if supports(backend, &query).is_none() {
            continue;
        }
        result.modifiers.push(m.modifier);
        result.can_blit &= m.features.contains(vk::FormatFeatureFlags::BLIT_SRC);
    }

    if result.modifiers.is_empty() {
        None
    } else {
        Some(result)
    }
}
