//! # gpu_image
//!
//! GPU image management for a Vulkan renderer.
//!
//! ## Features
//!
//! - **Format negotiation**: memory formats resolve to the first native format the device
//!   supports, falling back to more general formats when needed
//! - **Image creation**: upload, swapchain, atlas, offscreen and dmabuf images
//! - **Layout tracking**: each image records its last stage, access and layout and emits
//!   one barrier per transition
//! - **dmabuf sharing**: import with sync_file waits, export with per-plane fds
//! - **Wayland feedback**: ingestion of `zwp_linux_dmabuf_feedback_v1` format tranches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpu_image::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ImageConfig::default();
//!     let device = gpu_image::vulkan::create_device(&config)?;
//!
//!     let mut image = GpuImage::new_for_upload(&device, false, MemoryFormat::DEFAULT, 256, 256)?;
//!     if let Some(mapped) = image.mapped_data() {
//!         mapped.data.fill(0xff);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod barrier;
pub mod config;
pub mod device;
pub mod dmabuf;
pub mod error;
pub mod feedback;
pub mod format;
pub mod image;
pub mod memory;
pub mod probe;
pub mod sync;
pub mod vulkan;

#[cfg(test)]
mod mock;

pub use error::{ImageError, ImageResult};

/// Common imports for users of the crate
pub mod prelude {
    pub use crate::{
        barrier::ImageState,
        config::{Config, ImageConfig},
        device::{DeviceCapabilities, DeviceFeatures, GpuDevice},
        dmabuf::{AsDmabuf, DmabufDescriptor, DmabufPlane, DmabufTextureBuilder},
        error::{ImageError, ImageResult},
        feedback::{DmabufFeedback, DmabufFormats, FeedbackEvent},
        format::{ImageFlags, MemoryFormat},
        image::GpuImage,
        sync::SemaphoreWaits,
    };
}
