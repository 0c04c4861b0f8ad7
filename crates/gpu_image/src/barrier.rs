//! Image layout tracking
//!
//! Each image remembers the stage, access and layout of its last use. Moving it to a new
//! use records one pipeline barrier covering the whole image and updates the record, so
//! the tracked state always matches the last barrier issued.

use crate::backend::ImageBarrier;
use crate::image::GpuImage;
use crate::sync::SemaphoreWaits;
use ash::vk;

/// Stage, access and layout of an image's last use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageState {
    /// Pipeline stage of the access
    pub stage: vk::PipelineStageFlags,
    /// Layout the image is in
    pub layout: vk::ImageLayout,
    /// Access mask of the access
    pub access: vk::AccessFlags,
}

impl ImageState {
    /// Create a state triple
    pub const fn new(
        stage: vk::PipelineStageFlags,
        layout: vk::ImageLayout,
        access: vk::AccessFlags,
    ) -> Self {
        Self { stage, layout, access }
    }

    /// Sampled from a fragment shader
    pub const SHADER_READ: Self = Self::new(
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::AccessFlags::SHADER_READ,
    );

    /// Rendered to as a color attachment
    pub const COLOR_ATTACHMENT: Self = Self::new(
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::AccessFlags::from_raw(
            vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
    );

    /// Destination of a copy or blit
    pub const TRANSFER_DST: Self = Self::new(
        vk::PipelineStageFlags::TRANSFER,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::AccessFlags::TRANSFER_WRITE,
    );

    /// Source of a copy or blit
    pub const TRANSFER_SRC: Self = Self::new(
        vk::PipelineStageFlags::TRANSFER,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::AccessFlags::TRANSFER_READ,
    );
}

impl GpuImage {
    /// Move the image to `target`, recording the barrier into `command_buffer`
    ///
    /// Does nothing when the image is already in `target`. On first use of an imported
    /// image, the semaphore carrying the producer's fence is added to `waits` at the
    /// target stage.
    pub fn transition(
        &mut self,
        waits: &mut SemaphoreWaits,
        command_buffer: vk::CommandBuffer,
        target: ImageState,
    ) {
        if self.state == target {
            return;
        }

        if self.state.layout == vk::ImageLayout::UNDEFINED {
            if let Some(semaphore) = &self.semaphore {
                waits.add_wait(semaphore.handle(), target.stage);
            }
        }

        self.backend.cmd_image_barrier(
            command_buffer,
            &ImageBarrier {
                image: self.image,
                src_stage: self.state.stage,
                dst_stage: target.stage,
                src_access: self.state.access,
                dst_access: target.access,
                old_layout: self.state.layout,
                new_layout: target.layout,
            },
        );

        self.state = target;
    }
}
