//! Cross-device synchronization for imported images
//!
//! An imported dmabuf may still be written by its producer. The producer's pending work is
//! captured as a sync_file, imported into a [`Semaphore`], and waited on by the first
//! submission that touches the image.

use crate::backend::DeviceBackend;
use crate::error::{ImageError, ImageResult};
use ash::vk;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// RAII wrapper for a semaphore holding an imported sync_file payload
pub struct Semaphore {
    backend: Arc<dyn DeviceBackend>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore and import `sync_file` into it temporarily
    pub fn import_sync_file(backend: Arc<dyn DeviceBackend>, sync_file: OwnedFd) -> ImageResult<Self> {
        let semaphore = backend
            .import_semaphore_sync_fd(sync_file)
            .map_err(|e| ImageError::api("vkImportSemaphoreFdKHR", e))?;
        Ok(Self { backend, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.semaphore);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// Semaphores the next queue submission has to wait on
#[derive(Debug, Default)]
pub struct SemaphoreWaits {
    semaphores: Vec<vk::Semaphore>,
    stages: Vec<vk::PipelineStageFlags>,
}

impl SemaphoreWaits {
    /// Empty wait list
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `semaphore` before `stage`
    pub fn add_wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.semaphores.push(semaphore);
        self.stages.push(stage);
    }

    /// Semaphores, parallel to [`SemaphoreWaits::stages`]
    pub fn semaphores(&self) -> &[vk::Semaphore] {
        &self.semaphores
    }

    /// Destination stages, parallel to [`SemaphoreWaits::semaphores`]
    pub fn stages(&self) -> &[vk::PipelineStageFlags] {
        &self.stages
    }

    /// Number of waits
    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    /// Whether there is nothing to wait on
    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    /// Forget all waits after they were submitted
    pub fn clear(&mut self) {
        self.semaphores.clear();
        self.stages.clear();
    }
}
