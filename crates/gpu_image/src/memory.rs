//! Device memory allocation
//!
//! Every image gets its own `VkDeviceMemory`; the allocator only tracks which memory type
//! it hands out and how much of it is live. Allocators are shared between images through
//! `Arc` and guard their bookkeeping with a mutex.

use crate::backend::{DeviceBackend, ExternalMemory, MemoryAllocateDesc};
use crate::error::{ImageError, ImageResult};
use ash::vk;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Memory properties preferred for CPU-written images
pub const MEMORY_MAPPABLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
        | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
);

/// One block of device memory backing an image
#[derive(Debug)]
pub struct Allocation {
    /// Backing memory handle
    pub memory: vk::DeviceMemory,
    /// Offset of the image inside `memory`
    pub offset: vk::DeviceSize,
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Properties of the memory type
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Persistent CPU mapping of the whole block
    pub mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapping is owned by the allocation and only dereferenced through
// `&mut GpuImage`, so moving it between threads cannot alias.
unsafe impl Send for Allocation {}

/// Live allocation counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocations not yet freed
    pub live_allocations: usize,
    /// Bytes not yet freed
    pub live_bytes: vk::DeviceSize,
}

/// Allocator for one memory type
pub struct MemoryAllocator {
    backend: Arc<dyn DeviceBackend>,
    memory_type_index: Option<u32>,
    memory_flags: vk::MemoryPropertyFlags,
    stats: Mutex<AllocatorStats>,
}

impl MemoryAllocator {
    /// Allocator handing out memory of one type
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        memory_type_index: u32,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            backend,
            memory_type_index: Some(memory_type_index),
            memory_flags,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    /// Allocator for dmabuf memory, whose type is chosen per allocation
    pub fn external(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            memory_type_index: None,
            memory_flags: vk::MemoryPropertyFlags::empty(),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    /// Memory type this allocator is bound to
    pub fn memory_type_index(&self) -> Option<u32> {
        self.memory_type_index
    }

    /// Properties of the bound memory type
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Current counters
    pub fn stats(&self) -> AllocatorStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Allocate memory for `requirements`, mapping it when host visible
    pub fn alloc(&self, requirements: &vk::MemoryRequirements) -> ImageResult<Allocation> {
        let memory_type_index = self.memory_type_index.ok_or_else(|| ImageError::InvalidOperation {
            reason: "external allocator needs an explicit memory type".into(),
        })?;

        let memory = self
            .backend
            .allocate_memory(MemoryAllocateDesc {
                size: requirements.size,
                memory_type_index,
                external: ExternalMemory::None,
                dedicated_image: None,
            })
            .map_err(|e| ImageError::api("vkAllocateMemory", e))?;

        let mapped = if self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match self.backend.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    self.backend.free_memory(memory);
                    return Err(ImageError::api("vkMapMemory", e));
                }
            }
        } else {
            None
        };

        self.track(requirements.size, true);
        Ok(Allocation {
            memory,
            offset: 0,
            size: requirements.size,
            memory_flags: self.memory_flags,
            mapped,
        })
    }

    /// Allocate dedicated memory that is imported from or exportable as a dmabuf
    pub fn alloc_external(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        memory_flags: vk::MemoryPropertyFlags,
        external: ExternalMemory,
        image: vk::Image,
    ) -> ImageResult<Allocation> {
        let memory = self
            .backend
            .allocate_memory(MemoryAllocateDesc {
                size,
                memory_type_index,
                external,
                dedicated_image: Some(image),
            })
            .map_err(|e| ImageError::api("vkAllocateMemory", e))?;

        self.track(size, true);
        Ok(Allocation {
            memory,
            offset: 0,
            size,
            memory_flags,
            mapped: None,
        })
    }

    /// Release an allocation made by this allocator
    pub fn free(&self, allocation: Allocation) {
        self.backend.free_memory(allocation.memory);
        self.track(allocation.size, false);
    }

    fn track(&self, size: vk::DeviceSize, added: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            if added {
                stats.live_allocations += 1;
                stats.live_bytes += size;
            } else {
                stats.live_allocations = stats.live_allocations.saturating_sub(1);
                stats.live_bytes = stats.live_bytes.saturating_sub(size);
            }
        }
    }
}

impl std::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("memory_type_index", &self.memory_type_index)
            .field("memory_flags", &self.memory_flags)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Index of the lowest memory type set in `type_bits`
pub fn lowest_memory_type(type_bits: u32) -> Option<u32> {
    (type_bits != 0).then(|| type_bits.trailing_zeros())
}
