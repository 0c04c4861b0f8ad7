//! Error types for image allocation and sharing
//!
//! Every fallible operation in the crate returns [`ImageResult`]. Driver results are
//! wrapped together with the name of the Vulkan entry point that produced them so a
//! log line is enough to tell which call failed.

use ash::vk;
use thiserror::Error;

/// Image manager errors
#[derive(Error, Debug)]
pub enum ImageError {
    /// A Vulkan call returned a non-success result
    #[error("{call} failed: {result:?}")]
    Api {
        /// Name of the failing entry point
        call: &'static str,
        /// Result code returned by the driver
        result: vk::Result,
    },

    /// No format, tiling or modifier combination is supported by the device
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// The request hits a known gap (disjoint dmabufs, unknown fourcc, missing extension)
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No memory type satisfies the allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// File descriptor plumbing failed (dup, ioctl, mmap)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageError {
    /// Build an [`ImageError::Api`] for the named call
    pub fn api(call: &'static str, result: vk::Result) -> Self {
        Self::Api { call, result }
    }

    /// Whether the error means "no image on this path" rather than a driver failure
    ///
    /// Callers use this to pick an alternate rendering path, e.g. a CPU copy instead of
    /// a zero-copy import.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::UnsupportedFeature(_))
    }
}

/// Result type for image operations
pub type ImageResult<T> = Result<T, ImageError>;
