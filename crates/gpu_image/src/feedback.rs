//! Wayland dmabuf feedback ingestion
//!
//! The compositor describes the dmabuf formats it can consume through
//! `zwp_linux_dmabuf_feedback_v1`: a shared-memory format table, then per-device
//! tranches of indices into it, each batch terminated by `done`. [`DmabufFeedback`]
//! consumes those events (the protocol transport stays with the caller) and publishes a
//! [`DmabufFormats`] list ordered by priority every time a batch completes.
//!
//! When a secondary format list is known (what the renderer itself can import), the
//! published list is the intersection, ordered by the secondary list's priorities within
//! each compositor tranche.

use bitflags::bitflags;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use thiserror::Error;

use crate::dmabuf::fourcc_name;

/// A (fourcc, modifier) pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmabufFormat {
    /// DRM fourcc
    pub fourcc: u32,
    /// DRM format modifier
    pub modifier: u64,
}

impl DmabufFormat {
    /// Create a format pair
    pub const fn new(fourcc: u32, modifier: u64) -> Self {
        Self { fourcc, modifier }
    }
}

/// Formats split into priority groups, most preferred first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmabufFormats {
    formats: Vec<DmabufFormat>,
    group_ends: Vec<usize>,
}

impl DmabufFormats {
    /// Start building a list
    pub fn builder() -> DmabufFormatsBuilder {
        DmabufFormatsBuilder::default()
    }

    /// Total number of formats
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the list has no formats
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Format at `index`
    pub fn get(&self, index: usize) -> Option<DmabufFormat> {
        self.formats.get(index).copied()
    }

    /// All formats in priority order
    pub fn iter(&self) -> impl Iterator<Item = &DmabufFormat> {
        self.formats.iter()
    }

    /// End of the priority group containing `index`
    pub fn next_priority(&self, index: usize) -> usize {
        self.group_ends
            .iter()
            .copied()
            .find(|&end| end > index)
            .unwrap_or(self.formats.len())
    }

    /// Priority groups, most preferred first
    pub fn priority_groups(&self) -> impl Iterator<Item = &[DmabufFormat]> {
        let starts = std::iter::once(0).chain(self.group_ends.iter().copied());
        starts
            .zip(self.group_ends.iter().copied())
            .map(move |(start, end)| &self.formats[start..end])
    }

    /// Whether the list contains `format` in any group
    pub fn contains(&self, format: DmabufFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Incremental construction of [`DmabufFormats`]
///
/// Formats already added are ignored, and closing an empty group is a no-op.
#[derive(Debug, Default)]
pub struct DmabufFormatsBuilder {
    formats: Vec<DmabufFormat>,
    group_ends: Vec<usize>,
}

impl DmabufFormatsBuilder {
    /// Add a format to the current group
    pub fn add_format(&mut self, fourcc: u32, modifier: u64) -> &mut Self {
        let format = DmabufFormat::new(fourcc, modifier);
        if !self.formats.contains(&format) {
            self.formats.push(format);
        }
        self
    }

    /// Close the current group
    pub fn next_priority(&mut self) -> &mut Self {
        let start = self.group_ends.last().copied().unwrap_or(0);
        if self.formats.len() > start {
            self.group_ends.push(self.formats.len());
        }
        self
    }

    /// Finish, closing the last group
    pub fn build(&mut self) -> DmabufFormats {
        self.next_priority();
        DmabufFormats {
            formats: std::mem::take(&mut self.formats),
            group_ends: std::mem::take(&mut self.group_ends),
        }
    }
}

/// Feedback protocol errors
#[derive(Error, Debug)]
pub enum FeedbackError {
    /// A batch or tranche event arrived outside of a batch
    #[error("{0} event without a pending feedback batch")]
    NoPendingBatch(&'static str),

    /// A tranche event arrived outside of a tranche
    #[error("{0} event without a pending tranche")]
    NoPendingTranche(&'static str),

    /// A new batch or tranche started before the previous one finished
    #[error("{0} event while the previous one is still open")]
    AlreadyPending(&'static str),

    /// Tranche formats arrived before any format table
    #[error("tranche formats sent before a format table")]
    NoFormatTable,

    /// A tranche referenced a format past the end of the table
    #[error("format index {index} out of range for a table of {len} entries")]
    IndexOutOfRange {
        /// Index sent by the compositor
        index: u16,
        /// Number of entries in the table
        len: usize,
    },

    /// A device id array had an unexpected size
    #[error("device id of {0} bytes")]
    InvalidDevice(usize),

    /// The format table could not be mapped
    #[error("failed to map format table: {0}")]
    Map(#[from] io::Error),
}

/// Size of one format table record: u32 fourcc, u32 padding, u64 modifier
pub const FORMAT_TABLE_ENTRY_SIZE: usize = 16;

/// Read-only mapping of a compositor's format table
#[derive(Debug)]
pub struct FormatTable {
    data: Option<NonNull<u8>>,
    size: usize,
}

// SAFETY: the mapping is private, read-only and owned by this value
unsafe impl Send for FormatTable {}

impl FormatTable {
    /// Map `size` bytes of `fd`
    pub fn map(fd: BorrowedFd<'_>, size: u32) -> io::Result<Self> {
        let size = size as usize;
        if size == 0 {
            return Ok(Self { data: None, size: 0 });
        }
        // SAFETY: a fresh private read-only mapping aliases nothing in this process
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            data: NonNull::new(ptr.cast::<u8>()),
            size,
        })
    }

    /// Number of complete records
    pub fn len(&self) -> usize {
        self.size / FORMAT_TABLE_ENTRY_SIZE
    }

    /// Whether the table has no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self) -> &[u8] {
        match self.data {
            // SAFETY: the mapping is `size` bytes long and lives as long as `self`
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    /// Record at `index`
    pub fn get(&self, index: usize) -> Option<DmabufFormat> {
        if index >= self.len() {
            return None;
        }
        let record = &self.bytes()[index * FORMAT_TABLE_ENTRY_SIZE..][..FORMAT_TABLE_ENTRY_SIZE];
        let fourcc = u32::from_ne_bytes(record[0..4].try_into().ok()?);
        let modifier = u64::from_ne_bytes(record[8..16].try_into().ok()?);
        Some(DmabufFormat { fourcc, modifier })
    }
}

impl Drop for FormatTable {
    fn drop(&mut self) {
        if let Some(ptr) = self.data.take() {
            // SAFETY: unmapping exactly the region mapped in `map`
            unsafe {
                libc::munmap(ptr.as_ptr().cast(), self.size);
            }
        }
    }
}

bitflags! {
    /// Tranche flags sent by the compositor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TrancheFlags: u32 {
        /// Buffers in these formats can be scanned out directly
        const SCANOUT = 1;
    }
}

/// Formats the compositor accepts for one target device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tranche {
    /// Device the formats apply to
    pub target_device: u64,
    /// Tranche flags
    pub flags: TrancheFlags,
    /// Formats resolved from the table
    pub formats: Vec<DmabufFormat>,
}

/// One event of the feedback object
#[derive(Debug)]
pub enum FeedbackEvent {
    /// A new batch starts; the compositor's main device
    MainDevice(u64),
    /// A new format table
    FormatTable {
        /// Shared memory holding the table
        fd: OwnedFd,
        /// Table size in bytes
        size: u32,
    },
    /// A new tranche starts for this device
    TrancheTargetDevice(u64),
    /// Indices into the format table
    TrancheFormats(Vec<u16>),
    /// Flags of the current tranche
    TrancheFlags(u32),
    /// The current tranche is complete
    TrancheDone,
    /// The batch is complete
    Done,
}

/// Decode a `dev_t` sent as a wl_array
pub fn device_from_bytes(bytes: &[u8]) -> Result<u64, FeedbackError> {
    match bytes.len() {
        8 => Ok(u64::from_ne_bytes(bytes.try_into().map_err(|_| FeedbackError::InvalidDevice(8))?)),
        4 => Ok(u64::from(u32::from_ne_bytes(
            bytes.try_into().map_err(|_| FeedbackError::InvalidDevice(4))?,
        ))),
        n => Err(FeedbackError::InvalidDevice(n)),
    }
}

/// Decode the u16 index array of a `tranche_formats` event
pub fn indices_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect()
}

#[derive(Debug, Default)]
struct FeedbackBatch {
    main_device: u64,
    tranches: Vec<Tranche>,
}

/// Callback invoked with every published list
pub type FormatsCallback = Box<dyn FnMut(&DmabufFormats) + Send>;

/// State of one dmabuf feedback object
pub struct DmabufFeedback {
    name: String,
    secondary: Option<DmabufFormats>,
    formats: Option<DmabufFormats>,
    table: Option<FormatTable>,
    current: Option<FeedbackBatch>,
    pending: Option<FeedbackBatch>,
    pending_tranche: Option<Tranche>,
    callback: FormatsCallback,
}

impl DmabufFeedback {
    /// Track a feedback object; `name` only shows up in logs
    ///
    /// Until the first batch completes, [`DmabufFeedback::formats`] returns `secondary`.
    pub fn new(name: &str, secondary: Option<DmabufFormats>, callback: FormatsCallback) -> Self {
        Self {
            name: name.to_string(),
            formats: secondary.clone(),
            secondary,
            table: None,
            current: None,
            pending: None,
            pending_tranche: None,
            callback,
        }
    }

    /// Formats for a compositor without feedback support
    ///
    /// The callback runs once, right away, with `secondary` or an empty list.
    pub fn without_feedback(
        name: &str,
        secondary: Option<DmabufFormats>,
        mut callback: FormatsCallback,
    ) -> Self {
        let formats = secondary.clone().unwrap_or_default();
        callback(&formats);
        let mut this = Self::new(name, secondary, callback);
        this.formats = Some(formats);
        this
    }

    /// Last published list
    pub fn formats(&self) -> Option<&DmabufFormats> {
        self.formats.as_ref()
    }

    /// Feed one protocol event
    pub fn handle_event(&mut self, event: FeedbackEvent) -> Result<(), FeedbackError> {
        match event {
            FeedbackEvent::MainDevice(device) => {
                if self.pending.is_some() {
                    return Err(FeedbackError::AlreadyPending("main_device"));
                }
                self.pending = Some(FeedbackBatch {
                    main_device: device,
                    tranches: Vec::new(),
                });
            }
            FeedbackEvent::FormatTable { fd, size } => {
                let table = FormatTable::map(fd.as_fd(), size)?;
                log::debug!("{}: format table with {} entries", self.name, table.len());
                self.table = Some(table);
            }
            FeedbackEvent::TrancheTargetDevice(device) => {
                if self.pending_tranche.is_some() {
                    return Err(FeedbackError::AlreadyPending("tranche_target_device"));
                }
                self.pending_tranche = Some(Tranche {
                    target_device: device,
                    ..Tranche::default()
                });
            }
            FeedbackEvent::TrancheFormats(indices) => {
                let tranche = self
                    .pending_tranche
                    .as_mut()
                    .ok_or(FeedbackError::NoPendingTranche("tranche_formats"))?;
                let table = self.table.as_ref().ok_or(FeedbackError::NoFormatTable)?;
                tranche.formats.reserve(indices.len());
                for index in indices {
                    let format = table.get(usize::from(index)).ok_or(FeedbackError::IndexOutOfRange {
                        index,
                        len: table.len(),
                    })?;
                    tranche.formats.push(format);
                }
            }
            FeedbackEvent::TrancheFlags(flags) => {
                let tranche = self
                    .pending_tranche
                    .as_mut()
                    .ok_or(FeedbackError::NoPendingTranche("tranche_flags"))?;
                tranche.flags = TrancheFlags::from_bits_truncate(flags);
            }
            FeedbackEvent::TrancheDone => {
                let batch = self
                    .pending
                    .as_mut()
                    .ok_or(FeedbackError::NoPendingBatch("tranche_done"))?;
                let tranche = self
                    .pending_tranche
                    .take()
                    .ok_or(FeedbackError::NoPendingTranche("tranche_done"))?;
                batch.tranches.push(tranche);
            }
            FeedbackEvent::Done => {
                let batch = self.pending.take().ok_or(FeedbackError::NoPendingBatch("done"))?;
                self.current = Some(batch);
                self.update();
            }
        }
        Ok(())
    }

    /// Restrict published formats to what the renderer can import
    ///
    /// Only the first call has an effect. If a batch already completed, the list is
    /// rebuilt and published again.
    pub fn set_secondary_formats(&mut self, secondary: DmabufFormats) {
        if self.secondary.is_some() {
            return;
        }
        self.secondary = Some(secondary);
        if self.current.is_some() {
            self.update();
        }
    }

    fn update(&mut self) {
        let Some(batch) = &self.current else {
            return;
        };
        let formats = rebuild_formats(batch.main_device, &batch.tranches, self.secondary.as_ref());
        if log::log_enabled!(log::Level::Debug) {
            dump_formats(&formats, &self.name);
        }
        (self.callback)(&formats);
        self.formats = Some(formats);
    }
}

impl std::fmt::Debug for DmabufFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmabufFeedback")
            .field("name", &self.name)
            .field("formats", &self.formats)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Build the published list from a completed batch
///
/// Tranches for devices other than `main_device` are ignored. Without `secondary`, each
/// tranche becomes one priority group. With it, each tranche is split into one group per
/// secondary group, keeping only formats present in that group.
pub fn rebuild_formats(
    main_device: u64,
    tranches: &[Tranche],
    secondary: Option<&DmabufFormats>,
) -> DmabufFormats {
    let mut builder = DmabufFormats::builder();

    for tranche in tranches.iter().filter(|t| t.target_device == main_device) {
        match secondary {
            Some(secondary) => {
                for group in secondary.priority_groups() {
                    for format in &tranche.formats {
                        if group.contains(format) {
                            builder.add_format(format.fourcc, format.modifier);
                        }
                    }
                    builder.next_priority();
                }
            }
            None => {
                for format in &tranche.formats {
                    builder.add_format(format.fourcc, format.modifier);
                }
                builder.next_priority();
            }
        }
    }

    builder.build()
}

fn dump_formats(formats: &DmabufFormats, name: &str) {
    log::debug!("Wayland {} dmabuf formats: ({} entries)", name, formats.len());
    for (i, group) in formats.priority_groups().enumerate() {
        if i > 0 {
            log::debug!("------");
        }
        log::debug!("Tranche formats ({} entries)", group.len());
        for format in group {
            log::debug!("  {}:{:#x}", fourcc_name(format.fourcc), format.modifier);
        }
    }
}
