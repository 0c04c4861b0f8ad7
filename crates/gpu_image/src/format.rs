//! Memory format table
//!
//! Maps every [`MemoryFormat`] to an ordered list of Vulkan formats that can hold it,
//! each paired with the view swizzle that turns the stored channels back into RGBA.
//! The first candidate the device supports wins. When none does, [`fallback_for`]
//! names a more general format to retry with; the chain always ends at
//! [`MemoryFormat::R8G8B8A8Premultiplied`], which every conformant device can sample
//! and render to.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Properties attached to a resolved image
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageFlags: u32 {
        /// The image cannot be used as a blit source
        const NO_BLIT = 1 << 0;
        /// Color channels are stored unpremultiplied
        const STRAIGHT_ALPHA = 1 << 1;
        /// The image was allocated with a full mip chain
        const CAN_MIPMAP = 1 << 2;
        /// The image is shared with another process or API and must not be sampled
        /// through the regular shader paths
        const EXTERNAL = 1 << 3;
    }
}

/// How a memory format treats its alpha channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaKind {
    /// Color channels are multiplied by alpha
    Premultiplied,
    /// Color channels are independent of alpha
    Straight,
    /// No alpha channel; alpha reads as one
    Opaque,
}

/// Abstract pixel layout of CPU-side image data
///
/// Names list the channels in memory byte order.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    B8G8R8A8Premultiplied,
    A8R8G8B8Premultiplied,
    R8G8B8A8Premultiplied,
    A8B8G8R8Premultiplied,
    B8G8R8A8,
    A8R8G8B8,
    R8G8B8A8,
    A8B8G8R8,
    B8G8R8X8,
    X8R8G8B8,
    R8G8B8X8,
    X8B8G8R8,
    R8G8B8,
    B8G8R8,
    R16G16B16,
    R16G16B16A16Premultiplied,
    R16G16B16A16,
    R16G16B16Float,
    R16G16B16A16FloatPremultiplied,
    R16G16B16A16Float,
    R32G32B32Float,
    R32G32B32A32FloatPremultiplied,
    R32G32B32A32Float,
    G8A8Premultiplied,
    G8A8,
    G8,
    G16A16Premultiplied,
    G16A16,
    G16,
    A8,
    A16,
    A16Float,
    A32Float,
}

/// One Vulkan format able to store a [`MemoryFormat`]
#[derive(Clone, Copy, Debug)]
pub struct FormatCandidate {
    /// Native format used for the image
    pub format: vk::Format,
    /// Swizzle applied by the image view
    pub components: vk::ComponentMapping,
    /// Flags this candidate always contributes
    pub flags: ImageFlags,
}

/// Field-wise equality for `vk::ComponentMapping`, which ash does not derive
pub(crate) const fn components_eq(a: &vk::ComponentMapping, b: &vk::ComponentMapping) -> bool {
    a.r.as_raw() == b.r.as_raw()
        && a.g.as_raw() == b.g.as_raw()
        && a.b.as_raw() == b.b.as_raw()
        && a.a.as_raw() == b.a.as_raw()
}

impl PartialEq for FormatCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
            && components_eq(&self.components, &other.components)
            && self.flags == other.flags
    }
}

impl Eq for FormatCandidate {}

impl FormatCandidate {
    /// Whether the candidate can back a color attachment as-is
    ///
    /// Render passes write through the image view without its swizzle, so only
    /// identity-swizzled, flag-free candidates produce correct output.
    pub fn is_framebuffer_compatible(&self) -> bool {
        self.flags.is_empty() && is_identity(&self.components)
    }
}

/// Whether a component mapping is the identity
pub fn is_identity(components: &vk::ComponentMapping) -> bool {
    let id = |c: vk::ComponentSwizzle, own: vk::ComponentSwizzle| {
        c == own || c == vk::ComponentSwizzle::IDENTITY
    };
    id(components.r, vk::ComponentSwizzle::R)
        && id(components.g, vk::ComponentSwizzle::G)
        && id(components.b, vk::ComponentSwizzle::B)
        && id(components.a, vk::ComponentSwizzle::A)
}

mod swizzle {
    use ash::vk::{ComponentMapping, ComponentSwizzle as S};

    const fn map(r: S, g: S, b: S, a: S) -> ComponentMapping {
        ComponentMapping { r, g, b, a }
    }

    pub const RGBA: ComponentMapping = map(S::R, S::G, S::B, S::A);
    pub const BGRA: ComponentMapping = map(S::B, S::G, S::R, S::A);
    pub const GBAR: ComponentMapping = map(S::G, S::B, S::A, S::R);
    pub const ABGR: ComponentMapping = map(S::A, S::B, S::G, S::R);
    pub const RGB1: ComponentMapping = map(S::R, S::G, S::B, S::ONE);
    pub const BGR1: ComponentMapping = map(S::B, S::G, S::R, S::ONE);
    pub const GBA1: ComponentMapping = map(S::G, S::B, S::A, S::ONE);
    pub const ABG1: ComponentMapping = map(S::A, S::B, S::G, S::ONE);
    pub const RRRG: ComponentMapping = map(S::R, S::R, S::R, S::G);
    pub const RRR1: ComponentMapping = map(S::R, S::R, S::R, S::ONE);
    pub const RRRR: ComponentMapping = map(S::R, S::R, S::R, S::R);
}

pub(crate) use swizzle::RGBA as IDENTITY_SWIZZLE;

const fn candidate(
    format: vk::Format,
    components: vk::ComponentMapping,
    flags: ImageFlags,
) -> FormatCandidate {
    FormatCandidate { format, components, flags }
}

const NONE: ImageFlags = ImageFlags::empty();
const STRAIGHT: ImageFlags = ImageFlags::STRAIGHT_ALPHA;

use swizzle::*;
use vk::Format as F;

// Indexed by `MemoryFormat as usize`; order must follow the enum.
static FORMAT_TABLE: [&[FormatCandidate]; MemoryFormat::COUNT] = [
    // B8G8R8A8Premultiplied
    &[candidate(F::B8G8R8A8_UNORM, RGBA, NONE), candidate(F::R8G8B8A8_UNORM, BGRA, NONE)],
    // A8R8G8B8Premultiplied
    &[candidate(F::R8G8B8A8_UNORM, GBAR, NONE)],
    // R8G8B8A8Premultiplied
    &[candidate(F::R8G8B8A8_UNORM, RGBA, NONE)],
    // A8B8G8R8Premultiplied
    &[candidate(F::R8G8B8A8_UNORM, ABGR, NONE)],
    // B8G8R8A8
    &[candidate(F::B8G8R8A8_UNORM, RGBA, STRAIGHT), candidate(F::R8G8B8A8_UNORM, BGRA, STRAIGHT)],
    // A8R8G8B8
    &[candidate(F::R8G8B8A8_UNORM, GBAR, STRAIGHT)],
    // R8G8B8A8
    &[candidate(F::R8G8B8A8_UNORM, RGBA, STRAIGHT)],
    // A8B8G8R8
    &[candidate(F::R8G8B8A8_UNORM, ABGR, STRAIGHT)],
    // B8G8R8X8
    &[candidate(F::B8G8R8A8_UNORM, RGB1, NONE), candidate(F::R8G8B8A8_UNORM, BGR1, NONE)],
    // X8R8G8B8
    &[candidate(F::R8G8B8A8_UNORM, GBA1, NONE)],
    // R8G8B8X8
    &[candidate(F::R8G8B8A8_UNORM, RGB1, NONE)],
    // X8B8G8R8
    &[candidate(F::R8G8B8A8_UNORM, ABG1, NONE)],
    // R8G8B8
    &[candidate(F::R8G8B8_UNORM, RGBA, NONE)],
    // B8G8R8
    &[candidate(F::B8G8R8_UNORM, RGBA, NONE), candidate(F::R8G8B8_UNORM, BGRA, NONE)],
    // R16G16B16
    &[candidate(F::R16G16B16_UNORM, RGBA, NONE)],
    // R16G16B16A16Premultiplied
    &[candidate(F::R16G16B16A16_UNORM, RGBA, NONE)],
    // R16G16B16A16
    &[candidate(F::R16G16B16A16_UNORM, RGBA, STRAIGHT)],
    // R16G16B16Float
    &[candidate(F::R16G16B16_SFLOAT, RGBA, NONE)],
    // R16G16B16A16FloatPremultiplied
    &[candidate(F::R16G16B16A16_SFLOAT, RGBA, NONE)],
    // R16G16B16A16Float
    &[candidate(F::R16G16B16A16_SFLOAT, RGBA, STRAIGHT)],
    // R32G32B32Float
    &[candidate(F::R32G32B32_SFLOAT, RGBA, NONE)],
    // R32G32B32A32FloatPremultiplied
    &[candidate(F::R32G32B32A32_SFLOAT, RGBA, NONE)],
    // R32G32B32A32Float
    &[candidate(F::R32G32B32A32_SFLOAT, RGBA, STRAIGHT)],
    // G8A8Premultiplied
    &[candidate(F::R8G8_UNORM, RRRG, NONE)],
    // G8A8
    &[candidate(F::R8G8_UNORM, RRRG, STRAIGHT)],
    // G8
    &[candidate(F::R8_UNORM, RRR1, NONE)],
    // G16A16Premultiplied
    &[candidate(F::R16G16_UNORM, RRRG, NONE)],
    // G16A16
    &[candidate(F::R16G16_UNORM, RRRG, STRAIGHT)],
    // G16
    &[candidate(F::R16_UNORM, RRR1, NONE)],
    // A8
    &[candidate(F::R8_UNORM, RRRR, NONE)],
    // A16
    &[candidate(F::R16_UNORM, RRRR, NONE)],
    // A16Float
    &[candidate(F::R16_SFLOAT, RRRR, NONE)],
    // A32Float
    &[candidate(F::R32_SFLOAT, RRRR, NONE)],
];

impl MemoryFormat {
    /// Number of memory formats
    pub const COUNT: usize = 33;

    /// Format used for atlases, swapchain wrappers and as the universal fallback
    pub const DEFAULT: Self = Self::R8G8B8A8Premultiplied;

    /// Every memory format, in table order
    pub const ALL: [Self; Self::COUNT] = [
        Self::B8G8R8A8Premultiplied,
        Self::A8R8G8B8Premultiplied,
        Self::R8G8B8A8Premultiplied,
        Self::A8B8G8R8Premultiplied,
        Self::B8G8R8A8,
        Self::A8R8G8B8,
        Self::R8G8B8A8,
        Self::A8B8G8R8,
        Self::B8G8R8X8,
        Self::X8R8G8B8,
        Self::R8G8B8X8,
        Self::X8B8G8R8,
        Self::R8G8B8,
        Self::B8G8R8,
        Self::R16G16B16,
        Self::R16G16B16A16Premultiplied,
        Self::R16G16B16A16,
        Self::R16G16B16Float,
        Self::R16G16B16A16FloatPremultiplied,
        Self::R16G16B16A16Float,
        Self::R32G32B32Float,
        Self::R32G32B32A32FloatPremultiplied,
        Self::R32G32B32A32Float,
        Self::G8A8Premultiplied,
        Self::G8A8,
        Self::G8,
        Self::G16A16Premultiplied,
        Self::G16A16,
        Self::G16,
        Self::A8,
        Self::A16,
        Self::A16Float,
        Self::A32Float,
    ];

    /// Alpha treatment of the format
    pub fn alpha(self) -> AlphaKind {
        use MemoryFormat::*;
        match self {
            B8G8R8A8Premultiplied
            | A8R8G8B8Premultiplied
            | R8G8B8A8Premultiplied
            | A8B8G8R8Premultiplied
            | R16G16B16A16Premultiplied
            | R16G16B16A16FloatPremultiplied
            | R32G32B32A32FloatPremultiplied
            | G8A8Premultiplied
            | G16A16Premultiplied
            // alpha-only formats have no color to premultiply
            | A8
            | A16
            | A16Float
            | A32Float => AlphaKind::Premultiplied,
            B8G8R8A8 | A8R8G8B8 | R8G8B8A8 | A8B8G8R8 | R16G16B16A16 | R16G16B16A16Float
            | R32G32B32A32Float | G8A8 | G16A16 => AlphaKind::Straight,
            B8G8R8X8 | X8R8G8B8 | R8G8B8X8 | X8B8G8R8 | R8G8B8 | B8G8R8 | R16G16B16
            | R16G16B16Float | R32G32B32Float | G8 | G16 => AlphaKind::Opaque,
        }
    }

    /// DRM fourcc describing the same byte layout, if one exists
    ///
    /// Only formats that can be exported as a single-plane dmabuf have one.
    pub fn dmabuf_fourcc(self) -> Option<u32> {
        use crate::dmabuf::fourcc as cc;
        use MemoryFormat::*;
        let code = match self {
            B8G8R8A8Premultiplied | B8G8R8A8 => cc('A', 'R', '2', '4'),
            A8R8G8B8Premultiplied | A8R8G8B8 => cc('B', 'A', '2', '4'),
            R8G8B8A8Premultiplied | R8G8B8A8 => cc('A', 'B', '2', '4'),
            A8B8G8R8Premultiplied | A8B8G8R8 => cc('R', 'A', '2', '4'),
            B8G8R8X8 => cc('X', 'R', '2', '4'),
            X8R8G8B8 => cc('B', 'X', '2', '4'),
            R8G8B8X8 => cc('X', 'B', '2', '4'),
            X8B8G8R8 => cc('R', 'X', '2', '4'),
            R8G8B8 => cc('B', 'G', '2', '4'),
            B8G8R8 => cc('R', 'G', '2', '4'),
            R16G16B16A16Premultiplied | R16G16B16A16 => cc('A', 'B', '4', '8'),
            R16G16B16A16FloatPremultiplied | R16G16B16A16Float => cc('A', 'B', '4', 'H'),
            _ => return None,
        };
        Some(code)
    }
}

/// Ordered Vulkan candidates for a memory format
pub fn candidates_for(format: MemoryFormat) -> &'static [FormatCandidate] {
    FORMAT_TABLE[format as usize]
}

/// Next, more general format to try when no candidate of `format` is supported
///
/// [`MemoryFormat::DEFAULT`] maps to itself.
pub fn fallback_for(format: MemoryFormat) -> MemoryFormat {
    use MemoryFormat::*;
    match format {
        B8G8R8A8Premultiplied | A8R8G8B8Premultiplied | R8G8B8A8Premultiplied
        | A8B8G8R8Premultiplied | B8G8R8A8 | A8R8G8B8 | R8G8B8A8 | A8B8G8R8 | R8G8B8 => {
            R8G8B8A8Premultiplied
        }
        B8G8R8X8 | X8R8G8B8 | X8B8G8R8 | R8G8B8X8 | B8G8R8 => R8G8B8,
        R16G16B16A16Premultiplied => R32G32B32A32FloatPremultiplied,
        R16G16B16 | R16G16B16A16 => R16G16B16A16Premultiplied,
        R16G16B16A16FloatPremultiplied => R32G32B32A32FloatPremultiplied,
        R16G16B16Float | R16G16B16A16Float => R16G16B16A16FloatPremultiplied,
        R32G32B32A32FloatPremultiplied => R8G8B8A8Premultiplied,
        R32G32B32Float | R32G32B32A32Float => R32G32B32A32FloatPremultiplied,
        G8A8Premultiplied | G8A8 => R8G8B8A8Premultiplied,
        G8 => R8G8B8,
        G16A16Premultiplied | G16A16 => R16G16B16A16Premultiplied,
        G16 => R16G16B16,
        A8 => R8G8B8A8Premultiplied,
        A16 => R16G16B16A16Premultiplied,
        A16Float => R16G16B16A16FloatPremultiplied,
        A32Float => R32G32B32A32FloatPremultiplied,
    }
}
