//! The pixel format registry.
//!
//! Formats a device buffer can hold form a closed set: RGBA and single-channel
//! luma layouts over four channel storage types. Each format's identity is a
//! packed descriptor word combining the channel kind, total bits per pixel and
//! channel count, so the numeric value of a [`PixelFormat`] *is* its layout.
//!
//! # Packing
//!
//! ```text
//! bits 16..=23  channel kind  (ChannelKind discriminant)
//! bits  8..=15  bits per pixel (all channels)
//! bits  0..=7   channel count
//! ```
//!
//! The invariant `bits_per_pixel == channel kind bits * channels` holds for
//! every registered format.
//!
//! # Usage
//!
//! ```rust
//! use glint_core::{ChannelKind, PixelFormat};
//!
//! let fmt = PixelFormat::Rgba32f;
//! assert_eq!(fmt.kind(), ChannelKind::Float32);
//! assert_eq!(fmt.bits_per_pixel(), 128);
//! assert_eq!(fmt.bytes_per_pixel(), 16);
//! ```

use crate::source::SourceFormat;

/// Storage type of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelKind {
    /// 8-bit unsigned normalized integer [0, 255].
    Unorm8 = 0,
    /// 16-bit unsigned normalized integer [0, 65535].
    Unorm16 = 1,
    /// 16-bit half-precision IEEE 754 float.
    Float16 = 2,
    /// 32-bit single-precision IEEE 754 float.
    Float32 = 3,
}

impl ChannelKind {
    /// Number of bits per channel.
    #[inline]
    pub const fn bits(&self) -> u32 {
        match self {
            Self::Unorm8 => 8,
            Self::Unorm16 => 16,
            Self::Float16 => 16,
            Self::Float32 => 32,
        }
    }

    /// Whether this is a floating-point storage type.
    #[inline]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::Float32)
    }

    /// The CUDA C type a channel of this kind is declared as.
    #[inline]
    pub const fn device_ctype(&self) -> &'static str {
        match self {
            Self::Unorm8 => "unsigned char",
            Self::Unorm16 => "unsigned short",
            Self::Float16 => "__half",
            Self::Float32 => "float",
        }
    }

    /// Short name for display.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unorm8 => "unorm8",
            Self::Unorm16 => "unorm16",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Builds the packed descriptor word for a format.
const fn pack(kind: ChannelKind, channels: u32) -> u32 {
    let bits = kind.bits() * channels;
    ((kind as u32) << 16) | (bits << 8) | channels
}

/// A device-representable pixel format.
///
/// The discriminant of each variant is its packed descriptor word, so
/// `format as u32` and [`PixelFormat::packed`] agree, and two formats are
/// equal exactly when their layouts are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    /// Four 8-bit unorm channels (RGBA), 32 bits per pixel.
    Rgba8 = pack(ChannelKind::Unorm8, 4),
    /// Four 16-bit unorm channels (RGBA), 64 bits per pixel.
    Rgba16 = pack(ChannelKind::Unorm16, 4),
    /// Four half-float channels (RGBA), 64 bits per pixel.
    Rgba16f = pack(ChannelKind::Float16, 4),
    /// Four float channels (RGBA), 128 bits per pixel.
    Rgba32f = pack(ChannelKind::Float32, 4),
    /// Single 8-bit unorm channel, 8 bits per pixel.
    Luma8 = pack(ChannelKind::Unorm8, 1),
    /// Single 16-bit unorm channel, 16 bits per pixel.
    Luma16 = pack(ChannelKind::Unorm16, 1),
    /// Single half-float channel, 16 bits per pixel.
    Luma16f = pack(ChannelKind::Float16, 1),
    /// Single float channel, 32 bits per pixel.
    Luma32f = pack(ChannelKind::Float32, 1),
}

/// All registered formats, in registry order.
pub const ALL_FORMATS: [PixelFormat; 8] = [
    PixelFormat::Rgba8,
    PixelFormat::Rgba16,
    PixelFormat::Rgba16f,
    PixelFormat::Rgba32f,
    PixelFormat::Luma8,
    PixelFormat::Luma16,
    PixelFormat::Luma16f,
    PixelFormat::Luma32f,
];

impl PixelFormat {
    /// The packed descriptor word.
    #[inline]
    pub const fn packed(&self) -> u32 {
        *self as u32
    }

    /// Looks up a format by its packed descriptor word.
    ///
    /// Returns `None` for words that don't name a registered format.
    pub fn from_packed(word: u32) -> Option<Self> {
        ALL_FORMATS.into_iter().find(|f| f.packed() == word)
    }

    /// Channel storage type.
    #[inline]
    pub const fn kind(&self) -> ChannelKind {
        match (self.packed() >> 16) & 0xff {
            0 => ChannelKind::Unorm8,
            1 => ChannelKind::Unorm16,
            2 => ChannelKind::Float16,
            _ => ChannelKind::Float32,
        }
    }

    /// Number of channels per pixel.
    #[inline]
    pub const fn channels(&self) -> u32 {
        self.packed() & 0xff
    }

    /// Total bits per pixel across all channels.
    #[inline]
    pub const fn bits_per_pixel(&self) -> u32 {
        (self.packed() >> 8) & 0xff
    }

    /// Total bytes per pixel.
    #[inline]
    pub const fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel() / 8) as usize
    }

    /// Whether channels are floating point.
    #[inline]
    pub const fn is_float(&self) -> bool {
        self.kind().is_float()
    }

    /// Whether this format stores half-precision floats.
    ///
    /// Half formats need device support for `__half` arithmetic.
    #[inline]
    pub const fn is_half(&self) -> bool {
        matches!(self.kind(), ChannelKind::Float16)
    }

    /// The device-side channel descriptor this format maps to.
    #[inline]
    pub const fn device_format(&self) -> DeviceFormat {
        DeviceFormat {
            channel_ctype: self.kind().device_ctype(),
            channels: self.channels(),
            kind: self.kind(),
        }
    }

    /// The source format whose byte layout matches this format exactly,
    /// if one exists.
    ///
    /// Only `Rgba8` has a byte-identical external counterpart; every other
    /// format requires a device-side conversion on load.
    pub const fn source_format(&self) -> Option<SourceFormat> {
        match self {
            Self::Rgba8 => Some(SourceFormat::Rgba8888),
            _ => None,
        }
    }

    /// The device format a source layout maps onto without per-channel
    /// reinterpretation, if any.
    ///
    /// 32-bit truecolor layouts map onto [`PixelFormat::Rgba8`] (the padding
    /// byte of `Rgbx8888` is carried through as an opaque alpha); packed
    /// 24-bit and single-channel sources have no direct device layout.
    pub const fn from_source(source: SourceFormat) -> Option<Self> {
        match source {
            SourceFormat::Rgba8888 | SourceFormat::Rgbx8888 => Some(Self::Rgba8),
            SourceFormat::Rgb888 | SourceFormat::Luma8 => None,
        }
    }

    /// Short name for display.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rgba8 => "rgba8",
            Self::Rgba16 => "rgba16",
            Self::Rgba16f => "rgba16f",
            Self::Rgba32f => "rgba32f",
            Self::Luma8 => "luma8",
            Self::Luma16 => "luma16",
            Self::Luma16f => "luma16f",
            Self::Luma32f => "luma32f",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Device-side channel descriptor for a [`PixelFormat`].
///
/// Carries what kernel code generation needs: the C type a channel is
/// declared as and the per-pixel channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    /// CUDA C channel type ("unsigned char", "unsigned short", "__half", "float").
    pub channel_ctype: &'static str,
    /// Channels per pixel.
    pub channels: u32,
    /// Channel storage type.
    pub kind: ChannelKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_consistency() {
        for fmt in ALL_FORMATS {
            assert_eq!(
                fmt.bits_per_pixel(),
                fmt.kind().bits() * fmt.channels(),
                "{fmt} packs inconsistent bits"
            );
            assert_eq!(fmt.bytes_per_pixel() * 8, fmt.bits_per_pixel() as usize);
        }
    }

    #[test]
    fn test_packed_roundtrip() {
        for fmt in ALL_FORMATS {
            assert_eq!(PixelFormat::from_packed(fmt.packed()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_packed(0), None);
        assert_eq!(PixelFormat::from_packed(0xdead_beef), None);
    }

    #[test]
    fn test_packed_unique() {
        for (i, a) in ALL_FORMATS.iter().enumerate() {
            for b in &ALL_FORMATS[i + 1..] {
                assert_ne!(a.packed(), b.packed());
            }
        }
    }

    #[test]
    fn test_layout_values() {
        assert_eq!(PixelFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba16.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::Rgba16f.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::Rgba32f.bytes_per_pixel(), 16);
        assert_eq!(PixelFormat::Luma8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Luma16.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Luma16f.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Luma32f.bytes_per_pixel(), 4);
    }

    #[test]
    fn test_source_mapping() {
        assert_eq!(
            PixelFormat::from_source(SourceFormat::Rgba8888),
            Some(PixelFormat::Rgba8)
        );
        assert_eq!(
            PixelFormat::from_source(SourceFormat::Rgbx8888),
            Some(PixelFormat::Rgba8)
        );
        assert_eq!(PixelFormat::from_source(SourceFormat::Rgb888), None);
        assert_eq!(PixelFormat::Rgba8.source_format(), Some(SourceFormat::Rgba8888));
        assert_eq!(PixelFormat::Rgba32f.source_format(), None);
    }

    #[test]
    fn test_device_format() {
        let df = PixelFormat::Rgba16f.device_format();
        assert_eq!(df.channel_ctype, "__half");
        assert_eq!(df.channels, 4);
        assert_eq!(df.kind, ChannelKind::Float16);

        let df = PixelFormat::Luma32f.device_format();
        assert_eq!(df.channel_ctype, "float");
        assert_eq!(df.channels, 1);
    }
}
