//! Hand-off types for externally decoded images.
//!
//! Decoding files is out of scope here; some other facility (a file loader,
//! a frame grabber, a UI toolkit) produces pixels and describes their layout
//! with a [`SourceFormat`]. A [`SourceImage`] borrows those bytes together
//! with their geometry, validated once at construction so downstream code
//! can index freely.

use crate::error::{Error, Result};
use crate::format::PixelFormat;

/// Byte layout of an externally decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    /// 4 bytes per pixel, R G B A order.
    Rgba8888,
    /// 4 bytes per pixel, R G B X order; the fourth byte is padding the
    /// producer sets to opaque.
    Rgbx8888,
    /// 3 bytes per pixel, R G B order, no padding.
    Rgb888,
    /// 1 byte per pixel, grayscale.
    Luma8,
}

impl SourceFormat {
    /// Bytes per pixel in this layout.
    #[inline]
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8888 | Self::Rgbx8888 => 4,
            Self::Rgb888 => 3,
            Self::Luma8 => 1,
        }
    }

    /// The device format this layout maps onto directly, if any.
    #[inline]
    pub const fn device_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_source(*self)
    }

    /// Short name for display.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rgba8888 => "rgba8888",
            Self::Rgbx8888 => "rgbx8888",
            Self::Rgb888 => "rgb888",
            Self::Luma8 => "luma8",
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A borrowed, validated view of externally decoded pixels.
///
/// Construction checks that the byte slice length matches the geometry, so
/// holders of a `SourceImage` never re-validate.
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    width: u32,
    height: u32,
    format: SourceFormat,
    bytes: &'a [u8],
}

impl<'a> SourceImage<'a> {
    /// Wraps decoded pixels, validating geometry against the slice length.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDimensions`] if either dimension is zero;
    /// [`Error::BufferLengthMismatch`] if `bytes` is not exactly
    /// `width * height * bytes_per_pixel` long.
    pub fn new(width: u32, height: u32, format: SourceFormat, bytes: &'a [u8]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::invalid_dimensions(width, height));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(format.bytes_per_pixel()))
            .ok_or(Error::InvalidDimensions { width, height })?;
        if bytes.len() != expected {
            return Err(Error::buffer_length_mismatch(expected, bytes.len()));
        }
        Ok(Self {
            width,
            height,
            format,
            bytes,
        })
    }

    /// Image width in pixels.
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Byte layout of the pixels.
    #[inline]
    pub const fn format(&self) -> SourceFormat {
        self.format
    }

    /// The raw pixel bytes, row-major, no padding between rows.
    #[inline]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_construction() {
        let data = vec![0u8; 16 * 9 * 4];
        let img = SourceImage::new(16, 9, SourceFormat::Rgba8888, &data).unwrap();
        assert_eq!(img.width(), 16);
        assert_eq!(img.height(), 9);
        assert_eq!(img.bytes().len(), data.len());
    }

    #[test]
    fn test_length_mismatch() {
        let data = vec![0u8; 100];
        let err = SourceImage::new(16, 9, SourceFormat::Rgba8888, &data).unwrap_err();
        assert!(matches!(err, Error::BufferLengthMismatch { expected: 576, actual: 100 }));
    }

    #[test]
    fn test_zero_dimensions() {
        let err = SourceImage::new(0, 9, SourceFormat::Luma8, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions { .. }));
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(SourceFormat::Rgba8888.bytes_per_pixel(), 4);
        assert_eq!(SourceFormat::Rgbx8888.bytes_per_pixel(), 4);
        assert_eq!(SourceFormat::Rgb888.bytes_per_pixel(), 3);
        assert_eq!(SourceFormat::Luma8.bytes_per_pixel(), 1);
    }
}
