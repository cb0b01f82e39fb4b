//! Error types for glint-core operations.
//!
//! A small, focused error set: the core crate only validates data it is
//! handed (source image geometry, buffer lengths), so the variants cover
//! exactly those checks. Device-side failures live in `glint-compute`.

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or validating core types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Width or height is zero, or the pixel count overflows `usize`.
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },

    /// A byte buffer does not match the length its geometry implies.
    #[error("buffer length mismatch: expected {expected} bytes, got {actual}")]
    BufferLengthMismatch {
        /// Bytes implied by width, height and format
        expected: usize,
        /// Bytes actually provided
        actual: usize,
    },
}

impl Error {
    /// Creates an [`Error::InvalidDimensions`] error.
    #[inline]
    pub fn invalid_dimensions(width: u32, height: u32) -> Self {
        Self::InvalidDimensions { width, height }
    }

    /// Creates an [`Error::BufferLengthMismatch`] error.
    #[inline]
    pub fn buffer_length_mismatch(expected: usize, actual: usize) -> Self {
        Self::BufferLengthMismatch { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::invalid_dimensions(0, 1080);
        assert!(err.to_string().contains("0x1080"));

        let err = Error::buffer_length_mismatch(4096, 4000);
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("4000"));
    }
}
