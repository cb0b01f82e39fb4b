//! # glint-core
//!
//! Core types for GPU image processing.
//!
//! This crate provides the foundational types used throughout the GLINT stack:
//!
//! - [`PixelFormat`] - The closed registry of device-representable pixel formats
//! - [`ChannelKind`] - Per-channel storage type (unorm8/16, half, float)
//! - [`DeviceFormat`] - The device-side channel descriptor a format maps to
//! - [`SourceFormat`], [`SourceImage`] - Hand-off types for externally decoded images
//!
//! ## Design Philosophy
//!
//! Every format carries its full layout (channel kind, bits per pixel, channel
//! count) in a single packed descriptor word, so format identity, byte-size
//! arithmetic, and device-descriptor lookup are all total, constant-time
//! operations with no fallible branch:
//!
//! ```rust
//! use glint_core::PixelFormat;
//!
//! let fmt = PixelFormat::Rgba16f;
//! assert_eq!(fmt.bytes_per_pixel(), 8);
//! assert_eq!(fmt.channels(), 4);
//! assert_eq!(PixelFormat::from_packed(fmt.packed()), Some(fmt));
//! ```
//!
//! ## Crate Structure
//!
//! This crate is the foundation of GLINT and has no internal dependencies.
//! `glint-compute` (device catalog, image buffers, kernel dispatch) builds
//! on top of it.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod format;
pub mod source;

// Re-exports for convenience
pub use error::{Error, Result};
pub use format::{ChannelKind, DeviceFormat, PixelFormat};
pub use source::{SourceFormat, SourceImage};
