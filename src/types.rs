//! Core pixel and plane-format types

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layouts supported by images
///
/// Multi-byte samples are stored little-endian. RGB pixels are stored as four
/// bytes in B, G, R, padding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    /// 8-bit grayscale
    #[serde(rename = "GRAY8")]
    Gray8,
    /// 16-bit unsigned grayscale
    #[serde(rename = "GRAY16")]
    Gray16,
    /// 32-bit float grayscale
    #[serde(rename = "GRAY32")]
    Gray32,
    /// 8 bits per component RGB, padded to 4 bytes per pixel
    #[serde(rename = "RGB32")]
    Rgb32,
}

impl PixelType {
    /// Size in bytes of one pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelType::Gray8 => 1,
            PixelType::Gray16 => 2,
            PixelType::Gray32 | PixelType::Rgb32 => 4,
        }
    }

    /// Size in bytes of one component of a pixel
    pub fn bytes_per_component(&self) -> usize {
        match self {
            PixelType::Gray8 | PixelType::Rgb32 => 1,
            PixelType::Gray16 => 2,
            PixelType::Gray32 => 4,
        }
    }

    pub fn number_of_components(&self) -> usize {
        match self {
            PixelType::Gray8 | PixelType::Gray16 | PixelType::Gray32 => 1,
            PixelType::Rgb32 => 3,
        }
    }

    /// Byte offset of each component within a pixel, in R, G, B order for
    /// color types
    pub fn component_offsets(&self) -> &'static [usize] {
        match self {
            PixelType::Gray8 | PixelType::Gray16 | PixelType::Gray32 => &[0],
            PixelType::Rgb32 => &[2, 1, 0],
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, PixelType::Gray32)
    }

    /// Resolve a layout from its bytes per pixel and component count
    pub fn from_layout(bytes_per_pixel: usize, components: usize) -> Result<Self> {
        match (bytes_per_pixel, components) {
            (1, 1) => Ok(PixelType::Gray8),
            (2, 1) => Ok(PixelType::Gray16),
            (4, 1) => Ok(PixelType::Gray32),
            (4, 3) => Ok(PixelType::Rgb32),
            _ => Err(DataError::InvalidImage(format!(
                "unsupported pixel layout: {} bytes per pixel, {} components",
                bytes_per_pixel, components
            ))),
        }
    }

    /// ImageJ image type code, kept in journals for older readers
    pub fn imagej_type(&self) -> u8 {
        match self {
            PixelType::Gray8 => 0,
            PixelType::Gray16 => 1,
            PixelType::Gray32 => 2,
            PixelType::Rgb32 => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelType::Gray8 => "GRAY8",
            PixelType::Gray16 => "GRAY16",
            PixelType::Gray32 => "GRAY32",
            PixelType::Rgb32 => "RGB32",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plane geometry shared by every image in a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormat {
    #[serde(rename = "Width")]
    pub width: u32,
    #[serde(rename = "Height")]
    pub height: u32,
    #[serde(rename = "PixelType")]
    pub pixel_type: PixelType,
}

impl ImageFormat {
    pub fn new(width: u32, height: u32, pixel_type: PixelType) -> Self {
        Self {
            width,
            height,
            pixel_type,
        }
    }

    /// Number of bytes one plane of this format occupies
    pub fn plane_size_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.pixel_type.bytes_per_pixel())
    }

    /// Fail with [`DataError::SizeMismatch`] unless `other` equals this format
    pub fn ensure_matches(&self, other: &ImageFormat) -> Result<()> {
        if self == other {
            return Ok(());
        }
        Err(DataError::SizeMismatch(format!(
            "expected {}x{} {}, got {}x{} {}",
            self.width,
            self.height,
            self.pixel_type,
            other.width,
            other.height,
            other.pixel_type
        )))
    }
}
