//! Immutable image planes

use crate::coords::Coords;
use crate::error::{DataError, Result};
use crate::metadata::Metadata;
use crate::types::{ImageFormat, PixelType};
use bytes::Bytes;

/// One 2D image plane: pixels, coordinate and metadata
///
/// Cloning is cheap; the pixel buffer is reference counted and shared between
/// copies unless [`Image::deep_copy`] is used.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Bytes,
    format: ImageFormat,
    coords: Coords,
    metadata: Metadata,
}

impl Image {
    /// Create an image, checking the buffer length against the geometry
    pub fn new(
        pixels: impl Into<Bytes>,
        width: u32,
        height: u32,
        pixel_type: PixelType,
        coords: Coords,
        metadata: Metadata,
    ) -> Result<Self> {
        let pixels = pixels.into();
        let format = ImageFormat::new(width, height, pixel_type);
        let expected = format.plane_size_bytes().ok_or_else(|| {
            DataError::InvalidImage(format!("{}x{} plane is too large", width, height))
        })?;
        if width == 0 || height == 0 {
            return Err(DataError::InvalidImage(format!(
                "{}x{} plane has no pixels",
                width, height
            )));
        }
        if pixels.len() != expected {
            return Err(DataError::InvalidImage(format!(
                "pixel buffer holds {} bytes, {}x{} {} needs {}",
                pixels.len(),
                width,
                height,
                pixel_type,
                expected
            )));
        }
        Ok(Self {
            pixels,
            format,
            coords,
            metadata,
        })
    }

    /// 16-bit grayscale image from samples
    pub fn from_gray16(
        samples: &[u16],
        width: u32,
        height: u32,
        coords: Coords,
        metadata: Metadata,
    ) -> Result<Self> {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(bytes, width, height, PixelType::Gray16, coords, metadata)
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn pixel_type(&self) -> PixelType {
        self.format.pixel_type
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.pixel_type.bytes_per_pixel()
    }

    pub fn number_of_components(&self) -> usize {
        self.format.pixel_type.number_of_components()
    }

    pub fn coords(&self) -> &Coords {
        &self.coords
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Copy placed at another coordinate; shares the pixel buffer
    pub fn copy_at_coords(&self, coords: Coords) -> Image {
        Image {
            coords,
            ..self.clone()
        }
    }

    /// Copy with other metadata; shares the pixel buffer
    pub fn copy_with_metadata(&self, metadata: Metadata) -> Image {
        Image {
            metadata,
            ..self.clone()
        }
    }

    /// Copy with both coordinate and metadata replaced; shares the pixel buffer
    pub fn copy_with(&self, coords: Coords, metadata: Metadata) -> Image {
        Image {
            pixels: self.pixels.clone(),
            format: self.format,
            coords,
            metadata,
        }
    }

    /// Copy owning a private pixel buffer
    pub fn deep_copy(&self) -> Image {
        Image {
            pixels: Bytes::copy_from_slice(&self.pixels),
            ..self.clone()
        }
    }

    /// Raw value of one component of the pixel at (x, y)
    pub fn component_intensity_at(&self, x: u32, y: u32, component: usize) -> Option<u64> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let pixel_type = self.pixel_type();
        let offset = *pixel_type.component_offsets().get(component)?;
        let bpp = pixel_type.bytes_per_pixel();
        let start = (y as usize * self.width() as usize + x as usize) * bpp + offset;
        let raw = self
            .pixels
            .get(start..start + pixel_type.bytes_per_component())?;
        Some(match *raw {
            [b] => u64::from(b),
            [b0, b1] => u64::from(u16::from_le_bytes([b0, b1])),
            [b0, b1, b2, b3] => u64::from(u32::from_le_bytes([b0, b1, b2, b3])),
            _ => return None,
        })
    }

    /// Raw value of the first component of the pixel at (x, y)
    pub fn intensity_at(&self, x: u32, y: u32) -> Option<u64> {
        self.component_intensity_at(x, y, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(t: u32) -> Coords {
        Coords::builder().time(t).build().unwrap()
    }

    #[test]
    fn test_buffer_length_checked() {
        let err = Image::new(vec![0u8; 5], 2, 2, PixelType::Gray16, coords(0), Metadata::new());
        assert!(matches!(err, Err(DataError::InvalidImage(_))));
        assert!(Image::new(vec![0u8; 8], 2, 2, PixelType::Gray16, coords(0), Metadata::new()).is_ok());
        assert!(Image::new(Vec::<u8>::new(), 0, 0, PixelType::Gray8, coords(0), Metadata::new()).is_err());
    }

    #[test]
    fn test_copies_share_pixels() {
        let image = Image::new(vec![1u8, 2, 3, 4], 2, 2, PixelType::Gray8, coords(0), Metadata::new())
            .unwrap();
        let moved = image.copy_at_coords(coords(7));
        assert_eq!(moved.coords().time(), Some(7));
        assert_eq!(moved.pixels().as_ptr(), image.pixels().as_ptr());

        let deep = image.deep_copy();
        assert_eq!(deep.pixels(), image.pixels());
        assert_ne!(deep.pixels().as_ptr(), image.pixels().as_ptr());
    }

    #[test]
    fn test_intensity_lookup() {
        let image = Image::from_gray16(&[10, 20, 30, 40000], 2, 2, coords(0), Metadata::new()).unwrap();
        assert_eq!(image.intensity_at(0, 0), Some(10));
        assert_eq!(image.intensity_at(1, 1), Some(40000));
        assert_eq!(image.intensity_at(2, 0), None);

        // B, G, R, pad
        let rgb = Image::new(vec![1u8, 2, 3, 0], 1, 1, PixelType::Rgb32, coords(0), Metadata::new())
            .unwrap();
        assert_eq!(rgb.component_intensity_at(0, 0, 0), Some(3));
        assert_eq!(rgb.component_intensity_at(0, 0, 2), Some(1));
        assert_eq!(rgb.component_intensity_at(0, 0, 3), None);
    }
}
