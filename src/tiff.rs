//! Minimal baseline TIFF codec for single image planes
//!
//! Writes little-endian, uncompressed, single-strip files with the plane's
//! JSON description in the ImageDescription tag. Reads either byte order and
//! any number of uncompressed strips. Pixels are exchanged in the in-memory
//! layout [`Image`](crate::Image) uses: little-endian samples, RGB as
//! B, G, R, pad.

use crate::error::{DataError, Result};
use crate::types::{ImageFormat, PixelType};
use std::fs;
use std::path::Path;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_EXTRA_SAMPLES: u16 = 338;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

const HEADER_LEN: usize = 8;
const ENTRY_LEN: usize = 12;

/// A decoded plane
#[derive(Debug, Clone, PartialEq)]
pub struct TiffPlane {
    pub format: ImageFormat,
    pub pixels: Vec<u8>,
    pub description: Option<String>,
}

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Inline value bytes, unused when the value lives at `offset`
    inline: [u8; 4],
    offset: Option<u32>,
}

impl Entry {
    fn short(tag: u16, value: u16) -> Self {
        let mut inline = [0u8; 4];
        inline[..2].copy_from_slice(&value.to_le_bytes());
        Self {
            tag,
            field_type: TYPE_SHORT,
            count: 1,
            inline,
            offset: None,
        }
    }

    fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            field_type: TYPE_LONG,
            count: 1,
            inline: value.to_le_bytes(),
            offset: None,
        }
    }

    fn external(tag: u16, field_type: u16, count: u32, offset: u32) -> Self {
        Self {
            tag,
            field_type,
            count,
            inline: [0u8; 4],
            offset: Some(offset),
        }
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| DataError::Tiff(format!("{} exceeds 4 GiB", what)))
}

/// Encode one plane as a TIFF file in memory
pub fn encode(format: ImageFormat, pixels: &[u8], description: Option<&str>) -> Result<Vec<u8>> {
    let expected = format
        .plane_size_bytes()
        .ok_or_else(|| DataError::Tiff("plane too large".to_string()))?;
    if pixels.len() != expected {
        return Err(DataError::Tiff(format!(
            "pixel buffer holds {} bytes, expected {}",
            pixels.len(),
            expected
        )));
    }

    let rgb = format.pixel_type == PixelType::Rgb32;
    let samples_per_pixel: u16 = if rgb { 4 } else { 1 };
    let bits = (format.pixel_type.bytes_per_component() * 8) as u16;
    let description = description.map(|d| {
        let mut bytes = d.as_bytes().to_vec();
        bytes.push(0);
        bytes
    });

    let mut entry_count = 10;
    if description.is_some() {
        entry_count += 1;
    }
    if rgb || format.pixel_type.is_float() {
        entry_count += 1;
    }
    let ifd_len = 2 + entry_count * ENTRY_LEN + 4;

    // Out-of-line data follows the IFD: bits per sample (RGBA only),
    // description, then the single strip.
    let mut cursor = HEADER_LEN + ifd_len;
    let bits_offset = if rgb {
        let at = cursor;
        cursor += 2 * samples_per_pixel as usize;
        Some(to_u32(at, "header")?)
    } else {
        None
    };
    let description_offset = match &description {
        Some(bytes) if bytes.len() > 4 => {
            let at = cursor;
            cursor += bytes.len();
            Some(to_u32(at, "description")?)
        }
        _ => None,
    };
    // Word-align the strip
    cursor += cursor % 2;
    let strip_offset = to_u32(cursor, "strip offset")?;
    let strip_len = to_u32(pixels.len(), "strip")?;
    to_u32(cursor + pixels.len(), "file")?;

    let mut entries = vec![
        Entry::long(TAG_IMAGE_WIDTH, format.width),
        Entry::long(TAG_IMAGE_LENGTH, format.height),
        match bits_offset {
            Some(at) => Entry::external(TAG_BITS_PER_SAMPLE, TYPE_SHORT, samples_per_pixel as u32, at),
            None => Entry::short(TAG_BITS_PER_SAMPLE, bits),
        },
        Entry::short(TAG_COMPRESSION, 1),
        Entry::short(TAG_PHOTOMETRIC, if rgb { 2 } else { 1 }),
    ];
    if let Some(bytes) = &description {
        let count = to_u32(bytes.len(), "description")?;
        entries.push(match description_offset {
            Some(at) => Entry::external(TAG_IMAGE_DESCRIPTION, TYPE_ASCII, count, at),
            None => {
                let mut inline = [0u8; 4];
                inline[..bytes.len()].copy_from_slice(bytes);
                Entry {
                    tag: TAG_IMAGE_DESCRIPTION,
                    field_type: TYPE_ASCII,
                    count,
                    inline,
                    offset: None,
                }
            }
        });
    }
    entries.extend([
        Entry::long(TAG_STRIP_OFFSETS, strip_offset),
        Entry::short(TAG_SAMPLES_PER_PIXEL, samples_per_pixel),
        Entry::long(TAG_ROWS_PER_STRIP, format.height),
        Entry::long(TAG_STRIP_BYTE_COUNTS, strip_len),
        Entry::short(TAG_PLANAR_CONFIG, 1),
    ]);
    if rgb {
        // Fourth sample is unspecified padding
        entries.push(Entry::short(TAG_EXTRA_SAMPLES, 0));
    } else if format.pixel_type.is_float() {
        entries.push(Entry::short(TAG_SAMPLE_FORMAT, 3));
    }
    debug_assert_eq!(entries.len(), entry_count);

    let mut out = Vec::with_capacity(cursor + pixels.len());
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(&(entry_count as u16).to_le_bytes());
    for entry in &entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.field_type.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        match entry.offset {
            Some(at) => out.extend_from_slice(&at.to_le_bytes()),
            None => out.extend_from_slice(&entry.inline),
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());

    if bits_offset.is_some() {
        for _ in 0..samples_per_pixel {
            out.extend_from_slice(&bits.to_le_bytes());
        }
    }
    if let (Some(bytes), Some(_)) = (&description, description_offset) {
        out.extend_from_slice(bytes);
    }
    out.resize(strip_offset as usize, 0);

    if rgb {
        for pixel in pixels.chunks_exact(4) {
            out.extend_from_slice(&[pixel[2], pixel[1], pixel[0], pixel[3]]);
        }
    } else {
        out.extend_from_slice(pixels);
    }
    Ok(out)
}

/// Write one plane to `path`
pub fn write_file(
    path: &Path,
    format: ImageFormat,
    pixels: &[u8],
    description: Option<&str>,
) -> Result<()> {
    let bytes = encode(format, pixels, description)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Read the first plane of the TIFF file at `path`
pub fn read_file(path: &Path) -> Result<TiffPlane> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}

struct Reader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn slice(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        at.checked_add(len)
            .and_then(|end| self.data.get(at..end))
            .ok_or_else(|| DataError::Tiff(format!("truncated file: {} bytes at {}", len, at)))
    }

    fn u16_at(&self, at: usize) -> Result<u16> {
        let b = self.slice(at, 2)?;
        let raw = [b[0], b[1]];
        Ok(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    fn u32_at(&self, at: usize) -> Result<u32> {
        let b = self.slice(at, 4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }
}

/// Raw directory entry: where its values start and how to read them
struct RawEntry {
    field_type: u16,
    count: usize,
    value_at: usize,
}

impl RawEntry {
    fn values(&self, reader: &Reader<'_>) -> Result<Vec<u32>> {
        (0..self.count)
            .map(|i| match self.field_type {
                TYPE_BYTE => Ok(u32::from(reader.slice(self.value_at + i, 1)?[0])),
                TYPE_SHORT => reader.u16_at(self.value_at + 2 * i).map(u32::from),
                TYPE_LONG => reader.u32_at(self.value_at + 4 * i),
                other => Err(DataError::Tiff(format!("unexpected field type {}", other))),
            })
            .collect()
    }

    fn first(&self, reader: &Reader<'_>) -> Result<u32> {
        self.values(reader)?
            .first()
            .copied()
            .ok_or_else(|| DataError::Tiff("empty field".to_string()))
    }
}

fn type_size(field_type: u16) -> usize {
    match field_type {
        TYPE_SHORT => 2,
        TYPE_LONG => 4,
        _ => 1,
    }
}

/// Decode the first plane of a TIFF file
pub fn decode(data: &[u8]) -> Result<TiffPlane> {
    let big_endian = match data.get(0..2) {
        Some(b"II") => false,
        Some(b"MM") => true,
        _ => return Err(DataError::Tiff("missing byte order mark".to_string())),
    };
    let reader = Reader { data, big_endian };
    if reader.u16_at(2)? != 42 {
        return Err(DataError::Tiff("not a classic TIFF file".to_string()));
    }
    let ifd = reader.u32_at(4)? as usize;
    let count = reader.u16_at(ifd)? as usize;

    let mut entries = std::collections::HashMap::new();
    for i in 0..count {
        let at = ifd + 2 + i * ENTRY_LEN;
        let tag = reader.u16_at(at)?;
        let field_type = reader.u16_at(at + 2)?;
        let value_count = reader.u32_at(at + 4)? as usize;
        let value_at = if value_count.saturating_mul(type_size(field_type)) <= 4 {
            at + 8
        } else {
            reader.u32_at(at + 8)? as usize
        };
        entries.insert(
            tag,
            RawEntry {
                field_type,
                count: value_count,
                value_at,
            },
        );
    }

    let required = |tag: u16| {
        entries
            .get(&tag)
            .ok_or_else(|| DataError::Tiff(format!("missing required tag {}", tag)))
    };
    let optional = |tag: u16, default: u32| -> Result<u32> {
        match entries.get(&tag) {
            Some(entry) => entry.first(&reader),
            None => Ok(default),
        }
    };

    let width = required(TAG_IMAGE_WIDTH)?.first(&reader)?;
    let height = required(TAG_IMAGE_LENGTH)?.first(&reader)?;
    let bits = optional(TAG_BITS_PER_SAMPLE, 1)?;
    let samples_per_pixel = optional(TAG_SAMPLES_PER_PIXEL, 1)?;
    let compression = optional(TAG_COMPRESSION, 1)?;
    if compression != 1 {
        return Err(DataError::Tiff(format!(
            "compression scheme {} is not supported",
            compression
        )));
    }
    if optional(TAG_PLANAR_CONFIG, 1)? != 1 {
        return Err(DataError::Tiff("planar sample layout is not supported".to_string()));
    }

    let pixel_type = match (bits, samples_per_pixel) {
        (8, 1) => PixelType::Gray8,
        (16, 1) => PixelType::Gray16,
        (32, 1) => PixelType::Gray32,
        (8, 3) | (8, 4) => PixelType::Rgb32,
        (b, s) => {
            return Err(DataError::Tiff(format!(
                "{} samples of {} bits per pixel are not supported",
                s, b
            )))
        }
    };
    let format = ImageFormat::new(width, height, pixel_type);

    let offsets = required(TAG_STRIP_OFFSETS)?.values(&reader)?;
    let byte_counts = required(TAG_STRIP_BYTE_COUNTS)?.values(&reader)?;
    if offsets.len() != byte_counts.len() {
        return Err(DataError::Tiff("strip offsets and byte counts disagree".to_string()));
    }
    let mut raw = Vec::new();
    for (offset, len) in offsets.iter().zip(&byte_counts) {
        raw.extend_from_slice(reader.slice(*offset as usize, *len as usize)?);
    }

    let file_bytes_per_pixel = (bits as usize / 8) * samples_per_pixel as usize;
    let needed = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(file_bytes_per_pixel))
        .ok_or_else(|| DataError::Tiff("plane too large".to_string()))?;
    if raw.len() < needed {
        return Err(DataError::Tiff(format!(
            "strips hold {} bytes, plane needs {}",
            raw.len(),
            needed
        )));
    }
    raw.truncate(needed);

    let pixels = match (pixel_type, samples_per_pixel) {
        (PixelType::Rgb32, 3) => raw
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0], 0])
            .collect(),
        (PixelType::Rgb32, _) => raw
            .chunks_exact(4)
            .flat_map(|p| [p[2], p[1], p[0], p[3]])
            .collect(),
        (PixelType::Gray16, _) if big_endian => {
            raw.chunks_exact(2).flat_map(|s| [s[1], s[0]]).collect()
        }
        (PixelType::Gray32, _) if big_endian => raw
            .chunks_exact(4)
            .flat_map(|s| [s[3], s[2], s[1], s[0]])
            .collect(),
        _ => raw,
    };

    let description = match entries.get(&TAG_IMAGE_DESCRIPTION) {
        Some(entry) if entry.field_type == TYPE_ASCII => {
            let bytes = reader.slice(entry.value_at, entry.count)?;
            let text = String::from_utf8_lossy(bytes);
            Some(text.trim_end_matches('\0').to_string())
        }
        _ => None,
    };

    Ok(TiffPlane {
        format,
        pixels,
        description,
    })
}
