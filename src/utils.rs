//! Utility functions

use crate::coords::{Coords, TIME_POINT};

/// Canonical file name of the plane at `coords`
///
/// Axes are written in lexicographic order, each as `_<axis><index>` with the
/// index zero-padded to nine digits for time and three for everything else.
pub fn plane_file_name(coords: &Coords) -> String {
    let mut name = String::from("img");
    for (axis, index) in coords.iter() {
        if axis == TIME_POINT {
            name.push_str(&format!("_{}{:09}", axis, index));
        } else {
            name.push_str(&format!("_{}{:03}", axis, index));
        }
    }
    name.push_str(".tif");
    name
}

/// File name older datasets used for a plane
pub fn legacy_file_name(time: u32, channel_name: &str, z: u32) -> String {
    format!("img_{:09}_{}_{:03}.tif", time, channel_name, z)
}

/// Split a legacy file name into time, channel name and z
pub fn parse_legacy_file_name(name: &str) -> Option<(u32, String, u32)> {
    let stem = name.strip_prefix("img_")?.strip_suffix(".tif")?;
    let (time, rest) = stem.split_once('_')?;
    let (channel, z) = rest.rsplit_once('_')?;
    if !is_digits(time) || !is_digits(z) {
        return None;
    }
    Some((time.parse().ok()?, channel.to_string(), z.parse().ok()?))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
