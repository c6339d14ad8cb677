//! Storage backend contract and shared bookkeeping

use crate::coords::Coords;
use crate::error::{DataError, Result};
use crate::events::DataEvent;
use crate::image::Image;
use crate::metadata::SummaryMetadata;
use crate::types::ImageFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ways a datastore can keep its images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Everything resident in memory
    #[serde(alias = "memory")]
    Ram,
    /// One TIFF file per image plane plus a JSON journal per position
    #[serde(alias = "singleplane", alias = "single_plane")]
    SinglePlaneTiffSeries,
    /// Many planes per TIFF file (handled by a separate backend)
    #[serde(alias = "multipage")]
    MultipageTiff,
}

impl FromStr for SaveMode {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ram" | "memory" => Ok(SaveMode::Ram),
            "singleplane" | "single_plane" | "single_plane_tiff_series" => {
                Ok(SaveMode::SinglePlaneTiffSeries)
            }
            "multipage" | "multipage_tiff" => Ok(SaveMode::MultipageTiff),
            other => Err(DataError::Unsupported(format!("unknown save mode: {}", other))),
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SaveMode::Ram => "ram",
            SaveMode::SinglePlaneTiffSeries => "single_plane_tiff_series",
            SaveMode::MultipageTiff => "multipage_tiff",
        })
    }
}

/// Physical persistence and indexing of a dataset's images
///
/// Implementations use interior mutability; a [`Datastore`](crate::Datastore)
/// shares its backend behind an `Arc`. After [`Storage::close`] every
/// operation fails with [`DataError::Closed`] or returns an empty result.
pub trait Storage: Send + Sync {
    /// Store an image
    ///
    /// Fails with [`DataError::SizeMismatch`] if the plane geometry or pixel
    /// type differs from previously stored images, or from the format the
    /// summary metadata declares when this is the first image.
    fn put_image(&self, image: &Image) -> Result<()>;

    /// Image at exactly `coords`; `None` if nothing is stored there
    fn get_image(&self, coords: &Coords) -> Result<Option<Image>>;

    /// Some stored image, if any
    fn get_any_image(&self) -> Result<Option<Image>>;

    /// Every stored image whose coordinate agrees with `coords` on all the
    /// axes `coords` defines
    fn get_images_matching(&self, coords: &Coords) -> Result<Vec<Image>>;

    /// Every stored image whose coordinate equals `coords` once the
    /// `ignored` axes are removed
    fn get_images_ignoring_axes(&self, coords: &Coords, ignored: &[&str]) -> Result<Vec<Image>>;

    fn has_image(&self, coords: &Coords) -> bool;

    fn unordered_coords(&self) -> Vec<Coords>;

    fn num_images(&self) -> usize;

    /// Highest index stored along `axis`; `None` if the axis was never used
    fn max_index(&self, axis: &str) -> Option<u32>;

    fn max_indices(&self) -> Coords;

    /// Axes in use, summary axis order first
    fn axes(&self) -> Vec<String>;

    fn summary_metadata(&self) -> SummaryMetadata;

    /// Remove the image at `coords`, returning it
    fn delete_image(&self, _coords: &Coords) -> Result<Option<Image>> {
        Err(DataError::Unsupported(format!(
            "{} storage cannot delete images",
            self.save_mode()
        )))
    }

    /// Remove every image and reset max indices
    fn delete_all_images(&self) -> Result<()> {
        Err(DataError::Unsupported(format!(
            "{} storage cannot delete images",
            self.save_mode()
        )))
    }

    /// Stop accepting writes and flush anything pending
    fn freeze(&self) -> Result<()>;

    /// Release every resident resource
    fn close(&self) -> Result<()>;

    /// Datastore events, delivered before any consumer sees them
    fn handle_event(&self, _event: &DataEvent) {}

    fn save_mode(&self) -> SaveMode;
}

/// Running per-dataset bookkeeping shared by the backends: max index per
/// axis, axes in first-seen order and the established plane format.
#[derive(Debug, Clone, Default)]
pub(crate) struct DatasetBounds {
    max: BTreeMap<String, u32>,
    axes: Vec<String>,
    format: Option<ImageFormat>,
}

impl DatasetBounds {
    /// Check an incoming image against the established format, or against
    /// the summary's declared format for the first image
    pub(crate) fn check_format(&self, image: &Image, summary: &SummaryMetadata) -> Result<()> {
        match self.format.or_else(|| summary.image_format()) {
            Some(expected) => expected.ensure_matches(&image.format()),
            None => Ok(()),
        }
    }

    /// Fold a stored coordinate into the bounds
    pub(crate) fn record(&mut self, coords: &Coords, format: ImageFormat) {
        if self.format.is_none() {
            self.format = Some(format);
        }
        for (axis, index) in coords.iter() {
            if !self.axes.iter().any(|a| a == axis) {
                self.axes.push(axis.to_string());
            }
            let max = self.max.entry(axis.to_string()).or_insert(index);
            if index > *max {
                *max = index;
            }
        }
    }

    pub(crate) fn max_index(&self, axis: &str) -> Option<u32> {
        self.max.get(axis).copied()
    }

    pub(crate) fn max_indices(&self) -> Coords {
        Coords::try_from(self.max.clone()).unwrap_or_default()
    }

    pub(crate) fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub(crate) fn ordered_axes(&self, summary: &SummaryMetadata) -> Vec<String> {
        ordered_axes(&self.axes, &summary.axis_order)
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Axes from `seen`, those named in `preferred` first and in that order,
/// the rest in first-seen order
pub(crate) fn ordered_axes(seen: &[String], preferred: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = preferred
        .iter()
        .filter(|axis| seen.contains(axis))
        .cloned()
        .collect();
    for axis in seen {
        if !ordered.contains(axis) {
            ordered.push(axis.clone());
        }
    }
    ordered
}
