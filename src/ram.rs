//! In-memory storage backend

use crate::coords::{Coords, CHANNEL};
use crate::error::{DataError, Result};
use crate::events::DataEvent;
use crate::image::Image;
use crate::metadata::SummaryMetadata;
use crate::storage::{DatasetBounds, SaveMode, Storage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Cap on how many channel groups are reserved up front from intended dimensions
const MAX_PRESIZED_GROUPS: usize = 1 << 16;

#[derive(Debug, Default)]
struct RamIndex {
    images: HashMap<Coords, Image>,
    /// Coordinate without its channel axis → every stored coordinate that
    /// reduces to it
    channel_groups: HashMap<Coords, Vec<Coords>>,
    bounds: DatasetBounds,
    summary: SummaryMetadata,
}

impl RamIndex {
    fn all_axes_except_channel(&self, coords: &Coords) -> bool {
        let axes = self.bounds.ordered_axes(&self.summary);
        !coords.has_axis(CHANNEL)
            && axes.iter().any(|a| a == CHANNEL)
            && coords.len() + 1 == axes.len()
            && coords.axes().all(|a| axes.iter().any(|known| known == a))
    }

    fn channel_group(&self, key: &Coords) -> Vec<Image> {
        self.channel_groups
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|c| self.images.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn scan<F: Fn(&Coords) -> bool>(&self, keep: F) -> Vec<Image> {
        self.images
            .iter()
            .filter(|(coords, _)| keep(coords))
            .map(|(_, image)| image.clone())
            .collect()
    }
}

/// Storage keeping every image resident in memory
///
/// One coarse lock guards the whole index. Besides the coordinate table it
/// maintains a secondary index from "coordinate minus channel" to the
/// coordinates sharing it, so that gathering every channel of a plane does
/// not scan the table. Queries ignoring any other axis set scan every image,
/// which gets slow for very large datasets.
#[derive(Debug, Default)]
pub struct RamStorage {
    index: RwLock<RamIndex>,
    closed: AtomicBool,
}

impl RamStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DataError::Closed)
        } else {
            Ok(())
        }
    }

    fn presize(index: &mut RamIndex) {
        let Some(dims) = index.summary.intended_dimensions.as_ref() else {
            return;
        };
        let groups = dims
            .iter()
            .filter(|(axis, _)| *axis != CHANNEL)
            .try_fold(1usize, |acc, (_, length)| acc.checked_mul(length.max(1) as usize))
            .unwrap_or(MAX_PRESIZED_GROUPS)
            .min(MAX_PRESIZED_GROUPS);
        let channels = dims.channel().unwrap_or(1).max(1) as usize;
        index.channel_groups.reserve(groups);
        index
            .images
            .reserve(groups.saturating_mul(channels).min(MAX_PRESIZED_GROUPS));
        debug!(groups, channels, "presized in-memory index");
    }
}

impl Storage for RamStorage {
    fn put_image(&self, image: &Image) -> Result<()> {
        self.ensure_open()?;
        let mut index = self.index.write();
        index.bounds.check_format(image, &index.summary)?;

        let coords = image.coords().clone();
        let previous = index.images.insert(coords.clone(), image.clone());
        if previous.is_none() {
            index
                .channel_groups
                .entry(coords.removing_axes(&[CHANNEL]))
                .or_default()
                .push(coords.clone());
        }
        index.bounds.record(&coords, image.format());
        Ok(())
    }

    fn get_image(&self, coords: &Coords) -> Result<Option<Image>> {
        self.ensure_open()?;
        Ok(self.index.read().images.get(coords).cloned())
    }

    fn get_any_image(&self) -> Result<Option<Image>> {
        self.ensure_open()?;
        Ok(self.index.read().images.values().next().cloned())
    }

    fn get_images_matching(&self, coords: &Coords) -> Result<Vec<Image>> {
        self.ensure_open()?;
        let index = self.index.read();
        if let Some(image) = index.images.get(coords) {
            if coords.len() == index.bounds.ordered_axes(&index.summary).len() {
                return Ok(vec![image.clone()]);
            }
        }
        if index.all_axes_except_channel(coords) {
            return Ok(index.channel_group(coords));
        }
        Ok(index.scan(|stored| coords.is_superspace_of(stored)))
    }

    fn get_images_ignoring_axes(&self, coords: &Coords, ignored: &[&str]) -> Result<Vec<Image>> {
        self.ensure_open()?;
        let index = self.index.read();
        if ignored == [CHANNEL] {
            if coords.has_axis(CHANNEL) {
                return Ok(Vec::new());
            }
            return Ok(index.channel_group(coords));
        }
        Ok(index.scan(|stored| stored.removing_axes(ignored) == *coords))
    }

    fn has_image(&self, coords: &Coords) -> bool {
        self.index.read().images.contains_key(coords)
    }

    fn unordered_coords(&self) -> Vec<Coords> {
        self.index.read().images.keys().cloned().collect()
    }

    fn num_images(&self) -> usize {
        self.index.read().images.len()
    }

    fn max_index(&self, axis: &str) -> Option<u32> {
        self.index.read().bounds.max_index(axis)
    }

    fn max_indices(&self) -> Coords {
        self.index.read().bounds.max_indices()
    }

    fn axes(&self) -> Vec<String> {
        let index = self.index.read();
        index.bounds.ordered_axes(&index.summary)
    }

    fn summary_metadata(&self) -> SummaryMetadata {
        self.index.read().summary.clone()
    }

    /// Max indices are left untouched
    fn delete_image(&self, coords: &Coords) -> Result<Option<Image>> {
        self.ensure_open()?;
        let mut index = self.index.write();
        let Some(image) = index.images.remove(coords) else {
            return Ok(None);
        };
        let key = coords.removing_axes(&[CHANNEL]);
        if let Some(members) = index.channel_groups.get_mut(&key) {
            members.retain(|c| c != coords);
            if members.is_empty() {
                index.channel_groups.remove(&key);
            }
        }
        Ok(Some(image))
    }

    fn delete_all_images(&self) -> Result<()> {
        self.ensure_open()?;
        let mut index = self.index.write();
        index.images.clear();
        index.channel_groups.clear();
        index.bounds.clear();
        Ok(())
    }

    fn freeze(&self) -> Result<()> {
        debug!("in-memory storage frozen");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut index = self.index.write();
        *index = RamIndex::default();
        debug!("in-memory storage closed");
        Ok(())
    }

    fn handle_event(&self, event: &DataEvent) {
        if let DataEvent::NewSummaryMetadata(summary) = event {
            let mut index = self.index.write();
            index.summary = summary.clone();
            if index.images.is_empty() {
                Self::presize(&mut index);
            }
        }
    }

    fn save_mode(&self) -> SaveMode {
        SaveMode::Ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::types::{ImageFormat, PixelType};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn image_at(t: u32, c: u32, z: u32) -> Image {
        let coords = Coords::builder().time(t).channel(c).z(z).build().unwrap();
        let fill = (t * 100 + c * 10 + z) as u8;
        Image::new(vec![fill; 4], 2, 2, PixelType::Gray8, coords, Metadata::new()).unwrap()
    }

    fn filled() -> RamStorage {
        let storage = RamStorage::new();
        for t in 0..2 {
            for c in 0..2 {
                storage.put_image(&image_at(t, c, 0)).unwrap();
            }
        }
        storage
    }

    fn coord_set(images: &[Image]) -> HashSet<Coords> {
        images.iter().map(|i| i.coords().clone()).collect()
    }

    #[test]
    fn test_put_and_get() {
        let storage = filled();
        assert_eq!(storage.num_images(), 4);
        let c = Coords::builder().time(1).channel(0).z(0).build().unwrap();
        let image = storage.get_image(&c).unwrap().unwrap();
        assert_eq!(image.pixels()[0], 100);
        assert!(storage.has_image(&c));
        let absent = Coords::builder().time(9).channel(0).z(0).build().unwrap();
        assert!(storage.get_image(&absent).unwrap().is_none());
    }

    #[test]
    fn test_matching_by_channel() {
        let storage = filled();
        let query = Coords::builder().channel(1).build().unwrap();
        let found = storage.get_images_matching(&query).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|i| i.coords().channel() == Some(1)));
    }

    #[test]
    fn test_channel_index_path_equals_scan() {
        let storage = filled();
        let plane = Coords::builder().time(1).z(0).build().unwrap();
        let via_index = storage.get_images_matching(&plane).unwrap();
        let via_ignore = storage.get_images_ignoring_axes(&plane, &[CHANNEL]).unwrap();
        let expected: HashSet<Coords> = (0..2)
            .map(|c| Coords::builder().time(1).channel(c).z(0).build().unwrap())
            .collect();
        assert_eq!(coord_set(&via_index), expected);
        assert_eq!(coord_set(&via_ignore), expected);
    }

    #[test]
    fn test_ignoring_other_axes_scans() {
        let storage = filled();
        let query = Coords::builder().channel(0).z(0).build().unwrap();
        let found = storage.get_images_ignoring_axes(&query, &["time"]).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_size_mismatch() {
        let storage = filled();
        let coords = Coords::builder().time(5).channel(0).z(0).build().unwrap();
        let big = Image::new(vec![0u8; 9], 3, 3, PixelType::Gray8, coords, Metadata::new()).unwrap();
        assert!(matches!(storage.put_image(&big), Err(DataError::SizeMismatch(_))));
    }

    #[test]
    fn test_summary_declared_format_checked_for_first_image() {
        let storage = RamStorage::new();
        let summary = SummaryMetadata::new().with_image_format(ImageFormat::new(2, 2, PixelType::Gray16));
        storage.handle_event(&DataEvent::NewSummaryMetadata(summary));
        assert!(matches!(
            storage.put_image(&image_at(0, 0, 0)),
            Err(DataError::SizeMismatch(_))
        ));
    }

    #[test]
    fn test_max_index_monotonic_across_delete() {
        let storage = filled();
        let last = Coords::builder().time(1).channel(1).z(0).build().unwrap();
        assert!(storage.delete_image(&last).unwrap().is_some());
        assert_eq!(storage.max_index("time"), Some(1));
        assert_eq!(storage.max_index("channel"), Some(1));
        assert!(!storage.has_image(&last));

        let plane = Coords::builder().time(1).z(0).build().unwrap();
        assert_eq!(storage.get_images_ignoring_axes(&plane, &[CHANNEL]).unwrap().len(), 1);

        storage.delete_all_images().unwrap();
        assert_eq!(storage.max_index("time"), None);
        assert!(storage.max_indices().is_empty());
        assert_eq!(storage.num_images(), 0);
    }

    #[test]
    fn test_axes_follow_summary_order() {
        let storage = RamStorage::new();
        storage.handle_event(&DataEvent::NewSummaryMetadata(
            SummaryMetadata::new()
                .with_axis_order(["z", "channel", "time"])
                .with_intended_dimensions(Coords::builder().time(4).channel(2).z(3).build().unwrap()),
        ));
        storage.put_image(&image_at(0, 0, 0)).unwrap();
        assert_eq!(storage.axes(), vec!["z", "channel", "time"]);
    }

    #[test]
    fn test_closed_storage_rejects_calls() {
        let storage = filled();
        storage.close().unwrap();
        assert!(matches!(storage.put_image(&image_at(3, 0, 0)), Err(DataError::Closed)));
        assert!(matches!(storage.get_any_image(), Err(DataError::Closed)));
        assert_eq!(storage.num_images(), 0);
    }

    #[test]
    fn test_concurrent_insert_and_scan() {
        let storage = Arc::new(RamStorage::new());
        let writer = {
            let storage = Arc::clone(&storage);
            std::thread::spawn(move || {
                for t in 0..200 {
                    storage.put_image(&image_at(t, t % 3, 0)).unwrap();
                }
            })
        };
        let query = Coords::builder().z(0).build().unwrap();
        let mut last_seen = 0;
        for _ in 0..50 {
            let seen = storage.get_images_matching(&query).unwrap().len();
            assert!(seen >= last_seen);
            last_seen = seen;
        }
        writer.join().unwrap();
        assert_eq!(storage.get_images_matching(&query).unwrap().len(), 200);
    }
}
