//! Datastore façade: the single entry point for reading and writing a dataset

use crate::annotation::Annotation;
use crate::coords::Coords;
use crate::error::{DataError, Result};
use crate::events::{DataEvent, DataListener, EventBus, ListenerId, DEFAULT_PRIORITY};
use crate::file_series::SinglePlaneTiffSeries;
use crate::image::Image;
use crate::metadata::SummaryMetadata;
use crate::storage::{SaveMode, Storage};
use crate::types::PixelType;
use crate::utils::format_bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Size and shape of a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStats {
    pub num_images: usize,
    pub axes: Vec<String>,
    pub max_indices: Coords,
    pub pixel_type: Option<PixelType>,
    /// Uncompressed pixel bytes across all planes
    pub image_bytes: usize,
    pub frozen: bool,
}

impl DatasetStats {
    pub fn summary(&self) -> String {
        let pixel_type = self
            .pixel_type
            .map(|p| p.to_string())
            .unwrap_or_else(|| "no pixels".to_string());
        format!(
            "{} images, axes [{}], max {}, {}, {}{}",
            self.num_images,
            self.axes.join(", "),
            self.max_indices,
            pixel_type,
            format_bytes(self.image_bytes),
            if self.frozen { ", frozen" } else { "" }
        )
    }
}

/// One dataset: a storage backend plus summary metadata, annotations,
/// listeners and the freeze latch
///
/// All writes go through the datastore, which validates them, forwards them
/// to the backend and then notifies listeners. The backend hears about every
/// write event while the write lock is still held; consumers are notified
/// after it is released, whatever priority they registered at. Once
/// [`Datastore::freeze`] returns `Ok`, every thread sees the datastore as
/// frozen; reads keep working.
pub struct Datastore {
    storage: OnceLock<Arc<dyn Storage>>,
    bus: Arc<EventBus>,
    annotations: Mutex<HashMap<String, Arc<Annotation>>>,
    /// Summary metadata set before a backend was bound
    pending_summary: RwLock<Option<SummaryMetadata>>,
    summary_set: AtomicBool,
    frozen: AtomicBool,
    rewritable: bool,
    save_path: RwLock<Option<PathBuf>>,
    name: RwLock<Option<String>>,
    /// Serializes validation and insertion
    write_lock: Mutex<()>,
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore {
    /// Datastore rejecting a second image at the same coordinate
    pub fn new() -> Self {
        Self::with_rewritable(false)
    }

    /// Datastore where images can be overwritten and deleted
    pub fn rewritable() -> Self {
        Self::with_rewritable(true)
    }

    fn with_rewritable(rewritable: bool) -> Self {
        Self {
            storage: OnceLock::new(),
            bus: Arc::new(EventBus::new()),
            annotations: Mutex::new(HashMap::new()),
            pending_summary: RwLock::new(None),
            summary_set: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            rewritable,
            save_path: RwLock::new(None),
            name: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Bind the backend; only allowed once
    pub fn set_storage(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let backend = Arc::clone(&storage);
        self.storage
            .set(storage)
            .map_err(|_| DataError::AlreadySet("storage".to_string()))?;
        if let Some(summary) = self.pending_summary.write().take() {
            backend.handle_event(&DataEvent::NewSummaryMetadata(summary));
        }
        debug!(mode = %backend.save_mode(), "storage bound");
        self.bus
            .set_backend(move |event: &DataEvent| backend.handle_event(event));
        Ok(())
    }

    pub fn storage(&self) -> Result<&Arc<dyn Storage>> {
        self.storage.get().ok_or(DataError::NoStorage)
    }

    pub fn is_rewritable(&self) -> bool {
        self.rewritable
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn save_mode(&self) -> Option<SaveMode> {
        self.storage.get().map(|s| s.save_mode())
    }

    /// Axes images may use; empty means anything goes
    fn known_axes(&self, storage: &dyn Storage) -> Vec<String> {
        let mut axes = storage.axes();
        for axis in storage.summary_metadata().axis_order {
            if !axes.contains(&axis) {
                axes.push(axis);
            }
        }
        axes
    }

    /// Insert an image
    ///
    /// On a rewritable datastore an image already stored at the same
    /// coordinate is replaced and listeners receive
    /// [`DataEvent::ImageOverwritten`] instead of [`DataEvent::NewImage`].
    pub fn put_image(&self, image: Image) -> Result<()> {
        let event = {
            let _guard = self.write_lock.lock();
            if self.is_frozen() {
                return Err(DataError::Frozen);
            }
            let storage = self.storage()?;

            let known = self.known_axes(storage.as_ref());
            if !known.is_empty() {
                let unknown = image
                    .coords()
                    .axes()
                    .find(|a| !known.iter().any(|k| k.as_str() == *a));
                if let Some(axis) = unknown {
                    return Err(DataError::InvalidAxis(format!(
                        "{} is not one of the dataset axes {:?}",
                        axis, known
                    )));
                }
            }

            let coords = image.coords();
            let event = if storage.has_image(coords) {
                if !self.rewritable {
                    return Err(DataError::DuplicateCoordinate(coords.clone()));
                }
                let old_image = storage.delete_image(coords)?;
                if let Err(err) = storage.put_image(&image) {
                    if let Some(old_image) = &old_image {
                        if let Err(restore) = storage.put_image(old_image) {
                            warn!(coords = %coords, error = %restore, "could not restore replaced image");
                        }
                    }
                    return Err(err);
                }
                match old_image {
                    Some(old_image) => DataEvent::ImageOverwritten {
                        new_image: image,
                        old_image,
                    },
                    None => DataEvent::NewImage(image),
                }
            } else {
                storage.put_image(&image)?;
                DataEvent::NewImage(image)
            };
            self.bus.post_to_backend(&event);
            event
        };
        self.bus.post_to_consumers(&event);
        Ok(())
    }

    /// Set the dataset's summary metadata
    ///
    /// Non-rewritable datastores accept this once.
    pub fn set_summary_metadata(&self, summary: SummaryMetadata) -> Result<()> {
        let event = {
            let _guard = self.write_lock.lock();
            if self.is_frozen() {
                return Err(DataError::Frozen);
            }
            if self.summary_set.load(Ordering::Acquire) && !self.rewritable {
                return Err(DataError::AlreadySet("summary metadata".to_string()));
            }
            self.summary_set.store(true, Ordering::Release);
            if self.storage.get().is_none() {
                *self.pending_summary.write() = Some(summary.clone());
            }
            // The backend must hold the summary before the next put_image
            let event = DataEvent::NewSummaryMetadata(summary);
            self.bus.post_to_backend(&event);
            event
        };
        self.bus.post_to_consumers(&event);
        Ok(())
    }

    pub fn summary_metadata(&self) -> SummaryMetadata {
        match self.storage.get() {
            Some(storage) => storage.summary_metadata(),
            None => self.pending_summary.read().clone().unwrap_or_default(),
        }
    }

    /// Forbid further writes; repeated calls do nothing
    ///
    /// If the backend fails to freeze, the error is returned, the datastore
    /// stays unfrozen and no event is published, so the call can be retried.
    pub fn freeze(&self) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            if self.is_frozen() {
                return Ok(());
            }
            if let Some(storage) = self.storage.get() {
                storage.freeze()?;
            }
            self.frozen.store(true, Ordering::Release);
        }
        info!(name = ?self.name(), "datastore frozen");
        self.bus.post(&DataEvent::Frozen);
        Ok(())
    }

    /// Notify listeners, release the backend and drop every listener
    pub fn close(&self) -> Result<()> {
        self.bus.post(&DataEvent::Closing);
        let result = match self.storage.get() {
            Some(storage) => storage.close(),
            None => Ok(()),
        };
        self.bus.clear();
        self.annotations.lock().clear();
        debug!(name = ?self.name(), "datastore closed");
        result
    }

    /// Remove one image from a rewritable datastore
    pub fn delete_image(&self, coords: &Coords) -> Result<Option<Image>> {
        let deleted = {
            let _guard = self.write_lock.lock();
            self.ensure_deletable()?;
            self.storage()?.delete_image(coords)?
        };
        if let Some(image) = &deleted {
            self.bus.post(&DataEvent::ImageDeleted(image.clone()));
        }
        Ok(deleted)
    }

    /// Remove every image from a rewritable datastore, resetting max indices
    pub fn delete_all_images(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_deletable()?;
        self.storage()?.delete_all_images()?;
        debug!(name = ?self.name(), "deleted all images");
        Ok(())
    }

    fn ensure_deletable(&self) -> Result<()> {
        if !self.rewritable {
            return Err(DataError::NotRewritable);
        }
        if self.is_frozen() {
            return Err(DataError::Frozen);
        }
        Ok(())
    }

    pub fn get_image(&self, coords: &Coords) -> Result<Option<Image>> {
        self.storage()?.get_image(coords)
    }

    pub fn get_any_image(&self) -> Result<Option<Image>> {
        self.storage()?.get_any_image()
    }

    pub fn get_images_matching(&self, coords: &Coords) -> Result<Vec<Image>> {
        self.storage()?.get_images_matching(coords)
    }

    pub fn get_images_ignoring_axes(&self, coords: &Coords, ignored: &[&str]) -> Result<Vec<Image>> {
        self.storage()?.get_images_ignoring_axes(coords, ignored)
    }

    pub fn has_image(&self, coords: &Coords) -> bool {
        self.storage.get().is_some_and(|s| s.has_image(coords))
    }

    pub fn unordered_coords(&self) -> Vec<Coords> {
        self.storage.get().map(|s| s.unordered_coords()).unwrap_or_default()
    }

    /// Stored coordinates in ascending order
    pub fn ordered_coords(&self) -> Vec<Coords> {
        let mut coords = self.unordered_coords();
        coords.sort();
        coords
    }

    pub fn num_images(&self) -> usize {
        self.storage.get().map_or(0, |s| s.num_images())
    }

    pub fn max_index(&self, axis: &str) -> Option<u32> {
        self.storage.get().and_then(|s| s.max_index(axis))
    }

    pub fn max_indices(&self) -> Coords {
        self.storage.get().map(|s| s.max_indices()).unwrap_or_default()
    }

    pub fn axes(&self) -> Vec<String> {
        self.storage.get().map(|s| s.axes()).unwrap_or_default()
    }

    /// Listen at [`DEFAULT_PRIORITY`]
    pub fn register_listener<L: DataListener + 'static>(&self, listener: L) -> ListenerId {
        self.bus.register(listener, DEFAULT_PRIORITY)
    }

    /// Listen at `priority`; lower numbers hear about events first. The
    /// backend is always notified before any listener.
    pub fn register_listener_at<L: DataListener + 'static>(&self, listener: L, priority: i32) -> ListenerId {
        self.bus.register(listener, priority)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.bus.unregister(id)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn save_path(&self) -> Option<PathBuf> {
        self.save_path.read().clone()
    }

    pub fn set_save_path(&self, path: impl Into<PathBuf>) {
        *self.save_path.write() = Some(path.into());
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = Some(name.into());
    }

    /// Annotation called `name`, read from the save path if it was saved
    /// there and created empty otherwise
    pub fn load_annotation(&self, name: &str) -> Result<Arc<Annotation>> {
        let mut annotations = self.annotations.lock();
        if let Some(annotation) = annotations.get(name) {
            return Ok(Arc::clone(annotation));
        }
        let dir = self.save_path();
        let bus = Some(Arc::clone(&self.bus));
        let annotation = match &dir {
            Some(dir) if Annotation::exists(dir, name) => Annotation::load(dir, name, bus)?,
            _ => Annotation::new(name, dir, bus),
        };
        let annotation = Arc::new(annotation);
        annotations.insert(name.to_string(), Arc::clone(&annotation));
        Ok(annotation)
    }

    /// New empty annotation; fails if one called `name` exists in memory or
    /// on disk
    pub fn create_annotation(&self, name: &str) -> Result<Arc<Annotation>> {
        let mut annotations = self.annotations.lock();
        let dir = self.save_path();
        let on_disk = dir.as_deref().is_some_and(|d| Annotation::exists(d, name));
        if annotations.contains_key(name) || on_disk {
            return Err(DataError::AlreadyExists(format!("annotation {}", name)));
        }
        let annotation = Arc::new(Annotation::new(name, dir, Some(Arc::clone(&self.bus))));
        annotations.insert(name.to_string(), Arc::clone(&annotation));
        Ok(annotation)
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        if self.annotations.lock().contains_key(name) {
            return true;
        }
        self.save_path()
            .is_some_and(|dir| Annotation::exists(&dir, name))
    }

    /// Copy summary metadata and every image into `dest`
    ///
    /// `progress` is bumped once per image so another thread can poll it.
    /// There is no way to cancel the copy.
    pub fn copy_to(&self, dest: &Datastore, progress: &AtomicUsize) -> Result<()> {
        let storage = self.storage()?;
        dest.set_summary_metadata(storage.summary_metadata())?;
        for coords in self.ordered_coords() {
            if let Some(image) = storage.get_image(&coords)? {
                dest.put_image(image)?;
            }
            progress.fetch_add(1, Ordering::Relaxed);
        }
        debug!(images = progress.load(Ordering::Relaxed), "copied dataset");
        Ok(())
    }

    /// Write the dataset and its annotations into the new directory `dir`
    ///
    /// Afterwards `dir` is this datastore's save path.
    pub fn save(&self, mode: SaveMode, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if mode != SaveMode::SinglePlaneTiffSeries {
            return Err(DataError::Unsupported(format!(
                "cannot save to {} datasets",
                mode
            )));
        }
        let target = Datastore::new();
        target.set_storage(Arc::new(SinglePlaneTiffSeries::create(dir)?))?;
        let copied = AtomicUsize::new(0);
        self.copy_to(&target, &copied)?;
        target.freeze()?;

        let annotations: Vec<Arc<Annotation>> = self.annotations.lock().values().cloned().collect();
        for annotation in annotations {
            annotation.save_to(dir)?;
        }
        target.close()?;

        self.set_save_path(dir);
        if let Some(name) = dir.file_name() {
            self.set_name(name.to_string_lossy());
        }
        info!(dir = %dir.display(), images = copied.load(Ordering::Relaxed), "saved datastore");
        Ok(())
    }

    pub fn stats(&self) -> Result<DatasetStats> {
        let storage = self.storage()?;
        let num_images = storage.num_images();
        let format = match storage.summary_metadata().image_format() {
            Some(format) => Some(format),
            None => storage.get_any_image()?.map(|image| image.format()),
        };
        let plane_bytes = format.and_then(|f| f.plane_size_bytes()).unwrap_or(0);
        Ok(DatasetStats {
            num_images,
            axes: storage.axes(),
            max_indices: storage.max_indices(),
            pixel_type: format.map(|f| f.pixel_type),
            image_bytes: plane_bytes.saturating_mul(num_images),
            frozen: self.is_frozen(),
        })
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("name", &*self.name.read())
            .field("save_mode", &self.save_mode())
            .field("rewritable", &self.rewritable)
            .field("frozen", &self.is_frozen())
            .field("num_images", &self.num_images())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::ram::RamStorage;
    use crate::types::ImageFormat;
    use std::sync::Weak;

    /// In-memory backend that can fail its first freezes and records whether
    /// the datastore's write lock was held when summary metadata arrived
    #[derive(Default)]
    struct InstrumentedStorage {
        inner: RamStorage,
        failing_freezes: AtomicUsize,
        store: OnceLock<Weak<Datastore>>,
        summary_under_lock: Mutex<Vec<bool>>,
    }

    impl Storage for InstrumentedStorage {
        fn put_image(&self, image: &Image) -> Result<()> {
            self.inner.put_image(image)
        }
        fn get_image(&self, coords: &Coords) -> Result<Option<Image>> {
            self.inner.get_image(coords)
        }
        fn get_any_image(&self) -> Result<Option<Image>> {
            self.inner.get_any_image()
        }
        fn get_images_matching(&self, coords: &Coords) -> Result<Vec<Image>> {
            self.inner.get_images_matching(coords)
        }
        fn get_images_ignoring_axes(&self, coords: &Coords, ignored: &[&str]) -> Result<Vec<Image>> {
            self.inner.get_images_ignoring_axes(coords, ignored)
        }
        fn has_image(&self, coords: &Coords) -> bool {
            self.inner.has_image(coords)
        }
        fn unordered_coords(&self) -> Vec<Coords> {
            self.inner.unordered_coords()
        }
        fn num_images(&self) -> usize {
            self.inner.num_images()
        }
        fn max_index(&self, axis: &str) -> Option<u32> {
            self.inner.max_index(axis)
        }
        fn max_indices(&self) -> Coords {
            self.inner.max_indices()
        }
        fn axes(&self) -> Vec<String> {
            self.inner.axes()
        }
        fn summary_metadata(&self) -> SummaryMetadata {
            self.inner.summary_metadata()
        }
        fn freeze(&self) -> Result<()> {
            let remaining = self.failing_freezes.load(Ordering::Acquire);
            if remaining > 0 {
                self.failing_freezes.store(remaining - 1, Ordering::Release);
                return Err(DataError::Io(std::io::Error::other("disk full")));
            }
            self.inner.freeze()
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
        fn handle_event(&self, event: &DataEvent) {
            if let DataEvent::NewSummaryMetadata(_) = event {
                if let Some(store) = self.store.get().and_then(Weak::upgrade) {
                    self.summary_under_lock.lock().push(store.write_lock.is_locked());
                }
            }
            self.inner.handle_event(event);
        }
        fn save_mode(&self) -> SaveMode {
            self.inner.save_mode()
        }
    }

    fn frozen_events(store: &Datastore) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        store.register_listener(move |event: &DataEvent| {
            if let DataEvent::Frozen = event {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });
        count
    }

    fn ram_store(rewritable: bool) -> Datastore {
        let store = if rewritable {
            Datastore::rewritable()
        } else {
            Datastore::new()
        };
        store.set_storage(Arc::new(RamStorage::new())).unwrap();
        store
    }

    fn gray8(coords: Coords, fill: u8) -> Image {
        Image::new(vec![fill; 4], 2, 2, PixelType::Gray8, coords, Metadata::new()).unwrap()
    }

    fn t(index: u32) -> Coords {
        Coords::builder().time(index).build().unwrap()
    }

    #[test]
    fn test_storage_bound_once() {
        let store = ram_store(false);
        assert!(matches!(
            store.set_storage(Arc::new(RamStorage::new())),
            Err(DataError::AlreadySet(_))
        ));
        assert!(matches!(
            Datastore::new().put_image(gray8(t(0), 0)),
            Err(DataError::NoStorage)
        ));
    }

    #[test]
    fn test_summary_set_once() {
        let store = ram_store(false);
        store.set_summary_metadata(SummaryMetadata::new().with_prefix("a")).unwrap();
        assert!(matches!(
            store.set_summary_metadata(SummaryMetadata::new()),
            Err(DataError::AlreadySet(_))
        ));
        assert_eq!(store.summary_metadata().prefix.as_deref(), Some("a"));

        let rewritable = ram_store(true);
        rewritable.set_summary_metadata(SummaryMetadata::new().with_prefix("a")).unwrap();
        rewritable.set_summary_metadata(SummaryMetadata::new().with_prefix("b")).unwrap();
        assert_eq!(rewritable.summary_metadata().prefix.as_deref(), Some("b"));
    }

    #[test]
    fn test_summary_before_storage_is_forwarded() {
        let store = Datastore::new();
        store.set_summary_metadata(SummaryMetadata::new().with_prefix("early")).unwrap();
        assert_eq!(store.summary_metadata().prefix.as_deref(), Some("early"));
        store.set_storage(Arc::new(RamStorage::new())).unwrap();
        assert_eq!(store.summary_metadata().prefix.as_deref(), Some("early"));
    }

    #[test]
    fn test_axis_validation() {
        let store = ram_store(false);
        store.put_image(gray8(t(0), 0)).unwrap();
        let extra = Coords::builder().time(1).z(0).build().unwrap();
        assert!(matches!(store.put_image(gray8(extra, 0)), Err(DataError::InvalidAxis(_))));

        let declared = ram_store(false);
        declared
            .set_summary_metadata(SummaryMetadata::new().with_axis_order(["time", "z"]))
            .unwrap();
        let first = Coords::builder().channel(0).build().unwrap();
        assert!(matches!(declared.put_image(gray8(first, 0)), Err(DataError::InvalidAxis(_))));
        declared
            .put_image(gray8(Coords::builder().time(0).z(1).build().unwrap(), 0))
            .unwrap();
    }

    #[test]
    fn test_delete_requires_rewritable() {
        let store = ram_store(false);
        store.put_image(gray8(t(0), 0)).unwrap();
        assert!(matches!(store.delete_image(&t(0)), Err(DataError::NotRewritable)));
        assert!(matches!(store.delete_all_images(), Err(DataError::NotRewritable)));
    }

    #[test]
    fn test_stats() {
        let store = ram_store(false);
        for i in 0..3 {
            store.put_image(gray8(t(i), 0)).unwrap();
        }
        store.freeze().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.num_images, 3);
        assert_eq!(stats.image_bytes, 12);
        assert_eq!(stats.pixel_type, Some(PixelType::Gray8));
        assert_eq!(stats.max_indices, t(2));
        assert_eq!(stats.summary(), "3 images, axes [time], max <time=2>, GRAY8, 12 B, frozen");
    }

    #[test]
    fn test_failed_backend_freeze_leaves_store_open() {
        let backend = Arc::new(InstrumentedStorage {
            failing_freezes: AtomicUsize::new(1),
            ..InstrumentedStorage::default()
        });
        let store = Datastore::new();
        store.set_storage(backend).unwrap();
        let frozen = frozen_events(&store);

        assert!(matches!(store.freeze(), Err(DataError::Io(_))));
        assert!(!store.is_frozen());
        assert_eq!(frozen.load(Ordering::Relaxed), 0);
        store.put_image(gray8(t(0), 0)).unwrap();

        store.freeze().unwrap();
        store.freeze().unwrap();
        assert!(store.is_frozen());
        assert_eq!(frozen.load(Ordering::Relaxed), 1);
        assert!(matches!(store.put_image(gray8(t(1), 0)), Err(DataError::Frozen)));
    }

    #[test]
    fn test_backend_gets_summary_under_write_lock() {
        let backend = Arc::new(InstrumentedStorage::default());
        let store = Arc::new(Datastore::new());
        backend.store.set(Arc::downgrade(&store)).ok();
        store.set_storage(Arc::clone(&backend) as Arc<dyn Storage>).unwrap();

        // A consumer writing from its callback sees the declared format enforced
        let writer = Arc::downgrade(&store);
        let outcome = Arc::new(Mutex::new(None));
        {
            let outcome = Arc::clone(&outcome);
            store.register_listener_at(
                move |event: &DataEvent| {
                    if let (DataEvent::NewSummaryMetadata(_), Some(store)) = (event, writer.upgrade()) {
                        *outcome.lock() = Some(store.put_image(gray8(t(0), 0)));
                    }
                },
                i32::MIN,
            );
        }

        let declared = ImageFormat::new(2, 2, PixelType::Gray16);
        store
            .set_summary_metadata(SummaryMetadata::new().with_image_format(declared))
            .unwrap();
        assert_eq!(*backend.summary_under_lock.lock(), vec![true]);
        assert!(matches!(
            outcome.lock().take(),
            Some(Err(DataError::SizeMismatch(_)))
        ));
    }

    #[test]
    fn test_save_modes_other_than_series_rejected() {
        let store = ram_store(false);
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            store.save(SaveMode::Ram, tmp.path().join("x")),
            Err(DataError::Unsupported(_))
        ));
        assert!(matches!(
            store.save(SaveMode::MultipageTiff, tmp.path().join("x")),
            Err(DataError::Unsupported(_))
        ));
    }
}
