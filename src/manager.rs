//! Creating, loading and saving datastores

use crate::datastore::Datastore;
use crate::error::{DataError, Result};
use crate::file_series::{SinglePlaneTiffSeries, JOURNAL_FILE_NAME};
use crate::ram::RamStorage;
use crate::storage::SaveMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::{debug, info};

/// Settings for a [`DataManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataManagerConfig {
    /// Format used by [`DataManager::save`]
    pub default_save_mode: SaveMode,
    /// Whether RAM datastores allow overwriting and deleting images
    pub rewritable: bool,
    /// Whether [`DataManager::load`] copies datasets into memory
    pub load_into_ram: bool,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            default_save_mode: SaveMode::SinglePlaneTiffSeries,
            rewritable: false,
            load_into_ram: false,
        }
    }
}

impl DataManagerConfig {
    /// Read a JSON config; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Entry point for creating and loading datastores
#[derive(Debug, Clone, Default)]
pub struct DataManager {
    config: DataManagerConfig,
}

impl DataManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DataManagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DataManagerConfig {
        &self.config
    }

    /// In-memory datastore, rewritable if the config says so
    pub fn create_ram_datastore(&self) -> Result<Datastore> {
        let store = if self.config.rewritable {
            Datastore::rewritable()
        } else {
            Datastore::new()
        };
        store.set_storage(Arc::new(RamStorage::new()))?;
        Ok(store)
    }

    pub fn create_rewritable_ram_datastore(&self) -> Result<Datastore> {
        let store = Datastore::rewritable();
        store.set_storage(Arc::new(RamStorage::new()))?;
        Ok(store)
    }

    /// Datastore writing a new single-plane TIFF series into `dir`
    pub fn create_single_plane_tiff_series_datastore(&self, dir: impl AsRef<Path>) -> Result<Datastore> {
        let dir = dir.as_ref();
        let store = Datastore::new();
        store.set_storage(Arc::new(SinglePlaneTiffSeries::create(dir)?))?;
        name_after(&store, dir);
        Ok(store)
    }

    /// Datastore of the given kind; file-backed kinds need `dir`
    pub fn create_datastore(&self, mode: SaveMode, dir: Option<&Path>) -> Result<Datastore> {
        match (mode, dir) {
            (SaveMode::Ram, _) => self.create_ram_datastore(),
            (SaveMode::SinglePlaneTiffSeries, Some(dir)) => {
                self.create_single_plane_tiff_series_datastore(dir)
            }
            (SaveMode::SinglePlaneTiffSeries, None) => Err(DataError::Unsupported(
                "a single-plane TIFF series needs a directory".to_string(),
            )),
            (SaveMode::MultipageTiff, _) => Err(DataError::Unsupported(
                "multipage TIFF datasets are not supported".to_string(),
            )),
        }
    }

    /// Save `store` into `dir` using the configured format
    pub fn save(&self, store: &Datastore, dir: impl AsRef<Path>) -> Result<()> {
        store.save(self.config.default_save_mode, dir)
    }

    /// Load with the configured `load_into_ram` setting
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<Datastore> {
        self.load_data(dir, self.config.load_into_ram)
    }

    /// Open the dataset in `dir`, frozen
    pub fn load_data(&self, dir: impl AsRef<Path>, into_ram: bool) -> Result<Datastore> {
        self.load_data_with_progress(dir, into_ram, &AtomicUsize::new(0))
    }

    /// Open the dataset in `dir`, frozen
    ///
    /// With `into_ram` every image is copied into memory and `progress`
    /// counts the images copied so far.
    pub fn load_data_with_progress(
        &self,
        dir: impl AsRef<Path>,
        into_ram: bool,
        progress: &AtomicUsize,
    ) -> Result<Datastore> {
        let dir = dir.as_ref();
        match detect_save_mode(dir)? {
            SaveMode::SinglePlaneTiffSeries => {}
            other => {
                return Err(DataError::Unsupported(format!(
                    "cannot load {} dataset at {}",
                    other,
                    dir.display()
                )))
            }
        }

        let on_disk = Datastore::new();
        on_disk.set_storage(Arc::new(SinglePlaneTiffSeries::open(dir)?))?;
        name_after(&on_disk, dir);
        if !into_ram {
            on_disk.freeze()?;
            info!(dir = %dir.display(), images = on_disk.num_images(), "loaded dataset");
            return Ok(on_disk);
        }

        let in_memory = Datastore::new();
        in_memory.set_storage(Arc::new(RamStorage::new()))?;
        on_disk.copy_to(&in_memory, progress)?;
        on_disk.close()?;
        name_after(&in_memory, dir);
        in_memory.freeze()?;
        info!(
            dir = %dir.display(),
            images = in_memory.num_images(),
            "loaded dataset into memory"
        );
        Ok(in_memory)
    }
}

fn name_after(store: &Datastore, dir: &Path) {
    store.set_save_path(dir);
    if let Some(name) = dir.file_name() {
        store.set_name(name.to_string_lossy());
    }
}

fn is_multipage_file(name: &str) -> bool {
    name.ends_with(".ome.tif") || name.contains("_MMStack")
}

/// Work out how the dataset in `dir` was written
pub fn detect_save_mode(dir: &Path) -> Result<SaveMode> {
    if !dir.is_dir() {
        return Err(DataError::MalformedDataset(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if dir.join(JOURNAL_FILE_NAME).is_file() {
        return Ok(SaveMode::SinglePlaneTiffSeries);
    }
    let mut has_position_journal = false;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            if entry.path().join(JOURNAL_FILE_NAME).is_file() {
                has_position_journal = true;
            }
            continue;
        }
        if is_multipage_file(&name) {
            debug!(file = %name, "found multipage TIFF file");
            return Ok(SaveMode::MultipageTiff);
        }
    }
    if has_position_journal {
        Ok(SaveMode::SinglePlaneTiffSeries)
    } else {
        Err(DataError::MalformedDataset(format!(
            "no known dataset layout in {}",
            dir.display()
        )))
    }
}
