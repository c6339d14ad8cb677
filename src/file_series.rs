//! Single-plane TIFF series backend
//!
//! Every image plane is one TIFF file. Datasets with stage positions keep
//! one subdirectory per named position; each position directory holds a
//! `metadata.txt` journal, a JSON object appended to one entry at a time:
//!
//! ```text
//! {
//! "Summary": { ... },
//! "Coords-img_channel000_time000000000_z000.tif": {"channel": 0, "time": 0, "z": 0},
//! "Metadata-img_channel000_time000000000_z000.tif": { ... }
//! }
//! ```
//!
//! The closing brace is only written on freeze, so a journal from an
//! interrupted acquisition is repaired when it is read back. Journals from
//! older releases key each plane as `FrameKey-<time>-<channel>-<z>` and name
//! files after the channel rather than its index; those are reconciled on
//! load by sorting the channel names found in the file names.

use crate::coords::{Coords, CHANNEL, STAGE_POSITION, TIME_POINT, Z_SLICE};
use crate::error::{DataError, Result};
use crate::events::DataEvent;
use crate::image::Image;
use crate::metadata::{Metadata, SummaryMetadata};
use crate::storage::{DatasetBounds, SaveMode, Storage};
use crate::tiff;
use crate::types::ImageFormat;
use crate::utils::{legacy_file_name, parse_legacy_file_name, plane_file_name};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Name of the per-position journal
pub const JOURNAL_FILE_NAME: &str = "metadata.txt";

/// Axes this layout can encode in file names
pub const ALLOWED_AXES: [&str; 4] = [TIME_POINT, CHANNEL, Z_SLICE, STAGE_POSITION];

const SUMMARY_KEY: &str = "Summary";
const COORDS_PREFIX: &str = "Coords-";
const METADATA_PREFIX: &str = "Metadata-";
const FRAME_KEY_PREFIX: &str = "FrameKey-";

/// JSON stored in each plane's ImageDescription and in its `Metadata-` entry
#[derive(Serialize)]
struct PlaneDescription<'a> {
    #[serde(flatten)]
    format: ImageFormat,
    #[serde(rename = "completeCoords")]
    coords: &'a Coords,
    #[serde(flatten)]
    metadata: &'a Metadata,
}

/// Appends entries to one position's journal
struct JournalWriter {
    out: BufWriter<File>,
    first_entry: bool,
}

impl JournalWriter {
    fn create(path: &Path) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(b"{\n")?;
        Ok(Self {
            out,
            first_entry: true,
        })
    }

    fn append(&mut self, key: &str, value: &Value) -> Result<()> {
        if !self.first_entry {
            self.out.write_all(b",\n")?;
        }
        write!(
            self.out,
            "{}: {}",
            serde_json::to_string(key)?,
            serde_json::to_string_pretty(value)?
        )?;
        self.out.flush()?;
        self.first_entry = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.write_all(b"\n}\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct Journals {
    writers: BTreeMap<u32, JournalWriter>,
    position_names: HashMap<u32, String>,
}

#[derive(Debug, Default)]
struct SeriesIndex {
    /// Plane file of every stored coordinate, relative to the dataset root
    files: HashMap<Coords, String>,
    bounds: DatasetBounds,
    summary: SummaryMetadata,
}

/// Storage writing one TIFF file per plane
///
/// A single producer thread is expected to insert; any number of threads may
/// read planes already written. Planes are never rewritten, so no file
/// locking is performed.
pub struct SinglePlaneTiffSeries {
    dir: PathBuf,
    index: RwLock<SeriesIndex>,
    journals: Mutex<Journals>,
    writable: AtomicBool,
    closed: AtomicBool,
}

impl SinglePlaneTiffSeries {
    /// Start a new dataset at `dir`, which must not exist yet
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            return Err(DataError::AlreadyExists(format!(
                "directory {} already exists",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "created single-plane TIFF dataset");
        Ok(Self {
            dir,
            index: RwLock::new(SeriesIndex::default()),
            journals: Mutex::new(Journals::default()),
            writable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// Load an existing dataset read-only
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let index = DatasetLoader::new(&dir).load()?;
        info!(
            dir = %dir.display(),
            images = index.files.len(),
            "opened single-plane TIFF dataset"
        );
        Ok(Self {
            dir,
            index: RwLock::new(index),
            journals: Mutex::new(Journals::default()),
            writable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Dataset root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DataError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_plane(&self, coords: &Coords, relative: &str) -> Result<Image> {
        let path = self.dir.join(relative);
        let plane = tiff::read_file(&path)?;
        let metadata = plane
            .description
            .as_deref()
            .and_then(|text| serde_json::from_str::<Value>(text).ok())
            .and_then(|json| Metadata::from_json(&json).ok())
            .unwrap_or_else(|| {
                warn!(path = %path.display(), "no readable metadata in plane file");
                Metadata::default()
            });
        Image::new(
            plane.pixels,
            plane.format.width,
            plane.format.height,
            plane.format.pixel_type,
            coords.clone(),
            metadata,
        )
    }

    fn read_all(&self, wanted: Vec<(Coords, String)>) -> Result<Vec<Image>> {
        wanted
            .iter()
            .map(|(coords, relative)| self.read_plane(coords, relative))
            .collect()
    }

    fn select<F: Fn(&Coords) -> bool>(&self, keep: F) -> Vec<(Coords, String)> {
        self.index
            .read()
            .files
            .iter()
            .filter(|(coords, _)| keep(coords))
            .map(|(coords, file)| (coords.clone(), file.clone()))
            .collect()
    }

    /// Summary journal entry for the first image of a position
    fn summary_entry(summary: &SummaryMetadata, image: &Image) -> Result<Value> {
        let mut summary = summary.clone();
        if summary.start_date.is_none() {
            summary.start_date = image.metadata().received_date().map(str::to_string);
        }
        if summary.image_format().is_none() {
            summary = summary.with_image_format(image.format());
        }
        let mut json = summary.to_json()?;
        if let Value::Object(fields) = &mut json {
            fields.insert(
                "IJType".to_string(),
                Value::from(image.pixel_type().imagej_type()),
            );
        }
        Ok(json)
    }

    fn write_plane(&self, journals: &mut Journals, image: &Image, summary: &SummaryMetadata) -> Result<String> {
        let coords = image.coords();
        let position = coords.stage_position();
        let position_name = match position {
            Some(_) => image.metadata().position_name().unwrap_or(""),
            None => "",
        };
        let journal_key = position.unwrap_or(0);

        if let Some(known) = journals.position_names.get(&journal_key) {
            if known != position_name {
                return Err(DataError::InvalidMetadata(format!(
                    "position {} was named {:?}, now {:?}",
                    journal_key, known, position_name
                )));
            }
        }

        let position_dir = self.dir.join(position_name);
        if !journals.writers.contains_key(&journal_key) {
            fs::create_dir_all(&position_dir)?;
            let mut writer = JournalWriter::create(&position_dir.join(JOURNAL_FILE_NAME))?;
            writer.append(SUMMARY_KEY, &Self::summary_entry(summary, image)?)?;
            journals.writers.insert(journal_key, writer);
            journals
                .position_names
                .insert(journal_key, position_name.to_string());
            debug!(position = journal_key, name = position_name, "opened journal");
        }

        let file_name = plane_file_name(coords);
        let relative = if position_name.is_empty() {
            file_name
        } else {
            format!("{}/{}", position_name, file_name)
        };
        let metadata = image.metadata().clone().with_file_name(relative.clone());
        let description = serde_json::to_value(PlaneDescription {
            format: image.format(),
            coords,
            metadata: &metadata,
        })?;
        tiff::write_file(
            &self.dir.join(&relative),
            image.format(),
            image.pixels(),
            Some(&serde_json::to_string_pretty(&description)?),
        )?;

        let writer = journals
            .writers
            .get_mut(&journal_key)
            .ok_or_else(|| DataError::Io(std::io::Error::other("journal writer missing")))?;
        writer.append(
            &format!("{}{}", COORDS_PREFIX, relative),
            &serde_json::to_value(coords)?,
        )?;
        writer.append(&format!("{}{}", METADATA_PREFIX, relative), &description)?;
        Ok(relative)
    }

    fn finish_journals(&self) -> Result<()> {
        let mut journals = self.journals.lock();
        // A writer leaves the map only once its journal is closed
        while let Some(mut entry) = journals.writers.first_entry() {
            entry.get_mut().finish()?;
            let (position, _) = entry.remove_entry();
            debug!(position, "closed journal");
        }
        Ok(())
    }
}

impl Storage for SinglePlaneTiffSeries {
    fn put_image(&self, image: &Image) -> Result<()> {
        self.ensure_open()?;
        if !self.is_writable() {
            return Err(DataError::Frozen);
        }
        let coords = image.coords();
        if let Some(axis) = coords.axes().find(|axis| !ALLOWED_AXES.contains(axis)) {
            return Err(DataError::UnsupportedAxis(format!(
                "{} (single-plane TIFF series only stores {:?})",
                axis, ALLOWED_AXES
            )));
        }
        if coords.stage_position().unwrap_or(0) > 0 && image.metadata().position_name().is_none() {
            return Err(DataError::InvalidMetadata(format!(
                "image at {} has no position name",
                coords
            )));
        }

        let summary = {
            let index = self.index.read();
            index.bounds.check_format(image, &index.summary)?;
            if index.files.contains_key(coords) {
                return Err(DataError::DuplicateCoordinate(coords.clone()));
            }
            index.summary.clone()
        };

        let mut journals = self.journals.lock();
        let relative = self.write_plane(&mut journals, image, &summary)?;
        let mut index = self.index.write();
        index.files.insert(coords.clone(), relative);
        index.bounds.record(coords, image.format());
        Ok(())
    }

    fn get_image(&self, coords: &Coords) -> Result<Option<Image>> {
        self.ensure_open()?;
        let relative = self.index.read().files.get(coords).cloned();
        match relative {
            Some(relative) => self.read_plane(coords, &relative).map(Some),
            None => Ok(None),
        }
    }

    fn get_any_image(&self) -> Result<Option<Image>> {
        self.ensure_open()?;
        let first = self
            .index
            .read()
            .files
            .iter()
            .next()
            .map(|(coords, file)| (coords.clone(), file.clone()));
        match first {
            Some((coords, relative)) => self.read_plane(&coords, &relative).map(Some),
            None => Ok(None),
        }
    }

    fn get_images_matching(&self, coords: &Coords) -> Result<Vec<Image>> {
        self.ensure_open()?;
        self.read_all(self.select(|stored| coords.is_superspace_of(stored)))
    }

    fn get_images_ignoring_axes(&self, coords: &Coords, ignored: &[&str]) -> Result<Vec<Image>> {
        self.ensure_open()?;
        self.read_all(self.select(|stored| stored.removing_axes(ignored) == *coords))
    }

    fn has_image(&self, coords: &Coords) -> bool {
        self.index.read().files.contains_key(coords)
    }

    fn unordered_coords(&self) -> Vec<Coords> {
        self.index.read().files.keys().cloned().collect()
    }

    fn num_images(&self) -> usize {
        self.index.read().files.len()
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

    /// Terminates every journal; a no-op on read-only datasets
    fn freeze(&self) -> Result<()> {
        if self.writable.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.finish_journals() {
                self.writable.store(true, Ordering::Release);
                return Err(err);
            }
            info!(dir = %self.dir.display(), "single-plane TIFF dataset frozen");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writable.store(false, Ordering::Release);
        // Unfrozen journals are left open-ended; loading repairs them.
        let mut journals = self.journals.lock();
        for writer in journals.writers.values_mut() {
            writer.out.flush()?;
        }
        *journals = Journals::default();
        *self.index.write() = SeriesIndex::default();
        debug!(dir = %self.dir.display(), "single-plane TIFF dataset closed");
        Ok(())
    }

    fn handle_event(&self, event: &DataEvent) {
        if let DataEvent::NewSummaryMetadata(summary) = event {
            if self.is_writable() {
                self.index.write().summary = summary.clone();
            }
        }
    }

    fn save_mode(&self) -> SaveMode {
        SaveMode::SinglePlaneTiffSeries
    }
}

impl std::fmt::Debug for SinglePlaneTiffSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinglePlaneTiffSeries")
            .field("dir", &self.dir)
            .field("images", &self.num_images())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Read a journal, repairing a missing closing brace
pub(crate) fn read_journal(path: &Path) -> Option<Map<String, Value>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to read journal");
            return None;
        }
    };
    let parsed = serde_json::from_str::<Value>(&text)
        .or_else(|_| serde_json::from_str::<Value>(&format!("{}\n}}", text.trim_end())));
    match parsed {
        Ok(Value::Object(entries)) => Some(entries),
        Ok(_) => {
            warn!(path = %path.display(), "journal is not a JSON object");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to parse journal");
            None
        }
    }
}

fn index_field(entry: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_u64))
        .and_then(|index| u32::try_from(index).ok())
}

/// Coordinate recorded in a journal entry
///
/// Accepts the plain `{axis: index}` map, a `completeCoords` map, and the
/// older per-axis index keys.
pub(crate) fn coords_from_entry(value: &Value) -> Option<Coords> {
    let entry = value.as_object()?;
    if let Some(complete) = entry.get("completeCoords") {
        return serde_json::from_value(complete.clone()).ok();
    }
    let legacy = [
        (TIME_POINT, &["FrameIndex", "Frame"][..]),
        (Z_SLICE, &["SliceIndex", "Slice"][..]),
        (CHANNEL, &["ChannelIndex"][..]),
        (STAGE_POSITION, &["PositionIndex"][..]),
    ];
    if legacy
        .iter()
        .any(|(_, keys)| keys.iter().any(|key| entry.contains_key(*key)))
    {
        let mut builder = Coords::builder();
        for (axis, keys) in legacy {
            if let Some(index) = index_field(entry, keys) {
                builder = builder.index(axis, i64::from(index));
            }
        }
        return builder.build().ok();
    }
    serde_json::from_value(value.clone()).ok()
}

/// Rebuilds the index of an existing dataset
struct DatasetLoader<'a> {
    dir: &'a Path,
    index: SeriesIndex,
    multi_position: bool,
    /// Channel names recovered from older file names, sorted
    legacy_channels: Vec<String>,
}

impl<'a> DatasetLoader<'a> {
    fn new(dir: &'a Path) -> Self {
        Self {
            dir,
            index: SeriesIndex::default(),
            multi_position: false,
            legacy_channels: Vec::new(),
        }
    }

    fn positions(&mut self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Err(DataError::MalformedDataset(format!(
                "no dataset directory at {}",
                self.dir.display()
            )));
        }
        if self.dir.join(JOURNAL_FILE_NAME).is_file() {
            return Ok(vec![String::new()]);
        }
        self.multi_position = true;
        let mut positions = Vec::new();
        for entry in fs::read_dir(self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                positions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        positions.sort();
        if positions.is_empty() {
            return Err(DataError::MalformedDataset(format!(
                "no journal or position directories in {}",
                self.dir.display()
            )));
        }
        Ok(positions)
    }

    fn load(mut self) -> Result<SeriesIndex> {
        let mut journals_read = 0;
        for position in self.positions()? {
            let path = self.dir.join(&position).join(JOURNAL_FILE_NAME);
            if !path.is_file() {
                warn!(position = %position, "position directory has no journal");
                continue;
            }
            let Some(entries) = read_journal(&path) else {
                continue;
            };
            journals_read += 1;
            self.load_position(&position, &entries);
        }
        if journals_read == 0 {
            return Err(DataError::MalformedDataset(format!(
                "no readable journal in {}",
                self.dir.display()
            )));
        }
        if self.index.summary.channel_names.is_empty() && !self.legacy_channels.is_empty() {
            self.index.summary.channel_names = self.legacy_channels.clone();
        }
        Ok(self.index)
    }

    /// Later summaries replace earlier ones, so the last frame's wins
    fn adopt_summary(&mut self, value: &Value) {
        match SummaryMetadata::from_json(value) {
            Ok(summary) => self.index.summary = summary,
            Err(err) => warn!(error = %err, "unreadable summary metadata"),
        }
    }

    fn load_position(&mut self, position: &str, entries: &Map<String, Value>) {
        if let Some(summary) = entries.get(SUMMARY_KEY) {
            self.adopt_summary(summary);
        }
        for (key, value) in entries {
            let located = if let Some(path) = key.strip_prefix(COORDS_PREFIX) {
                let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
                coords_from_entry(value).map(|coords| (coords, file_name))
            } else if let Some(frame) = key.strip_prefix(FRAME_KEY_PREFIX) {
                self.legacy_plane(position, frame, value)
            } else {
                if key != SUMMARY_KEY && !key.starts_with(METADATA_PREFIX) {
                    warn!(key = %key, position = %position, "skipping unknown journal entry");
                }
                continue;
            };
            match located {
                Some((coords, file_name)) => self.register(position, key, coords, file_name),
                None => warn!(key = %key, position = %position, "skipping malformed journal entry"),
            }
        }
    }

    /// Coordinate and file name of a `FrameKey-<time>-<channel>-<z>` entry
    fn legacy_plane(&mut self, position: &str, frame: &str, value: &Value) -> Option<(Coords, String)> {
        let mut parts = frame.split('-').map(str::parse::<u32>);
        let (time, channel, z) = match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(t)), Some(Ok(c)), Some(Ok(z))) => (t, c, z),
            _ => return None,
        };
        let entry = value.as_object()?;
        if let Some(summary) = entry.get(SUMMARY_KEY) {
            self.adopt_summary(summary);
        }
        let mut builder = Coords::builder().time(time).channel(channel).z(z);
        if let Some(stage_position) = index_field(entry, &["PositionIndex"]) {
            builder = builder.stage_position(stage_position);
        }
        let coords = builder.build().ok()?;

        self.discover_channels(position);
        let channel_name = match self.legacy_channels.get(channel as usize) {
            Some(name) => name.clone(),
            None => {
                warn!(
                    channel,
                    known = ?self.legacy_channels,
                    "channel index outside discovered channel names"
                );
                String::new()
            }
        };
        Some((coords, legacy_file_name(time, &channel_name, z)))
    }

    fn discover_channels(&mut self, position: &str) {
        if !self.legacy_channels.is_empty() {
            return;
        }
        let dir = if self.multi_position {
            self.dir.join(position)
        } else {
            self.dir.to_path_buf()
        };
        let Ok(listing) = fs::read_dir(&dir) else {
            warn!(dir = %dir.display(), "unable to list plane files");
            return;
        };
        let names: BTreeSet<String> = listing
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_legacy_file_name(&entry.file_name().to_string_lossy()))
            .map(|(_, channel, _)| channel)
            .collect();
        self.legacy_channels = names.into_iter().collect();
        debug!(channels = ?self.legacy_channels, "recovered channel names from file names");
    }

    fn register(&mut self, position: &str, key: &str, coords: Coords, file_name: String) {
        let mut relative = file_name;
        if !position.is_empty() && !self.dir.join(&relative).is_file() {
            relative = format!("{}/{}", position, relative);
        }
        let path = self.dir.join(&relative);
        if !path.is_file() {
            warn!(key = %key, file = %relative, "plane file does not exist");
            return;
        }
        let plane = match tiff::read_file(&path) {
            Ok(plane) => plane,
            Err(err) => {
                warn!(file = %relative, error = %err, "unreadable plane file");
                return;
            }
        };
        if let Some(expected) = self.index.bounds.format() {
            if let Err(err) = expected.ensure_matches(&plane.format) {
                warn!(file = %relative, error = %err, "plane does not match dataset format");
                return;
            }
        }
        self.index.bounds.record(&coords, plane.format);
        self.index.files.entry(coords).or_insert(relative);
    }
}
