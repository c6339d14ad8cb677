//! Named key-value sidecars attached to a dataset
//!
//! An annotation holds one dataset-wide record and any number of
//! per-coordinate records. It lives in `<name>.txt` next to the dataset as a
//! single JSON object:
//!
//! ```text
//! {
//!   "General annotation": { ... },
//!   "channel=0,time=3,": { ... }
//! }
//! ```
//!
//! Changes stay in memory until [`Annotation::save`] is called.

use crate::coords::Coords;
use crate::error::{DataError, Result};
use crate::events::{DataEvent, EventBus};
use crate::property_map::PropertyMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key of the dataset-wide record
pub const GENERAL_ANNOTATION_KEY: &str = "General annotation";

/// Conventional name for free-text comments
pub const COMMENTS_ANNOTATION: &str = "comments";

#[derive(Debug, Default)]
struct Records {
    general: PropertyMap,
    per_coords: HashMap<Coords, PropertyMap>,
}

pub struct Annotation {
    name: String,
    dir: RwLock<Option<PathBuf>>,
    records: RwLock<Records>,
    bus: Option<Arc<EventBus>>,
}

impl Annotation {
    /// Empty annotation; `dir` is where [`Annotation::save`] writes it
    pub fn new(name: impl Into<String>, dir: Option<PathBuf>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            name: name.into(),
            dir: RwLock::new(dir),
            records: RwLock::new(Records::default()),
            bus,
        }
    }

    /// File name for an annotation called `name`
    pub fn file_name(name: &str) -> String {
        if name.ends_with(".txt") {
            name.to_string()
        } else {
            format!("{}.txt", name)
        }
    }

    /// Whether an annotation called `name` was saved in `dir`
    pub fn exists(dir: &Path, name: &str) -> bool {
        dir.join(Self::file_name(name)).is_file()
    }

    /// Read the annotation `name` from `dir`
    ///
    /// Records whose key is not a coordinate are skipped with a warning.
    pub fn load(dir: &Path, name: &str, bus: Option<Arc<EventBus>>) -> Result<Self> {
        let path = dir.join(Self::file_name(name));
        let text = fs::read_to_string(&path)?;
        let entries: Map<String, Value> = serde_json::from_str(&text)?;

        let mut records = Records::default();
        for (key, value) in entries {
            let record: PropertyMap = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable annotation record");
                    continue;
                }
            };
            if key == GENERAL_ANNOTATION_KEY {
                records.general = record;
                continue;
            }
            match key.parse::<Coords>() {
                Ok(coords) => {
                    records.per_coords.insert(coords, record);
                }
                Err(err) => warn!(key = %key, error = %err, "skipping annotation with bad key"),
            }
        }
        debug!(path = %path.display(), records = records.per_coords.len(), "loaded annotation");

        Ok(Self {
            name: name.to_string(),
            dir: RwLock::new(Some(dir.to_path_buf())),
            records: RwLock::new(records),
            bus,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn general_annotation(&self) -> PropertyMap {
        self.records.read().general.clone()
    }

    pub fn set_general_annotation(&self, record: PropertyMap) {
        self.records.write().general = record;
        self.notify(None);
    }

    pub fn image_annotation(&self, coords: &Coords) -> Option<PropertyMap> {
        self.records.read().per_coords.get(coords).cloned()
    }

    /// Replace the record for `coords`; an empty record removes it
    pub fn set_image_annotation(&self, coords: &Coords, record: PropertyMap) {
        {
            let mut records = self.records.write();
            if record.is_empty() {
                records.per_coords.remove(coords);
            } else {
                records.per_coords.insert(coords.clone(), record);
            }
        }
        self.notify(Some(coords.clone()));
    }

    /// Coordinates carrying a record, sorted
    pub fn annotated_coords(&self) -> Vec<Coords> {
        let mut coords: Vec<Coords> = self.records.read().per_coords.keys().cloned().collect();
        coords.sort();
        coords
    }

    /// Write to the directory this annotation belongs to
    pub fn save(&self) -> Result<()> {
        let dir = self.dir.read().clone().ok_or_else(|| {
            DataError::Unsupported(format!(
                "annotation {} has no directory to save to",
                self.name
            ))
        })?;
        self.write_file(&dir)
    }

    /// Write into `dir`, which becomes this annotation's directory
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        self.write_file(dir)?;
        *self.dir.write() = Some(dir.to_path_buf());
        Ok(())
    }

    fn write_file(&self, dir: &Path) -> Result<()> {
        let mut entries = Map::new();
        {
            let records = self.records.read();
            entries.insert(
                GENERAL_ANNOTATION_KEY.to_string(),
                serde_json::to_value(&records.general)?,
            );
            let mut keyed: Vec<(&Coords, &PropertyMap)> = records.per_coords.iter().collect();
            keyed.sort_by(|a, b| a.0.cmp(b.0));
            for (coords, record) in keyed {
                entries.insert(coords.to_normalized_string(), serde_json::to_value(record)?);
            }
        }
        let path = dir.join(Self::file_name(&self.name));
        fs::write(&path, serde_json::to_string_pretty(&entries)?)?;
        debug!(path = %path.display(), "saved annotation");
        Ok(())
    }

    fn notify(&self, coords: Option<Coords>) {
        if let Some(bus) = &self.bus {
            bus.post(&DataEvent::AnnotationChanged {
                name: self.name.clone(),
                coords,
            });
        }
    }
}

impl std::fmt::Debug for Annotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotation")
            .field("name", &self.name)
            .field("dir", &*self.dir.read())
            .field("records", &self.records.read().per_coords.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_PRIORITY;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn note(text: &str) -> PropertyMap {
        let mut record = PropertyMap::new();
        record.put_string("note", text);
        record
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let annotation = Annotation::new(COMMENTS_ANNOTATION, None, None);
        let coords = Coords::builder().time(3).channel(0).build().unwrap();
        annotation.set_general_annotation(note("whole run"));
        annotation.set_image_annotation(&coords, note("bubble"));

        assert!(annotation.save().is_err());
        annotation.save_to(tmp.path()).unwrap();
        assert!(Annotation::exists(tmp.path(), "comments"));

        let json: Value =
            serde_json::from_str(&fs::read_to_string(tmp.path().join("comments.txt")).unwrap())
                .unwrap();
        assert!(json.get("channel=0,time=3,").is_some());
        assert!(json.get(GENERAL_ANNOTATION_KEY).is_some());

        let loaded = Annotation::load(tmp.path(), "comments", None).unwrap();
        assert_eq!(loaded.general_annotation().get_string("note"), Some("whole run"));
        assert_eq!(
            loaded.image_annotation(&coords).unwrap().get_string("note"),
            Some("bubble")
        );
        assert_eq!(loaded.annotated_coords(), vec![coords]);
    }

    #[test]
    fn test_empty_record_removes() {
        let annotation = Annotation::new("flags", None, None);
        let coords = Coords::builder().z(4).build().unwrap();
        annotation.set_image_annotation(&coords, note("x"));
        annotation.set_image_annotation(&coords, PropertyMap::new());
        assert!(annotation.image_annotation(&coords).is_none());
        assert!(annotation.annotated_coords().is_empty());
    }

    #[test]
    fn test_changes_are_published() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.register(
                move |event: &DataEvent| {
                    if let DataEvent::AnnotationChanged { name, coords } = event {
                        seen.lock().push((name.clone(), coords.clone()));
                    }
                },
                DEFAULT_PRIORITY,
            );
        }
        let annotation = Annotation::new("comments", None, Some(bus));
        let coords = Coords::builder().time(1).build().unwrap();
        annotation.set_general_annotation(note("a"));
        annotation.set_image_annotation(&coords, note("b"));
        assert_eq!(
            *seen.lock(),
            vec![
                ("comments".to_string(), None),
                ("comments".to_string(), Some(coords)),
            ]
        );
    }

    #[test]
    fn test_bad_keys_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("comments.txt"),
            r#"{"not a coordinate": {}, "time=2,": {"note": {"type": "STRING", "scalar": "ok"}}}"#,
        )
        .unwrap();
        let loaded = Annotation::load(tmp.path(), "comments", None).unwrap();
        let coords = Coords::builder().time(2).build().unwrap();
        assert_eq!(loaded.image_annotation(&coords).unwrap().get_string("note"), Some("ok"));
        assert_eq!(loaded.annotated_coords().len(), 1);
    }
}
