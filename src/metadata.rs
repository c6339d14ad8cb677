//! Per-image and per-dataset metadata records

use crate::coords::{Coords, CHANNEL, STAGE_POSITION, TIME_POINT, Z_SLICE};
use crate::error::Result;
use crate::property_map::PropertyMap;
use crate::types::{ImageFormat, PixelType};
use chrono::{DateTime, Local, TimeZone};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

/// Version tag written into new summary metadata
pub const METADATA_VERSION: &str = "11.0.0";

/// Timestamp format used for `ReceivedTime`
const RECEIVED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// Deserialize a JSON object, dropping top-level keys whose values do not
/// fit their field instead of failing the whole record
fn from_json_lenient<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let err = match serde_json::from_value(value.clone()) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };
    let Value::Object(fields) = value else {
        return Err(err.into());
    };
    // Fields are added one at a time so aliased duplicates are dropped too
    let mut usable = Map::new();
    for (key, field) in fields {
        usable.insert(key.clone(), field.clone());
        if serde_json::from_value::<T>(Value::Object(usable.clone())).is_err() {
            usable.remove(key);
            warn!(key = %key, "dropping unreadable metadata field");
        }
    }
    Ok(serde_json::from_value(Value::Object(usable))?)
}

/// Metadata attached to a single image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "UUID", default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,

    #[serde(rename = "Camera", default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,

    #[serde(rename = "Binning", default, skip_serializing_if = "Option::is_none")]
    pub binning: Option<u32>,

    #[serde(rename = "BitDepth", default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u32>,

    #[serde(
        rename = "Exposure-ms",
        alias = "ExposureMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exposure_ms: Option<f64>,

    #[serde(rename = "ElapsedTime-ms", default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time_ms: Option<f64>,

    /// Wall-clock time at which the image was received
    #[serde(rename = "ReceivedTime", default, skip_serializing_if = "Option::is_none")]
    pub received_time: Option<String>,

    #[serde(rename = "ImageNumber", default, skip_serializing_if = "Option::is_none")]
    pub image_number: Option<i64>,

    #[serde(
        rename = "PixelSizeUm",
        alias = "PixelSize_um",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pixel_size_um: Option<f64>,

    #[serde(rename = "PixelAspect", default, skip_serializing_if = "Option::is_none")]
    pub pixel_aspect: Option<f64>,

    /// User-assigned name of the stage position the image was acquired at
    #[serde(rename = "PositionName", default, skip_serializing_if = "Option::is_none")]
    pub position_name: Option<String>,

    #[serde(rename = "XPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub x_position_um: Option<f64>,

    #[serde(rename = "YPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub y_position_um: Option<f64>,

    #[serde(rename = "ZPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub z_position_um: Option<f64>,

    /// File the image was saved to, relative to the dataset directory
    #[serde(rename = "FileName", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(rename = "ScopeData", default, skip_serializing_if = "PropertyMap::is_empty")]
    pub scope_data: PropertyMap,

    #[serde(rename = "UserData", default, skip_serializing_if = "PropertyMap::is_empty")]
    pub user_data: PropertyMap,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Copy with a freshly generated UUID
    pub fn with_new_uuid(self) -> Self {
        self.with_uuid(Uuid::new_v4())
    }

    pub fn with_camera(mut self, camera: impl Into<String>) -> Self {
        self.camera = Some(camera.into());
        self
    }

    pub fn with_exposure_ms(mut self, exposure_ms: f64) -> Self {
        self.exposure_ms = Some(exposure_ms);
        self
    }

    pub fn with_elapsed_time_ms(mut self, elapsed_ms: f64) -> Self {
        self.elapsed_time_ms = Some(elapsed_ms);
        self
    }

    pub fn with_received_time<Tz: TimeZone>(mut self, time: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        self.received_time = Some(time.format(RECEIVED_TIME_FORMAT).to_string());
        self
    }

    /// Copy stamped with the current local time as received time
    pub fn received_now(self) -> Self {
        self.with_received_time(&Local::now())
    }

    pub fn with_pixel_size_um(mut self, pixel_size_um: f64) -> Self {
        self.pixel_size_um = Some(pixel_size_um);
        self
    }

    pub fn with_position_name(mut self, name: impl Into<String>) -> Self {
        self.position_name = Some(name.into());
        self
    }

    pub fn with_stage_xy(mut self, x_um: f64, y_um: f64) -> Self {
        self.x_position_um = Some(x_um);
        self.y_position_um = Some(y_um);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_user_data(mut self, user_data: PropertyMap) -> Self {
        self.user_data = user_data;
        self
    }

    /// Position name, treating empty and `"null"` as absent
    pub fn position_name(&self) -> Option<&str> {
        self.position_name
            .as_deref()
            .filter(|name| !name.is_empty() && *name != "null")
    }

    /// Date part of the received time
    pub fn received_date(&self) -> Option<&str> {
        self.received_time
            .as_deref()
            .and_then(|t| t.split(' ').next())
            .filter(|d| !d.is_empty())
    }

    /// Parse metadata from a JSON object; unknown keys are ignored and
    /// malformed fields dropped
    pub fn from_json(value: &Value) -> Result<Self> {
        from_json_lenient(value)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A stage position from the acquisition's position list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    #[serde(rename = "Label", default)]
    pub label: String,
    #[serde(rename = "XPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub x_um: Option<f64>,
    #[serde(rename = "YPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub y_um: Option<f64>,
    #[serde(rename = "ZPositionUm", default, skip_serializing_if = "Option::is_none")]
    pub z_um: Option<f64>,
    #[serde(rename = "GridRow", default, skip_serializing_if = "Option::is_none")]
    pub grid_row: Option<u32>,
    #[serde(rename = "GridCol", default, skip_serializing_if = "Option::is_none")]
    pub grid_column: Option<u32>,
}

impl StagePosition {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_xy(mut self, x_um: f64, y_um: f64) -> Self {
        self.x_um = Some(x_um);
        self.y_um = Some(y_um);
        self
    }
}

/// Dataset-wide descriptive metadata, set once per datastore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    #[serde(rename = "Prefix", default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(rename = "UserName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    #[serde(rename = "ProfileName", default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,

    #[serde(rename = "MetadataVersion", default, skip_serializing_if = "Option::is_none")]
    pub metadata_version: Option<String>,

    #[serde(rename = "ComputerName", default, skip_serializing_if = "Option::is_none")]
    pub computer_name: Option<String>,

    #[serde(rename = "Directory", default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    #[serde(rename = "ChannelGroup", default, skip_serializing_if = "Option::is_none")]
    pub channel_group: Option<String>,

    #[serde(rename = "ChNames", default, skip_serializing_if = "Vec::is_empty")]
    pub channel_names: Vec<String>,

    #[serde(rename = "z-step_um", default, skip_serializing_if = "Option::is_none")]
    pub z_step_um: Option<f64>,

    #[serde(
        rename = "Interval_ms",
        alias = "WaitInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub wait_interval_ms: Option<f64>,

    #[serde(rename = "CustomIntervals_ms", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_intervals_ms: Vec<f64>,

    /// Preferred axis order, outermost first
    #[serde(rename = "AxisOrder", default, skip_serializing_if = "Vec::is_empty")]
    pub axis_order: Vec<String>,

    /// Expected length of each axis
    #[serde(rename = "IntendedDimensions", default, skip_serializing_if = "Option::is_none")]
    pub intended_dimensions: Option<Coords>,

    #[serde(
        rename = "StartTime",
        alias = "Time",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub start_date: Option<String>,

    #[serde(
        rename = "StagePositions",
        alias = "InitialPositionList",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stage_positions: Vec<StagePosition>,

    #[serde(rename = "Width", default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(rename = "Height", default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(rename = "PixelType", default, skip_serializing_if = "Option::is_none")]
    pub pixel_type: Option<PixelType>,

    #[serde(rename = "UserData", default, skip_serializing_if = "PropertyMap::is_empty")]
    pub user_data: PropertyMap,
}

/// Axis lengths as older journals record them
#[derive(Debug, Default, Deserialize)]
struct LegacyDimensions {
    #[serde(rename = "Frames", default)]
    frames: Option<u32>,
    #[serde(rename = "Slices", default)]
    slices: Option<u32>,
    #[serde(rename = "Channels", default)]
    channels: Option<u32>,
    #[serde(rename = "Positions", default)]
    positions: Option<u32>,
}

impl LegacyDimensions {
    fn to_coords(&self) -> Option<Coords> {
        let mut builder = Coords::builder();
        let mut any = false;
        for (axis, length) in [
            (TIME_POINT, self.frames),
            (Z_SLICE, self.slices),
            (CHANNEL, self.channels),
            (STAGE_POSITION, self.positions),
        ] {
            if let Some(length) = length {
                builder = builder.index(axis, i64::from(length));
                any = true;
            }
        }
        if any {
            builder.build().ok()
        } else {
            None
        }
    }
}

impl SummaryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary metadata stamped with the current metadata version
    pub fn standard() -> Self {
        Self {
            metadata_version: Some(METADATA_VERSION.to_string()),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_channel_group(mut self, group: impl Into<String>) -> Self {
        self.channel_group = Some(group.into());
        self
    }

    pub fn with_channel_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.channel_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_z_step_um(mut self, z_step_um: f64) -> Self {
        self.z_step_um = Some(z_step_um);
        self
    }

    pub fn with_wait_interval_ms(mut self, interval_ms: f64) -> Self {
        self.wait_interval_ms = Some(interval_ms);
        self
    }

    pub fn with_axis_order<S: Into<String>>(mut self, axes: impl IntoIterator<Item = S>) -> Self {
        self.axis_order = axes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intended_dimensions(mut self, dims: Coords) -> Self {
        self.intended_dimensions = Some(dims);
        self
    }

    pub fn with_start_date(mut self, date: impl Into<String>) -> Self {
        self.start_date = Some(date.into());
        self
    }

    pub fn with_stage_positions(mut self, positions: Vec<StagePosition>) -> Self {
        self.stage_positions = positions;
        self
    }

    pub fn with_image_format(mut self, format: ImageFormat) -> Self {
        self.width = Some(format.width);
        self.height = Some(format.height);
        self.pixel_type = Some(format.pixel_type);
        self
    }

    pub fn with_user_data(mut self, user_data: PropertyMap) -> Self {
        self.user_data = user_data;
        self
    }

    /// Declared plane format, if width, height and pixel type are all set
    pub fn image_format(&self) -> Option<ImageFormat> {
        Some(ImageFormat::new(self.width?, self.height?, self.pixel_type?))
    }

    /// Name of a channel, or a generated placeholder when unnamed
    pub fn safe_channel_name(&self, index: usize) -> String {
        self.channel_names
            .get(index)
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("channel {}", index))
    }

    /// Intended length along `axis`
    pub fn intended_length(&self, axis: &str) -> Option<u32> {
        self.intended_dimensions.as_ref()?.index(axis)
    }

    /// Parse summary metadata from its JSON form, folding legacy
    /// `Frames`/`Slices`/`Channels`/`Positions` keys into intended dimensions.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut summary: SummaryMetadata = from_json_lenient(value)?;
        if summary.intended_dimensions.is_none() {
            let legacy: LegacyDimensions =
                serde_json::from_value(value.clone()).unwrap_or_default();
            summary.intended_dimensions = legacy.to_coords();
        }
        Ok(summary)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
