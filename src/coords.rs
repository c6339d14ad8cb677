//! Coordinates: immutable, axis-named multi-dimensional indices
//!
//! A [`Coords`] identifies one 2D image plane within a dataset. Axes are
//! named (`time`, `channel`, `z`, `position`, or anything user-defined that
//! matches the axis-name pattern) and carry non-negative indices. An axis that
//! is absent compares as index `-1`.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Time point axis
pub const TIME_POINT: &str = "time";
/// Channel axis
pub const CHANNEL: &str = "channel";
/// Z-slice axis
pub const Z_SLICE: &str = "z";
/// Stage position axis
pub const STAGE_POSITION: &str = "position";

/// Index reported for an axis a coordinate does not define
pub const MISSING_INDEX: i64 = -1;

/// Check an axis name against the pattern `[A-Za-z][A-Za-z0-9_]*`
pub fn is_valid_axis_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn validate_axis(axis: &str) -> Result<()> {
    if is_valid_axis_name(axis) {
        Ok(())
    } else {
        Err(DataError::InvalidAxis(axis.to_string()))
    }
}

fn checked_index(axis: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        if value < 0 {
            DataError::NegativeIndex {
                axis: axis.to_string(),
                index: value,
            }
        } else {
            DataError::InvalidAxis(format!("index {} for axis {} is too large", value, axis))
        }
    })
}

/// Immutable set of axis → index pairs
///
/// Equality, ordering and hashing do not depend on the order in which axes
/// were set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, u32>",
    into = "BTreeMap<String, u32>"
)]
pub struct Coords {
    indices: BTreeMap<String, u32>,
}

impl Coords {
    /// The empty coordinate
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a coordinate from scratch
    pub fn builder() -> CoordsBuilder {
        CoordsBuilder::default()
    }

    /// Start building a coordinate from this one
    pub fn copy_builder(&self) -> CoordsBuilder {
        CoordsBuilder {
            indices: self.indices.clone(),
            error: None,
        }
    }

    /// Index along `axis`, if the axis is present
    pub fn index(&self, axis: &str) -> Option<u32> {
        self.indices.get(axis).copied()
    }

    /// Index along `axis`, or [`MISSING_INDEX`] when absent
    pub fn index_or_missing(&self, axis: &str) -> i64 {
        self.index(axis).map_or(MISSING_INDEX, i64::from)
    }

    pub fn has_axis(&self, axis: &str) -> bool {
        self.indices.contains_key(axis)
    }

    /// Axis names in lexicographic order
    pub fn axes(&self) -> impl Iterator<Item = &str> + '_ {
        self.indices.keys().map(String::as_str)
    }

    /// (axis, index) pairs in lexicographic axis order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.indices.iter().map(|(axis, &index)| (axis.as_str(), index))
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn time(&self) -> Option<u32> {
        self.index(TIME_POINT)
    }

    pub fn channel(&self) -> Option<u32> {
        self.index(CHANNEL)
    }

    pub fn z(&self) -> Option<u32> {
        self.index(Z_SLICE)
    }

    pub fn stage_position(&self) -> Option<u32> {
        self.index(STAGE_POSITION)
    }

    /// Copy with `axis` set to `value`, or removed when `value` is negative
    pub fn with_index(&self, axis: &str, value: i64) -> Result<Coords> {
        self.copy_builder().index(axis, value).build()
    }

    /// Copy with `delta` added to the index along `axis`
    ///
    /// # Errors
    /// [`DataError::UnknownAxis`] if the axis is absent, and
    /// [`DataError::NegativeIndex`] if the result would drop below zero.
    pub fn offset(&self, axis: &str, delta: i64) -> Result<Coords> {
        self.copy_builder().offset(axis, delta).build()
    }

    /// True when `other` agrees with this coordinate on every axis this one
    /// defines. `other` may define additional axes.
    pub fn is_superspace_of(&self, other: &Coords) -> bool {
        self.indices
            .iter()
            .all(|(axis, &index)| other.index(axis) == Some(index))
    }

    /// True when this coordinate agrees with `other` on every axis `other`
    /// defines.
    pub fn is_subspace_of(&self, other: &Coords) -> bool {
        other.is_superspace_of(self)
    }

    /// Copy with the given axes dropped
    pub fn removing_axes<S: AsRef<str>>(&self, axes: &[S]) -> Coords {
        let mut indices = self.indices.clone();
        for axis in axes {
            indices.remove(axis.as_ref());
        }
        Coords { indices }
    }

    /// Copy keeping only the given axes
    pub fn retaining_axes<S: AsRef<str>>(&self, axes: &[S]) -> Coords {
        let indices = self
            .indices
            .iter()
            .filter(|(axis, _)| axes.iter().any(|keep| keep.as_ref() == axis.as_str()))
            .map(|(axis, &index)| (axis.clone(), index))
            .collect();
        Coords { indices }
    }

    /// Normalized `axis=index,` form, sorted by axis, with a trailing comma
    pub fn to_normalized_string(&self) -> String {
        self.iter()
            .map(|(axis, index)| format!("{}={},", axis, index))
            .collect()
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .iter()
            .map(|(axis, index)| format!("{}={}", axis, index))
            .collect();
        write!(f, "<{}>", pairs.join(","))
    }
}

impl FromStr for Coords {
    type Err = DataError;

    /// Parse `axis=index` pairs separated by commas. A trailing comma,
    /// surrounding whitespace and enclosing angle brackets are accepted.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('<').trim_end_matches('>');
        let mut builder = Coords::builder();
        for pair in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (axis, index) = pair.split_once('=').ok_or_else(|| {
                DataError::InvalidAxis(format!("expected axis=index, got {:?}", pair))
            })?;
            let index: i64 = index.trim().parse().map_err(|_| {
                DataError::InvalidAxis(format!("bad index in {:?}", pair))
            })?;
            let axis = axis.trim();
            checked_index(axis, index)?;
            builder = builder.index(axis, index);
        }
        builder.build()
    }
}

impl TryFrom<BTreeMap<String, u32>> for Coords {
    type Error = DataError;

    fn try_from(indices: BTreeMap<String, u32>) -> Result<Self> {
        for axis in indices.keys() {
            validate_axis(axis)?;
        }
        Ok(Coords { indices })
    }
}

impl From<Coords> for BTreeMap<String, u32> {
    fn from(coords: Coords) -> Self {
        coords.indices
    }
}

/// Builder for [`Coords`]
///
/// Setters never fail; the first invalid operation is remembered and
/// reported by [`CoordsBuilder::build`].
#[derive(Debug, Default)]
pub struct CoordsBuilder {
    indices: BTreeMap<String, u32>,
    error: Option<DataError>,
}

impl CoordsBuilder {
    fn fail(&mut self, err: DataError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Set `axis` to `value`; a negative value removes the axis
    pub fn index(mut self, axis: impl Into<String>, value: i64) -> Self {
        let axis = axis.into();
        if let Err(e) = validate_axis(&axis) {
            self.fail(e);
            return self;
        }
        if value < 0 {
            self.indices.remove(&axis);
            return self;
        }
        match checked_index(&axis, value) {
            Ok(index) => {
                self.indices.insert(axis, index);
            }
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn time(self, index: u32) -> Self {
        self.index(TIME_POINT, i64::from(index))
    }

    pub fn channel(self, index: u32) -> Self {
        self.index(CHANNEL, i64::from(index))
    }

    pub fn z(self, index: u32) -> Self {
        self.index(Z_SLICE, i64::from(index))
    }

    pub fn stage_position(self, index: u32) -> Self {
        self.index(STAGE_POSITION, i64::from(index))
    }

    pub fn remove_axis(mut self, axis: &str) -> Self {
        self.indices.remove(axis);
        self
    }

    /// Add `delta` to an existing axis
    pub fn offset(mut self, axis: &str, delta: i64) -> Self {
        let Some(&current) = self.indices.get(axis) else {
            self.fail(DataError::UnknownAxis(axis.to_string()));
            return self;
        };
        match checked_index(axis, i64::from(current) + delta) {
            Ok(index) => {
                self.indices.insert(axis.to_string(), index);
            }
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn build(self) -> Result<Coords> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Coords {
                indices: self.indices,
            }),
        }
    }
}
