//! Typed key-value records
//!
//! [`PropertyMap`] is the free-form record used for user data, scope data and
//! annotations. In JSON every value carries an explicit type tag:
//!
//! ```json
//! { "Operator": { "type": "STRING", "scalar": "jdoe" },
//!   "Gains":    { "type": "DOUBLE", "array": [1.0, 2.5] } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaggedValue", into = "TaggedValue")]
pub enum PropertyValue {
    String(String),
    Integer(i32),
    Long(i64),
    Double(f64),
    Boolean(bool),
    StringList(Vec<String>),
    IntegerList(Vec<i32>),
    LongList(Vec<i64>),
    DoubleList(Vec<f64>),
    BooleanList(Vec<bool>),
    Map(PropertyMap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ValueKind {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    PropertyMap,
}

/// On-disk form of a [`PropertyValue`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaggedValue {
    #[serde(rename = "type")]
    kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scalar: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    array: Option<Value>,
}

impl TaggedValue {
    fn scalar(kind: ValueKind, value: Value) -> Self {
        Self {
            kind,
            scalar: Some(value),
            array: None,
        }
    }

    fn array(kind: ValueKind, value: Value) -> Self {
        Self {
            kind,
            scalar: None,
            array: Some(value),
        }
    }
}

impl From<PropertyValue> for TaggedValue {
    fn from(value: PropertyValue) -> Self {
        use PropertyValue as P;
        use ValueKind as K;
        match value {
            P::String(v) => TaggedValue::scalar(K::String, Value::from(v)),
            P::Integer(v) => TaggedValue::scalar(K::Integer, Value::from(v)),
            P::Long(v) => TaggedValue::scalar(K::Long, Value::from(v)),
            P::Double(v) => TaggedValue::scalar(K::Double, Value::from(v)),
            P::Boolean(v) => TaggedValue::scalar(K::Boolean, Value::from(v)),
            P::StringList(v) => TaggedValue::array(K::String, Value::from(v)),
            P::IntegerList(v) => TaggedValue::array(K::Integer, Value::from(v)),
            P::LongList(v) => TaggedValue::array(K::Long, Value::from(v)),
            P::DoubleList(v) => TaggedValue::array(K::Double, Value::from(v)),
            P::BooleanList(v) => TaggedValue::array(K::Boolean, Value::from(v)),
            P::Map(v) => TaggedValue::scalar(
                K::PropertyMap,
                serde_json::to_value(v).unwrap_or(Value::Null),
            ),
        }
    }
}

impl TryFrom<TaggedValue> for PropertyValue {
    type Error = String;

    fn try_from(tagged: TaggedValue) -> std::result::Result<Self, String> {
        use PropertyValue as P;
        use ValueKind as K;

        fn decode<T: serde::de::DeserializeOwned>(value: Value) -> std::result::Result<T, String> {
            serde_json::from_value(value).map_err(|e| e.to_string())
        }

        match (tagged.kind, tagged.scalar, tagged.array) {
            (K::String, Some(v), None) => decode(v).map(P::String),
            (K::Integer, Some(v), None) => decode(v).map(P::Integer),
            (K::Long, Some(v), None) => decode(v).map(P::Long),
            (K::Double, Some(v), None) => decode(v).map(P::Double),
            (K::Boolean, Some(v), None) => decode(v).map(P::Boolean),
            (K::PropertyMap, Some(v), None) => decode(v).map(P::Map),
            (K::String, None, Some(v)) => decode(v).map(P::StringList),
            (K::Integer, None, Some(v)) => decode(v).map(P::IntegerList),
            (K::Long, None, Some(v)) => decode(v).map(P::LongList),
            (K::Double, None, Some(v)) => decode(v).map(P::DoubleList),
            (K::Boolean, None, Some(v)) => decode(v).map(P::BooleanList),
            (kind, scalar, array) => Err(format!(
                "property of type {:?} needs exactly one of scalar/array (scalar: {}, array: {})",
                kind,
                scalar.is_some(),
                array.is_some()
            )),
        }
    }
}

/// Ordered map of typed properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap {
    entries: BTreeMap<String, PropertyValue>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    /// Copy with `key` set to `value`
    pub fn with(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, PropertyValue::String(value.into()));
    }

    pub fn put_integer(&mut self, key: impl Into<String>, value: i32) {
        self.insert(key, PropertyValue::Integer(value));
    }

    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.insert(key, PropertyValue::Long(value));
    }

    pub fn put_double(&mut self, key: impl Into<String>, value: f64) {
        self.insert(key, PropertyValue::Double(value));
    }

    pub fn put_boolean(&mut self, key: impl Into<String>, value: bool) {
        self.insert(key, PropertyValue::Boolean(value));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_integer(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            PropertyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Long value; integers widen
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            PropertyValue::Long(v) => Some(*v),
            PropertyValue::Integer(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            PropertyValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Option<&[String]> {
        match self.get(key)? {
            PropertyValue::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_property_map(&self, key: &str) -> Option<&PropertyMap> {
        match self.get(key)? {
            PropertyValue::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Copy every entry of `other` into this map, replacing existing keys
    pub fn merge(&mut self, other: &PropertyMap) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut pmap = PropertyMap::new();
        pmap.put_string("name", "cell-7");
        pmap.put_integer("count", 3);
        pmap.put_double("gain", 1.5);
        pmap.put_boolean("ok", true);

        assert_eq!(pmap.get_string("name"), Some("cell-7"));
        assert_eq!(pmap.get_integer("count"), Some(3));
        assert_eq!(pmap.get_long("count"), Some(3));
        assert_eq!(pmap.get_double("gain"), Some(1.5));
        assert_eq!(pmap.get_boolean("ok"), Some(true));
        assert_eq!(pmap.get_integer("name"), None);
        assert_eq!(pmap.get_string("missing"), None);
    }

    #[test]
    fn test_json_carries_type_tags() {
        let pmap = PropertyMap::new()
            .with("Operator", PropertyValue::String("jdoe".into()))
            .with("Gains", PropertyValue::DoubleList(vec![1.0, 2.5]));
        let json = serde_json::to_value(&pmap).unwrap();
        assert_eq!(json["Operator"]["type"], "STRING");
        assert_eq!(json["Operator"]["scalar"], "jdoe");
        assert_eq!(json["Gains"]["type"], "DOUBLE");
        assert_eq!(json["Gains"]["array"][1], 2.5);
    }

    #[test]
    fn test_nested_map_from_json() {
        let json = r#"{
            "outer": {"type": "PROPERTY_MAP", "scalar": {
                "inner": {"type": "LONG", "scalar": 12345678901}
            }}
        }"#;
        let pmap: PropertyMap = serde_json::from_str(json).unwrap();
        let inner = pmap.get_property_map("outer").unwrap();
        assert_eq!(inner.get_long("inner"), Some(12_345_678_901));
    }

    #[test]
    fn test_rejects_value_without_payload() {
        let json = r#"{"broken": {"type": "STRING"}}"#;
        assert!(serde_json::from_str::<PropertyMap>(json).is_err());
    }
}
