/*!
The primitive tree accepted by archives, represented by [Value].

Archives store booleans, integers, floats, strings, bytes, nulls,
timestamps, UUIDs, archive ids, ordered lists thereof and mappings with
string keys.  Anything else must be encoded down to these by a type helper
before it reaches the archive.

[ValuePath] addresses a position inside a [Value] tree; the empty path is
the root.
*/

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::record::ObjId;

/// Wire tag for binary payloads.
const TAG_BYTES: &str = "$bin";
/// Wire tag for timestamps.
const TAG_TIMESTAMP: &str = "$dt";
/// Wire tag for UUIDs.
const TAG_UUID: &str = "$uuid";
/// Wire tag for archive ids.
const TAG_ID: &str = "$oid";

/// A tree of primitives that an archive accepts without type helpers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value.
    Null,
    /// True or false.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE 754 floating point.
    Float(f64),
    /// UTF-8 text.
    Str(String),
    /// Arbitrary-length byte array.
    Bytes(Vec<u8>),
    /// Timestamp with timezone, stored in UTC.
    Timestamp(DateTime<Utc>),
    /// Universally unique identifier.
    Uuid(Uuid),
    /// The archive's own identifier type.
    Id(ObjId),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Mapping with string keys.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Navigate to the value at the given path, if there is one.
    pub fn value_at(&self, path: &ValuePath) -> Option<&Value> {
        let mut current = self;
        for step in path.steps() {
            current = match (current, step) {
                (Value::Map(map), PathStep::Key(key)) => map.get(key)?,
                (Value::List(items), PathStep::Index(idx)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// The string slice if this is a [Value::Str].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer if this is a [Value::Int].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// True if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<ObjId> for Value {
    fn from(value: ObjId) -> Self {
        Value::Id(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
            Value::Bytes(b) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                serde_json::json!({ TAG_BYTES: encoded })
            }
            Value::Timestamp(ts) => serde_json::json!({ TAG_TIMESTAMP: ts.to_rfc3339() }),
            Value::Uuid(id) => serde_json::json!({ TAG_UUID: id.to_string() }),
            Value::Id(id) => serde_json::json!({ TAG_ID: id.to_string() }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, val)| (key.clone(), serde_json::Value::from(val)))
                    .collect(),
            ),
        }
    }
}

/// Serialize with tagged single-entry mappings for the primitive kinds
/// document stores have no native encoding for.
impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(
                    TAG_BYTES,
                    &base64::engine::general_purpose::STANDARD.encode(b),
                )?;
                map.end()
            }
            Value::Timestamp(ts) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(TAG_TIMESTAMP, &ts.to_rfc3339())?;
                map.end()
            }
            Value::Uuid(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(TAG_UUID, &id.to_string())?;
                map.end()
            }
            Value::Id(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(TAG_ID, &id.to_string())?;
                map.end()
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, val) in map {
                    out.serialize_entry(key, val)?;
                }
                out.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an archive primitive value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, val)) = access.next_entry::<String, Value>()? {
            map.insert(key, val);
        }
        if map.len() == 1 {
            let (key, val) = map.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
            if let Value::Str(text) = &val {
                match key.as_str() {
                    TAG_BYTES => {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(text)
                            .map_err(|err| de::Error::custom(format!("invalid base64: {}", err)))?;
                        return Ok(Value::Bytes(bytes));
                    }
                    TAG_TIMESTAMP => {
                        let ts = DateTime::parse_from_rfc3339(text)
                            .map_err(|err| de::Error::custom(format!("invalid timestamp: {}", err)))?;
                        return Ok(Value::Timestamp(ts.with_timezone(&Utc)));
                    }
                    TAG_UUID => {
                        let id = Uuid::parse_str(text)
                            .map_err(|err| de::Error::custom(format!("invalid uuid: {}", err)))?;
                        return Ok(Value::Uuid(id));
                    }
                    TAG_ID => {
                        let id = text
                            .parse::<ObjId>()
                            .map_err(|err| de::Error::custom(err.to_string()))?;
                        return Ok(Value::Id(id));
                    }
                    _ => {}
                }
            }
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// One step into a [Value] tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathStep {
    /// A mapping key.
    Key(String),
    /// A list index.
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Key(key) => write!(f, "{}", key),
            PathStep::Index(idx) => write!(f, "{}", idx),
        }
    }
}

/// A path addressing a position in a [Value] tree.  The empty path denotes
/// the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ValuePath(Vec<PathStep>);

impl ValuePath {
    /// The root path.
    pub fn root() -> Self {
        ValuePath(Vec::new())
    }

    /// True if this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The steps making up this path.
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    /// A new path extended by one step.
    pub fn child(&self, step: PathStep) -> ValuePath {
        let mut steps = self.0.clone();
        steps.push(step);
        ValuePath(steps)
    }

    /// A new path extended by a mapping key.
    pub fn key(&self, key: &str) -> ValuePath {
        self.child(PathStep::Key(key.to_string()))
    }

    /// A new path extended by a list index.
    pub fn index(&self, idx: usize) -> ValuePath {
        self.child(PathStep::Index(idx))
    }

    /// True if `other` starts with this path.
    pub fn is_prefix_of(&self, other: &ValuePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl From<Vec<PathStep>> for ValuePath {
    fn from(steps: Vec<PathStep>) -> Self {
        ValuePath(steps)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        write!(f, "{}", self.0.iter().join("."))
    }
}

impl Serialize for ValuePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for step in &self.0 {
            match step {
                PathStep::Key(key) => seq.serialize_element(key)?,
                PathStep::Index(idx) => seq.serialize_element(idx)?,
            }
        }
        seq.end()
    }
}

struct PathVisitor;

impl<'de> Visitor<'de> for PathVisitor {
    type Value = ValuePath;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a list of mapping keys and list indices")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ValuePath, A::Error> {
        let mut steps = Vec::new();
        while let Some(step) = seq.next_element::<Value>()? {
            match step {
                Value::Str(key) => steps.push(PathStep::Key(key)),
                Value::Int(idx) if idx >= 0 => steps.push(PathStep::Index(idx as usize)),
                other => {
                    return Err(de::Error::custom(format!(
                        "invalid path step: {:?}",
                        other
                    )))
                }
            }
        }
        Ok(ValuePath(steps))
    }
}

impl<'de> Deserialize<'de> for ValuePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(PathVisitor)
    }
}
