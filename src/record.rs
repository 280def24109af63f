/*!
The immutable [DataRecord] that describes one snapshot of an object, the
[SnapshotId] addressing it, and the builders used to derive new records
from old ones.

A record stores the encoded `state` of an object together with its
`state_types` schema: the ordered list of [StateType] entries naming the
helper type found at each path inside the state.
*/

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ChroniclerError, Result};
use crate::helper::TypeId;
use crate::value::{Value, ValuePath};

/// Special state denoting a deleted record.
pub const DELETED: &str = "!!deleted";

/// Keys used in the `extras` mapping of a record.
pub mod extras {
    /// The id of the object that created this one.
    pub const CREATED_BY: &str = "_created_by";
    /// The snapshot this object was copied from.
    pub const COPIED_FROM: &str = "_copied_from";
    /// The user that saved this snapshot.
    pub const USER: &str = "_user";
    /// The hostname of the computer this snapshot was saved on.
    pub const HOSTNAME: &str = "_hostname";
}

/// Identifies an object across all of its versions.  Generated by the
/// archive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjId(Uuid);

impl ObjId {
    /// Create a fresh random id.
    pub fn random() -> Self {
        ObjId(Uuid::new_v4())
    }

    /// The all-zero id.
    pub fn nil() -> Self {
        ObjId(Uuid::nil())
    }

    /// The raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjId {
    type Err = ChroniclerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ObjId)
            .map_err(|_| ChroniclerError::InvalidId(s.to_string()))
    }
}

/// Identifies one snapshot of an object: `(obj_id, version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId {
    /// The object this snapshot belongs to.
    pub obj_id: ObjId,
    /// The version of the snapshot, starting at 0.
    pub version: u32,
}

impl SnapshotId {
    /// Create a snapshot id.
    pub fn new(obj_id: ObjId, version: u32) -> Self {
        SnapshotId { obj_id, version }
    }

    /// The on-wire representation: `[obj_id, version]`.
    pub fn to_value(&self) -> Value {
        Value::List(vec![Value::Id(self.obj_id), Value::Int(self.version as i64)])
    }

    /// Read a snapshot id back from its on-wire `[obj_id, version]` form.
    pub fn from_value(value: &Value) -> Option<SnapshotId> {
        match value {
            Value::List(items) if items.len() == 2 => match (&items[0], &items[1]) {
                (Value::Id(obj_id), Value::Int(version)) if *version >= 0 => {
                    Some(SnapshotId::new(*obj_id, *version as u32))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.obj_id, self.version)
    }
}

/// Parsing for the textual `{obj_id}#{version}` form.  The object id may
/// itself contain `#` so the split happens on the last one.
impl FromStr for SnapshotId {
    type Err = ChroniclerError;

    fn from_str(s: &str) -> Result<Self> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^(?P<oid>.+)#(?P<ver>\d+)$").unwrap();
        }
        let caps = RE
            .captures(s)
            .ok_or_else(|| ChroniclerError::InvalidId(s.to_string()))?;
        let obj_id = caps["oid"].parse::<ObjId>()?;
        let version = caps["ver"]
            .parse::<u32>()
            .map_err(|_| ChroniclerError::InvalidId(s.to_string()))?;
        Ok(SnapshotId::new(obj_id, version))
    }
}

impl Serialize for SnapshotId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.obj_id)?;
        seq.serialize_element(&self.version)?;
        seq.end()
    }
}

struct SnapshotIdVisitor;

impl<'de> Visitor<'de> for SnapshotIdVisitor {
    type Value = SnapshotId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an [obj_id, version] pair")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<SnapshotId, A::Error> {
        let obj_id = seq
            .next_element::<ObjId>()?
            .ok_or_else(|| de::Error::custom("missing obj_id"))?;
        let version = seq
            .next_element::<u32>()?
            .ok_or_else(|| de::Error::custom("missing version"))?;
        Ok(SnapshotId::new(obj_id, version))
    }
}

impl<'de> Deserialize<'de> for SnapshotId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(SnapshotIdVisitor)
    }
}

/// One entry of a record's schema: the helper type found at a path within
/// the state, plus the migration version the state was saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateType {
    /// Where in the state tree the encoded instance lives.
    pub path: ValuePath,
    /// The stable id of the helper that encoded it.
    pub type_id: TypeId,
    /// The helper's migration version at save time, if it had one.
    pub version: Option<u32>,
}

/// `state_types` entries are stored as `[path, type_id]` or
/// `[path, type_id, version]` triples.
impl Serialize for StateType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.version.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.path)?;
        seq.serialize_element(&self.type_id)?;
        if let Some(version) = self.version {
            seq.serialize_element(&version)?;
        }
        seq.end()
    }
}

struct StateTypeVisitor;

impl<'de> Visitor<'de> for StateTypeVisitor {
    type Value = StateType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a [path, type_id, version?] entry")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<StateType, A::Error> {
        let path = seq
            .next_element::<ValuePath>()?
            .ok_or_else(|| de::Error::custom("missing path"))?;
        let type_id = seq
            .next_element::<TypeId>()?
            .ok_or_else(|| de::Error::custom("missing type id"))?;
        let version = seq.next_element::<Option<u32>>()?.flatten();
        Ok(StateType {
            path,
            type_id,
            version,
        })
    }
}

impl<'de> Deserialize<'de> for StateType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(StateTypeVisitor)
    }
}

/// An immutable record that describes a snapshot of an object.
///
/// Field names on the wire follow the archive key map; keys whose value
/// equals the record default are omitted to save space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// The id of the object, spanning all snapshots.
    pub obj_id: ObjId,
    /// The type id of the object.
    pub type_id: TypeId,
    /// The time the object was first created.
    #[serde(rename = "ctime")]
    pub creation_time: DateTime<Utc>,
    /// The version of this particular snapshot.
    #[serde(rename = "ver")]
    pub version: u32,
    /// The saved state of the object.
    pub state: Value,
    /// The helper types saved in the state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_types: Option<Vec<StateType>>,
    /// The content hash of the state.
    #[serde(rename = "hash", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_hash: Option<String>,
    /// The time this snapshot was taken.
    #[serde(rename = "stime")]
    pub snapshot_time: DateTime<Utc>,
    /// Additional, non-structural data stored with the snapshot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Value>,
}

impl DataRecord {
    /// The snapshot id of this record.
    pub fn snapshot_id(&self) -> SnapshotId {
        SnapshotId::new(self.obj_id, self.version)
    }

    /// Does this record represent the object having been deleted?
    pub fn is_deleted_record(&self) -> bool {
        self.state.as_str() == Some(DELETED)
    }

    /// Get an extra from the record, `None` if it isn't present.
    pub fn get_extra(&self, name: &str) -> Option<&Value> {
        self.extras.get(name)
    }

    /// The id of the object that created this one, if recorded.
    pub fn created_by(&self) -> Option<ObjId> {
        match self.get_extra(extras::CREATED_BY) {
            Some(Value::Id(id)) => Some(*id),
            _ => None,
        }
    }

    /// The snapshot this record was copied from, if it is a copy.
    pub fn copied_from(&self) -> Option<SnapshotId> {
        self.get_extra(extras::COPIED_FROM)
            .and_then(SnapshotId::from_value)
    }

    /// The schema as a map from path to entry, for decoding.
    pub fn state_schema(&self) -> HashMap<ValuePath, StateType> {
        self.state_types
            .iter()
            .flatten()
            .map(|entry| (entry.path.clone(), entry.clone()))
            .collect()
    }

    /// A builder for a brand new record at version 0.
    pub fn new_builder(type_id: TypeId, obj_id: ObjId) -> DataRecordBuilder {
        let now = Utc::now();
        DataRecordBuilder {
            obj_id,
            type_id,
            creation_time: now,
            version: 0,
            state: None,
            state_types: None,
            snapshot_hash: None,
            snapshot_time: now,
            extras: BTreeMap::new(),
        }
    }

    /// A builder for the next version of this record.  The object id, type
    /// id, creation time and extras carry over; the version is incremented.
    pub fn child_builder(&self) -> DataRecordBuilder {
        DataRecordBuilder {
            obj_id: self.obj_id,
            type_id: self.type_id,
            creation_time: self.creation_time,
            version: self.version + 1,
            state: None,
            state_types: None,
            snapshot_hash: None,
            snapshot_time: Utc::now(),
            extras: self.extras.clone(),
        }
    }

    /// A builder for a copy of this record: a new object at version 0 with
    /// a deep copy of the state and a `_copied_from` extra pointing here.
    pub fn copy_builder(&self, obj_id: ObjId) -> DataRecordBuilder {
        let now = Utc::now();
        let mut extras = BTreeMap::new();
        extras.insert(
            extras::COPIED_FROM.to_string(),
            self.snapshot_id().to_value(),
        );
        DataRecordBuilder {
            obj_id,
            type_id: self.type_id,
            creation_time: now,
            version: 0,
            state: Some(self.state.clone()),
            state_types: self.state_types.clone(),
            snapshot_hash: self.snapshot_hash.clone(),
            snapshot_time: now,
            extras,
        }
    }

    /// A builder for the record that represents the deletion of this
    /// object.
    pub fn deleted_builder(&self) -> DataRecordBuilder {
        let mut builder = self.child_builder();
        builder.state = Some(Value::Str(DELETED.to_string()));
        builder.state_types = None;
        builder.snapshot_hash = None;
        builder
    }
}

/// Accumulates the fields of a [DataRecord] before it is frozen.
#[derive(Debug, Clone)]
pub struct DataRecordBuilder {
    /// The id of the object.
    pub obj_id: ObjId,
    /// The type id of the object.
    pub type_id: TypeId,
    /// The time the object was first created.
    pub creation_time: DateTime<Utc>,
    /// The version this record will carry.
    pub version: u32,
    /// The saved state, required unless building a deleted record.
    pub state: Option<Value>,
    /// The schema of the state.
    pub state_types: Option<Vec<StateType>>,
    /// The content hash of the state.
    pub snapshot_hash: Option<String>,
    /// The time of the snapshot.
    pub snapshot_time: DateTime<Utc>,
    /// Additional data stored with the snapshot.
    pub extras: BTreeMap<String, Value>,
}

impl DataRecordBuilder {
    /// The snapshot id this builder will produce.
    pub fn snapshot_id(&self) -> SnapshotId {
        SnapshotId::new(self.obj_id, self.version)
    }

    /// Set the encoded state and its schema.
    pub fn with_state(mut self, state: Value, state_types: Vec<StateType>) -> Self {
        self.state = Some(state);
        self.state_types = Some(state_types);
        self
    }

    /// Set the content hash.
    pub fn with_hash(mut self, snapshot_hash: String) -> Self {
        self.snapshot_hash = Some(snapshot_hash);
        self
    }

    /// Add an extra to the record.
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extras.insert(key.to_string(), value);
        self
    }

    /// Freeze the builder into a record.
    pub fn build(self) -> Result<DataRecord> {
        let state = self.state.ok_or_else(|| {
            ChroniclerError::Encoding("record state was never set".to_string())
        })?;
        Ok(DataRecord {
            obj_id: self.obj_id,
            type_id: self.type_id,
            creation_time: self.creation_time,
            version: self.version,
            state,
            state_types: self.state_types,
            snapshot_hash: self.snapshot_hash,
            snapshot_time: self.snapshot_time,
            extras: self.extras,
        })
    }
}
