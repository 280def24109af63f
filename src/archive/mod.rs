/*!
Defines the [Archive] trait the historian consumes to talk to persistent
storage, and the query types passed across that seam.

An archive stores data records, per-object metadata and file blobs.  The
exact wire format is the archive's concern; queries arrive as rendered
filter documents (see [crate::query]).
*/

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value as Json;
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

use crate::error::{ChroniclerError, Result};
use crate::record::{DataRecord, ObjId, SnapshotId};
use crate::transaction::Operation;

mod memory;

pub use memory::InMemoryArchive;

/// Per-object metadata: a plain document, not versioned.
pub type Meta = serde_json::Map<String, Json>;

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i8)]
pub enum SortDirection {
    /// Smallest first.
    Ascending = 1,
    /// Largest first.
    Descending = -1,
}

/// Which versions of each object a find should consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelect {
    /// Only the latest version of each object.
    #[default]
    Latest,
    /// A specific version of each object.
    Exact(u32),
    /// Every version.
    Any,
}

/// A rendered record query.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// The filter document to match records against.
    pub filter: Json,
    /// Which versions to consider.
    pub version: VersionSelect,
    /// Maximum number of results, 0 for unlimited.
    pub limit: u64,
    /// Number of leading results to skip.
    pub skip: u64,
    /// Sort criteria applied in order.
    pub sort: Vec<(String, SortDirection)>,
}

impl RecordQuery {
    /// A query matching records against the given filter document at the
    /// default (latest) version.
    pub fn filtered(filter: Json) -> RecordQuery {
        RecordQuery {
            filter,
            ..RecordQuery::default()
        }
    }
}

/// The direction reference-graph edges are followed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From referrer to referred-to.
    Outgoing,
    /// From referred-to back to referrer.
    Incoming,
    /// Both ways.
    Both,
}

/// An edge in object space: `source` holds a reference to `target`.
pub type ObjEdge = (ObjId, ObjId);

/// An edge in snapshot space.
pub type SnapshotEdge = (SnapshotId, SnapshotId);

/// Identifies a blob in the archive's file store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// A fresh random file id.
    pub fn random() -> FileId {
        FileId(Uuid::new_v4())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = ChroniclerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(FileId)
            .map_err(|_| ChroniclerError::InvalidId(s.to_string()))
    }
}

/// The persistent backing store for the historian: responsible for
/// storing, searching and loading data records, their metadata and file
/// blobs.
///
/// Archives must enforce uniqueness of `(obj_id, version)` and apply a
/// [bulk_write](Archive::bulk_write) atomically in staging order.
pub trait Archive {
    /// Create a new archive id.
    fn create_archive_id(&self) -> ObjId;

    /// Construct an archive id from a textual value, if possible.
    fn construct_archive_id(&self, value: &str) -> Result<ObjId>;

    /// Save a single data record.
    fn save(&self, record: DataRecord) -> Result<()>;

    /// Apply a batch of operations atomically, in order.
    fn bulk_write(&self, operations: &[Operation]) -> Result<()>;

    /// Load the snapshot with the given id.
    fn load(&self, sid: &SnapshotId) -> Result<DataRecord>;

    /// Find records matching the query.  The stream owns its records;
    /// dropping it releases the cursor.
    fn find(&self, query: RecordQuery) -> Result<Box<dyn Iterator<Item = DataRecord>>>;

    /// Count the records matching the query.
    fn count(&self, query: RecordQuery) -> Result<u64>;

    /// The distinct values of a (dotted) record field among records
    /// matching the query.
    fn distinct(&self, field: &str, query: RecordQuery) -> Result<Vec<Json>>;

    /// All snapshot ids of an object, ordered by version.
    fn get_snapshot_ids(&self, obj_id: ObjId) -> Result<Vec<SnapshotId>>;

    /// The reference graph around the given objects, following the live
    /// reference leaves of each object's latest record.
    fn get_obj_ref_graph(
        &self,
        obj_ids: &[ObjId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<ObjEdge>>;

    /// The reference graph around the given snapshots, following the
    /// reference leaves embedded in those specific versions.
    fn get_snapshot_ref_graph(
        &self,
        sids: &[SnapshotId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<SnapshotEdge>>;

    /// The metadata stored for an object, if any.
    fn meta_get(&self, obj_id: ObjId) -> Result<Option<Meta>>;

    /// Replace (or with `None` remove) the metadata of an object.
    fn meta_set(&self, obj_id: ObjId, meta: Option<Meta>) -> Result<()>;

    /// Replace the metadata of many objects at once.
    fn meta_set_many(&self, metas: HashMap<ObjId, Option<Meta>>) -> Result<()>;

    /// Merge the given entries into the metadata of an object.
    fn meta_update(&self, obj_id: ObjId, meta: Meta) -> Result<()>;

    /// Find metadata documents matching a filter, optionally restricted
    /// to a set of objects.
    fn meta_find(
        &self,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<(ObjId, Meta)>>;

    /// Distinct values of a metadata key, optionally filtered.
    fn meta_distinct(
        &self,
        key: &str,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<Json>>;

    /// Create an index on the metadata.
    ///
    /// With `unique` a second document with the same key values is
    /// rejected; with `where_exist` the index only applies to documents
    /// that contain the key(s).
    fn meta_create_index(
        &self,
        keys: &[(String, SortDirection)],
        unique: bool,
        where_exist: bool,
    ) -> Result<()>;

    /// Allocate an id in the file blob store.
    fn create_file_id(&self) -> FileId;

    /// Write a blob, replacing any previous content.
    fn write_file(&self, file_id: &FileId, data: &[u8]) -> Result<()>;

    /// Read a blob back.
    fn read_file(&self, file_id: &FileId) -> Result<Vec<u8>>;

    /// The archive's own schema migration version.
    fn schema_version(&self) -> u32;
}

impl fmt::Debug for dyn Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Archive")
    }
}
