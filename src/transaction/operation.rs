/*!
 * Defines the different [Operation]s that can be staged in a transaction
 * and flushed to the archive in one bulk write.
*/

use serde::{Deserialize, Serialize};

use crate::record::{DataRecord, ObjId, SnapshotId, StateType};
use crate::value::Value;

/// The fields of a record an [Operation::Update] may replace.  Keys
/// outside the record schema cannot be expressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    /// Replacement for the saved state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Replacement for the state schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_types: Option<Vec<StateType>>,
    /// Replacement for the content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_hash: Option<String>,
}

impl RecordPatch {
    /// A patch rewriting the state and its schema, as staged after a
    /// migration.
    pub fn reencoded(state: Value, state_types: Vec<StateType>) -> RecordPatch {
        RecordPatch {
            state: Some(state),
            state_types: Some(state_types),
            snapshot_hash: None,
        }
    }

    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.state_types.is_none() && self.snapshot_hash.is_none()
    }
}

/// An archive operation staged for the end of a transaction.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Insert a new record.
    Insert(DataRecord),
    /// Update fields of a record already in the archive.
    Update(SnapshotId, RecordPatch),
    /// Remove a record from the archive entirely.
    Delete(SnapshotId),
}

impl Operation {
    /// The id of the object being operated on.
    pub fn obj_id(&self) -> ObjId {
        match self {
            Operation::Insert(record) => record.obj_id,
            Operation::Update(sid, _) => sid.obj_id,
            Operation::Delete(sid) => sid.obj_id,
        }
    }

    /// The snapshot id of the object being operated on.
    pub fn snapshot_id(&self) -> SnapshotId {
        match self {
            Operation::Insert(record) => record.snapshot_id(),
            Operation::Update(sid, _) => *sid,
            Operation::Delete(sid) => *sid,
        }
    }
}
