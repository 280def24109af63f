/*!
The depositors: [Saver] walks live object graphs and produces encoded
state plus a per-path schema; [Loader] reverses the walk, applying
migrations on the way.

Both borrow the historian for the duration of one operation and stage
whatever they produce in the current transaction.
*/

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::archive::Archive;
use crate::error::{ChroniclerError, Result};
use crate::historian::Historian;
use crate::migration;
use crate::object::{Node, Obj, ObjKey};
use crate::record::{DataRecord, SnapshotId, StateType};
use crate::transaction::{Operation, RecordPatch};
use crate::value::{PathStep, Value, ValuePath};

/// A depositor that knows how to encode object graphs for the archive.
pub struct Saver<'h> {
    hist: &'h mut Historian,
    encoding: HashSet<ObjKey>,
}

impl<'h> Saver<'h> {
    /// Create a saver borrowing the historian.
    pub(crate) fn new(hist: &'h mut Historian) -> Self {
        Saver {
            hist,
            encoding: HashSet::new(),
        }
    }

    /// The owning historian.
    pub fn historian(&mut self) -> &mut Historian {
        self.hist
    }

    /// The archive being saved into.
    pub fn archive(&self) -> &dyn Archive {
        self.hist.archive()
    }

    /// Get a persistent reference for the given object.  An object with a
    /// save in progress resolves to its reserved snapshot id; anything
    /// else is saved first.
    pub fn ref_for(&mut self, obj: &Obj) -> Result<SnapshotId> {
        if let Some(sid) = self.hist.trans_sid_for(obj) {
            return Ok(sid);
        }
        Ok(self.hist.save_object(obj)?.snapshot_id())
    }

    /// Encode the state of an object, returning the primitive state tree
    /// and the schema of types encountered along the way.
    pub fn save_state(&mut self, obj: &Obj) -> Result<(Value, Vec<StateType>)> {
        let mut schema = Vec::new();
        let root = Node::Obj(Obj::clone(obj));
        let state = self.encode(&root, &ValuePath::root(), &mut schema)?;
        Ok((state, schema))
    }

    fn encode(
        &mut self,
        node: &Node,
        path: &ValuePath,
        schema: &mut Vec<StateType>,
    ) -> Result<Value> {
        match node {
            Node::Value(value) => Ok(value.clone()),
            Node::List(items) => {
                let mut encoded = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    encoded.push(self.encode(item, &path.index(idx), schema)?);
                }
                Ok(Value::List(encoded))
            }
            Node::Map(map) => {
                let mut encoded = std::collections::BTreeMap::new();
                for (key, item) in map {
                    encoded.insert(key.clone(), self.encode(item, &path.key(key), schema)?);
                }
                Ok(Value::Map(encoded))
            }
            Node::Obj(obj) => {
                let key = ObjKey::of(obj);
                if !self.encoding.insert(key) {
                    return Err(ChroniclerError::Integrity(
                        "cyclic save: the object is already being encoded, break the cycle \
                         with a reference"
                            .to_string(),
                    ));
                }
                let result = self.encode_obj(obj, path, schema);
                self.encoding.remove(&key);
                result
            }
        }
    }

    fn encode_obj(
        &mut self,
        obj: &Obj,
        path: &ValuePath,
        schema: &mut Vec<StateType>,
    ) -> Result<Value> {
        let helper = self.hist.registry().helper_for_obj(obj)?;
        schema.push(StateType {
            path: path.clone(),
            type_id: helper.type_id(),
            version: helper.migration_version(),
        });
        let state = {
            let borrowed = obj.borrow();
            helper
                .save_instance_state(&*borrowed, self)
                .map_err(|err| ChroniclerError::Encoding(err.to_string()))?
        };
        self.encode(&state, path, schema)
    }
}

/// Whether a loader produces live objects or historical snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Live,
    Snapshot,
}

/// A depositor that knows how to decode records back into objects.
///
/// Snapshot loaders keep a cache keyed by snapshot id so identity holds
/// within one load operation; a subsequent independent load produces
/// fresh snapshot objects.
pub struct Loader<'h> {
    hist: &'h mut Historian,
    mode: LoadMode,
    stage_migrations: bool,
    snapshots: HashMap<SnapshotId, Obj>,
    migrated: Vec<ValuePath>,
    pending_root: Option<DataRecord>,
}

impl<'h> Loader<'h> {
    /// A loader producing live, tracked objects.
    pub(crate) fn live(hist: &'h mut Historian) -> Self {
        Loader {
            hist,
            mode: LoadMode::Live,
            stage_migrations: true,
            snapshots: HashMap::new(),
            migrated: Vec::new(),
            pending_root: None,
        }
    }

    /// A loader producing untracked snapshot objects.
    pub(crate) fn snapshot(hist: &'h mut Historian) -> Self {
        Loader {
            hist,
            mode: LoadMode::Snapshot,
            stage_migrations: false,
            snapshots: HashMap::new(),
            migrated: Vec::new(),
            pending_root: None,
        }
    }

    /// A snapshot loader that additionally rewrites migrated records in
    /// the archive.  Used by bulk migration.
    pub(crate) fn migrator(hist: &'h mut Historian) -> Self {
        Loader {
            stage_migrations: true,
            ..Loader::snapshot(hist)
        }
    }

    /// The owning historian.
    pub fn historian(&mut self) -> &mut Historian {
        self.hist
    }

    /// Is this loader producing historical snapshots?  References decoded
    /// by a snapshot loader dereference in snapshot space.
    pub fn is_snapshot(&self) -> bool {
        self.mode == LoadMode::Snapshot
    }

    /// Did the last record decoded through this loader need migrating?
    pub(crate) fn migrated_any(&self) -> bool {
        !self.migrated.is_empty()
    }

    /// Load the snapshot with the given id through this loader's cache.
    pub fn load_snapshot(&mut self, sid: &SnapshotId) -> Result<Obj> {
        if let Some(obj) = self.snapshots.get(sid) {
            return Ok(Obj::clone(obj));
        }
        let record = self.hist.archive().load(sid)?;
        if record.is_deleted_record() {
            return Err(ChroniclerError::ObjectDeleted(sid.obj_id));
        }
        self.load_snapshot_record(&record)
    }

    /// Decode a record into an untracked snapshot object.
    pub(crate) fn load_snapshot_record(&mut self, record: &DataRecord) -> Result<Obj> {
        debug!(snapshot = %record.snapshot_id(), "loading snapshot from record");
        let obj = self.decode_record(record, false)?;
        let sid = record.snapshot_id();
        self.snapshots.insert(sid, Obj::clone(&obj));
        self.hist.trans_mut().insert_snapshot(sid, &obj);
        Ok(obj)
    }

    /// Decode a record into a live object registered with the current
    /// transaction.
    pub(crate) fn load_live_record(&mut self, record: &DataRecord) -> Result<Obj> {
        debug!(snapshot = %record.snapshot_id(), "loading object from record");
        self.decode_record(record, true)
    }

    fn decode_record(&mut self, record: &DataRecord, live_root: bool) -> Result<Obj> {
        let schema = record.state_schema();
        self.migrated.clear();
        self.pending_root = if live_root {
            Some(record.clone())
        } else {
            None
        };
        let node = self.decode(&record.state, &schema, &ValuePath::root())?;
        self.pending_root = None;
        let obj = match node {
            Node::Obj(obj) => obj,
            _ => {
                return Err(ChroniclerError::Encoding(format!(
                    "record '{}' does not decode to an object",
                    record.snapshot_id()
                )))
            }
        };
        if !self.migrated.is_empty() && self.stage_migrations {
            info!(
                snapshot = %record.snapshot_id(),
                "snapshot has been migrated to the latest version"
            );
            let (state, state_types) = Saver::new(self.hist).save_state(&obj)?;
            self.hist.trans_mut().stage(Operation::Update(
                record.snapshot_id(),
                RecordPatch::reencoded(state, state_types),
            ));
        }
        Ok(obj)
    }

    /// Do an in-place update of an object from a record, preserving its
    /// identity.
    pub(crate) fn update_from_record(&mut self, obj: &Obj, record: &DataRecord) -> Result<()> {
        debug!(snapshot = %record.snapshot_id(), "updating object from record");
        let helper = self.hist.registry().helper_for_obj(obj)?;
        self.hist
            .trans_mut()
            .insert_live_object(obj, record.clone());
        let schema = record.state_schema();
        let state = self.decode_children(&record.state, &schema, &ValuePath::root())?;
        helper
            .load_instance_state(obj, &state, self)
            .map_err(|err| ChroniclerError::Encoding(err.to_string()))
    }

    fn decode(
        &mut self,
        encoded: &Value,
        schema: &HashMap<ValuePath, StateType>,
        path: &ValuePath,
    ) -> Result<Node> {
        let Some(entry) = schema.get(path).cloned() else {
            return self.decode_children(encoded, schema, path);
        };
        let helper = self.hist.registry().helper_for_type_id(entry.type_id)?;

        let (obj, mut state) = if helper.immutable() {
            let state = self.decode_children(encoded, schema, path)?;
            let obj = helper
                .new_instance(&state)
                .map_err(|err| ChroniclerError::Encoding(err.to_string()))?;
            self.register_created(path, &obj);
            (obj, state)
        } else {
            let raw = Node::Value(encoded.clone());
            let obj = helper
                .new_instance(&raw)
                .map_err(|err| ChroniclerError::Encoding(err.to_string()))?;
            self.register_created(path, &obj);
            let state = self.decode_children(encoded, schema, path)?;
            (obj, state)
        };

        let (upgraded, was_migrated) =
            migration::ensure_up_to_date(helper.as_ref(), state, entry.version, self)?;
        state = upgraded;
        if was_migrated {
            self.migrated.push(path.clone());
        }

        helper
            .load_instance_state(&obj, &state, self)
            .map_err(|err| ChroniclerError::Encoding(err.to_string()))?;
        Ok(Node::Obj(obj))
    }

    /// For the root of a live load, put the freshly created object into
    /// the transaction so references back to it resolve while its
    /// children decode.
    fn register_created(&mut self, path: &ValuePath, obj: &Obj) {
        if path.is_root() {
            if let Some(record) = self.pending_root.take() {
                self.hist.trans_mut().insert_live_object(obj, record);
            }
        }
    }

    fn decode_children(
        &mut self,
        encoded: &Value,
        schema: &HashMap<ValuePath, StateType>,
        path: &ValuePath,
    ) -> Result<Node> {
        match encoded {
            Value::List(items) => {
                let mut decoded = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    decoded.push(self.decode(item, schema, &path.index(idx))?);
                }
                Ok(Node::List(decoded))
            }
            Value::Map(map) => {
                let mut decoded = std::collections::BTreeMap::new();
                for (key, item) in map {
                    decoded.insert(
                        key.clone(),
                        self.decode(item, schema, &path.child(PathStep::Key(key.clone())))?,
                    );
                }
                Ok(Node::Map(decoded))
            }
            other => Ok(Node::Value(other.clone())),
        }
    }
}
