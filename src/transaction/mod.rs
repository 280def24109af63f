/*!
 * Defines the [Transaction] overlays that stage changes until they are
 * committed to the archive in one atomic bulk write, and the
 * [LiveObjects] container tracking the objects the historian knows about.
*/

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::archive::Meta;
use crate::object::{Obj, ObjKey, WeakObj};
use crate::record::{DataRecord, ObjId, SnapshotId};

mod operation;

pub use operation::{Operation, RecordPatch};

/// The weak bidirectional map between live objects and their records.
/// Entries vanish once user code drops the last strong reference; dead
/// entries are pruned lazily.
#[derive(Default)]
pub struct LiveObjects {
    records: HashMap<ObjKey, (WeakObj, DataRecord)>,
    objects: HashMap<ObjId, WeakObj>,
}

impl LiveObjects {
    /// Track an object together with its up-to-date record.
    pub fn insert(&mut self, obj: &Obj, record: DataRecord) {
        self.objects.insert(record.obj_id, Rc::downgrade(obj));
        self.records
            .insert(ObjKey::of(obj), (Rc::downgrade(obj), record));
    }

    /// Stop tracking the object with the given id.
    pub fn remove(&mut self, obj_id: ObjId) {
        if let Some(weak) = self.objects.remove(&obj_id) {
            if let Some(obj) = weak.upgrade() {
                self.records.remove(&ObjKey::of(&obj));
                return;
            }
        }
        // The object has already died; drop any stale record entry.
        self.records.retain(|_, (_, record)| record.obj_id != obj_id);
    }

    /// The record tracked for an object, if it is known.
    pub fn record_for(&self, obj: &Obj) -> Option<&DataRecord> {
        let (weak, record) = self.records.get(&ObjKey::of(obj))?;
        // A dead weak handle means the address was reused; the entry is
        // stale and must not be trusted.
        weak.upgrade().is_some().then_some(record)
    }

    /// The live object with the given id, if it is still alive.
    pub fn object_for(&self, obj_id: ObjId) -> Option<Obj> {
        self.objects.get(&obj_id)?.upgrade()
    }

    /// Is this object instance tracked?
    pub fn contains(&self, obj: &Obj) -> bool {
        self.record_for(obj).is_some()
    }

    /// Drop entries whose objects have died.
    pub fn prune(&mut self) {
        self.records.retain(|_, (weak, _)| weak.strong_count() > 0);
        self.objects.retain(|_, weak| weak.strong_count() > 0);
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.objects
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of work.  All changes are staged in overlays and only reach the
/// archive (and the historian's own maps) when the outermost transaction
/// commits; rolling back discards them.
///
/// Objects are held strongly here so nothing saved or loaded inside the
/// transaction can die before commit.
#[derive(Default)]
pub struct Transaction {
    staged: Vec<Operation>,
    live_objects: HashMap<ObjKey, (Obj, DataRecord)>,
    live_by_id: HashMap<ObjId, Obj>,
    live_refs: Vec<(SnapshotId, Obj)>,
    snapshots: HashMap<SnapshotId, Obj>,
    metas: HashMap<ObjId, Option<Meta>>,
    deleted: HashSet<ObjId>,
}

impl Transaction {
    /// Begin an empty transaction.
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Track a live object along with an up-to-date record.
    pub fn insert_live_object(&mut self, obj: &Obj, record: DataRecord) {
        self.insert_live_ref(record.snapshot_id(), obj);
        self.live_by_id.insert(record.obj_id, Obj::clone(obj));
        self.live_objects
            .insert(ObjKey::of(obj), (Obj::clone(obj), record));
    }

    /// Reserve a snapshot id for an object before its record exists.
    /// This is the placeholder that lets reference cycles resolve during
    /// a save.
    pub fn insert_live_ref(&mut self, sid: SnapshotId, obj: &Obj) {
        if !self.live_refs.iter().any(|(existing, _)| *existing == sid) {
            self.live_refs.push((sid, Obj::clone(obj)));
        }
    }

    /// The live object tracked under the given id.
    pub fn live_object(&self, obj_id: ObjId) -> Option<Obj> {
        self.live_by_id.get(&obj_id).cloned()
    }

    /// The record tracked for an object instance.
    pub fn record_for(&self, obj: &Obj) -> Option<&DataRecord> {
        self.live_objects
            .get(&ObjKey::of(obj))
            .map(|(_, record)| record)
    }

    /// The reserved or recorded snapshot id for an object instance.
    pub fn sid_for(&self, obj: &Obj) -> Option<SnapshotId> {
        self.live_refs
            .iter()
            .find(|(_, candidate)| Rc::ptr_eq(candidate, obj))
            .map(|(sid, _)| *sid)
    }

    /// Cache a loaded snapshot object.
    pub fn insert_snapshot(&mut self, sid: SnapshotId, obj: &Obj) {
        self.snapshots.insert(sid, Obj::clone(obj));
    }

    /// The snapshot objects cached in this transaction.
    pub fn snapshots(&self) -> &HashMap<SnapshotId, Obj> {
        &self.snapshots
    }

    /// Overlay an object's metadata.  `None` marks removal.
    pub fn set_meta(&mut self, obj_id: ObjId, meta: Option<Meta>) {
        self.metas.insert(obj_id, meta);
    }

    /// The overlaid metadata for an object, if this transaction touched
    /// it.
    pub fn meta(&self, obj_id: ObjId) -> Option<&Option<Meta>> {
        self.metas.get(&obj_id)
    }

    /// The metadata overlay.
    pub fn metas(&self) -> &HashMap<ObjId, Option<Meta>> {
        &self.metas
    }

    /// Stage an operation to be flushed on commit.
    pub fn stage(&mut self, operation: Operation) {
        self.staged.push(operation);
    }

    /// The operations staged so far, in staging order.
    pub fn staged(&self) -> &[Operation] {
        &self.staged
    }

    /// Mark an object as deleted within this transaction.  It disappears
    /// from the live overlays immediately.
    pub fn mark_deleted(&mut self, obj_id: ObjId) {
        self.deleted.insert(obj_id);
        self.live_by_id.remove(&obj_id);
        self.live_objects
            .retain(|_, (_, record)| record.obj_id != obj_id);
        self.live_refs.retain(|(sid, _)| sid.obj_id != obj_id);
    }

    /// Was the object deleted in this transaction?
    pub fn is_deleted(&self, obj_id: ObjId) -> bool {
        self.deleted.contains(&obj_id)
    }

    /// The objects deleted in this transaction.
    pub fn deleted(&self) -> &HashSet<ObjId> {
        &self.deleted
    }

    /// Absorb a nested transaction that committed, overwriting existing
    /// overlay entries and appending its staged operations.
    pub fn merge(&mut self, inner: Transaction) {
        self.staged.extend(inner.staged);
        for (key, (obj, record)) in inner.live_objects {
            self.live_by_id.insert(record.obj_id, Obj::clone(&obj));
            self.live_objects.insert(key, (obj, record));
        }
        for (sid, obj) in inner.live_refs {
            self.insert_live_ref(sid, &obj);
        }
        self.snapshots.extend(inner.snapshots);
        self.metas.extend(inner.metas);
        for obj_id in inner.deleted {
            self.mark_deleted(obj_id);
        }
    }

    /// Split the transaction into the pieces a commit needs.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        Vec<Operation>,
        Vec<(Obj, DataRecord)>,
        HashMap<SnapshotId, Obj>,
        HashMap<ObjId, Option<Meta>>,
        HashSet<ObjId>,
    ) {
        (
            self.staged,
            self.live_objects.into_values().collect(),
            self.snapshots,
            self.metas,
            self.deleted,
        )
    }
}
