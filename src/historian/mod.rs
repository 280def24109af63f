/*!
The [Historian]: the go-between between your objects and the archive.

It keeps track of all live objects that have been loaded and/or saved,
stages changes in nestable transactions, and lets you look objects up in
the archive.  One historian instance is single-threaded; multiple
historians interact only through the shared archive.
*/

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value as Json;
use tracing::debug;

use crate::archive::{Archive, Direction, Meta, RecordQuery, SortDirection, VersionSelect};
use crate::depositor::{Loader, Saver};
use crate::equator::Equator;
use crate::error::{ChroniclerError, Result};
use crate::file::{File, FileHelper};
use crate::helper::{TypeHelper, TypeId};
use crate::migration::Migrations;
use crate::object::{Obj, ObjKey, WeakObj};
use crate::query::{Expr, Field};
use crate::record::{extras, DataRecord, DataRecordBuilder, ObjId, SnapshotId, DELETED};
use crate::reference::{ObjRefHelper, SnapshotIdHelper};
use crate::registry::TypeRegistry;
use crate::transaction::{LiveObjects, Operation, Transaction};
use crate::value::Value;

mod meta;
mod references;

pub use meta::MetaStore;
pub use references::References;

/// Signal that the enclosing transaction should be abandoned.  All
/// overlays are discarded and `transaction` returns `Ok(None)`.
pub fn rollback<T>() -> Result<T> {
    Err(ChroniclerError::RolledBack)
}

/// Information staged for an object before it is first saved.
struct StagedInfo {
    target: WeakObj,
    created_by: Option<WeakObj>,
    copied_from: Option<WeakObj>,
}

/// Selects entries from an object's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    /// Every version.
    All,
    /// A single version; negative counts from the end.
    Index(i64),
    /// A half-open range of versions; negative bounds count from the
    /// end.
    Range {
        /// First index, `None` for the start.
        start: Option<i64>,
        /// One past the last index, `None` for the end.
        stop: Option<i64>,
    },
}

impl Slice {
    fn normalise(bound: i64, len: usize) -> usize {
        if bound < 0 {
            len.saturating_sub(bound.unsigned_abs() as usize)
        } else {
            (bound as usize).min(len)
        }
    }

    fn apply<T: Copy>(&self, items: &[T]) -> Vec<T> {
        let len = items.len();
        match self {
            Slice::All => items.to_vec(),
            Slice::Index(idx) => {
                let at = Self::normalise(*idx, len);
                items.get(at).copied().into_iter().collect()
            }
            Slice::Range { start, stop } => {
                let from = start.map_or(0, |bound| Self::normalise(bound, len));
                let to = stop.map_or(len, |bound| Self::normalise(bound, len));
                if from >= to {
                    return Vec::new();
                }
                items[from..to].to_vec()
            }
        }
    }
}

impl From<i64> for Slice {
    fn from(idx: i64) -> Self {
        Slice::Index(idx)
    }
}

impl From<std::ops::Range<i64>> for Slice {
    fn from(range: std::ops::Range<i64>) -> Self {
        Slice::Range {
            start: Some(range.start),
            stop: Some(range.end),
        }
    }
}

/// The criteria of a [find](Historian::find).
#[derive(Default)]
pub struct Find {
    filter: Expr,
    obj_type: Option<TypeId>,
    obj_ids: Option<Vec<ObjId>>,
    version: Option<VersionSelect>,
    state: Option<Json>,
    meta: Option<Json>,
    sort: Vec<(String, SortDirection)>,
    limit: u64,
    skip: u64,
    exclude_deleted: bool,
}

impl Find {
    /// Match everything.
    pub fn everything() -> Find {
        Find::default()
    }

    /// Apply a filter expression.
    pub fn with_filter(mut self, filter: Expr) -> Find {
        self.filter = self.filter.and(filter);
        self
    }

    /// Restrict to objects of the given type.
    pub fn with_type(mut self, type_id: TypeId) -> Find {
        self.obj_type = Some(type_id);
        self
    }

    /// Restrict to a single object.
    pub fn with_obj_id(self, obj_id: ObjId) -> Find {
        self.with_obj_ids(vec![obj_id])
    }

    /// Restrict to a set of objects.
    pub fn with_obj_ids(mut self, obj_ids: Vec<ObjId>) -> Find {
        self.obj_ids = Some(obj_ids);
        self
    }

    /// Select which versions to search.
    pub fn with_version(mut self, version: VersionSelect) -> Find {
        self.version = Some(version);
        self
    }

    /// Criteria on the stored state; keys compose under `state.`.
    pub fn with_state(mut self, state: Json) -> Find {
        self.state = Some(state);
        self
    }

    /// Criteria on the metadata of the objects.
    pub fn with_meta(mut self, meta: Json) -> Find {
        self.meta = Some(meta);
        self
    }

    /// Sort the results.
    pub fn sort_by(mut self, field: &str, direction: SortDirection) -> Find {
        self.sort.push((field.to_string(), direction));
        self
    }

    /// Return at most this many results, 0 for unlimited.
    pub fn limit(mut self, limit: u64) -> Find {
        self.limit = limit;
        self
    }

    /// Skip this many leading results.
    pub fn skip(mut self, skip: u64) -> Find {
        self.skip = skip;
        self
    }

    /// Leave out deletion tombstones instead of surfacing them as
    /// [ObjectDeleted](ChroniclerError::ObjectDeleted) on load.
    pub fn exclude_deleted(mut self) -> Find {
        self.exclude_deleted = true;
        self
    }
}

/// The result of a [purge](Historian::purge).
#[derive(Debug, Default)]
pub struct PurgeResult {
    /// The snapshots removed (or that would be removed, on a dry run).
    pub deleted_purged: BTreeSet<SnapshotId>,
}

/// A lazy stream of objects produced by a find.  Dropping it releases
/// the underlying cursor.
pub struct ObjectIter<'h> {
    hist: &'h mut Historian,
    records: Box<dyn Iterator<Item = DataRecord>>,
    snapshots: bool,
}

impl Iterator for ObjectIter<'_> {
    type Item = Result<Obj>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(if self.snapshots {
            self.hist
                .in_transaction(|hist| Loader::snapshot(hist).load_snapshot_record(&record))
        } else {
            self.hist.load_object_from_record(&record)
        })
    }
}

/// The mediator between live in-memory objects and the archive.
pub struct Historian {
    archive: Box<dyn Archive>,
    registry: TypeRegistry,
    equator: Equator,
    live: LiveObjects,
    snapshots: HashMap<ObjKey, (WeakObj, SnapshotId)>,
    transactions: Vec<Transaction>,
    saving: HashSet<ObjKey>,
    staging: HashMap<ObjKey, StagedInfo>,
    sticky: Meta,
    user: Option<String>,
    hostname: Option<String>,
}

impl Historian {
    /// Create a historian over the given archive.  The built-in types
    /// (references, snapshot ids, files) come pre-registered.
    pub fn new(archive: Box<dyn Archive>) -> Historian {
        let mut registry = TypeRegistry::new();
        registry.register(Rc::new(ObjRefHelper));
        registry.register(Rc::new(SnapshotIdHelper));
        registry.register(Rc::new(FileHelper));
        Historian {
            archive,
            registry,
            equator: Equator::default(),
            live: LiveObjects::default(),
            snapshots: HashMap::new(),
            transactions: Vec::new(),
            saving: HashSet::new(),
            staging: HashMap::new(),
            sticky: Meta::new(),
            user: std::env::var("USER").ok(),
            hostname: std::env::var("HOSTNAME").ok(),
        }
    }

    /// Replace the default equator, e.g. to plug in another hasher.
    pub fn with_equator(mut self, equator: Equator) -> Historian {
        self.equator = equator;
        self
    }

    /// The archive backing this historian.
    pub fn archive(&self) -> &dyn Archive {
        self.archive.as_ref()
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Register a type helper.
    pub fn register_type(&mut self, helper: Rc<dyn TypeHelper>) {
        self.registry.register(helper);
    }

    /// Hash a live object the way its snapshot hash is computed.
    pub fn hash(&self, obj: &Obj) -> Result<String> {
        let borrowed = obj.borrow();
        self.equator.hash_obj(&*borrowed, &self.registry)
    }

    /// Are the two objects equal under the registered equality?
    pub fn eq(&self, one: &Obj, other: &Obj) -> bool {
        if Rc::ptr_eq(one, other) {
            return true;
        }
        self.equator
            .eq_objs(&*one.borrow(), &*other.borrow(), &self.registry)
    }


    /// Save an object, producing its object id.  Saving an unchanged
    /// object is a no-op returning the same id.
    pub fn save(&mut self, obj: &Obj) -> Result<ObjId> {
        self.save_with_meta_opt(obj, None)
    }

    /// Save an object and set metadata on it in the same transaction.
    pub fn save_with_meta(&mut self, obj: &Obj, meta: Meta) -> Result<ObjId> {
        self.save_with_meta_opt(obj, Some(meta))
    }

    /// Save several objects, returning ids in the same order.
    pub fn save_many(&mut self, objs: &[Obj]) -> Result<Vec<ObjId>> {
        self.in_transaction(|hist| {
            objs.iter().map(|obj| hist.save(obj)).collect()
        })
    }

    fn save_with_meta_opt(&mut self, obj: &Obj, meta: Option<Meta>) -> Result<ObjId> {
        if self.is_snapshot_object(obj) {
            return Err(ChroniclerError::Modification(
                "cannot save a snapshot object, that would rewrite history".to_string(),
            ));
        }
        self.in_transaction(|hist| {
            let record = hist.save_object(obj)?;
            if let Some(meta) = meta {
                MetaStore::new(hist).update(record.obj_id, meta)?;
            }
            Ok(record.obj_id)
        })
    }

    pub(crate) fn save_object(&mut self, obj: &Obj) -> Result<DataRecord> {
        self.in_transaction(|hist| {
            let helper = hist.registry.helper_for_obj(obj)?;
            // An in-progress save in this transaction already has a record.
            if let Some(record) = hist.trans_record_for(obj) {
                return Ok(record);
            }
            let key = ObjKey::of(obj);
            if !hist.saving.insert(key) {
                return Err(ChroniclerError::Integrity(
                    "the object is already being saved, which suggests a circular \
                     reference; break the cycle with a reference"
                        .to_string(),
                ));
            }
            let result = hist.save_object_inner(obj, helper);
            hist.saving.remove(&key);
            result
        })
    }

    fn save_object_inner(
        &mut self,
        obj: &Obj,
        helper: Rc<dyn TypeHelper>,
    ) -> Result<DataRecord> {
        let current_hash = self.hash(obj)?;
        let existing = self.live.record_for(obj).cloned();
        match existing {
            None => {
                let obj_id = self.archive.create_archive_id();
                let builder = DataRecord::new_builder(TypeHelper::type_id(&*helper), obj_id)
                    .with_hash(current_hash);
                let builder = self.decorate_new_builder(obj, builder)?;
                let record = self.save_from_builder(obj, builder)?;
                if !self.sticky.is_empty() {
                    let sticky = self.sticky.clone();
                    MetaStore::new(self).update(record.obj_id, sticky)?;
                }
                Ok(record)
            }
            Some(record) => {
                if helper.immutable() {
                    debug!(obj_id = %record.obj_id, "immutable object saved again");
                    return Ok(record);
                }
                if self.is_unchanged(obj, &record, &current_hash)? {
                    return Ok(record);
                }
                let builder = record.child_builder().with_hash(current_hash);
                self.save_from_builder(obj, builder)
            }
        }
    }

    /// Compare the live object against its stored snapshot inside a
    /// nested transaction that is always discarded.
    fn is_unchanged(
        &mut self,
        obj: &Obj,
        record: &DataRecord,
        current_hash: &str,
    ) -> Result<bool> {
        if record.snapshot_hash.as_deref() != Some(current_hash) {
            return Ok(false);
        }
        self.transactions.push(Transaction::new());
        let outcome = Loader::snapshot(self).load_snapshot_record(record);
        let equal = match outcome {
            Ok(loaded) => Ok(self
                .equator
                .eq_objs(&*obj.borrow(), &*loaded.borrow(), &self.registry)),
            Err(err) => Err(err),
        };
        self.transactions.pop();
        equal
    }

    fn save_from_builder(
        &mut self,
        obj: &Obj,
        builder: DataRecordBuilder,
    ) -> Result<DataRecord> {
        self.in_transaction(move |hist| {
            // Reserve the snapshot id first so back-references to this
            // object resolve while its children are being encoded.
            hist.trans_mut().insert_live_ref(builder.snapshot_id(), obj);
            let (state, state_types) = Saver::new(hist).save_state(obj)?;
            let record = builder.with_state(state, state_types).build()?;
            hist.trans_mut().insert_live_object(obj, record.clone());
            hist.trans_mut().stage(Operation::Insert(record.clone()));
            Ok(record)
        })
    }

    /// Stamp user information and any staged creator/copy provenance onto
    /// a version-0 builder.
    fn decorate_new_builder(
        &mut self,
        obj: &Obj,
        builder: DataRecordBuilder,
    ) -> Result<DataRecordBuilder> {
        let mut builder = self.stamp_user_info(builder);
        let key = ObjKey::of(obj);
        let (created_by, copied_from) = match self.staging.get(&key) {
            Some(info) if info.target.strong_count() > 0 => (
                info.created_by.as_ref().and_then(WeakObj::upgrade),
                info.copied_from.as_ref().and_then(WeakObj::upgrade),
            ),
            _ => (None, None),
        };
        if let Some(creator) = created_by {
            let sid = Saver::new(self).ref_for(&creator)?;
            builder
                .extras
                .insert(extras::CREATED_BY.to_string(), Value::Id(sid.obj_id));
        }
        if let Some(source) = copied_from {
            if let Some(sid) = self.get_snapshot_id(&source) {
                builder
                    .extras
                    .insert(extras::COPIED_FROM.to_string(), sid.to_value());
            }
        }
        Ok(builder)
    }

    fn stamp_user_info(&self, mut builder: DataRecordBuilder) -> DataRecordBuilder {
        if let Some(user) = &self.user {
            builder
                .extras
                .insert(extras::USER.to_string(), Value::Str(user.clone()));
        }
        if let Some(hostname) = &self.hostname {
            builder
                .extras
                .insert(extras::HOSTNAME.to_string(), Value::Str(hostname.clone()));
        }
        builder
    }



    /// Load the latest live view of an object.  An already-live object is
    /// refreshed in place if the archive has a newer version, preserving
    /// its identity.
    pub fn load(&mut self, obj_id: ObjId) -> Result<Obj> {
        if self.is_deleted_in_trans(obj_id) {
            return Err(ChroniclerError::ObjectDeleted(obj_id));
        }
        if let Some(live) = self.get_obj_opt(obj_id) {
            let record = self.latest_record(obj_id)?;
            if record.is_deleted_record() {
                return Err(ChroniclerError::ObjectDeleted(obj_id));
            }
            let live_version = self.get_snapshot_id(&live).map(|sid| sid.version);
            if live_version != Some(record.version) {
                self.in_transaction(|hist| {
                    Loader::live(hist).update_from_record(&live, &record)
                })?;
            }
            return Ok(live);
        }
        let record = self.latest_record(obj_id)?;
        if record.is_deleted_record() {
            return Err(ChroniclerError::ObjectDeleted(obj_id));
        }
        self.in_transaction(|hist| Loader::live(hist).load_live_record(&record))
    }

    /// Load several objects, in order.
    pub fn load_many(&mut self, obj_ids: &[ObjId]) -> Result<Vec<Obj>> {
        obj_ids.iter().map(|obj_id| self.load(*obj_id)).collect()
    }

    /// Load a specific historical snapshot.  Snapshot objects are not
    /// tracked as live; every independent call produces a fresh one.
    pub fn load_snapshot(&mut self, sid: &SnapshotId) -> Result<Obj> {
        self.in_transaction(|hist| Loader::snapshot(hist).load_snapshot(sid))
    }

    /// Get a currently live object without touching the archive.
    pub fn get(&self, obj_id: ObjId) -> Result<Obj> {
        self.get_obj_opt(obj_id)
            .ok_or_else(|| ChroniclerError::NotFound(format!("no live object '{}'", obj_id)))
    }

    pub(crate) fn load_object_from_record(&mut self, record: &DataRecord) -> Result<Obj> {
        if self.is_deleted_in_trans(record.obj_id) || record.is_deleted_record() {
            return Err(ChroniclerError::ObjectDeleted(record.obj_id));
        }
        if let Some(obj) = self.get_obj_opt(record.obj_id) {
            return Ok(obj);
        }
        self.in_transaction(|hist| Loader::live(hist).load_live_record(record))
    }

    /// Update an object with the latest state in the archive.  Returns
    /// true iff the object was updated; an object never saved is as up to
    /// date as can be.
    pub fn sync(&mut self, obj: &Obj) -> Result<bool> {
        let Some(obj_id) = self.get_obj_id(obj) else {
            return Ok(false);
        };
        let record = match self.latest_record(obj_id) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        if record.is_deleted_record() {
            return Err(ChroniclerError::ObjectDeleted(obj_id));
        }
        if self.get_snapshot_id(obj).map(|sid| sid.version) == Some(record.version) {
            return Ok(false);
        }
        self.in_transaction(|hist| Loader::live(hist).update_from_record(obj, &record))?;
        Ok(true)
    }



    /// Delete a live object, staging a deletion tombstone.
    pub fn delete(&mut self, obj: &Obj) -> Result<()> {
        let obj_id = self.get_obj_id(obj).ok_or_else(|| {
            ChroniclerError::NotFound("the object is not known to the historian".to_string())
        })?;
        self.delete_many(&[obj_id])
    }

    /// Delete an object by id.
    pub fn delete_by_id(&mut self, obj_id: ObjId) -> Result<()> {
        self.delete_many(&[obj_id])
    }

    /// Delete several objects in one transaction.  Fails with a
    /// reference error if any still-live object references one of them.
    pub fn delete_many(&mut self, obj_ids: &[ObjId]) -> Result<()> {
        let mut records = Vec::with_capacity(obj_ids.len());
        for &obj_id in obj_ids {
            let cached = self
                .get_obj_opt(obj_id)
                .and_then(|obj| self.current_record_for(&obj));
            let record = match cached {
                Some(record) => record,
                None => self.latest_record(obj_id)?,
            };
            if record.is_deleted_record() {
                return Err(ChroniclerError::ObjectDeleted(obj_id));
            }
            records.push(record);
        }
        self.in_transaction(move |hist| {
            for record in records {
                let builder = hist.stamp_user_info(record.deleted_builder());
                let deleted = builder.build()?;
                hist.trans_mut().mark_deleted(record.obj_id);
                hist.trans_mut().stage(Operation::Insert(deleted));
                // Metadata is not versioned and goes with its object.
                hist.trans_mut().set_meta(record.obj_id, None);
            }
            Ok(())
        })
    }

    /// Delete the snapshots of already-deleted objects from the archive.
    /// Never runs automatically.
    pub fn purge(&mut self, deleted: bool, dry_run: bool) -> Result<PurgeResult> {
        let mut result = PurgeResult::default();
        if !deleted {
            return Ok(result);
        }
        let tombstones = self.archive.find(RecordQuery {
            filter: serde_json::json!({ "state": DELETED }),
            version: VersionSelect::Any,
            ..RecordQuery::default()
        })?;
        let obj_ids: BTreeSet<ObjId> = tombstones.map(|record| record.obj_id).collect();
        debug!(count = obj_ids.len(), "found deleted objects");
        for obj_id in obj_ids {
            result
                .deleted_purged
                .extend(self.archive.get_snapshot_ids(obj_id)?);
        }
        if !dry_run && !result.deleted_purged.is_empty() {
            let operations: Vec<Operation> = result
                .deleted_purged
                .iter()
                .map(|sid| Operation::Delete(*sid))
                .collect();
            self.archive.bulk_write(&operations)?;
        }
        Ok(result)
    }



    /// Snapshots from the history of an object, oldest first.
    pub fn history(
        &mut self,
        obj_id: ObjId,
        slice: impl Into<Slice>,
    ) -> Result<Vec<(SnapshotId, Obj)>> {
        let sids = self.archive.get_snapshot_ids(obj_id)?;
        let selected = slice.into().apply(&sids);
        let mut entries = Vec::with_capacity(selected.len());
        for sid in selected {
            entries.push((sid, self.load_snapshot(&sid)?));
        }
        Ok(entries)
    }

    /// Raw records from the history of an object, oldest first.
    pub fn history_records(
        &mut self,
        obj_id: ObjId,
        slice: impl Into<Slice>,
    ) -> Result<Vec<DataRecord>> {
        let sids = self.archive.get_snapshot_ids(obj_id)?;
        slice
            .into()
            .apply(&sids)
            .iter()
            .map(|sid| self.archive.load(sid))
            .collect()
    }

    /// Create a copy of the object.  Saving the copy produces a new
    /// object whose record carries a `_copied_from` provenance extra.
    pub fn copy(&mut self, obj: &Obj) -> Result<Obj> {
        let helper = self.registry.helper_for_obj(obj)?;
        let copy = {
            let borrowed = obj.borrow();
            helper
                .copy_instance(&*borrowed)
                .map_err(|err| ChroniclerError::Encoding(err.to_string()))?
        };
        self.staging.insert(
            ObjKey::of(&copy),
            StagedInfo {
                target: Rc::downgrade(&copy),
                created_by: None,
                copied_from: Some(Rc::downgrade(obj)),
            },
        );
        Ok(copy)
    }

    /// Record that `obj` was created by `creator`; stamped into the
    /// record at first save.
    pub fn mark_created_by(&mut self, obj: &Obj, creator: &Obj) {
        let entry = self
            .staging
            .entry(ObjKey::of(obj))
            .or_insert_with(|| StagedInfo {
                target: Rc::downgrade(obj),
                created_by: None,
                copied_from: None,
            });
        entry.target = Rc::downgrade(obj);
        entry.created_by = Some(Rc::downgrade(creator));
    }

    /// The id of the object that created this one, if recorded.
    pub fn created_by(&mut self, obj_id: ObjId) -> Result<Option<ObjId>> {
        if let Some(obj) = self.get_obj_opt(obj_id) {
            if let Some(record) = self.current_record_for(&obj) {
                return Ok(record.created_by());
            }
        }
        Ok(self.latest_record(obj_id)?.created_by())
    }

    /// Swap a live object for a new instance so subsequent saves of `new`
    /// continue the history of `old`.  Not allowed inside a transaction;
    /// the types must match.
    pub fn replace(&mut self, old: &Obj, new: &Obj) -> Result<()> {
        if !self.transactions.is_empty() {
            return Err(ChroniclerError::Modification(
                "cannot replace during a transaction".to_string(),
            ));
        }
        if Any::type_id(&*old.borrow()) != Any::type_id(&*new.borrow()) {
            return Err(ChroniclerError::Modification(
                "cannot replace an object with one of a different type".to_string(),
            ));
        }
        let record = self.live.record_for(old).cloned().ok_or_else(|| {
            ChroniclerError::NotFound("the object is not known to the historian".to_string())
        })?;
        self.live.remove(record.obj_id);
        self.live.insert(new, record);
        if let Some(info) = self.staging.remove(&ObjKey::of(old)) {
            self.staging.insert(
                ObjKey::of(new),
                StagedInfo {
                    target: Rc::downgrade(new),
                    ..info
                },
            );
        }
        Ok(())
    }



    /// Find objects matching the given criteria as a lazy stream.
    pub fn find(&mut self, find: Find) -> Result<ObjectIter<'_>> {
        let records = self.find_records(find)?;
        Ok(ObjectIter {
            hist: self,
            records,
            snapshots: false,
        })
    }

    /// Find objects among the historical snapshots.
    pub fn find_snapshots(&mut self, mut find: Find) -> Result<ObjectIter<'_>> {
        find.version.get_or_insert(VersionSelect::Any);
        let records = self.find_records(find)?;
        Ok(ObjectIter {
            hist: self,
            records,
            snapshots: true,
        })
    }

    /// Find raw records matching the given criteria.
    pub fn find_records(&self, find: Find) -> Result<Box<dyn Iterator<Item = DataRecord>>> {
        match self.build_query(&find)? {
            Some(query) => self.archive.find(query),
            None => Ok(Box::new(std::iter::empty())),
        }
    }

    pub(crate) fn find_records_filtered(&self, filter: Expr) -> Result<Vec<DataRecord>> {
        Ok(self
            .archive
            .find(RecordQuery::filtered(filter.to_query()))?
            .collect())
    }

    /// Count the records matching the given criteria.
    pub fn count(&self, find: Find) -> Result<u64> {
        match self.build_query(&find)? {
            Some(query) => self.archive.count(query),
            None => Ok(0),
        }
    }

    /// Distinct values of a record field among matching records.
    pub fn distinct(&self, field: &str, find: Find) -> Result<Vec<Json>> {
        match self.build_query(&find)? {
            Some(query) => self.archive.distinct(field, query),
            None => Ok(Vec::new()),
        }
    }

    /// Render a [Find] to an archive query.  `None` means the criteria
    /// cannot match anything (e.g. a metadata filter with no matches).
    fn build_query(&self, find: &Find) -> Result<Option<RecordQuery>> {
        let mut expr = find.filter.clone();
        if let Some(type_id) = find.obj_type {
            expr = expr.and(Field::new("type_id").eq(Json::String(type_id.to_string())));
        }
        let restriction = match &find.meta {
            Some(meta_filter) => {
                let matched = self
                    .archive
                    .meta_find(meta_filter, find.obj_ids.as_deref())?;
                let obj_ids: Vec<ObjId> = matched.into_iter().map(|(obj_id, _)| obj_id).collect();
                if obj_ids.is_empty() {
                    return Ok(None);
                }
                Some(obj_ids)
            }
            None => find.obj_ids.clone(),
        };
        if let Some(obj_ids) = restriction {
            let field = Field::new("obj_id");
            expr = expr.and(match obj_ids.as_slice() {
                [single] => field.eq(Json::String(single.to_string())),
                many => field.in_(many.iter().map(|obj_id| Json::String(obj_id.to_string()))),
            });
        }
        if let Some(state) = &find.state {
            if let Some(entries) = state.as_object() {
                for (key, condition) in entries {
                    expr = expr.and(Expr::Comparison {
                        field: format!("state.{}", key),
                        op: crate::query::Operator::Eq(condition.clone()),
                    });
                }
            }
        }
        if find.exclude_deleted {
            expr = expr.and(Field::new("state").ne(DELETED));
        }
        Ok(Some(RecordQuery {
            filter: expr.to_query(),
            version: find.version.unwrap_or_default(),
            limit: find.limit,
            skip: find.skip,
            sort: find.sort.clone(),
        }))
    }



    /// The object id for a live object, `None` if it is not known (or
    /// was deleted in the current transaction).
    pub fn get_obj_id(&self, obj: &Obj) -> Option<ObjId> {
        let sid = self.get_snapshot_id(obj)?;
        if self.is_deleted_in_trans(sid.obj_id) {
            return None;
        }
        Some(sid.obj_id)
    }

    /// The current snapshot id for a live object, consulting the
    /// transaction first, then the live map.
    pub fn get_snapshot_id(&self, obj: &Obj) -> Option<SnapshotId> {
        for trans in self.transactions.iter().rev() {
            if let Some(sid) = trans.sid_for(obj) {
                return Some(sid);
            }
        }
        self.live.record_for(obj).map(DataRecord::snapshot_id)
    }

    /// Has this object ever been saved?
    pub fn is_saved(&self, obj: &Obj) -> bool {
        self.get_obj_id(obj).is_some()
    }

    /// Interpret a textual value as an archive id.
    pub fn to_obj_id(&self, value: &str) -> Result<ObjId> {
        self.archive.construct_archive_id(value)
    }

    /// Was this object loaded as a historical snapshot?  Snapshots must
    /// not be saved.
    pub fn is_snapshot_object(&self, obj: &Obj) -> bool {
        self.snapshots
            .get(&ObjKey::of(obj))
            .map_or(false, |(weak, _)| weak.strong_count() > 0)
    }

    pub(crate) fn get_obj_opt(&self, obj_id: ObjId) -> Option<Obj> {
        for trans in self.transactions.iter().rev() {
            if trans.is_deleted(obj_id) {
                return None;
            }
            if let Some(obj) = trans.live_object(obj_id) {
                return Some(obj);
            }
        }
        self.live.object_for(obj_id)
    }

    pub(crate) fn current_record_for(&self, obj: &Obj) -> Option<DataRecord> {
        if let Some(record) = self.trans_record_for(obj) {
            return Some(record);
        }
        self.live.record_for(obj).cloned()
    }

    pub(crate) fn trans_record_for(&self, obj: &Obj) -> Option<DataRecord> {
        self.transactions
            .iter()
            .rev()
            .find_map(|trans| trans.record_for(obj).cloned())
    }

    pub(crate) fn trans_sid_for(&self, obj: &Obj) -> Option<SnapshotId> {
        self.transactions
            .iter()
            .rev()
            .find_map(|trans| trans.sid_for(obj))
    }

    pub(crate) fn is_deleted_in_trans(&self, obj_id: ObjId) -> bool {
        self.transactions
            .iter()
            .any(|trans| trans.is_deleted(obj_id))
    }

    pub(crate) fn latest_record(&self, obj_id: ObjId) -> Result<DataRecord> {
        self.archive
            .find(RecordQuery {
                filter: serde_json::json!({ "obj_id": obj_id.to_string() }),
                version: VersionSelect::Latest,
                limit: 1,
                ..RecordQuery::default()
            })?
            .next()
            .ok_or_else(|| ChroniclerError::NotFound(format!("object '{}'", obj_id)))
    }



    /// Run a closure inside a new transaction (nested, if one is already
    /// underway).  Returning an error discards the overlays; returning
    /// the [rollback] signal discards them silently and yields
    /// `Ok(None)`.
    pub fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Historian) -> Result<R>,
    ) -> Result<Option<R>> {
        self.transactions.push(Transaction::new());
        match f(self) {
            Ok(value) => {
                self.close_top()?;
                Ok(Some(value))
            }
            Err(ChroniclerError::RolledBack) => {
                self.transactions.pop();
                Ok(None)
            }
            Err(err) => {
                self.transactions.pop();
                Err(err)
            }
        }
    }

    /// Join the transaction currently underway, or run inside a fresh
    /// one.
    pub fn in_transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Historian) -> Result<R>,
    ) -> Result<R> {
        if self.transactions.is_empty() {
            match self.transaction(f)? {
                Some(value) => Ok(value),
                None => Err(ChroniclerError::RolledBack),
            }
        } else {
            f(self)
        }
    }

    /// Is a transaction currently underway?
    pub fn in_transaction_scope(&self) -> bool {
        !self.transactions.is_empty()
    }

    fn close_top(&mut self) -> Result<()> {
        if let Err(err) = self.closing_checks() {
            self.transactions.pop();
            return Err(err);
        }
        let trans = self
            .transactions
            .pop()
            .expect("the transaction stack cannot be empty here");
        match self.transactions.last_mut() {
            Some(parent) => {
                parent.merge(trans);
                Ok(())
            }
            None => self.commit_transaction(trans),
        }
    }

    /// Before a transaction closes, objects about to be tombstoned must
    /// not be referenced by any still-live record.
    fn closing_checks(&self) -> Result<()> {
        let Some(trans) = self.transactions.last() else {
            return Ok(());
        };
        let tombstoned: BTreeSet<ObjId> = trans
            .staged()
            .iter()
            .filter_map(|op| match op {
                Operation::Insert(record) if record.is_deleted_record() => Some(record.obj_id),
                _ => None,
            })
            .collect();
        if tombstoned.is_empty() {
            return Ok(());
        }
        let ids: Vec<ObjId> = tombstoned.iter().copied().collect();
        let edges = self
            .archive
            .get_obj_ref_graph(&ids, Direction::Incoming, Some(1))?;
        let references: BTreeSet<ObjId> = edges
            .into_iter()
            .filter(|(source, target)| {
                tombstoned.contains(target) && !tombstoned.contains(source)
            })
            .map(|(source, _)| source)
            .collect();
        if !references.is_empty() {
            return Err(ChroniclerError::Reference {
                message: "cannot perform the delete".to_string(),
                references,
            });
        }
        Ok(())
    }

    fn commit_transaction(&mut self, trans: Transaction) -> Result<()> {
        let (staged, live_objects, snapshots, metas, deleted) = trans.into_parts();
        if !staged.is_empty() {
            debug!(operations = staged.len(), "flushing transaction to the archive");
            self.archive.bulk_write(&staged)?;
        }
        for (obj, record) in live_objects {
            self.live.insert(&obj, record);
        }
        for obj_id in deleted {
            self.live.remove(obj_id);
        }
        for (sid, obj) in snapshots {
            self.snapshots
                .insert(ObjKey::of(&obj), (Rc::downgrade(&obj), sid));
        }
        self.live.prune();
        self.snapshots
            .retain(|_, (weak, _)| weak.strong_count() > 0);
        self.staging
            .retain(|_, info| info.target.strong_count() > 0);
        // Metadata goes last: it is the least important thing to lose.
        if !metas.is_empty() {
            self.archive.meta_set_many(metas)?;
        }
        Ok(())
    }

    pub(crate) fn trans_mut(&mut self) -> &mut Transaction {
        self.transactions
            .last_mut()
            .expect("no transaction is underway")
    }



    /// Metadata operations.
    pub fn meta(&mut self) -> MetaStore<'_> {
        MetaStore::new(self)
    }

    /// Reference-graph queries.
    pub fn references(&self) -> References<'_> {
        References::new(self)
    }

    /// Migration operations.
    pub fn migrations(&mut self) -> Migrations<'_> {
        Migrations::new(self)
    }

    /// Create a new file whose content will be stored in the archive's
    /// blob store when saved.
    pub fn create_file(&self, filename: Option<&str>, encoding: Option<&str>) -> File {
        File::new(
            filename.map(str::to_string),
            encoding.map(str::to_string),
        )
    }

    pub(crate) fn sticky_meta(&mut self) -> &mut Meta {
        &mut self.sticky
    }

}
