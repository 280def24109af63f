/*!
An [InMemoryArchive] that keeps everything in process memory.

It implements the full [Archive](super::Archive) contract, including the
query-document algebra, reference graphs and metadata indexes, and is what
the test suite runs against.
*/

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value as Json;

use crate::error::{ChroniclerError, Result};
use crate::record::{DataRecord, ObjId, SnapshotId};
use crate::reference::ObjRef;
use crate::transaction::Operation;

use super::{
    Archive, Direction, FileId, Meta, ObjEdge, RecordQuery, SnapshotEdge, SortDirection,
    VersionSelect,
};

/// The archive's own schema version.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
struct MetaIndex {
    keys: Vec<String>,
    unique: bool,
    where_exist: bool,
}

#[derive(Default)]
struct Store {
    records: BTreeMap<ObjId, BTreeMap<u32, DataRecord>>,
    metas: HashMap<ObjId, Meta>,
    meta_indexes: Vec<MetaIndex>,
    files: HashMap<FileId, Vec<u8>>,
}

impl Store {
    fn candidates(&self, version: VersionSelect) -> Vec<&DataRecord> {
        match version {
            VersionSelect::Latest => self
                .records
                .values()
                .filter_map(|versions| versions.values().next_back())
                .collect(),
            VersionSelect::Exact(version) => self
                .records
                .values()
                .filter_map(|versions| versions.get(&version))
                .collect(),
            VersionSelect::Any => self
                .records
                .values()
                .flat_map(|versions| versions.values())
                .collect(),
        }
    }

    fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::Insert(record) => {
                self.records
                    .entry(record.obj_id)
                    .or_default()
                    .insert(record.version, record.clone());
            }
            Operation::Update(sid, patch) => {
                if let Some(record) = self
                    .records
                    .get_mut(&sid.obj_id)
                    .and_then(|versions| versions.get_mut(&sid.version))
                {
                    if let Some(state) = &patch.state {
                        record.state = state.clone();
                    }
                    if let Some(state_types) = &patch.state_types {
                        record.state_types = Some(state_types.clone());
                    }
                    if let Some(hash) = &patch.snapshot_hash {
                        record.snapshot_hash = Some(hash.clone());
                    }
                }
            }
            Operation::Delete(sid) => {
                if let Some(versions) = self.records.get_mut(&sid.obj_id) {
                    versions.remove(&sid.version);
                    if versions.is_empty() {
                        self.records.remove(&sid.obj_id);
                        self.metas.remove(&sid.obj_id);
                    }
                }
            }
        }
    }

    /// The snapshot ids referenced by a record's state, read off its
    /// schema entries of the reference type.
    fn record_refs(record: &DataRecord) -> Vec<SnapshotId> {
        let mut refs = Vec::new();
        for entry in record.state_types.iter().flatten() {
            if entry.type_id != ObjRef::TYPE_ID {
                continue;
            }
            if let Some(value) = record.state.value_at(&entry.path) {
                if let Some(sid) = SnapshotId::from_value(value) {
                    refs.push(sid);
                }
            }
        }
        refs
    }

    fn snapshot_edges(&self) -> Vec<SnapshotEdge> {
        let mut edges = Vec::new();
        for versions in self.records.values() {
            for record in versions.values() {
                for target in Self::record_refs(record) {
                    edges.push((record.snapshot_id(), target));
                }
            }
        }
        edges
    }

    fn object_edges(&self) -> Vec<ObjEdge> {
        let mut edges = Vec::new();
        for versions in self.records.values() {
            if let Some(record) = versions.values().next_back() {
                if record.is_deleted_record() {
                    continue;
                }
                for target in Self::record_refs(record) {
                    edges.push((record.obj_id, target.obj_id));
                }
            }
        }
        edges
    }

    fn check_meta_unique(&self, obj_id: ObjId, meta: &Meta) -> Result<()> {
        for index in self.meta_indexes.iter().filter(|index| index.unique) {
            if index.where_exist && !index.keys.iter().all(|key| meta.contains_key(key)) {
                continue;
            }
            let values: Vec<Option<&Json>> =
                index.keys.iter().map(|key| meta.get(key)).collect();
            for (other_id, other) in &self.metas {
                if *other_id == obj_id {
                    continue;
                }
                if index.where_exist
                    && !index.keys.iter().all(|key| other.contains_key(key))
                {
                    continue;
                }
                let other_values: Vec<Option<&Json>> =
                    index.keys.iter().map(|key| other.get(key)).collect();
                if values == other_values {
                    return Err(ChroniclerError::DuplicateKey(format!(
                        "metadata index on {:?} violated by '{}'",
                        index.keys, other_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An archive that keeps records, metadata and file blobs in memory.
#[derive(Default)]
pub struct InMemoryArchive {
    store: RefCell<Store>,
}

impl InMemoryArchive {
    /// Create an empty in-memory archive.
    pub fn new() -> Self {
        InMemoryArchive::default()
    }
}

fn to_document(record: &DataRecord) -> Result<Json> {
    serde_json::to_value(record).map_err(|err| ChroniclerError::Encoding(err.to_string()))
}

/// Walk the edge list breadth-first from the given seeds, respecting
/// direction and depth, and return the edges touched.
fn traverse<T: Copy + Eq + std::hash::Hash>(
    edges: &[(T, T)],
    seeds: &[T],
    direction: Direction,
    max_depth: Option<u32>,
) -> Vec<(T, T)> {
    let mut visited: HashSet<T> = seeds.iter().copied().collect();
    let mut frontier: HashSet<T> = seeds.iter().copied().collect();
    let mut found: Vec<(T, T)> = Vec::new();
    let mut seen_edges: HashSet<(T, T)> = HashSet::new();
    let mut depth = 0u32;

    while !frontier.is_empty() && max_depth.map_or(true, |max| depth < max) {
        let mut next: HashSet<T> = HashSet::new();
        for edge in edges {
            let (source, target) = *edge;
            let outgoing = matches!(direction, Direction::Outgoing | Direction::Both)
                && frontier.contains(&source);
            let incoming = matches!(direction, Direction::Incoming | Direction::Both)
                && frontier.contains(&target);
            if !(outgoing || incoming) {
                continue;
            }
            if seen_edges.insert(*edge) {
                found.push(*edge);
            }
            if outgoing && !visited.contains(&target) {
                next.insert(target);
            }
            if incoming && !visited.contains(&source) {
                next.insert(source);
            }
        }
        visited.extend(next.iter().copied());
        frontier = next;
        depth += 1;
    }
    found
}


fn resolve<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Json::Object(map) => map.get(part)?,
            Json::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_cmp(one: &Json, other: &Json) -> Option<std::cmp::Ordering> {
    match (one, other) {
        (Json::Number(a), Json::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
        (Json::Bool(a), Json::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn json_eq(one: &Json, other: &Json) -> bool {
    if one == other {
        return true;
    }
    // Numbers compare by value regardless of integer/float representation.
    if let (Json::Number(a), Json::Number(b)) = (one, other) {
        return a.as_f64() == b.as_f64();
    }
    false
}

/// Equality with the null-matches-missing rule; a scalar target also
/// matches an array field containing it.
fn eq_condition(value: Option<&Json>, target: &Json) -> bool {
    if target.is_null() {
        return value.map_or(true, Json::is_null);
    }
    match value {
        None => false,
        Some(found) => {
            if json_eq(found, target) {
                return true;
            }
            match found {
                Json::Array(items) => items.iter().any(|item| json_eq(item, target)),
                _ => false,
            }
        }
    }
}

fn is_operator_doc(cond: &Json) -> bool {
    cond.as_object()
        .map_or(false, |map| map.keys().any(|key| key.starts_with('$')))
}

fn match_operators(value: Option<&Json>, operators: &serde_json::Map<String, Json>) -> bool {
    operators.iter().all(|(oper, operand)| match oper.as_str() {
        "$eq" => eq_condition(value, operand),
        "$ne" => !eq_condition(value, operand),
        "$gt" => value.and_then(|v| json_cmp(v, operand)).map_or(false, |ord| ord.is_gt()),
        "$gte" => value.and_then(|v| json_cmp(v, operand)).map_or(false, |ord| ord.is_ge()),
        "$lt" => value.and_then(|v| json_cmp(v, operand)).map_or(false, |ord| ord.is_lt()),
        "$lte" => value.and_then(|v| json_cmp(v, operand)).map_or(false, |ord| ord.is_le()),
        "$in" => operand
            .as_array()
            .map_or(false, |options| options.iter().any(|opt| eq_condition(value, opt))),
        "$nin" => operand
            .as_array()
            .map_or(false, |options| !options.iter().any(|opt| eq_condition(value, opt))),
        "$exists" => operand.as_bool().map_or(false, |flag| flag == value.is_some()),
        "$elemMatch" => value.and_then(Json::as_array).map_or(false, |items| {
            items.iter().any(|item| {
                if is_operator_doc(operand) {
                    match_operators(Some(item), operand.as_object().unwrap())
                } else {
                    matches(item, operand)
                }
            })
        }),
        "$not" => !match_condition(value, operand),
        _ => false,
    })
}

fn match_condition(value: Option<&Json>, cond: &Json) -> bool {
    if is_operator_doc(cond) {
        match_operators(value, cond.as_object().unwrap())
    } else {
        eq_condition(value, cond)
    }
}

/// Does the document match the filter?
fn matches(doc: &Json, filter: &Json) -> bool {
    let Some(entries) = filter.as_object() else {
        return false;
    };
    entries.iter().all(|(key, cond)| match key.as_str() {
        "$and" => cond
            .as_array()
            .map_or(false, |parts| parts.iter().all(|part| matches(doc, part))),
        "$or" => cond
            .as_array()
            .map_or(false, |parts| parts.iter().any(|part| matches(doc, part))),
        "$nor" => cond
            .as_array()
            .map_or(false, |parts| !parts.iter().any(|part| matches(doc, part))),
        "$not" => !matches(doc, cond),
        field => match_condition(resolve(doc, field), cond),
    })
}


impl Archive for InMemoryArchive {
    fn create_archive_id(&self) -> ObjId {
        ObjId::random()
    }

    fn construct_archive_id(&self, value: &str) -> Result<ObjId> {
        value.parse()
    }

    fn save(&self, record: DataRecord) -> Result<()> {
        self.bulk_write(&[Operation::Insert(record)])
    }

    fn bulk_write(&self, operations: &[Operation]) -> Result<()> {
        let mut store = self.store.borrow_mut();
        // Validate the whole batch before anything is applied so a
        // failure leaves the archive untouched.
        let mut incoming: HashSet<SnapshotId> = HashSet::new();
        for operation in operations {
            match operation {
                Operation::Insert(record) => {
                    let sid = record.snapshot_id();
                    let exists = store
                        .records
                        .get(&record.obj_id)
                        .map_or(false, |versions| versions.contains_key(&record.version));
                    if exists || !incoming.insert(sid) {
                        return Err(ChroniclerError::Modification(format!(
                            "snapshot '{}' already exists, rewriting history is not allowed",
                            sid
                        )));
                    }
                    if record.version > 0 {
                        let previous = store
                            .records
                            .get(&record.obj_id)
                            .and_then(|versions| versions.get(&(record.version - 1)));
                        if previous.map_or(false, DataRecord::is_deleted_record) {
                            return Err(ChroniclerError::Integrity(format!(
                                "object '{}' is deleted, no record may follow",
                                record.obj_id
                            )));
                        }
                    }
                }
                Operation::Update(sid, _) | Operation::Delete(sid) => {
                    let exists = store
                        .records
                        .get(&sid.obj_id)
                        .map_or(false, |versions| versions.contains_key(&sid.version));
                    if !exists && !incoming.contains(sid) {
                        return Err(ChroniclerError::NotFound(format!(
                            "snapshot '{}'",
                            sid
                        )));
                    }
                }
            }
        }
        for operation in operations {
            store.apply(operation);
        }
        Ok(())
    }

    fn load(&self, sid: &SnapshotId) -> Result<DataRecord> {
        self.store
            .borrow()
            .records
            .get(&sid.obj_id)
            .and_then(|versions| versions.get(&sid.version))
            .cloned()
            .ok_or_else(|| ChroniclerError::NotFound(format!("snapshot '{}'", sid)))
    }

    fn find(&self, query: RecordQuery) -> Result<Box<dyn Iterator<Item = DataRecord>>> {
        let store = self.store.borrow();
        let mut found: Vec<(Json, DataRecord)> = Vec::new();
        for record in store.candidates(query.version) {
            let doc = to_document(record)?;
            if matches(&doc, &query.filter) {
                found.push((doc, record.clone()));
            }
        }
        if !query.sort.is_empty() {
            found.sort_by(|(a, _), (b, _)| {
                for (field, direction) in &query.sort {
                    let ordering = json_cmp(
                        resolve(a, field).unwrap_or(&Json::Null),
                        resolve(b, field).unwrap_or(&Json::Null),
                    )
                    .unwrap_or(std::cmp::Ordering::Equal);
                    let ordering = match direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if !ordering.is_eq() {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        let records = found
            .into_iter()
            .map(|(_, record)| record)
            .skip(query.skip as usize);
        let records: Vec<DataRecord> = if query.limit > 0 {
            records.take(query.limit as usize).collect()
        } else {
            records.collect()
        };
        Ok(Box::new(records.into_iter()))
    }

    fn count(&self, query: RecordQuery) -> Result<u64> {
        Ok(self.find(query)?.count() as u64)
    }

    fn distinct(&self, field: &str, query: RecordQuery) -> Result<Vec<Json>> {
        let mut values: Vec<Json> = Vec::new();
        for record in self.find(query)? {
            let doc = to_document(&record)?;
            let Some(value) = resolve(&doc, field) else {
                continue;
            };
            // Arrays unwind into their elements, as document stores do.
            let candidates: Vec<&Json> = match value {
                Json::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for candidate in candidates {
                if !values.contains(candidate) {
                    values.push(candidate.clone());
                }
            }
        }
        Ok(values)
    }

    fn get_snapshot_ids(&self, obj_id: ObjId) -> Result<Vec<SnapshotId>> {
        Ok(self
            .store
            .borrow()
            .records
            .get(&obj_id)
            .map(|versions| {
                versions
                    .keys()
                    .map(|version| SnapshotId::new(obj_id, *version))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_obj_ref_graph(
        &self,
        obj_ids: &[ObjId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<ObjEdge>> {
        let edges = self.store.borrow().object_edges();
        Ok(traverse(&edges, obj_ids, direction, max_depth))
    }

    fn get_snapshot_ref_graph(
        &self,
        sids: &[SnapshotId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<SnapshotEdge>> {
        let edges = self.store.borrow().snapshot_edges();
        Ok(traverse(&edges, sids, direction, max_depth))
    }

    fn meta_get(&self, obj_id: ObjId) -> Result<Option<Meta>> {
        Ok(self.store.borrow().metas.get(&obj_id).cloned())
    }

    fn meta_set(&self, obj_id: ObjId, meta: Option<Meta>) -> Result<()> {
        let mut store = self.store.borrow_mut();
        match meta {
            Some(meta) => {
                store.check_meta_unique(obj_id, &meta)?;
                store.metas.insert(obj_id, meta);
            }
            None => {
                store.metas.remove(&obj_id);
            }
        }
        Ok(())
    }

    fn meta_set_many(&self, metas: HashMap<ObjId, Option<Meta>>) -> Result<()> {
        {
            let store = self.store.borrow();
            for (obj_id, meta) in &metas {
                if let Some(meta) = meta {
                    store.check_meta_unique(*obj_id, meta)?;
                }
            }
        }
        let mut store = self.store.borrow_mut();
        for (obj_id, meta) in metas {
            match meta {
                Some(meta) => {
                    store.metas.insert(obj_id, meta);
                }
                None => {
                    store.metas.remove(&obj_id);
                }
            }
        }
        Ok(())
    }

    fn meta_update(&self, obj_id: ObjId, meta: Meta) -> Result<()> {
        let mut merged = self
            .store
            .borrow()
            .metas
            .get(&obj_id)
            .cloned()
            .unwrap_or_default();
        for (key, value) in meta {
            merged.insert(key, value);
        }
        self.meta_set(obj_id, Some(merged))
    }

    fn meta_find(
        &self,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<(ObjId, Meta)>> {
        let store = self.store.borrow();
        let mut found = Vec::new();
        for (obj_id, meta) in &store.metas {
            if let Some(restriction) = obj_ids {
                if !restriction.contains(obj_id) {
                    continue;
                }
            }
            let doc = Json::Object(meta.clone());
            if matches(&doc, filter) {
                found.push((*obj_id, meta.clone()));
            }
        }
        Ok(found)
    }

    fn meta_distinct(
        &self,
        key: &str,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<Json>> {
        let mut values: Vec<Json> = Vec::new();
        for (_, meta) in self.meta_find(filter, obj_ids)? {
            let doc = Json::Object(meta);
            if let Some(value) = resolve(&doc, key) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }

    fn meta_create_index(
        &self,
        keys: &[(String, SortDirection)],
        unique: bool,
        where_exist: bool,
    ) -> Result<()> {
        self.store.borrow_mut().meta_indexes.push(MetaIndex {
            keys: keys.iter().map(|(key, _)| key.clone()).collect(),
            unique,
            where_exist,
        });
        Ok(())
    }

    fn create_file_id(&self) -> FileId {
        FileId::random()
    }

    fn write_file(&self, file_id: &FileId, data: &[u8]) -> Result<()> {
        self.store
            .borrow_mut()
            .files
            .insert(*file_id, data.to_vec());
        Ok(())
    }

    fn read_file(&self, file_id: &FileId) -> Result<Vec<u8>> {
        self.store
            .borrow()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ChroniclerError::NotFound(format!("file '{}'", file_id)))
    }

    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }
}

impl std::fmt::Debug for InMemoryArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.borrow();
        write!(
            f,
            "InMemoryArchive({} objects, {} metas, {} files)",
            store.records.len(),
            store.metas.len(),
            store.files.len()
        )
    }
}
