/*!
The historian's metadata namespace.

Metadata is a per-object document, not versioned, deleted with its
object.  Inside a transaction all changes are overlaid and flushed on
commit; *sticky* metadata is applied to every newly saved object.
*/

use serde_json::Value as Json;

use crate::archive::{Archive, Meta, SortDirection};
use crate::error::Result;
use crate::historian::Historian;
use crate::record::ObjId;

/// Groups the metadata related methods of the historian.
pub struct MetaStore<'h> {
    hist: &'h mut Historian,
}

impl<'h> MetaStore<'h> {
    pub(crate) fn new(hist: &'h mut Historian) -> Self {
        MetaStore { hist }
    }

    /// The metadata for an object, `None` if it has none.
    pub fn get(&mut self, obj_id: ObjId) -> Result<Option<Meta>> {
        for trans in self.hist.transactions.iter().rev() {
            if let Some(overlay) = trans.meta(obj_id) {
                return Ok(overlay.clone());
            }
        }
        self.hist.archive.meta_get(obj_id)
    }

    /// Set (or with `None` remove) the metadata for an object.
    pub fn set(&mut self, obj_id: ObjId, meta: Option<Meta>) -> Result<()> {
        if self.hist.in_transaction_scope() {
            self.hist.trans_mut().set_meta(obj_id, meta);
            return Ok(());
        }
        self.hist.archive.meta_set(obj_id, meta)
    }

    /// Merge the given entries into the metadata for an object.
    pub fn update(&mut self, obj_id: ObjId, meta: Meta) -> Result<()> {
        if self.hist.in_transaction_scope() {
            let mut merged = self.get(obj_id)?.unwrap_or_default();
            for (key, value) in meta {
                merged.insert(key, value);
            }
            self.hist.trans_mut().set_meta(obj_id, Some(merged));
            return Ok(());
        }
        self.hist.archive.meta_update(obj_id, meta)
    }

    /// Find metadata matching the filter; each result pairs the object
    /// id with its metadata document.
    pub fn find(
        &mut self,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<(ObjId, Meta)>> {
        self.hist.archive.meta_find(filter, obj_ids)
    }

    /// Distinct values found for a key within metadata documents.
    pub fn distinct(
        &mut self,
        key: &str,
        filter: &Json,
        obj_ids: Option<&[ObjId]>,
    ) -> Result<Vec<Json>> {
        self.hist.archive.meta_distinct(key, filter, obj_ids)
    }

    /// Create an index on the metadata.
    pub fn create_index(
        &mut self,
        keys: &[(String, SortDirection)],
        unique: bool,
        where_exist: bool,
    ) -> Result<()> {
        self.hist.archive.meta_create_index(keys, unique, where_exist)
    }

    /// Metadata applied to every newly saved object.
    pub fn sticky(&mut self) -> &mut Meta {
        self.hist.sticky_meta()
    }
}
