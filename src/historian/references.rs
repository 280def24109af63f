/*!
The historian's reference-graph namespace: who references whom, in
object or snapshot space.
*/

use crate::archive::{Archive, Direction, ObjEdge, SnapshotEdge};
use crate::error::Result;
use crate::historian::Historian;
use crate::record::{ObjId, SnapshotId};

/// Queries over the reference graph maintained from the reference leaves
/// of stored records.
pub struct References<'h> {
    hist: &'h Historian,
}

impl<'h> References<'h> {
    pub(crate) fn new(hist: &'h Historian) -> Self {
        References { hist }
    }

    /// The objects referred to by the latest version of the given
    /// object.
    pub fn references(&self, obj_id: ObjId) -> Result<Vec<ObjId>> {
        let edges =
            self.hist
                .archive
                .get_obj_ref_graph(&[obj_id], Direction::Outgoing, Some(1))?;
        Ok(edges
            .into_iter()
            .filter(|(source, _)| *source == obj_id)
            .map(|(_, target)| target)
            .collect())
    }

    /// The objects whose latest version refers to the given object.
    pub fn referenced_by(&self, obj_id: ObjId) -> Result<Vec<ObjId>> {
        let edges =
            self.hist
                .archive
                .get_obj_ref_graph(&[obj_id], Direction::Incoming, Some(1))?;
        Ok(edges
            .into_iter()
            .filter(|(_, target)| *target == obj_id)
            .map(|(source, _)| source)
            .collect())
    }

    /// The snapshots referred to by the given snapshot.
    pub fn snapshot_references(&self, sid: &SnapshotId) -> Result<Vec<SnapshotId>> {
        let edges =
            self.hist
                .archive
                .get_snapshot_ref_graph(&[*sid], Direction::Outgoing, Some(1))?;
        Ok(edges
            .into_iter()
            .filter(|(source, _)| source == sid)
            .map(|(_, target)| target)
            .collect())
    }

    /// The snapshots that refer to the given snapshot.
    pub fn snapshot_referenced_by(&self, sid: &SnapshotId) -> Result<Vec<SnapshotId>> {
        let edges =
            self.hist
                .archive
                .get_snapshot_ref_graph(&[*sid], Direction::Incoming, Some(1))?;
        Ok(edges
            .into_iter()
            .filter(|(_, target)| target == sid)
            .map(|(source, _)| source)
            .collect())
    }

    /// The transitive reference closure around the given objects.
    pub fn get_obj_ref_graph(
        &self,
        obj_ids: &[ObjId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<ObjEdge>> {
        self.hist.archive.get_obj_ref_graph(obj_ids, direction, max_depth)
    }

    /// The transitive reference closure around the given snapshots.
    pub fn get_snapshot_ref_graph(
        &self,
        sids: &[SnapshotId],
        direction: Direction,
        max_depth: Option<u32>,
    ) -> Result<Vec<SnapshotEdge>> {
        self.hist.archive.get_snapshot_ref_graph(sids, direction, max_depth)
    }
}
