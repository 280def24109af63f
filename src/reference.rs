/*!
The [ObjRef] reference type: a typed indirection that persists as a
snapshot id rather than an inlined state.

A reference is either *live*, holding a strong pointer to an object, or
*lazy*, holding the snapshot id it was loaded with.  Dereferencing a lazy
reference materialises the object through the historian and upgrades the
reference to live.  References are what break cycles during saves and
loads.
*/

use std::any::{self, Any};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use uuid::Uuid;

use crate::depositor::{Loader, Saver};
use crate::equator::HashWalk;
use crate::error::{ChroniclerError, Result};
use crate::helper::{TypeHelper, TypeId};
use crate::historian::Historian;
use crate::object::{new_obj, Node, Obj, ObjExt};
use crate::record::SnapshotId;
use crate::value::Value;

#[derive(Clone)]
enum RefState {
    Unset,
    Live(Obj),
    Lazy { sid: SnapshotId, snapshot: bool },
}

/// A reference to an object instance.
#[derive(Clone, Default)]
pub struct ObjRef {
    state: RefCell<RefState>,
}

impl Default for RefState {
    fn default() -> Self {
        RefState::Unset
    }
}

impl ObjRef {
    /// The stable type id references are stored under.  The reference
    /// graph is computed from schema entries carrying this id.
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x51a4_b9de_7c3e_4f86_9d0a_2b54_e8c1_f277));

    /// A reference to a live object.
    pub fn new(obj: Obj) -> ObjRef {
        ObjRef {
            state: RefCell::new(RefState::Live(obj)),
        }
    }

    /// A reference pointing at nothing.
    pub fn null() -> ObjRef {
        ObjRef::default()
    }

    /// A lazy reference to a stored snapshot.  `snapshot` selects whether
    /// dereferencing loads in snapshot space or through the live-object
    /// path.
    pub(crate) fn lazy(sid: SnapshotId, snapshot: bool) -> ObjRef {
        ObjRef {
            state: RefCell::new(RefState::Lazy { sid, snapshot }),
        }
    }

    /// Does this reference point at anything?
    pub fn is_set(&self) -> bool {
        !matches!(&*self.state.borrow(), RefState::Unset)
    }

    /// The snapshot id of a lazy reference, `None` once live or unset.
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        match &*self.state.borrow() {
            RefState::Lazy { sid, .. } => Some(*sid),
            _ => None,
        }
    }

    /// The held object of a live reference, without touching the archive.
    pub fn target(&self) -> Option<Obj> {
        match &*self.state.borrow() {
            RefState::Live(obj) => Some(Obj::clone(obj)),
            _ => None,
        }
    }

    /// Get the object being referenced, loading it if need be and
    /// upgrading this reference to live.
    pub fn fetch(&self, hist: &mut Historian) -> Result<Obj> {
        let (sid, snapshot) = match &*self.state.borrow() {
            RefState::Unset => {
                return Err(ChroniclerError::NotFound(
                    "cannot dereference a null reference".to_string(),
                ))
            }
            RefState::Live(obj) => return Ok(Obj::clone(obj)),
            RefState::Lazy { sid, snapshot } => (*sid, *snapshot),
        };
        let obj = if snapshot {
            hist.load_snapshot(&sid)?
        } else {
            hist.load(sid.obj_id)?
        };
        *self.state.borrow_mut() = RefState::Live(Obj::clone(&obj));
        Ok(obj)
    }

    /// Like [fetch](ObjRef::fetch) but first syncs a live target with the
    /// latest version in the archive.  A target that was never saved is
    /// up to date by definition.
    pub fn fetch_fresh(&self, hist: &mut Historian) -> Result<Obj> {
        let live = match &*self.state.borrow() {
            RefState::Live(obj) => Some(Obj::clone(obj)),
            _ => None,
        };
        if let Some(obj) = live {
            match hist.sync(&obj) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            return Ok(obj);
        }
        self.fetch(hist)
    }
}

/// Two references are equal iff they wrap the same identity: the same
/// live instance, or the same snapshot id.
impl PartialEq for ObjRef {
    fn eq(&self, other: &ObjRef) -> bool {
        match (&*self.state.borrow(), &*other.state.borrow()) {
            (RefState::Unset, RefState::Unset) => true,
            (RefState::Live(one), RefState::Live(two)) => Rc::ptr_eq(one, two),
            (RefState::Lazy { sid: one, .. }, RefState::Lazy { sid: two, .. }) => one == two,
            _ => false,
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            RefState::Unset => write!(f, "ref: null"),
            RefState::Live(obj) => write!(f, "ref: live@{:p}", Rc::as_ptr(obj)),
            RefState::Lazy { sid, .. } => write!(f, "ref: {}", sid),
        }
    }
}

impl From<Obj> for ObjRef {
    fn from(obj: Obj) -> Self {
        ObjRef::new(obj)
    }
}

/// The helper that stores [ObjRef]s.  Immutable, so that a decoded
/// reference can stand in for its target before the target exists, which
/// is what terminates cycles.
pub struct ObjRefHelper;

impl TypeHelper for ObjRefHelper {
    fn type_id(&self) -> TypeId {
        ObjRef::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "ObjRef"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<ObjRef>()
    }

    fn immutable(&self) -> bool {
        true
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(ObjRef::null()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let reference = downcast_ref(obj)?;
        let state = reference.state.borrow();
        match &*state {
            RefState::Unset => walk.value(&Value::Null),
            RefState::Live(target) => {
                walk.write(&(Rc::as_ptr(target).cast::<()>() as usize).to_le_bytes())
            }
            RefState::Lazy { sid, .. } => walk.value(&sid.to_value()),
        }
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        match (one.downcast_ref::<ObjRef>(), other.downcast_ref::<ObjRef>()) {
            (Some(one), Some(two)) => one == two,
            _ => false,
        }
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let reference = downcast_ref(obj)?;
        let target = {
            let state = reference.state.borrow();
            match &*state {
                RefState::Unset => return Ok(Node::null()),
                RefState::Lazy { sid, .. } => return Ok(Node::Value(sid.to_value())),
                RefState::Live(target) => Obj::clone(target),
            }
        };
        let sid = saver.ref_for(&target)?;
        Ok(Node::Value(sid.to_value()))
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        if state.is_null() {
            return Ok(());
        }
        let value = state
            .to_value()
            .ok_or_else(|| anyhow::anyhow!("reference state is not primitive"))?;
        let sid = SnapshotId::from_value(&value)
            .ok_or_else(|| anyhow::anyhow!("reference state is not a snapshot id"))?;
        *obj.borrow_mut_as::<ObjRef>()? = ObjRef::lazy(sid, loader.is_snapshot());
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        Ok(new_obj(downcast_ref(obj)?.clone()))
    }
}

fn downcast_ref(obj: &dyn Any) -> anyhow::Result<&ObjRef> {
    obj.downcast_ref::<ObjRef>()
        .ok_or_else(|| anyhow::anyhow!("object is not an ObjRef"))
}

/// The helper that lets [SnapshotId]s be stored directly inside states.
pub struct SnapshotIdHelper;

impl SnapshotIdHelper {
    /// The stable type id snapshot ids are stored under.
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x0bc3_7d5e_29aa_4f1c_b8e2_66d1_94f0_3c8d));
}

impl TypeHelper for SnapshotIdHelper {
    fn type_id(&self) -> TypeId {
        SnapshotIdHelper::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "SnapshotId"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<SnapshotId>()
    }

    fn immutable(&self) -> bool {
        true
    }

    fn new_instance(&self, state: &Node) -> anyhow::Result<Obj> {
        let value = state
            .to_value()
            .ok_or_else(|| anyhow::anyhow!("snapshot id state is not primitive"))?;
        let sid = SnapshotId::from_value(&value)
            .ok_or_else(|| anyhow::anyhow!("state is not a snapshot id"))?;
        Ok(new_obj(sid))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let sid = obj
            .downcast_ref::<SnapshotId>()
            .ok_or_else(|| anyhow::anyhow!("object is not a SnapshotId"))?;
        walk.value(&sid.to_value());
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        match (
            one.downcast_ref::<SnapshotId>(),
            other.downcast_ref::<SnapshotId>(),
        ) {
            (Some(one), Some(two)) => one == two,
            _ => false,
        }
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let sid = obj
            .downcast_ref::<SnapshotId>()
            .ok_or_else(|| anyhow::anyhow!("object is not a SnapshotId"))?;
        Ok(Node::Value(sid.to_value()))
    }

    fn load_instance_state(
        &self,
        _obj: &Obj,
        _state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        // Fully constructed by new_instance.
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        let sid = obj
            .downcast_ref::<SnapshotId>()
            .ok_or_else(|| anyhow::anyhow!("object is not a SnapshotId"))?;
        Ok(new_obj(*sid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjId;

    #[test]
    fn test_reference_equality() {
        let obj = new_obj(1u8);
        let one = ObjRef::new(Obj::clone(&obj));
        let two = ObjRef::new(Obj::clone(&obj));
        let other = ObjRef::new(new_obj(1u8));
        assert_eq!(one, two);
        assert_ne!(one, other);

        let sid = SnapshotId::new(ObjId::random(), 0);
        assert_eq!(ObjRef::lazy(sid, false), ObjRef::lazy(sid, true));
        assert_ne!(ObjRef::lazy(sid, false), one);
        assert_eq!(ObjRef::null(), ObjRef::null());
    }

    #[test]
    fn test_null_reference() {
        let reference = ObjRef::null();
        assert!(!reference.is_set());
        assert_eq!(reference.snapshot_id(), None);
        assert!(reference.target().is_none());
    }
}
