/*!
The [TypeHelper] contract that makes a user type storable.

A helper furnishes the historian with everything it needs to track a type:
a stable [TypeId], hashing and equality, encoding to and decoding from the
primitive tree, and the type's migration chain.  Helpers are registered
with the [TypeRegistry](crate::registry::TypeRegistry).
*/

use std::any;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::depositor::{Loader, Saver};
use crate::equator::HashWalk;
use crate::error::ChroniclerError;
use crate::migration::ObjectMigration;
use crate::object::{Node, Obj};

/// The stable, process-independent id of a storable type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TypeId(pub Uuid);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TypeId {
    type Err = ChroniclerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TypeId)
            .map_err(|_| ChroniclerError::InvalidId(s.to_string()))
    }
}

/// The interface a type must provide to be compatible with the historian.
pub trait TypeHelper {
    /// The stable id of this type, identical across processes.
    fn type_id(&self) -> TypeId;

    /// A human readable name for error messages and logs.
    fn type_name(&self) -> &'static str;

    /// The concrete Rust type this helper encodes.
    fn handled_type(&self) -> any::TypeId;

    /// Additional concrete types this helper is polymorphic over.  The
    /// registry indexes the helper under every one of these.
    fn extra_handled_types(&self) -> Vec<any::TypeId> {
        Vec::new()
    }

    /// Immutable types can be materialised before their children are
    /// decoded, which is what lets reference cycles terminate.  They are
    /// also never re-saved once stored.
    fn immutable(&self) -> bool {
        false
    }

    /// The head of this type's migration chain, if it has one.
    fn latest_migration(&self) -> Option<Rc<dyn ObjectMigration>> {
        None
    }

    /// The version of the latest migration, `None` when there is none.
    fn migration_version(&self) -> Option<u32> {
        self.latest_migration().map(|migration| migration.version())
    }

    /// Create a new instance from the encoded state.  Mutable types should
    /// return a blank instance to be filled by `load_instance_state`;
    /// immutable types receive a fully decoded state and may construct
    /// outright.
    fn new_instance(&self, state: &Node) -> anyhow::Result<Obj>;

    /// Feed the canonical byte chunks representing the instance to the
    /// hash walk.
    fn yield_hashables(&self, obj: &dyn any::Any, walk: &mut HashWalk<'_>)
        -> anyhow::Result<()>;

    /// Decide whether two instances of this type are equal.
    fn eq(&self, one: &dyn any::Any, other: &dyn any::Any) -> bool;

    /// Produce the instance's state as a tree of primitives and child
    /// objects.  Children are encoded transitively by the saver.
    fn save_instance_state(&self, obj: &dyn any::Any, saver: &mut Saver<'_>)
        -> anyhow::Result<Node>;

    /// Populate an instance from its decoded state.
    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        loader: &mut Loader<'_>,
    ) -> anyhow::Result<()>;

    /// Clone the instance.  Used by `Historian::copy`; reference leaves
    /// keep pointing at the same targets.
    fn copy_instance(&self, obj: &dyn any::Any) -> anyhow::Result<Obj>;
}

impl fmt::Debug for dyn TypeHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHelper({})", self.type_name())
    }
}
