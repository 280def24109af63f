/*!
The [TypeRegistry]: an open map from type ids and Rust types to their
[TypeHelper]s.
*/

use std::any::{self, Any};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{ChroniclerError, Result};
use crate::helper::{TypeHelper, TypeId};
use crate::object::Obj;

/// Holds the helpers that furnish the historian with the necessary
/// methods to store and track objects in the archive.
#[derive(Default)]
pub struct TypeRegistry {
    helpers: HashMap<any::TypeId, Rc<dyn TypeHelper>>,
    by_type_id: HashMap<TypeId, Rc<dyn TypeHelper>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Register a helper.  The helper is indexed under its primary type
    /// and under every extra type it declares itself polymorphic over;
    /// registering again for the same type id replaces the previous
    /// helper.
    pub fn register(&mut self, helper: Rc<dyn TypeHelper>) {
        for handled in std::iter::once(helper.handled_type())
            .chain(helper.extra_handled_types())
        {
            self.helpers.insert(handled, Rc::clone(&helper));
        }
        self.by_type_id.insert(TypeHelper::type_id(&*helper), helper);
    }

    /// Is the given Rust type registered?
    pub fn contains(&self, rust_type: any::TypeId) -> bool {
        self.helpers.contains_key(&rust_type)
    }

    /// The helper for a Rust type.  Exact matches win; the polymorphic
    /// fallbacks were indexed at registration time.
    pub fn helper_for_type(&self, rust_type: any::TypeId) -> Result<Rc<dyn TypeHelper>> {
        self.helpers.get(&rust_type).cloned().ok_or_else(|| {
            ChroniclerError::UnknownType(
                "type has not been registered with the historian".to_string(),
            )
        })
    }

    /// The helper for a live object.
    pub fn helper_for_obj(&self, obj: &Obj) -> Result<Rc<dyn TypeHelper>> {
        self.helper_for_type(Any::type_id(&*obj.borrow()))
    }

    /// The helper registered under a stable type id.
    pub fn helper_for_type_id(&self, type_id: TypeId) -> Result<Rc<dyn TypeHelper>> {
        self.by_type_id.get(&type_id).cloned().ok_or_else(|| {
            ChroniclerError::UnknownType(format!("type id '{}' is not known", type_id))
        })
    }

    /// The stable id registered for a Rust type, if any.
    pub fn type_id_for(&self, rust_type: any::TypeId) -> Option<TypeId> {
        self.helpers
            .get(&rust_type)
            .map(|helper| TypeHelper::type_id(&**helper))
    }

    /// All helpers that carry a migration chain.  Used to find records in
    /// need of migration.
    pub fn helpers_with_migrations(&self) -> Vec<Rc<dyn TypeHelper>> {
        self.by_type_id
            .values()
            .filter(|helper| helper.migration_version().is_some())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Car, CarHelper};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TypeRegistry::new();
        assert!(!registry.contains(any::TypeId::of::<Car>()));
        registry.register(Rc::new(CarHelper));

        let helper = registry.helper_for_type(any::TypeId::of::<Car>()).unwrap();
        assert_eq!(TypeHelper::type_id(&*helper), Car::TYPE_ID);
        let by_id = registry.helper_for_type_id(Car::TYPE_ID).unwrap();
        assert_eq!(by_id.type_name(), helper.type_name());
        assert_eq!(
            registry.type_id_for(any::TypeId::of::<Car>()),
            Some(Car::TYPE_ID)
        );
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::new();
        let err = registry
            .helper_for_type(any::TypeId::of::<Car>())
            .unwrap_err();
        assert!(matches!(err, ChroniclerError::UnknownType(_)));
    }
}
