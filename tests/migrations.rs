//! Tests of schema migrations: lazy per-record migration on load, bulk
//! migration, and the version guard.

use std::any::{self, Any};
use std::rc::Rc;

use chronicler::depositor::{Loader, Saver};
use chronicler::equator::HashWalk;
use chronicler::testing;
use chronicler::{
    new_obj, Archive, ChroniclerError, Find, Node, Obj, ObjExt, ObjectMigration, SnapshotId,
    StateType, TypeHelper, TypeId, Value, ValuePath,
};
use uuid::Uuid;

/// A car whose storage schema has evolved over time.
#[derive(Debug, Clone, PartialEq, Default)]
struct MigCar {
    colour: String,
    make: String,
    reg: Option<String>,
}

const MIG_CAR_TYPE_ID: TypeId = TypeId(Uuid::from_u128(0x5e07_5d62_4457_2f82_3ed9_3274_0000_0001));

fn downcast(obj: &dyn Any) -> anyhow::Result<&MigCar> {
    obj.downcast_ref::<MigCar>()
        .ok_or_else(|| anyhow::anyhow!("object is not a MigCar"))
}

/// Common pieces shared by every version of the helper.
macro_rules! mig_car_helper_base {
    () => {
        fn type_id(&self) -> TypeId {
            MIG_CAR_TYPE_ID
        }

        fn type_name(&self) -> &'static str {
            "MigCar"
        }

        fn handled_type(&self) -> any::TypeId {
            any::TypeId::of::<MigCar>()
        }

        fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
            Ok(new_obj(MigCar::default()))
        }

        fn yield_hashables(
            &self,
            obj: &dyn Any,
            walk: &mut HashWalk<'_>,
        ) -> anyhow::Result<()> {
            let car = downcast(obj)?;
            walk.value(&Value::Str(car.colour.clone()));
            walk.value(&Value::Str(car.make.clone()));
            Ok(())
        }

        fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
            matches!(
                (one.downcast_ref::<MigCar>(), other.downcast_ref::<MigCar>()),
                (Some(one), Some(two)) if one == two
            )
        }

        fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
            Ok(new_obj(downcast(obj)?.clone()))
        }
    };
}

/// The original schema: state is the list `[colour, make]`.
struct ListCarHelper;

impl TypeHelper for ListCarHelper {
    mig_car_helper_base!();

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let car = downcast(obj)?;
        Ok([Node::from(car.colour.clone()), Node::from(car.make.clone())]
            .into_iter()
            .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let mut car = obj.borrow_mut_as::<MigCar>()?;
        car.colour = state.element(0)?.as_str()?.to_string();
        car.make = state.element(1)?.as_str()?.to_string();
        Ok(())
    }
}

/// Upgrade the list form to a mapping.
struct ToDict;

impl ObjectMigration for ToDict {
    fn version(&self) -> u32 {
        1
    }

    fn upgrade(&self, state: Node, _loader: &mut Loader<'_>) -> anyhow::Result<Node> {
        let colour = state.element(0)?.as_str()?.to_string();
        let make = state.element(1)?.as_str()?.to_string();
        Ok([
            ("colour".to_string(), Node::from(colour)),
            ("make".to_string(), Node::from(make)),
        ]
        .into_iter()
        .collect())
    }
}

/// The second schema: state is a mapping.
struct DictCarHelper;

impl TypeHelper for DictCarHelper {
    mig_car_helper_base!();

    fn latest_migration(&self) -> Option<Rc<dyn ObjectMigration>> {
        Some(Rc::new(ToDict))
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let car = downcast(obj)?;
        Ok([
            ("colour".to_string(), Node::from(car.colour.clone())),
            ("make".to_string(), Node::from(car.make.clone())),
        ]
        .into_iter()
        .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let mut car = obj.borrow_mut_as::<MigCar>()?;
        car.colour = state.entry("colour")?.as_str()?.to_string();
        car.make = state.entry("make")?.as_str()?.to_string();
        Ok(())
    }
}

/// Add a registration plate with a default.
struct AddReg;

impl ObjectMigration for AddReg {
    fn version(&self) -> u32 {
        2
    }

    fn previous(&self) -> Option<Rc<dyn ObjectMigration>> {
        Some(Rc::new(ToDict))
    }

    fn upgrade(&self, state: Node, _loader: &mut Loader<'_>) -> anyhow::Result<Node> {
        match state {
            Node::Map(mut map) => {
                map.insert("reg".to_string(), Node::from("unknown"));
                Ok(Node::Map(map))
            }
            other => Err(anyhow::anyhow!("expected a mapping, got {:?}", other)),
        }
    }
}

/// The third schema: mapping with a registration plate.
struct RegCarHelper;

impl TypeHelper for RegCarHelper {
    mig_car_helper_base!();

    fn latest_migration(&self) -> Option<Rc<dyn ObjectMigration>> {
        Some(Rc::new(AddReg))
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let car = downcast(obj)?;
        Ok([
            ("colour".to_string(), Node::from(car.colour.clone())),
            ("make".to_string(), Node::from(car.make.clone())),
            (
                "reg".to_string(),
                car.reg
                    .as_ref()
                    .map_or(Node::null(), |reg| Node::from(reg.clone())),
            ),
        ]
        .into_iter()
        .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let mut car = obj.borrow_mut_as::<MigCar>()?;
        car.colour = state.entry("colour")?.as_str()?.to_string();
        car.make = state.entry("make")?.as_str()?.to_string();
        car.reg = match state.entry("reg")? {
            node if node.is_null() => None,
            node => Some(node.as_str()?.to_string()),
        };
        Ok(())
    }
}

fn save_list_car(
    historian: &mut chronicler::Historian,
    colour: &str,
    make: &str,
) -> chronicler::ObjId {
    historian.register_type(Rc::new(ListCarHelper));
    let car = new_obj(MigCar {
        colour: colour.to_string(),
        make: make.to_string(),
        reg: None,
    });
    historian.save(&car).unwrap()
}

#[test]
fn test_simple_migration() {
    let mut historian = testing::historian();
    let car_id = save_list_car(&mut historian, "red", "ferrari");

    // Now change to the dict schema.
    historian.register_type(Rc::new(DictCarHelper));
    let loaded = historian.load(car_id).unwrap();
    let car = loaded.borrow_as::<MigCar>().unwrap();
    assert_eq!(car.colour, "red");
    assert_eq!(car.make, "ferrari");
    drop(car);

    // The archive was rewritten under the migrated schema.
    let found: Vec<_> = historian
        .find_records(Find::everything().with_state(serde_json::json!({"colour": "red"})))
        .unwrap()
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].state_types.as_ref().unwrap()[0].version,
        Some(1)
    );
}

#[test]
fn test_multiple_migrations() {
    let mut historian = testing::historian();
    let car_id = save_list_car(&mut historian, "red", "ferrari");

    // Skip straight to the reg schema; both steps apply in order.
    historian.register_type(Rc::new(RegCarHelper));
    let loaded = historian.load(car_id).unwrap();
    let car = loaded.borrow_as::<MigCar>().unwrap();
    assert_eq!(car.colour, "red");
    assert_eq!(car.make, "ferrari");
    assert_eq!(car.reg.as_deref(), Some("unknown"));
}

#[test]
fn test_migrate_all() {
    let mut historian = testing::historian();
    let one = save_list_car(&mut historian, "red", "ferrari");
    let two = save_list_car(&mut historian, "brown", "honda");

    historian.register_type(Rc::new(DictCarHelper));
    let migratable = historian.migrations().find_migratable_records().unwrap();
    assert_eq!(migratable.len(), 2);

    let mut migrated = historian.migrations().migrate_all().unwrap();
    migrated.sort();
    let mut expected = vec![SnapshotId::new(one, 0), SnapshotId::new(two, 0)];
    expected.sort();
    assert_eq!(migrated, expected);

    // Everything is up to date now.
    assert!(historian
        .migrations()
        .find_migratable_records()
        .unwrap()
        .is_empty());
    let found = historian
        .count(Find::everything().with_state(serde_json::json!({"make": "honda"})))
        .unwrap();
    assert_eq!(found, 1);
}

#[test]
fn test_migrating_snapshot() {
    let mut historian = testing::historian();
    historian.register_type(Rc::new(ListCarHelper));
    let car = new_obj(MigCar {
        colour: "yellow".to_string(),
        make: "bugatti".to_string(),
        reg: None,
    });
    let car_id = historian.save(&car).unwrap();
    car.borrow_mut_as::<MigCar>().unwrap().colour = "brown".to_string();
    historian.save(&car).unwrap();
    drop(car);

    historian.register_type(Rc::new(DictCarHelper));
    let snapshot = historian
        .load_snapshot(&SnapshotId::new(car_id, 0))
        .unwrap();
    let old = snapshot.borrow_as::<MigCar>().unwrap();
    assert_eq!(old.colour, "yellow");
    assert_eq!(old.make, "bugatti");
    drop(old);

    let current = historian.load(car_id).unwrap();
    assert_eq!(current.borrow_as::<MigCar>().unwrap().colour, "brown");
}

#[test]
fn test_version_error_when_code_is_older() {
    let mut historian = testing::historian();
    historian.register_type(Rc::new(DictCarHelper));

    // A record from the future: saved under migration version 9.
    let record = chronicler::DataRecord::new_builder(
        MIG_CAR_TYPE_ID,
        historian.archive().create_archive_id(),
    )
    .with_state(
        Value::Map(
            [
                ("colour".to_string(), Value::Str("red".to_string())),
                ("make".to_string(), Value::Str("ferrari".to_string())),
            ]
            .into_iter()
            .collect(),
        ),
        vec![StateType {
            path: ValuePath::root(),
            type_id: MIG_CAR_TYPE_ID,
            version: Some(9),
        }],
    )
    .with_hash("from-the-future".to_string())
    .build()
    .unwrap();
    let obj_id = record.obj_id;
    historian.archive().save(record).unwrap();

    let err = historian.load(obj_id).err().unwrap();
    assert!(matches!(err, ChroniclerError::Version(_)));
}

#[test]
fn test_failing_migration_rolls_back() {
    let mut historian = testing::historian();
    let car_id = save_list_car(&mut historian, "red", "ferrari");

    // The reg migration expects a mapping; starting from a bogus record
    // version makes ToDict's output unacceptable to a broken chain.  A
    // list state fed straight into AddReg fails.
    struct BrokenHelper;
    impl TypeHelper for BrokenHelper {
        mig_car_helper_base!();

        fn latest_migration(&self) -> Option<Rc<dyn ObjectMigration>> {
            // AddReg without its ToDict predecessor: the saved list
            // state reaches it unconverted.
            Some(Rc::new(BrokenAddReg))
        }

        fn save_instance_state(
            &self,
            obj: &dyn Any,
            _saver: &mut Saver<'_>,
        ) -> anyhow::Result<Node> {
            let car = downcast(obj)?;
            Ok([("colour".to_string(), Node::from(car.colour.clone()))]
                .into_iter()
                .collect())
        }

        fn load_instance_state(
            &self,
            _obj: &Obj,
            _state: &Node,
            _loader: &mut Loader<'_>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }
    struct BrokenAddReg;
    impl ObjectMigration for BrokenAddReg {
        fn version(&self) -> u32 {
            1
        }

        fn upgrade(&self, state: Node, _loader: &mut Loader<'_>) -> anyhow::Result<Node> {
            match state {
                Node::Map(map) => Ok(Node::Map(map)),
                _ => Err(anyhow::anyhow!("expected a mapping")),
            }
        }
    }

    historian.register_type(Rc::new(BrokenHelper));
    let err = historian.load(car_id).err().unwrap();
    assert!(matches!(err, ChroniclerError::Migration(_)));
    // The failed load left no live object behind.
    assert!(historian.get(car_id).is_err());
}
