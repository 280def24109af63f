/*!
Types and helpers useful for trying out and testing chronicler.

The types here mirror the objects used throughout the test suite: a
[Car], a [Garage] that references one, a [Person] and a self-referencing
[Cycle].  Each comes with its [TypeHelper] so a ready-made historian can
be had from [historian()].
*/

use std::any::{self, Any};

use uuid::Uuid;

use crate::archive::InMemoryArchive;
use crate::depositor::{Loader, Saver};
use crate::equator::HashWalk;
use crate::helper::{TypeHelper, TypeId};
use crate::historian::Historian;
use crate::object::{new_obj, Node, Obj, ObjExt};
use crate::record::{DataRecord, ObjId};
use crate::reference::ObjRef;
use crate::value::Value;

/// A historian over a fresh in-memory archive with all testing types
/// registered.
pub fn historian() -> Historian {
    let mut hist = Historian::new(Box::new(InMemoryArchive::new()));
    hist.register_type(std::rc::Rc::new(CarHelper));
    hist.register_type(std::rc::Rc::new(GarageHelper));
    hist.register_type(std::rc::Rc::new(PersonHelper));
    hist.register_type(std::rc::Rc::new(CycleHelper));
    hist
}

/// A plain version-0 record for tests that only need one.
pub fn fixture_record() -> DataRecord {
    DataRecord::new_builder(Car::TYPE_ID, ObjId::random())
        .with_state(Value::Str("lada".to_string()), vec![])
        .with_hash("fixture".to_string())
        .build()
        .expect("the fixture record is complete")
}

/// A car with a make and a colour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Car {
    /// Who made it.
    pub make: String,
    /// What it looks like.
    pub colour: String,
}

impl Car {
    /// The stable type id of [Car].
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x21cc_ba32_41e0_4f28_b8a9_6637_0c1d_05e2));

    /// A new car.
    pub fn new(make: &str, colour: &str) -> Car {
        Car {
            make: make.to_string(),
            colour: colour.to_string(),
        }
    }
}

/// The helper for [Car]s.
pub struct CarHelper;

impl TypeHelper for CarHelper {
    fn type_id(&self) -> TypeId {
        Car::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "Car"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<Car>()
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(Car::default()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let car = downcast::<Car>(obj)?;
        walk.value(&Value::Str(car.make.clone()));
        walk.value(&Value::Str(car.colour.clone()));
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        matches!(
            (one.downcast_ref::<Car>(), other.downcast_ref::<Car>()),
            (Some(one), Some(two)) if one == two
        )
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let car = downcast::<Car>(obj)?;
        Ok([
            ("make".to_string(), Node::from(car.make.clone())),
            ("colour".to_string(), Node::from(car.colour.clone())),
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
        let mut car = obj.borrow_mut_as::<Car>()?;
        car.make = state.entry("make")?.as_str()?.to_string();
        car.colour = state.entry("colour")?.as_str()?.to_string();
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        Ok(new_obj(downcast::<Car>(obj)?.clone()))
    }
}

/// A garage keeping (a reference to) a car.
#[derive(Debug, Clone, Default)]
pub struct Garage {
    /// The car parked inside.
    pub car: ObjRef,
}

impl Garage {
    /// The stable type id of [Garage].
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x3c74_21a6_9e0f_4b5d_8dc7_11f5_0a83_64b9));

    /// A garage with the given car parked inside.
    pub fn new(car: Obj) -> Garage {
        Garage {
            car: ObjRef::new(car),
        }
    }
}

/// The helper for [Garage]s.
pub struct GarageHelper;

impl TypeHelper for GarageHelper {
    fn type_id(&self) -> TypeId {
        Garage::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "Garage"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<Garage>()
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(Garage::default()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let garage = downcast::<Garage>(obj)?;
        walk.obj(&garage.car)?;
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        matches!(
            (one.downcast_ref::<Garage>(), other.downcast_ref::<Garage>()),
            (Some(one), Some(two)) if one.car == two.car
        )
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let garage = downcast::<Garage>(obj)?;
        Ok([("car".to_string(), Node::Obj(new_obj(garage.car.clone())))]
            .into_iter()
            .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let car = state.entry("car")?.to_instance::<ObjRef>()?;
        obj.borrow_mut_as::<Garage>()?.car = car;
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        Ok(new_obj(downcast::<Garage>(obj)?.clone()))
    }
}

/// A person, possibly with a car of their own.
#[derive(Debug, Clone, Default)]
pub struct Person {
    /// Their name.
    pub name: String,
    /// Their age in years.
    pub age: i64,
    /// The car they drive, if any.
    pub car: Option<ObjRef>,
}

impl Person {
    /// The stable type id of [Person].
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x88d3_02fc_7c14_4f0e_9d65_3e2a_b0fa_771c));

    /// A new person.
    pub fn new(name: &str, age: i64) -> Person {
        Person {
            name: name.to_string(),
            age,
            car: None,
        }
    }
}

/// The helper for [Person]s.
pub struct PersonHelper;

impl TypeHelper for PersonHelper {
    fn type_id(&self) -> TypeId {
        Person::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "Person"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<Person>()
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(Person::default()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let person = downcast::<Person>(obj)?;
        walk.value(&Value::Str(person.name.clone()));
        walk.value(&Value::Int(person.age));
        match &person.car {
            Some(car) => walk.obj(car)?,
            None => walk.value(&Value::Null),
        }
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        matches!(
            (one.downcast_ref::<Person>(), other.downcast_ref::<Person>()),
            (Some(one), Some(two))
                if one.name == two.name && one.age == two.age && one.car == two.car
        )
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let person = downcast::<Person>(obj)?;
        Ok([
            ("name".to_string(), Node::from(person.name.clone())),
            ("age".to_string(), Node::from(person.age)),
            (
                "car".to_string(),
                person
                    .car
                    .as_ref()
                    .map_or(Node::null(), |car| Node::Obj(new_obj(car.clone()))),
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
        let mut person = obj.borrow_mut_as::<Person>()?;
        person.name = state.entry("name")?.as_str()?.to_string();
        person.age = state.entry("age")?.as_int()?;
        person.car = match state.entry("car")? {
            node if node.is_null() => None,
            node => Some(node.to_instance::<ObjRef>()?),
        };
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        Ok(new_obj(downcast::<Person>(obj)?.clone()))
    }
}

/// A node that references another node (or itself).
#[derive(Debug, Clone, Default)]
pub struct Cycle {
    /// The node referenced.
    pub link: ObjRef,
}

impl Cycle {
    /// The stable type id of [Cycle].
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x600f_b6ae_684c_4f8e_bed3_47ae_0673_9d29));
}

/// The helper for [Cycle]s.
pub struct CycleHelper;

impl TypeHelper for CycleHelper {
    fn type_id(&self) -> TypeId {
        Cycle::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "Cycle"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<Cycle>()
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(Cycle::default()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        walk.obj(&downcast::<Cycle>(obj)?.link)?;
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        matches!(
            (one.downcast_ref::<Cycle>(), other.downcast_ref::<Cycle>()),
            (Some(one), Some(two)) if one.link == two.link
        )
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        _saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let cycle = downcast::<Cycle>(obj)?;
        Ok([("link".to_string(), Node::Obj(new_obj(cycle.link.clone())))]
            .into_iter()
            .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        _loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let link = state.entry("link")?.to_instance::<ObjRef>()?;
        obj.borrow_mut_as::<Cycle>()?.link = link;
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        Ok(new_obj(downcast::<Cycle>(obj)?.clone()))
    }
}

fn downcast<T: 'static>(obj: &dyn Any) -> anyhow::Result<&T> {
    obj.downcast_ref::<T>()
        .ok_or_else(|| anyhow::anyhow!("object is not a {}", std::any::type_name::<T>()))
}
