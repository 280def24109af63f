//! Tests of reference semantics: cycles, lazy dereferencing, the
//! reference graph and delete integrity.

use std::rc::Rc;

use chronicler::testing::{self, Car, Cycle, Garage};
use chronicler::{new_obj, ChroniclerError, Direction, ObjExt, ObjRef, Slice, SnapshotId};

#[test]
fn test_nested_update_propagation() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));

    let garage_id = historian.save(&garage).unwrap();
    let car_id = historian.get_obj_id(&car).unwrap();

    // Change the car and save it; the garage still points at the car.
    car.borrow_mut_as::<Car>().unwrap().make = "fiat".to_string();
    historian.save(&car).unwrap();

    drop(garage);
    let loaded = historian.load(garage_id).unwrap();
    let reference = loaded.borrow_as::<Garage>().unwrap().car.clone();
    let loaded_car = reference.fetch(&mut historian).unwrap();
    assert_eq!(loaded_car.borrow_as::<Car>().unwrap().make, "fiat");
    assert_eq!(historian.history_records(car_id, Slice::All).unwrap().len(), 2);
}

#[test]
fn test_saving_garage_saves_car() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("vw", "white"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));

    assert!(!historian.is_saved(&car));
    historian.save(&garage).unwrap();
    assert!(historian.is_saved(&car), "referenced objects are saved too");
}

#[test]
fn test_reference_delete_prevention() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));
    let garage_id = historian.save(&garage).unwrap();
    let car_id = historian.get_obj_id(&car).unwrap();

    let err = historian.delete(&car).unwrap_err();
    match err {
        ChroniclerError::Reference { references, .. } => {
            assert!(references.contains(&garage_id));
            assert_eq!(references.len(), 1);
        }
        other => panic!("expected a reference error, got {:?}", other),
    }
    // The tombstone was not written.
    assert_eq!(historian.history_records(car_id, Slice::All).unwrap().len(), 1);

    // Once the referrer is gone the delete goes through.
    historian.delete(&garage).unwrap();
    historian.delete(&car).unwrap();
}

#[test]
fn test_self_cycle() {
    let mut historian = testing::historian();
    let node = new_obj(Cycle::default());
    node.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&node));

    let node_id = historian.save(&node).unwrap();
    drop(node);

    let loaded = historian.load(node_id).unwrap();
    let link = loaded.borrow_as::<Cycle>().unwrap().link.clone();
    let target = link.fetch(&mut historian).unwrap();
    assert!(Rc::ptr_eq(&target, &loaded), "the cycle closes on itself");
}

#[test]
fn test_mutual_cycle() {
    let mut historian = testing::historian();
    let one = new_obj(Cycle::default());
    let two = new_obj(Cycle::default());
    one.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&two));
    two.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&one));

    let one_id = historian.save(&one).unwrap();
    let two_id = historian.get_obj_id(&two).unwrap();
    drop(one);
    drop(two);

    let loaded_one = historian.load(one_id).unwrap();
    let to_two = loaded_one.borrow_as::<Cycle>().unwrap().link.clone();
    let loaded_two = to_two.fetch(&mut historian).unwrap();
    assert_eq!(historian.get_obj_id(&loaded_two), Some(two_id));
    let back = loaded_two.borrow_as::<Cycle>().unwrap().link.clone();
    let target = back.fetch(&mut historian).unwrap();
    assert!(Rc::ptr_eq(&target, &loaded_one));
}

#[test]
fn test_snapshot_space_dereference() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));
    let garage_id = historian.save(&garage).unwrap();

    // Move the car on to a new version.
    car.borrow_mut_as::<Car>().unwrap().colour = "blue".to_string();
    historian.save(&car).unwrap();

    // The old garage snapshot still sees the car as it was.
    let snapshot = historian
        .load_snapshot(&SnapshotId::new(garage_id, 0))
        .unwrap();
    let reference = snapshot.borrow_as::<Garage>().unwrap().car.clone();
    let old_car = reference.fetch(&mut historian).unwrap();
    assert_eq!(old_car.borrow_as::<Car>().unwrap().colour, "red");
    assert!(!Rc::ptr_eq(&old_car, &car));
}

#[test]
fn test_reference_graph_queries() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("mini", "green"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));
    let garage_id = historian.save(&garage).unwrap();
    let car_id = historian.get_obj_id(&car).unwrap();

    assert_eq!(
        historian.references().references(garage_id).unwrap(),
        vec![car_id]
    );
    assert_eq!(
        historian.references().referenced_by(car_id).unwrap(),
        vec![garage_id]
    );
    assert!(historian
        .references()
        .references(car_id)
        .unwrap()
        .is_empty());

    let snapshot_refs = historian
        .references()
        .snapshot_references(&SnapshotId::new(garage_id, 0))
        .unwrap();
    assert_eq!(snapshot_refs, vec![SnapshotId::new(car_id, 0)]);
    assert_eq!(
        historian
            .references()
            .snapshot_referenced_by(&SnapshotId::new(car_id, 0))
            .unwrap(),
        vec![SnapshotId::new(garage_id, 0)]
    );
}

#[test]
fn test_reference_graph_depth_bounds() {
    let mut historian = testing::historian();
    let head = new_obj(Cycle::default());
    let middle = new_obj(Cycle::default());
    let tail = new_obj(Cycle::default());
    head.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&middle));
    middle.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&tail));
    tail.borrow_mut_as::<Cycle>().unwrap().link = ObjRef::new(Rc::clone(&head));

    let head_id = historian.save(&head).unwrap();
    let middle_id = historian.get_obj_id(&middle).unwrap();
    let tail_id = historian.get_obj_id(&tail).unwrap();

    let near = historian
        .references()
        .get_obj_ref_graph(&[head_id], Direction::Outgoing, Some(1))
        .unwrap();
    assert_eq!(near, vec![(head_id, middle_id)]);

    // Unbounded traversal walks the whole cycle exactly once.
    let full = historian
        .references()
        .get_obj_ref_graph(&[head_id], Direction::Outgoing, None)
        .unwrap();
    assert_eq!(full.len(), 3);
    assert!(full.contains(&(middle_id, tail_id)));
    assert!(full.contains(&(tail_id, head_id)));
}

#[test]
fn test_fetch_fresh_syncs_the_target() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("fiat", "green"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));
    historian.save(&garage).unwrap();
    let car_id = historian.get_obj_id(&car).unwrap();

    // Another writer moves the car on.
    let latest = historian.history_records(car_id, Slice::All).unwrap().pop().unwrap();
    let newer = latest
        .child_builder()
        .with_state(
            chronicler::Value::Map(
                [
                    (
                        "make".to_string(),
                        chronicler::Value::Str("fiat".to_string()),
                    ),
                    (
                        "colour".to_string(),
                        chronicler::Value::Str("orange".to_string()),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            vec![chronicler::StateType {
                path: chronicler::ValuePath::root(),
                type_id: Car::TYPE_ID,
                version: None,
            }],
        )
        .with_hash("elsewhere".to_string())
        .build()
        .unwrap();
    chronicler::Archive::save(historian.archive(), newer).unwrap();

    let reference = garage.borrow_as::<Garage>().unwrap().car.clone();
    let fresh = reference.fetch_fresh(&mut historian).unwrap();
    assert!(Rc::ptr_eq(&fresh, &car));
    assert_eq!(car.borrow_as::<Car>().unwrap().colour, "orange");

    // A reference to a never-saved object is already up to date.
    let unsaved = ObjRef::new(new_obj(Car::new("lada", "beige")));
    assert!(unsaved.fetch_fresh(&mut historian).is_ok());
}

#[test]
fn test_lazy_reference_equality() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("audi", "grey"));
    let garage = new_obj(Garage::new(Rc::clone(&car)));
    let garage_id = historian.save(&garage).unwrap();
    drop(garage);
    drop(car);

    let one = historian.load(garage_id).unwrap();
    let lazy = one.borrow_as::<Garage>().unwrap().car.clone();
    assert!(lazy.snapshot_id().is_some());
    assert_eq!(lazy, lazy.clone(), "lazy references compare by snapshot id");

    // Dereferencing upgrades the reference to live.
    let target = lazy.fetch(&mut historian).unwrap();
    assert!(lazy.snapshot_id().is_none());
    assert!(Rc::ptr_eq(&lazy.target().unwrap(), &target));
}
