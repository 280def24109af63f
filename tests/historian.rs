//! End-to-end tests of the historian: saving, loading, syncing,
//! copying, deleting and transactions.

use std::rc::Rc;

use chronicler::testing::{self, Car, Garage};
use chronicler::{
    new_obj, Archive, ChroniclerError, Find, ObjExt, Slice, SnapshotId, StateType, Value,
    ValuePath, VersionSelect,
};

#[test]
fn test_simple_round_trip() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("nissan", "white"));
    let car_id = historian.save(&car).unwrap();
    drop(car);

    let loaded = historian.load(car_id).unwrap();
    let loaded_car = loaded.borrow_as::<Car>().unwrap();
    assert_eq!(loaded_car.make, "nissan");
    assert_eq!(loaded_car.colour, "white");
}

#[test]
fn test_load_preserves_identity() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("zonda", "black"));
    let car_id = historian.save(&car).unwrap();

    let loaded = historian.load(car_id).unwrap();
    assert!(Rc::ptr_eq(&car, &loaded));
}

#[test]
fn test_idempotent_save() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("fiat", "green"));
    let first = historian.save(&car).unwrap();
    let second = historian.save(&car).unwrap();
    assert_eq!(first, second);

    let records = historian
        .count(
            Find::everything()
                .with_obj_id(first)
                .with_version(VersionSelect::Any),
        )
        .unwrap();
    assert_eq!(records, 1, "an unchanged object must not grow its history");
}

#[test]
fn test_mutation_produces_new_version() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("fiat", "green"));
    let car_id = historian.save(&car).unwrap();

    car.borrow_mut_as::<Car>().unwrap().colour = "white".to_string();
    historian.save(&car).unwrap();

    let records = historian.history_records(car_id, Slice::All).unwrap();
    let versions: Vec<u32> = records.iter().map(|record| record.version).collect();
    assert_eq!(versions, vec![0, 1]);
    assert_ne!(records[0].snapshot_hash, records[1].snapshot_hash);
}

#[test]
fn test_history() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "white"));
    let car_id = historian.save(&car).unwrap();
    car.borrow_mut_as::<Car>().unwrap().colour = "red".to_string();
    historian.save(&car).unwrap();

    let history = historian.history(car_id, Slice::All).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].1.borrow_as::<Car>().unwrap().colour,
        "white"
    );
    assert_eq!(history[1].1.borrow_as::<Car>().unwrap().colour, "red");

    let last = historian.history(car_id, -1i64).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].0, SnapshotId::new(car_id, 1));
}

#[test]
fn test_snapshots_are_fresh_and_frozen() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("honda", "blue"));
    let car_id = historian.save(&car).unwrap();

    let sid = SnapshotId::new(car_id, 0);
    let one = historian.load_snapshot(&sid).unwrap();
    let two = historian.load_snapshot(&sid).unwrap();
    assert!(
        !Rc::ptr_eq(&one, &two),
        "independent snapshot loads give fresh objects"
    );

    // A loaded snapshot cannot be saved, that would rewrite history.
    let err = historian.save(&one).unwrap_err();
    assert!(matches!(err, ChroniclerError::Modification(_)));
}

#[test]
fn test_sync_updates_in_place() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("fiat", "green"));
    let car_id = historian.save(&car).unwrap();

    // A never-saved object is as up to date as can be.
    let fresh = new_obj(Car::new("lada", "beige"));
    assert!(!historian.sync(&fresh).unwrap());
    assert!(!historian.sync(&car).unwrap());

    // Another writer produces version 1 behind our back.
    let latest = historian.history_records(car_id, -1i64).unwrap().remove(0);
    let newer = latest
        .child_builder()
        .with_state(
            Value::Map(
                [
                    ("make".to_string(), Value::Str("fiat".to_string())),
                    ("colour".to_string(), Value::Str("yellow".to_string())),
                ]
                .into_iter()
                .collect(),
            ),
            vec![StateType {
                path: ValuePath::root(),
                type_id: Car::TYPE_ID,
                version: None,
            }],
        )
        .with_hash("someone-elses-hash".to_string())
        .build()
        .unwrap();
    historian.archive().save(newer).unwrap();

    assert!(historian.sync(&car).unwrap());
    assert_eq!(car.borrow_as::<Car>().unwrap().colour, "yellow");
    // Now up to date.
    assert!(!historian.sync(&car).unwrap());
}

#[test]
fn test_sync_of_deleted_object() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("skoda", "green"));
    let car_id = historian.save(&car).unwrap();

    let latest = historian.history_records(car_id, -1i64).unwrap().remove(0);
    historian
        .archive()
        .save(latest.deleted_builder().build().unwrap())
        .unwrap();

    let err = historian.sync(&car).unwrap_err();
    assert!(matches!(err, ChroniclerError::ObjectDeleted(id) if id == car_id));
}

#[test]
fn test_delete() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("lada", "red"));
    let car_id = historian.save(&car).unwrap();
    historian.delete(&car).unwrap();

    let err = historian.load(car_id).err().unwrap();
    assert!(matches!(err, ChroniclerError::ObjectDeleted(id) if id == car_id));

    let records = historian.history_records(car_id, Slice::All).unwrap();
    assert_eq!(
        records.len(),
        2,
        "there should be two records, the initial and the delete"
    );
    assert!(records[1].is_deleted_record());

    // Deleting again fails: the object is already gone.
    let err = historian.delete_by_id(car_id).unwrap_err();
    assert!(matches!(err, ChroniclerError::ObjectDeleted(_)));
}

#[test]
fn test_delete_in_transaction() {
    let mut historian = testing::historian();
    let outside = new_obj(Car::new("fiat", "white"));
    let outside_id = historian.save(&outside).unwrap();

    historian
        .transaction(|hist| {
            let inside = new_obj(Car::new("bmw", "black"));
            let inside_id = hist.save(&inside)?;
            hist.delete_by_id(inside_id)?;
            hist.delete_by_id(outside_id)?;

            assert!(hist.get(inside_id).err().unwrap().is_not_found());
            assert!(hist.get(outside_id).err().unwrap().is_not_found());
            assert!(matches!(
                hist.load(inside_id).err().unwrap(),
                ChroniclerError::ObjectDeleted(_)
            ));
            assert!(matches!(
                hist.load(outside_id).err().unwrap(),
                ChroniclerError::ObjectDeleted(_)
            ));
            Ok(())
        })
        .unwrap();

    assert!(historian.get(outside_id).err().unwrap().is_not_found());
    assert!(matches!(
        historian.load(outside_id).err().unwrap(),
        ChroniclerError::ObjectDeleted(_)
    ));
}

#[test]
fn test_rollback() {
    let mut historian = testing::historian();
    let mut saved_id = None;
    let outcome = historian
        .transaction(|hist| {
            let car = new_obj(Car::new("fiat", "blue"));
            saved_id = Some(hist.save(&car)?);
            chronicler::rollback::<()>()
        })
        .unwrap();
    assert!(outcome.is_none());

    let car_id = saved_id.unwrap();
    let err = historian.load(car_id).err().unwrap();
    assert!(err.is_not_found());
    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Any))
            .unwrap(),
        0,
        "a rolled back transaction leaves the archive untouched"
    );
}

#[test]
fn test_nested_transactions() {
    let mut historian = testing::historian();
    let kept_id = historian
        .transaction(|hist| {
            let kept = new_obj(Car::new("kept", "white"));
            let kept_id = hist.save(&kept)?;
            let abandoned = hist.transaction(|hist| {
                let dropped = new_obj(Car::new("dropped", "grey"));
                hist.save(&dropped)?;
                chronicler::rollback::<()>()
            })?;
            assert!(abandoned.is_none());
            Ok(kept_id)
        })
        .unwrap()
        .unwrap();

    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Any))
            .unwrap(),
        1
    );
    assert!(historian.load(kept_id).is_ok());
}

#[test]
fn test_copy() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("zonda", "yellow"));
    let car_id = historian.save(&car).unwrap();

    let copy = historian.copy(&car).unwrap();
    assert!(!Rc::ptr_eq(&car, &copy));
    let copy_id = historian.save(&copy).unwrap();
    assert_ne!(car_id, copy_id);

    let record = historian
        .history_records(copy_id, Slice::All)
        .unwrap()
        .remove(0);
    assert_eq!(record.copied_from(), Some(SnapshotId::new(car_id, 0)));
    assert_eq!(copy.borrow_as::<Car>().unwrap().make, "zonda");
}

#[test]
fn test_copy_of_unsaved_object() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("zonda", "yellow"));
    let copy = historian.copy(&car).unwrap();
    let copy_id = historian.save(&copy).unwrap();

    let record = historian
        .history_records(copy_id, Slice::All)
        .unwrap()
        .remove(0);
    assert_eq!(record.copied_from(), None);
}

#[test]
fn test_replace() {
    let mut historian = testing::historian();
    let old = new_obj(Car::new("ford", "red"));
    let car_id = historian.save(&old).unwrap();

    let new = new_obj(Car::new("ford", "rust"));
    historian.replace(&old, &new).unwrap();
    drop(old);

    let saved_id = historian.save(&new).unwrap();
    assert_eq!(saved_id, car_id, "the history continues under the old id");
    let records = historian.history_records(car_id, Slice::All).unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_replace_rejects_mismatches() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ford", "red"));
    historian.save(&car).unwrap();

    let garage = new_obj(Garage::new(new_obj(Car::new("vw", "white"))));
    let err = historian.replace(&car, &garage).unwrap_err();
    assert!(matches!(err, ChroniclerError::Modification(_)));

    let other = new_obj(Car::new("vw", "blue"));
    historian
        .transaction(|hist| {
            let err = hist.replace(&car, &other).unwrap_err();
            assert!(matches!(err, ChroniclerError::Modification(_)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_meta() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("honda", "crimson"));
    let mut meta = chronicler::Meta::new();
    meta.insert("reg".to_string(), serde_json::json!("VD395"));
    let car_id = historian.save_with_meta(&car, meta).unwrap();

    let stored = historian.meta().get(car_id).unwrap().unwrap();
    assert_eq!(stored["reg"], serde_json::json!("VD395"));

    let mut update = chronicler::Meta::new();
    update.insert("mileage".to_string(), serde_json::json!(42_000));
    historian.meta().update(car_id, update).unwrap();
    let stored = historian.meta().get(car_id).unwrap().unwrap();
    assert_eq!(stored["reg"], serde_json::json!("VD395"));
    assert_eq!(stored["mileage"], serde_json::json!(42_000));

    let found = historian
        .meta()
        .find(&serde_json::json!({"reg": "VD395"}), None)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, car_id);

    // Deleting the object takes its metadata with it.
    historian.delete(&car).unwrap();
    assert!(historian.meta().get(car_id).unwrap().is_none());
}

#[test]
fn test_meta_unique_index_aborts_save() {
    let mut historian = testing::historian();
    historian
        .meta()
        .create_index(
            &[("reg".to_string(), chronicler::SortDirection::Ascending)],
            true,
            true,
        )
        .unwrap();

    let mut meta = chronicler::Meta::new();
    meta.insert("reg".to_string(), serde_json::json!("VD395"));

    let first = new_obj(Car::new("honda", "crimson"));
    historian.save_with_meta(&first, meta.clone()).unwrap();

    let second = new_obj(Car::new("fiat", "crimson"));
    let err = historian.save_with_meta(&second, meta).unwrap_err();
    assert!(matches!(err, ChroniclerError::DuplicateKey(_)));
}

#[test]
fn test_sticky_meta() {
    let mut historian = testing::historian();
    historian
        .meta()
        .sticky()
        .insert("project".to_string(), serde_json::json!("skunkworks"));

    let car = new_obj(Car::new("fiat", "white"));
    let car_id = historian.save(&car).unwrap();
    let stored = historian.meta().get(car_id).unwrap().unwrap();
    assert_eq!(stored["project"], serde_json::json!("skunkworks"));
}

#[test]
fn test_file_round_trip() {
    let mut historian = testing::historian();
    let file = historian.create_file(Some("message.txt"), Some("utf-8"));
    file.write_text("hello from the archive");
    let file = new_obj(file);
    let file_id = historian.save(&file).unwrap();
    drop(file);

    let loaded = historian.load(file_id).unwrap();
    let loaded_file = loaded.borrow_as::<chronicler::File>().unwrap();
    assert_eq!(loaded_file.read_text(), "hello from the archive");
    assert_eq!(loaded_file.filename(), Some("message.txt"));
}

#[test]
fn test_purge() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("trabant", "blue"));
    let car_id = historian.save(&car).unwrap();
    car.borrow_mut_as::<Car>().unwrap().colour = "grey".to_string();
    historian.save(&car).unwrap();
    historian.delete(&car).unwrap();

    let keep = new_obj(Car::new("volvo", "silver"));
    historian.save(&keep).unwrap();

    let dry = historian.purge(true, true).unwrap();
    assert_eq!(dry.deleted_purged.len(), 3);
    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Any))
            .unwrap(),
        4
    );

    let purged = historian.purge(true, false).unwrap();
    assert_eq!(purged.deleted_purged.len(), 3);
    assert!(purged
        .deleted_purged
        .iter()
        .all(|sid| sid.obj_id == car_id));
    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Any))
            .unwrap(),
        1
    );
}

#[test]
fn test_creator_provenance() {
    let mut historian = testing::historian();
    let factory = new_obj(Car::new("factory", "grey"));
    let product = new_obj(Car::new("product", "blue"));
    historian.mark_created_by(&product, &factory);

    // Saving the product records (and, if need be, saves) its creator.
    let product_id = historian.save(&product).unwrap();
    let factory_id = historian.get_obj_id(&factory).unwrap();
    assert_eq!(historian.created_by(product_id).unwrap(), Some(factory_id));
    assert_eq!(historian.created_by(factory_id).unwrap(), None);
}

#[test]
fn test_hash_and_eq() {
    let historian = testing::historian();
    let one = new_obj(Car::new("fiat", "white"));
    let two = new_obj(Car::new("fiat", "white"));
    let other = new_obj(Car::new("fiat", "red"));

    assert!(historian.eq(&one, &two));
    assert!(!historian.eq(&one, &other));
    assert_eq!(
        historian.hash(&one).unwrap(),
        historian.hash(&two).unwrap()
    );
    assert_ne!(
        historian.hash(&one).unwrap(),
        historian.hash(&other).unwrap()
    );
}

#[test]
fn test_snapshot_id_text_round_trip() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("saab", "white"));
    let car_id = historian.save(&car).unwrap();

    let sid = SnapshotId::new(car_id, 0);
    let parsed: SnapshotId = sid.to_string().parse().unwrap();
    assert_eq!(parsed, sid);
    assert_eq!(historian.to_obj_id(&car_id.to_string()).unwrap(), car_id);
}
