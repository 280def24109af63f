//! Tests of the query paths: filters, sorting, paging, metadata
//! restrictions and snapshot-space searches.

use chronicler::testing::{self, Car, Person};
use chronicler::{
    new_obj, Field, Find, Meta, ObjExt, ObjId, SortDirection, Value, VersionSelect,
};

fn populate(historian: &mut chronicler::Historian) -> Vec<ObjId> {
    let mut ids = Vec::new();
    for (make, colour) in [
        ("ferrari", "red"),
        ("ferrari", "yellow"),
        ("honda", "red"),
        ("fiat", "white"),
    ] {
        let car = new_obj(Car::new(make, colour));
        ids.push(historian.save(&car).unwrap());
    }
    ids
}

#[test]
fn test_find_by_state() {
    let mut historian = testing::historian();
    populate(&mut historian);

    let reds: Vec<_> = historian
        .find(Find::everything().with_state(serde_json::json!({"colour": "red"})))
        .unwrap()
        .collect::<chronicler::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(reds.len(), 2);
    for obj in &reds {
        assert_eq!(obj.borrow_as::<Car>().unwrap().colour, "red");
    }
}

#[test]
fn test_find_with_expression() {
    let mut historian = testing::historian();
    populate(&mut historian);

    let state = Field::new("state");
    let filter = state.subfield("make").eq("ferrari")
        | state.subfield("colour").eq("white");
    let count = historian
        .count(Find::everything().with_filter(filter))
        .unwrap();
    assert_eq!(count, 3);

    let none = historian
        .count(Find::everything().with_filter(
            state.subfield("make").eq("ferrari") & state.subfield("colour").eq("white"),
        ))
        .unwrap();
    assert_eq!(none, 0);
}

#[test]
fn test_find_by_type() {
    let mut historian = testing::historian();
    populate(&mut historian);
    let person = new_obj(Person::new("martin", 35));
    historian.save(&person).unwrap();

    assert_eq!(
        historian
            .count(Find::everything().with_type(Car::TYPE_ID))
            .unwrap(),
        4
    );
    assert_eq!(
        historian
            .count(Find::everything().with_type(Person::TYPE_ID))
            .unwrap(),
        1
    );
    assert_eq!(historian.count(Find::everything()).unwrap(), 5);
}

#[test]
fn test_find_by_obj_id() {
    let mut historian = testing::historian();
    let ids = populate(&mut historian);

    let found: Vec<_> = historian
        .find(Find::everything().with_obj_id(ids[0]))
        .unwrap()
        .collect::<chronicler::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(historian.get_obj_id(&found[0]), Some(ids[0]));

    assert_eq!(
        historian
            .count(Find::everything().with_obj_ids(ids[..2].to_vec()))
            .unwrap(),
        2
    );
}

#[test]
fn test_sort_limit_skip() {
    let mut historian = testing::historian();
    populate(&mut historian);

    let makes: Vec<String> = historian
        .find(
            Find::everything()
                .sort_by("state.make", SortDirection::Ascending)
                .limit(2),
        )
        .unwrap()
        .map(|obj| obj.unwrap().borrow_as::<Car>().unwrap().make.clone())
        .collect();
    assert_eq!(makes, vec!["ferrari".to_string(), "ferrari".to_string()]);

    let skipped: Vec<String> = historian
        .find(
            Find::everything()
                .sort_by("state.make", SortDirection::Descending)
                .skip(3),
        )
        .unwrap()
        .map(|obj| obj.unwrap().borrow_as::<Car>().unwrap().make.clone())
        .collect();
    assert_eq!(skipped, vec!["ferrari".to_string()]);
}

#[test]
fn test_distinct() {
    let mut historian = testing::historian();
    populate(&mut historian);

    let mut makes: Vec<String> = historian
        .distinct("state.make", Find::everything())
        .unwrap()
        .into_iter()
        .map(|value| value.as_str().unwrap().to_string())
        .collect();
    makes.sort();
    assert_eq!(makes, vec!["ferrari", "fiat", "honda"]);
}

#[test]
fn test_find_by_meta() {
    let mut historian = testing::historian();
    let ids = populate(&mut historian);
    let mut meta = Meta::new();
    meta.insert("city".to_string(), serde_json::json!("Edinburgh"));
    historian.meta().set(ids[2], Some(meta)).unwrap();

    let found: Vec<_> = historian
        .find(Find::everything().with_meta(serde_json::json!({"city": "Edinburgh"})))
        .unwrap()
        .collect::<chronicler::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(historian.get_obj_id(&found[0]), Some(ids[2]));

    // A meta filter that matches nothing short-circuits.
    assert_eq!(
        historian
            .count(Find::everything().with_meta(serde_json::json!({"city": "Dunfermline"})))
            .unwrap(),
        0
    );
}

#[test]
fn test_find_returns_latest_version() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    historian.save(&car).unwrap();
    car.borrow_mut_as::<Car>().unwrap().colour = "pink".to_string();
    historian.save(&car).unwrap();

    assert_eq!(
        historian
            .count(Find::everything().with_state(serde_json::json!({"colour": "red"})))
            .unwrap(),
        0,
        "only the latest version of each object is searched"
    );
    assert_eq!(
        historian
            .count(Find::everything().with_state(serde_json::json!({"colour": "pink"})))
            .unwrap(),
        1
    );
}

#[test]
fn test_find_snapshots() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    historian.save(&car).unwrap();
    car.borrow_mut_as::<Car>().unwrap().colour = "pink".to_string();
    historian.save(&car).unwrap();

    let snapshots: Vec<_> = historian
        .find_snapshots(Find::everything().with_type(Car::TYPE_ID))
        .unwrap()
        .collect::<chronicler::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    let mut colours: Vec<String> = snapshots
        .iter()
        .map(|obj| obj.borrow_as::<Car>().unwrap().colour.clone())
        .collect();
    colours.sort();
    assert_eq!(colours, vec!["pink", "red"]);
}

#[test]
fn test_find_deleted() {
    let mut historian = testing::historian();
    let ids = populate(&mut historian);
    historian.delete_by_id(ids[3]).unwrap();

    // By default the tombstone surfaces as an error when loaded.
    let results: Vec<chronicler::Result<_>> = historian
        .find(Find::everything().with_obj_id(ids[3]))
        .unwrap()
        .collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        &results[0],
        Err(err) if err.is_not_found()
    ));

    // Or it can be excluded from the search outright.
    assert_eq!(
        historian
            .count(
                Find::everything()
                    .with_obj_id(ids[3])
                    .exclude_deleted()
            )
            .unwrap(),
        0
    );
    assert_eq!(
        historian.count(Find::everything().exclude_deleted()).unwrap(),
        3
    );
}

#[test]
fn test_count_versions() {
    let mut historian = testing::historian();
    let car = new_obj(Car::new("ferrari", "red"));
    historian.save(&car).unwrap();
    for colour in ["orange", "yellow", "green"] {
        car.borrow_mut_as::<Car>().unwrap().colour = colour.to_string();
        historian.save(&car).unwrap();
    }

    assert_eq!(historian.count(Find::everything()).unwrap(), 1);
    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Any))
            .unwrap(),
        4
    );
    assert_eq!(
        historian
            .count(Find::everything().with_version(VersionSelect::Exact(2)))
            .unwrap(),
        1
    );
}

#[test]
fn test_state_filters_compare() {
    let mut historian = testing::historian();
    for (name, age) in [("alice", 30i64), ("bob", 40), ("carol", 50)] {
        let person = new_obj(Person::new(name, age));
        historian.save(&person).unwrap();
    }

    assert_eq!(
        historian
            .count(Find::everything().with_state(serde_json::json!({"age": {"$gt": 34}})))
            .unwrap(),
        2
    );
    assert_eq!(
        historian
            .count(
                Find::everything()
                    .with_state(serde_json::json!({"age": {"$in": [30, 50]}}))
            )
            .unwrap(),
        2
    );
    assert_eq!(
        historian
            .count(Find::everything().with_state(serde_json::json!({"name": {"$exists": true}})))
            .unwrap(),
        3
    );

    let values = historian
        .distinct("state.age", Find::everything())
        .unwrap();
    assert_eq!(values.len(), 3);
    assert!(values.contains(&serde_json::json!(40)));

    // The state filter values round-trip through the wire encoding.
    let as_value: serde_json::Value = (&Value::Int(40)).into();
    assert_eq!(
        historian
            .count(Find::everything().with_state(serde_json::json!({ "age": as_value })))
            .unwrap(),
        1
    );
}
