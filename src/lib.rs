#![deny(missing_docs)]
/*!
# Chronicler

Chronicler is a library for persisting object graphs to a document
archive while keeping their full version history.

The [Historian](historian::Historian) is the go-between between your
objects and the archive: it saves and loads objects, tracks the live
instances it has seen, groups changes into nestable
[transactions](transaction::Transaction), follows
[references](reference::ObjRef) across objects, applies schema
[migrations](migration::ObjectMigration) and answers
[queries](query::Expr).

Objects become storable by registering a [TypeHelper](helper::TypeHelper)
for them.  Storage itself is pluggable behind the
[Archive](archive::Archive) trait; an in-memory implementation ships with
the crate.

```
use chronicler::testing::{self, Car};
use chronicler::{new_obj, ObjExt};

let mut historian = testing::historian();
let car = new_obj(Car::new("nissan", "white"));
let car_id = historian.save(&car).unwrap();
let loaded = historian.load(car_id).unwrap();
assert_eq!(loaded.borrow_as::<Car>().unwrap().make, "nissan");
```
*/

pub mod archive;
pub mod depositor;
pub mod equator;
pub mod error;
pub mod file;
pub mod helper;
pub mod historian;
pub mod migration;
pub mod object;
pub mod query;
pub mod record;
pub mod reference;
pub mod registry;
pub mod settings;
pub mod testing;
pub mod transaction;
pub mod value;

pub use archive::{Archive, Direction, InMemoryArchive, Meta, SortDirection, VersionSelect};
pub use error::{ChroniclerError, Result};
pub use file::File;
pub use helper::{TypeHelper, TypeId};
pub use historian::{rollback, Find, Historian, ObjectIter, PurgeResult, Slice};
pub use migration::ObjectMigration;
pub use object::{new_obj, Node, Obj, ObjExt};
pub use query::{Expr, Field};
pub use record::{DataRecord, ObjId, SnapshotId, StateType};
pub use reference::ObjRef;
pub use value::{PathStep, Value, ValuePath};
