/*!
Schema migrations: the [ObjectMigration] chain a type helper can carry,
the pipeline that brings out-of-date saved states up to the current
version, and the [Migrations] service for migrating the whole archive.
*/

use std::rc::Rc;

use tracing::info;

use crate::depositor::Loader;
use crate::error::{ChroniclerError, Result};
use crate::helper::TypeHelper;
use crate::historian::Historian;
use crate::object::Node;
use crate::query::{Expr, Field};
use crate::record::{DataRecord, SnapshotId};

/// One step in a type's migration chain.  Each step carries a version
/// number strictly greater than its predecessor's and knows how to
/// upgrade a saved state produced by that predecessor.
pub trait ObjectMigration {
    /// The version this migration upgrades saved states to.
    fn version(&self) -> u32;

    /// The previous migration in the chain, `None` at the tail.
    fn previous(&self) -> Option<Rc<dyn ObjectMigration>> {
        None
    }

    /// Take a saved state created with the previous version and return
    /// one compatible with this version.
    fn upgrade(&self, state: Node, loader: &mut Loader<'_>) -> anyhow::Result<Node>;
}

/// Bring a saved state up to the helper's current version.  Returns the
/// (possibly upgraded) state and whether any migration was applied.
///
/// A record carrying a version newer than the code fails with a version
/// error rather than guessing.
pub(crate) fn ensure_up_to_date(
    helper: &dyn TypeHelper,
    state: Node,
    recorded: Option<u32>,
    loader: &mut Loader<'_>,
) -> Result<(Node, bool)> {
    let latest = helper.migration_version();
    if latest == recorded {
        return Ok((state, false));
    }
    match (latest, recorded) {
        (None, Some(saved)) => {
            return Err(ChroniclerError::Version(format!(
                "this codebase's '{}' has no migrations but the saved state has version {}",
                helper.type_name(),
                saved
            )))
        }
        (Some(current), Some(saved)) if current < saved => {
            return Err(ChroniclerError::Version(format!(
                "this codebase's version of '{}' is older ({}) than the saved version ({}), \
                 check for updates",
                helper.type_name(),
                current,
                saved
            )))
        }
        _ => {}
    }

    let mut to_apply = Vec::new();
    let mut current = helper.latest_migration();
    while let Some(migration) = current {
        if recorded.map_or(false, |saved| migration.version() <= saved) {
            break;
        }
        current = migration.previous();
        to_apply.push(migration);
    }
    if to_apply.is_empty() {
        return Ok((state, false));
    }
    to_apply.reverse();

    let total = to_apply.len();
    info!(
        type_name = helper.type_name(),
        from = ?recorded,
        to = to_apply.last().map(|m| m.version()),
        total,
        "migrating saved state"
    );
    let mut state = state;
    for (idx, migration) in to_apply.iter().enumerate() {
        state = migration
            .upgrade(state, loader)
            .map_err(|err| ChroniclerError::Migration(err.to_string()))?;
        info!(
            version = migration.version(),
            applied = idx + 1,
            total,
            "migration applied"
        );
    }
    Ok((state, true))
}

/// The historian's migrations namespace.
pub struct Migrations<'h> {
    hist: &'h mut Historian,
}

impl<'h> Migrations<'h> {
    pub(crate) fn new(hist: &'h mut Historian) -> Self {
        Migrations { hist }
    }

    /// Find archive records whose schema mentions a registered helper
    /// with a version older than that helper's current one.
    pub fn find_migratable_records(&mut self) -> Result<Vec<DataRecord>> {
        let with_migrations = self.hist.registry().helpers_with_migrations();
        if with_migrations.is_empty() {
            return Ok(Vec::new());
        }
        let state_types = Field::new("state_types");
        let mut filter = Expr::Empty;
        for helper in with_migrations {
            let version = helper
                .migration_version()
                .map(i64::from)
                .unwrap_or_default();
            let condition = state_types.elem_match(serde_json::json!({
                "1": helper.type_id(),
                "$or": [{"2": {"$lt": version}}, {"2": null}],
            }));
            filter = if filter.is_empty() {
                condition
            } else {
                filter.or(condition)
            };
        }
        self.hist.find_records_filtered(filter)
    }

    /// Migrate every record that can be updated.  Returns the snapshot
    /// ids of the records that were actually rewritten.
    pub fn migrate_all(&mut self) -> Result<Vec<SnapshotId>> {
        let to_migrate = self.find_migratable_records()?;
        self.migrate_records(to_migrate)
    }

    /// Migrate the given records where possible, flushing the rewritten
    /// states to the archive.
    pub fn migrate_records(&mut self, records: Vec<DataRecord>) -> Result<Vec<SnapshotId>> {
        self.hist.in_transaction(|hist| {
            let mut migrated = Vec::new();
            for record in &records {
                let mut loader = Loader::migrator(hist);
                loader.load_snapshot_record(record)?;
                if loader.migrated_any() {
                    migrated.push(record.snapshot_id());
                }
            }
            Ok(migrated)
        })
    }
}
