//! Record counts for a task's source and target collections.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::params;

use super::{Database, DatabaseError};
use crate::registry::TaskDefinition;

/// Counts used by the planner to size a job.
pub trait CollectionCounter: Send + Sync {
    /// Number of records in the task's source collection.
    fn source_count(&self, task: &TaskDefinition) -> Result<u64, DatabaseError>;

    /// Number of records in the task's target collection carrying the task's
    /// current enrichment version (all records if the task has none).
    fn enriched_count(&self, task: &TaskDefinition) -> Result<u64, DatabaseError>;

    /// `max(0, source - enriched)`.
    fn unenriched_count(&self, task: &TaskDefinition) -> Result<u64, DatabaseError> {
        let source = self.source_count(task)?;
        let enriched = self.enriched_count(task)?;
        Ok(source.saturating_sub(enriched))
    }
}

static RE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// True if `name` can be interpolated into SQL as a bare table name.
pub fn is_valid_identifier(name: &str) -> bool {
    RE_IDENTIFIER.is_match(name)
}

fn checked(name: &str) -> Result<&str, DatabaseError> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// Counts rows of tables living in a SQLite database.
///
/// Target tables are expected to carry an `enrichment_version` column when
/// a task configures a version.
#[derive(Clone)]
pub struct SqliteCollectionCounter {
    db: Database,
}

impl SqliteCollectionCounter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CollectionCounter for SqliteCollectionCounter {
    fn source_count(&self, task: &TaskDefinition) -> Result<u64, DatabaseError> {
        let table = checked(&task.source)?;
        self.db.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
            Ok(conn.query_row(&sql, [], |r| r.get(0))?)
        })
    }

    fn enriched_count(&self, task: &TaskDefinition) -> Result<u64, DatabaseError> {
        let table = checked(&task.target)?;
        self.db.with_conn(|conn| match &task.enrichment_version {
            Some(version) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM \"{}\" WHERE enrichment_version = ?1",
                    table
                );
                Ok(conn.query_row(&sql, params![version], |r| r.get(0))?)
            }
            None => {
                let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
                Ok(conn.query_row(&sql, [], |r| r.get(0))?)
            }
        })
    }
}
