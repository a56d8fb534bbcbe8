//! Test harness for isolated orchestrator runs.
//!
//! Each harness owns a temporary directory with a file-backed database that
//! holds both the job store and the collections the planner counts.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use enrichd::db::{batch_repo, job_repo};
use enrichd::{
    Batch, ControlRequest, Database, Job, Orchestrator, SqliteCollectionCounter,
};

use super::builders::ConfigBuilder;
use super::worker::ScriptedWorker;

pub struct TestHarness {
    _dir: TempDir,
    pub db: Database,
    pub worker: Arc<ScriptedWorker>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    pub fn new(config: ConfigBuilder) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("enrichd.db")).expect("open database");
        let worker = Arc::new(ScriptedWorker::new(db.clone()));
        let orchestrator = Orchestrator::new(
            db.clone(),
            config.build(),
            worker.clone(),
            Arc::new(SqliteCollectionCounter::new(db.clone())),
        )
        .expect("orchestrator");

        Self {
            _dir: dir,
            db,
            worker,
            orchestrator,
        }
    }

    /// Creates `table` with `rows` source records.
    pub fn seed_source(&self, table: &str, rows: u32) {
        self.db
            .with_conn(|conn| {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{table}\" (id INTEGER PRIMARY KEY)"
                ))?;
                for id in 0..rows {
                    conn.execute(&format!("INSERT INTO \"{table}\" (id) VALUES (?1)"), [id])?;
                }
                Ok(())
            })
            .expect("seed source");
    }

    /// Creates `table` with `rows` already-enriched records.
    pub fn seed_enriched(&self, table: &str, rows: u32) {
        self.db
            .with_conn(|conn| {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{table}\"
                     (id INTEGER PRIMARY KEY, enrichment_version TEXT)"
                ))?;
                for id in 0..rows {
                    conn.execute(&format!("INSERT INTO \"{table}\" (id) VALUES (?1)"), [id])?;
                }
                Ok(())
            })
            .expect("seed target");
    }

    /// Runs an action and returns the body, asserting it succeeded.
    pub async fn action(&self, request: ControlRequest) -> Value {
        let reply = self.orchestrator.handle(request).await;
        assert!(reply.is_success(), "action failed: {}", reply.body);
        assert_eq!(reply.body["success"], true);
        reply.body
    }

    pub async fn start(&self) -> Value {
        self.action(ControlRequest::Start {
            phase: None,
            task_name: None,
        })
        .await
    }

    pub fn job_ids(body: &Value) -> Vec<String> {
        body["jobIds"]
            .as_array()
            .expect("jobIds")
            .iter()
            .map(|v| v.as_str().expect("job id").to_string())
            .collect()
    }

    pub fn job(&self, id: &str) -> Job {
        job_repo::find_by_id(&self.db, id)
            .expect("query job")
            .expect("job exists")
    }

    pub fn batches(&self, job_id: &str) -> Vec<Batch> {
        batch_repo::list_for_job(&self.db, job_id).expect("query batches")
    }
}
