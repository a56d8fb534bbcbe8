//! A worker that reports back through the store, like a real enrichment
//! function writing its own batch row.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use enrichd::db::batch_repo;
use enrichd::{
    BatchOutcome, BatchReport, Database, InvocationError, WorkerInvoker, WorkerRequest,
    WorkerResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Marks the batch completed as soon as it is invoked.
    Complete,
    /// Marks the batch failed as soon as it is invoked.
    Fail,
    /// Accepts the batch and never reports.
    Silent,
}

pub struct ScriptedWorker {
    db: Database,
    mode: Mutex<WorkerMode>,
    rejections_left: AtomicU32,
    calls: AtomicU32,
    requests: Mutex<Vec<(String, WorkerRequest)>>,
}

impl ScriptedWorker {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            mode: Mutex::new(WorkerMode::Complete),
            rejections_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: WorkerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Rejects the next `n` invocations before behaving per mode.
    pub fn reject_next(&self, n: u32) {
        self.rejections_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(worker, request)` for every invocation that was accepted.
    pub fn requests(&self) -> Vec<(String, WorkerRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerInvoker for ScriptedWorker {
    async fn invoke(
        &self,
        worker: &str,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, InvocationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let rejected = self
            .rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(InvocationError::Status {
                status: 503,
                body: format!("worker unavailable (call {})", call),
            });
        }

        self.requests
            .lock()
            .unwrap()
            .push((worker.to_string(), request.clone()));

        let mode = *self.mode.lock().unwrap();
        let outcome = match mode {
            WorkerMode::Complete => BatchOutcome::Completed,
            WorkerMode::Fail => BatchOutcome::Failed,
            WorkerMode::Silent => return Ok(WorkerResponse::started()),
        };
        let report = BatchReport {
            job_id: request.job_id.clone(),
            batch_number: (request.start_from / request.batch_size as u64) as u32,
            outcome,
            items_processed: (outcome == BatchOutcome::Completed).then_some(request.batch_size),
            error: (outcome == BatchOutcome::Failed).then(|| "model returned garbage".to_string()),
            data: None,
        };
        batch_repo::report_result(&self.db, &report)
            .map_err(|e| InvocationError::Rejected(e.to_string()))?;

        Ok(WorkerResponse::started())
    }
}
