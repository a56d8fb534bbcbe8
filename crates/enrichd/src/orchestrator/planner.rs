//! Job planner: sizes the remaining work of each selected task and
//! materializes a job with all of its batches.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::db::{job_repo, CollectionCounter, Database};
use crate::error::OrchestratorError;
use crate::model::{batch_count, batch_sizes, cutoff, Batch, Job, MAX_BATCHES_PER_JOB};
use crate::registry::{TaskDefinition, TaskFilter, TaskRegistry};

/// Planning result for one task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub task_name: String,
    pub priority: i32,
    pub unenriched: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub total_batches: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    pub tasks: Vec<TaskPlan>,
    /// Created jobs in priority order.
    #[serde(rename = "jobIds")]
    pub job_ids: Vec<String>,
}

impl PlanReport {
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskPlan> {
        self.tasks.iter().filter(|t| t.error.is_some())
    }
}

pub struct JobPlanner {
    db: Database,
    registry: Arc<TaskRegistry>,
    counter: Arc<dyn CollectionCounter>,
    stale_job_horizon: Duration,
}

impl JobPlanner {
    pub fn new(
        db: Database,
        registry: Arc<TaskRegistry>,
        counter: Arc<dyn CollectionCounter>,
        stale_job_horizon: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            counter,
            stale_job_horizon,
        }
    }

    /// Plans jobs for every task matching `filter`.
    ///
    /// A failure while planning one task is recorded in its [`TaskPlan`] and
    /// does not stop the others. Naming a task that does not exist is an error.
    pub fn plan(&self, filter: &TaskFilter) -> Result<PlanReport, OrchestratorError> {
        let tasks = self.select(filter)?;

        self.clean_stale_jobs();

        let mut report = PlanReport::default();
        for task in tasks {
            let plan = match self.plan_task(task) {
                Ok(plan) => plan,
                Err(e) => {
                    log::error!("Planning failed for task {}: {}", task.name, e);
                    TaskPlan {
                        task_name: task.name.clone(),
                        priority: task.priority,
                        unenriched: 0,
                        job_id: None,
                        total_batches: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            if let Some(job_id) = &plan.job_id {
                report.job_ids.push(job_id.clone());
            }
            report.tasks.push(plan);
        }

        log::info!(
            "Planned {} job(s) across {} task(s), {} failed",
            report.job_ids.len(),
            report.tasks.len(),
            report.failed_tasks().count()
        );
        Ok(report)
    }

    fn select(&self, filter: &TaskFilter) -> Result<Vec<&TaskDefinition>, OrchestratorError> {
        let names: &[String] = match filter {
            TaskFilter::Named(name) => std::slice::from_ref(name),
            TaskFilter::Names(names) => names,
            _ => &[],
        };
        if let Some(missing) = names.iter().find(|n| self.registry.get(n).is_none()) {
            return Err(OrchestratorError::UnknownTask(missing.clone()));
        }
        Ok(self.registry.select(filter))
    }

    /// Marks old aborted/failed jobs completed. Best effort.
    fn clean_stale_jobs(&self) {
        match job_repo::complete_stale_failures(&self.db, cutoff(self.stale_job_horizon)) {
            Ok(0) => {}
            Ok(n) => log::info!("Marked {} stale failed/aborted job(s) as completed", n),
            Err(e) => log::warn!("Stale job cleanup failed: {}", e),
        }
    }

    fn plan_task(&self, task: &TaskDefinition) -> Result<TaskPlan, OrchestratorError> {
        let unenriched = self.counter.unenriched_count(task)?;
        let mut plan = TaskPlan {
            task_name: task.name.clone(),
            priority: task.priority,
            unenriched,
            job_id: None,
            total_batches: 0,
            error: None,
        };

        if unenriched == 0 {
            log::info!("Task {} is fully enriched, skipping", task.name);
            return Ok(plan);
        }

        let batches = batch_count(unenriched, task.batch_size);
        if batches > u64::from(MAX_BATCHES_PER_JOB) {
            return Err(OrchestratorError::TooManyBatches {
                task: task.name.clone(),
                batches,
                limit: MAX_BATCHES_PER_JOB,
            });
        }

        let sizes = batch_sizes(unenriched, task.batch_size);
        let job = Job::new(task, sizes.len() as u32);
        let batches: Vec<Batch> = sizes
            .iter()
            .enumerate()
            .map(|(n, &size)| Batch::new(&job.id, n as u32, size))
            .collect();

        job_repo::insert_with_batches(&self.db, &job, &batches)?;

        log::info!(
            "Created job {} for task {}: {} record(s) in {} batch(es)",
            job.id,
            task.name,
            unenriched,
            batches.len()
        );

        plan.job_id = Some(job.id);
        plan.total_batches = batches.len() as u32;
        Ok(plan)
    }
}
