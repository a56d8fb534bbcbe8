//! Batch dispatch: retries, timeouts, ghost locks and job completion.

mod common;

use std::sync::Arc;

use common::{ConfigBuilder, TestHarness, WorkerMode};
use enrichd::{
    BatchPhase, BatchStatus, ControlRequest, JobStatus, Orchestrator, SqliteCollectionCounter,
};

fn single_task(batch_size: u32) -> ConfigBuilder {
    ConfigBuilder::new()
        .background(false)
        .task("summaries", "articles", "summaries", batch_size, 1)
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_only_that_batch() {
    let h = TestHarness::new(
        ConfigBuilder::new()
            .task("summaries", "articles", "summaries", 10, 1)
            .task("tags", "articles", "tags", 10, 2),
    );
    h.seed_source("articles", 10);
    h.seed_enriched("summaries", 0);
    h.seed_enriched("tags", 0);
    h.worker.reject_next(5);

    let ids = TestHarness::job_ids(&h.start().await);
    let summaries = h.orchestrator.wait_for_processors().await;
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_ok());

    // Five rejected attempts, then one accepted call for the next job
    assert_eq!(h.worker.calls(), 6);

    let failed_job = h.job(&ids[0]);
    assert_eq!(failed_job.failed_batches, 1);
    assert_eq!(failed_job.completed_batches, 0);
    assert_eq!(failed_job.status, JobStatus::Completed);
    assert!(failed_job.error_message.unwrap().contains("call 5"));

    let batch = &h.batches(&ids[0])[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error_message.as_ref().unwrap().contains("HTTP 503"));

    let other = h.job(&ids[1]);
    assert_eq!(other.status, JobStatus::Completed);
    assert_eq!(other.completed_batches, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_rejections_are_retried() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 10);
    h.seed_enriched("summaries", 0);
    h.worker.reject_next(2);

    let body = h.start().await;
    assert_eq!(body["dispatches"][0]["outcome"], "completed");
    assert_eq!(h.worker.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn drained_job_completes_on_next_dispatch() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 10);
    h.seed_enriched("summaries", 0);

    let ids = TestHarness::job_ids(&h.start().await);
    let job = h.job(&ids[0]);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.completed_batches, 1);

    let body = h.action(ControlRequest::Continue).await;
    assert_eq!(body["dispatches"][0]["outcome"], "job_completed");

    let job = h.job(&ids[0]);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percentage, 100);
    assert!(job.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn job_with_failed_batches_still_completes() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 20);
    h.seed_enriched("summaries", 0);
    h.worker.set_mode(WorkerMode::Fail);

    let ids = TestHarness::job_ids(&h.start().await);
    h.action(ControlRequest::Continue).await;
    let body = h.action(ControlRequest::Continue).await;
    assert_eq!(body["dispatches"][0]["outcome"], "job_completed");

    let job = h.job(&ids[0]);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_batches, 2);
    assert_eq!(job.completed_batches, 0);
    assert!(job.completed_batches + job.failed_batches <= job.total_batches);
    assert_eq!(job.error_message.as_deref(), Some("model returned garbage"));
}

#[tokio::test(start_paused = true)]
async fn silent_worker_times_out() {
    let h = TestHarness::new(single_task(10).completion_timeout_ms(200));
    h.seed_source("articles", 10);
    h.seed_enriched("summaries", 0);
    h.worker.set_mode(WorkerMode::Silent);

    let ids = TestHarness::job_ids(&h.start().await);
    let batch = &h.batches(&ids[0])[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error_message.as_ref().unwrap().starts_with("Timeout"));

    let job = h.job(&ids[0]);
    assert_eq!(job.failed_batches, 1);
    assert!(job.error_message.unwrap().starts_with("Timeout"));
}

#[tokio::test(start_paused = true)]
async fn ghost_locked_batch_is_released_and_redispatched() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 20);
    h.seed_enriched("summaries", 0);

    let ids = TestHarness::job_ids(&h.start().await);
    h.db.with_conn(|conn| {
        conn.execute(
            "UPDATE batch_progress SET status = 'processing', started_at = NULL
             WHERE job_id = ?1 AND batch_number = 1",
            [&ids[0]],
        )?;
        Ok(())
    })
    .unwrap();

    let body = h.action(ControlRequest::Continue).await;
    assert_eq!(body["dispatches"][0]["outcome"], "completed");
    assert_eq!(body["dispatches"][0]["batch_number"], 1);

    let statuses: Vec<BatchStatus> = h.batches(&ids[0]).iter().map(|b| b.status).collect();
    assert_eq!(statuses, vec![BatchStatus::Completed, BatchStatus::Completed]);
}

#[tokio::test(start_paused = true)]
async fn aborted_job_is_not_dispatched() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 30);
    h.seed_enriched("summaries", 0);

    let ids = TestHarness::job_ids(&h.start().await);
    enrichd::db::job_repo::abort(&h.db, &ids, "operator").unwrap();
    let calls = h.worker.calls();

    let body = h.action(ControlRequest::Continue).await;
    assert!(body["dispatches"].as_array().unwrap().is_empty());
    assert_eq!(h.worker.calls(), calls);
    assert_eq!(h.job(&ids[0]).status, JobStatus::Aborted);
}

#[tokio::test(start_paused = true)]
async fn batch_transitions_are_broadcast() {
    let h = TestHarness::new(single_task(10));
    h.seed_source("articles", 10);
    h.seed_enriched("summaries", 0);
    let mut events = h.orchestrator.broadcaster().subscribe();

    h.start().await;
    h.action(ControlRequest::Continue).await;

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        phases.push(event.phase);
    }
    assert_eq!(
        phases,
        vec![
            BatchPhase::Claimed,
            BatchPhase::Invoked,
            BatchPhase::Completed,
            BatchPhase::JobCompleted
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn resumed_job_keeps_its_planned_batch_layout() {
    let h = TestHarness::new(single_task(15));
    h.seed_source("articles", 47);
    h.seed_enriched("summaries", 0);
    let ids = TestHarness::job_ids(&h.start().await);
    assert_eq!(h.worker.calls(), 1);

    // Same store, restarted with a different batch size configured
    let resumed = Orchestrator::new(
        h.db.clone(),
        single_task(10).build(),
        h.worker.clone(),
        Arc::new(SqliteCollectionCounter::new(h.db.clone())),
    )
    .unwrap();
    let reply = resumed.handle(ControlRequest::Continue).await;
    assert!(reply.is_success(), "continue failed: {}", reply.body);

    let requests = h.worker.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1.batch_size, 15);
    assert_eq!(requests[1].1.start_from, 15);

    let batches = h.batches(&ids[0]);
    assert_eq!(batches.len(), 4);
    assert_eq!(batches[1].status, BatchStatus::Completed);
    assert_eq!(batches[1].items_processed, 15);
    assert_eq!(batches[2].status, BatchStatus::Pending);
}
