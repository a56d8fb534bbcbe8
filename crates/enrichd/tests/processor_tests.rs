//! Background and degraded processing modes.

mod common;

use common::{ConfigBuilder, TestHarness, WorkerMode};
use enrichd::{BatchStatus, ControlRequest, JobStatus};

fn two_tasks() -> ConfigBuilder {
    ConfigBuilder::new()
        .task("summaries", "articles", "summaries", 10, 1)
        .task("tags", "articles", "tags", 5, 2)
}

fn seed(h: &TestHarness) {
    h.seed_source("articles", 25);
    h.seed_enriched("summaries", 0);
    h.seed_enriched("tags", 0);
}

#[tokio::test(start_paused = true)]
async fn background_processor_drains_every_job() {
    let h = TestHarness::new(two_tasks());
    seed(&h);

    let body = h.start().await;
    assert_eq!(body["worker_active"], true);
    assert!(body["processorId"].is_string());
    let ids = TestHarness::job_ids(&body);
    assert_eq!(ids.len(), 2);

    let summaries = h.orchestrator.wait_for_processors().await;
    let summary = summaries.into_iter().next().unwrap().unwrap();
    assert_eq!(summary.dispatches, 3 + 5);

    for id in &ids {
        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percentage, 100);
        assert_eq!(job.completed_batches, job.total_batches);
        assert!(h
            .batches(id)
            .iter()
            .all(|b| b.status == BatchStatus::Completed));
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_advance_round_robin() {
    let h = TestHarness::new(two_tasks());
    seed(&h);

    let ids = TestHarness::job_ids(&h.start().await);
    h.orchestrator.wait_for_processors().await;

    let order: Vec<String> = h
        .worker
        .requests()
        .into_iter()
        .map(|(_, r)| r.job_id)
        .collect();
    // One batch per job per cycle while both have work
    let expected: Vec<String> = ids.iter().cycle().take(6).cloned().collect();
    assert_eq!(order[..6], expected[..]);
    assert!(order[6..].iter().all(|id| id == &ids[1]));
}

#[tokio::test(start_paused = true)]
async fn status_lists_running_processor() {
    let h = TestHarness::new(two_tasks().completion_timeout_ms(60_000));
    seed(&h);
    h.worker.set_mode(WorkerMode::Silent);

    let body = h.start().await;
    let status = h.action(ControlRequest::Status).await;
    assert_eq!(status["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(status["processors"][0]["id"], body["processorId"]);
    assert_eq!(status["processors"][0]["jobIds"].as_array().unwrap().len(), 2);

    h.orchestrator.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn degraded_mode_dispatches_inline() {
    let h = TestHarness::new(two_tasks().background(false));
    seed(&h);

    let body = h.start().await;
    assert_eq!(body["worker_active"], false);
    assert!(body.get("processorId").is_none());
    let dispatches = body["dispatches"].as_array().unwrap();
    assert_eq!(dispatches.len(), 2);
    assert!(dispatches.iter().all(|d| d["outcome"] == "completed"));

    for id in TestHarness::job_ids(&body) {
        let job = h.job(&id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.completed_batches, 1);
    }
    assert!(h.orchestrator.wait_for_processors().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn continue_drives_degraded_jobs_to_completion() {
    let h = TestHarness::new(two_tasks().background(false));
    seed(&h);

    let ids = TestHarness::job_ids(&h.start().await);
    // tags has 5 batches: 4 more dispatches plus one to record completion
    for _ in 0..5 {
        h.action(ControlRequest::Continue).await;
    }

    for id in &ids {
        assert_eq!(h.job(id).status, JobStatus::Completed);
    }
    let body = h.action(ControlRequest::Continue).await;
    assert!(body["dispatches"].as_array().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_all_stops_processors() {
    let h = TestHarness::new(two_tasks().completion_timeout_ms(60_000));
    seed(&h);
    h.worker.set_mode(WorkerMode::Silent);

    h.start().await;
    let body = h.action(ControlRequest::ClearAll).await;
    assert_eq!(body["processors_stopped"], 1);
    assert_eq!(body["jobs_deleted"], 2);
    assert_eq!(body["batches_deleted"], 3 + 5);

    let status = h.action(ControlRequest::Status).await;
    assert!(status["jobs"].as_array().unwrap().is_empty());
    assert!(status["processors"].as_array().unwrap().is_empty());
}
