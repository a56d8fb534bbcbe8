//! Batch progress broadcaster for real-time pipeline streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened to a batch or job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Claimed,
    Invoked,
    Completed,
    Failed,
    TimedOut,
    GhostReleased,
    Reclaimed,
    JobCompleted,
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchPhase::Claimed => write!(f, "Claimed"),
            BatchPhase::Invoked => write!(f, "Worker invoked"),
            BatchPhase::Completed => write!(f, "Completed"),
            BatchPhase::Failed => write!(f, "Failed"),
            BatchPhase::TimedOut => write!(f, "Timed out"),
            BatchPhase::GhostReleased => write!(f, "Ghost lock released"),
            BatchPhase::Reclaimed => write!(f, "Reclaimed by watchdog"),
            BatchPhase::JobCompleted => write!(f, "Job completed"),
        }
    }
}

/// Progress event for a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub job_id: String,
    /// Absent for job-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    pub phase: BatchPhase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEvent {
    pub fn new(job_id: &str, batch_number: Option<u32>, phase: BatchPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            batch_number,
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Creates a failure event for a batch.
    pub fn failed(job_id: &str, batch_number: u32, phase: BatchPhase, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(job_id, Some(batch_number), phase, "Batch failed")
        }
    }
}

/// Broadcasts batch events to any number of subscribers.
#[derive(Clone)]
pub struct BatchProgressBroadcaster {
    sender: Arc<broadcast::Sender<BatchEvent>>,
}

impl BatchProgressBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: BatchEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for BatchProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = BatchProgressBroadcaster::new(4);
        broadcaster.send(BatchEvent::new("job", Some(0), BatchPhase::Claimed, "claimed"));
    }

    #[test]
    fn test_send_receive() {
        let broadcaster = BatchProgressBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(BatchEvent::failed("job-1", 3, BatchPhase::TimedOut, "no answer"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, "job-1");
        assert_eq!(received.batch_number, Some(3));
        assert_eq!(received.phase, BatchPhase::TimedOut);
        assert_eq!(received.error.as_deref(), Some("no answer"));
    }

    #[test]
    fn test_event_serialization() {
        let event = BatchEvent::new("job-1", None, BatchPhase::JobCompleted, "done");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["phase"], "job_completed");
        assert!(json.get("batchNumber").is_none());
        assert!(json.get("error").is_none());
    }
}
