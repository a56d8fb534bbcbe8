pub mod broadcast;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod worker;

pub use broadcast::{BatchEvent, BatchPhase, BatchProgressBroadcaster};
pub use config::{load_config, load_config_from_str, Config};
pub use control::{ControlReply, ControlRequest, Orchestrator};
pub use db::batch_repo::{BatchOutcome, BatchReport};
pub use db::{
    default_database_path, CollectionCounter, Database, DatabaseError, SqliteCollectionCounter,
};
pub use error::{ConfigError, EnrichError, InvocationError, OrchestratorError, Result};
pub use model::{Batch, BatchStatus, Job, JobStatus};
pub use orchestrator::{DispatchOutcome, RecoveryReport};
pub use registry::{TaskDefinition, TaskFilter, TaskRegistry};
pub use retry::RetryPolicy;
pub use worker::{HttpWorkerInvoker, WorkerInvoker, WorkerRequest, WorkerResponse};
