//! Scheduling core: planning jobs, dispatching batches, recovering stuck
//! work, and the long-running processor that ties them together.

pub mod admin;
pub mod dispatcher;
pub mod planner;
pub mod processor;
pub mod watchdog;

pub use admin::{AbortReport, PurgeReport};
pub use dispatcher::{BatchDispatcher, DispatchOutcome};
pub use planner::{JobPlanner, PlanReport, TaskPlan};
pub use processor::{
    ContinuousProcessor, JobDispatch, ProcessorExit, ProcessorHandle, ProcessorInfo,
    ProcessorState, ProcessorSummary,
};
pub use watchdog::{RecoveryReport, Watchdog};
