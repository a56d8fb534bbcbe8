//! Shared test utilities for enrichd integration tests.
//!
//! This module provides:
//! - `TestHarness` with a file-backed store and seeded collections
//! - `ScriptedWorker`, a worker that writes its batch result into the store
//! - `ConfigBuilder` for building configurations programmatically

pub mod builders;
pub mod harness;
pub mod worker;

pub use builders::*;
pub use harness::TestHarness;
pub use worker::{ScriptedWorker, WorkerMode};
