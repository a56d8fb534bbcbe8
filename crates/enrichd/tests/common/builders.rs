//! Builder for test configurations.
//!
//! Timings default to a few milliseconds so that tests running on paused
//! tokio time never wait on the production defaults.

#![allow(dead_code)]

use serde_json::{json, Value};

use enrichd::{load_config_from_str, Config};

pub struct ConfigBuilder {
    tasks: Vec<Value>,
    background: bool,
    completion_timeout_ms: u64,
    max_attempts: u32,
    smoke_test_tasks: Vec<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            background: true,
            completion_timeout_ms: 1_000,
            max_attempts: 5,
            smoke_test_tasks: Vec::new(),
        }
    }

    /// Adds a task reading `source` and writing `target`.
    pub fn task(
        mut self,
        name: &str,
        source: &str,
        target: &str,
        batch_size: u32,
        priority: i32,
    ) -> Self {
        self.tasks.push(json!({
            "name": name,
            "worker": format!("enrich-{}", name),
            "source": source,
            "target": target,
            "batch_size": batch_size,
            "priority": priority,
        }));
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn completion_timeout_ms(mut self, ms: u64) -> Self {
        self.completion_timeout_ms = ms;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn smoke_test_tasks(mut self, names: &[&str]) -> Self {
        self.smoke_test_tasks = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn to_json(&self) -> String {
        json!({
            "version": "1.0",
            "worker": { "base_url": "http://localhost:54321/functions/v1" },
            "tasks": self.tasks,
            "retry": {
                "max_attempts": self.max_attempts,
                "base_delay_ms": 10,
                "max_delay_ms": 100
            },
            "dispatcher": {
                "first_poll_ms": 5,
                "poll_interval_ms": 5,
                "completion_timeout_ms": self.completion_timeout_ms
            },
            "processor": {
                "background": self.background,
                "cycle_sleep_ms": 20,
                "watchdog_interval_ms": 60000,
                "max_consecutive_errors": 3
            },
            "smoke_test_tasks": self.smoke_test_tasks,
        })
        .to_string()
    }

    /// Builds the config through the regular loader, so schema and semantic
    /// validation apply.
    pub fn build(&self) -> Config {
        load_config_from_str(&self.to_json()).expect("test config should be valid")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
