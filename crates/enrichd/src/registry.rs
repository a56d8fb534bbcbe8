//! Task registry: the static set of enrichment pipelines known to the process.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One enrichment pipeline: which worker turns `source` rows into `target` rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    /// Identifier of the external worker, appended to the worker base URL.
    pub worker: String,
    pub source: String,
    pub target: String,
    pub batch_size: u32,
    /// Lower runs earlier. Tasks sharing a priority form a phase.
    pub priority: i32,
    /// Target rows carrying this version count as enriched.
    #[serde(default)]
    pub enrichment_version: Option<String>,
}

/// Which tasks a planning request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    All,
    Phase(i32),
    Named(String),
    Names(Vec<String>),
}

impl TaskFilter {
    pub fn matches(&self, task: &TaskDefinition) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Phase(priority) => task.priority == *priority,
            TaskFilter::Named(name) => task.name == *name,
            TaskFilter::Names(names) => names.iter().any(|n| *n == task.name),
        }
    }
}

/// Immutable, priority-ordered list of task definitions.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskDefinition>,
}

impl TaskRegistry {
    /// Builds a registry, rejecting duplicate names and zero batch sizes.
    pub fn new(mut tasks: Vec<TaskDefinition>) -> Result<Self, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for task in &tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::InvalidTask {
                    name: task.name.clone(),
                    reason: "Duplicate task name".to_string(),
                });
            }
            if task.batch_size == 0 {
                return Err(ConfigError::InvalidTask {
                    name: task.name.clone(),
                    reason: "batch_size must be positive".to_string(),
                });
            }
        }

        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(Self { tasks })
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn all(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    /// Tasks matching the filter, in priority order.
    pub fn select(&self, filter: &TaskFilter) -> Vec<&TaskDefinition> {
        self.tasks.iter().filter(|t| filter.matches(t)).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, priority: i32) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            worker: format!("enrich-{}", name),
            source: format!("{}_source", name),
            target: format!("{}_target", name),
            batch_size: 10,
            priority,
            enrichment_version: None,
        }
    }

    #[test]
    fn test_registry_orders_by_priority_then_name() {
        let registry =
            TaskRegistry::new(vec![task("c", 2), task("b", 1), task("a", 1)]).unwrap();
        let names: Vec<_> = registry.all().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result = TaskRegistry::new(vec![task("a", 1), task("a", 2)]);
        assert!(matches!(result, Err(ConfigError::InvalidTask { .. })));
    }

    #[test]
    fn test_registry_rejects_zero_batch_size() {
        let mut bad = task("a", 1);
        bad.batch_size = 0;
        assert!(TaskRegistry::new(vec![bad]).is_err());
    }

    #[test]
    fn test_select_filters() {
        let registry =
            TaskRegistry::new(vec![task("a", 1), task("b", 2), task("c", 2)]).unwrap();

        assert_eq!(registry.select(&TaskFilter::All).len(), 3);
        assert_eq!(registry.select(&TaskFilter::Phase(2)).len(), 2);
        assert_eq!(registry.select(&TaskFilter::Named("b".into()))[0].name, "b");
        assert!(registry.select(&TaskFilter::Named("zzz".into())).is_empty());

        let subset = registry.select(&TaskFilter::Names(vec!["c".into(), "a".into()]));
        let names: Vec<_> = subset.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
