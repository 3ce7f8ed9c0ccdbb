//! Task plans and their validation.
//!
//! A plan is a set of [`TaskNode`]s whose `dependencies` edges mean "must
//! complete before". Plans are validated once, before anything runs: ids are
//! unique, every dependency names a task in the plan, and the graph is
//! acyclic. The acyclicity check peels off "levels" of tasks whose
//! dependencies are all in earlier levels; if a pass peels nothing while
//! tasks remain, those tasks sit on or behind a cycle.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Role of the agent expected to run this task (e.g. "researcher").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<String>,
    /// Higher runs first within a ready batch.
    #[serde(default)]
    pub priority: i32,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            assigned_role: None,
            priority: 0,
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.assigned_role = Some(role.into());
        self
    }
}

/// Errors that reject a plan before execution.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency graph contains a cycle among: {}", .remaining.join(", "))]
    CycleDetected { remaining: Vec<String> },

    #[error("invalid plan JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read plan: {0}")]
    Io(#[from] std::io::Error),
}

/// A task graph, as authored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<TaskNode>,
}

impl TaskPlan {
    pub const fn new(tasks: Vec<TaskNode>) -> Self {
        Self { tasks }
    }

    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self, PlanError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Check ids, references and acyclicity.
    pub fn validate(&self) -> Result<(), PlanError> {
        self.batches().map(|_| ())
    }

    /// Topological levels: every task appears in the first level after all
    /// of its dependencies. Tasks keep plan order within a level.
    pub fn batches(&self) -> Result<Vec<Vec<String>>, PlanError> {
        let mut ids: HashSet<&str> = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(PlanError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut placed: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        let mut batches: Vec<Vec<String>> = Vec::new();
        while placed.len() < self.tasks.len() {
            let level = batches.len();
            let batch: Vec<&TaskNode> = self
                .tasks
                .iter()
                .filter(|t| !placed.contains_key(t.id.as_str()))
                .filter(|t| {
                    t.dependencies
                        .iter()
                        .all(|d| placed.get(d.as_str()).is_some_and(|&l| l < level))
                })
                .collect();

            if batch.is_empty() {
                let remaining = self
                    .tasks
                    .iter()
                    .filter(|t| !placed.contains_key(t.id.as_str()))
                    .map(|t| t.id.clone())
                    .collect();
                return Err(PlanError::CycleDetected { remaining });
            }
            for task in &batch {
                placed.insert(task.id.as_str(), level);
            }
            batches.push(batch.into_iter().map(|t| t.id.clone()).collect());
        }
        Ok(batches)
    }
}
