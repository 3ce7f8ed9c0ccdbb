//! Task state tracking for a running plan.
//!
//! The [`DagScheduler`] tracks remaining in-degrees, yields "ready" tasks
//! whose dependencies have all completed, and propagates failure downstream
//! by marking every transitive dependent `Skipped`.

use std::collections::{HashMap, HashSet, VecDeque};

use super::plan::{PlanError, TaskPlan};

/// State of a task in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies completed, ready to execute.
    Ready,
    Running,
    Completed,
    Failed,
    /// Never scheduled: a dependency failed or the run was aborted.
    Skipped,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug)]
pub struct DagScheduler {
    /// Task ids in plan order.
    tasks: Vec<String>,
    priorities: HashMap<String, i32>,
    /// Reverse dependencies: `task_id` -> tasks that depend on it.
    dependents: HashMap<String, Vec<String>>,
    states: HashMap<String, TaskState>,
    /// Remaining in-degree for each task (number of uncompleted dependencies).
    in_degrees: HashMap<String, usize>,
}

impl DagScheduler {
    /// Create a scheduler for a plan, validating it first.
    pub fn new(plan: &TaskPlan) -> Result<Self, PlanError> {
        plan.validate()?;

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degrees: HashMap<String, usize> = HashMap::new();
        let mut priorities: HashMap<String, i32> = HashMap::new();
        for task in &plan.tasks {
            dependents.entry(task.id.clone()).or_default();
            priorities.insert(task.id.clone(), task.priority);
        }
        for task in &plan.tasks {
            let unique: HashSet<&String> = task.dependencies.iter().collect();
            for dep in &unique {
                dependents
                    .entry((*dep).clone())
                    .or_default()
                    .push(task.id.clone());
            }
            in_degrees.insert(task.id.clone(), unique.len());
        }

        let states = plan
            .tasks
            .iter()
            .map(|t| {
                let state = if in_degrees.get(&t.id).copied().unwrap_or(0) == 0 {
                    TaskState::Ready
                } else {
                    TaskState::Pending
                };
                (t.id.clone(), state)
            })
            .collect();

        Ok(Self {
            tasks: plan.tasks.iter().map(|t| t.id.clone()).collect(),
            priorities,
            dependents,
            states,
            in_degrees,
        })
    }

    /// Tasks currently `Ready`, highest priority first, then plan order.
    pub fn next_ready(&self) -> Vec<String> {
        let mut ready: Vec<&String> = self
            .tasks
            .iter()
            .filter(|t| self.states.get(*t) == Some(&TaskState::Ready))
            .collect();
        // Stable sort keeps plan order among equal priorities.
        ready.sort_by_key(|t| std::cmp::Reverse(self.priorities.get(*t).copied().unwrap_or(0)));
        ready.into_iter().cloned().collect()
    }

    pub fn mark_running(&mut self, task_id: &str) {
        if let Some(state) = self.states.get_mut(task_id) {
            *state = TaskState::Running;
        }
    }

    /// Mark a task completed. Returns dependents that just became ready.
    pub fn mark_completed(&mut self, task_id: &str) -> Vec<String> {
        if let Some(state) = self.states.get_mut(task_id) {
            *state = TaskState::Completed;
        }

        let mut newly_ready = Vec::new();
        if let Some(downstream) = self.dependents.get(task_id).cloned() {
            for ds in &downstream {
                if let Some(deg) = self.in_degrees.get_mut(ds) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0
                        && let Some(state) = self.states.get_mut(ds)
                        && *state == TaskState::Pending
                    {
                        *state = TaskState::Ready;
                        newly_ready.push(ds.clone());
                    }
                }
            }
        }
        newly_ready
    }

    /// Mark a task failed and skip everything downstream of it.
    /// Returns the newly skipped task ids.
    pub fn mark_failed(&mut self, task_id: &str) -> Vec<String> {
        if let Some(state) = self.states.get_mut(task_id) {
            *state = TaskState::Failed;
        }

        let mut skipped = Vec::new();
        let mut queue: VecDeque<String> = self
            .dependents
            .get(task_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(ds) = queue.pop_front() {
            if !visited.insert(ds.clone()) {
                continue;
            }
            if let Some(state) = self.states.get_mut(&ds)
                && matches!(*state, TaskState::Pending | TaskState::Ready)
            {
                *state = TaskState::Skipped;
                skipped.push(ds.clone());
            }
            if let Some(further) = self.dependents.get(&ds) {
                queue.extend(further.iter().cloned());
            }
        }
        skipped
    }

    /// Mark a single task skipped, e.g. one handed to a worker that never
    /// started, or one interrupted by cancellation.
    pub fn mark_skipped(&mut self, task_id: &str) {
        if let Some(state) = self.states.get_mut(task_id)
            && !state.is_terminal()
        {
            *state = TaskState::Skipped;
        }
    }

    /// Skip every task that has not started. Returns their ids.
    pub fn skip_unstarted(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        for id in &self.tasks {
            if let Some(state) = self.states.get_mut(id)
                && matches!(*state, TaskState::Pending | TaskState::Ready)
            {
                *state = TaskState::Skipped;
                skipped.push(id.clone());
            }
        }
        skipped
    }

    pub fn is_complete(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.states.get(task_id).copied()
    }

    pub const fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Count tasks in each state.
    pub fn counts(&self) -> HashMap<TaskState, usize> {
        let mut counts: HashMap<TaskState, usize> = HashMap::new();
        for state in self.states.values() {
            *counts.entry(*state).or_insert(0) += 1;
        }
        counts
    }
}
