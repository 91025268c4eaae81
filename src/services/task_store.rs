//! In-memory task store with dedupe indices and a history ring.
//!
//! The store is the single authority for live task state. All access
//! goes through `TaskService`, which owns the lock; the store itself is
//! synchronous and lock-free.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::domain::models::goal::GoalKey;
use crate::domain::models::task::{Task, TaskId, TaskKind, TaskSource, TaskStatus};

/// Terminal tasks retained for inspection after eviction.
const HISTORY_CAPACITY: usize = 256;

/// Minimum title token overlap for structural similarity dedupe.
const SIMILARITY_THRESHOLD: f64 = 0.7;

/// Compact record kept in the history ring.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Sterling dedupe slot: reserved during creation, bound on finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SterlingSlot {
    Reserved,
    Bound(TaskId),
}

/// Outcome of a sterling dedupe reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key is free and now reserved for the caller.
    Reserved,
    /// A live task already owns the key.
    Existing(TaskId),
}

/// Aggregate progress counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub pending: usize,
    pub active: usize,
    pub pending_planning: usize,
    pub paused: usize,
    pub unplannable: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub source: Option<TaskSource>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    children: HashMap<TaskId, Vec<TaskId>>,
    by_subtask_key: HashMap<String, TaskId>,
    sterling_dedupe: HashMap<String, SterlingSlot>,
    history: VecDeque<HistoryEntry>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Insert or replace a task, maintaining every index.
    pub fn upsert(&mut self, task: Task) {
        if let Some(parent) = task.metadata.parent_task_id {
            let siblings = self.children.entry(parent).or_default();
            if !siblings.contains(&task.id) {
                siblings.push(task.id);
            }
        }
        if let Some(key) = &task.metadata.subtask_key {
            self.by_subtask_key.insert(key.clone(), task.id);
        }
        if task.is_terminal() {
            self.record_history(&task);
        }
        self.tasks.insert(task.id, task);
    }

    fn record_history(&mut self, task: &Task) {
        if self
            .history
            .back()
            .is_some_and(|entry| entry.task_id == task.id && entry.status == task.status)
        {
            return;
        }
        self.history.push_back(HistoryEntry {
            task_id: task.id,
            title: task.title.clone(),
            status: task.status,
            recorded_at: Utc::now(),
        });
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn all(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.source.is_none_or(|s| t.source == s))
            .filter(|t| {
                filter
                    .category
                    .as_deref()
                    .is_none_or(|c| t.category.as_deref() == Some(c))
            })
            .collect();
        tasks.sort_by_key(|t| t.metadata.created_at);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Every non-terminal task.
    pub fn non_terminal(&self) -> Vec<&Task> {
        self.tasks.values().filter(|t| !t.is_terminal()).collect()
    }

    pub fn children_of(&self, parent: &TaskId) -> Vec<&Task> {
        self.children
            .get(parent)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Non-terminal task holding the given subtask key, if any.
    pub fn find_by_subtask_key(&self, key: &str) -> Option<&Task> {
        self.by_subtask_key
            .get(key)
            .and_then(|id| self.tasks.get(id))
            .filter(|t| !t.is_terminal())
    }

    /// Non-terminal task bound to the given (goal_type, goal_key).
    pub fn find_goal_task(&self, goal_type: &str, goal_key: &GoalKey) -> Option<&Task> {
        self.tasks.values().find(|t| {
            !t.is_terminal()
                && t.metadata.goal_binding.as_ref().is_some_and(|b| {
                    b.goal_type == goal_type && &b.goal_key == goal_key
                })
        })
    }

    /// Completed tasks bound to the given (goal_type, goal_key).
    pub fn completed_goal_tasks(&self, goal_type: &str, goal_key: &GoalKey) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && t.metadata.goal_binding.as_ref().is_some_and(|b| {
                        b.goal_type == goal_type && &b.goal_key == goal_key
                    })
            })
            .collect()
    }

    /// Reserve a sterling dedupe key, or report the live owner.
    pub fn reserve_sterling_key(&mut self, key: &str) -> Reservation {
        if let Some(slot) = self.sterling_dedupe.get(key) {
            match slot {
                SterlingSlot::Reserved => {
                    // A concurrent creation holds the key; treat as busy by
                    // pointing the caller at nothing new. The reservation
                    // owner will bind or release it.
                }
                SterlingSlot::Bound(id) => {
                    if self.tasks.get(id).is_some_and(|t| !t.is_terminal()) {
                        return Reservation::Existing(*id);
                    }
                }
            }
        }
        self.sterling_dedupe
            .insert(key.to_string(), SterlingSlot::Reserved);
        Reservation::Reserved
    }

    /// Bind a reserved key to its finalized task.
    pub fn bind_sterling_key(&mut self, key: &str, id: TaskId) {
        self.sterling_dedupe
            .insert(key.to_string(), SterlingSlot::Bound(id));
    }

    /// Release a reservation that never finalized.
    pub fn release_sterling_key(&mut self, key: &str) {
        if self.sterling_dedupe.get(key) == Some(&SterlingSlot::Reserved) {
            self.sterling_dedupe.remove(key);
        }
    }

    /// Find a structurally similar pending task: same kind and source,
    /// title token overlap at or above the threshold.
    pub fn find_similar_pending(
        &self,
        kind: &TaskKind,
        source: TaskSource,
        title: &str,
    ) -> Option<&Task> {
        let tokens = title_tokens(title);
        if tokens.is_empty() {
            return None;
        }
        self.tasks.values().find(|t| {
            t.status == TaskStatus::Pending
                && &t.kind == kind
                && t.source == source
                && title_similarity(&tokens, &title_tokens(&t.title)) >= SIMILARITY_THRESHOLD
        })
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Active => summary.active += 1,
                TaskStatus::PendingPlanning => summary.pending_planning += 1,
                TaskStatus::Paused => summary.paused += 1,
                TaskStatus::Unplannable => summary.unplannable += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Drop verification leftovers and stale terminal tasks beyond the
    /// history ring. Terminal tasks themselves stay queryable.
    pub fn cleanup_terminal_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.is_terminal()
                    && t.metadata
                        .completed_at
                        .is_some_and(|completed| completed < cutoff)
            })
            .map(|t| t.id)
            .collect();
        for id in &stale {
            if let Some(task) = self.tasks.remove(id) {
                if let Some(key) = &task.metadata.subtask_key {
                    self.by_subtask_key.remove(key);
                }
            }
        }
        stale.len()
    }
}

fn title_tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn title_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    #[allow(clippy::cast_precision_loss)]
    let denom = a.len().max(b.len()) as f64;
    #[allow(clippy::cast_precision_loss)]
    let overlap = shared as f64;
    overlap / denom
}
