//! In-memory task status store shared by the HTTP layer and running pipelines.
//!
//! Each task has one writer (its pipeline) and any number of readers. Updates
//! are last-writer-wins. Cancellation is a status value that the pipeline
//! polls at step boundaries.

use crate::llm::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const CANCELLED_MESSAGE: &str = "Обработка отменена пользователем";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub started_at: DateTime<Utc>,
    pub prompt_size: usize,
    pub tokens_used: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Seconds since `started_at`, refreshed on every update.
    pub time_elapsed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub status: TaskState,
    pub stage: String,
    pub progress: u8,
    pub total_steps: usize,
    pub current_step: usize,
    pub message: String,
    pub metrics: TaskMetrics,
    pub errors: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn new(task_id: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            status: TaskState::Pending,
            stage: "initialization".to_string(),
            progress: 0,
            total_steps: 0,
            current_step: 0,
            message: "Инициализация...".to_string(),
            metrics: TaskMetrics {
                started_at: now,
                prompt_size: 0,
                tokens_used: 0,
                prompt_tokens: 0,
                completion_tokens: 0,
                time_elapsed: 0.0,
            },
            errors: Vec::new(),
            updated_at: now,
        }
    }

    fn apply(&mut self, update: StatusUpdate) {
        // A cancelled task stays cancelled whatever a late writer reports.
        if let Some(status) = update.status {
            if self.status != TaskState::Cancelled {
                self.status = status;
            }
        }
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(total) = update.total_steps {
            self.total_steps = total;
        }
        if let Some(current) = update.current_step {
            self.current_step = current;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(size) = update.prompt_size {
            self.metrics.prompt_size = size;
        }
        if let Some(usage) = update.usage {
            self.metrics.tokens_used = usage.total_tokens;
            self.metrics.prompt_tokens = usage.prompt_tokens;
            self.metrics.completion_tokens = usage.completion_tokens;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.metrics.time_elapsed = (self.updated_at - self.metrics.started_at)
            .num_milliseconds() as f64
            / 1000.0;
    }
}

/// A partial status change; unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<TaskState>,
    pub stage: Option<String>,
    pub progress: Option<u8>,
    pub total_steps: Option<usize>,
    pub current_step: Option<usize>,
    pub message: Option<String>,
    pub prompt_size: Option<usize>,
    pub usage: Option<Usage>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, status: TaskState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn steps(mut self, current: usize, total: usize) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn prompt_size(mut self, size: usize) -> Self {
        self.prompt_size = Some(size);
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Thread-safe map of task id to status.
#[derive(Clone, Default)]
pub struct StatusStore {
    tasks: Arc<RwLock<HashMap<String, TaskStatus>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task_id: &str) -> TaskStatus {
        let status = TaskStatus::new(task_id);
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task_id.to_string(), status.clone());
        status
    }

    /// Apply `update` to a task. Unknown tasks are ignored.
    pub fn update(&self, task_id: &str, update: StatusUpdate) -> bool {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(task_id) {
            Some(status) => {
                status.apply(update);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read().unwrap();
        tasks.get(task_id).cloned()
    }

    pub fn add_error(&self, task_id: &str, error: impl Into<String>) {
        let mut tasks = self.tasks.write().unwrap();
        if let Some(status) = tasks.get_mut(task_id) {
            status.errors.push(error.into());
            status.touch();
        }
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        let tasks = self.tasks.read().unwrap();
        tasks
            .get(task_id)
            .is_some_and(|s| s.status == TaskState::Cancelled)
    }

    /// Mark a task cancelled. Returns false for unknown or already finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(task_id) {
            Some(status) if !status.status.is_terminal() => {
                status.status = TaskState::Cancelled;
                status.message = CANCELLED_MESSAGE.to_string();
                status.touch();
                true
            }
            _ => false,
        }
    }

    /// Drop finished tasks that have not changed for `max_age`.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let mut tasks = self.tasks.write().unwrap();
        let before = tasks.len();
        tasks.retain(|_, s| !(s.status.is_terminal() && s.updated_at <= cutoff));
        before - tasks.len()
    }
}

// ============================================================================
// Pipeline seams
// ============================================================================

/// Receives progress updates from a running pipeline.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: StatusUpdate);
}

/// Polled by the pipeline at step boundaries.
pub trait Cancellation: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Binds one task id of a [`StatusStore`] to both seams.
#[derive(Clone)]
pub struct TaskTracker {
    store: StatusStore,
    task_id: String,
}

impl TaskTracker {
    pub fn new(store: StatusStore, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn add_error(&self, error: impl Into<String>) {
        self.store.add_error(&self.task_id, error);
    }
}

impl ProgressSink for TaskTracker {
    fn report(&self, update: StatusUpdate) {
        self.store.update(&self.task_id, update);
    }
}

impl Cancellation for TaskTracker {
    fn is_cancelled(&self) -> bool {
        self.store.is_cancelled(&self.task_id)
    }
}

/// Discards progress and never cancels.
pub struct Detached;

impl ProgressSink for Detached {
    fn report(&self, _update: StatusUpdate) {}
}

impl Cancellation for Detached {
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_update() {
        let store = StatusStore::new();
        let created = store.create("t1");
        assert_eq!(created.status, TaskState::Pending);

        assert!(store.update(
            "t1",
            StatusUpdate::new()
                .state(TaskState::Processing)
                .steps(1, 3)
                .progress(33)
                .usage(Usage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: 120,
                }),
        ));

        let status = store.get("t1").unwrap();
        assert_eq!(status.status, TaskState::Processing);
        assert_eq!(status.current_step, 1);
        assert_eq!(status.total_steps, 3);
        assert_eq!(status.progress, 33);
        assert_eq!(status.metrics.tokens_used, 120);
        assert_eq!(status.stage, "initialization");
    }

    #[test]
    fn test_unknown_task() {
        let store = StatusStore::new();
        assert!(!store.update("missing", StatusUpdate::new().progress(10)));
        assert!(store.get("missing").is_none());
        assert!(!store.is_cancelled("missing"));
        assert!(!store.cancel("missing"));
    }

    #[test]
    fn test_cancel() {
        let store = StatusStore::new();
        store.create("t1");
        assert!(store.cancel("t1"));
        assert!(store.is_cancelled("t1"));
        assert_eq!(store.get("t1").unwrap().message, CANCELLED_MESSAGE);

        store.create("t2");
        store.update("t2", StatusUpdate::new().state(TaskState::Completed));
        assert!(!store.cancel("t2"));
    }

    #[test]
    fn test_cancelled_state_is_sticky() {
        let store = StatusStore::new();
        store.create("t1");
        store.cancel("t1");
        store.update(
            "t1",
            StatusUpdate::new().state(TaskState::Processing).progress(10),
        );

        let status = store.get("t1").unwrap();
        assert_eq!(status.status, TaskState::Cancelled);
        assert_eq!(status.progress, 10);
    }

    #[test]
    fn test_tracker_and_errors() {
        let store = StatusStore::new();
        store.create("t1");
        let tracker = TaskTracker::new(store.clone(), "t1");
        tracker.report(StatusUpdate::new().message("Шаг 1"));
        tracker.add_error("instrument: failed");
        assert!(!tracker.is_cancelled());

        let status = store.get("t1").unwrap();
        assert_eq!(status.message, "Шаг 1");
        assert_eq!(status.errors, vec!["instrument: failed".to_string()]);
    }

    #[test]
    fn test_cleanup_only_drops_finished_tasks() {
        let store = StatusStore::new();
        store.create("running");
        store.create("done");
        store.update("done", StatusUpdate::new().state(TaskState::Completed));

        assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(store.cleanup_older_than(Duration::ZERO), 1);
        assert!(store.get("running").is_some());
        assert!(store.get("done").is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let store = StatusStore::new();
        let status = store.create("t1");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["metrics"]["prompt_size"], 0);
    }
}
