//! The task data model.
//!
//! A [`Task`] is a single unit of work stored in the backend. Tasks are created through
//! [`builder::TaskBuilder`] (or by the periodic scheduler), claimed by exactly one worker, and
//! finally end up in one of the terminal states: [`TaskStatus::Completed`],
//! [`TaskStatus::Failed`] or [`TaskStatus::Canceled`].
use std::{collections::VecDeque, fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{backoff::BackoffStrategy, engine::Invocation};

pub mod builder;
pub mod query;

/// Opaque identifier of a task.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TaskId> for Uuid {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named priority levels.
///
/// Priorities are plain integers where higher means more urgent; these are just the commonly
/// used values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl From<Priority> for i32 {
    fn from(value: Priority) -> Self {
        match value {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

/// The payload handed to a handler: positional values plus named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// The most recent error messages of a task, oldest first.
///
/// Holds at most [`ErrorHistory::CAPACITY`] entries, pushing onto a full history evicts the
/// oldest message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorHistory(VecDeque<String>);

impl ErrorHistory {
    pub const CAPACITY: usize = 5;

    pub fn push(&mut self, message: impl Into<String>) {
        while self.0.len() >= Self::CAPACITY {
            self.0.pop_front();
        }
        self.0.push_back(message.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.back().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for ErrorHistory {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut history = Self::default();
        iter.into_iter().for_each(|message| history.push(message));
        history
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub queue: String,
    pub arguments: Arguments,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the task may be claimed, `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds allowed for a single execution attempt.
    pub timeout: u32,
    pub attempts: u32,
    pub max_retries: u32,
    pub worker_id: Option<String>,
    pub dependencies: Vec<TaskId>,
    pub last_errors: ErrorHistory,
    pub autoretry: bool,
    /// Base retry delay in seconds.
    pub retry_delay: u32,
    pub retry_backoff: f64,
    pub archived: bool,
}

impl Task {
    /// Whether another attempt is permitted.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.into())
    }

    pub fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::from_task(self)
    }

    /// Pending and due at `now`. Dependencies are not considered here.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_at.map_or(true, |scheduled_at| scheduled_at <= now)
    }

    pub(crate) fn invocation(&self) -> Invocation {
        Invocation {
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }

    pub(crate) fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
        if self.worker_id.is_none() {
            self.worker_id = Some(worker_id.to_owned());
        }
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
    }

    pub(crate) fn mark_retryable(&mut self, scheduled_at: DateTime<Utc>, message: String) {
        self.record_failure(message);
        self.scheduled_at = Some(scheduled_at);
        self.status = TaskStatus::Pending;
    }

    pub(crate) fn mark_failed(&mut self, message: String) {
        self.record_failure(message);
        self.status = TaskStatus::Failed;
    }

    fn record_failure(&mut self, message: String) {
        self.attempts += 1;
        self.last_errors.push(message);
    }
}
