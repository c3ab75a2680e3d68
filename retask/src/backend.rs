//! The storage abstraction behind retask.
//!
//! A [`Backend`] is the single source of truth for task state. Every state change a worker or the
//! scheduler makes goes through it, and its [`Backend::claim_one`] is the only way a task moves
//! from `pending` to `in_progress`: implementations must make that read-filter-order-mark
//! sequence atomic so that at most one worker ever holds a given task.
//!
//! [`memory::InMemoryBackend`] is a correct (if not especially fast) implementation used in
//! tests; `retask-sqlx` provides the Postgres backend.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    dependency::StructuralError,
    engine::ExecutionError,
    periodic::{PeriodicTask, PeriodicTaskDefinition, PeriodicTaskId},
    task::{query::Query, Arguments, Task, TaskId, TaskStatus},
};

pub mod memory;
mod queryable;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Persists a new pending task, validating its dependencies first.
    ///
    /// Unknown dependencies are rejected with [`BackendError::TaskNotFound`]; nothing is written
    /// in that case.
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, BackendError>;

    /// Adds the edge `task -> depends_on`, rejecting it with [`BackendError::Structural`] when it
    /// would close a cycle.
    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), BackendError>;

    /// Atomically claims the most urgent eligible task for `worker_id`.
    ///
    /// Eligible means pending, due and ready. Candidates are ordered by priority (highest first)
    /// then by creation time. The claimed task is returned already marked `in_progress`.
    async fn claim_one(&self, worker_id: &str) -> Result<Option<Task>, BackendError>;

    /// Whether every dependency of the task has completed.
    async fn is_ready(&self, id: TaskId) -> Result<bool, BackendError>;

    async fn mark_task_complete(&self, id: TaskId) -> Result<(), BackendError>;

    /// Records the failure and puts the task back to pending, claimable from `scheduled_at`.
    async fn mark_task_retryable(
        &self,
        id: TaskId,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError>;

    /// Records the failure and moves the task to the terminal `failed` status.
    async fn mark_task_failed(&self, id: TaskId, error: ExecutionError)
        -> Result<(), BackendError>;

    /// Cancels a task that has not started yet.
    async fn cancel_task(&self, id: TaskId) -> Result<(), BackendError>;

    async fn archive_task(&self, id: TaskId) -> Result<(), BackendError>;

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Task>, BackendError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, BackendError> {
        Ok(self.query(Query::IdEquals(id)).await?.pop())
    }

    /// Creates or updates the periodic task with the definition's name.
    ///
    /// An update replaces the task name, arguments, schedule and enabled flag but keeps the run
    /// history.
    async fn upsert_periodic_task(
        &self,
        definition: PeriodicTaskDefinition,
    ) -> Result<PeriodicTaskId, BackendError>;

    async fn enabled_periodic_tasks(&self) -> Result<Vec<PeriodicTask>, BackendError>;

    /// Sets `last_run_at` and increments `total_run_count`.
    async fn record_periodic_run(
        &self,
        id: PeriodicTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    async fn set_periodic_task_enabled(
        &self,
        id: PeriodicTaskId,
        enabled: bool,
    ) -> Result<(), BackendError>;
}

#[async_trait]
impl<B> Backend for std::sync::Arc<B>
where
    B: Backend + ?Sized,
{
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, BackendError> {
        (**self).enqueue(task).await
    }

    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), BackendError> {
        (**self).add_dependency(task, depends_on).await
    }

    async fn claim_one(&self, worker_id: &str) -> Result<Option<Task>, BackendError> {
        (**self).claim_one(worker_id).await
    }

    async fn is_ready(&self, id: TaskId) -> Result<bool, BackendError> {
        (**self).is_ready(id).await
    }

    async fn mark_task_complete(&self, id: TaskId) -> Result<(), BackendError> {
        (**self).mark_task_complete(id).await
    }

    async fn mark_task_retryable(
        &self,
        id: TaskId,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        (**self).mark_task_retryable(id, scheduled_at, error).await
    }

    async fn mark_task_failed(
        &self,
        id: TaskId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        (**self).mark_task_failed(id, error).await
    }

    async fn cancel_task(&self, id: TaskId) -> Result<(), BackendError> {
        (**self).cancel_task(id).await
    }

    async fn archive_task(&self, id: TaskId) -> Result<(), BackendError> {
        (**self).archive_task(id).await
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Task>, BackendError> {
        (**self).query(query).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, BackendError> {
        (**self).get_task(id).await
    }

    async fn upsert_periodic_task(
        &self,
        definition: PeriodicTaskDefinition,
    ) -> Result<PeriodicTaskId, BackendError> {
        (**self).upsert_periodic_task(definition).await
    }

    async fn enabled_periodic_tasks(&self) -> Result<Vec<PeriodicTask>, BackendError> {
        (**self).enabled_periodic_tasks().await
    }

    async fn record_periodic_run(
        &self,
        id: PeriodicTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        (**self).record_periodic_run(id, ran_at).await
    }

    async fn set_periodic_task_enabled(
        &self,
        id: PeriodicTaskId,
        enabled: bool,
    ) -> Result<(), BackendError> {
        (**self).set_periodic_task_enabled(id, enabled).await
    }
}

/// A task ready to be handed to [`Backend::enqueue`], usually built with
/// [`TaskBuilder`](crate::task::builder::TaskBuilder).
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableTask {
    pub name: String,
    pub priority: i32,
    pub queue: String,
    pub arguments: Arguments,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout: u32,
    pub max_retries: u32,
    pub autoretry: bool,
    pub retry_delay: u32,
    pub retry_backoff: f64,
    pub dependencies: Vec<TaskId>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Periodic task not found: {0}")]
    PeriodicTaskNotFound(PeriodicTaskId),
    #[error("Task {id} cannot transition from {status}")]
    InvalidTransition { id: TaskId, status: TaskStatus },
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("Value {value} of {field} does not fit the store")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("Store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}
