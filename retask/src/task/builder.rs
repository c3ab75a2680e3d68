use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::{
    backend::{Backend, EnqueuableTask},
    RetaskError,
};

use super::{Arguments, Priority, TaskId};

/// Builder for enqueuing a new task.
///
/// # Example
///
/// ```
/// # use retask::prelude::*;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use retask::backend::memory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
///
/// let parent = TaskBuilder::new("fetch_report")
///     .with_arg("2025-04")
///     .enqueue_to_backend(&backend)
///     .await
///     .unwrap();
///
/// let child = TaskBuilder::new("email_report")
///     .with_priority(Priority::High)
///     .with_kwarg("to", "ops@example.com")
///     .depends_on(parent)
///     .with_max_retries(3)
///     .enqueue_to_backend(&backend)
///     .await
///     .unwrap();
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    priority: i32,
    queue: String,
    arguments: Arguments,
    scheduled_at: Option<DateTime<Utc>>,
    timeout: u32,
    max_retries: u32,
    autoretry: bool,
    retry_delay: u32,
    retry_backoff: f64,
    dependencies: Vec<TaskId>,
}

impl TaskBuilder {
    pub const DEFAULT_QUEUE: &'static str = "default";
    pub const DEFAULT_TIMEOUT: u32 = 300;
    pub const DEFAULT_MAX_RETRIES: u32 = 1;
    pub const DEFAULT_RETRY_DELAY: u32 = 60;
    pub const DEFAULT_RETRY_BACKOFF: f64 = 2.0;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::Medium.into(),
            queue: Self::DEFAULT_QUEUE.to_owned(),
            arguments: Arguments::default(),
            scheduled_at: None,
            timeout: Self::DEFAULT_TIMEOUT,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            autoretry: true,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            dependencies: Vec::new(),
        }
    }

    pub fn with_priority(self, priority: impl Into<i32>) -> Self {
        Self {
            priority: priority.into(),
            ..self
        }
    }

    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    pub fn with_arguments(self, arguments: Arguments) -> Self {
        Self { arguments, ..self }
    }

    pub fn with_arg(self, value: impl Into<Value>) -> Self {
        Self {
            arguments: self.arguments.arg(value),
            ..self
        }
    }

    pub fn with_kwarg(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            arguments: self.arguments.kwarg(key, value),
            ..self
        }
    }

    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            scheduled_at: Some(Utc::now() + delay),
            ..self
        }
    }

    /// Timeout for a single attempt, in seconds.
    pub fn with_timeout(self, timeout: u32) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_autoretry(self, autoretry: bool) -> Self {
        Self { autoretry, ..self }
    }

    /// Base delay, in seconds, before the first retry.
    pub fn with_retry_delay(self, retry_delay: u32) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn with_retry_backoff(self, retry_backoff: f64) -> Self {
        Self {
            retry_backoff,
            ..self
        }
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_dependencies(self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        dependencies.into_iter().fold(self, Self::depends_on)
    }

    pub fn build(self) -> EnqueuableTask {
        EnqueuableTask {
            name: self.name,
            priority: self.priority,
            queue: self.queue,
            arguments: self.arguments,
            scheduled_at: self.scheduled_at,
            timeout: self.timeout,
            max_retries: self.max_retries,
            autoretry: self.autoretry,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            dependencies: self.dependencies,
        }
    }

    pub async fn enqueue_to_backend<B>(self, backend: &B) -> Result<TaskId, RetaskError>
    where
        B: Backend + ?Sized,
    {
        let name = self.name.clone();
        let task_id = backend.enqueue(self.build()).await?;
        tracing::debug!(%task_id, "Enqueued task {name}");
        Ok(task_id)
    }
}
