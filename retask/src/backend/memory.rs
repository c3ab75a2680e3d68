//! Provides an in memory implementation of [`Backend`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests and
//! single process setups. All state lives behind one lock so every operation, the claim included,
//! is atomic.
use std::{
    cmp::Reverse,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    dependency,
    engine::ExecutionError,
    periodic::{PeriodicTask, PeriodicTaskDefinition, PeriodicTaskId},
    task::{query::Query, ErrorHistory, Task, TaskId, TaskStatus},
};

use super::{queryable::Queryable, Backend, BackendError, EnqueuableTask};

/// An in memory implementation of [`Backend`].
///
/// Clones share the same underlying state.
///
/// **This is not designed for use in a production system**, nothing is persisted.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    tasks: Arc<RwLock<Vec<Task>>>,
    periodic_tasks: Arc<RwLock<Vec<PeriodicTask>>>,
    periodic_id_counter: Arc<AtomicI32>,
}

impl InMemoryBackend {
    /// Creates a new, empty, instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn update_task<F>(&self, id: TaskId, update: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut Task) -> Result<(), BackendError>,
    {
        let mut tasks = self.tasks.write().map_err(|_| BackendError::BadState)?;
        let task = tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(BackendError::TaskNotFound(id))?;
        update(task)
    }

    fn update_in_progress<F>(&self, id: TaskId, update: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut Task),
    {
        self.update_task(id, |task| {
            if task.status != TaskStatus::InProgress {
                return Err(BackendError::InvalidTransition {
                    id,
                    status: task.status,
                });
            }
            update(task);
            Ok(())
        })
    }

    fn update_periodic_task<F>(&self, id: PeriodicTaskId, update: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut PeriodicTask),
    {
        let mut periodic_tasks = self
            .periodic_tasks
            .write()
            .map_err(|_| BackendError::BadState)?;
        let periodic_task = periodic_tasks
            .iter_mut()
            .find(|periodic_task| periodic_task.id == id)
            .ok_or(BackendError::PeriodicTaskNotFound(id))?;
        update(periodic_task);
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryBackend {
    /// Moves a task's `scheduled_at`, e.g. to make a retry due immediately.
    pub(crate) fn reschedule(&self, id: TaskId, scheduled_at: DateTime<Utc>) {
        let _ = self.update_task(id, |task| {
            task.scheduled_at = Some(scheduled_at);
            Ok(())
        });
    }
}

fn status_of(tasks: &[Task], id: TaskId) -> Option<TaskStatus> {
    tasks.iter().find(|task| task.id == id).map(|task| task.status)
}

fn ready(tasks: &[Task], task: &Task) -> bool {
    // A dangling dependency can never complete.
    dependency::is_ready(
        task.dependencies
            .iter()
            .map(|&id| status_of(tasks, id).unwrap_or(TaskStatus::Canceled)),
    )
}

impl EnqueuableTask {
    fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::new(),
            name: self.name,
            status: TaskStatus::Pending,
            priority: self.priority,
            queue: self.queue,
            arguments: self.arguments,
            created_at: now,
            scheduled_at: self.scheduled_at,
            started_at: None,
            completed_at: None,
            timeout: self.timeout,
            attempts: 0,
            max_retries: self.max_retries,
            worker_id: None,
            dependencies: self.dependencies,
            last_errors: ErrorHistory::default(),
            autoretry: self.autoretry,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            archived: false,
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, BackendError> {
        let mut tasks = self.tasks.write().map_err(|_| BackendError::BadState)?;
        if let Some(&missing) = task
            .dependencies
            .iter()
            .find(|&&id| status_of(&tasks, id).is_none())
        {
            return Err(BackendError::TaskNotFound(missing));
        }
        // A fresh task has no dependents, so its edges cannot close a cycle.
        let task = task.into_task(Utc::now());
        let id = task.id;
        tasks.push(task);
        Ok(id)
    }

    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), BackendError> {
        let mut tasks = self.tasks.write().map_err(|_| BackendError::BadState)?;
        if status_of(&tasks, depends_on).is_none() {
            return Err(BackendError::TaskNotFound(depends_on));
        }
        let index = tasks
            .iter()
            .position(|t| t.id == task)
            .ok_or(BackendError::TaskNotFound(task))?;
        if tasks[index].dependencies.contains(&depends_on) {
            return Ok(());
        }

        dependency::check_new_edge(task, depends_on, |node| {
            tasks
                .iter()
                .find(|t| t.id == node)
                .map(|t| t.dependencies.clone())
                .unwrap_or_default()
        })?;

        tasks[index].dependencies.push(depends_on);
        Ok(())
    }

    async fn claim_one(&self, worker_id: &str) -> Result<Option<Task>, BackendError> {
        let mut tasks = self.tasks.write().map_err(|_| BackendError::BadState)?;
        let now = Utc::now();
        let next = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.is_due(now) && ready(&tasks, task))
            .max_by_key(|(index, task)| (task.priority, Reverse(task.created_at), Reverse(*index)))
            .map(|(index, _)| index);

        Ok(next.map(|index| {
            let task = &mut tasks[index];
            task.mark_claimed(worker_id, now);
            task.clone()
        }))
    }

    async fn is_ready(&self, id: TaskId) -> Result<bool, BackendError> {
        let tasks = self.tasks.read().map_err(|_| BackendError::BadState)?;
        let task = tasks
            .iter()
            .find(|task| task.id == id)
            .ok_or(BackendError::TaskNotFound(id))?;
        Ok(ready(&tasks, task))
    }

    async fn mark_task_complete(&self, id: TaskId) -> Result<(), BackendError> {
        self.update_in_progress(id, |task| task.mark_completed(Utc::now()))
    }

    async fn mark_task_retryable(
        &self,
        id: TaskId,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update_in_progress(id, |task| task.mark_retryable(scheduled_at, error.message))
    }

    async fn mark_task_failed(
        &self,
        id: TaskId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update_in_progress(id, |task| task.mark_failed(error.message))
    }

    async fn cancel_task(&self, id: TaskId) -> Result<(), BackendError> {
        self.update_task(id, |task| match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Canceled;
                Ok(())
            }
            status => Err(BackendError::InvalidTransition { id, status }),
        })
    }

    async fn archive_task(&self, id: TaskId) -> Result<(), BackendError> {
        self.update_task(id, |task| {
            task.archived = true;
            Ok(())
        })
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Task>, BackendError> {
        Ok(self
            .tasks
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|task| query.matches(task))
            .cloned()
            .collect())
    }

    async fn upsert_periodic_task(
        &self,
        definition: PeriodicTaskDefinition,
    ) -> Result<PeriodicTaskId, BackendError> {
        let mut periodic_tasks = self
            .periodic_tasks
            .write()
            .map_err(|_| BackendError::BadState)?;

        if let Some(existing) = periodic_tasks
            .iter_mut()
            .find(|periodic_task| periodic_task.name == definition.name)
        {
            existing.task_name = definition.task_name;
            existing.arguments = definition.arguments;
            existing.crontab = definition.crontab;
            existing.enabled = definition.enabled;
            return Ok(existing.id);
        }

        let id = PeriodicTaskId::from(self.periodic_id_counter.fetch_add(1, Ordering::Relaxed) + 1);
        periodic_tasks.push(PeriodicTask {
            id,
            name: definition.name,
            task_name: definition.task_name,
            arguments: definition.arguments,
            crontab: definition.crontab,
            enabled: definition.enabled,
            last_run_at: None,
            total_run_count: 0,
        });
        Ok(id)
    }

    async fn enabled_periodic_tasks(&self) -> Result<Vec<PeriodicTask>, BackendError> {
        Ok(self
            .periodic_tasks
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|periodic_task| periodic_task.enabled)
            .cloned()
            .collect())
    }

    async fn record_periodic_run(
        &self,
        id: PeriodicTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.update_periodic_task(id, |periodic_task| {
            periodic_task.last_run_at = Some(ran_at);
            periodic_task.total_run_count += 1;
        })
    }

    async fn set_periodic_task_enabled(
        &self,
        id: PeriodicTaskId,
        enabled: bool,
    ) -> Result<(), BackendError> {
        self.update_periodic_task(id, |periodic_task| periodic_task.enabled = enabled)
    }
}
