use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use retask::{
    backend::{Backend, BackendError, EnqueuableTask},
    dependency,
    engine::ExecutionError,
    periodic::{PeriodicTask, PeriodicTaskDefinition, PeriodicTaskId},
    task::{query::Query, ErrorHistory, Task, TaskId},
};
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    map_err,
    query::ToQuery,
    types::{self, Edge, PeriodicTaskRow, Readiness, TaskStatus},
    RetaskPgBackend,
};

impl RetaskPgBackend {
    /// Turns the row count of a guarded status update into a result.
    ///
    /// When nothing was updated the task is looked up again to tell a missing task from one in
    /// the wrong status.
    async fn handle_update(
        &self,
        result: sqlx::Result<u64>,
        id: TaskId,
    ) -> Result<(), BackendError> {
        match result.map_err(map_err)? {
            0 => match self.status(id).await.map_err(map_err)? {
                None => Err(BackendError::TaskNotFound(id)),
                Some(status) => Err(BackendError::InvalidTransition {
                    id,
                    status: status.into(),
                }),
            },
            1 => Ok(()),
            _ => Err(BackendError::BadState),
        }
    }

    fn handle_periodic_update(
        result: sqlx::Result<u64>,
        id: PeriodicTaskId,
    ) -> Result<(), BackendError> {
        match result.map_err(map_err)? {
            0 => Err(BackendError::PeriodicTaskNotFound(id)),
            1 => Ok(()),
            _ => Err(BackendError::BadState),
        }
    }

    async fn status(&self, id: TaskId) -> sqlx::Result<Option<TaskStatus>> {
        sqlx::query_scalar("SELECT status FROM retask_tasks WHERE id = $1")
            .bind(Uuid::from(id))
            .fetch_optional(self.deref())
            .await
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>, BackendError> {
        self.query(Query::IdEquals(id)).await.map(|mut tasks| tasks.pop())
    }

    /// Returns the first of `ids` that does not exist.
    async fn first_missing(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> sqlx::Result<Option<Uuid>> {
        if ids.is_empty() {
            return Ok(None);
        }
        let found: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM retask_tasks WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&mut **tx)
                .await?;
        Ok(ids.iter().find(|id| !found.contains(id)).copied())
    }

    async fn insert_task(&self, task: EnqueuableTask) -> Result<TaskId, BackendError> {
        let arguments = serde_json::to_value(&task.arguments)?;
        let dependencies: Vec<Uuid> = task.dependencies.iter().copied().map(Uuid::from).collect();
        let id = Uuid::new_v4();

        let mut tx = self.begin().await.map_err(map_err)?;
        if let Some(missing) = Self::first_missing(&mut tx, &dependencies)
            .await
            .map_err(map_err)?
        {
            return Err(BackendError::TaskNotFound(missing.into()));
        }

        sqlx::query(
            r#"INSERT INTO retask_tasks (
                id,
                name,
                priority,
                queue,
                arguments,
                created_at,
                scheduled_at,
                timeout,
                max_retries,
                autoretry,
                retry_delay,
                retry_backoff
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(id)
        .bind(&task.name)
        .bind(task.priority)
        .bind(&task.queue)
        .bind(arguments)
        .bind(Utc::now())
        .bind(task.scheduled_at)
        .bind(types::to_column("timeout", task.timeout)?)
        .bind(types::to_column("max_retries", task.max_retries)?)
        .bind(task.autoretry)
        .bind(types::to_column("retry_delay", task.retry_delay)?)
        .bind(task.retry_backoff)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        // A fresh task has no dependents, so its edges cannot close a cycle.
        if !dependencies.is_empty() {
            sqlx::query(
                r#"INSERT INTO retask_task_dependencies (task_id, depends_on)
                SELECT $1, x.depends_on
                FROM UNNEST($2::uuid[]) WITH ORDINALITY AS x(depends_on, n)
                ORDER BY x.n
                ON CONFLICT DO NOTHING"#,
            )
            .bind(id)
            .bind(&dependencies)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }

        tx.commit().await.map_err(map_err)?;
        Ok(id.into())
    }

    async fn insert_dependency(
        &self,
        task: TaskId,
        depends_on: TaskId,
    ) -> Result<(), BackendError> {
        let mut tx = self.begin().await.map_err(map_err)?;
        // Serialises concurrent edge insertions so two edges cannot close a cycle together.
        sqlx::query("LOCK TABLE retask_task_dependencies IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        let ids = [Uuid::from(depends_on), Uuid::from(task)];
        if let Some(missing) = Self::first_missing(&mut tx, &ids).await.map_err(map_err)? {
            return Err(BackendError::TaskNotFound(missing.into()));
        }

        let edges: Vec<Edge> = sqlx::query_as(
            r#"WITH RECURSIVE reachable(id) AS (
                SELECT $1::uuid
                UNION
                SELECT d.depends_on
                FROM retask_task_dependencies d
                JOIN reachable r ON d.task_id = r.id
            )
            SELECT d.task_id, d.depends_on
            FROM retask_task_dependencies d
            JOIN reachable r ON d.task_id = r.id
            ORDER BY d.seq"#,
        )
        .bind(Uuid::from(depends_on))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut graph: FxHashMap<TaskId, Vec<TaskId>> = FxHashMap::default();
        for edge in edges {
            graph
                .entry(edge.task_id.into())
                .or_default()
                .push(edge.depends_on.into());
        }
        dependency::check_new_edge(task, depends_on, |node| {
            graph.get(&node).cloned().unwrap_or_default()
        })?;

        sqlx::query(
            r#"INSERT INTO retask_task_dependencies (task_id, depends_on)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING"#,
        )
        .bind(Uuid::from(task))
        .bind(Uuid::from(depends_on))
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)
    }

    /// Claims and loads the most urgent eligible task in one transaction, so a task is only left
    /// `in_progress` once it has been handed back to the caller.
    async fn claim(&self, worker_id: &str) -> Result<Option<Task>, BackendError> {
        let mut tx = self.begin().await.map_err(map_err)?;
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"UPDATE retask_tasks
            SET
                status = 'in_progress',
                started_at = $2,
                worker_id = COALESCE(worker_id, $1)
            WHERE status = 'pending' AND id = (
                SELECT c.id FROM retask_tasks c
                WHERE c.status = 'pending'
                AND (c.scheduled_at IS NULL OR c.scheduled_at <= $2)
                AND NOT EXISTS (
                    SELECT 1
                    FROM retask_task_dependencies d
                    JOIN retask_tasks p ON p.id = d.depends_on
                    WHERE d.task_id = c.id AND p.status <> 'completed'
                )
                ORDER BY c.priority DESC, c.created_at, c.seq
                LIMIT 1
                FOR UPDATE OF c SKIP LOCKED
            )
            RETURNING id"#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        let query = Query::IdEquals(id.into());
        let mut builder = query.query();
        let row = builder
            .build_query_as::<types::Task>()
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        let task = row.map(Task::try_from).transpose()?;
        tx.commit().await.map_err(map_err)?;
        Ok(task)
    }

    async fn readiness(&self, id: TaskId) -> sqlx::Result<Readiness> {
        sqlx::query_as(
            r#"SELECT
                EXISTS (SELECT 1 FROM retask_tasks WHERE id = $1) AS found,
                NOT EXISTS (
                    SELECT 1
                    FROM retask_task_dependencies d
                    JOIN retask_tasks p ON p.id = d.depends_on
                    WHERE d.task_id = $1 AND p.status <> 'completed'
                ) AS ready"#,
        )
        .bind(Uuid::from(id))
        .fetch_one(self.deref())
        .await
    }

    async fn _mark_task_complete(&self, id: TaskId) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE retask_tasks
            SET
                status = 'completed',
                completed_at = $2
            WHERE id = $1 AND status = 'in_progress'"#,
        )
        .bind(Uuid::from(id))
        .bind(Utc::now())
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn _mark_task_retryable(
        &self,
        id: TaskId,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE retask_tasks
            SET
                status = 'pending',
                scheduled_at = $2,
                attempts = attempts + 1,
                last_errors = retask_push_error(last_errors, $3, $4)
            WHERE id = $1 AND status = 'in_progress'"#,
        )
        .bind(Uuid::from(id))
        .bind(scheduled_at)
        .bind(error.message)
        .bind(ErrorHistory::CAPACITY as i32)
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn _mark_task_failed(&self, id: TaskId, error: ExecutionError) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE retask_tasks
            SET
                status = 'failed',
                attempts = attempts + 1,
                last_errors = retask_push_error(last_errors, $2, $3)
            WHERE id = $1 AND status = 'in_progress'"#,
        )
        .bind(Uuid::from(id))
        .bind(error.message)
        .bind(ErrorHistory::CAPACITY as i32)
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn _cancel_task(&self, id: TaskId) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE retask_tasks
            SET status = 'canceled'
            WHERE id = $1 AND status = 'pending'"#,
        )
        .bind(Uuid::from(id))
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn _archive_task(&self, id: TaskId) -> sqlx::Result<u64> {
        Ok(
            sqlx::query("UPDATE retask_tasks SET archived = TRUE WHERE id = $1")
                .bind(Uuid::from(id))
                .execute(self.deref())
                .await?
                .rows_affected(),
        )
    }

    async fn run_query<'a>(&self, query: Query<'a>) -> sqlx::Result<Vec<types::Task>> {
        let mut builder = query.query();
        let tasks = builder
            .build_query_as::<types::Task>()
            .fetch_all(self.deref())
            .await?;
        Ok(tasks)
    }

    async fn upsert_periodic(
        &self,
        definition: PeriodicTaskDefinition,
    ) -> Result<i32, BackendError> {
        let arguments = serde_json::to_value(&definition.arguments)?;
        let crontab = serde_json::to_value(definition.crontab)?;
        sqlx::query_scalar(
            r#"INSERT INTO retask_periodic_tasks (
                name,
                task_name,
                arguments,
                crontab,
                enabled
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                task_name = EXCLUDED.task_name,
                arguments = EXCLUDED.arguments,
                crontab = EXCLUDED.crontab,
                enabled = EXCLUDED.enabled
            RETURNING id"#,
        )
        .bind(&definition.name)
        .bind(&definition.task_name)
        .bind(arguments)
        .bind(crontab)
        .bind(definition.enabled)
        .fetch_one(self.deref())
        .await
        .map_err(map_err)
    }
}

#[async_trait]
impl Backend for RetaskPgBackend {
    #[instrument(skip(self, task), fields(name = %task.name))]
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, BackendError> {
        self.insert_task(task).await
    }

    #[instrument(skip(self))]
    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), BackendError> {
        self.insert_dependency(task, depends_on).await
    }

    async fn claim_one(&self, worker_id: &str) -> Result<Option<Task>, BackendError> {
        self.claim(worker_id).await
    }

    async fn is_ready(&self, id: TaskId) -> Result<bool, BackendError> {
        match self.readiness(id).await.map_err(map_err)? {
            Readiness { found: false, .. } => Err(BackendError::TaskNotFound(id)),
            Readiness { ready, .. } => Ok(ready),
        }
    }

    async fn mark_task_complete(&self, id: TaskId) -> Result<(), BackendError> {
        let result = self._mark_task_complete(id).await;
        self.handle_update(result, id).await
    }

    async fn mark_task_retryable(
        &self,
        id: TaskId,
        scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let result = self._mark_task_retryable(id, scheduled_at, error).await;
        self.handle_update(result, id).await
    }

    async fn mark_task_failed(
        &self,
        id: TaskId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let result = self._mark_task_failed(id, error).await;
        self.handle_update(result, id).await
    }

    async fn cancel_task(&self, id: TaskId) -> Result<(), BackendError> {
        let result = self._cancel_task(id).await;
        self.handle_update(result, id).await
    }

    async fn archive_task(&self, id: TaskId) -> Result<(), BackendError> {
        match self._archive_task(id).await.map_err(map_err)? {
            0 => Err(BackendError::TaskNotFound(id)),
            _ => Ok(()),
        }
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Task>, BackendError> {
        self.run_query(query)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, BackendError> {
        self.load_task(id).await
    }

    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn upsert_periodic_task(
        &self,
        definition: PeriodicTaskDefinition,
    ) -> Result<PeriodicTaskId, BackendError> {
        self.upsert_periodic(definition).await.map(From::from)
    }

    async fn enabled_periodic_tasks(&self) -> Result<Vec<PeriodicTask>, BackendError> {
        sqlx::query_as::<_, PeriodicTaskRow>(
            r#"SELECT
                id,
                name,
                task_name,
                arguments,
                crontab,
                enabled,
                last_run_at,
                total_run_count
            FROM retask_periodic_tasks
            WHERE enabled
            ORDER BY id"#,
        )
        .fetch_all(self.deref())
        .await
        .map_err(map_err)?
        .into_iter()
        .map(TryFrom::try_from)
        .collect()
    }

    async fn record_periodic_run(
        &self,
        id: PeriodicTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"UPDATE retask_periodic_tasks
            SET
                last_run_at = $2,
                total_run_count = total_run_count + 1
            WHERE id = $1"#,
        )
        .bind(i32::from(id))
        .bind(ran_at)
        .execute(self.deref())
        .await
        .map(|done| done.rows_affected());
        Self::handle_periodic_update(result, id)
    }

    async fn set_periodic_task_enabled(
        &self,
        id: PeriodicTaskId,
        enabled: bool,
    ) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE retask_periodic_tasks SET enabled = $2 WHERE id = $1")
            .bind(i32::from(id))
            .bind(enabled)
            .execute(self.deref())
            .await
            .map(|done| done.rows_affected());
        Self::handle_periodic_update(result, id)
    }
}
