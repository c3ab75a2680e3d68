use chrono::{DateTime, Utc};
use retask::{
    backend::BackendError,
    periodic::{PeriodicTask, PeriodicTaskId},
    task::TaskId,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "retask_task_status", rename_all = "snake_case")]
pub(crate) enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl From<TaskStatus> for retask::task::TaskStatus {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Pending => Self::Pending,
            TaskStatus::InProgress => Self::InProgress,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Canceled => Self::Canceled,
        }
    }
}

impl From<retask::task::TaskStatus> for TaskStatus {
    fn from(value: retask::task::TaskStatus) -> Self {
        match value {
            retask::task::TaskStatus::Pending => Self::Pending,
            retask::task::TaskStatus::InProgress => Self::InProgress,
            retask::task::TaskStatus::Completed => Self::Completed,
            retask::task::TaskStatus::Failed => Self::Failed,
            retask::task::TaskStatus::Canceled => Self::Canceled,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Task {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub queue: String,
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout: i32,
    pub attempts: i32,
    pub max_retries: i32,
    pub worker_id: Option<String>,
    pub dependencies: Vec<Uuid>,
    pub last_errors: serde_json::Value,
    pub autoretry: bool,
    pub retry_delay: i32,
    pub retry_backoff: f64,
    pub archived: bool,
}

impl TryFrom<Task> for retask::task::Task {
    type Error = BackendError;

    fn try_from(value: Task) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            name: value.name,
            status: value.status.into(),
            priority: value.priority,
            queue: value.queue,
            arguments: serde_json::from_value(value.arguments)?,
            created_at: value.created_at,
            scheduled_at: value.scheduled_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            timeout: from_column("timeout", value.timeout)?,
            attempts: from_column("attempts", value.attempts)?,
            max_retries: from_column("max_retries", value.max_retries)?,
            worker_id: value.worker_id,
            dependencies: value.dependencies.into_iter().map(TaskId::from).collect(),
            last_errors: serde_json::from_value(value.last_errors)?,
            autoretry: value.autoretry,
            retry_delay: from_column("retry_delay", value.retry_delay)?,
            retry_backoff: value.retry_backoff,
            archived: value.archived,
        })
    }
}

/// Narrows an unsigned task setting to the `INTEGER` column that stores it.
pub(crate) fn to_column(field: &'static str, value: u32) -> Result<i32, BackendError> {
    i32::try_from(value).map_err(|_| BackendError::OutOfRange {
        field,
        value: value.into(),
    })
}

fn from_column(field: &'static str, value: i32) -> Result<u32, BackendError> {
    u32::try_from(value).map_err(|_| BackendError::OutOfRange {
        field,
        value: value.into(),
    })
}

#[derive(Debug, FromRow)]
pub(crate) struct Edge {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

#[derive(Debug, FromRow)]
pub(crate) struct Readiness {
    pub found: bool,
    pub ready: bool,
}

#[derive(Debug, FromRow)]
pub(crate) struct PeriodicTaskRow {
    pub id: i32,
    pub name: String,
    pub task_name: String,
    pub arguments: serde_json::Value,
    pub crontab: serde_json::Value,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: i64,
}

impl TryFrom<PeriodicTaskRow> for PeriodicTask {
    type Error = BackendError;

    fn try_from(value: PeriodicTaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PeriodicTaskId::from(value.id),
            name: value.name,
            task_name: value.task_name,
            arguments: serde_json::from_value(value.arguments)?,
            crontab: serde_json::from_value(value.crontab)?,
            enabled: value.enabled,
            last_run_at: value.last_run_at,
            total_run_count: value.total_run_count,
        })
    }
}

#[cfg(test)]
mod test {
    use retask::task::ErrorHistory;
    use serde_json::json;

    use super::*;

    fn row() -> Task {
        Task {
            id: Uuid::new_v4(),
            name: "task".to_owned(),
            status: TaskStatus::InProgress,
            priority: 3,
            queue: "default".to_owned(),
            arguments: json!({"args": [1], "kwargs": {"key": "value"}}),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            timeout: 300,
            attempts: 2,
            max_retries: 3,
            worker_id: Some("worker".to_owned()),
            dependencies: vec![Uuid::new_v4()],
            last_errors: json!(["first", "second"]),
            autoretry: true,
            retry_delay: 60,
            retry_backoff: 2.0,
            archived: false,
        }
    }

    #[test]
    fn task_from_row() {
        let row = row();
        let dependency = row.dependencies[0];

        let task = retask::task::Task::try_from(row).unwrap();

        assert_eq!(task.status, retask::task::TaskStatus::InProgress);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.arguments.kwargs["key"], json!("value"));
        assert_eq!(task.dependencies, vec![TaskId::from(dependency)]);
        assert_eq!(
            task.last_errors,
            ErrorHistory::from_iter(["first".to_owned(), "second".to_owned()])
        );
    }

    #[test]
    fn malformed_errors_are_rejected() {
        let row = Task {
            last_errors: json!({"not": "a list"}),
            ..row()
        };

        assert!(matches!(
            retask::task::Task::try_from(row),
            Err(BackendError::EncodeDecode(_))
        ));
    }

    #[test]
    fn negative_counters_are_rejected() {
        let row = Task {
            attempts: -1,
            ..row()
        };

        assert!(matches!(
            retask::task::Task::try_from(row),
            Err(BackendError::OutOfRange {
                field: "attempts",
                value: -1
            })
        ));
    }

    #[test]
    fn settings_beyond_integer_columns_are_rejected() {
        assert_eq!(to_column("timeout", 300).unwrap(), 300);
        assert_eq!(to_column("timeout", i32::MAX as u32).unwrap(), i32::MAX);
        assert!(matches!(
            to_column("timeout", u32::MAX),
            Err(BackendError::OutOfRange {
                field: "timeout",
                value
            }) if value == i64::from(u32::MAX)
        ));
    }

    #[test]
    fn periodic_task_from_row() {
        let row = PeriodicTaskRow {
            id: 4,
            name: "report".to_owned(),
            task_name: "send_report".to_owned(),
            arguments: json!({"args": [], "kwargs": {}}),
            crontab: json!({"minute": "2", "hour": "16"}),
            enabled: true,
            last_run_at: None,
            total_run_count: 0,
        };

        let task = PeriodicTask::try_from(row).unwrap();

        assert_eq!(task.id, PeriodicTaskId::from(4));
        assert_eq!(
            task.crontab,
            retask::periodic::Crontab::every_minute()
                .with_minute(2)
                .with_hour(16)
        );
    }
}
