//! Test suite for ensuring a correct implementation of a backend.
use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, TimeDelta, TimeZone, Utc};

use crate::{
    engine::{ErrorType, ExecutionError},
    periodic::{Crontab, PeriodicTaskDefinition},
    task::{Arguments, ErrorHistory, TaskStatus},
};

use super::*;

const DEFAULT_NAME: &str = "task";
const WORKER: &str = "test-worker";

impl EnqueuableTask {
    pub(crate) const DEFAULT_NAME: &'static str = DEFAULT_NAME;

    pub(crate) fn mock_task() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_owned(),
            priority: 2,
            queue: "default".to_owned(),
            arguments: Arguments::new().arg("data"),
            scheduled_at: None,
            timeout: 300,
            max_retries: 1,
            autoretry: true,
            retry_delay: 60,
            retry_backoff: 2.0,
            dependencies: Vec::new(),
        }
    }

    pub(crate) fn with_name(self, name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..self
        }
    }

    pub(crate) fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub(crate) fn with_dependencies(self, dependencies: Vec<TaskId>) -> Self {
        Self {
            dependencies,
            ..self
        }
    }

    pub(crate) fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }
}

impl Task {
    pub(crate) fn raw_task() -> Self {
        Self {
            id: TaskId::new(),
            name: DEFAULT_NAME.to_owned(),
            status: TaskStatus::Pending,
            priority: 2,
            queue: "default".to_owned(),
            arguments: Arguments::default(),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            timeout: 300,
            attempts: 0,
            max_retries: 1,
            worker_id: None,
            dependencies: Vec::new(),
            last_errors: ErrorHistory::default(),
            autoretry: true,
            retry_delay: 60,
            retry_backoff: 2.0,
            archived: false,
        }
    }
}

fn error(message: impl Into<String>) -> ExecutionError {
    ExecutionError::new(ErrorType::Handler, message)
}

fn definition(name: &str) -> PeriodicTaskDefinition {
    PeriodicTaskDefinition {
        name: name.to_owned(),
        task_name: "send_report".to_owned(),
        arguments: Arguments::new().kwarg("format", "pdf"),
        crontab: Crontab::every_minute().with_minute(2).with_hour(16),
        enabled: true,
    }
}

/// Create test suite for a retask backend.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```ignore
/// use retask::test_suite;
/// use retask::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use retask::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@tests attr: $attr, args: $args, backend: $backend, tests: [
            enqueue,
            enqueue_unknown_dependency,
            claim_marks_in_progress,
            claim_by_priority_then_creation,
            claim_skips_future_tasks,
            claim_respects_dependencies,
            claim_blocked_by_failed_dependency,
            claim_only_one_concurrent_winner,
            is_ready,
            add_dependency,
            add_dependency_rejects_cycles,
            add_dependency_not_found,
            mark_task_complete,
            mark_task_complete_requires_in_progress,
            mark_task_complete_not_found,
            mark_task_retryable,
            mark_task_failed,
            error_history_is_bounded,
            cancel_task,
            archive_task,
            query,
            upsert_periodic_task,
            record_periodic_run,
            set_periodic_task_enabled,
        ]);
    };
    (@tests attr: $attr:meta, args: $args:tt, backend: $backend:expr, tests: [$($test:ident),* $(,)?]) => {
        $(
            #[$attr]
            async fn $test $args {
                let backend = $backend;
                $crate::backend::testing::$test(backend).await;
            }
        )*
    };
}

pub use test_suite;

#[doc(hidden)]
#[async_trait::async_trait]
pub trait BackendTesting: Backend + Sync {
    /// Claims the next task, asserting there is one.
    async fn claim(&self) -> Task {
        self.claim_one(WORKER)
            .await
            .unwrap()
            .expect("expected a claimable task")
    }

    async fn task(&self, id: TaskId) -> Task {
        self.get_task(id).await.unwrap().expect("task exists")
    }
}

impl<T: Backend + Sync> BackendTesting for T {}

#[doc(hidden)]
pub async fn enqueue(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(7))
        .await
        .unwrap();

    let task = backend.task(id).await;
    assert_eq!(task.id, id);
    assert_eq!(task.name, EnqueuableTask::DEFAULT_NAME);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 7);
    assert_eq!(task.arguments, Arguments::new().arg("data"));
    assert_eq!(task.attempts, 0);
    assert!(task.worker_id.is_none());
    assert!(task.started_at.is_none());
    assert!(task.last_errors.is_empty());
    assert!(!task.archived);
}

#[doc(hidden)]
pub async fn enqueue_unknown_dependency(backend: impl BackendTesting) {
    let missing = TaskId::from(uuid::Uuid::new_v4());

    assert!(matches!(
        backend
            .enqueue(EnqueuableTask::mock_task().with_dependencies(vec![missing]))
            .await,
        Err(BackendError::TaskNotFound(id)) if id == missing
    ));
    assert!(backend.query(Query::And(vec![])).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn claim_marks_in_progress(backend: impl BackendTesting) {
    let before = Utc::now().trunc_subsecs(0);
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();

    let claimed = backend.claim_one("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert!(claimed.started_at.unwrap() >= before);

    assert_eq!(backend.task(id).await.status, TaskStatus::InProgress);
    assert!(backend.claim_one("worker-2").await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_by_priority_then_creation(backend: impl BackendTesting) {
    let low = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(1))
        .await
        .unwrap();
    let first_high = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(10))
        .await
        .unwrap();
    let second_high = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(10))
        .await
        .unwrap();

    assert_eq!(backend.claim().await.id, first_high);
    assert_eq!(backend.claim().await.id, second_high);
    assert_eq!(backend.claim().await.id, low);
    assert!(backend.claim_one(WORKER).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_skips_future_tasks(backend: impl BackendTesting) {
    let _ = backend
        .enqueue(
            EnqueuableTask::mock_task()
                .with_priority(10)
                .with_scheduled_at(Utc::now() + TimeDelta::hours(1)),
        )
        .await
        .unwrap();
    let due = backend
        .enqueue(EnqueuableTask::mock_task().with_scheduled_at(Utc::now() - TimeDelta::hours(1)))
        .await
        .unwrap();

    assert_eq!(backend.claim().await.id, due);
    assert!(backend.claim_one(WORKER).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_respects_dependencies(backend: impl BackendTesting) {
    let parent = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let child = backend
        .enqueue(
            EnqueuableTask::mock_task()
                .with_priority(10)
                .with_dependencies(vec![parent]),
        )
        .await
        .unwrap();

    assert_eq!(backend.claim().await.id, parent);
    assert!(backend.claim_one(WORKER).await.unwrap().is_none());

    backend.mark_task_complete(parent).await.unwrap();

    assert_eq!(backend.claim().await.id, child);
}

#[doc(hidden)]
pub async fn claim_blocked_by_failed_dependency(backend: impl BackendTesting) {
    let parent = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let _child = backend
        .enqueue(EnqueuableTask::mock_task().with_dependencies(vec![parent]))
        .await
        .unwrap();

    backend.claim().await;
    backend
        .mark_task_failed(parent, error("boom"))
        .await
        .unwrap();

    assert!(backend.claim_one(WORKER).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_only_one_concurrent_winner(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let worker_ids: Vec<String> = (0..16).map(|i| format!("worker-{i}")).collect();

    let claimed: Vec<_> = futures::future::join_all(
        worker_ids
            .iter()
            .map(|worker_id| backend.claim_one(worker_id)),
    )
    .await
    .into_iter()
    .filter_map(|result| result.unwrap())
    .collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(
        backend.task(id).await.worker_id,
        claimed[0].worker_id.clone()
    );
}

#[doc(hidden)]
pub async fn is_ready(backend: impl BackendTesting) {
    let first = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let second = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let child = backend
        .enqueue(EnqueuableTask::mock_task().with_dependencies(vec![first, second]))
        .await
        .unwrap();

    assert!(backend.is_ready(first).await.unwrap());
    assert!(!backend.is_ready(child).await.unwrap());

    backend.claim().await;
    backend.mark_task_complete(first).await.unwrap();
    assert!(!backend.is_ready(child).await.unwrap());

    backend.claim().await;
    backend.mark_task_complete(second).await.unwrap();
    assert!(backend.is_ready(child).await.unwrap());
}

#[doc(hidden)]
pub async fn add_dependency(backend: impl BackendTesting) {
    let parent = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let child = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(10))
        .await
        .unwrap();

    backend.add_dependency(child, parent).await.unwrap();
    backend.add_dependency(child, parent).await.unwrap();

    assert_eq!(backend.task(child).await.dependencies, vec![parent]);
    assert_eq!(backend.claim().await.id, parent);
}

#[doc(hidden)]
pub async fn add_dependency_rejects_cycles(backend: impl BackendTesting) {
    let a = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let b = backend
        .enqueue(EnqueuableTask::mock_task().with_dependencies(vec![a]))
        .await
        .unwrap();
    let c = backend
        .enqueue(EnqueuableTask::mock_task().with_dependencies(vec![b]))
        .await
        .unwrap();

    assert!(matches!(
        backend.add_dependency(a, c).await,
        Err(BackendError::Structural(StructuralError { task, depends_on }))
            if task == a && depends_on == c
    ));
    assert!(matches!(
        backend.add_dependency(a, a).await,
        Err(BackendError::Structural(_))
    ));
    assert!(backend.task(a).await.dependencies.is_empty());

    backend.add_dependency(c, a).await.unwrap();
}

#[doc(hidden)]
pub async fn add_dependency_not_found(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let missing = TaskId::from(uuid::Uuid::new_v4());

    assert!(matches!(
        backend.add_dependency(id, missing).await,
        Err(BackendError::TaskNotFound(not_found)) if not_found == missing
    ));
    assert!(matches!(
        backend.add_dependency(missing, id).await,
        Err(BackendError::TaskNotFound(not_found)) if not_found == missing
    ));
}

#[doc(hidden)]
pub async fn mark_task_complete(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    let claimed = backend.claim().await;

    backend.mark_task_complete(id).await.unwrap();

    let task = backend.task(id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.unwrap() >= claimed.started_at.unwrap());
    assert_eq!(task.attempts, 0);
}

#[doc(hidden)]
pub async fn mark_task_complete_requires_in_progress(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();

    assert!(matches!(
        backend.mark_task_complete(id).await,
        Err(BackendError::InvalidTransition {
            status: TaskStatus::Pending,
            ..
        })
    ));
    assert_eq!(backend.task(id).await.status, TaskStatus::Pending);
}

#[doc(hidden)]
pub async fn mark_task_complete_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .mark_task_complete(TaskId::from(uuid::Uuid::new_v4()))
            .await,
        Err(BackendError::TaskNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_task_retryable(backend: impl BackendTesting) {
    let scheduled_at = (Utc::now() + TimeDelta::hours(1)).trunc_subsecs(0);
    let id = backend
        .enqueue(EnqueuableTask::mock_task().with_max_retries(3))
        .await
        .unwrap();
    backend.claim().await;

    backend
        .mark_task_retryable(id, scheduled_at, error("Error Message"))
        .await
        .unwrap();

    let task = backend.task(id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.scheduled_at, Some(scheduled_at));
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_errors.iter().collect::<Vec<_>>(), ["Error Message"]);
    assert_eq!(task.worker_id.as_deref(), Some(WORKER));
    assert!(backend.claim_one(WORKER).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_task_failed(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    backend.claim().await;

    backend
        .mark_task_failed(id, error("Error Message"))
        .await
        .unwrap();

    let task = backend.task(id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_errors.last(), Some("Error Message"));
    assert!(task.scheduled_at.is_none());

    assert!(matches!(
        backend.mark_task_failed(id, error("again")).await,
        Err(BackendError::InvalidTransition {
            status: TaskStatus::Failed,
            ..
        })
    ));
}

#[doc(hidden)]
pub async fn error_history_is_bounded(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableTask::mock_task().with_max_retries(10))
        .await
        .unwrap();

    for attempt in 1..=6 {
        backend.claim().await;
        backend
            .mark_task_retryable(
                id,
                Utc::now() - TimeDelta::seconds(1),
                error(format!("error {attempt}")),
            )
            .await
            .unwrap();
    }

    let task = backend.task(id).await;
    assert_eq!(task.attempts, 6);
    assert_eq!(
        task.last_errors.iter().collect::<Vec<_>>(),
        ["error 2", "error 3", "error 4", "error 5", "error 6"]
    );
}

#[doc(hidden)]
pub async fn cancel_task(backend: impl BackendTesting) {
    let pending = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    backend.cancel_task(pending).await.unwrap();
    assert_eq!(backend.task(pending).await.status, TaskStatus::Canceled);
    assert!(backend.claim_one(WORKER).await.unwrap().is_none());

    let running = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();
    backend.claim().await;
    assert!(matches!(
        backend.cancel_task(running).await,
        Err(BackendError::InvalidTransition {
            status: TaskStatus::InProgress,
            ..
        })
    ));
}

#[doc(hidden)]
pub async fn archive_task(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();

    backend.archive_task(id).await.unwrap();

    let task = backend.task(id).await;
    assert!(task.archived);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(backend.claim().await.id, id);
}

#[doc(hidden)]
pub async fn query(backend: impl BackendTesting) {
    let id = backend
        .enqueue(EnqueuableTask::mock_task().with_priority(4))
        .await
        .unwrap();
    let other = backend
        .enqueue(EnqueuableTask::mock_task().with_name("other_task"))
        .await
        .unwrap();
    let _ = backend.enqueue(EnqueuableTask::mock_task()).await.unwrap();

    let ids = |tasks: Vec<Task>| tasks.into_iter().map(|task| task.id).collect::<HashSet<_>>();

    assert!(backend
        .query(Query::IdEquals(TaskId::from(uuid::Uuid::new_v4())))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(backend.query(Query::IdEquals(id)).await.unwrap().len(), 1);
    assert_eq!(
        backend
            .query(Query::NameEqual(EnqueuableTask::DEFAULT_NAME))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        ids(backend.query(Query::PriorityAtLeast(3)).await.unwrap()),
        HashSet::from([id])
    );
    assert_eq!(
        ids(backend
            .query(Query::Not(Box::new(Query::NameEqual(
                EnqueuableTask::DEFAULT_NAME
            ))))
            .await
            .unwrap()),
        HashSet::from([other])
    );
    assert_eq!(
        ids(backend
            .query(Query::Or(vec![
                Query::IdIn(&[id, other]),
                Query::Archived(true),
            ]))
            .await
            .unwrap()),
        HashSet::from([id, other])
    );
    assert_eq!(
        backend
            .query(Query::And(vec![
                Query::StatusEqual(TaskStatus::Pending),
                Query::QueueEqual("default"),
            ]))
            .await
            .unwrap()
            .len(),
        3
    );
}

#[doc(hidden)]
pub async fn upsert_periodic_task(backend: impl BackendTesting) {
    let id = backend
        .upsert_periodic_task(definition("report"))
        .await
        .unwrap();
    let other = backend
        .upsert_periodic_task(definition("other"))
        .await
        .unwrap();
    assert_ne!(id, other);

    let updated = backend
        .upsert_periodic_task(PeriodicTaskDefinition {
            task_name: "send_summary".to_owned(),
            crontab: Crontab::every_minute().with_minute(30),
            ..definition("report")
        })
        .await
        .unwrap();
    assert_eq!(updated, id);

    let tasks = backend.enabled_periodic_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    let report = tasks.iter().find(|task| task.id == id).unwrap();
    assert_eq!(report.name, "report");
    assert_eq!(report.task_name, "send_summary");
    assert_eq!(report.arguments, Arguments::new().kwarg("format", "pdf"));
    assert_eq!(report.crontab, Crontab::every_minute().with_minute(30));
    assert!(report.last_run_at.is_none());
    assert_eq!(report.total_run_count, 0);
}

#[doc(hidden)]
pub async fn record_periodic_run(backend: impl BackendTesting) {
    let id = backend
        .upsert_periodic_task(definition("report"))
        .await
        .unwrap();
    let ran_at = Utc.with_ymd_and_hms(2025, 4, 6, 16, 3, 0).unwrap();

    backend.record_periodic_run(id, ran_at).await.unwrap();
    backend.record_periodic_run(id, ran_at).await.unwrap();

    let tasks = backend.enabled_periodic_tasks().await.unwrap();
    assert_eq!(tasks[0].last_run_at, Some(ran_at));
    assert_eq!(tasks[0].total_run_count, 2);

    // An upsert keeps the run history.
    backend
        .upsert_periodic_task(definition("report"))
        .await
        .unwrap();
    assert_eq!(
        backend.enabled_periodic_tasks().await.unwrap()[0].total_run_count,
        2
    );

    assert!(matches!(
        backend.record_periodic_run(PeriodicTaskId::from(-1), ran_at).await,
        Err(BackendError::PeriodicTaskNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn set_periodic_task_enabled(backend: impl BackendTesting) {
    let id = backend
        .upsert_periodic_task(definition("report"))
        .await
        .unwrap();

    backend.set_periodic_task_enabled(id, false).await.unwrap();
    assert!(backend.enabled_periodic_tasks().await.unwrap().is_empty());

    backend.set_periodic_task_enabled(id, true).await.unwrap();
    assert_eq!(backend.enabled_periodic_tasks().await.unwrap().len(), 1);

    assert!(matches!(
        backend
            .set_periodic_task_enabled(PeriodicTaskId::from(-1), true)
            .await,
        Err(BackendError::PeriodicTaskNotFound(_))
    ));
}
