//! The beat scheduler: fires periodic tasks when their crontab comes due.
//!
//! The scheduler keeps the next fire time of every enabled [`PeriodicTask`] in memory. Each cycle
//! it re-reads the enabled definitions from the backend ([`BeatScheduler::sync`]), enqueues the
//! ones that are due ([`BeatScheduler::tick`]) and sleeps until the earliest next fire time.
use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::Backend,
    periodic::{PeriodicTask, PeriodicTaskId},
    task::{builder::TaskBuilder, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long to sleep when no periodic task has an upcoming fire time.
    pub default_interval: Duration,
}

impl SchedulerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub const fn with_default_interval(self, default_interval: Duration) -> Self {
        Self { default_interval }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval: Self::DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    task: PeriodicTask,
    next_run_at: Option<DateTime<Utc>>,
}

/// The result of one [`BeatScheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// When the scheduler should run again.
    pub wake_at: DateTime<Utc>,
    /// The tasks enqueued during this tick.
    pub fired: Vec<(PeriodicTaskId, TaskId)>,
}

pub struct BeatScheduler<B> {
    backend: Arc<B>,
    config: SchedulerConfig,
    entries: HashMap<PeriodicTaskId, Entry>,
}

impl<B> BeatScheduler<B>
where
    B: Backend + 'static,
{
    pub fn new(backend: Arc<B>, config: SchedulerConfig) -> Self {
        Self {
            backend,
            config,
            entries: HashMap::new(),
        }
    }

    /// Rebuilds the schedule from the enabled periodic tasks in the backend.
    ///
    /// Disabled or removed definitions are dropped. A new definition, or one whose run history or
    /// crontab changed in the backend, gets its next fire time from `last_run_at`, or from `now`
    /// when it never ran. Any other entry keeps the fire time it already had, so a due entry is
    /// still due after the sync.
    pub async fn sync(&mut self, now: DateTime<Utc>) {
        let tasks = match self.backend.enabled_periodic_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(?err, "Failed to load periodic tasks, error: {err}");
                return;
            }
        };

        let mut previous = std::mem::take(&mut self.entries);
        self.entries = tasks
            .into_iter()
            .map(|mut task| {
                let known = previous.remove(&task.id);
                let next_run_at = match known {
                    Some(known) if known.task.last_run_at >= task.last_run_at => {
                        // Runs fired here but not yet written to the backend still count.
                        task.last_run_at = known.task.last_run_at;
                        task.total_run_count = task.total_run_count.max(known.task.total_run_count);
                        if known.task.crontab == task.crontab {
                            known.next_run_at
                        } else {
                            next_run_at(&task, now)
                        }
                    }
                    _ => next_run_at(&task, now),
                };
                tracing::debug!(id = %task.id, "Scheduled periodic task {}, next run at {next_run_at:?}", task.name);
                (task.id, Entry { task, next_run_at })
            })
            .collect();
    }

    /// Fires every entry due at `now` and computes the next wake time.
    ///
    /// A due entry enqueues one task, records the run and then moves its next fire time past
    /// `now`, so it cannot fire twice for the same crontab match. An entry whose task could not be
    /// enqueued stays due and is tried again after the default interval.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Tick {
        let mut fired = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.next_run_at.is_some_and(|next_run_at| next_run_at <= now) {
                continue;
            }
            let id = entry.task.id;
            let name = &entry.task.name;

            let task_id = match TaskBuilder::new(entry.task.task_name.clone())
                .with_arguments(entry.task.arguments.clone())
                .enqueue_to_backend(self.backend.as_ref())
                .await
            {
                Ok(task_id) => task_id,
                Err(err) => {
                    tracing::error!(?err, %id, "Failed to enqueue periodic task {name}, error: {err}");
                    continue;
                }
            };
            tracing::info!(%id, %task_id, "Enqueued periodic task {name}");
            fired.push((id, task_id));

            if let Err(err) = self.backend.record_periodic_run(id, now).await {
                tracing::error!(?err, %id, "Failed to record run of periodic task {name}, error: {err}");
            }
            entry.task.last_run_at = Some(now);
            entry.task.total_run_count += 1;
            entry.next_run_at = next_run_at(&entry.task, now);
        }

        let retry_at = now + default_interval(self.config);
        let wake_at = self
            .entries
            .values()
            .filter_map(|entry| entry.next_run_at)
            .map(|next_run_at| if next_run_at <= now { retry_at } else { next_run_at })
            .min()
            .unwrap_or(retry_at);

        Tick { wake_at, fired }
    }

    /// Runs sync and tick cycles until `shutdown` is cancelled.
    #[instrument(skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Beat scheduler started");
        while !shutdown.is_cancelled() {
            self.sync(Utc::now()).await;
            let Tick { wake_at, .. } = self.tick(Utc::now()).await;
            let delay = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!("Beat scheduler sleeping until {wake_at}");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        tracing::info!("Beat scheduler stopped");
    }

    pub fn next_run_at(&self, id: PeriodicTaskId) -> Option<DateTime<Utc>> {
        self.entries.get(&id).and_then(|entry| entry.next_run_at)
    }
}

fn next_run_at(task: &PeriodicTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    task.next_run_at(now)
        .inspect_err(|err| {
            tracing::error!(?err, id = %task.id, "Invalid crontab {} for periodic task {}: {err}", task.crontab, task.name)
        })
        .ok()
        .flatten()
}

fn default_interval(config: SchedulerConfig) -> TimeDelta {
    TimeDelta::from_std(config.default_interval).unwrap_or(TimeDelta::seconds(30))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, BackendError, EnqueuableTask},
        engine::ExecutionError,
        periodic::{Crontab, PeriodicTaskDefinition},
        task::{query::Query, Arguments, Task, TaskStatus},
    };

    /// An in memory backend whose enqueue and run recording can be made to fail.
    #[derive(Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_enqueue: AtomicBool,
        fail_record: AtomicBool,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, BackendError> {
            if self.fail_enqueue.load(Ordering::SeqCst) {
                return Err(BackendError::BadState);
            }
            self.inner.enqueue(task).await
        }

        async fn add_dependency(
            &self,
            task: TaskId,
            depends_on: TaskId,
        ) -> Result<(), BackendError> {
            self.inner.add_dependency(task, depends_on).await
        }

        async fn claim_one(&self, worker_id: &str) -> Result<Option<Task>, BackendError> {
            self.inner.claim_one(worker_id).await
        }

        async fn is_ready(&self, id: TaskId) -> Result<bool, BackendError> {
            self.inner.is_ready(id).await
        }

        async fn mark_task_complete(&self, id: TaskId) -> Result<(), BackendError> {
            self.inner.mark_task_complete(id).await
        }

        async fn mark_task_retryable(
            &self,
            id: TaskId,
            scheduled_at: DateTime<Utc>,
            error: ExecutionError,
        ) -> Result<(), BackendError> {
            self.inner.mark_task_retryable(id, scheduled_at, error).await
        }

        async fn mark_task_failed(
            &self,
            id: TaskId,
            error: ExecutionError,
        ) -> Result<(), BackendError> {
            self.inner.mark_task_failed(id, error).await
        }

        async fn cancel_task(&self, id: TaskId) -> Result<(), BackendError> {
            self.inner.cancel_task(id).await
        }

        async fn archive_task(&self, id: TaskId) -> Result<(), BackendError> {
            self.inner.archive_task(id).await
        }

        async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Task>, BackendError> {
            self.inner.query(query).await
        }

        async fn upsert_periodic_task(
            &self,
            definition: PeriodicTaskDefinition,
        ) -> Result<PeriodicTaskId, BackendError> {
            self.inner.upsert_periodic_task(definition).await
        }

        async fn enabled_periodic_tasks(&self) -> Result<Vec<PeriodicTask>, BackendError> {
            self.inner.enabled_periodic_tasks().await
        }

        async fn record_periodic_run(
            &self,
            id: PeriodicTaskId,
            ran_at: DateTime<Utc>,
        ) -> Result<(), BackendError> {
            if self.fail_record.load(Ordering::SeqCst) {
                return Err(BackendError::BadState);
            }
            self.inner.record_periodic_run(id, ran_at).await
        }

        async fn set_periodic_task_enabled(
            &self,
            id: PeriodicTaskId,
            enabled: bool,
        ) -> Result<(), BackendError> {
            self.inner.set_periodic_task_enabled(id, enabled).await
        }
    }

    async fn flaky_scheduler() -> (Arc<FlakyBackend>, BeatScheduler<FlakyBackend>, PeriodicTaskId) {
        let backend = Arc::new(FlakyBackend::default());
        let id = backend
            .upsert_periodic_task(definition("heartbeat", Crontab::every_minute()))
            .await
            .unwrap();
        let scheduler = BeatScheduler::new(backend.clone(), SchedulerConfig::default());
        (backend, scheduler, id)
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, day, hour, minute, 0).unwrap()
    }

    fn definition(name: &str, crontab: Crontab) -> PeriodicTaskDefinition {
        PeriodicTaskDefinition {
            name: name.to_owned(),
            task_name: format!("{name}_task"),
            arguments: Arguments::new().arg(1).kwarg("key", "value"),
            crontab,
            enabled: true,
        }
    }

    async fn scheduler_with(
        definitions: impl IntoIterator<Item = PeriodicTaskDefinition>,
    ) -> (Arc<InMemoryBackend>, BeatScheduler<InMemoryBackend>, Vec<PeriodicTaskId>) {
        let backend = Arc::new(InMemoryBackend::new());
        let mut ids = Vec::new();
        for definition in definitions {
            ids.push(backend.upsert_periodic_task(definition).await.unwrap());
        }
        let scheduler = BeatScheduler::new(backend.clone(), SchedulerConfig::default());
        (backend, scheduler, ids)
    }

    #[tokio::test]
    async fn fires_once_and_schedules_the_next_day() {
        let (backend, mut scheduler, ids) = scheduler_with([definition(
            "report",
            Crontab::every_minute().with_minute(2).with_hour(16),
        )])
        .await;
        let id = ids[0];
        backend.record_periodic_run(id, at(6, 16, 0)).await.unwrap();

        scheduler.sync(at(6, 16, 3)).await;
        assert_eq!(scheduler.next_run_at(id), Some(at(6, 16, 2)));

        let tick = scheduler.tick(at(6, 16, 3)).await;
        assert_eq!(tick.fired.len(), 1);
        assert_eq!(tick.wake_at, at(7, 16, 2));
        assert_eq!(scheduler.next_run_at(id), Some(at(7, 16, 2)));

        let tick = scheduler.tick(at(6, 16, 3)).await;
        assert!(tick.fired.is_empty());

        scheduler.sync(at(6, 16, 4)).await;
        let tick = scheduler.tick(at(6, 16, 4)).await;
        assert!(tick.fired.is_empty());
        assert_eq!(tick.wake_at, at(7, 16, 2));

        let periodic = backend.enabled_periodic_tasks().await.unwrap();
        assert_eq!(periodic[0].last_run_at, Some(at(6, 16, 3)));
        assert_eq!(periodic[0].total_run_count, 2);

        let tasks = backend.query(Query::NameEqual("report_task")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].arguments, Arguments::new().arg(1).kwarg("key", "value"));
        assert_eq!(tasks[0].priority, 2);
    }

    #[tokio::test]
    async fn never_run_tasks_wait_for_their_next_match() {
        let (backend, mut scheduler, ids) = scheduler_with([definition(
            "report",
            Crontab::every_minute().with_minute(2).with_hour(16),
        )])
        .await;

        scheduler.sync(at(6, 16, 3)).await;
        assert_eq!(scheduler.next_run_at(ids[0]), Some(at(7, 16, 2)));

        let tick = scheduler.tick(at(6, 16, 3)).await;
        assert!(tick.fired.is_empty());
        assert!(backend.query(Query::And(vec![])).await.unwrap().is_empty());

        let tick = scheduler.tick(at(7, 16, 2)).await;
        assert_eq!(tick.fired.len(), 1);
    }

    #[tokio::test]
    async fn never_run_tasks_fire_across_sync_and_tick_cycles() {
        let (backend, mut scheduler, _) =
            scheduler_with([definition("heartbeat", Crontab::every_minute())]).await;

        let mut now = at(6, 16, 3) + TimeDelta::seconds(30);
        let mut fired = Vec::new();
        for _ in 0..4 {
            scheduler.sync(now).await;
            let tick = scheduler.tick(now).await;
            fired.push(tick.fired.len());
            now = tick.wake_at + TimeDelta::milliseconds(1);
        }

        assert_eq!(fired, [0, 1, 1, 1]);
        let periodic = backend.enabled_periodic_tasks().await.unwrap();
        assert_eq!(periodic[0].total_run_count, 3);
        assert_eq!(
            periodic[0].last_run_at,
            Some(at(6, 16, 6) + TimeDelta::milliseconds(1))
        );
        let tasks = backend.query(Query::NameEqual("heartbeat_task")).await.unwrap();
        assert_eq!(tasks.len(), 3);
    }

    #[tokio::test]
    async fn unrecorded_runs_do_not_fire_again() {
        let (backend, mut scheduler, id) = flaky_scheduler().await;
        backend.fail_record.store(true, Ordering::SeqCst);

        scheduler.sync(at(6, 16, 3)).await;
        let tick = scheduler.tick(at(6, 16, 4)).await;
        assert_eq!(tick.fired.len(), 1);

        for second in [10, 20, 40] {
            let now = at(6, 16, 4) + TimeDelta::seconds(second);
            scheduler.sync(now).await;
            let tick = scheduler.tick(now).await;
            assert!(tick.fired.is_empty());
            assert_eq!(tick.wake_at, at(6, 16, 5));
        }

        assert_eq!(scheduler.next_run_at(id), Some(at(6, 16, 5)));
        assert_eq!(backend.enabled_periodic_tasks().await.unwrap()[0].last_run_at, None);
        assert_eq!(backend.query(Query::And(vec![])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_enqueue_is_not_recorded_and_retried() {
        let (backend, mut scheduler, id) = flaky_scheduler().await;
        backend.fail_enqueue.store(true, Ordering::SeqCst);

        scheduler.sync(at(6, 16, 3)).await;
        let tick = scheduler.tick(at(6, 16, 4)).await;
        assert!(tick.fired.is_empty());
        assert_eq!(tick.wake_at, at(6, 16, 4) + TimeDelta::seconds(30));
        assert_eq!(backend.enabled_periodic_tasks().await.unwrap()[0].last_run_at, None);

        backend.fail_enqueue.store(false, Ordering::SeqCst);
        let now = at(6, 16, 4) + TimeDelta::seconds(30);
        scheduler.sync(now).await;
        let tick = scheduler.tick(now).await;
        assert_eq!(tick.fired.len(), 1);
        assert_eq!(tick.fired[0].0, id);

        let periodic = backend.enabled_periodic_tasks().await.unwrap();
        assert_eq!(periodic[0].last_run_at, Some(now));
        assert_eq!(periodic[0].total_run_count, 1);
    }

    #[tokio::test]
    async fn wakes_at_the_earliest_entry() {
        let (_backend, mut scheduler, _) = scheduler_with([
            definition("hourly", Crontab::every_minute().with_minute(30)),
            definition("daily", Crontab::every_minute().with_minute(0).with_hour(0)),
        ])
        .await;

        scheduler.sync(at(6, 16, 3)).await;
        let tick = scheduler.tick(at(6, 16, 3)).await;

        assert_eq!(tick.wake_at, at(6, 16, 30));
    }

    #[tokio::test]
    async fn empty_schedule_falls_back_to_default_interval() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut scheduler = BeatScheduler::new(
            backend,
            SchedulerConfig::default().with_default_interval(Duration::from_secs(45)),
        );

        scheduler.sync(at(6, 16, 3)).await;
        let tick = scheduler.tick(at(6, 16, 3)).await;

        assert_eq!(tick.wake_at, at(6, 16, 3) + TimeDelta::seconds(45));
        assert!(tick.fired.is_empty());
    }

    #[tokio::test]
    async fn disabled_tasks_are_dropped_on_sync() {
        let (backend, mut scheduler, ids) = scheduler_with([
            definition("a", Crontab::every_minute()),
            definition("b", Crontab::every_minute()),
        ])
        .await;

        scheduler.sync(at(6, 16, 3)).await;
        assert!(scheduler.next_run_at(ids[1]).is_some());

        backend.set_periodic_task_enabled(ids[1], false).await.unwrap();
        scheduler.sync(at(6, 16, 3)).await;

        assert!(scheduler.next_run_at(ids[0]).is_some());
        assert!(scheduler.next_run_at(ids[1]).is_none());

        let tick = scheduler.tick(at(6, 16, 4)).await;
        assert_eq!(tick.fired.iter().map(|(id, _)| *id).collect::<Vec<_>>(), [ids[0]]);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        let scheduler = BeatScheduler::new(backend, SchedulerConfig::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stopped")
            .unwrap();
    }
}
