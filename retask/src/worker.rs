//! The worker poll loop: claim, execute, record the outcome, repeat.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::Backend,
    backoff::Transition,
    engine::{Engine, ExecutionError},
    registry::Registry,
    task::{Task, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long to sleep when there is nothing to claim.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub const fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A single worker competing with others for tasks through [`Backend::claim_one`].
///
/// Workers share nothing with each other except the backend.
pub struct Worker<B> {
    id: String,
    backend: Arc<B>,
    registry: Registry,
    engine: Arc<dyn Engine>,
    config: WorkerConfig,
}

impl<B> Worker<B>
where
    B: Backend + 'static,
{
    pub fn new(
        id: impl Into<String>,
        backend: Arc<B>,
        registry: Registry,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            registry,
            engine,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the poll loop until `shutdown` is cancelled.
    ///
    /// An attempt in flight when shutdown is requested is finished and recorded first.
    #[instrument(skip_all, fields(worker_id = %self.id))]
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Worker {} started", self.id);
        while !shutdown.is_cancelled() {
            if self.process_next().await {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }
        tracing::info!("Worker {} stopped", self.id);
    }

    /// Claims and runs at most one task. Returns whether a task was claimed.
    pub async fn process_next(&self) -> bool {
        let task = match self.backend.claim_one(&self.id).await {
            Ok(Some(task)) => task,
            Ok(None) => return false,
            Err(err) => {
                tracing::error!(?err, "Failed to claim a task, error: {err}");
                return false;
            }
        };
        self.process(task).await;
        true
    }

    async fn process(&self, task: Task) {
        let task_id = task.id;
        if !self.registry.contains(&task.name) {
            let error = ExecutionError::unregistered(&task.name);
            tracing::error!(%task_id, "Task {task_id} failed and will not be retried: {error}");
            self.mark_failed(task_id, error).await;
            return;
        }

        tracing::debug!(%task_id, "Executing task {task_id} ({})", task.name);
        match self
            .engine
            .execute(&task.invocation(), task.timeout())
            .await
        {
            Ok(()) => self.mark_complete(task_id).await,
            Err(error) => self.handle_error(&task, error).await,
        }
    }

    async fn handle_error(&self, task: &Task, error: ExecutionError) {
        let task_id = task.id;
        match Transition::after_failure(task, error.error_type, Utc::now()) {
            Transition::Retry { scheduled_at } => {
                tracing::warn!(
                    %task_id,
                    ?error,
                    "Task {task_id} failed and will be retried at {scheduled_at}: error type: {}, message: {}",
                    error.error_type,
                    error.message
                );
                let _ = self
                    .backend
                    .mark_task_retryable(task_id, scheduled_at, error)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %task_id,
                            "Failed to mark task {task_id} as retryable, error: {err:?}",
                        )
                    });
            }
            Transition::Fail => {
                tracing::error!(
                    %task_id,
                    ?error,
                    "Task {task_id} failed and will not be retried: error type: {}, message: {}",
                    error.error_type,
                    error.message
                );
                self.mark_failed(task_id, error).await;
            }
        }
    }

    async fn mark_complete(&self, task_id: TaskId) {
        tracing::debug!(%task_id, "Task complete {task_id}");
        let _ = self
            .backend
            .mark_task_complete(task_id)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %task_id,
                    "Failed to mark task {task_id} as complete, error: {err:?}",
                )
            });
    }

    async fn mark_failed(&self, task_id: TaskId, error: ExecutionError) {
        let _ = self
            .backend
            .mark_task_failed(task_id, error)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %task_id,
                    "Failed to mark task {task_id} as failed, error: {err:?}",
                )
            });
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, testing::BackendTesting, EnqueuableTask},
        engine::{InProcessEngine, Invocation, ProcessEngine},
        registry::HandlerError,
        role::ChildCommand,
        task::TaskStatus,
    };

    /// Replays queued results and records the invocations it saw.
    #[derive(Default)]
    struct MockEngine {
        results: Mutex<Vec<Result<(), ExecutionError>>>,
        invocations: Mutex<Vec<(Invocation, Duration)>>,
    }

    impl MockEngine {
        fn returning(results: impl IntoIterator<Item = Result<(), ExecutionError>>) -> Self {
            let mut results: Vec<_> = results.into_iter().collect();
            results.reverse();
            Self {
                results: Mutex::new(results),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        async fn execute(
            &self,
            invocation: &Invocation,
            timeout: Duration,
        ) -> Result<(), ExecutionError> {
            self.invocations
                .lock()
                .unwrap()
                .push((invocation.clone(), timeout));
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    fn registry() -> Registry {
        Registry::builder()
            .register_fn(EnqueuableTask::DEFAULT_NAME, |_| async { Ok(()) })
            .build()
    }

    fn worker(backend: &Arc<InMemoryBackend>, engine: Arc<dyn Engine>) -> Worker<InMemoryBackend> {
        Worker::new("worker-1", backend.clone(), registry(), engine)
    }

    #[tokio::test]
    async fn completes_successful_tasks() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Arc::new(MockEngine::default());
        let id = backend
            .enqueue(EnqueuableTask::mock_task().with_max_retries(3))
            .await
            .unwrap();

        assert!(worker(&backend, engine.clone()).process_next().await);

        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(task.attempts, 0);

        let invocations = engine.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0.name, EnqueuableTask::DEFAULT_NAME);
        assert_eq!(invocations[0].1, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn nothing_to_claim() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Arc::new(MockEngine::default());

        assert!(!worker(&backend, engine).process_next().await);
    }

    #[tokio::test]
    async fn failures_back_off_then_fail() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Arc::new(MockEngine::returning(
            (0..3).map(|i| Err(ExecutionError::handler(format!("boom {i}")))),
        ));
        let worker = worker(&backend, engine);
        let id = backend
            .enqueue(EnqueuableTask::mock_task().with_max_retries(3))
            .await
            .unwrap();

        let before = Utc::now();
        assert!(worker.process_next().await);
        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        let delay = task.scheduled_at.unwrap() - before;
        assert!(delay >= TimeDelta::seconds(60) && delay < TimeDelta::seconds(62));

        make_runnable(&backend, id);
        let before = Utc::now();
        assert!(worker.process_next().await);
        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 2);
        let delay = task.scheduled_at.unwrap() - before;
        assert!(delay >= TimeDelta::seconds(120) && delay < TimeDelta::seconds(122));

        make_runnable(&backend, id);
        assert!(worker.process_next().await);
        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(
            task.last_errors.iter().collect::<Vec<_>>(),
            ["boom 0", "boom 1", "boom 2"]
        );
    }

    #[tokio::test]
    async fn timeout_is_retried_while_attempts_remain() {
        let backend = Arc::new(InMemoryBackend::new());
        let timeout = ExecutionError::timeout(Duration::from_secs(300));
        let engine = Arc::new(MockEngine::returning([
            Err(timeout.clone()),
            Err(timeout.clone()),
        ]));
        let worker = worker(&backend, engine);

        let retried = backend
            .enqueue(EnqueuableTask::mock_task().with_max_retries(2))
            .await
            .unwrap();
        assert!(worker.process_next().await);
        let task = backend.task(retried).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_errors.last(), Some(timeout.message.as_str()));

        let failed = backend
            .enqueue(EnqueuableTask::mock_task().with_max_retries(1))
            .await
            .unwrap();
        assert!(worker.process_next().await);
        let task = backend.task(failed).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn unregistered_tasks_fail_without_executing() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Arc::new(MockEngine::default());
        let id = backend
            .enqueue(
                EnqueuableTask::mock_task()
                    .with_name("unknown")
                    .with_max_retries(5),
            )
            .await
            .unwrap();

        assert!(worker(&backend, engine.clone()).process_next().await);

        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(
            task.last_errors.last(),
            Some("Task handler unknown is not registered")
        );
        assert!(engine.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregistered_reply_from_handler_process_is_terminal() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = ProcessEngine::new(
            ChildCommand::new("/bin/sh")
                .with_args(["-c", r#"cat > /dev/null; echo '{"outcome":"unregistered"}'"#]),
        );
        let id = backend
            .enqueue(EnqueuableTask::mock_task().with_max_retries(3))
            .await
            .unwrap();

        assert!(worker(&backend, Arc::new(engine)).process_next().await);

        let task = backend.task(id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.scheduled_at, None);
        assert_eq!(
            task.last_errors.last(),
            Some(format!("Task handler {} is not registered", EnqueuableTask::DEFAULT_NAME).as_str())
        );
    }

    #[tokio::test]
    async fn runs_real_handlers_in_process() {
        let backend = Arc::new(InMemoryBackend::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::builder()
            .register_fn("record", {
                let seen = seen.clone();
                move |arguments: crate::task::Arguments| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(arguments.args);
                        Ok(())
                    }
                }
            })
            .register_fn("fail", |_| async { Err(HandlerError::new("nope")) })
            .build();
        let worker = Worker::new(
            "worker-1",
            backend.clone(),
            registry.clone(),
            Arc::new(InProcessEngine::new(registry)),
        );

        let ok = crate::task::builder::TaskBuilder::new("record")
            .with_arg(42)
            .enqueue_to_backend(backend.as_ref())
            .await
            .unwrap();
        let failed = crate::task::builder::TaskBuilder::new("fail")
            .enqueue_to_backend(backend.as_ref())
            .await
            .unwrap();

        assert!(worker.process_next().await);
        assert!(worker.process_next().await);
        assert!(!worker.process_next().await);

        assert_eq!(backend.task(ok).await.status, TaskStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![vec![serde_json::Value::from(42)]]);
        let failed = backend.task(failed).await;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_errors.last(), Some("nope"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        let worker = worker(&backend, Arc::new(MockEngine::default()))
            .with_config(WorkerConfig::default().with_poll_interval(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stopped")
            .unwrap();
    }

    #[tokio::test]
    async fn run_processes_tasks_until_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = Arc::new(MockEngine::default());
        let ids = futures::future::join_all(
            (0..3).map(|_| backend.enqueue(EnqueuableTask::mock_task())),
        )
        .await;
        let worker = worker(&backend, engine)
            .with_config(WorkerConfig::default().with_poll_interval(Duration::from_millis(10)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        for id in ids {
            let id = id.unwrap();
            tokio::time::timeout(Duration::from_secs(5), async {
                while backend.task(id).await.status != TaskStatus::Completed {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("task completed");
        }

        shutdown.cancel();
        handle.await.unwrap();
    }

    fn make_runnable(backend: &InMemoryBackend, id: TaskId) {
        backend.reschedule(id, Utc::now() - TimeDelta::seconds(1));
    }
}
