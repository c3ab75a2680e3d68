//! A persistent background task engine.
//!
//! Tasks are named units of work with arguments that are stored in a [`Backend`], claimed by
//! competing workers, executed with a timeout in an isolated handler process and retried with
//! exponential backoff. Tasks can depend on other tasks and recurring tasks are fired by a
//! [`BeatScheduler`] from crontab definitions.
//!
//! A binary built on this crate plays several [roles](role::Role): the main process, worker
//! processes and short lived handler processes. The role must be checked before anything else:
//!
//! ```no_run
//! use retask::{backend::memory::InMemoryBackend, prelude::*, role::Role};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), RetaskError> {
//!     let registry = Registry::builder()
//!         .register_fn("greet", |args: Arguments| async move {
//!             println!("hello {:?}", args.args);
//!             Ok(())
//!         })
//!         .build();
//!
//!     if Role::from_env() == Role::Handler {
//!         return retask::engine::serve_handler(&registry).await;
//!     }
//!
//!     let retask = Retask::new(InMemoryBackend::new(), registry)?;
//!     retask.enqueue(TaskBuilder::new("greet").with_arg("world")).await?;
//!
//!     let pool = retask.start_workers(2, ConcurrencyMode::Tasks)?;
//!     tokio::signal::ctrl_c().await?;
//!     pool.shutdown().await
//! }
//! ```
use std::sync::Arc;

use backend::{Backend, BackendError};
use engine::{Engine, ProcessEngine};
use periodic::CronError;
use pool::{ConcurrencyMode, WorkerPool};
use registry::Registry;
use role::ChildCommand;
use scheduler::{BeatScheduler, SchedulerConfig};
use task::{builder::TaskBuilder, TaskId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use worker::{Worker, WorkerConfig};

pub mod backend;
pub mod backoff;
pub mod dependency;
pub mod engine;
pub mod periodic;
pub mod pool;
pub mod prelude;
pub mod registry;
pub mod role;
pub mod scheduler;
pub mod task;
pub mod worker;

/// Ties a backend, a handler registry and an execution engine together.
///
/// By default every task attempt runs in a child process re-executing the current binary, see
/// [`ProcessEngine`].
pub struct Retask<B> {
    backend: Arc<B>,
    registry: Registry,
    engine: Arc<dyn Engine>,
    command: ChildCommand,
    worker_config: WorkerConfig,
}

impl<B> Retask<B>
where
    B: Backend + 'static,
{
    pub fn new(backend: B, registry: Registry) -> Result<Self, RetaskError> {
        Self::from_shared(Arc::new(backend), registry)
    }

    pub fn from_shared(backend: Arc<B>, registry: Registry) -> Result<Self, RetaskError> {
        let command = ChildCommand::current_exe()?;
        Ok(Self {
            backend,
            registry,
            engine: Arc::new(ProcessEngine::new(command.clone())),
            command,
            worker_config: WorkerConfig::default(),
        })
    }

    /// Replaces the program used for worker and handler processes.
    ///
    /// This also resets the engine to a [`ProcessEngine`] running `command`.
    pub fn with_command(self, command: ChildCommand) -> Self {
        Self {
            engine: Arc::new(ProcessEngine::new(command.clone())),
            command,
            ..self
        }
    }

    pub fn with_engine(self, engine: impl Engine + 'static) -> Self {
        Self {
            engine: Arc::new(engine),
            ..self
        }
    }

    pub fn with_worker_config(self, worker_config: WorkerConfig) -> Self {
        Self {
            worker_config,
            ..self
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn enqueue(&self, task: TaskBuilder) -> Result<TaskId, RetaskError> {
        task.enqueue_to_backend(self.backend.as_ref()).await
    }

    pub fn worker(&self, worker_id: impl Into<String>) -> Worker<B> {
        Worker::new(
            worker_id,
            self.backend.clone(),
            self.registry.clone(),
            self.engine.clone(),
        )
        .with_config(self.worker_config)
    }

    /// Runs a single worker in this process until `shutdown` is cancelled.
    ///
    /// This is what a process started in the worker role should do.
    pub async fn run_worker(&self, worker_id: impl Into<String>, shutdown: CancellationToken) {
        self.worker(worker_id).run(shutdown).await
    }

    pub fn start_workers(
        &self,
        count: usize,
        mode: ConcurrencyMode,
    ) -> Result<WorkerPool, RetaskError> {
        match mode {
            ConcurrencyMode::Tasks => Ok(WorkerPool::start_tasks(
                count,
                self.backend.clone(),
                self.registry.clone(),
                self.engine.clone(),
                self.worker_config,
            )),
            ConcurrencyMode::Processes => WorkerPool::start_processes(count, &self.command),
        }
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> BeatScheduler<B> {
        BeatScheduler::new(self.backend.clone(), config)
    }
}

/// Returns a token that is cancelled when the process receives Ctrl-C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
                Err(err) => tracing::error!(?err, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        }
    });
    shutdown
}

#[derive(Debug, Error)]
pub enum RetaskError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    BackendError(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("Invalid periodic schedule: {0}")]
    Cron(#[from] CronError),
    #[error("Process error: {0}")]
    Io(#[from] std::io::Error),
}
