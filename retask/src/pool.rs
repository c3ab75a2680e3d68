//! Running several workers side by side.
//!
//! Each worker is an independent unit of concurrency: either a tokio task in this process or a
//! separate OS process running the same binary in the worker [`Role`]. Workers only ever
//! interact through the backend.
use std::{process::Stdio, sync::Arc};

use tokio::{process::Child, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::Backend,
    engine::Engine,
    registry::Registry,
    role::{ChildCommand, Role},
    worker::{Worker, WorkerConfig},
    RetaskError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// One tokio task per worker.
    #[default]
    Tasks,
    /// One child process per worker.
    Processes,
}

/// Identifier of the `index`th worker started by this process: `<hostname>-<pid>-<index>`.
///
/// The host name is read from `HOSTNAME`, falling back to `worker`.
pub fn worker_id(index: usize) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "worker".to_owned());
    format!("{host}-{}-{index}", std::process::id())
}

enum Unit {
    Task {
        worker_id: String,
        handle: JoinHandle<()>,
    },
    Process {
        worker_id: String,
        child: Child,
    },
}

impl Unit {
    fn worker_id(&self) -> &str {
        match self {
            Self::Task { worker_id, .. } | Self::Process { worker_id, .. } => worker_id,
        }
    }
}

/// A running set of workers.
pub struct WorkerPool {
    units: Vec<Unit>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns `count` workers as tokio tasks on the current runtime.
    pub fn start_tasks<B>(
        count: usize,
        backend: Arc<B>,
        registry: Registry,
        engine: Arc<dyn Engine>,
        config: WorkerConfig,
    ) -> Self
    where
        B: Backend + 'static,
    {
        let shutdown = CancellationToken::new();
        let units = (0..count)
            .map(|index| {
                let worker = Worker::new(
                    worker_id(index),
                    backend.clone(),
                    registry.clone(),
                    engine.clone(),
                )
                .with_config(config);
                let worker_id = worker.id().to_owned();
                let handle = tokio::spawn(worker.run(shutdown.child_token()));
                Unit::Task { worker_id, handle }
            })
            .collect();
        tracing::info!("Started {count} worker tasks");
        Self { units, shutdown }
    }

    /// Starts `count` worker processes from `command`, each told its worker id through the
    /// environment.
    pub fn start_processes(count: usize, command: &ChildCommand) -> Result<Self, RetaskError> {
        let mut units = Vec::with_capacity(count);
        for index in 0..count {
            let worker_id = worker_id(index);
            let spawned = command
                .command(&Role::Worker {
                    worker_id: worker_id.clone(),
                })
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => {
                    tracing::debug!(pid = child.id(), "Started worker process {worker_id}");
                    units.push(Unit::Process { worker_id, child });
                }
                Err(err) => {
                    tracing::error!(?err, "Failed to start worker process {worker_id}");
                    // Dropping the pool kills the processes already started.
                    return Err(err.into());
                }
            }
        }
        tracing::info!("Started {count} worker processes");
        Ok(Self {
            units,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(Unit::worker_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Waits for every worker to stop.
    pub async fn join(self) -> Result<(), RetaskError> {
        let stopping = self.shutdown.is_cancelled();
        let mut failed = false;
        for unit in self.units {
            match unit {
                Unit::Task { worker_id, handle } => {
                    if let Err(err) = handle.await {
                        tracing::error!(?err, "Worker {worker_id} did not stop cleanly");
                        failed = true;
                    }
                }
                Unit::Process {
                    worker_id,
                    mut child,
                } => match child.wait().await {
                    Ok(status) if status.success() || stopping => {
                        tracing::debug!("Worker process {worker_id} exited with {status}");
                    }
                    Ok(status) => {
                        tracing::warn!("Worker process {worker_id} exited with {status}");
                    }
                    Err(err) => {
                        tracing::error!(?err, "Failed to wait for worker process {worker_id}");
                        failed = true;
                    }
                },
            }
        }
        if failed {
            Err(RetaskError::GracefulShutdownFailed)
        } else {
            Ok(())
        }
    }

    /// Stops every worker and waits for them.
    ///
    /// Task workers finish the attempt they are running, worker processes are killed.
    pub async fn shutdown(mut self) -> Result<(), RetaskError> {
        tracing::info!("Shutting down {} workers", self.units.len());
        self.shutdown.cancel();
        for unit in &mut self.units {
            if let Unit::Process { worker_id, child } = unit {
                if let Err(err) = child.start_kill() {
                    tracing::warn!(?err, "Failed to kill worker process {worker_id}");
                }
            }
        }
        self.join().await
    }
}
