//! Process roles.
//!
//! A single binary plays three parts: the main process (enqueuing, supervising a pool, running the
//! scheduler), a worker process started by the pool in [`ConcurrencyMode::Processes`], and a
//! short lived handler process started by [`ProcessEngine`] for every task attempt. The part is
//! selected through environment variables set by the parent, so binaries should call
//! [`Role::from_env`] first thing in `main`.
//!
//! [`ConcurrencyMode::Processes`]: crate::pool::ConcurrencyMode::Processes
//! [`ProcessEngine`]: crate::engine::ProcessEngine
use std::{ffi::OsString, path::PathBuf};

use tokio::process::Command;

pub const ROLE_ENV: &str = "RETASK_ROLE";
pub const WORKER_ID_ENV: &str = "RETASK_WORKER_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Main,
    Worker { worker_id: String },
    Handler,
}

impl Role {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(ROLE_ENV).ok().as_deref(),
            std::env::var(WORKER_ID_ENV).ok(),
        )
    }

    fn from_vars(role: Option<&str>, worker_id: Option<String>) -> Self {
        match role {
            None | Some("main") => Self::Main,
            Some("handler") => Self::Handler,
            Some("worker") => Self::Worker {
                worker_id: worker_id.unwrap_or_else(|| crate::pool::worker_id(0)),
            },
            Some(other) => {
                tracing::warn!("Unknown {ROLE_ENV} value {other:?}, running as main process");
                Self::Main
            }
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Worker { .. } => "worker",
            Self::Handler => "handler",
        }
    }
}

/// The program and arguments used to start worker and handler processes.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-executes the running binary with the arguments it was started with.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).with_args(std::env::args_os().skip(1)))
    }

    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub(crate) fn command(&self, role: &Role) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).env(ROLE_ENV, role.as_str());
        if let Role::Worker { worker_id } = role {
            command.env(WORKER_ID_ENV, worker_id);
        }
        command
    }
}
