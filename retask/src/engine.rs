//! Running a single task attempt under a hard timeout.
//!
//! The default [`ProcessEngine`] runs every attempt in a fresh child process so that a handler
//! that hangs, blocks its thread or crashes can be killed without affecting the worker. The
//! parent and the child talk over stdio: the parent writes the JSON encoded [`Invocation`] to the
//! child's stdin and the child, running [`serve_handler`], answers with a single JSON
//! [`HandlerReply`] line on stdout.
use std::{fmt::Display, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    registry::Registry,
    role::{ChildCommand, Role},
    task::Arguments,
    RetaskError,
};

/// How much of the child's stderr is kept when reporting a crash.
const STDERR_TAIL: usize = 512;

/// The request sent to a handler: which handler to run and what to pass it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    #[serde(flatten)]
    pub arguments: Arguments,
}

/// The answer a handler process writes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerReply {
    Done,
    Error { message: String },
    Unregistered,
}

impl HandlerReply {
    fn into_result(self, name: &str) -> Result<(), ExecutionError> {
        match self {
            Self::Done => Ok(()),
            Self::Error { message } => Err(ExecutionError::handler(message)),
            Self::Unregistered => Err(ExecutionError::unregistered(name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The attempt ran past the task's timeout and was killed.
    Timeout,
    /// The handler returned an error.
    Handler,
    /// The handler died without answering: a panic, a signal or an unreadable reply.
    Crashed,
    /// No handler is registered under the task's name.
    Unregistered,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Handler => "handler",
            Self::Crashed => "crashed",
            Self::Unregistered => "unregistered",
        })
    }
}

/// A failed attempt. Only the message ends up in the task's error history.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ExecutionError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorType::Timeout,
            format!("Task exceeded timeout of {} seconds", limit.as_secs()),
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Handler, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Crashed, message)
    }

    pub fn unregistered(name: &str) -> Self {
        Self::new(
            ErrorType::Unregistered,
            format!("Task handler {name} is not registered"),
        )
    }
}

/// Executes one attempt of a task.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn execute(&self, invocation: &Invocation, timeout: Duration)
        -> Result<(), ExecutionError>;
}

/// Runs each attempt in a child process that is killed once the timeout elapses.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    command: ChildCommand,
}

impl ProcessEngine {
    pub fn new(command: ChildCommand) -> Self {
        Self { command }
    }

    /// Spawns the running binary in the handler role for every attempt.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(ChildCommand::current_exe()?))
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let payload = serde_json::to_vec(invocation)
            .map_err(|err| ExecutionError::crashed(format!("Failed to encode invocation: {err}")))?;

        let mut child = self
            .command
            .command(&Role::Handler)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ExecutionError::crashed(format!("Failed to spawn handler process: {err}"))
            })?;

        let attempt = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A child that exits without reading its input is judged by its reply.
                if let Err(err) = stdin.write_all(&payload).await {
                    tracing::debug!(?err, "Failed to write invocation to handler process");
                }
            }
            child.wait_with_output().await
        };

        // On timeout the attempt future is dropped together with the child, which kills it.
        let output = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(ExecutionError::crashed(format!(
                    "Failed to wait for handler process: {err}"
                )))
            }
            Err(_) => return Err(ExecutionError::timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<HandlerReply>(line).ok());

        match reply {
            Some(HandlerReply::Done) if !output.status.success() => {
                Err(crashed(output.status, &output.stderr))
            }
            Some(reply) => reply.into_result(&invocation.name),
            None => Err(crashed(output.status, &output.stderr)),
        }
    }
}

fn crashed(status: std::process::ExitStatus, stderr: &[u8]) -> ExecutionError {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    let tail = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(stderr, |(index, _)| &stderr[index..]);
    if tail.is_empty() {
        ExecutionError::crashed(format!("Handler process exited with {status} without a reply"))
    } else {
        ExecutionError::crashed(format!(
            "Handler process exited with {status} without a reply: {tail}"
        ))
    }
}

/// Runs attempts on the worker's own runtime.
///
/// The timeout is enforced by aborting the handler's tokio task, which only takes effect at the
/// handler's next await point. Handlers that block their thread are not interrupted, use
/// [`ProcessEngine`] for those.
#[derive(Debug, Clone)]
pub struct InProcessEngine {
    registry: Registry,
}

impl InProcessEngine {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Engine for InProcessEngine {
    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let registry = self.registry.clone();
        let request = invocation.clone();
        let mut handle = tokio::spawn(async move { dispatch(&registry, request).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(reply)) => reply.into_result(&invocation.name),
            Ok(Err(err)) => Err(ExecutionError::crashed(panic_message(err))),
            Err(_) => {
                handle.abort();
                Err(ExecutionError::timeout(timeout))
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let fallback = err.to_string();
    match err.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(|message| format!("Handler panicked: {message}"))
            .or_else(|| {
                panic
                    .downcast_ref::<String>()
                    .map(|message| format!("Handler panicked: {message}"))
            })
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

/// Resolves and runs the handler for `invocation`.
pub async fn dispatch(registry: &Registry, invocation: Invocation) -> HandlerReply {
    let Some(handler) = registry.get(&invocation.name) else {
        return HandlerReply::Unregistered;
    };
    match handler.handle(invocation.arguments).await {
        Ok(()) => HandlerReply::Done,
        Err(err) => HandlerReply::Error {
            message: err.to_string(),
        },
    }
}

/// Entry point of a handler process.
///
/// Reads one [`Invocation`] from stdin, runs it against `registry` and writes the
/// [`HandlerReply`] to stdout.
pub async fn serve_handler(registry: &Registry) -> Result<(), RetaskError> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;

    let reply = match serde_json::from_slice::<Invocation>(&input) {
        Ok(invocation) => dispatch(registry, invocation).await,
        Err(err) => HandlerReply::Error {
            message: format!("Malformed invocation: {err}"),
        },
    };

    let mut line = serde_json::to_vec(&reply)?;
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use assert_matches::assert_matches;

    use super::*;
    use crate::registry::HandlerError;

    fn invocation(name: &str) -> Invocation {
        Invocation {
            name: name.to_owned(),
            arguments: Arguments::new().arg(1).kwarg("key", "value"),
        }
    }

    fn shell(script: &str) -> ProcessEngine {
        ProcessEngine::new(ChildCommand::new("/bin/sh").with_args(["-c", script]))
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn invocation_wire_format() {
        assert_eq!(
            serde_json::to_value(invocation("greet")).unwrap(),
            serde_json::json!({"name": "greet", "args": [1], "kwargs": {"key": "value"}})
        );
        assert_eq!(
            serde_json::to_string(&HandlerReply::Error {
                message: "boom".to_owned()
            })
            .unwrap(),
            r#"{"outcome":"error","message":"boom"}"#
        );
    }

    #[tokio::test]
    async fn process_done() {
        let engine = shell(
            r#"input=$(cat); case "$input" in *'"name":"greet"'*) echo '{"outcome":"done"}';; *) exit 1;; esac"#,
        );

        assert_eq!(engine.execute(&invocation("greet"), TIMEOUT).await, Ok(()));
    }

    #[tokio::test]
    async fn process_runs_in_handler_role() {
        let engine = shell(
            r#"cat > /dev/null; [ "$RETASK_ROLE" = handler ] && echo '{"outcome":"done"}'"#,
        );

        assert_eq!(engine.execute(&invocation("greet"), TIMEOUT).await, Ok(()));
    }

    #[tokio::test]
    async fn process_handler_error_is_passed_through() {
        let engine = shell(
            r#"cat > /dev/null; echo 'some log line'; echo '{"outcome":"error","message":"boom"}'"#,
        );

        assert_eq!(
            engine.execute(&invocation("greet"), TIMEOUT).await,
            Err(ExecutionError::handler("boom"))
        );
    }

    #[tokio::test]
    async fn process_unregistered() {
        let engine = shell(r#"cat > /dev/null; echo '{"outcome":"unregistered"}'"#);

        assert_matches!(
            engine.execute(&invocation("missing"), TIMEOUT).await,
            Err(ExecutionError { error_type: ErrorType::Unregistered, message })
                if message.contains("missing")
        );
    }

    #[tokio::test]
    async fn process_timeout_kills_the_child() {
        let engine = shell("sleep 30");
        let started = Instant::now();

        let result = engine
            .execute(&invocation("slow"), Duration::from_millis(200))
            .await;

        assert_matches!(
            result,
            Err(ExecutionError { error_type: ErrorType::Timeout, .. })
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_message_names_the_limit() {
        assert_eq!(
            ExecutionError::timeout(Duration::from_secs(2)).to_string(),
            "Task exceeded timeout of 2 seconds"
        );
    }

    #[tokio::test]
    async fn process_crash_reports_stderr() {
        let engine = shell("cat > /dev/null; echo 'thread panicked' >&2; exit 101");

        assert_matches!(
            engine.execute(&invocation("greet"), TIMEOUT).await,
            Err(ExecutionError { error_type: ErrorType::Crashed, message })
                if message.contains("thread panicked")
        );
    }

    #[tokio::test]
    async fn process_without_reply_crashed() {
        let engine = shell("exit 0");

        assert_matches!(
            engine.execute(&invocation("greet"), TIMEOUT).await,
            Err(ExecutionError {
                error_type: ErrorType::Crashed,
                ..
            })
        );
    }

    #[tokio::test]
    async fn process_missing_program_crashed() {
        let engine = ProcessEngine::new(ChildCommand::new("/nonexistent/retask-handler"));

        assert_matches!(
            engine.execute(&invocation("greet"), TIMEOUT).await,
            Err(ExecutionError {
                error_type: ErrorType::Crashed,
                ..
            })
        );
    }

    fn registry() -> Registry {
        Registry::builder()
            .register_fn("ok", |_| async { Ok(()) })
            .register_fn("fail", |arguments: Arguments| async move {
                Err(HandlerError::new(format!("bad args {:?}", arguments.args)))
            })
            .register_fn("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .register("panic", Panics)
            .build()
    }

    struct Panics;

    #[async_trait]
    impl crate::registry::Handler for Panics {
        async fn handle(&self, _arguments: Arguments) -> Result<(), HandlerError> {
            panic!("handler blew up")
        }
    }

    #[tokio::test]
    async fn dispatch_replies() {
        let registry = registry();

        assert_eq!(dispatch(&registry, invocation("ok")).await, HandlerReply::Done);
        assert_matches!(
            dispatch(&registry, invocation("fail")).await,
            HandlerReply::Error { message } if message.starts_with("bad args")
        );
        assert_eq!(
            dispatch(&registry, invocation("missing")).await,
            HandlerReply::Unregistered
        );
    }

    #[tokio::test]
    async fn in_process_engine() {
        let engine = InProcessEngine::new(registry());

        assert_eq!(engine.execute(&invocation("ok"), TIMEOUT).await, Ok(()));
        assert_matches!(
            engine.execute(&invocation("fail"), TIMEOUT).await,
            Err(ExecutionError { error_type: ErrorType::Handler, .. })
        );
        assert_matches!(
            engine.execute(&invocation("panic"), TIMEOUT).await,
            Err(ExecutionError { error_type: ErrorType::Crashed, message })
                if message == "Handler panicked: handler blew up"
        );
        assert_matches!(
            engine
                .execute(&invocation("slow"), Duration::from_millis(50))
                .await,
            Err(ExecutionError { error_type: ErrorType::Timeout, .. })
        );
    }
}
