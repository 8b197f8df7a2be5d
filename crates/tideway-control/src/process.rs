//! External program execution.
//!
//! Provider CLIs, `docker`, `ssh` and `ansible-playbook` are all driven
//! through a [`CommandRunner`], so the clients built on top of it can be
//! exercised against a [`ScriptedRunner`] without touching real tools.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{ControlError, ControlResult};

/// Description of a program invocation.
#[derive(Clone)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Data written to stdin, then closed.
    pub stdin: Option<String>,
    /// Working directory.
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Maximum run time. The child is killed when it expires.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Start a spec for `program` with a 60 second timeout.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
            env: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` on stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the run timeout.
    #[must_use]
    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    /// Whether any argument equals `value`.
    #[must_use]
    pub fn has_arg(&self, value: &str) -> bool {
        self.args.iter().any(|a| a == value)
    }

    /// The argument following `flag`, if present.
    #[must_use]
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

// Stdin is left out: it carries registry passwords.
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("current_dir", &self.current_dir)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Captured output of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code, `-1` when killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failed run printing `stderr`.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Whether the program exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `max` bytes of stdout.
    #[must_use]
    pub fn stdout_tail(&self, max: usize) -> &str {
        tail(&self.stdout, max)
    }

    /// Last `max` bytes of stderr.
    #[must_use]
    pub fn stderr_tail(&self, max: usize) -> &str {
        tail(&self.stderr, max)
    }
}

/// The last `max` bytes of `text`, cut on a character boundary.
#[must_use]
pub fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion.
    ///
    /// A non-zero exit is not an error; callers inspect
    /// [`CommandOutput::exit_code`]. Errors mean the program could not be
    /// started or did not finish in time.
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput>;
}

/// Runs programs as child processes.
///
/// Children are killed when the returned future is dropped, so a caller
/// racing a run against cancellation does not leak processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(program = %spec.program))]
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput> {
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        debug!("spawning");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ControlError::ToolUnavailable {
                    tool: spec.program.clone(),
                }
            } else {
                ControlError::permanent("spawn", &spec.program, e.to_string())
            }
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| ControlError::transient("write stdin", &spec.program, e.to_string()))?;
            }
        }

        let output = timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| ControlError::Timeout {
                operation: spec.program.clone(),
                limit: spec.timeout,
            })?
            .map_err(|e| ControlError::transient("wait", &spec.program, e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(
            exit_code,
            duration_ms = start.elapsed().as_millis(),
            "process finished"
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

type Responder = dyn Fn(&CommandSpec) -> ControlResult<CommandOutput> + Send + Sync;

/// Runner that answers from a closure and records every invocation.
///
/// Useful for testing clients that shell out.
#[derive(Clone)]
pub struct ScriptedRunner {
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedRunner {
    /// Create a runner answering with `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> ControlResult<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every invocation so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Invocations whose argument list contains `needle`.
    #[must_use]
    pub fn calls_with(&self, needle: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.has_arg(needle))
            .collect()
    }
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner").finish_non_exhaustive()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput> {
        self.calls
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .push(spec.clone());
        (self.responder)(spec)
    }
}
