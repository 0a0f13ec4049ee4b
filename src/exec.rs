// External command execution
// Every engine, compose, health, and diagnosis call goes through CommandRunner

use crate::clock::{Clock, Deadline, SystemClock};
use crate::errors::{BerthError, Result};
use crate::signals::ShutdownSignal;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// A fully described invocation, built without a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Killed early when shutdown is requested
    pub interruptible: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout: None,
            interruptible: false,
        }
    }

    /// Build from an argv vector; the first element is the program
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| BerthError::Validation("command must not be empty".to_string()))?;
        Ok(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Human readable form for logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished (or timed out) command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// stdout followed by stderr, verbatim
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Turn a non-zero exit or a timeout into an error carrying the captured output
    pub fn into_result(self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.timed_out {
            return Err(BerthError::CommandTimeout {
                command: spec.display(),
                seconds: spec.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        if self.code != Some(0) {
            return Err(BerthError::CommandFailed {
                command: spec.display(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            });
        }
        Ok(self)
    }
}

/// Executes external programs
pub trait CommandRunner: Send + Sync {
    /// Run to completion (or until its timeout). A program that cannot be
    /// spawned is an `Err`; a program that exits non-zero is an `Ok` output.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as real child processes
pub struct SystemRunner {
    clock: Arc<dyn Clock>,
    shutdown: Option<ShutdownSignal>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shutdown: None,
        }
    }

    /// Interruptible commands are killed once `shutdown` is triggered
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        // Output goes to temp files rather than pipes so a chatty child cannot
        // block on a full pipe buffer while we poll it
        let stdout_file = tempfile::NamedTempFile::new()?;
        let stderr_file = tempfile::NamedTempFile::new()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(File::create(stdout_file.path())?)
            .stderr(File::create(stderr_file.path())?);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        tracing::debug!(command = %spec.display(), "spawning");
        let mut child = command.spawn()?;

        let shutdown = self.shutdown.as_ref().filter(|_| spec.interruptible);
        let outcome = if spec.timeout.is_none() && shutdown.is_none() {
            Wait::Exited(child.wait()?)
        } else {
            poll_child(&mut child, spec.timeout, shutdown, self.clock.as_ref())?
        };

        let status = match outcome {
            Wait::Exited(status) => Some(status),
            Wait::TimedOut => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %spec.display(), "timed out");
                None
            }
            Wait::Interrupted => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %spec.display(), "killed on shutdown");
                return Err(BerthError::Interrupted);
            }
        };

        Ok(CommandOutput {
            code: status.and_then(|s| s.code()),
            stdout: read_lossy(stdout_file.path()),
            stderr: read_lossy(stderr_file.path()),
            timed_out: status.is_none(),
        })
    }
}

fn read_lossy(path: &Path) -> String {
    let mut bytes = Vec::new();
    if let Ok(mut file) = File::open(path) {
        let _ = file.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

enum Wait {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
}

/// Poll a child until it exits, the timeout passes, or shutdown is requested.
/// The caller is responsible for killing the child in the latter two cases.
fn poll_child(
    child: &mut Child,
    timeout: Option<Duration>,
    shutdown: Option<&ShutdownSignal>,
    clock: &dyn Clock,
) -> Result<Wait> {
    let deadline = timeout.map(|t| Deadline::after(clock, t));
    let poll_interval = Duration::from_millis(50);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Wait::Exited(status)),
            Ok(None) => {
                if shutdown.is_some_and(|s| s.is_triggered()) {
                    return Ok(Wait::Interrupted);
                }
                let mut nap = poll_interval;
                if let Some(deadline) = &deadline {
                    if deadline.expired(clock) {
                        return Ok(Wait::TimedOut);
                    }
                    nap = nap.min(deadline.remaining(clock));
                }
                clock.sleep(nap);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BerthError::Io(e));
            }
        }
    }
}
