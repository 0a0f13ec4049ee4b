/// Common test utilities for berth integration tests
use berth::errors::{BerthError, Result};
use berth::exec::{CommandOutput, CommandRunner, CommandSpec};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

/// A scratch working directory for driving the binary
#[allow(dead_code)]
pub struct TestDir {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

#[allow(dead_code)]
impl TestDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        TestDir { temp_dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run berth in this directory
    pub fn berth(&self, args: &[&str]) -> CommandResult {
        let output = Command::new(env!("CARGO_BIN_EXE_berth"))
            .args(args)
            .current_dir(&self.path)
            .env_remove("BASE_PORT")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to execute berth command");

        CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
        }
    }

    /// Write berth.yml
    pub fn create_config(&self, content: &str) {
        std::fs::write(self.path.join("berth.yml"), content).expect("Failed to write config file");
    }

    pub fn registry_path(&self) -> PathBuf {
        self.path.join("config").join("port_assignments.json")
    }
}

/// Result of running a command
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

#[allow(dead_code)]
impl CommandResult {
    /// Assert the command succeeded
    pub fn assert_success(&self) {
        if !self.success {
            panic!(
                "Command failed:\nstdout: {}\nstderr: {}\nexit code: {:?}",
                self.stdout, self.stderr, self.exit_code
            );
        }
    }

    /// Assert the command failed
    pub fn assert_failure(&self) {
        if self.success {
            panic!(
                "Command succeeded when it should have failed:\nstdout: {}\nstderr: {}",
                self.stdout, self.stderr
            );
        }
    }

    pub fn assert_stdout_contains(&self, text: &str) {
        assert!(
            self.stdout.contains(text),
            "stdout does not contain '{}'\nstdout: {}",
            text,
            self.stdout
        );
    }

    pub fn assert_stderr_contains(&self, text: &str) {
        assert!(
            self.stderr.contains(text),
            "stderr does not contain '{}'\nstderr: {}",
            text,
            self.stderr
        );
    }
}

/// Hold a loopback port until the listener is dropped
#[allow(dead_code)]
pub fn occupy_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Hold a specific loopback port
#[allow(dead_code)]
pub fn occupy(port: u16) -> TcpListener {
    TcpListener::bind(("127.0.0.1", port)).expect("Failed to bind port")
}

/// Base of a block of `count` loopback ports that are free right now
#[allow(dead_code)]
pub fn free_block(count: u16) -> u16 {
    for _ in 0..50 {
        let (listener, base) = occupy_port();
        drop(listener);
        if u32::from(base) + u32::from(count) > 65535 {
            continue;
        }
        if (base..base + count).all(|p| berth::ports::is_available(p, "127.0.0.1")) {
            return base;
        }
    }
    panic!("no free block of {} ports", count);
}

/// Fake container engine: answers commands by display-string prefix and
/// records every call. Unmatched commands behave like a missing program.
#[allow(dead_code)]
pub struct FakeRunner {
    rules: Vec<(String, CommandOutput)>,
    calls: Mutex<Vec<CommandSpec>>,
}

#[allow(dead_code)]
impl FakeRunner {
    pub fn new() -> Self {
        FakeRunner {
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, prefix: &str, output: CommandOutput) -> Self {
        self.rules.push((prefix.to_string(), output));
        self
    }

    /// Podman with no compose tool and containers that start and pass health checks
    pub fn healthy_podman() -> Self {
        FakeRunner::new()
            .on("podman --version", ok("podman version 4.9.3"))
            .on("podman compose version", fail(125, "unknown command"))
            .on("podman-compose", fail(127, "command not found"))
            .on("podman ps", ok(""))
            .on("podman", ok(""))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.display()).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let display = spec.display();
        self.rules
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
            .map(|(_, output)| Ok(output.clone()))
            .unwrap_or_else(|| {
                Err(BerthError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", spec.program),
                )))
            })
    }
}

#[allow(dead_code)]
pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stderr: stderr.to_string(),
        ..Default::default()
    }
}
