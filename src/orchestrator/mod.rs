// Test environment lifecycle: runtime detection, port allocation, container
// startup, health gating, test execution, cleanup

pub mod compose;
pub mod health;
pub mod phase;
pub mod services;
pub mod session;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConflictPolicy, StartMode};
use crate::errors::{BerthError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::ports::env::env_prefix;
use crate::ports::{port_env_var, probe, PortAssignmentRegistry, PortBlockChecker, ProbeOutcome};
use crate::ports::{ProcessAttributor, SequentialPortFinder};
use crate::runtime::{ComposeMechanism, ContainerRuntime, RuntimeDetector};
use crate::signals::ShutdownSignal;
use chrono::Local;
use compose::{manifest_path, ComposeManifest};
use health::HealthGate;
use phase::Phase;
use session::{OrchestrationSession, SessionRecord};
use std::collections::{BTreeMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

type PortProbe = Arc<dyn Fn(u16, &str) -> ProbeOutcome + Send + Sync>;

/// How containers get started for a detected runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPath {
    Pod,
    Compose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Containers were already running and healthy; nothing was touched
    Reused,
}

/// Result of one test runner invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Sanitize for compose project and pod names:
/// lowercase alphanumerics and single hyphens, no leading or trailing hyphen
pub fn sanitize_project_name(name: &str) -> String {
    let sanitized = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();

    sanitized
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub struct ContainerOrchestrator {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    registry: Option<Arc<PortAssignmentRegistry>>,
    probe: PortProbe,
    phase: Phase,
    runtime: Option<ContainerRuntime>,
    ports: BTreeMap<String, u16>,
    session: Option<OrchestrationSession>,
}

impl ContainerOrchestrator {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            clock: Arc::new(SystemClock),
            shutdown: ShutdownSignal::new(),
            registry: None,
            probe: Arc::new(probe),
            phase: Phase::Idle,
            runtime: None,
            ports: BTreeMap::new(),
            session: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Export the registry's assignments to the test runner too
    pub fn with_registry(mut self, registry: Arc<PortAssignmentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the socket probe used for allocation
    pub fn with_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(u16, &str) -> ProbeOutcome + Send + Sync + 'static,
    {
        self.probe = Arc::new(probe);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn runtime(&self) -> Option<&ContainerRuntime> {
        self.runtime.as_ref()
    }

    pub fn ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    pub fn session(&self) -> Option<&OrchestrationSession> {
        self.session.as_ref()
    }

    pub fn project_name(&self) -> String {
        sanitize_project_name(&self.config.containers.project_name)
    }

    /// Record a failed step on the phase and pass the result through
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() && self.phase.can_advance_to(Phase::Failed) {
            self.phase = Phase::Failed;
        }
        result
    }

    pub fn detect_runtime(&mut self) -> Result<ContainerRuntime> {
        if self.phase == Phase::CleanedUp {
            self.phase.advance(Phase::Idle)?;
        }
        if let Some(runtime) = self.runtime.clone() {
            if self.phase == Phase::Idle {
                self.phase.advance(Phase::RuntimeDetected)?;
            }
            return Ok(runtime);
        }

        let detector =
            RuntimeDetector::new(self.runner.clone(), self.config.containers.probe_timeout());
        let result = detector.detect();
        let runtime = self.track(result)?;
        self.phase.advance(Phase::RuntimeDetected)?;
        self.runtime = Some(runtime.clone());
        Ok(runtime)
    }

    /// Which start path the configured mode selects for `runtime`
    pub fn start_path(&self, runtime: &ContainerRuntime) -> Result<StartPath> {
        match self.config.containers.mode {
            StartMode::Auto if runtime.compose == ComposeMechanism::NativePod => Ok(StartPath::Pod),
            StartMode::Auto => Ok(StartPath::Compose),
            StartMode::Pod if runtime.kind.supports_pods() => Ok(StartPath::Pod),
            StartMode::Pod => Err(BerthError::Config(format!(
                "mode 'pod' needs podman, detected {}",
                runtime.name
            ))),
            StartMode::Compose if runtime.compose_argv().is_some() => Ok(StartPath::Compose),
            StartMode::Compose => Err(BerthError::Config(format!(
                "mode 'compose' needs a compose tool, none found for {}",
                runtime.name
            ))),
        }
    }

    /// Reserve one port per logical service from a contiguous block
    pub fn allocate_ports(&mut self) -> Result<BTreeMap<String, u16>> {
        let result = self.allocate_block();
        let ports = self.track(result)?;
        self.phase.advance(Phase::PortsAllocated)?;
        self.ports = ports.clone();
        Ok(ports)
    }

    fn allocate_block(&self) -> Result<BTreeMap<String, u16>> {
        self.shutdown.check()?;
        let settings = &self.config.ports;
        let count = settings.services.len() as i32;
        let base = settings.preferred_base;
        let host = settings.host.as_str();
        let probe = self.probe.clone();

        let checker =
            PortBlockChecker::new(host, ProcessAttributor::for_host(self.runner.clone()));
        let check = checker.check_with(base, count, |port| probe(port, host));

        let block = if check.available {
            check.ports()
        } else {
            let message = check.error_message.clone().unwrap_or_default();
            if !check.is_valid_range() {
                return Err(BerthError::Validation(message));
            }
            if check.confirmed_conflict && settings.on_conflict == ConflictPolicy::Abort {
                return Err(BerthError::PortConflict {
                    message,
                    ports: check.busy_ports.iter().map(|p| p.port).collect(),
                });
            }
            tracing::warn!(%message, "preferred port block unavailable, searching for another");
            SequentialPortFinder::new(host)
                .with_max_attempts(settings.max_attempts)
                .find_with(base, count, |port| probe(port, host).is_free())?
        };

        let ports: BTreeMap<String, u16> = settings
            .services
            .iter()
            .cloned()
            .zip(block.iter().copied())
            .collect();
        tracing::info!(
            base = block[0],
            ports = ?ports,
            "allocated ports"
        );
        Ok(ports)
    }

    /// `<SERVICE>_PORT` for every allocated service, plus `HTTP_SERVER_PORT` for `app`
    pub fn port_env_vars(&self) -> BTreeMap<String, String> {
        let mut vars: BTreeMap<String, String> = self
            .ports
            .iter()
            .map(|(service, port)| (port_env_var(service), port.to_string()))
            .collect();
        if let Some(app) = self.ports.get("app") {
            vars.insert("HTTP_SERVER_PORT".to_string(), app.to_string());
        }
        vars
    }

    /// Everything the test runner sees on top of the inherited environment
    pub fn test_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(registry) = &self.registry {
            env.extend(registry.export_env_vars());
        }
        env.extend(self.config.tests.env.clone());
        for service in &self.config.containers.services {
            env.insert(format!("{}_HOST", env_prefix(&service.name)), "localhost".to_string());
            env.extend(service.connection.clone());
        }
        env.extend(self.port_env_vars());
        env
    }

    fn health_gate<'a>(&'a self, runtime: &'a ContainerRuntime) -> HealthGate<'a> {
        HealthGate {
            runner: self.runner.as_ref(),
            clock: self.clock.as_ref(),
            shutdown: &self.shutdown,
            engine: &runtime.command,
            services: &self.config.containers.services,
            probe_timeout: self.config.containers.probe_timeout(),
        }
    }

    /// All configured containers are listed by `<engine> ps`
    fn containers_running(&self, runtime: &ContainerRuntime) -> bool {
        let spec = runtime
            .command(["ps", "--format", "{{.Names}}"])
            .timeout(self.config.containers.probe_timeout());
        let output = match self.runner.run(&spec) {
            Ok(output) if output.success() => output,
            _ => return false,
        };
        let running: HashSet<&str> = output.stdout.lines().map(str::trim).collect();
        self.config
            .containers
            .services
            .iter()
            .all(|s| running.contains(s.container_name.as_str()))
    }

    fn environment_healthy(&self, runtime: &ContainerRuntime) -> Result<bool> {
        if !self.containers_running(runtime) {
            return Ok(false);
        }
        Ok(self.health_gate(runtime).pending()?.is_empty())
    }

    /// Start every configured container. Safe to call again: an environment
    /// that is already running and healthy is left alone.
    pub fn start_containers(&mut self) -> Result<StartOutcome> {
        let result = self.start_inner();
        self.track(result)
    }

    fn start_inner(&mut self) -> Result<StartOutcome> {
        self.shutdown.check()?;
        let runtime = self.detect_runtime()?;
        let path = self.start_path(&runtime)?;
        let project = self.project_name();

        let launched = matches!(
            self.phase,
            Phase::ContainersStarting | Phase::Healthy | Phase::TestsRunning
        );
        if launched && self.environment_healthy(&runtime)? {
            tracing::info!("containers already running and healthy");
            if self.phase == Phase::ContainersStarting {
                self.phase.advance(Phase::Healthy)?;
                self.save_record(&runtime);
            }
            return Ok(StartOutcome::Reused);
        }
        if self.phase == Phase::ContainersStarting && self.containers_running(&runtime) {
            tracing::info!("containers still starting, leaving them alone");
            return Ok(StartOutcome::Started);
        }

        if self.ports.is_empty() {
            let state_dir = &self.config.containers.state_dir;
            if let Some(record) = SessionRecord::load(state_dir, &project) {
                if self.environment_healthy(&runtime)? {
                    tracing::info!(ports = ?record.ports, "reusing running environment");
                    self.ports = record.ports;
                    self.phase.advance(Phase::PortsAllocated)?;
                    self.phase.advance(Phase::Healthy)?;
                    let mut session =
                        OrchestrationSession::new(runtime, self.ports.clone(), &project);
                    session.reused = true;
                    self.session = Some(session);
                    return Ok(StartOutcome::Reused);
                }
            }
            self.allocate_ports()?;
        }

        if self.phase != Phase::ContainersStarting {
            self.phase.advance(Phase::ContainersStarting)?;
        }
        self.session = Some(OrchestrationSession::new(
            runtime.clone(),
            self.ports.clone(),
            &project,
        ));
        self.remove_stale(&runtime, path, &project);

        match path {
            StartPath::Pod => self.start_pod(&runtime, &project)?,
            StartPath::Compose => self.start_compose(&runtime, &project)?,
        }
        Ok(StartOutcome::Started)
    }

    /// Same-named leftovers from an earlier run would make `run`/`up` fail
    fn remove_stale(&self, runtime: &ContainerRuntime, path: StartPath, project: &str) {
        for service in &self.config.containers.services {
            self.run_quietly(runtime.command(["rm", "-f", service.container_name.as_str()]));
        }
        if path == StartPath::Pod {
            self.run_quietly(runtime.command(["pod", "rm", "-f", project]));
        }
    }

    /// Cleanup-style call: failures are logged, never raised
    fn run_quietly(&self, spec: CommandSpec) -> bool {
        let spec = spec.timeout(CLEANUP_TIMEOUT);
        match self.runner.run(&spec) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::debug!(
                    command = %spec.display(),
                    stderr = %output.stderr.trim(),
                    "ignored failure"
                );
                false
            }
            Err(e) => {
                tracing::debug!(command = %spec.display(), error = %e, "ignored failure");
                false
            }
        }
    }

    fn session_mut(&mut self) -> Result<&mut OrchestrationSession> {
        self.session.as_mut().ok_or_else(|| BerthError::InvalidTransition {
            from: Phase::Idle.to_string(),
            to: Phase::ContainersStarting.to_string(),
        })
    }

    fn start_pod(&mut self, runtime: &ContainerRuntime, project: &str) -> Result<()> {
        self.shutdown.check()?;
        let mut create = runtime.command(["pod", "create", "--name", project]);
        for service in &self.config.containers.services {
            let host_port = self.service_port(service.port_key())?;
            create = create.args([
                "-p".to_string(),
                format!("{}:{}", host_port, service.container_port),
            ]);
        }

        tracing::info!(pod = %project, "creating pod");
        let output = self.runner.run(&create)?;
        if !output.success() && !output.stderr.contains("already exists") {
            output.into_result(&create)?;
        }
        self.session_mut()?.pod_created = true;

        let services = self.config.containers.services.clone();
        for service in &services {
            self.shutdown.check()?;
            let mut run = runtime.command([
                "run",
                "-d",
                "--name",
                service.container_name.as_str(),
                "--pod",
                project,
            ]);
            for (key, value) in &service.env {
                run = run.args(["-e".to_string(), format!("{}={}", key, value)]);
            }
            for volume in &service.volumes {
                run = run.args(["-v", volume.as_str()]);
            }
            run = run.arg(service.image.as_str());

            tracing::info!(
                container = %service.container_name,
                image = %service.image,
                "starting container"
            );
            self.runner.run(&run)?.into_result(&run)?;
            self.session_mut()?.containers.push(service.container_name.clone());
        }
        Ok(())
    }

    fn start_compose(&mut self, runtime: &ContainerRuntime, project: &str) -> Result<()> {
        let file = match &self.config.containers.compose_file {
            Some(file) => file.clone(),
            None => ComposeManifest::build(&self.config.containers.services, &self.ports)?
                .write(&self.config.containers.state_dir, project)?,
        };
        // Recorded before `up` so a partial start is still torn down
        self.session_mut()?.compose_file = Some(file.clone());

        let up = runtime
            .compose_command([
                "-f".to_string(),
                file.display().to_string(),
                "-p".to_string(),
                project.to_string(),
                "up".to_string(),
                "--build".to_string(),
                "-d".to_string(),
            ])
            .ok_or_else(|| BerthError::Config(format!("no compose tool for {}", runtime.name)))?
            .interruptible();

        tracing::info!(
            compose = %runtime.compose_display(),
            file = %file.display(),
            "starting containers"
        );
        self.runner.run(&up)?.into_result(&up)?;

        let names = self
            .config
            .containers
            .services
            .iter()
            .map(|s| s.container_name.clone())
            .collect();
        self.session_mut()?.containers = names;
        Ok(())
    }

    fn service_port(&self, service: &str) -> Result<u16> {
        self.ports
            .get(service)
            .copied()
            .ok_or_else(|| BerthError::Config(format!("no port allocated for '{}'", service)))
    }

    /// Poll every health probe at the configured interval until all pass
    pub fn wait_for_healthy(&mut self) -> Result<()> {
        if self.phase == Phase::Healthy || self.phase == Phase::TestsRunning {
            return Ok(());
        }
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => {
                return Err(BerthError::InvalidTransition {
                    from: self.phase.to_string(),
                    to: Phase::Healthy.to_string(),
                })
            }
        };

        let containers = &self.config.containers;
        let result = self
            .health_gate(&runtime)
            .wait(containers.health_timeout(), containers.health_interval());
        self.track(result)?;
        self.phase.advance(Phase::Healthy)?;
        self.save_record(&runtime);
        Ok(())
    }

    fn save_record(&self, runtime: &ContainerRuntime) {
        let Some(session) = &self.session else {
            return;
        };
        if session.reused {
            return;
        }
        let record = SessionRecord {
            project_name: session.project_name.clone(),
            runtime: runtime.name.clone(),
            ports: session.ports.clone(),
            containers: session.containers.clone(),
            compose_file: session.compose_file.clone(),
            started_at: Local::now(),
        };
        if let Err(e) = record.save(&self.config.containers.state_dir) {
            tracing::warn!(error = %e, "could not save session record");
        }
    }

    /// Run the external test suite with the service endpoints in its environment
    pub fn run_tests(&mut self) -> Result<TestOutcome> {
        self.shutdown.check()?;
        self.phase.advance(Phase::TestsRunning)?;

        let mut spec = CommandSpec::from_argv(&self.config.tests.command)?
            .envs(self.test_env())
            .interruptible();
        if let Some(secs) = self.config.tests.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }

        tracing::info!(command = %spec.display(), "running tests");
        let result = self.runner.run(&spec);
        let output = self.track(result)?;

        let outcome = TestOutcome {
            passed: output.success(),
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
        };
        if outcome.passed {
            tracing::info!("tests passed");
        } else {
            tracing::warn!(
                code = ?outcome.exit_code,
                timed_out = outcome.timed_out,
                "tests failed"
            );
        }
        Ok(outcome)
    }

    /// Remove what this session started. Never fails and may be called repeatedly;
    /// containers that are already gone are skipped.
    pub fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            if session.reused {
                tracing::debug!("environment was reused, leaving it running");
            } else if !session.is_empty() {
                tracing::info!(project = %session.project_name, "cleaning up containers");
                self.remove_session(&session);
                if let Err(e) =
                    SessionRecord::remove(&self.config.containers.state_dir, &session.project_name)
                {
                    tracing::warn!(error = %e, "could not remove session record");
                }
            }
        }
        self.ports.clear();
        self.phase = Phase::CleanedUp;
    }

    fn remove_session(&self, session: &OrchestrationSession) {
        let runtime = &session.runtime;
        let project = session.project_name.as_str();

        if let Some(file) = &session.compose_file {
            let file = file.display().to_string();
            let down_args = ["-f", file.as_str(), "-p", project, "down", "-v"];
            if let Some(down) = runtime.compose_command(down_args) {
                if self.run_quietly(down) {
                    return;
                }
                tracing::warn!("compose down failed, removing containers directly");
            }
        }

        for container in &session.containers {
            self.run_quietly(runtime.command(["stop", container.as_str()]));
            if !self.run_quietly(runtime.command(["rm", container.as_str()])) {
                tracing::debug!(container = %container, "already removed");
            }
        }
        if session.pod_created {
            self.run_quietly(runtime.command(["pod", "rm", "-f", project]));
        }
    }

    /// Stop and remove every configured container and the pod or compose
    /// project, whether or not this process started them
    pub fn teardown(&mut self) -> Result<()> {
        let runtime = self.detect_runtime()?;
        let path = self.start_path(&runtime)?;
        let project = self.project_name();
        let state_dir = self.config.containers.state_dir.clone();

        let compose_file: Option<PathBuf> = match &self.config.containers.compose_file {
            Some(file) => Some(file.clone()),
            None => Some(manifest_path(&state_dir, &project)).filter(|p| p.exists()),
        };

        let mut session = OrchestrationSession::new(runtime, BTreeMap::new(), &project);
        session.compose_file = compose_file.filter(|_| path == StartPath::Compose);
        session.containers = self
            .config
            .containers
            .services
            .iter()
            .map(|s| s.container_name.clone())
            .collect();
        session.pod_created = path == StartPath::Pod;

        tracing::info!(project = %project, "tearing down environment");
        self.remove_session(&session);
        // Compose down may have been skipped or failed; make sure names are free
        if session.compose_file.is_some() {
            for container in &session.containers {
                self.run_quietly(session.runtime.command(["rm", "-f", container.as_str()]));
            }
        }

        SessionRecord::remove(&state_dir, &project)?;
        self.session = None;
        self.ports.clear();
        self.phase = Phase::CleanedUp;
        Ok(())
    }

    /// Start, wait healthy, and clean up on any failure. A healthy environment
    /// is left running.
    pub fn start_environment(&mut self) -> Result<StartOutcome> {
        let result = self
            .start_containers()
            .and_then(|outcome| self.wait_for_healthy().map(|_| outcome));
        if result.is_err() {
            self.cleanup();
        }
        result
    }

    /// detect → allocate → start → health → tests, always followed by cleanup
    pub fn run_full_cycle(&mut self) -> Result<TestOutcome> {
        let mut guard = CleanupGuard::new(self);
        guard.detect_runtime()?;
        guard.start_containers()?;
        guard.wait_for_healthy()?;
        let outcome = guard.run_tests()?;
        Ok(outcome)
    }
}

/// Runs `cleanup` when dropped, including while unwinding
pub struct CleanupGuard<'a> {
    orchestrator: &'a mut ContainerOrchestrator,
}

impl<'a> CleanupGuard<'a> {
    pub fn new(orchestrator: &'a mut ContainerOrchestrator) -> Self {
        Self { orchestrator }
    }
}

impl Deref for CleanupGuard<'_> {
    type Target = ContainerOrchestrator;

    fn deref(&self) -> &Self::Target {
        self.orchestrator
    }
}

impl DerefMut for CleanupGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.orchestrator
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.cleanup();
    }
}
