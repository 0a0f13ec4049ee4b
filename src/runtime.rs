// Container runtime detection
// Finds the first installed OCI engine and how it does multi-container startup

use crate::errors::{BerthError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Supported engines, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Podman,
    Docker,
    Nerdctl,
    Buildah,
}

impl RuntimeKind {
    pub const PRIORITY: [RuntimeKind; 4] = [
        RuntimeKind::Podman,
        RuntimeKind::Docker,
        RuntimeKind::Nerdctl,
        RuntimeKind::Buildah,
    ];

    pub fn binary(self) -> &'static str {
        match self {
            RuntimeKind::Podman => "podman",
            RuntimeKind::Docker => "docker",
            RuntimeKind::Nerdctl => "nerdctl",
            RuntimeKind::Buildah => "buildah",
        }
    }

    /// Standalone compose tools known to drive this engine, most preferred first
    pub fn compose_helpers(self) -> &'static [&'static str] {
        match self {
            RuntimeKind::Podman => &["podman-compose", "docker-compose"],
            RuntimeKind::Docker => &["docker-compose"],
            RuntimeKind::Buildah => &["buildah-compose"],
            RuntimeKind::Nerdctl => &[],
        }
    }

    /// Only podman can group containers into a native pod
    pub fn supports_pods(self) -> bool {
        self == RuntimeKind::Podman
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// How multiple containers get started together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeMechanism {
    /// A separate compose binary, e.g. `podman-compose`
    Helper(String),
    /// `<engine> compose`
    BuiltIn,
    /// No compose available; containers are grouped in a podman pod
    NativePod,
}

/// A detected engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRuntime {
    pub kind: RuntimeKind,
    pub name: String,
    /// Engine executable
    pub command: String,
    pub compose: ComposeMechanism,
    pub available: bool,
    /// First line of `<engine> --version`
    pub version: String,
}

impl ContainerRuntime {
    /// Program and leading args of the compose invocation, `None` for native pods
    pub fn compose_argv(&self) -> Option<Vec<String>> {
        match &self.compose {
            ComposeMechanism::Helper(helper) => Some(vec![helper.clone()]),
            ComposeMechanism::BuiltIn => Some(vec![self.command.clone(), "compose".to_string()]),
            ComposeMechanism::NativePod => None,
        }
    }

    /// Start a compose command with `args` appended
    pub fn compose_command<I, S>(&self, args: I) -> Option<CommandSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = self.compose_argv()?;
        let (program, lead) = argv.split_first()?;
        Some(
            CommandSpec::new(program.clone())
                .args(lead.iter().cloned())
                .args(args),
        )
    }

    pub fn compose_display(&self) -> String {
        match self.compose_argv() {
            Some(argv) => argv.join(" "),
            None => "native pod".to_string(),
        }
    }

    /// `<engine> <args...>`
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.command.clone()).args(args)
    }
}

/// Probes engines through a `CommandRunner`
pub struct RuntimeDetector {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    candidates: Vec<RuntimeKind>,
}

impl RuntimeDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            candidates: RuntimeKind::PRIORITY.to_vec(),
        }
    }

    /// Restrict or reorder the engines considered
    pub fn with_candidates(mut self, candidates: Vec<RuntimeKind>) -> Self {
        self.candidates = candidates;
        self
    }

    /// First available engine in priority order
    pub fn detect(&self) -> Result<ContainerRuntime> {
        for kind in &self.candidates {
            if let Some(runtime) = self.probe(*kind) {
                tracing::info!(
                    runtime = %runtime.name,
                    version = %runtime.version,
                    compose = %runtime.compose_display(),
                    "detected container runtime"
                );
                return Ok(runtime);
            }
        }
        Err(BerthError::NoRuntime)
    }

    /// Describe `kind` if its binary answers `--version`
    pub fn probe(&self, kind: RuntimeKind) -> Option<ContainerRuntime> {
        let binary = kind.binary();
        let output = self.check(CommandSpec::new(binary).arg("--version"))?;
        let version = output.lines().next().unwrap_or_default().trim().to_string();

        Some(ContainerRuntime {
            kind,
            name: binary.to_string(),
            command: binary.to_string(),
            compose: self.compose_mechanism(kind),
            available: true,
            version,
        })
    }

    fn compose_mechanism(&self, kind: RuntimeKind) -> ComposeMechanism {
        for helper in kind.compose_helpers() {
            if self.check(CommandSpec::new(*helper).arg("--version")).is_some() {
                return ComposeMechanism::Helper(helper.to_string());
            }
        }

        let builtin = CommandSpec::new(kind.binary()).args(["compose", "version"]);
        if self.check(builtin).is_some() {
            return ComposeMechanism::BuiltIn;
        }

        if kind.supports_pods() {
            ComposeMechanism::NativePod
        } else {
            tracing::debug!(runtime = %kind, "compose not verified, assuming built-in subcommand");
            ComposeMechanism::BuiltIn
        }
    }

    /// stdout of a successful run; missing binaries and timeouts count as absent
    fn check(&self, spec: CommandSpec) -> Option<String> {
        let spec = spec.timeout(self.timeout);
        match self.runner.run(&spec) {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                tracing::debug!(command = %spec.display(), code = ?output.code, "probe failed");
                None
            }
            Err(e) => {
                tracing::debug!(command = %spec.display(), error = %e, "probe failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::{fail, ok, ScriptedRunner};

    fn detector(runner: ScriptedRunner) -> (RuntimeDetector, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (
            RuntimeDetector::new(runner.clone(), Duration::from_secs(10)),
            runner,
        )
    }

    #[test]
    fn test_podman_preferred_over_docker() {
        let (detector, _) = detector(
            ScriptedRunner::new()
                .on("podman --version", ok("podman version 4.9.3\n"))
                .on("docker --version", ok("Docker version 24.0.7\n"))
                .on("podman-compose --version", ok("podman-compose version 1.0.6\n")),
        );
        let runtime = detector.detect().unwrap();
        assert_eq!(runtime.kind, RuntimeKind::Podman);
        assert_eq!(runtime.version, "podman version 4.9.3");
        assert_eq!(
            runtime.compose,
            ComposeMechanism::Helper("podman-compose".to_string())
        );
        assert_eq!(runtime.compose_argv().unwrap(), vec!["podman-compose"]);
    }

    #[test]
    fn test_podman_without_compose_uses_native_pod() {
        let (detector, runner) = detector(
            ScriptedRunner::new()
                .on("podman --version", ok("podman version 4.9.3"))
                .on("podman compose version", fail(125, "unrecognized command")),
        );
        let runtime = detector.detect().unwrap();
        assert_eq!(runtime.compose, ComposeMechanism::NativePod);
        assert!(runtime.compose_argv().is_none());
        assert_eq!(runtime.compose_display(), "native pod");

        let calls = runner.calls();
        assert!(calls.contains(&"podman-compose --version".to_string()));
        assert!(calls.contains(&"docker-compose --version".to_string()));
        assert!(calls.contains(&"podman compose version".to_string()));
    }

    #[test]
    fn test_docker_builtin_compose() {
        let (detector, _) = detector(
            ScriptedRunner::new()
                .missing("podman")
                .on("docker --version", ok("Docker version 24.0.7, build afdd53b"))
                .on("docker compose version", ok("Docker Compose version v2.23.0")),
        );
        let runtime = detector.detect().unwrap();
        assert_eq!(runtime.kind, RuntimeKind::Docker);
        assert_eq!(runtime.compose, ComposeMechanism::BuiltIn);
        let spec = runtime.compose_command(["-f", "compose.yml", "up"]).unwrap();
        assert_eq!(spec.display(), "docker compose -f compose.yml up");
    }

    #[test]
    fn test_nerdctl_assumes_builtin_compose() {
        let (detector, _) = detector(
            ScriptedRunner::new().on("nerdctl --version", ok("nerdctl version 1.7.0")),
        );
        let runtime = detector.detect().unwrap();
        assert_eq!(runtime.kind, RuntimeKind::Nerdctl);
        assert_eq!(runtime.compose, ComposeMechanism::BuiltIn);
    }

    #[test]
    fn test_failing_version_check_skips_engine() {
        let (detector, _) = detector(
            ScriptedRunner::new()
                .on("podman --version", fail(1, "cannot connect"))
                .on("docker --version", ok("Docker version 24.0.7"))
                .on("docker-compose --version", ok("docker-compose version 1.29.2")),
        );
        let runtime = detector.detect().unwrap();
        assert_eq!(runtime.kind, RuntimeKind::Docker);
        assert_eq!(
            runtime.compose,
            ComposeMechanism::Helper("docker-compose".to_string())
        );
    }

    #[test]
    fn test_no_runtime() {
        let (detector, runner) = detector(ScriptedRunner::new());
        assert!(matches!(detector.detect(), Err(BerthError::NoRuntime)));
        assert_eq!(
            runner.calls(),
            vec![
                "podman --version",
                "docker --version",
                "nerdctl --version",
                "buildah --version"
            ]
        );
    }

    #[test]
    fn test_version_probe_has_timeout() {
        let (detector, runner) =
            detector(ScriptedRunner::new().on("docker --version", ok("Docker version 24")));
        let detector = detector.with_candidates(vec![RuntimeKind::Docker]);
        detector.detect().unwrap();
        assert!(runner
            .specs()
            .iter()
            .all(|s| s.timeout == Some(Duration::from_secs(10))));
    }
}
