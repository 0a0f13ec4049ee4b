use crate::errors::{BerthError, Result};
use crate::orchestrator::services::{default_services, ServiceSpec};
use crate::ports::finder::DEFAULT_MAX_ATTEMPTS;
use crate::ports::registry::{DEFAULT_BASE_PORT, DEFAULT_REGISTRY_PATH};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "berth.yml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub ports: PortsConfig,
    pub registry: RegistryConfig,
    pub containers: ContainersConfig,
    pub tests: TestsConfig,
}

/// What to do when the preferred port block is held by another process
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Report the conflicting processes and stop
    #[default]
    Abort,
    /// Search upward from the preferred base for another free block
    Relocate,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortsConfig {
    pub host: String,
    pub preferred_base: u16,
    /// Logical services that each get one port of the block, in order
    pub services: Vec<String>,
    pub on_conflict: ConflictPolicy,
    pub max_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            preferred_base: 8090,
            services: vec!["app".to_string(), "postgres".to_string(), "mongo".to_string()],
            on_conflict: ConflictPolicy::Abort,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    pub base_port: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            base_port: DEFAULT_BASE_PORT,
        }
    }
}

/// How containers are brought up
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Native pod when the runtime has no compose support, compose otherwise
    #[default]
    Auto,
    Pod,
    Compose,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainersConfig {
    pub project_name: String,
    pub mode: StartMode,
    /// Use this manifest instead of generating one
    pub compose_file: Option<PathBuf>,
    /// Generated manifests and session records
    pub state_dir: PathBuf,
    pub health_timeout_secs: u64,
    pub health_interval_secs: u64,
    /// Timeout for engine version checks and each health probe
    pub probe_timeout_secs: u64,
    pub services: Vec<ServiceSpec>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            project_name: "test-env".to_string(),
            mode: StartMode::Auto,
            compose_file: None,
            state_dir: PathBuf::from(".berth"),
            health_timeout_secs: 120,
            health_interval_secs: 5,
            probe_timeout_secs: 10,
            services: default_services(),
        }
    }
}

impl ContainersConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// argv of the external test runner
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "run_e2e_tests.py".to_string()],
            env: [("SQLITE_PATH".to_string(), "/tmp/test.db".to_string())]
                .into_iter()
                .collect(),
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load config from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_yml::from_str(&content).map_err(|e| {
                BerthError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Config::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `BASE_PORT` overrides the registry's base port
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("BASE_PORT") {
            self.registry.base_port = raw.trim().parse().map_err(|_| {
                BerthError::Config(format!("BASE_PORT must be a port number, got '{}'", raw))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.services.is_empty() {
            return Err(BerthError::Config(
                "ports.services must name at least one service".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &self.ports.services {
            if !seen.insert(name.as_str()) {
                return Err(BerthError::Config(format!(
                    "port service '{}' is listed twice",
                    name
                )));
            }
        }

        let mut containers = HashSet::new();
        for service in &self.containers.services {
            if !containers.insert(service.container_name.as_str()) {
                return Err(BerthError::Config(format!(
                    "container name '{}' is used twice",
                    service.container_name
                )));
            }
            if !seen.contains(service.port_key()) {
                return Err(BerthError::Config(format!(
                    "service '{}' publishes port '{}', which is not in ports.services",
                    service.name,
                    service.port_key()
                )));
            }
        }

        if self.tests.command.is_empty() {
            return Err(BerthError::Config("tests.command must not be empty".to_string()));
        }
        if self.containers.project_name.trim().is_empty() {
            return Err(BerthError::Config(
                "containers.project_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
