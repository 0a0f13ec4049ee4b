// Per-run session tracking and the on-disk record of a started environment

use crate::errors::{BerthError, Result};
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// What this run created, and therefore what cleanup removes
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    pub runtime: ContainerRuntime,
    /// Containers started by this session, in start order
    pub containers: Vec<String>,
    pub ports: BTreeMap<String, u16>,
    pub project_name: String,
    pub pod_created: bool,
    /// Manifest brought up with compose
    pub compose_file: Option<PathBuf>,
    /// The environment was already running; nothing was started
    pub reused: bool,
}

impl OrchestrationSession {
    pub fn new(
        runtime: ContainerRuntime,
        ports: BTreeMap<String, u16>,
        project_name: &str,
    ) -> Self {
        Self {
            runtime,
            containers: Vec::new(),
            ports,
            project_name: project_name.to_string(),
            pod_created: false,
            compose_file: None,
            reused: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && !self.pod_created && self.compose_file.is_none()
    }
}

/// Saved after a successful start so later invocations can find the ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub project_name: String,
    pub runtime: String,
    pub ports: BTreeMap<String, u16>,
    pub containers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    pub started_at: DateTime<Local>,
}

impl SessionRecord {
    pub fn path(state_dir: &Path, project: &str) -> PathBuf {
        state_dir.join(format!("session.{}.json", project))
    }

    pub fn save(&self, state_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(state_dir)?;
        let path = Self::path(state_dir, &self.project_name);

        let mut temp = tempfile::NamedTempFile::new_in(state_dir)?;
        temp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        temp.persist(&path).map_err(|e| BerthError::Io(e.error))?;
        Ok(path)
    }

    /// `None` when there is no record or it cannot be parsed
    pub fn load(state_dir: &Path, project: &str) -> Option<Self> {
        let path = Self::path(state_dir, project);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring unreadable session record"
                );
                None
            }
        }
    }

    pub fn remove(state_dir: &Path, project: &str) -> Result<()> {
        match fs::remove_file(Self::path(state_dir, project)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
