// Compose manifest generation

use super::services::ServiceSpec;
use crate::errors::{BerthError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, PartialEq)]
pub struct ComposeManifest {
    pub services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

/// `postgres_data:/var/lib/...` names a volume; `./init.sql:/...` and absolute
/// paths are bind mounts
fn named_volume(mount: &str) -> Option<&str> {
    let (source, _) = mount.split_once(':')?;
    if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
        None
    } else {
        Some(source)
    }
}

impl ComposeManifest {
    /// Publish each service's allocated host port to its container port
    pub fn build(services: &[ServiceSpec], ports: &BTreeMap<String, u16>) -> Result<Self> {
        let mut manifest = ComposeManifest {
            services: BTreeMap::new(),
            volumes: BTreeMap::new(),
        };

        for service in services {
            let host_port = ports.get(service.port_key()).ok_or_else(|| {
                BerthError::Config(format!(
                    "no port allocated for '{}' (service {})",
                    service.port_key(),
                    service.name
                ))
            })?;

            for mount in &service.volumes {
                if let Some(volume) = named_volume(mount) {
                    manifest.volumes.insert(volume.to_string(), BTreeMap::new());
                }
            }

            let healthcheck = (!service.health.is_empty()).then(|| HealthCheck {
                test: std::iter::once("CMD".to_string())
                    .chain(service.health.iter().cloned())
                    .collect(),
                interval: "10s".to_string(),
                timeout: "5s".to_string(),
                retries: 5,
            });

            manifest.services.insert(
                service.name.clone(),
                ComposeService {
                    image: service.image.clone(),
                    container_name: service.container_name.clone(),
                    environment: service.env.clone(),
                    ports: vec![format!("{}:{}", host_port, service.container_port)],
                    volumes: service.volumes.clone(),
                    healthcheck,
                },
            );
        }

        Ok(manifest)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Write to `<state_dir>/compose.<project>.yml`, replacing any previous manifest
    pub fn write(&self, state_dir: &Path, project: &str) -> Result<PathBuf> {
        fs::create_dir_all(state_dir)?;
        let path = manifest_path(state_dir, project);

        let mut temp = tempfile::NamedTempFile::new_in(state_dir)?;
        temp.write_all(self.to_yaml()?.as_bytes())?;
        temp.persist(&path).map_err(|e| BerthError::Io(e.error))?;

        tracing::debug!(path = %path.display(), "wrote compose manifest");
        Ok(path)
    }
}

pub fn manifest_path(state_dir: &Path, project: &str) -> PathBuf {
    state_dir.join(format!("compose.{}.yml", project))
}
