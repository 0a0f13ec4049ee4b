// Container service definitions

use crate::exec::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One container the test environment runs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// Compose service key
    pub name: String,
    pub container_name: String,
    pub image: String,
    /// Logical port this container publishes; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_service: Option<String>,
    /// Port the service listens on inside the container
    pub container_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Readiness probe, executed inside the container
    #[serde(default)]
    pub health: Vec<String>,
    /// Extra connection parameters exported to the test runner
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn port_key(&self) -> &str {
        self.port_service.as_deref().unwrap_or(&self.name)
    }

    /// `<engine> exec <container> <health...>`, or None when no probe is configured
    pub fn health_command(&self, engine: &str) -> Option<CommandSpec> {
        if self.health.is_empty() {
            return None;
        }
        Some(
            CommandSpec::new(engine)
                .arg("exec")
                .arg(self.container_name.as_str())
                .args(self.health.iter().cloned()),
        )
    }
}

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// PostgreSQL and MongoDB, the databases the server under test needs
pub fn default_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec {
            name: "postgres".to_string(),
            container_name: "test-postgres".to_string(),
            image: "docker.io/postgres:15".to_string(),
            port_service: None,
            container_port: 5432,
            env: map(&[
                ("POSTGRES_DB", "testdb"),
                ("POSTGRES_USER", "user"),
                ("POSTGRES_PASSWORD", "password"),
                ("POSTGRES_HOST_AUTH_METHOD", "trust"),
            ]),
            volumes: Vec::new(),
            health: vec![
                "pg_isready".to_string(),
                "-U".to_string(),
                "user".to_string(),
                "-d".to_string(),
                "testdb".to_string(),
            ],
            connection: map(&[
                ("POSTGRES_DB", "testdb"),
                ("POSTGRES_USER", "user"),
                ("POSTGRES_PASSWORD", "password"),
            ]),
        },
        ServiceSpec {
            name: "mongo".to_string(),
            container_name: "test-mongo".to_string(),
            image: "docker.io/mongo:7.0".to_string(),
            port_service: None,
            container_port: 27017,
            env: map(&[
                ("MONGO_INITDB_ROOT_USERNAME", "user"),
                ("MONGO_INITDB_ROOT_PASSWORD", "password"),
                ("MONGO_INITDB_DATABASE", "testdb"),
            ]),
            volumes: Vec::new(),
            health: vec![
                "mongosh".to_string(),
                "--eval".to_string(),
                "db.adminCommand('ping')".to_string(),
            ],
            connection: map(&[("MONGO_DB", "testdb")]),
        },
    ]
}
