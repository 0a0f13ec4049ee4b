// Durable service -> port assignments
//
// Ports are handed out from a monotonic cursor and never reused while the
// registry lives: releasing a service does not rewind the cursor, so a stale
// process still bound to the old port cannot collide with a new assignment.
//
// The in-process Mutex serialises callers sharing one registry. Every mutation
// also holds an advisory lock on `<file>.lock` and re-reads the file first, so
// separate processes sharing the file see each other's writes.

use super::env::port_env_var;
use super::MAX_PORT;
use crate::errors::{BerthError, Result};
use chrono::{DateTime, Local};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Default location of the assignment file, relative to the working directory
pub const DEFAULT_REGISTRY_PATH: &str = "config/port_assignments.json";

/// Default first port handed out
pub const DEFAULT_BASE_PORT: u16 = 4000;

/// One service's port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Key in the assignments map; not repeated inside the record on disk
    #[serde(skip)]
    pub service_name: String,
    pub port: u16,
    #[serde(default)]
    pub purpose: String,
    #[serde(with = "timestamp")]
    pub assigned_at: DateTime<Local>,
}

/// On-disk format
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    base_port: u16,
    next_port: u32,
    #[serde(default)]
    assignments: BTreeMap<String, PortAssignment>,
}

#[derive(Debug, Clone)]
struct RegistryState {
    next_port: u32,
    assignments: BTreeMap<String, PortAssignment>,
}

impl RegistryState {
    fn empty(base_port: u16) -> Self {
        Self {
            next_port: u32::from(base_port),
            assignments: BTreeMap::new(),
        }
    }

    /// Restore the cursor invariants after loading: never below the base and
    /// always past every assigned port
    fn normalize(&mut self, base_port: u16) {
        for (name, assignment) in self.assignments.iter_mut() {
            assignment.service_name = name.clone();
        }
        let past_assigned = self
            .assignments
            .values()
            .map(|a| u32::from(a.port) + 1)
            .max()
            .unwrap_or(0);
        self.next_port = self
            .next_port
            .max(u32::from(base_port))
            .max(past_assigned);
    }
}

/// Holds the cross-process advisory lock until dropped
struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Named port assignments persisted as JSON
pub struct PortAssignmentRegistry {
    path: PathBuf,
    base_port: u16,
    state: Mutex<RegistryState>,
}

impl PortAssignmentRegistry {
    /// Load the registry at `path`, or start empty if the file is missing or unreadable
    pub fn open(path: &Path, base_port: u16) -> Result<Self> {
        let state = load_state(path, base_port).unwrap_or_else(|| RegistryState::empty(base_port));
        tracing::debug!(
            path = %path.display(),
            base_port,
            next_port = state.next_port,
            assignments = state.assignments.len(),
            "opened port registry"
        );

        Ok(Self {
            path: path.to_path_buf(),
            base_port,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// The port the next new service would receive
    pub fn next_port(&self) -> u32 {
        self.lock_state().next_port
    }

    /// Assign a port to `service_name`, or return its existing port
    pub fn assign(&self, service_name: &str, purpose: &str) -> Result<u16> {
        if service_name.trim().is_empty() {
            return Err(BerthError::Validation(
                "service name must not be empty".to_string(),
            ));
        }

        self.mutate(|state| {
            if let Some(existing) = state.assignments.get(service_name) {
                return Ok((existing.port, false));
            }

            if state.next_port > MAX_PORT {
                return Err(BerthError::PortAllocation(format!(
                    "Port registry exhausted: cannot assign '{}' past port {}",
                    service_name, MAX_PORT
                )));
            }

            let port = state.next_port as u16;
            state.assignments.insert(
                service_name.to_string(),
                PortAssignment {
                    service_name: service_name.to_string(),
                    port,
                    purpose: purpose.to_string(),
                    assigned_at: Local::now(),
                },
            );
            state.next_port += 1;
            tracing::info!(service = service_name, port, "assigned port");
            Ok((port, true))
        })
    }

    pub fn get(&self, service_name: &str) -> Option<u16> {
        self.lock_state()
            .assignments
            .get(service_name)
            .map(|a| a.port)
    }

    /// Drop a service's assignment. The cursor is not rewound.
    pub fn release(&self, service_name: &str) -> Result<bool> {
        self.mutate(|state| {
            let removed = state.assignments.remove(service_name).is_some();
            if removed {
                tracing::info!(service = service_name, "released port");
            }
            Ok((removed, removed))
        })
    }

    /// Clear everything and rewind the cursor to the base port
    pub fn reset(&self) -> Result<()> {
        let base_port = self.base_port;
        self.mutate(|state| {
            *state = RegistryState::empty(base_port);
            tracing::info!(base_port, "reset port registry");
            Ok(((), true))
        })
    }

    /// Snapshot of every assignment, ordered by service name
    pub fn assignments(&self) -> Vec<PortAssignment> {
        self.lock_state().assignments.values().cloned().collect()
    }

    pub fn service_ports(&self) -> BTreeMap<String, u16> {
        self.lock_state()
            .assignments
            .iter()
            .map(|(name, a)| (name.clone(), a.port))
            .collect()
    }

    /// `BASE_PORT`, `NEXT_PORT`, and one `<SERVICE>_PORT` per assignment
    pub fn export_env_vars(&self) -> BTreeMap<String, String> {
        let state = self.lock_state();
        let mut vars = BTreeMap::new();
        vars.insert("BASE_PORT".to_string(), self.base_port.to_string());
        vars.insert("NEXT_PORT".to_string(), state.next_port.to_string());
        for (name, assignment) in &state.assignments {
            vars.insert(port_env_var(name), assignment.port.to_string());
        }
        vars
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        // A panic mid-mutation leaves the last consistent state behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read-modify-write under both locks. `f` returns the value plus whether
    /// the state changed and must be written back. Memory only sees the
    /// change once it is on disk.
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryState) -> Result<(T, bool)>,
    {
        let mut state = self.lock_state();
        let _file_lock = self.acquire_file_lock()?;

        if let Some(on_disk) = load_state(&self.path, self.base_port) {
            *state = on_disk;
        }

        let mut next = state.clone();
        let (value, dirty) = f(&mut next)?;
        if dirty {
            self.write(&next)?;
        }
        *state = next;
        Ok(value)
    }

    fn lock_path(&self) -> PathBuf {
        let mut lock = self.path.clone().into_os_string();
        lock.push(".lock");
        PathBuf::from(lock)
    }

    fn acquire_file_lock(&self) -> Result<FileLock> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        file.lock_exclusive().map_err(|e| {
            BerthError::Registry(format!(
                "Failed to lock {}: {}",
                self.lock_path().display(),
                e
            ))
        })?;
        Ok(FileLock { file })
    }

    /// Write to a sibling temp file, then rename over the real one
    fn write(&self, state: &RegistryState) -> Result<()> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let file = RegistryFile {
            base_port: self.base_port,
            next_port: state.next_port,
            assignments: state.assignments.clone(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            BerthError::Registry(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// `None` when the file is missing or cannot be parsed
fn load_state(path: &Path, base_port: u16) -> Option<RegistryState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "cannot read port registry, starting empty"
            );
            return None;
        }
    };

    match serde_json::from_str::<RegistryFile>(&content) {
        Ok(file) => {
            let mut state = RegistryState {
                next_port: file.next_port,
                assignments: file.assignments,
            };
            state.normalize(base_port);
            Some(state)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "corrupt port registry, starting empty"
            );
            None
        }
    }
}

/// ISO-8601 timestamps. Accepts RFC 3339 and offset-less local times.
mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Local>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Local));
        }
        let naive = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| de::Error::custom(format!("nonexistent local time '{}'", raw)))
    }
}
