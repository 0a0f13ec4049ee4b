use thiserror::Error;

#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Port allocation error: {0}")]
    PortAllocation(String),

    #[error("Port conflict: {message}")]
    PortConflict { message: String, ports: Vec<u16> },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(
        "No compatible container runtime found. Please install Podman, Docker, or another OCI-compatible runtime."
    )]
    NoRuntime,

    #[error("Command `{command}` failed with exit code {}:\n{stderr}{stdout}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Containers failed to become healthy within {seconds}s (waiting on: {})", .pending.join(", "))]
    HealthTimeout { seconds: u64, pending: Vec<String> },

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Interrupted, containers cleaned up")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),
}

impl BerthError {
    /// Process exit code reported by the binary for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BerthError::Validation(_) | BerthError::Config(_) | BerthError::Yaml(_) => 2,
            BerthError::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BerthError>;
