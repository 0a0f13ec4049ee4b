// Command implementations behind the `berth` binary

pub mod containers;
pub mod ports;

use crate::config::Config;
use crate::errors::Result;
use crate::ports::PortAssignmentRegistry;

/// Registry at the configured path and base port
pub(crate) fn open_registry(config: &Config) -> Result<PortAssignmentRegistry> {
    PortAssignmentRegistry::open(&config.registry.path, config.registry.base_port)
}
