// Port provisioning: probing, sequential search, block pre-flight checks,
// owner attribution, and the persistent assignment registry

pub mod attribution;
pub mod block;
pub mod env;
pub mod finder;
pub mod probe;
pub mod registry;

/// Highest valid TCP port, as u32 so range arithmetic cannot overflow
pub const MAX_PORT: u32 = 65535;

pub use attribution::{ProcessAttributor, ProcessOwner, UNKNOWN_PROCESS};
pub use block::{PortBlockCheckResult, PortBlockChecker, PortInfo};
pub use env::port_env_var;
pub use finder::{find_sequential_ports, SequentialPortFinder};
pub use probe::{is_available, probe, ProbeOutcome};
pub use registry::{PortAssignment, PortAssignmentRegistry};
