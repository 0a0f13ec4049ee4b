// Library interface for berth
// Port provisioning and container test environments, shared by the binary and tests

pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod exec;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
pub mod signals;
