use crate::errors::{BerthError, Result};
use serde::Serialize;
use std::fmt;

/// Lifecycle position of an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    RuntimeDetected,
    PortsAllocated,
    ContainersStarting,
    Healthy,
    TestsRunning,
    CleanedUp,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::RuntimeDetected => "runtime_detected",
            Phase::PortsAllocated => "ports_allocated",
            Phase::ContainersStarting => "containers_starting",
            Phase::Healthy => "healthy",
            Phase::TestsRunning => "tests_running",
            Phase::CleanedUp => "cleaned_up",
            Phase::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            // Cleanup may run from anywhere, including twice
            (_, CleanedUp) => true,
            (CleanedUp, Idle) => true,
            (CleanedUp, _) => false,
            (_, Failed) => true,
            (Idle, RuntimeDetected) => true,
            (RuntimeDetected, PortsAllocated) => true,
            (PortsAllocated, ContainersStarting) => true,
            // Environment already up
            (PortsAllocated, Healthy) => true,
            (ContainersStarting, Healthy) => true,
            // Containers went away after a health pass; start again
            (Healthy, ContainersStarting) => true,
            (Healthy, TestsRunning) => true,
            (TestsRunning, TestsRunning) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(BerthError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(from = %self, to = %next, "phase");
        *self = next;
        Ok(())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
