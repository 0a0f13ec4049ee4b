// Pre-flight validation of one specific port block
// Unlike the finder this never searches for alternatives

use super::attribution::ProcessAttributor;
use super::probe::{probe, ProbeOutcome};
use super::MAX_PORT;
use serde::Serialize;

/// One probed port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port: u16,
    pub available: bool,
    pub process_info: Option<String>,
}

/// Outcome of checking `[start, end]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBlockCheckResult {
    pub available: bool,
    /// Inclusive; may fall outside the valid port space for invalid requests
    pub requested_range: (i32, i32),
    pub busy_ports: Vec<PortInfo>,
    pub error_message: Option<String>,
    /// At least one busy port failed with "address in use" rather than some
    /// other bind error
    pub confirmed_conflict: bool,
}

impl PortBlockCheckResult {
    fn invalid(range: (i32, i32), message: String) -> Self {
        Self {
            available: false,
            requested_range: range,
            busy_ports: Vec::new(),
            error_message: Some(message),
            confirmed_conflict: false,
        }
    }

    /// False when the request itself was rejected (bad count or range)
    pub fn is_valid_range(&self) -> bool {
        self.available || !self.busy_ports.is_empty()
    }

    pub fn ports(&self) -> Vec<u16> {
        let (start, end) = self.requested_range;
        (start..=end).map(|p| p as u16).collect()
    }
}

/// Checks candidate blocks and explains any conflicts
pub struct PortBlockChecker {
    host: String,
    attributor: ProcessAttributor,
}

impl PortBlockChecker {
    pub fn new(host: &str, attributor: ProcessAttributor) -> Self {
        Self {
            host: host.to_string(),
            attributor,
        }
    }

    pub fn check(&self, base: u16, count: i32) -> PortBlockCheckResult {
        self.check_with(base, count, |port| probe(port, &self.host))
    }

    /// Check using a caller-supplied probe
    pub fn check_with<F>(&self, base: u16, count: i32, mut probe_port: F) -> PortBlockCheckResult
    where
        F: FnMut(u16) -> ProbeOutcome,
    {
        let start = i32::from(base);
        // Widened so huge counts cannot wrap back into the valid range
        let wide_end = i64::from(start) + i64::from(count) - 1;
        let end = wide_end.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;

        if count < 1 {
            return PortBlockCheckResult::invalid(
                (start, end),
                format!("Count must be at least 1 (got {})", count),
            );
        }
        if wide_end > i64::from(MAX_PORT) {
            return PortBlockCheckResult::invalid(
                (start, end),
                format!(
                    "Port range {}-{} exceeds maximum port number {}",
                    start, wide_end, MAX_PORT
                ),
            );
        }

        let mut busy_ports = Vec::new();
        let mut confirmed_conflict = false;

        for port in start..=end {
            let port = port as u16;
            let outcome = probe_port(port);
            if outcome.is_free() {
                continue;
            }
            if outcome == ProbeOutcome::InUse {
                confirmed_conflict = true;
            }
            busy_ports.push(PortInfo {
                port,
                available: false,
                process_info: Some(self.attributor.describe(port)),
            });
        }

        let available = busy_ports.is_empty();
        let error_message = if available {
            None
        } else {
            Some(describe_conflicts(start, end, &busy_ports))
        };

        PortBlockCheckResult {
            available,
            requested_range: (start, end),
            busy_ports,
            error_message,
            confirmed_conflict,
        }
    }
}

/// "Port 8090 already in use (...)" for one port,
/// "Ports 8090-8092: 8091 already in use (...), ..." otherwise
fn describe_conflicts(start: i32, end: i32, busy: &[PortInfo]) -> String {
    let details: Vec<String> = busy
        .iter()
        .map(|info| match &info.process_info {
            Some(process) => format!("{} already in use ({})", info.port, process),
            None => format!("{} already in use", info.port),
        })
        .collect();

    if start == end {
        format!("Port {}", details.join(", "))
    } else {
        format!("Ports {}-{}: {}", start, end, details.join(", "))
    }
}
