// Readiness polling for started containers

use super::services::ServiceSpec;
use crate::clock::{Clock, Deadline};
use crate::errors::{BerthError, Result};
use crate::exec::CommandRunner;
use crate::signals::ShutdownSignal;
use std::time::Duration;

/// Runs every service's health probe until all pass or time runs out
pub struct HealthGate<'a> {
    pub runner: &'a dyn CommandRunner,
    pub clock: &'a dyn Clock,
    pub shutdown: &'a ShutdownSignal,
    /// Engine executable used for `exec`
    pub engine: &'a str,
    pub services: &'a [ServiceSpec],
    pub probe_timeout: Duration,
}

impl HealthGate<'_> {
    /// Container names whose probe does not pass right now
    pub fn pending(&self) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for service in self.services {
            self.shutdown.check()?;
            if !self.is_healthy(service)? {
                pending.push(service.container_name.clone());
            }
        }
        Ok(pending)
    }

    fn is_healthy(&self, service: &ServiceSpec) -> Result<bool> {
        let Some(spec) = service.health_command(self.engine) else {
            return Ok(true);
        };
        let spec = spec.timeout(self.probe_timeout).interruptible();
        match self.runner.run(&spec) {
            Ok(output) => {
                if !output.success() {
                    tracing::debug!(
                        container = %service.container_name,
                        code = ?output.code,
                        timed_out = output.timed_out,
                        "health probe not passing yet"
                    );
                }
                Ok(output.success())
            }
            Err(BerthError::Interrupted) => Err(BerthError::Interrupted),
            Err(e) => {
                tracing::debug!(
                    container = %service.container_name,
                    error = %e,
                    "health probe failed"
                );
                Ok(false)
            }
        }
    }

    /// Poll at a fixed `interval` until every probe passes. Checks first, so a
    /// zero timeout still gets one round of probes.
    pub fn wait(&self, timeout: Duration, interval: Duration) -> Result<()> {
        let deadline = Deadline::after(self.clock, timeout);
        tracing::info!(
            timeout_secs = timeout.as_secs(),
            "waiting for containers to become healthy"
        );

        loop {
            let pending = self.pending()?;
            if pending.is_empty() {
                tracing::info!("all containers healthy");
                return Ok(());
            }

            if deadline.expired(self.clock) {
                return Err(BerthError::HealthTimeout {
                    seconds: timeout.as_secs(),
                    pending,
                });
            }

            tracing::info!(pending = %pending.join(", "), "waiting for containers");
            self.clock.sleep(interval.min(deadline.remaining(self.clock)));
            self.shutdown.check()?;
        }
    }
}
