// Sequential port search
// Finds the first window [p, p+count-1] with p >= base where every port probes free

use super::probe::is_available;
use super::MAX_PORT;
use crate::errors::{BerthError, Result};

/// Default number of window start positions tried before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

/// Searches for runs of consecutive free ports
#[derive(Debug, Clone)]
pub struct SequentialPortFinder {
    host: String,
    max_attempts: u32,
}

impl SequentialPortFinder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Find `count` consecutive free ports starting at or after `base`
    pub fn find(&self, base: u16, count: i32) -> Result<Vec<u16>> {
        self.find_with(base, count, |port| is_available(port, &self.host))
    }

    /// Search using a caller-supplied availability check
    pub fn find_with<F>(&self, base: u16, count: i32, mut available: F) -> Result<Vec<u16>>
    where
        F: FnMut(u16) -> bool,
    {
        if count < 1 {
            return Err(BerthError::Validation(format!(
                "count must be at least 1 (got {})",
                count
            )));
        }
        let count = count as u32;
        let mut current = u32::from(base);

        for _ in 0..self.max_attempts {
            if current + count - 1 > MAX_PORT {
                break;
            }

            // Stop at the first busy port; the next window starts one past
            // `current`, not past the busy port, so no viable window is skipped
            let window_free = (current..current + count).all(|port| available(port as u16));
            if window_free {
                return Ok((current..current + count).map(|p| p as u16).collect());
            }

            current += 1;
        }

        Err(BerthError::PortAllocation(format!(
            "Unable to find {} sequential available ports starting from {}",
            count, base
        )))
    }
}

/// Find `count` consecutive free ports at or after `base` on `host`
pub fn find_sequential_ports(base: u16, count: i32, host: &str) -> Result<Vec<u16>> {
    SequentialPortFinder::new(host).find(base, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_zero_and_negative_count() {
        let finder = SequentialPortFinder::new("127.0.0.1");
        assert!(matches!(
            finder.find_with(9000, 0, |_| true),
            Err(BerthError::Validation(_))
        ));
        assert!(matches!(
            finder.find_with(9000, -1, |_| true),
            Err(BerthError::Validation(_))
        ));
    }

    #[test]
    fn test_all_free_returns_base_window() {
        let finder = SequentialPortFinder::new("127.0.0.1");
        let ports = finder.find_with(8090, 3, |_| true).unwrap();
        assert_eq!(ports, vec![8090, 8091, 8092]);
    }

    #[test]
    fn test_internal_busy_port_moves_window_past_it() {
        let busy: HashSet<u16> = [8091].into_iter().collect();
        let finder = SequentialPortFinder::new("127.0.0.1");
        let ports = finder.find_with(8090, 3, |p| !busy.contains(&p)).unwrap();
        assert_eq!(ports, vec![8092, 8093, 8094]);
    }

    #[test]
    fn test_advances_one_start_at_a_time() {
        // Record the order of window starts; each busy hit must advance by exactly one
        let busy: HashSet<u16> = [100, 102].into_iter().collect();
        let mut probed = Vec::new();
        let finder = SequentialPortFinder::new("127.0.0.1");
        let ports = finder
            .find_with(100, 2, |p| {
                probed.push(p);
                !busy.contains(&p)
            })
            .unwrap();
        assert_eq!(ports, vec![103, 104]);
        // window 100: stops at 100; window 101: 101 ok, 102 busy; window 102: stops;
        // window 103: 103, 104
        assert_eq!(probed, vec![100, 101, 102, 102, 103, 104]);
    }

    #[test]
    fn test_window_past_max_port_fails() {
        let finder = SequentialPortFinder::new("127.0.0.1");
        let err = finder.find_with(65534, 4, |_| true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("65534"));
        assert!(msg.contains('4'));
    }

    #[test]
    fn test_attempt_budget_is_bounded() {
        let finder = SequentialPortFinder::new("127.0.0.1").with_max_attempts(5);
        let mut calls = 0;
        let result = finder.find_with(20000, 1, |_| {
            calls += 1;
            false
        });
        assert!(matches!(result, Err(BerthError::PortAllocation(_))));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_window_ending_exactly_at_max_port() {
        let finder = SequentialPortFinder::new("127.0.0.1");
        let ports = finder.find_with(65533, 3, |_| true).unwrap();
        assert_eq!(ports, vec![65533, 65534, 65535]);
    }
}
