//! Per-service health state machine.
//!
//! # States
//! - Unknown: not probed yet
//! - Healthy: last probes succeeded
//! - Unhealthy: last probes failed
//!
//! # State Transitions
//! ```text
//! Unknown/Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! Unknown/Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping; thresholds of 1 give the plain machine
//! - Counters reset on state transition

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Latest known health of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub service: String,
    pub status: HealthStatus,
    #[serde(skip)]
    pub last_checked_at: Option<Instant>,
    pub last_checked_ms_ago: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl HealthRecord {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: HealthStatus::Unknown,
            last_checked_at: None,
            last_checked_ms_ago: None,
            last_latency_ms: None,
            last_error: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Fold one probe outcome into the record.
    ///
    /// Returns `(from, to)` when the status changed.
    pub fn observe(
        &mut self,
        outcome: Result<Duration, String>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<(HealthStatus, HealthStatus)> {
        self.last_checked_at = Some(Instant::now());
        let from = self.status;

        let target = match outcome {
            Ok(latency) => {
                self.last_latency_ms = Some(latency.as_millis() as u64);
                self.last_error = None;
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
                (self.consecutive_successes >= healthy_threshold).then_some(HealthStatus::Healthy)
            }
            Err(error) => {
                self.last_error = Some(error);
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                (self.consecutive_failures >= unhealthy_threshold).then_some(HealthStatus::Unhealthy)
            }
        };

        match target {
            Some(to) if to != from => {
                self.status = to;
                self.consecutive_successes = 0;
                self.consecutive_failures = 0;
                Some((from, to))
            }
            _ => None,
        }
    }

    /// Copy with the relative timestamp filled in, for reporting.
    pub fn snapshot(&self) -> HealthRecord {
        HealthRecord {
            last_checked_ms_ago: self
                .last_checked_at
                .map(|at| at.elapsed().as_millis() as u64),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK: Result<Duration, String> = Ok(Duration::from_millis(12));

    fn fail() -> Result<Duration, String> {
        Err("connection refused".into())
    }

    #[test]
    fn test_plain_transitions_with_unit_thresholds() {
        let mut record = HealthRecord::new("jobs");
        assert_eq!(
            record.observe(OK, 1, 1),
            Some((HealthStatus::Unknown, HealthStatus::Healthy))
        );
        assert_eq!(record.observe(OK, 1, 1), None);
        assert_eq!(
            record.observe(fail(), 1, 1),
            Some((HealthStatus::Healthy, HealthStatus::Unhealthy))
        );
        assert_eq!(record.last_error.as_deref(), Some("connection refused"));
        assert_eq!(
            record.observe(OK, 1, 1),
            Some((HealthStatus::Unhealthy, HealthStatus::Healthy))
        );
        assert_eq!(record.last_latency_ms, Some(12));
    }

    #[test]
    fn test_hysteresis_requires_consecutive_results() {
        let mut record = HealthRecord::new("jobs");
        record.observe(OK, 1, 3);

        assert_eq!(record.observe(fail(), 1, 3), None);
        assert_eq!(record.observe(fail(), 1, 3), None);
        // A success in between restarts the count.
        assert_eq!(record.observe(OK, 1, 3), None);
        assert_eq!(record.observe(fail(), 1, 3), None);
        assert_eq!(record.observe(fail(), 1, 3), None);
        assert_eq!(
            record.observe(fail(), 1, 3),
            Some((HealthStatus::Healthy, HealthStatus::Unhealthy))
        );
        assert_eq!(record.consecutive_failures, 0);
    }
}
