//! Aggregate health report.

use serde::Serialize;

use crate::health::state::{HealthRecord, HealthStatus};

/// Overall grade derived from the share of unhealthy services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compliance {
    /// At most 5% of services degraded.
    Excellent,
    /// At most 20% of services degraded.
    Good,
    NeedsImprovement,
}

impl Compliance {
    pub fn from_rate(degradation_rate: f64) -> Self {
        if degradation_rate <= 0.05 {
            Compliance::Excellent
        } else if degradation_rate <= 0.20 {
            Compliance::Good
        } else {
            Compliance::NeedsImprovement
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Services with an active degradation strategy.
    pub degraded: usize,
    /// Unhealthy share of monitored services, 0.0 when none are monitored.
    pub degradation_rate: f64,
    pub compliance: Compliance,
    pub services: Vec<HealthRecord>,
}

impl HealthReport {
    pub fn from_records(services: Vec<HealthRecord>, degraded: usize) -> Self {
        let count = |status| services.iter().filter(|r| r.status == status).count();
        let healthy = count(HealthStatus::Healthy);
        let unhealthy = count(HealthStatus::Unhealthy);
        let unknown = count(HealthStatus::Unknown);
        let total = services.len();

        let degradation_rate = if total == 0 {
            0.0
        } else {
            unhealthy as f64 / total as f64
        };

        Self {
            total,
            healthy,
            unhealthy,
            unknown,
            degraded,
            degradation_rate,
            compliance: Compliance::from_rate(degradation_rate),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: HealthStatus) -> HealthRecord {
        HealthRecord {
            status,
            ..HealthRecord::new(name)
        }
    }

    #[test]
    fn test_compliance_thresholds() {
        assert_eq!(Compliance::from_rate(0.0), Compliance::Excellent);
        assert_eq!(Compliance::from_rate(0.05), Compliance::Excellent);
        assert_eq!(Compliance::from_rate(0.2), Compliance::Good);
        assert_eq!(Compliance::from_rate(0.21), Compliance::NeedsImprovement);
    }

    #[test]
    fn test_report_from_records() {
        let records = vec![
            record("a", HealthStatus::Healthy),
            record("b", HealthStatus::Healthy),
            record("c", HealthStatus::Healthy),
            record("d", HealthStatus::Unhealthy),
            record("e", HealthStatus::Unknown),
        ];
        let report = HealthReport::from_records(records, 1);
        assert_eq!((report.healthy, report.unhealthy, report.unknown), (3, 1, 1));
        assert!((report.degradation_rate - 0.2).abs() < f64::EPSILON);
        assert_eq!(report.compliance, Compliance::Good);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["compliance"], "GOOD");
        assert_eq!(json["services"][3]["status"], "unhealthy");
    }

    #[test]
    fn test_empty_report_is_excellent() {
        let report = HealthReport::from_records(Vec::new(), 0);
        assert_eq!(report.compliance, Compliance::Excellent);
    }
}
