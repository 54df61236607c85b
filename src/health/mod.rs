//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer (monitor.rs)
//!     → Probe each service (probe.rs)
//!     → Update its record (state.rs)
//!     → On transition: force breaker open / toggle degradation
//!     → Aggregate on demand (report.rs)
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Health state is per-service and process-local
//! - Probes carry their own deadline; a hung probe counts as a failure

pub mod monitor;
pub mod probe;
pub mod report;
pub mod state;

pub use monitor::HealthMonitor;
pub use probe::{FnProbe, HealthProbe, HttpProbe, ProbeError, ProbeResult};
pub use report::{Compliance, HealthReport};
pub use state::{HealthRecord, HealthStatus};
