//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Guarded call to an upstream service:
//!     → circuit_breaker.rs (fail fast when open, bound the call with a deadline)
//!     → retries.rs (retry idempotent work with per-kind backoff)
//!     → timeouts.rs (optional per-attempt deadline)
//!     → On rejection: degradation.rs (serve the registered fallback)
//! ```
//!
//! # Design Decisions
//! - Per-service breakers; one service failing never blocks another
//! - Retries only for work the caller flags idempotent
//! - Every failure mode is a distinct typed error (error.rs)

pub mod backoff;
pub mod circuit_breaker;
pub mod degradation;
pub mod error;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState, ServiceBreaker};
pub use degradation::DegradationRegistry;
pub use error::{BreakerError, Classify, ErrorKind, RetryError, UpstreamError};
pub use retries::{RetryEngine, RetryPolicies};
