//! Traffic control subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming unit of work:
//!     → rate_limit.rs (whitelist, blacklist, sliding windows per scope)
//!     → store.rs (atomic counters shared across instances)
//!     → Pass to the circuit breaker
//! ```
//!
//! # Design Decisions
//! - Denied requests consume no capacity
//! - Repeat offenders escalate to a temporary blacklist
//! - Fail open: a store outage never takes traffic down with it

pub mod rate_limit;
pub mod store;

pub use rate_limit::{RateDecision, RateLimitInfo, RateLimitStats, RateLimiter, ScopeKey};
pub use store::{CounterStore, MemoryCounterStore, StoreError};
