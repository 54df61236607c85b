//! Resilience & traffic-control layer for calls to upstream services.

pub mod admin;
pub mod config;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::GatewayConfig;
pub use gateway::{CallOptions, CallOutcome, Gateway, GatewayError};
pub use lifecycle::Shutdown;
