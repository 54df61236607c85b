//! Resilience gateway (v1)
//!
//! Protects upstream services from cascading failure, overload and transient
//! faults.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                 RESILIENCE GATEWAY               │
//!                        │                                                  │
//!   Unit of work         │  ┌────────────┐   ┌─────────────┐   ┌─────────┐  │
//!   ─────────────────────┼─▶│    rate    │──▶│   circuit   │──▶│  retry  │──┼──▶ Upstream
//!                        │  │  limiter   │   │   breaker   │   │ engine  │  │    service
//!                        │  └─────┬──────┘   └──────┬──────┘   └─────────┘  │
//!                        │        │                 │ rejected              │
//!                        │  ┌─────▼──────┐   ┌──────▼──────┐                 │
//!                        │  │  counter   │   │ degradation │                 │
//!                        │  │   store    │   │  registry   │                 │
//!                        │  └────────────┘   └──────▲──────┘                 │
//!                        │                          │                        │
//!                        │                   ┌──────┴──────┐                 │
//!                        │                   │   health    │◀── probes ──────┼──▶ /health
//!                        │                   │   monitor   │                 │
//!                        │                   └─────────────┘                 │
//!                        │                                                  │
//!                        │  admin API · metrics · events · config reload    │
//!                        └──────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "resilience-gateway", version, about)]
struct Args {
    /// TOML configuration file; falls back to $GATEWAY_CONFIG, then defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var_os("GATEWAY_CONFIG").map(PathBuf::from));

    resilience_gateway::lifecycle::startup::run(config_path).await
}
