//! Active health monitoring.
//!
//! # Responsibilities
//! - Periodically probe every registered service
//! - Fold results into each service's [`HealthRecord`]
//! - React to transitions: unhealthy forces the breaker open and activates
//!   degradation; healthy deactivates degradation only
//!
//! The monitor is the only component that drives breaker state outside of
//! call outcomes. Recovery is left to the breaker's own half-open probing.

use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::probe::{HealthProbe, ProbeError};
use crate::health::report::HealthReport;
use crate::health::state::{HealthRecord, HealthStatus};
use crate::observability::events::{EventBus, ResilienceEvent};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::resilience::degradation::DegradationRegistry;
use crate::resilience::timeouts::with_timeout;

struct Monitored {
    probe: Arc<dyn HealthProbe>,
    record: HealthRecord,
}

pub struct HealthMonitor {
    config: HealthCheckConfig,
    services: DashMap<String, Monitored>,
    breakers: Arc<CircuitBreakerRegistry>,
    degradation: Arc<DegradationRegistry>,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        degradation: Arc<DegradationRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            services: DashMap::new(),
            breakers,
            degradation,
            events,
        }
    }

    /// Add (or replace the probe of) a service. Its record starts Unknown.
    pub fn register(&self, service: &str, probe: Arc<dyn HealthProbe>) {
        self.services.insert(
            service.to_string(),
            Monitored {
                probe,
                record: HealthRecord::new(service),
            },
        );
        metrics::record_service_health(service, HealthStatus::Unknown);
    }

    pub fn unregister(&self, service: &str) -> bool {
        self.services.remove(service).is_some()
    }

    pub fn record(&self, service: &str) -> Option<HealthRecord> {
        self.services.get(service).map(|m| m.record.snapshot())
    }

    pub fn records(&self) -> Vec<HealthRecord> {
        let mut all: Vec<_> = self.services.iter().map(|m| m.record.snapshot()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn report(&self) -> HealthReport {
        HealthReport::from_records(self.records(), self.degradation.active_count())
    }

    /// Probe every service once, concurrently.
    pub async fn check_all(&self) {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .services
            .iter()
            .map(|m| (m.key().clone(), m.probe.clone()))
            .collect();

        join_all(
            probes
                .into_iter()
                .map(|(service, probe)| async move { self.check(&service, probe.as_ref()).await }),
        )
        .await;
    }

    /// Probe one service now. Returns false when it is not registered.
    pub async fn check_service(&self, service: &str) -> bool {
        let Some(probe) = self.services.get(service).map(|m| m.probe.clone()) else {
            return false;
        };
        self.check(service, probe.as_ref()).await;
        true
    }

    async fn check(&self, service: &str, probe: &dyn HealthProbe) {
        let started = Instant::now();
        let outcome = match with_timeout::<_, _, ProbeError>(self.config.timeout(), probe.probe()).await {
            Ok(result) if result.ok => Ok(result.latency),
            Ok(result) => Err(format!("unhealthy response after {:?}", result.latency)),
            Err(e) => Err(e.to_string()),
        };
        if let Err(error) = &outcome {
            tracing::warn!(
                service = %service,
                error = %error,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Health check failed"
            );
        }

        let transition = {
            let Some(mut monitored) = self.services.get_mut(service) else {
                return;
            };
            monitored.record.observe(
                outcome,
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            )
        };

        if let Some((from, to)) = transition {
            self.on_transition(service, from, to);
        }
    }

    fn on_transition(&self, service: &str, from: HealthStatus, to: HealthStatus) {
        metrics::record_service_health(service, to);
        self.events.publish(ResilienceEvent::HealthChanged {
            service: service.to_string(),
            from,
            to,
        });

        match to {
            HealthStatus::Unhealthy => {
                tracing::warn!(service = %service, from = %from, "Service became unhealthy");
                self.breakers.force_open(service, self.config.force_open());
                self.degradation.activate(service);
            }
            HealthStatus::Healthy => {
                tracing::info!(service = %service, from = %from, "Service became healthy");
                self.degradation.deactivate(service);
            }
            HealthStatus::Unknown => {}
        }
    }

    /// Probe on every interval tick until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.interval_ms,
            services = self.services.len(),
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
