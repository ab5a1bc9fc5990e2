use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{
        bus::MessageBus, circuit_breaker::CircuitBreakerRegistry, database::PostgresAuditSink,
        store::StatusStore,
    },
    models::health::{ComponentHealth, HealthReport, HealthStatus},
};

const STATUS_STORE: &str = "status_store";
const MESSAGE_BUS: &str = "message_bus";
const AUDIT_DATABASE: &str = "audit_database";

pub struct HealthChecker {
    store: Arc<dyn StatusStore>,
    bus: Arc<dyn MessageBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    database: Option<Arc<PostgresAuditSink>>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        bus: Arc<dyn MessageBus>,
        breakers: Arc<CircuitBreakerRegistry>,
        database: Option<Arc<PostgresAuditSink>>,
    ) -> Self {
        Self {
            store,
            bus,
            breakers,
            database,
        }
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        components.insert(STATUS_STORE.to_string(), self.check_store().await);
        components.insert(MESSAGE_BUS.to_string(), self.check_bus());

        if let Some(database) = &self.database {
            let start = Instant::now();
            let health = match database.health_check().await {
                Ok(()) => ComponentHealth::up(start.elapsed().as_millis() as u64),
                Err(e) => {
                    warn!(error = %e, "Audit database health check failed");
                    ComponentHealth::down(e.to_string())
                }
            };
            components.insert(AUDIT_DATABASE.to_string(), health);
        }

        for stats in self.breakers.all_stats() {
            debug!(
                breaker = %stats.name,
                circuit_state = stats.state.as_str(),
                "Circuit breaker state checked"
            );
            components.insert(stats.name, ComponentHealth::breaker(stats.state));
        }

        HealthReport {
            status: overall_status(&components),
            timestamp: Utc::now(),
            components,
        }
    }

    async fn check_store(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.store.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Status store health check passed");
                ComponentHealth::up(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Status store health check failed");
                ComponentHealth::down(e.to_string())
            }
        }
    }

    fn check_bus(&self) -> ComponentHealth {
        if self.bus.is_connected() {
            ComponentHealth::up(0)
        } else {
            warn!("Message bus is disconnected");
            ComponentHealth::down("connection closed")
        }
    }
}

/// The store and bus are critical. Anything else only degrades the service.
fn overall_status(components: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    let critical_unhealthy = components
        .iter()
        .filter(|(name, _)| name.as_str() == STATUS_STORE || name.as_str() == MESSAGE_BUS)
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    let any_impaired = components
        .values()
        .any(|health| health.status != HealthStatus::Healthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if any_impaired {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
