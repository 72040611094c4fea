use crate::server::{Lifecycle, Server};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub config_version: u64,
    pub dependencies: DependencyStatus,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    server: Arc<Server>,
}

impl HealthChecker {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store = self.check_store().await;
        let started = self.server.lifecycle() == Lifecycle::Started;

        let overall_status = if !started {
            "unavailable"
        } else if store.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            config_version: self.server.active_config().version,
            dependencies: DependencyStatus { store },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let healthy = self.server.store_healthy().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        if healthy {
            ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            }
        } else {
            ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some("Backing store not reachable".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_factory::StoreBucketFactory;
    use crate::clock::ManualClock;
    use crate::persister::MemoryConfigPersister;
    use crate::server::ServerSettings;
    use crate::service_config::ServiceConfig;
    use crate::store::{MemoryConnector, MemoryStore};

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            config_version: 4,
            dependencies: DependencyStatus {
                store: ServiceStatus {
                    status: "healthy".to_string(),
                    response_time_ms: 5,
                    error: None,
                },
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
        assert!(json.contains("\"config_version\":4"));
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = Arc::new(StoreBucketFactory::new(Arc::new(MemoryConnector::new(store)), clock, 1, 0));
        let server = Server::new(
            ServiceConfig::default(),
            Arc::new(MemoryConfigPersister::new()),
            factory,
            ServerSettings::default(),
        );
        let checker = HealthChecker::new(Arc::clone(&server));

        assert_eq!(checker.check_health().await.status, "unavailable");
        server.start().await.unwrap();
        assert!(checker.check_health().await.is_healthy());
        server.stop().await.unwrap();
    }
}
