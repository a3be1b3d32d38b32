use std::time::SystemTime;
use serde::{Serialize, Deserialize};
use crate::query::cache::CacheStats;

/// Database statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub uptime_secs: u64,
    pub start_time: SystemTime,

    // Storage traffic through the serializer
    pub query_count: u64,
    pub write_count: u64,

    // Search
    pub search_count: u64,
    pub parse_failures: u64,
    pub cache_stats: CacheStats,

    pub change_log_bytes: u64,
    pub lost_notifications: u64, // Committed writes the change log missed
}

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthCheckResult {
    /// Overall status is the worst of the individual checks.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| &c.status)
            .find(|s| matches!(s, HealthStatus::Unhealthy(_)))
            .or_else(|| checks.iter().map(|c| &c.status).find(|s| !s.is_healthy()))
            .cloned()
            .unwrap_or(HealthStatus::Healthy);

        HealthCheckResult {
            status,
            checks,
            timestamp: SystemTime::now(),
        }
    }
}
