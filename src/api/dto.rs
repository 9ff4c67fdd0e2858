//! Response bodies for the HTTP endpoints

use serde::Serialize;

use crate::hub::HubStats;

/// Full health status
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" while the hub accepts connections, "shutting_down" after
    pub status: String,
    /// Hub counters
    pub hub: HubStats,
    pub uptime_seconds: u64,
    pub version: String,
}
