//! Health check payload
//!
//! The health route is answered by the gateway's path classification before
//! any allow-list or token work happens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// A healthy status stamped with the current time
    pub fn now() -> Self {
        Self {
            status: "Healthy".to_string(),
            checked_at: Utc::now(),
        }
    }
}
