//! Data Transfer Objects for API requests and responses

use serde::{Deserialize, Serialize};

/// Body of `/{collection}/stats`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub estimated_record_count: u64,
}

/// Body of `/api/featureflags`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlagsResponse {
    pub experimental_access_control: bool,
    pub is_secondary: bool,
    pub accepts_writes: bool,
}

/// Returned when a rule or policy is created with a server-allocated id
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

/// Body of `/{collection}/truncate_replication`
#[derive(Debug, Serialize)]
pub struct TruncateResponse {
    pub success: bool,
}

/// One element of a bulk access check request
#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    pub url: String,
    pub timestamp: String,
}
