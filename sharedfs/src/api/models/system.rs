//! Capacity discovery models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Answer to `/discover`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DiscoverResponse {
    pub name: String,
    pub success: bool,
    /// Free bytes on the storage volume, absent when the probe failed
    pub disk_free: Option<u64>,
    /// Reason for the failure, only present when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}
