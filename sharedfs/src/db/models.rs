//! Database record structures.

use serde::{Deserialize, Serialize};

/// A provisioned service and the OS account that backs it.
///
/// `username`, `uid` and `gid` are fixed when the record is created; the
/// reconciler relies on them to rebuild a lost account with the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceRecord {
    pub service_id: String,
    pub plan_id: String,
    /// Opaque size descriptor passed through from the broker
    pub quota: String,
    /// Ten lowercase hex characters
    pub username: String,
    pub uid: String,
    pub gid: String,
}
