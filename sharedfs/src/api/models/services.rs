//! Service lifecycle models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::provisioner::{Credentials, Outcome};

/// Answer to `/provision` and `/unprovision`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub name: String,
    pub success: bool,
    /// `OK` on success, otherwise the error message
    pub msg: String,
}

impl StatusResponse {
    pub fn new(name: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            name: name.into(),
            success: outcome.success,
            msg: outcome.message,
        }
    }
}

/// Answer to `/credentials`. `credentials` is `null` unless `success` is true.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialsResponse {
    pub name: String,
    pub success: bool,
    pub msg: String,
    pub credentials: Option<Credentials>,
}

impl CredentialsResponse {
    pub fn new(name: impl Into<String>, outcome: Outcome, credentials: Option<Credentials>) -> Self {
        Self {
            name: name.into(),
            success: outcome.success,
            msg: outcome.message,
            credentials,
        }
    }
}
