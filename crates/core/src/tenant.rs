use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A clinic registered in the directory, with its own isolated database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub domain: String,
    /// Opaque descriptor used to open the tenant's isolated database.
    #[serde(skip_serializing)]
    pub connection: String,
    pub enabled: bool,
    pub locales: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub provisioning_state: ProvisioningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_error: Option<String>,
}

impl Tenant {
    /// Returns `true` when the tenant may be resolved for live traffic.
    pub fn is_live(&self) -> bool {
        self.enabled && self.provisioning_state.is_complete()
    }

    /// Builds an absolute `https` URL on the tenant's own domain.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("https://{}/{}", self.domain, path)
    }
}

/// Steps of the provisioning state machine persisted alongside the tenant.
///
/// The directory record, the isolated schema and the founding administrator
/// live in different databases, so a crash between steps leaves the tenant in
/// one of the intermediate states below and provisioning can be resumed from
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    DirectoryCreated,
    SchemaReady,
    AdminBootstrapped,
    NotificationSent,
}

impl ProvisioningState {
    /// Returns the canonical database representation for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectoryCreated => "directory_created",
            Self::SchemaReady => "schema_ready",
            Self::AdminBootstrapped => "admin_bootstrapped",
            Self::NotificationSent => "notification_sent",
        }
    }

    pub fn is_complete(self) -> bool {
        matches!(self, Self::NotificationSent)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provisioning state: {0}")]
pub struct UnknownProvisioningState(pub String);

impl FromStr for ProvisioningState {
    type Err = UnknownProvisioningState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "directory_created" => Ok(Self::DirectoryCreated),
            "schema_ready" => Ok(Self::SchemaReady),
            "admin_bootstrapped" => Ok(Self::AdminBootstrapped),
            "notification_sent" => Ok(Self::NotificationSent),
            other => Err(UnknownProvisioningState(other.to_string())),
        }
    }
}
