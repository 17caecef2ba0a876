use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of the condition recording whether a resource is synced.
pub const SYNCED: &str = "Synced";

/// Status shared by every resource synced into Consul.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the resource was last successfully written to Consul.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Why a resource failed to sync.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    ConsulAgentError,
    ConsulPatchError,
    ExternallyManagedConfigError,
    MigrationFailedError,
    KubernetesError,
    InternalError,
}

// === impl Status ===

impl Status {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn synced(&self) -> ConditionStatus {
        self.condition(SYNCED)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Replaces the conditions with a single `Synced` condition.
    pub fn set_synced(
        &mut self,
        status: ConditionStatus,
        reason: Option<Reason>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.conditions = vec![Condition {
            type_: SYNCED.to_string(),
            status,
            last_transition_time: Some(now),
            reason: reason.map(|r| r.to_string()).unwrap_or_default(),
            message: message.into(),
        }];
    }
}

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsulAgentError => "ConsulAgentError",
            Self::ConsulPatchError => "ConsulPatchError",
            Self::ExternallyManagedConfigError => "ExternallyManagedConfigError",
            Self::MigrationFailedError => "MigrationFailedError",
            Self::KubernetesError => "KubernetesError",
            Self::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
