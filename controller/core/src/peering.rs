use crate::error::RemoteError;
use serde::{Deserialize, Serialize};

/// A cluster peering as reported by Consul.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peering {
    pub name: String,
    #[serde(default)]
    pub state: String,
}

/// Access to Consul's peering API.
#[async_trait::async_trait]
pub trait PeeringService: Send + Sync {
    /// Returns `None` when no peering with `name` exists.
    async fn read(&self, name: &str, partition: &str) -> Result<Option<Peering>, RemoteError>;

    /// Generates a token that a remote cluster may use to establish a
    /// peering with this one.
    async fn generate_token(&self, name: &str, partition: &str) -> Result<String, RemoteError>;

    /// Establishes a peering using a token generated by the remote cluster.
    async fn establish(&self, name: &str, partition: &str, token: &str) -> Result<(), RemoteError>;

    async fn delete(&self, name: &str, partition: &str) -> Result<(), RemoteError>;
}
