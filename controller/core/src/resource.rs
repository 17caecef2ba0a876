use crate::{error::RemoteError, meta::Meta};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a kind of resource in the Consul resource API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group: &'static str,
    pub group_version: &'static str,
    pub kind: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenancy {
    pub namespace: String,
    pub partition: String,
    pub peer_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub name: String,
    pub ty: ResourceType,
    pub tenancy: Tenancy,
    /// Assigned by Consul; empty for resources that have not been written.
    pub uid: String,
}

/// A resource as stored by the Consul resource API.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub metadata: Meta,
    pub data: serde_json::Value,
    pub version: String,
    pub generation: String,
    pub status: Option<serde_json::Value>,
}

/// Read/write/delete access to the Consul resource API.
#[async_trait::async_trait]
pub trait ResourceService: Send + Sync {
    /// Fails with [`RemoteError::NotFound`] when the resource does not exist
    /// and [`RemoteError::NamespaceNotFound`] when its namespace does not.
    async fn read(&self, id: &ResourceId) -> Result<Resource, RemoteError>;

    async fn write(&self, resource: Resource) -> Result<Resource, RemoteError>;

    /// Deleting an absent resource succeeds.
    async fn delete(&self, id: &ResourceId) -> Result<(), RemoteError>;
}

// === impl ResourceType ===

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.group_version, self.kind)
    }
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(ty: ResourceType, name: impl Into<String>, tenancy: Tenancy) -> Self {
        Self {
            name: name.into(),
            ty,
            tenancy,
            uid: String::new(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.ty, self.tenancy.partition, self.tenancy.namespace, self.name
        )
    }
}

// === impl Resource ===

impl Resource {
    pub fn new(id: ResourceId, metadata: Meta, data: serde_json::Value) -> Self {
        Self {
            id,
            metadata,
            data,
            version: String::new(),
            generation: String::new(),
            status: None,
        }
    }
}
