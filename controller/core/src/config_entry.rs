use crate::{error::RemoteError, meta::Meta};
use serde::{Deserialize, Serialize};

/// A Consul config entry.
///
/// The kind-specific fields are kept as a JSON object so that a single
/// client and comparison routine serve every kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigEntry {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
    #[serde(default, skip_serializing)]
    pub create_index: u64,
    #[serde(default, skip_serializing)]
    pub modify_index: u64,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

/// A Consul namespace to be created on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub name: String,
    pub partition: String,
    /// ACL policy granting services cross-namespace reads, if ACLs are on.
    pub cross_namespace_policy: Option<String>,
}

/// Access to Consul's config-entry and namespace APIs.
#[async_trait::async_trait]
pub trait ConfigEntryService: Send + Sync {
    async fn get(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        partition: &str,
    ) -> Result<ConfigEntry, RemoteError>;

    async fn set(&self, entry: &ConfigEntry) -> Result<(), RemoteError>;

    async fn delete(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        partition: &str,
    ) -> Result<(), RemoteError>;

    /// Creates the namespace unless it already exists.
    async fn ensure_namespace(&self, ns: &NamespaceSpec) -> Result<(), RemoteError>;
}

// === impl ConfigEntry ===

impl ConfigEntry {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Map<String, serde_json::Value>) -> Self {
        self.body = body;
        self
    }
}

/// Rewrites the object keys of a Kubernetes-style (camelCase) document into
/// Consul's field casing by upper-casing the first letter.
///
/// Consul decodes config entries case-insensitively, and comparisons
/// normalize key case, so acronyms such as `TLS` need no special handling.
pub fn consul_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (upper_first(&k), consul_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(consul_keys).collect()),
        v => v,
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn entry_wire_format() {
        let entry = ConfigEntry {
            namespace: "apps".to_string(),
            meta: crate::meta::entry_meta("dc1"),
            create_index: 10,
            ..ConfigEntry::new("service-defaults", "web")
        }
        .with_body(
            json!({"Protocol": "http"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );

        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "Kind": "service-defaults",
                "Name": "web",
                "Namespace": "apps",
                "Meta": {
                    "external-source": "kubernetes",
                    "consul.hashicorp.com/source-datacenter": "dc1",
                },
                "Protocol": "http",
            })
        );
    }

    #[test]
    fn decodes_indexes_into_fields() {
        let entry: ConfigEntry = serde_json::from_value(json!({
            "Kind": "service-defaults",
            "Name": "web",
            "Protocol": "grpc",
            "CreateIndex": 4,
            "ModifyIndex": 9,
        }))
        .unwrap();
        assert_eq!(entry.create_index, 4);
        assert_eq!(entry.modify_index, 9);
        assert_eq!(entry.body.get("Protocol"), Some(&json!("grpc")));
        assert!(!entry.body.contains_key("CreateIndex"));
    }

    #[test]
    fn rewrites_nested_keys() {
        let value = consul_keys(json!({
            "meshGateway": {"mode": "local"},
            "destination": {"addresses": ["a.example.com"], "port": 443},
            "sources": [{"name": "web"}],
        }));
        assert_eq!(
            value,
            json!({
                "MeshGateway": {"Mode": "local"},
                "Destination": {"Addresses": ["a.example.com"], "Port": 443},
                "Sources": [{"Name": "web"}],
            })
        );
    }
}
