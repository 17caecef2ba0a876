//! Well-known keys and defaults shared by the controllers and webhooks.

use std::collections::BTreeMap;

/// Finalizer placed on every synced custom resource.
pub const FINALIZER: &str = "finalizers.consul.hashicorp.com";

/// Metadata key marking objects written by this controller.
pub const SOURCE_KEY: &str = "external-source";
pub const SOURCE_VALUE: &str = "kubernetes";

/// Metadata key recording which datacenter wrote a config entry.
pub const DATACENTER_KEY: &str = "consul.hashicorp.com/source-datacenter";

/// Annotation requesting that an existing config entry be taken over.
pub const MIGRATE_ENTRY_KEY: &str = "consul.hashicorp.com/migrate-entry";
pub const MIGRATE_ENTRY_TRUE: &str = "true";

pub const WILDCARD_NAMESPACE: &str = "*";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_PEER: &str = "local";

pub type Meta = BTreeMap<String, String>;

/// Metadata attached to config entries written from `datacenter`.
pub fn entry_meta(datacenter: &str) -> Meta {
    [
        (SOURCE_KEY.to_string(), SOURCE_VALUE.to_string()),
        (DATACENTER_KEY.to_string(), datacenter.to_string()),
    ]
    .into_iter()
    .collect()
}

/// Metadata attached to resources written through the resource API.
pub fn resource_meta() -> Meta {
    [(SOURCE_KEY.to_string(), SOURCE_VALUE.to_string())]
        .into_iter()
        .collect()
}

pub fn is_managed(meta: &Meta) -> bool {
    meta.get(SOURCE_KEY).map(String::as_str) == Some(SOURCE_VALUE)
}

pub fn source_datacenter(meta: &Meta) -> &str {
    meta.get(DATACENTER_KEY).map(String::as_str).unwrap_or("")
}
