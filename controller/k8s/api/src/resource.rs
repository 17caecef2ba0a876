use crate::{
    status::{ConditionStatus, Reason, Status},
    validation::Invalid,
};
use chrono::{DateTime, Utc};
use consul_controller_core::{
    config_entry::ConfigEntry,
    matching, meta,
    resource::{Resource, ResourceId, ResourceType},
    TenancyConfig,
};
use kube::{core::NamespaceResourceScope, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// A namespaced custom resource carrying a sync status.
pub trait SyncedResource:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn status(&self) -> Option<&Status>;

    fn status_mut(&mut self) -> &mut Status;

    fn synced(&self) -> ConditionStatus {
        self.status().map(Status::synced).unwrap_or_default()
    }

    fn set_synced(
        &mut self,
        status: ConditionStatus,
        reason: Option<Reason>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.status_mut().set_synced(status, reason, message, now);
    }

    fn set_last_synced(&mut self, now: DateTime<Utc>) {
        self.status_mut().last_synced_time = Some(now);
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == meta::FINALIZER)
    }

    fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers_mut().push(meta::FINALIZER.to_string());
        }
    }

    fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != meta::FINALIZER);
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

/// A custom resource mirrored into the Consul resource API.
pub trait MeshResource: SyncedResource {
    const TYPE: ResourceType;

    /// The resource's data as Consul stores it.
    fn data(&self) -> serde_json::Value;

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid>;

    fn default_namespace_fields(&mut self, _tenancy: &TenancyConfig) {}

    fn resource_id(&self, tenancy: &TenancyConfig) -> ResourceId {
        let ns = self.namespace().unwrap_or_default();
        ResourceId::new(Self::TYPE, self.name_any(), tenancy.resource_tenancy(&ns))
    }

    fn to_resource(&self, tenancy: &TenancyConfig) -> Resource {
        Resource::new(
            self.resource_id(tenancy),
            meta::resource_meta(),
            self.data(),
        )
    }

    fn matches(&self, stored: &Resource, tenancy: &TenancyConfig) -> bool {
        matching::resource_matches(&self.to_resource(tenancy), stored)
    }
}

/// A custom resource mirrored into a Consul config entry.
pub trait ConfigEntryResource: SyncedResource {
    /// The Consul config-entry kind, e.g. `service-defaults`.
    const CONSUL_KIND: &'static str;

    /// Entries that are not scoped to a Kubernetes namespace.
    const GLOBAL: bool = false;

    /// Lower-case fields Consul adds to stored entries that never count as
    /// drift.
    const IGNORED_FIELDS: &'static [&'static str] = &[];

    /// Kind-specific fields of the entry in Consul casing.
    fn entry_body(&self) -> serde_json::Map<String, serde_json::Value>;

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid>;

    fn default_namespace_fields(&mut self, _tenancy: &TenancyConfig) {}

    fn consul_name(&self) -> String {
        self.name_any()
    }

    /// A Consul namespace set on the resource itself.
    fn own_namespace(&self) -> String {
        String::new()
    }

    fn consul_namespace(&self, tenancy: &TenancyConfig) -> String {
        let ns = self.namespace().unwrap_or_default();
        tenancy.entry_namespace(&ns, &self.own_namespace(), Self::GLOBAL)
    }

    fn to_entry(&self, tenancy: &TenancyConfig, datacenter: &str) -> ConfigEntry {
        ConfigEntry {
            namespace: self.consul_namespace(tenancy),
            partition: tenancy.entry_partition(),
            meta: meta::entry_meta(datacenter),
            ..ConfigEntry::new(Self::CONSUL_KIND, self.consul_name())
        }
        .with_body(self.entry_body())
    }

    fn matches(&self, stored: &ConfigEntry) -> bool {
        let desired = ConfigEntry::new(Self::CONSUL_KIND, self.consul_name())
            .with_body(self.entry_body());
        matching::entry_matches(&desired, stored, Self::IGNORED_FIELDS)
    }

    fn migrate_requested(&self) -> bool {
        self.annotations()
            .get(meta::MIGRATE_ENTRY_KEY)
            .map(String::as_str)
            == Some(meta::MIGRATE_ENTRY_TRUE)
    }
}

/// Implements [`SyncedResource`] for custom resources with a
/// `status: Option<Status>` field.
macro_rules! synced_resource {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl $crate::SyncedResource for $kind {
                fn status(&self) -> Option<&$crate::Status> {
                    self.status.as_ref()
                }

                fn status_mut(&mut self) -> &mut $crate::Status {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )+
    };
}

pub(crate) use synced_resource;

/// Converts a serializable spec into a Consul config-entry body.
pub(crate) fn entry_body<T: Serialize>(spec: &T) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(spec).map(consul_controller_core::config_entry::consul_keys) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}
