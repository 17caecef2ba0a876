use crate::{
    resource::{entry_body, synced_resource},
    validation::{FieldErrors, FieldPath, Invalid},
    ConfigEntryResource, ResourceExt, Status,
};
use consul_controller_core::{
    config_entry::ConfigEntry,
    matching,
    meta::{DEFAULT_PARTITION, WILDCARD_NAMESPACE},
    TenancyConfig,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Services exported from the local partition to other partitions, peers,
/// or sameness groups. There is one per partition, named after it.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ExportedServices",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExportedServicesSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ExportedService>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportedService {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumers: Vec<ServiceConsumer>,
}

/// Exactly one of the fields must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConsumer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sameness_group: String,
}

synced_resource!(ExportedServices);

impl ConfigEntryResource for ExportedServices {
    const CONSUL_KIND: &'static str = "exported-services";
    const GLOBAL: bool = true;

    fn entry_body(&self) -> serde_json::Map<String, Value> {
        entry_body(&self.spec)
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec").child("services");
        let name = self.name_any();
        let mut errs = FieldErrors::default();

        if tenancy.enable_partitions && name != tenancy.partition {
            errs.invalid(
                &FieldPath::new("name"),
                &name,
                format!(
                    "ExportedServices resource name must be the same name as the partition, {:?}",
                    tenancy.partition
                ),
            );
        } else if !tenancy.enable_partitions && name != DEFAULT_PARTITION {
            errs.invalid(
                &FieldPath::new("name"),
                &name,
                format!("ExportedServices resource name must be {DEFAULT_PARTITION:?}"),
            );
        }

        if self.spec.services.is_empty() {
            errs.invalid(
                &path,
                &self.spec.services,
                "at least one service must be exported",
            );
        }
        for (i, service) in self.spec.services.iter().enumerate() {
            service.validate(&path.index(i), tenancy, &mut errs);
        }

        errs.into_result(self)
    }

    /// Consul reports consumers of the local partition with an explicit
    /// `default` partition.
    fn matches(&self, stored: &ConfigEntry) -> bool {
        let mut desired = ConfigEntry::new(Self::CONSUL_KIND, self.consul_name())
            .with_body(self.entry_body());
        let mut stored = stored.clone();
        default_consumer_partitions(&mut desired.body);
        default_consumer_partitions(&mut stored.body);
        matching::entry_matches(&desired, &stored, Self::IGNORED_FIELDS)
    }
}

// === impl ExportedService ===

impl ExportedService {
    fn validate(&self, path: &FieldPath, tenancy: &TenancyConfig, errs: &mut FieldErrors) {
        if self.consumers.is_empty() {
            errs.invalid(path, &self.consumers, "service must have at least 1 consumer.");
        }
        if !tenancy.enable_namespaces && !self.namespace.is_empty() {
            errs.invalid(
                path,
                &self.namespace,
                "Consul Namespaces must be enabled to specify service namespace.",
            );
        }
        for (i, consumer) in self.consumers.iter().enumerate() {
            consumer.validate(&path.child("consumers").index(i), tenancy, errs);
        }
    }
}

// === impl ServiceConsumer ===

impl ServiceConsumer {
    /// Records at most one error.
    fn validate(&self, path: &FieldPath, tenancy: &TenancyConfig, errs: &mut FieldErrors) {
        let targets = [&self.partition, &self.peer, &self.sameness_group]
            .into_iter()
            .filter(|s| !s.is_empty())
            .count();
        if targets > 1 {
            errs.invalid(
                path,
                self,
                "service consumer must define at most one of Peer, Partition, or SamenessGroup",
            );
            return;
        }
        if targets == 0 {
            errs.invalid(
                path,
                self,
                "service consumer must define at least one of Peer, Partition, or SamenessGroup",
            );
            return;
        }

        if !tenancy.enable_partitions && !self.partition.is_empty() {
            errs.invalid(
                &path.child("partition"),
                &self.partition,
                "Consul Admin Partitions need to be enabled to specify partition.",
            );
            return;
        }
        for (field, value, target) in [
            ("partition", &self.partition, "partitions"),
            ("peer", &self.peer, "peers"),
            ("samenessgroup", &self.sameness_group, "sameness groups"),
        ] {
            if value == WILDCARD_NAMESPACE {
                errs.invalid(
                    &path.child(field),
                    "",
                    format!("exporting to all {target} (wildcard) is not supported"),
                );
                return;
            }
        }
    }
}

/// Rewrites every `Services[].Consumers[].Partition` that is missing or empty
/// to `default`.
fn default_consumer_partitions(body: &mut serde_json::Map<String, Value>) {
    let services = body
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("services"))
        .and_then(|(_, v)| v.as_array_mut());
    for service in services.into_iter().flatten() {
        let consumers = service
            .as_object_mut()
            .and_then(|s| s.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("consumers")))
            .and_then(|(_, v)| v.as_array_mut());
        for consumer in consumers.into_iter().flatten() {
            let Some(consumer) = consumer.as_object_mut() else {
                continue;
            };
            let key = consumer
                .keys()
                .find(|k| k.eq_ignore_ascii_case("partition"))
                .cloned()
                .unwrap_or_else(|| "Partition".to_string());
            let partition = consumer.entry(key).or_insert(Value::Null);
            if partition.as_str().unwrap_or_default().is_empty() {
                *partition = Value::String(DEFAULT_PARTITION.to_string());
            }
        }
    }
}
