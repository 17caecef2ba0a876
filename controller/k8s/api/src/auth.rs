use crate::{
    resource::synced_resource,
    validation::{FieldErrors, FieldPath, Invalid},
    MeshResource, Status,
};
use consul_controller_core::{
    meta::{DEFAULT_PARTITION, DEFAULT_PEER},
    ResourceType, TenancyConfig,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Authorizes traffic to a workload identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "auth.consul.hashicorp.com",
    version = "v2beta1",
    kind = "TrafficPermissions",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPermissionsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,

    /// Either `allow` or `deny`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_rules: Vec<DestinationRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(flatten)]
    pub tenancy: SourceTenancy,

    /// Sources excluded from a wildcard source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<SourceTenancy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceTenancy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sameness_group: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRule {
    #[serde(flatten)]
    pub rule: PathRule,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<PathRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_regex: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub invert: bool,
}

synced_resource!(TrafficPermissions);

impl MeshResource for TrafficPermissions {
    const TYPE: ResourceType = ResourceType {
        group: "auth",
        group_version: "v2beta1",
        kind: "TrafficPermissions",
    };

    fn data(&self) -> serde_json::Value {
        let mut data = serde_json::to_value(&self.spec).unwrap_or_default();
        if let Some(action) = data.get_mut("action") {
            *action = match self.spec.action.as_str() {
                "allow" => "ACTION_ALLOW".into(),
                "deny" => "ACTION_DENY".into(),
                _ => "ACTION_UNSPECIFIED".into(),
            };
        }
        data
    }

    fn validate(&self, _tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let mut errs = FieldErrors::default();

        if !matches!(self.spec.action.as_str(), "allow" | "deny") {
            errs.invalid(
                &path.child("action"),
                &self.spec.action,
                "action must be either allow or deny",
            );
        }

        match &self.spec.destination {
            Some(dst) if !dst.identity_name.is_empty() => {}
            dst => errs.invalid(&path.child("destination"), dst, "cannot be empty"),
        }

        for (i, permission) in self.spec.permissions.iter().enumerate() {
            errs.extend(permission.validate(&path.child("permissions").index(i)));
        }

        errs.into_result(self)
    }
}

impl Permission {
    fn validate(&self, path: &FieldPath) -> FieldErrors {
        let mut errs = FieldErrors::default();

        for (i, src) in self.sources.iter().enumerate() {
            let path = path.child("sources").index(i);
            if src.tenancy.has_incompatible_tenancies() {
                errs.invalid(
                    &path,
                    src,
                    "permission sources may not specify partitions, peers, and sameness_groups together",
                );
            }

            if src.tenancy.namespace.is_empty() && !src.tenancy.identity_name.is_empty() {
                errs.invalid(
                    &path,
                    src,
                    "permission sources may not have wildcard namespaces and explicit names",
                );
            }

            if !src.tenancy.identity_name.is_empty() && !src.exclude.is_empty() {
                errs.invalid(&path, src, "must be defined on wildcard sources");
                continue;
            }

            for (j, excl) in src.exclude.iter().enumerate() {
                let path = path.child("exclude").index(j);
                if excl.has_incompatible_tenancies() {
                    errs.invalid(
                        &path,
                        excl,
                        "permissions sources may not specify partitions, peers, and sameness_groups together",
                    );
                }
                if excl.namespace.is_empty() && !excl.identity_name.is_empty() {
                    errs.invalid(
                        &path,
                        excl,
                        "permission sources may not have wildcard namespaces and explicit names",
                    );
                }
            }
        }

        for (i, dst) in self.destination_rules.iter().enumerate() {
            let path = path.child("destinationRules").index(i);
            if dst.rule.has_conflicting_paths() {
                errs.invalid(
                    &path,
                    dst,
                    "prefix values, regex values, and explicit names must not combined",
                );
            }
            for (j, excl) in dst.exclude.iter().enumerate() {
                if excl.has_conflicting_paths() {
                    errs.invalid(
                        &path.child("exclude").index(j),
                        excl,
                        "prefix values, regex values, and explicit names must not combined",
                    );
                }
            }
        }

        errs
    }
}

impl SourceTenancy {
    fn has_incompatible_tenancies(&self) -> bool {
        let peer = !self.peer.is_empty() && self.peer != DEFAULT_PEER;
        let partition = !self.partition.is_empty() && self.partition != DEFAULT_PARTITION;
        let sameness_group = !self.sameness_group.is_empty();
        [peer, partition, sameness_group]
            .into_iter()
            .filter(|set| *set)
            .count()
            > 1
    }
}

impl PathRule {
    fn has_conflicting_paths(&self) -> bool {
        [&self.path_exact, &self.path_prefix, &self.path_regex]
            .into_iter()
            .filter(|p| !p.is_empty())
            .count()
            > 1
    }
}
