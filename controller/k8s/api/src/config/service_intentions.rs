use crate::{
    resource::{entry_body, synced_resource},
    validation::{not_in_slice_message, FieldErrors, FieldPath, Invalid},
    ConfigEntryResource, ResourceExt, Status,
};
use consul_controller_core::TenancyConfig;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const ACTIONS: &[&str] = &["allow", "deny"];

const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

/// Authorizes traffic from a set of sources to one destination service.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ServiceIntentions",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIntentionsSpec {
    #[serde(default)]
    pub destination: IntentionDestination,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceIntention>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentionDestination {
    /// A service name, or `*` for every service without its own intentions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceIntention {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// An L4 decision; mutually exclusive with `permissions`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<IntentionPermission>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentionPermission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, rename = "http", skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpPermission>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpPermission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_regex: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<HeaderPermission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPermission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
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

synced_resource!(ServiceIntentions);

impl ConfigEntryResource for ServiceIntentions {
    const CONSUL_KIND: &'static str = "service-intentions";

    const IGNORED_FIELDS: &'static [&'static str] = &[
        "precedence",
        "type",
        "legacyid",
        "legacymeta",
        "legacycreatetime",
        "legacyupdatetime",
    ];

    fn entry_body(&self) -> serde_json::Map<String, serde_json::Value> {
        #[derive(Serialize)]
        struct Body<'a> {
            sources: &'a [SourceIntention],
        }
        entry_body(&Body {
            sources: &self.spec.sources,
        })
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let spec = &self.spec;
        let mut errs = FieldErrors::default();

        if spec.destination.name.is_empty() {
            errs.required(
                &path.child("destination").child("name"),
                "a destination service must be specified",
            );
        }
        if spec.sources.is_empty() {
            errs.required(&path.child("sources"), "at least one source must be specified");
        }
        for (i, source) in spec.sources.iter().enumerate() {
            let path = path.child("sources").index(i);
            if !source.permissions.is_empty() && !source.action.is_empty() {
                errs.invalid(
                    &path,
                    &json_string(source),
                    "action and permissions are mutually exclusive and only one of them can be specified",
                );
            } else if source.permissions.is_empty() {
                validate_action(&source.action, &path, &mut errs);
            } else {
                for (j, permission) in source.permissions.iter().enumerate() {
                    let path = path.child("permissions").index(j);
                    validate_action(&permission.action, &path, &mut errs);
                    if let Some(http) = &permission.http {
                        http.validate(&path, &mut errs);
                    }
                }
            }
        }

        if !tenancy.enable_namespaces {
            if !spec.destination.namespace.is_empty() {
                errs.invalid(
                    &path.child("destination").child("namespace"),
                    &spec.destination.namespace,
                    "Consul Enterprise namespaces must be enabled to set destination.namespace",
                );
            }
            for (i, source) in spec.sources.iter().enumerate() {
                if !source.namespace.is_empty() {
                    errs.invalid(
                        &path.child("sources").index(i).child("namespace"),
                        &source.namespace,
                        "Consul Enterprise namespaces must be enabled to set source.namespace",
                    );
                }
            }
        }

        for (i, source) in spec.sources.iter().enumerate() {
            let path = path.child("sources").index(i);
            if !source.partition.is_empty() && !tenancy.enable_partitions {
                errs.invalid(
                    &path.child("partition"),
                    &source.partition,
                    "Consul Enterprise Admin Partitions must be enabled to set source.partition",
                );
            }
            if !source.peer.is_empty() && !source.partition.is_empty() {
                errs.invalid(
                    &path,
                    source,
                    "Both source.peer and source.partition cannot be set.",
                );
            }
        }

        errs.into_result(self)
    }

    fn default_namespace_fields(&mut self, tenancy: &TenancyConfig) {
        if tenancy.enable_namespaces && self.spec.destination.namespace.is_empty() {
            let ns = self.namespace().unwrap_or_default();
            self.spec.destination.namespace = tenancy.consul_namespace(&ns);
        }
    }

    fn consul_name(&self) -> String {
        self.spec.destination.name.clone()
    }

    fn own_namespace(&self) -> String {
        self.spec.destination.namespace.clone()
    }
}

// === impl HttpPermission ===

impl HttpPermission {
    fn validate(&self, path: &FieldPath, errs: &mut FieldErrors) {
        let mut path_parts = 0;
        if !self.path_regex.is_empty() {
            path_parts += 1;
        }
        for (field, value) in [
            ("pathPrefix", &self.path_prefix),
            ("pathExact", &self.path_exact),
        ] {
            if value.is_empty() {
                continue;
            }
            path_parts += 1;
            if !value.starts_with('/') {
                errs.invalid(&path.child(field), value, "must begin with a '/'");
            }
        }
        if path_parts > 1 {
            errs.invalid(
                path,
                &json_string(self),
                "at most only one of pathExact, pathPrefix, or pathRegex may be configured.",
            );
        }

        let mut found = HashSet::new();
        for (i, method) in self.methods.iter().enumerate() {
            let path = path.child("methods").index(i);
            if !METHODS.contains(&method.as_str()) {
                errs.invalid(&path, method, not_in_slice_message(METHODS));
            }
            if !found.insert(method.as_str()) {
                errs.invalid(&path, method, "method listed more than once.");
            }
        }

        for (i, header) in self.header.iter().enumerate() {
            let matchers = [&header.exact, &header.regex, &header.prefix, &header.suffix]
                .into_iter()
                .filter(|s| !s.is_empty())
                .count()
                + usize::from(header.present);
            if matchers > 1 {
                errs.invalid(
                    &path.child("header").index(i),
                    &json_string(header),
                    "at most only one of exact, prefix, suffix, regex, or present may be configured.",
                );
            }
        }
    }
}

fn validate_action(action: &str, path: &FieldPath, errs: &mut FieldErrors) {
    errs.one_of(&path.child("action"), action, ACTIONS);
}

/// Rejected objects are reported as their JSON text, as the API server does.
fn json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
