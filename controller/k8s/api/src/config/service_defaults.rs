use super::{
    is_default, is_zero, validate_mutual_tls_mode, validate_protocol, validate_proxy_mode, Expose,
    MeshGatewayConfig, TransparentProxyConfig,
};
use crate::{
    resource::{entry_body, synced_resource},
    validation::{is_hostname, is_ip, is_port, FieldErrors, FieldPath, Invalid},
    ConfigEntryResource, Status,
};
use consul_controller_core::TenancyConfig;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Defaults for every instance of a single service.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ServiceDefaults",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefaultsSpec {
    /// One of `tcp`, `http`, `http2`, or `grpc`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_proxy: Option<TransparentProxyConfig>,

    #[serde(
        default,
        rename = "mutualTLSMode",
        skip_serializing_if = "String::is_empty"
    )]
    pub mutual_tls_mode: String,

    #[serde(default, skip_serializing_if = "is_default")]
    pub mesh_gateway: MeshGatewayConfig,

    #[serde(default, skip_serializing_if = "is_default")]
    pub expose: Expose,

    #[serde(default, rename = "externalSNI", skip_serializing_if = "String::is_empty")]
    pub external_sni: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_config: Option<Upstreams>,

    /// Marks the service as a terminating-gateway destination outside the mesh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_inbound_connections: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_connect_timeout_ms: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_request_timeout_ms: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance_inbound_connections: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstreams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<Upstream>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub connect_timeout_ms: i32,
    #[serde(default, skip_serializing_if = "is_default")]
    pub mesh_gateway: MeshGatewayConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub port: u32,
}

synced_resource!(ServiceDefaults);

impl ConfigEntryResource for ServiceDefaults {
    const CONSUL_KIND: &'static str = "service-defaults";

    fn entry_body(&self) -> serde_json::Map<String, serde_json::Value> {
        entry_body(&self.spec)
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let spec = &self.spec;
        let mut errs = FieldErrors::default();

        validate_protocol(&spec.protocol, &path.child("protocol"), &mut errs);
        spec.mesh_gateway
            .validate(&path.child("meshGateway"), &mut errs);
        TransparentProxyConfig::validate(
            spec.transparent_proxy.as_ref(),
            &path.child("transparentProxy"),
            &mut errs,
        );
        validate_proxy_mode(&spec.mode, &path.child("mode"), &mut errs);
        validate_mutual_tls_mode(&spec.mutual_tls_mode, &path.child("mutualTLSMode"), &mut errs);
        spec.expose.validate(&path.child("expose"), &mut errs);

        if let Some(upstreams) = &spec.upstream_config {
            let path = path.child("upstreamConfig");
            if let Some(defaults) = &upstreams.defaults {
                defaults.validate_default(&path.child("defaults"), tenancy, &mut errs);
            }
            for (i, upstream) in upstreams.overrides.iter().enumerate() {
                upstream.validate_override(&path.child("overrides").index(i), tenancy, &mut errs);
            }
        }

        if let Some(destination) = &spec.destination {
            destination.validate(&path.child("destination"), &mut errs);
        }

        if spec.max_inbound_connections < 0 {
            errs.invalid(
                &path.child("maxinboundconnections"),
                &spec.max_inbound_connections,
                "MaxInboundConnections must be > 0",
            );
        }
        if spec.local_connect_timeout_ms < 0 {
            errs.invalid(
                &path.child("localConnectTimeoutMs"),
                &spec.local_connect_timeout_ms,
                "LocalConnectTimeoutMs must be > 0",
            );
        }
        if spec.local_request_timeout_ms < 0 {
            errs.invalid(
                &path.child("localRequestTimeoutMs"),
                &spec.local_request_timeout_ms,
                "LocalRequestTimeoutMs must be > 0",
            );
        }
        if !matches!(spec.balance_inbound_connections.as_str(), "" | "exact_balance") {
            errs.invalid(
                &path.child("balanceInboundConnections"),
                &spec.balance_inbound_connections,
                "BalanceInboundConnections must be an empty string or exact_balance",
            );
        }

        errs.into_result(self)
    }
}

// === impl Upstream ===

impl Upstream {
    fn validate_default(&self, path: &FieldPath, tenancy: &TenancyConfig, errs: &mut FieldErrors) {
        for (field, value) in [
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("partition", &self.partition),
            ("peer", &self.peer),
        ] {
            if !value.is_empty() {
                errs.invalid(
                    &path.child(field),
                    value,
                    format!("upstream.{field} for a default upstream must be \"\""),
                );
            }
        }
        self.validate_common(path, tenancy, errs);
    }

    fn validate_override(&self, path: &FieldPath, tenancy: &TenancyConfig, errs: &mut FieldErrors) {
        if self.name.is_empty() {
            errs.invalid(
                &path.child("name"),
                &self.name,
                "upstream.name for an override upstream cannot be \"\"",
            );
        }
        if !self.namespace.is_empty() && !self.peer.is_empty() {
            errs.invalid(path, self, "both namespace and peer cannot be specified.");
        }
        if !self.partition.is_empty() && !self.peer.is_empty() {
            errs.invalid(path, self, "both partition and peer cannot be specified.");
        }
        self.validate_common(path, tenancy, errs);
    }

    fn validate_common(&self, path: &FieldPath, tenancy: &TenancyConfig, errs: &mut FieldErrors) {
        if !self.partition.is_empty() && !tenancy.enable_partitions {
            errs.invalid(
                &path.child("partition"),
                &self.partition,
                "Consul Enterprise Admin Partitions must be enabled to set upstream.partition",
            );
        }
        self.mesh_gateway
            .validate(&path.child("meshGateway"), errs);
    }
}

// === impl Destination ===

impl Destination {
    fn validate(&self, path: &FieldPath, errs: &mut FieldErrors) {
        if self.addresses.is_empty() {
            errs.required(
                &path.child("addresses"),
                "at least one address must be define per destination",
            );
        }

        let mut seen = HashSet::new();
        for (i, address) in self.addresses.iter().enumerate() {
            let path = path.child("addresses").index(i);
            if !seen.insert(address.as_str()) {
                errs.duplicate(&path, address);
                continue;
            }
            if !is_ip(address) && !is_hostname(address) {
                errs.invalid(
                    &path,
                    address,
                    format!("address {address} is not a valid IP or hostname"),
                );
            }
        }

        if !is_port(self.port.into()) {
            errs.invalid(&path.child("port"), &self.port, "invalid port number");
        }
    }
}
