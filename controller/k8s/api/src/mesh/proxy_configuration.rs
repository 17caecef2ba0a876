use super::{validate_port, WorkloadSelector};
use crate::{
    resource::synced_resource,
    validation::{FieldErrors, FieldPath, Invalid},
    MeshResource, Status,
};
use consul_controller_core::{ResourceType, TenancyConfig};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configures the sidecar proxies of the selected workloads.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mesh.consul.hashicorp.com",
    version = "v2beta1",
    kind = "ProxyConfiguration",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigurationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workloads: Option<WorkloadSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_config: Option<DynamicConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_config: Option<BootstrapConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_proxy: Option<TransparentProxy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local_connection: BTreeMap<String, ConnectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_connections: Option<InboundConnections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose_config: Option<ExposeConfig>,

    // Accepted by the schema but rejected by validation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mutual_tls_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mesh_gateway_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_logs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_listener_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub listener_tracing_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_cluster_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_workload_address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_workload_port: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_workload_socket_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransparentProxy {
    #[serde(default)]
    pub outbound_listener_port: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dialed_directly: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connect_timeout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_timeout: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundConnections {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_inbound_connections: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance_inbound_connections: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposeConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose_paths: Vec<ExposePath>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposePath {
    pub listener_port: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub local_path_port: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub statsd_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dogstatsd_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prometheus_bind_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stats_bind_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ready_bind_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub override_json_tpl: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub static_clusters_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub static_listeners_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stats_sinks_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stats_config_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stats_flush_interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tracing_config_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub telemetry_collector_bind_socket_dir: String,
}

synced_resource!(ProxyConfiguration);

impl MeshResource for ProxyConfiguration {
    const TYPE: ResourceType = ResourceType {
        group: "mesh",
        group_version: "v2beta1",
        kind: "ProxyConfiguration",
    };

    fn data(&self) -> serde_json::Value {
        serde_json::to_value(&self.spec).unwrap_or_default()
    }

    fn validate(&self, _tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let mut errs =
            WorkloadSelector::validate(self.spec.workloads.as_ref(), &path.child("workloads"));

        if self.spec.dynamic_config.is_none() && self.spec.bootstrap_config.is_none() {
            errs.required(
                &path,
                "at least one of \"bootstrap_config\" or \"dynamic_config\" fields must be set",
            );
        }

        if let Some(dynamic) = &self.spec.dynamic_config {
            errs.extend(dynamic.validate(&path.child("dynamicConfig")));
        }

        errs.into_result(self)
    }
}

impl DynamicConfig {
    fn validate(&self, path: &FieldPath) -> FieldErrors {
        const UNSUPPORTED: &str = "field is currently not supported";
        let mut errs = FieldErrors::default();

        let unsupported_strings = [
            ("mutualTlsMode", &self.mutual_tls_mode),
            ("meshGatewayMode", &self.mesh_gateway_mode),
        ];
        for (field, value) in unsupported_strings {
            if !value.is_empty() {
                errs.invalid(&path.child(field), value, UNSUPPORTED);
            }
        }

        if let Some(access_logs) = &self.access_logs {
            errs.invalid(&path.child("accessLogs"), access_logs, UNSUPPORTED);
        }

        let unsupported_strings = [
            ("publicListenerJson", &self.public_listener_json),
            ("listenerTracingJson", &self.listener_tracing_json),
            ("localClusterJson", &self.local_cluster_json),
            ("localWorkloadAddress", &self.local_workload_address),
        ];
        for (field, value) in unsupported_strings {
            if !value.is_empty() {
                errs.invalid(&path.child(field), value, UNSUPPORTED);
            }
        }

        if self.local_workload_port != 0 {
            errs.invalid(
                &path.child("localWorkloadPort"),
                &self.local_workload_port,
                UNSUPPORTED,
            );
        }

        if !self.local_workload_socket_path.is_empty() {
            errs.invalid(
                &path.child("localWorkloadSocketPath"),
                &self.local_workload_socket_path,
                UNSUPPORTED,
            );
        }

        if let Some(tproxy) = &self.transparent_proxy {
            let path = path.child("transparentProxy");
            if tproxy.dialed_directly {
                errs.invalid(&path.child("dialedDirectly"), &true, UNSUPPORTED);
            }
            validate_port(
                &mut errs,
                &path.child("outboundListenerPort"),
                tproxy.outbound_listener_port,
            );
        }

        if let Some(expose) = &self.expose_config {
            let path = path.child("exposeConfig").child("exposePaths");
            for (i, expose_path) in expose.expose_paths.iter().enumerate() {
                let path = path.index(i);
                validate_port(
                    &mut errs,
                    &path.child("listenerPort"),
                    expose_path.listener_port,
                );
                validate_port(
                    &mut errs,
                    &path.child("localPathPort"),
                    expose_path.local_path_port,
                );
            }
        }

        errs
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;
    use pretty_assertions::assert_eq;

    fn proxy_configuration(spec: ProxyConfigurationSpec) -> ProxyConfiguration {
        ProxyConfiguration {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn details(spec: ProxyConfigurationSpec) -> Vec<String> {
        match proxy_configuration(spec).validate(&TenancyConfig::default()) {
            Ok(()) => vec![],
            Err(invalid) => invalid.errors.iter().map(ToString::to_string).collect(),
        }
    }

    fn web_selector() -> Option<WorkloadSelector> {
        Some(WorkloadSelector {
            prefixes: vec!["web".to_string()],
            ..Default::default()
        })
    }

    #[test]
    fn valid_bootstrap_only() {
        let spec = ProxyConfigurationSpec {
            workloads: web_selector(),
            bootstrap_config: Some(BootstrapConfig {
                statsd_url: "udp://127.0.0.1:8125".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(details(spec), Vec::<String>::new());
    }

    #[test]
    fn requires_selector_and_config() {
        assert_eq!(
            details(ProxyConfigurationSpec::default()),
            vec![
                "spec.workloads: Required value: cannot be empty".to_string(),
                "spec: Required value: at least one of \"bootstrap_config\" or \"dynamic_config\" fields must be set".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_empty_names() {
        let spec = ProxyConfigurationSpec {
            workloads: Some(WorkloadSelector {
                names: vec!["web".to_string(), String::new()],
                ..Default::default()
            }),
            bootstrap_config: Some(BootstrapConfig::default()),
            ..Default::default()
        };
        assert_eq!(
            details(spec),
            vec!["spec.workloads.names[1]: Invalid value: \"\": cannot be empty".to_string()]
        );
    }

    #[test]
    fn rejects_unsupported_dynamic_fields() {
        let spec = ProxyConfigurationSpec {
            workloads: web_selector(),
            dynamic_config: Some(DynamicConfig {
                mutual_tls_mode: "MUTUAL_TLS_MODE_STRICT".to_string(),
                local_workload_port: 8080,
                transparent_proxy: Some(TransparentProxy {
                    outbound_listener_port: 70000,
                    dialed_directly: true,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            details(spec),
            vec![
                "spec.dynamicConfig.mutualTlsMode: Invalid value: \"MUTUAL_TLS_MODE_STRICT\": field is currently not supported".to_string(),
                "spec.dynamicConfig.localWorkloadPort: Invalid value: 8080: field is currently not supported".to_string(),
                "spec.dynamicConfig.transparentProxy.dialedDirectly: Invalid value: true: field is currently not supported".to_string(),
                "spec.dynamicConfig.transparentProxy.outboundListenerPort: Invalid value: 70000: port number is outside the range 1 to 65535".to_string(),
            ]
        );
    }

    #[test]
    fn validates_expose_ports() {
        let spec = ProxyConfigurationSpec {
            workloads: web_selector(),
            dynamic_config: Some(DynamicConfig {
                expose_config: Some(ExposeConfig {
                    expose_paths: vec![ExposePath {
                        listener_port: 21500,
                        path: "/health".to_string(),
                        local_path_port: 0,
                        protocol: "http".to_string(),
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            details(spec),
            vec!["spec.dynamicConfig.exposeConfig.exposePaths[0].localPathPort: Invalid value: 0: port number is outside the range 1 to 65535".to_string()]
        );
    }
}
