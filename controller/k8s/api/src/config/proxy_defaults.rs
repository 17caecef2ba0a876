use super::{
    is_default, validate_mutual_tls_mode, validate_proxy_mode, Expose, MeshGatewayConfig,
    TransparentProxyConfig,
};
use crate::{
    resource::{entry_body, synced_resource},
    validation::{FieldErrors, FieldPath, Invalid},
    ConfigEntryResource, ResourceExt, Status,
};
use consul_controller_core::TenancyConfig;
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};

pub const NAME: &str = "global";

/// Mesh-wide proxy defaults. There is exactly one, named `global`.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "ProxyDefaults",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDefaultsSpec {
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

    /// Opaque proxy configuration, passed through to Consul unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub mesh_gateway: MeshGatewayConfig,

    #[serde(default, skip_serializing_if = "is_default")]
    pub expose: Expose,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_logs: Option<AccessLogs>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogs {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_listener_logs: bool,
    /// One of `stdout`, `stderr`, or `file`.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text_format: String,
}

synced_resource!(ProxyDefaults);

impl ConfigEntryResource for ProxyDefaults {
    const CONSUL_KIND: &'static str = "proxy-defaults";
    const GLOBAL: bool = true;

    fn entry_body(&self) -> serde_json::Map<String, serde_json::Value> {
        let spec = ProxyDefaultsSpec {
            config: None,
            ..self.spec.clone()
        };
        let mut body = entry_body(&spec);
        if let Some(config) = self.spec.config.clone().filter(|c| !c.is_null()) {
            body.insert("Config".to_string(), config);
        }
        body
    }

    fn validate(&self, _tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let spec = &self.spec;
        let mut errs = FieldErrors::default();

        if self.name_any() != NAME {
            errs.invalid(
                &FieldPath::new("name"),
                &self.name_any(),
                format!("ProxyDefaults resource name must be {NAME:?}"),
            );
        }

        spec.mesh_gateway
            .validate(&path.child("meshGateway"), &mut errs);
        TransparentProxyConfig::validate(
            spec.transparent_proxy.as_ref(),
            &path.child("transparentProxy"),
            &mut errs,
        );
        validate_mutual_tls_mode(&spec.mutual_tls_mode, &path.child("mutualTLSMode"), &mut errs);
        validate_proxy_mode(&spec.mode, &path.child("mode"), &mut errs);

        match &spec.config {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => {}
            Some(config) => errs.invalid(
                &path.child("config"),
                &config.to_string(),
                format!("must be valid map value: expected a JSON object, found {config}"),
            ),
        }

        if let Some(logs) = &spec.access_logs {
            logs.validate(&path.child("accessLogs"), &mut errs);
        }
        spec.expose.validate(&path.child("expose"), &mut errs);

        errs.into_result(self)
    }
}

// === impl AccessLogs ===

impl AccessLogs {
    /// Records at most one error, the first rule the configuration breaks.
    fn validate(&self, path: &FieldPath, errs: &mut FieldErrors) {
        match self.type_.as_str() {
            "" | "stdout" | "stderr" => {}
            "file" => {
                if self.path.is_empty() {
                    errs.invalid(
                        &path.child("path"),
                        &self.path,
                        "path must be specified when using file type access logs",
                    );
                    return;
                }
            }
            _ => {
                errs.invalid(
                    &path.child("type"),
                    &self.type_,
                    r#"invalid access log type (must be one of "stdout", "stderr", "file""#,
                );
                return;
            }
        }

        if !self.json_format.is_empty() && !self.text_format.is_empty() {
            errs.invalid(
                &path.child("textFormat"),
                &self.text_format,
                "cannot specify both access log jsonFormat and textFormat",
            );
            return;
        }

        if self.type_ != "file" && !self.path.is_empty() {
            errs.invalid(
                &path.child("path"),
                &self.path,
                "path is only valid for file type access logs",
            );
            return;
        }

        if !self.json_format.is_empty()
            && serde_json::from_str::<serde_json::Value>(&self.json_format).is_err()
        {
            errs.invalid(
                &path.child("jsonFormat"),
                &self.json_format,
                "invalid access log json",
            );
        }
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn proxy_defaults(name: &str, spec: ProxyDefaultsSpec) -> ProxyDefaults {
        ProxyDefaults {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("consul".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn config_is_passed_through() {
        let pd = proxy_defaults(
            NAME,
            ProxyDefaultsSpec {
                config: Some(json!({ "envoy_prometheus_bind_addr": "0.0.0.0:9102" })),
                mesh_gateway: MeshGatewayConfig {
                    mode: "local".to_string(),
                },
                ..Default::default()
            },
        );
        assert_eq!(
            serde_json::Value::Object(pd.entry_body()),
            json!({
                "Config": { "envoy_prometheus_bind_addr": "0.0.0.0:9102" },
                "MeshGateway": { "Mode": "local" },
            })
        );
    }

    #[test]
    fn global_entries_use_the_default_namespace() {
        let pd = proxy_defaults(NAME, Default::default());
        let tenancy = TenancyConfig {
            enable_namespaces: true,
            enable_mirroring: true,
            mirroring_prefix: "k8s-".to_string(),
            ..Default::default()
        };
        assert_eq!(pd.consul_namespace(&tenancy), "default");
    }

    #[test]
    fn requires_global_name() {
        let err = proxy_defaults("other", Default::default())
            .validate(&TenancyConfig::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"ProxyDefaults.consul.hashicorp.com "other" is invalid: name: Invalid value: "other": ProxyDefaults resource name must be "global""#
        );
    }

    #[test]
    fn rejects_non_map_config() {
        let pd = proxy_defaults(
            NAME,
            ProxyDefaultsSpec {
                config: Some(json!([1, 2])),
                ..Default::default()
            },
        );
        let err = pd.validate(&TenancyConfig::default()).unwrap_err();
        assert_eq!(err.errors[0].path.to_string(), "spec.config");
    }

    #[rstest]
    #[case(AccessLogs { type_: "file".into(), ..Default::default() }, Some("spec.accessLogs.path"))]
    #[case(AccessLogs { type_: "syslog".into(), ..Default::default() }, Some("spec.accessLogs.type"))]
    #[case(
        AccessLogs { json_format: "{}".into(), text_format: "%START_TIME%".into(), ..Default::default() },
        Some("spec.accessLogs.textFormat")
    )]
    #[case(AccessLogs { path: "/tmp/log".into(), ..Default::default() }, Some("spec.accessLogs.path"))]
    #[case(AccessLogs { json_format: "{".into(), ..Default::default() }, Some("spec.accessLogs.jsonFormat"))]
    #[case(
        AccessLogs { enabled: true, type_: "file".into(), path: "/tmp/log".into(), ..Default::default() },
        None
    )]
    fn access_logs(#[case] logs: AccessLogs, #[case] error: Option<&str>) {
        let pd = proxy_defaults(
            NAME,
            ProxyDefaultsSpec {
                access_logs: Some(logs),
                ..Default::default()
            },
        );
        let errors = pd
            .validate(&TenancyConfig::default())
            .map_err(|e| e.errors)
            .err()
            .unwrap_or_default();
        assert_eq!(
            errors.first().map(|e| e.path.to_string()),
            error.map(str::to_string)
        );
    }
}
