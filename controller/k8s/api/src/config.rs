//! Custom resources mirrored into Consul config entries.

pub mod exported_services;
pub mod mesh;
pub mod proxy_defaults;
pub mod service_defaults;
pub mod service_intentions;

pub use self::{
    exported_services::{ExportedServices, ExportedServicesSpec},
    mesh::{Mesh, MeshSpec},
    proxy_defaults::{ProxyDefaults, ProxyDefaultsSpec},
    service_defaults::{ServiceDefaults, ServiceDefaultsSpec},
    service_intentions::{ServiceIntentions, ServiceIntentionsSpec},
};

use crate::validation::{not_in_slice_message, FieldErrors, FieldPath};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshGatewayConfig {
    /// One of `remote`, `local`, `none`, or empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransparentProxyConfig {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub outbound_listener_port: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dialed_directly: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Expose {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checks: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<ExposePath>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposePath {
    #[serde(default)]
    pub listener_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub local_path_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

// === impl MeshGatewayConfig ===

impl MeshGatewayConfig {
    fn validate(&self, path: &FieldPath, errs: &mut FieldErrors) {
        errs.one_of(
            &path.child("mode"),
            &self.mode,
            &["remote", "local", "none", ""],
        );
    }
}

// === impl TransparentProxyConfig ===

impl TransparentProxyConfig {
    fn validate(this: Option<&Self>, path: &FieldPath, errs: &mut FieldErrors) {
        if let Some(tproxy) = this {
            if tproxy.outbound_listener_port != 0 {
                errs.invalid(
                    &path.child("outboundListenerPort"),
                    &tproxy.outbound_listener_port,
                    "use the annotation `consul.hashicorp.com/transparent-proxy-outbound-listener-port` to configure the Outbound Listener Port",
                );
            }
        }
    }
}

// === impl Expose ===

impl Expose {
    fn validate(&self, path: &FieldPath, errs: &mut FieldErrors) {
        for (i, expose) in self.paths.iter().enumerate() {
            let path = path.child("paths").index(i);
            if !expose.path.is_empty() && !expose.path.starts_with('/') {
                errs.invalid(&path.child("path"), &expose.path, "must begin with a '/'");
            }
            if !expose.protocol.is_empty() {
                errs.one_of(&path.child("protocol"), &expose.protocol, &["http", "http2"]);
            }
        }
    }
}

fn validate_proxy_mode(mode: &str, path: &FieldPath, errs: &mut FieldErrors) {
    if !mode.is_empty() {
        errs.invalid(
            path,
            mode,
            "use the annotation `consul.hashicorp.com/transparent-proxy` to configure the Transparent Proxy Mode",
        );
    }
}

fn validate_mutual_tls_mode(mode: &str, path: &FieldPath, errs: &mut FieldErrors) {
    if !matches!(mode, "" | "strict" | "permissive") {
        errs.invalid(
            path,
            mode,
            format!(
                "Must be one of {:?}, {:?}, or {:?}.",
                "", "strict", "permissive"
            ),
        );
    }
}

fn validate_protocol(protocol: &str, path: &FieldPath, errs: &mut FieldErrors) {
    const PROTOCOLS: &[&str] = &["tcp", "http", "http2", "grpc"];
    if !protocol.is_empty() && !PROTOCOLS.contains(&protocol) {
        errs.invalid(path, protocol, not_in_slice_message(PROTOCOLS));
    }
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == T::default()
}
