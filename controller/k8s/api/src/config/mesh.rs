use super::is_default;
use crate::{
    resource::{entry_body, synced_resource},
    validation::{FieldErrors, FieldPath, Invalid},
    ConfigEntryResource, ResourceExt, Status,
};
use consul_controller_core::{meta::DEFAULT_PARTITION, TenancyConfig};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const NAME: &str = "mesh";

const TLS_VERSIONS: &[&str] = &["TLS_AUTO", "TLSv1_0", "TLSv1_1", "TLSv1_2", "TLSv1_3", ""];

const PATH_WITH_ESCAPED_SLASHES_ACTIONS: &[&str] = &[
    "DEFAULT",
    "KEEP_UNCHANGED",
    "REJECT_REQUEST",
    "UNESCAPE_AND_REDIRECT",
    "UNESCAPE_AND_FORWARD",
    "",
];

const HEADERS_WITH_UNDERSCORES_ACTIONS: &[&str] = &["ALLOW", "REJECT_REQUEST", "DROP_HEADER", ""];

/// Mesh-wide configuration. There is exactly one, named `mesh`.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "Mesh",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    #[serde(default, skip_serializing_if = "is_default")]
    pub transparent_proxy: TransparentProxyMeshConfig,

    /// Must be set before any service may use permissive mutual TLS.
    #[serde(
        default,
        rename = "allowEnablingPermissiveMutualTLS",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub allow_enabling_permissive_mutual_tls: bool,

    #[serde(default, rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls: Option<MeshTlsConfig>,

    #[serde(default, rename = "http", skip_serializing_if = "Option::is_none")]
    pub http: Option<MeshHttpConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peering: Option<PeeringMeshConfig>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub validate_clusters: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransparentProxyMeshConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mesh_destinations_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshTlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<DirectionalTlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<DirectionalTlsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectionalTlsConfig {
    #[serde(default, rename = "tlsMinVersion", skip_serializing_if = "String::is_empty")]
    pub tls_min_version: String,
    #[serde(default, rename = "tlsMaxVersion", skip_serializing_if = "String::is_empty")]
    pub tls_max_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_suites: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshHttpConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sanitize_x_forwarded_client_cert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<DirectionalHttpConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectionalHttpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_normalization: Option<RequestNormalization>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestNormalization {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_disable_path_normalization: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merge_slashes: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_with_escaped_slashes_action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub headers_with_underscores_action: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeeringMeshConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub peer_through_mesh_gateways: bool,
}

synced_resource!(Mesh);

impl ConfigEntryResource for Mesh {
    const CONSUL_KIND: &'static str = "mesh";
    const GLOBAL: bool = true;

    fn entry_body(&self) -> serde_json::Map<String, serde_json::Value> {
        entry_body(&self.spec)
    }

    fn validate(&self, tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let mut errs = FieldErrors::default();

        if self.name_any() != NAME {
            errs.invalid(
                &FieldPath::new("name"),
                &self.name_any(),
                format!("Mesh resource name must be {NAME:?}"),
            );
        }

        if let Some(tls) = &self.spec.tls {
            let path = path.child("tls");
            for (dir, config) in [("incoming", &tls.incoming), ("outgoing", &tls.outgoing)] {
                if let Some(config) = config {
                    let path = path.child(dir);
                    errs.one_of(
                        &path.child("tlsMaxVersion"),
                        &config.tls_max_version,
                        TLS_VERSIONS,
                    );
                    errs.one_of(
                        &path.child("tlsMinVersion"),
                        &config.tls_min_version,
                        TLS_VERSIONS,
                    );
                }
            }
        }

        if let Some(peering) = &self.spec.peering {
            if tenancy.enable_partitions
                && peering.peer_through_mesh_gateways
                && tenancy.partition != DEFAULT_PARTITION
            {
                errs.forbidden(
                    &path.child("peering").child("peerThroughMeshGateways"),
                    r#""peerThroughMeshGateways" is only valid in the "default" partition"#,
                );
            }
        }

        let normalization = self
            .spec
            .http
            .as_ref()
            .and_then(|http| http.incoming.as_ref())
            .and_then(|incoming| incoming.request_normalization.as_ref());
        if let Some(rn) = normalization {
            let path = path
                .child("http")
                .child("incoming")
                .child("requestNormalization");
            errs.one_of(
                &path.child("pathWithEscapedSlashesAction"),
                &rn.path_with_escaped_slashes_action,
                PATH_WITH_ESCAPED_SLASHES_ACTIONS,
            );
            errs.one_of(
                &path.child("headersWithUnderscoresAction"),
                &rn.headers_with_underscores_action,
                HEADERS_WITH_UNDERSCORES_ACTIONS,
            );
        }

        errs.into_result(self)
    }
}
