//! Cluster peering token exchange.

use crate::{status::Status, ResourceExt, SyncedResource};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Bumping this annotation forces a new token (acceptor) or a re-dial
/// (dialer).
pub const PEERING_VERSION_ANNOTATION: &str = "consul.hashicorp.com/peering-version";

/// Marks Secrets that hold peering tokens.
pub const PEERING_TOKEN_LABEL: &str = "consul.hashicorp.com/peering-token";

pub const KUBERNETES_BACKEND: &str = "kubernetes";

/// Generates a peering token and stores it in a Secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "PeeringAcceptor",
    namespaced,
    status = "PeeringStatus",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringAcceptorSpec {
    pub peer: Peer,
}

/// Establishes a peering with the token stored in a Secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "PeeringDialer",
    namespaced,
    status = "PeeringStatus",
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringDialerSpec {
    pub peer: Peer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
    /// The key within the Secret's data holding the token.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub backend: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeeringStatus {
    #[serde(flatten)]
    pub sync: Status,

    /// The Secret most recently written (acceptor) or dialed with (dialer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRefStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_peering_version: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRefStatus {
    #[serde(flatten)]
    pub secret: SecretRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

/// Common access to acceptors and dialers.
pub trait PeeringResource: SyncedResource {
    fn peer(&self) -> &Peer;

    fn peering_status(&self) -> Option<&PeeringStatus>;

    fn peering_status_mut(&mut self) -> &mut PeeringStatus;

    /// The token Secret named in the spec.
    fn secret(&self) -> SecretRef {
        self.peer().secret.clone().unwrap_or_default()
    }

    /// The token Secret recorded in the status.
    fn secret_ref(&self) -> Option<&SecretRefStatus> {
        self.peering_status().and_then(|s| s.secret_ref.as_ref())
    }

    /// The requested peering version, if annotated.
    fn requested_version(&self) -> Result<Option<u64>, std::num::ParseIntError> {
        self.annotations()
            .get(PEERING_VERSION_ANNOTATION)
            .map(|v| v.parse())
            .transpose()
    }

    /// Whether the version annotation is ahead of the last synced version.
    fn version_bumped(&self) -> Result<bool, std::num::ParseIntError> {
        let Some(requested) = self.requested_version()? else {
            return Ok(false);
        };
        let latest = self.peering_status().and_then(|s| s.latest_peering_version);
        Ok(latest.map_or(true, |latest| latest < requested))
    }
}

macro_rules! peering_resource {
    ($($kind:ty),+) => {
        $(
            impl SyncedResource for $kind {
                fn status(&self) -> Option<&Status> {
                    self.status.as_ref().map(|s| &s.sync)
                }

                fn status_mut(&mut self) -> &mut Status {
                    &mut self.status.get_or_insert_with(Default::default).sync
                }
            }

            impl PeeringResource for $kind {
                fn peer(&self) -> &Peer {
                    &self.spec.peer
                }

                fn peering_status(&self) -> Option<&PeeringStatus> {
                    self.status.as_ref()
                }

                fn peering_status_mut(&mut self) -> &mut PeeringStatus {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )+
    };
}

peering_resource!(PeeringAcceptor, PeeringDialer);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn dialer(version: Option<&str>, latest: Option<u64>) -> PeeringDialer {
        PeeringDialer {
            metadata: ObjectMeta {
                name: Some("dc2".to_string()),
                namespace: Some("consul".to_string()),
                annotations: version.map(|v| {
                    [(PEERING_VERSION_ANNOTATION.to_string(), v.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            spec: PeeringDialerSpec {
                peer: Peer {
                    secret: Some(SecretRef {
                        name: "token".to_string(),
                        key: "data".to_string(),
                        backend: KUBERNETES_BACKEND.to_string(),
                    }),
                },
            },
            status: Some(PeeringStatus {
                latest_peering_version: latest,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn version_bumps() {
        assert!(!dialer(None, None).version_bumped().unwrap());
        assert!(dialer(Some("1"), None).version_bumped().unwrap());
        assert!(dialer(Some("3"), Some(2)).version_bumped().unwrap());
        assert!(!dialer(Some("2"), Some(2)).version_bumped().unwrap());
        assert!(dialer(Some("two"), None).version_bumped().is_err());
    }

    #[test]
    fn status_is_flattened() {
        let mut d = dialer(None, Some(1));
        d.peering_status_mut().secret_ref = Some(SecretRefStatus {
            secret: d.secret(),
            resource_version: "42".to_string(),
        });
        let status = serde_json::to_value(d.status.as_ref().unwrap()).unwrap();
        assert_eq!(
            status,
            json!({
                "secretRef": {
                    "name": "token",
                    "key": "data",
                    "backend": "kubernetes",
                    "resourceVersion": "42",
                },
                "latestPeeringVersion": 1,
            })
        );
    }
}
