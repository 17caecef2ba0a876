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

/// A gateway carrying traffic between partitions and peers.
///
/// Only the resource itself is synced; the gateway's deployment is rendered
/// elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mesh.consul.hashicorp.com",
    version = "v2beta1",
    kind = "MeshGateway",
    namespaced,
    status = "Status"
)]
#[serde(rename_all = "camelCase")]
pub struct MeshGatewaySpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_class_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<Listener>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workloads: Option<WorkloadSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

synced_resource!(MeshGateway);

impl MeshResource for MeshGateway {
    const TYPE: ResourceType = ResourceType {
        group: "mesh",
        group_version: "v2beta1",
        kind: "MeshGateway",
    };

    fn data(&self) -> serde_json::Value {
        serde_json::to_value(&self.spec).unwrap_or_default()
    }

    fn validate(&self, _tenancy: &TenancyConfig) -> Result<(), Invalid> {
        let path = FieldPath::new("spec");
        let mut errs = FieldErrors::default();

        if self.spec.gateway_class_name.is_empty() {
            errs.required(&path.child("gatewayClassName"), "cannot be empty");
        }

        for (i, listener) in self.spec.listeners.iter().enumerate() {
            let path = path.child("listeners").index(i);
            if listener.name.is_empty() {
                errs.required(&path.child("name"), "cannot be empty");
            }
            validate_port(&mut errs, &path.child("port"), listener.port);
            if !listener.protocol.is_empty() {
                errs.one_of(&path.child("protocol"), &listener.protocol, &["TCP"]);
            }
        }

        errs.into_result(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;

    fn mesh_gateway(spec: MeshGatewaySpec) -> MeshGateway {
        MeshGateway {
            metadata: ObjectMeta {
                name: Some("mesh-gateway".to_string()),
                namespace: Some("consul".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn valid() {
        let gw = mesh_gateway(MeshGatewaySpec {
            gateway_class_name: "consul-mesh-gateway".to_string(),
            listeners: vec![Listener {
                name: "wan".to_string(),
                port: 8443,
                protocol: "TCP".to_string(),
            }],
            workloads: None,
        });
        assert!(gw.validate(&TenancyConfig::default()).is_ok());
    }

    #[test]
    fn rejects_incomplete_listeners() {
        let gw = mesh_gateway(MeshGatewaySpec {
            listeners: vec![Listener {
                protocol: "UDP".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let err = gw.validate(&TenancyConfig::default()).unwrap_err();
        let paths = err
            .errors
            .iter()
            .map(|e| e.path.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "spec.gatewayClassName",
                "spec.listeners[0].name",
                "spec.listeners[0].port",
                "spec.listeners[0].protocol",
            ]
        );
    }
}
