pub mod mesh_gateway;
pub mod proxy_configuration;

pub use self::{
    mesh_gateway::{MeshGateway, MeshGatewaySpec},
    proxy_configuration::{ProxyConfiguration, ProxyConfigurationSpec},
};

use crate::validation::{FieldErrors, FieldPath};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects the workloads a resource applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

impl WorkloadSelector {
    pub(crate) fn validate(selector: Option<&Self>, path: &FieldPath) -> FieldErrors {
        let mut errs = FieldErrors::default();
        let Some(selector) = selector else {
            errs.required(path, "cannot be empty");
            return errs;
        };

        if selector.names.is_empty() && selector.prefixes.is_empty() {
            errs.required(
                path,
                "both workloads.names and workloads.prefixes cannot be empty",
            );
            return errs;
        }

        for (i, name) in selector.names.iter().enumerate() {
            if name.is_empty() {
                errs.invalid(&path.child("names").index(i), name, "cannot be empty");
            }
        }
        errs
    }
}

pub(crate) fn validate_port(errs: &mut FieldErrors, path: &FieldPath, port: u32) {
    if !crate::validation::is_port(port.into()) {
        errs.invalid(path, &port, "port number is outside the range 1 to 65535");
    }
}
