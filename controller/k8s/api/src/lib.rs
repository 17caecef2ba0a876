#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod mesh;
pub mod peering;
mod resource;
pub mod status;
pub mod validation;

pub use self::{
    resource::{ConfigEntryResource, MeshResource, SyncedResource},
    status::{Condition, ConditionStatus, Reason, Status},
    validation::{FieldErrors, Invalid},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Container, Namespace, Pod, PodSpec, Secret},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    Client, Error, Resource,
};

pub const CONSUL_GROUP: &str = "consul.hashicorp.com";
pub const AUTH_GROUP: &str = "auth.consul.hashicorp.com";
pub const MESH_GROUP: &str = "mesh.consul.hashicorp.com";
