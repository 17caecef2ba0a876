#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use consul_controller_core as core;
pub use consul_controller_inject as inject;
pub use consul_controller_k8s_api as k8s;
pub use consul_controller_k8s_sync as sync;

mod admission;
mod args;
mod consul;
mod controllers;
mod lease;
mod metrics;

pub use self::{admission::Admission, args::Args, consul::ConsulClient};

/// Field manager recorded on every write to the Kubernetes API.
const FIELD_MANAGER: &str = "consul-controller";
