#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mutates pods to run alongside a Consul dataplane.
//!
//! [`inject`] decides whether a pod is part of the mesh and, if so, returns a
//! JSON patch adding the shared volume, the `connect-init` init container,
//! the `consul-dataplane` sidecar and the bookkeeping annotations and labels.

pub mod annotations;
mod config;
pub mod containers;
pub mod probes;


pub use self::config::InjectConfig;
use self::config::annotation;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("the \"{}\" annotation is no longer supported. Instead, create a ServiceDefaults resource (see www.consul.io/docs/k8s/crds/upgrade-to-crds)", annotations::DEPRECATED_PROTOCOL)]
    DeprecatedProtocol,

    #[error("the \"{}\" annotation is no longer supported because consul-sidecar is no longer injected to periodically register services", annotations::DEPRECATED_SYNC_PERIOD)]
    DeprecatedSyncPeriod,

    #[error("{key} annotation value of {value} was invalid")]
    InvalidBool { key: &'static str, value: String },

    #[error("unable to parse annotation {key:?}: {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} annotation value of {value} is not a valid port")]
    InvalidPort { key: &'static str, value: String },

    #[error("pod's security context cannot have the same UID as consul-dataplane: {}", containers::SIDECAR_UID)]
    PodUid,

    #[error("container {0:?} has runAsUser set to the same UID \"{uid}\" as consul-dataplane which is not allowed", uid = containers::SIDECAR_UID)]
    ContainerUid(String),

    #[error("failed to encode pod: {0}")]
    Json(#[from] serde_json::Error),
}

/// The result of running a pod through the injector.
#[derive(Clone, Debug, PartialEq)]
pub enum Injection {
    /// The pod is admitted unchanged.
    Skipped,
    Patched(json_patch::Patch),
}

/// Validates `pod` and computes the patch that injects it.
///
/// `ns` is the namespace the pod is being created in; its labels may enable
/// transparent proxying.
pub fn inject(config: &InjectConfig, pod: &Pod, ns: &Namespace) -> Result<Injection, Error> {
    validate(pod)?;

    let before = serde_json::to_value(pod)?;
    let mut pod = pod.clone();
    default_annotations(&mut pod)?;

    let namespace = ns.metadata.name.as_deref().unwrap_or_default();
    if !config.should_inject(&pod, namespace)? {
        return Ok(Injection::Skipped);
    }

    tracing::info!(pod = ?pod.metadata.name, %namespace, "Injecting pod");
    mutate(config, &mut pod, ns)?;

    let after = serde_json::to_value(&pod)?;
    Ok(Injection::Patched(json_patch::diff(&before, &after)))
}

/// Rejects pods relying on annotations that are no longer honored.
pub fn validate(pod: &Pod) -> Result<(), Error> {
    if annotation(pod, annotations::DEPRECATED_PROTOCOL).is_some() {
        return Err(Error::DeprecatedProtocol);
    }
    if annotation(pod, annotations::DEPRECATED_SYNC_PERIOD).is_some() {
        return Err(Error::DeprecatedSyncPeriod);
    }
    Ok(())
}

/// Records the submitted pod and fills in the service port when the pod
/// doesn't set one.
pub fn default_annotations(pod: &mut Pod) -> Result<(), Error> {
    let original = serde_json::to_string(&pod)?;

    let port = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref()?.first())
        .map(|p| match p.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => p.container_port.to_string(),
        });

    let pod_annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if let Some(port) = port {
        pod_annotations
            .entry(annotations::SERVICE_PORT.to_string())
            .or_insert(port);
    }
    pod_annotations.insert(annotations::ORIGINAL_POD.to_string(), original);
    Ok(())
}

fn mutate(config: &InjectConfig, pod: &mut Pod, ns: &Namespace) -> Result<(), Error> {
    let tproxy = config.transparent_proxy_enabled(pod, ns)?;
    let overwrite_probes = config.overwrite_probes_enabled(pod, ns)?;
    let metrics = config.metrics_enabled(pod)?;
    let scrape_port = config.prometheus_scrape_port(pod)?;
    let scrape_path = config.prometheus_scrape_path(pod).to_string();
    let mounts = annotation(pod, annotations::MOUNT_VOLUME)
        .map(|raw| raw.split(',').map(str::trim).map(String::from).collect::<Vec<_>>())
        .unwrap_or_default();

    let init = containers::init_container(config, ns, tproxy)?;
    let sidecar = containers::sidecar(config, pod, ns)?;

    let spec = pod.spec.get_or_insert_with(Default::default);
    spec.volumes
        .get_or_insert_with(Vec::new)
        .push(containers::volume());
    for c in spec.containers.iter_mut() {
        if mounts.contains(&c.name) {
            c.volume_mounts
                .get_or_insert_with(Vec::new)
                .push(containers::volume_mount());
        }
    }
    spec.init_containers.get_or_insert_with(Vec::new).push(init);
    spec.containers.push(sidecar);

    if overwrite_probes {
        probes::overwrite(&mut spec.containers);
    }

    let pod_annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    pod_annotations.insert(
        annotations::INJECT_STATUS.to_string(),
        annotations::INJECTED.to_string(),
    );
    if metrics {
        pod_annotations.insert(annotations::PROMETHEUS_SCRAPE.to_string(), "true".to_string());
        pod_annotations.insert(annotations::PROMETHEUS_PORT.to_string(), scrape_port);
        pod_annotations.insert(annotations::PROMETHEUS_PATH.to_string(), scrape_path);
    }
    if config.tenancy.enable_namespaces {
        let namespace = ns.metadata.name.as_deref().unwrap_or_default();
        pod_annotations.insert(
            annotations::CONSUL_NAMESPACE.to_string(),
            config.tenancy.consul_namespace(namespace),
        );
    }

    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(
        annotations::INJECT_STATUS.to_string(),
        annotations::INJECTED.to_string(),
    );
    labels.insert(
        annotations::MANAGED_BY.to_string(),
        annotations::MANAGED_BY_VALUE.to_string(),
    );

    Ok(())
}
