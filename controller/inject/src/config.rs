use crate::{annotations, Error};
use consul_controller_core::TenancyConfig;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use std::collections::{BTreeMap, BTreeSet};

/// Namespaces that are never injected.
const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Configures how pods are selected for injection and what gets injected.
#[derive(Clone, Debug)]
pub struct InjectConfig {
    pub dataplane_image: String,
    pub control_plane_image: String,

    /// Consul server addresses handed to the dataplane.
    pub consul_addresses: String,
    pub consul_grpc_port: u16,
    pub consul_http_port: u16,
    pub consul_api_timeout: String,
    pub tls_enabled: bool,

    /// When set, only annotated pods are injected.
    pub require_annotation: bool,
    pub allow_namespaces: BTreeSet<String>,
    pub deny_namespaces: BTreeSet<String>,

    pub tenancy: TenancyConfig,

    pub transparent_proxy: bool,
    pub overwrite_probes: bool,

    pub enable_metrics: bool,
    pub prometheus_scrape_port: u16,
    pub prometheus_scrape_path: String,

    pub envoy_concurrency: u32,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            dataplane_image: "hashicorp/consul-dataplane:1.5".to_string(),
            control_plane_image: "hashicorp/consul-k8s-control-plane:1.5".to_string(),
            consul_addresses: "consul-server.consul.svc".to_string(),
            consul_grpc_port: 8502,
            consul_http_port: 8500,
            consul_api_timeout: "5s".to_string(),
            tls_enabled: false,
            require_annotation: false,
            allow_namespaces: ["*".to_string()].into_iter().collect(),
            deny_namespaces: BTreeSet::new(),
            tenancy: TenancyConfig::default(),
            transparent_proxy: false,
            overwrite_probes: false,
            enable_metrics: false,
            prometheus_scrape_port: 20200,
            prometheus_scrape_path: "/metrics".to_string(),
            envoy_concurrency: 2,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl InjectConfig {
    pub fn should_inject(&self, pod: &Pod, namespace: &str) -> Result<bool, Error> {
        if SYSTEM_NAMESPACES.contains(&namespace) {
            return Ok(false);
        }

        if self.deny_namespaces.contains(namespace) {
            return Ok(false);
        }
        if !self.allow_namespaces.contains("*") && !self.allow_namespaces.contains(namespace) {
            return Ok(false);
        }

        if annotation(pod, annotations::INJECT_STATUS).is_some_and(|s| !s.is_empty()) {
            return Ok(false);
        }

        if let Some(raw) = annotation(pod, annotations::CONNECT_INJECT) {
            return parse_bool(annotations::CONNECT_INJECT, raw);
        }

        Ok(!self.require_annotation)
    }

    pub fn transparent_proxy_enabled(&self, pod: &Pod, ns: &Namespace) -> Result<bool, Error> {
        if let Some(raw) = annotation(pod, annotations::TRANSPARENT_PROXY) {
            return parse_bool(annotations::TRANSPARENT_PROXY, raw);
        }
        if let Some(raw) = label(ns, annotations::TRANSPARENT_PROXY) {
            return parse_bool(annotations::TRANSPARENT_PROXY, raw);
        }
        Ok(self.transparent_proxy)
    }

    /// Probes are only rewritten for pods whose traffic is redirected.
    pub fn overwrite_probes_enabled(&self, pod: &Pod, ns: &Namespace) -> Result<bool, Error> {
        if !self.transparent_proxy_enabled(pod, ns)? {
            return Ok(false);
        }
        if let Some(raw) = annotation(pod, annotations::OVERWRITE_PROBES) {
            return parse_bool(annotations::OVERWRITE_PROBES, raw);
        }
        Ok(self.overwrite_probes)
    }

    pub fn metrics_enabled(&self, pod: &Pod) -> Result<bool, Error> {
        match annotation(pod, annotations::ENABLE_METRICS) {
            Some(raw) if !raw.is_empty() => parse_bool(annotations::ENABLE_METRICS, raw),
            _ => Ok(self.enable_metrics),
        }
    }

    pub fn prometheus_scrape_port(&self, pod: &Pod) -> Result<String, Error> {
        match annotation(pod, annotations::PROMETHEUS_SCRAPE_PORT) {
            Some(raw) if !raw.is_empty() => match raw.parse::<u16>() {
                Ok(port) if port > 0 => Ok(port.to_string()),
                _ => Err(Error::InvalidPort {
                    key: annotations::PROMETHEUS_SCRAPE_PORT,
                    value: raw.to_string(),
                }),
            },
            _ => Ok(self.prometheus_scrape_port.to_string()),
        }
    }

    pub fn prometheus_scrape_path<'p>(&'p self, pod: &'p Pod) -> &'p str {
        match annotation(pod, annotations::PROMETHEUS_SCRAPE_PATH) {
            Some(raw) if !raw.is_empty() => raw,
            _ => &self.prometheus_scrape_path,
        }
    }

    pub fn envoy_concurrency(&self, pod: &Pod) -> Result<u32, Error> {
        match annotation(pod, annotations::ENVOY_CONCURRENCY) {
            Some(raw) => raw.parse().map_err(|_| Error::InvalidNumber {
                key: annotations::ENVOY_CONCURRENCY,
                value: raw.to_string(),
            }),
            None => Ok(self.envoy_concurrency),
        }
    }
}

pub(crate) fn annotation<'p>(pod: &'p Pod, key: &str) -> Option<&'p str> {
    lookup(pod.metadata.annotations.as_ref(), key)
}

fn label<'n>(ns: &'n Namespace, key: &str) -> Option<&'n str> {
    lookup(ns.metadata.labels.as_ref(), key)
}

fn lookup<'m>(map: Option<&'m BTreeMap<String, String>>, key: &str) -> Option<&'m str> {
    map.and_then(|m| m.get(key)).map(String::as_str)
}

/// Parses booleans the way Kubernetes tooling writes them.
pub(crate) fn parse_bool(key: &'static str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(Error::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}
