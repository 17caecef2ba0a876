//! Pod annotations and labels read or written by the injector.

/// Opts a pod in or out of injection.
pub const CONNECT_INJECT: &str = "consul.hashicorp.com/connect-inject";

/// Set on injected pods, both as an annotation and as a label.
pub const INJECT_STATUS: &str = "consul.hashicorp.com/connect-inject-status";
pub const INJECTED: &str = "injected";

pub const MANAGED_BY: &str = "consul.hashicorp.com/connect-inject-managed-by";
pub const MANAGED_BY_VALUE: &str = "consul-k8s-endpoints-controller";

/// The port the service listens on, defaulted from the first container port.
pub const SERVICE_PORT: &str = "consul.hashicorp.com/connect-service-port";

/// The pod as it was submitted, before any mutation.
pub const ORIGINAL_POD: &str = "consul.hashicorp.com/original-pod";

pub const CONSUL_NAMESPACE: &str = "consul.hashicorp.com/consul-namespace";

/// Comma-separated names of containers that also mount the shared volume.
pub const MOUNT_VOLUME: &str = "consul.hashicorp.com/connect-inject-mount-volume";

pub const ENVOY_CONCURRENCY: &str = "consul.hashicorp.com/consul-envoy-proxy-concurrency";

/// Read from pod annotations first, then namespace labels.
pub const TRANSPARENT_PROXY: &str = "consul.hashicorp.com/transparent-proxy";
pub const OVERWRITE_PROBES: &str = "consul.hashicorp.com/transparent-proxy-overwrite-probes";

pub const ENABLE_METRICS: &str = "consul.hashicorp.com/enable-metrics";
pub const PROMETHEUS_SCRAPE_PORT: &str = "consul.hashicorp.com/prometheus-scrape-port";
pub const PROMETHEUS_SCRAPE_PATH: &str = "consul.hashicorp.com/prometheus-scrape-path";

pub const PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH: &str = "prometheus.io/path";

// No longer honored; pods carrying them are rejected.
pub const DEPRECATED_PROTOCOL: &str = "consul.hashicorp.com/connect-service-protocol";
pub const DEPRECATED_SYNC_PERIOD: &str = "consul.hashicorp.com/connect-sync-period";
