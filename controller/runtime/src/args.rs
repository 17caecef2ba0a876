use crate::{
    admission::Admission,
    consul::ConsulClient,
    controllers::{self, Context},
    lease,
    metrics::ReconcileMetrics,
};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use consul_controller_core::TenancyConfig;
use consul_controller_inject::InjectConfig;
use consul_controller_k8s_sync::{retry::RetryPolicy, EntryContext};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "consul-controller",
    about = "Syncs Consul custom resources and injects mesh pods"
)]
pub struct Args {
    #[clap(long, default_value = "consul=info,warn", env = "CONSUL_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The local Consul datacenter, recorded on every config entry written.
    #[clap(long, default_value = "dc1", env = "CONSUL_DATACENTER")]
    datacenter: String,

    /// Plaintext HTTP address of a Consul agent or server.
    #[clap(long, default_value = "http://127.0.0.1:8500", env = "CONSUL_HTTP_ADDR")]
    consul_http_addr: String,

    #[clap(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_http_token: Option<String>,

    /// Also syncs resources through Consul's resource API.
    #[clap(long)]
    enable_resource_apis: bool,

    #[clap(flatten)]
    tenancy: TenancyArgs,

    #[clap(flatten)]
    inject: InjectArgs,

    #[clap(long, default_value = "consul-connect-injector")]
    controller_deployment_name: String,

    #[clap(long, default_value = "consul", env = "POD_NAMESPACE")]
    controller_namespace: String,
}

#[derive(Debug, clap::Args)]
struct TenancyArgs {
    /// Syncs into Consul Enterprise namespaces.
    #[clap(long)]
    enable_namespaces: bool,

    /// The Consul namespace objects sync into when mirroring is disabled.
    #[clap(long, default_value = "default")]
    consul_destination_namespace: String,

    /// Maps each Kubernetes namespace to a Consul namespace of the same name.
    #[clap(long)]
    enable_k8s_namespace_mirroring: bool,

    #[clap(long, default_value = "")]
    k8s_namespace_mirroring_prefix: String,

    #[clap(long)]
    enable_partitions: bool,

    #[clap(long, default_value = "default")]
    partition: String,

    /// ACL policy attached to namespaces created by the controller.
    #[clap(long)]
    consul_cross_namespace_acl_policy: Option<String>,
}

#[derive(Debug, clap::Args)]
struct InjectArgs {
    /// Disables the pod injection webhook.
    #[clap(long)]
    inject_disabled: bool,

    #[clap(long, default_value = "hashicorp/consul-dataplane:1.5")]
    consul_dataplane_image: String,

    #[clap(long, default_value = "hashicorp/consul-k8s-control-plane:1.5")]
    consul_k8s_image: String,

    /// Consul server addresses handed to injected dataplanes.
    #[clap(long, default_value = "consul-server.consul.svc")]
    consul_addresses: String,

    #[clap(long, default_value = "8502")]
    consul_grpc_port: u16,

    #[clap(long, default_value = "8500")]
    consul_http_port: u16,

    #[clap(long, default_value = "5s")]
    consul_api_timeout: String,

    #[clap(long)]
    consul_tls_enabled: bool,

    /// Injects pods that carry no `connect-inject` annotation.
    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    default_inject: bool,

    #[clap(long, value_delimiter = ',', default_value = "*")]
    allow_k8s_namespace: Vec<String>,

    #[clap(long, value_delimiter = ',')]
    deny_k8s_namespace: Vec<String>,

    #[clap(long)]
    default_enable_transparent_proxy: bool,

    #[clap(long)]
    default_overwrite_probes: bool,

    #[clap(long)]
    default_enable_metrics: bool,

    #[clap(long, default_value = "20200")]
    default_prometheus_scrape_port: u16,

    #[clap(long, default_value = "/metrics")]
    default_prometheus_scrape_path: String,

    #[clap(long, default_value = "2")]
    default_envoy_proxy_concurrency: u32,

    /// Log level of injected containers.
    #[clap(long, default_value = "info")]
    dataplane_log_level: String,

    #[clap(long)]
    dataplane_log_json: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            datacenter,
            consul_http_addr,
            consul_http_token,
            enable_resource_apis,
            tenancy,
            inject,
            controller_deployment_name,
            controller_namespace,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let cross_namespace_policy = tenancy.consul_cross_namespace_acl_policy.clone();
        let tenancy = tenancy.into_config();
        let inject = inject.into_config(&tenancy);

        let consul = ConsulClient::new(&consul_http_addr, consul_http_token.as_deref())?;

        let mut prom = <Registry>::default();
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME").context("HOSTNAME must be set")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        let ctx = Arc::new(Context {
            client: runtime.client(),
            consul,
            entries: EntryContext {
                datacenter,
                tenancy: tenancy.clone(),
                cross_namespace_policy,
            },
            retry: RetryPolicy::default(),
            metrics,
            claims,
            hostname,
        });
        tokio::spawn(
            controllers::spawn(ctx, enable_resource_apis).instrument(info_span!("controllers")),
        );

        let admission = Admission::new(runtime.client(), tenancy, inject);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

// === impl TenancyArgs ===

impl TenancyArgs {
    fn into_config(self) -> TenancyConfig {
        TenancyConfig {
            enable_namespaces: self.enable_namespaces,
            destination_namespace: self.consul_destination_namespace,
            enable_mirroring: self.enable_k8s_namespace_mirroring,
            mirroring_prefix: self.k8s_namespace_mirroring_prefix,
            enable_partitions: self.enable_partitions,
            partition: self.partition,
        }
    }
}

// === impl InjectArgs ===

impl InjectArgs {
    /// Returns `None` when injection is disabled.
    fn into_config(self, tenancy: &TenancyConfig) -> Option<InjectConfig> {
        if self.inject_disabled {
            return None;
        }

        Some(InjectConfig {
            dataplane_image: self.consul_dataplane_image,
            control_plane_image: self.consul_k8s_image,
            consul_addresses: self.consul_addresses,
            consul_grpc_port: self.consul_grpc_port,
            consul_http_port: self.consul_http_port,
            consul_api_timeout: self.consul_api_timeout,
            tls_enabled: self.consul_tls_enabled,
            require_annotation: !self.default_inject,
            allow_namespaces: self.allow_k8s_namespace.into_iter().collect(),
            deny_namespaces: self.deny_k8s_namespace.into_iter().collect(),
            tenancy: tenancy.clone(),
            transparent_proxy: self.default_enable_transparent_proxy,
            overwrite_probes: self.default_overwrite_probes,
            enable_metrics: self.default_enable_metrics,
            prometheus_scrape_port: self.default_prometheus_scrape_port,
            prometheus_scrape_path: self.default_prometheus_scrape_path,
            envoy_concurrency: self.default_envoy_proxy_concurrency,
            log_level: self.dataplane_log_level,
            log_json: self.dataplane_log_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("consul-controller").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn tenancy_flags() {
        let args = parse(&[
            "--enable-namespaces",
            "--enable-k8s-namespace-mirroring",
            "--k8s-namespace-mirroring-prefix=k8s-",
            "--enable-partitions",
            "--partition=team-a",
        ]);
        assert_eq!(
            args.tenancy.into_config(),
            TenancyConfig {
                enable_namespaces: true,
                destination_namespace: "default".to_string(),
                enable_mirroring: true,
                mirroring_prefix: "k8s-".to_string(),
                enable_partitions: true,
                partition: "team-a".to_string(),
            }
        );
    }

    #[test]
    fn inject_defaults() {
        let args = parse(&[]);
        let tenancy = args.tenancy.into_config();
        let config = args.inject.into_config(&tenancy).unwrap();
        assert!(!config.require_annotation);
        assert_eq!(config.allow_namespaces, ["*".to_string()].into_iter().collect());
        assert!(config.deny_namespaces.is_empty());
        assert_eq!(config.envoy_concurrency, 2);
    }

    #[test]
    fn inject_flags() {
        let args = parse(&[
            "--default-inject=false",
            "--allow-k8s-namespace=apps,web",
            "--deny-k8s-namespace=web",
            "--default-enable-transparent-proxy",
        ]);
        let config = args.inject.into_config(&TenancyConfig::default()).unwrap();
        assert!(config.require_annotation);
        assert_eq!(
            config.allow_namespaces,
            ["apps".to_string(), "web".to_string()].into_iter().collect()
        );
        assert_eq!(config.deny_namespaces, ["web".to_string()].into_iter().collect());
        assert!(config.transparent_proxy);

        let args = parse(&["--inject-disabled"]);
        assert!(args.inject.into_config(&TenancyConfig::default()).is_none());
    }
}
