use crate::{Error, InjectConfig};
use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, Namespace,
        ObjectFieldSelector, Pod, Probe, SeccompProfile, SecurityContext, TCPSocketAction,
        Volume, VolumeMount,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};

pub const VOLUME_NAME: &str = "consul-connect-inject-data";
pub const VOLUME_PATH: &str = "/consul/connect-inject";
pub const INIT_CONTAINER: &str = "consul-connect-inject-init";
pub const SIDECAR_CONTAINER: &str = "consul-dataplane";

/// The user and group the dataplane runs as.
pub const SIDECAR_UID: i64 = 5995;
/// The user the init container runs as when traffic is not redirected.
pub const INIT_UID: i64 = 5996;

/// Envoy's inbound listener, probed for sidecar readiness.
pub const PROXY_INBOUND_PORT: u16 = 20000;
const PROXY_OUTBOUND_PORT: u16 = 15001;

pub(crate) fn volume() -> Volume {
    Volume {
        name: VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn volume_mount() -> VolumeMount {
    VolumeMount {
        name: VOLUME_NAME.to_string(),
        mount_path: VOLUME_PATH.to_string(),
        ..Default::default()
    }
}

pub(crate) fn init_container(
    config: &InjectConfig,
    ns: &Namespace,
    tproxy: bool,
) -> Result<Container, Error> {
    let namespace = ns.metadata.name.as_deref().unwrap_or_default();

    let mut vars = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        field_env("NODE_NAME", "spec.nodeName"),
        env("CONSUL_ADDRESSES", &config.consul_addresses),
        env("CONSUL_GRPC_PORT", &config.consul_grpc_port.to_string()),
        env("CONSUL_HTTP_PORT", &config.consul_http_port.to_string()),
        env("CONSUL_API_TIMEOUT", &config.consul_api_timeout),
        env("CONSUL_NODE_NAME", "$(NODE_NAME)-virtual"),
    ];
    if config.tenancy.enable_namespaces {
        vars.push(env_var(
            "CONSUL_NAMESPACE",
            config.tenancy.consul_namespace(namespace),
        ));
    }
    if config.tenancy.enable_partitions {
        vars.push(env("CONSUL_PARTITION", &config.tenancy.partition));
    }

    let security_context = if tproxy {
        vars.push(env_var(
            "CONSUL_REDIRECT_TRAFFIC_CONFIG",
            redirect_traffic_config()?,
        ));
        SecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            run_as_non_root: Some(false),
            privileged: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: None,
            }),
            ..Default::default()
        }
    } else {
        SecurityContext {
            run_as_user: Some(INIT_UID),
            run_as_group: Some(INIT_UID),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(false),
            capabilities: Some(drop_all()),
            seccomp_profile: Some(runtime_default()),
            ..Default::default()
        }
    };

    let command = format!(
        "consul-k8s-control-plane connect-init -pod-name=${{POD_NAME}} -pod-namespace=${{POD_NAMESPACE}} \\\n  -log-level={} \\\n  -log-json={}\n",
        config.log_level, config.log_json,
    );

    Ok(Container {
        name: INIT_CONTAINER.to_string(),
        image: Some(config.control_plane_image.clone()),
        env: Some(vars),
        volume_mounts: Some(vec![volume_mount()]),
        command: Some(vec!["/bin/sh".to_string(), "-ec".to_string(), command]),
        security_context: Some(security_context),
        ..Default::default()
    })
}

/// Builds the `consul-dataplane` container.
///
/// Fails if the pod or one of its containers already claims the dataplane's
/// UID, since traffic redirection keys on it.
pub(crate) fn sidecar(config: &InjectConfig, pod: &Pod, ns: &Namespace) -> Result<Container, Error> {
    let spec = pod.spec.as_ref();
    if spec
        .and_then(|s| s.security_context.as_ref())
        .and_then(|sc| sc.run_as_user)
        == Some(SIDECAR_UID)
    {
        return Err(Error::PodUid);
    }
    for c in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
        let uid = c.security_context.as_ref().and_then(|sc| sc.run_as_user);
        if uid == Some(SIDECAR_UID) && c.image.as_ref() != Some(&config.dataplane_image) {
            return Err(Error::ContainerUid(c.name.clone()));
        }
    }

    let namespace = ns.metadata.name.as_deref().unwrap_or_default();
    let mut args = vec![
        "-addresses".to_string(),
        config.consul_addresses.clone(),
        "-envoy-admin-bind-address=127.0.0.1".to_string(),
        "-consul-dns-bind-addr=127.0.0.1".to_string(),
        "-xds-bind-addr=127.0.0.1".to_string(),
        format!("-grpc-port={}", config.consul_grpc_port),
        format!("-proxy-service-id-path={VOLUME_PATH}/proxyid"),
        format!("-log-level={}", config.log_level),
        format!("-log-json={}", config.log_json),
        format!("-envoy-concurrency={}", config.envoy_concurrency(pod)?),
        "-graceful-addr=127.0.0.1".to_string(),
    ];
    if config.tenancy.enable_namespaces {
        args.push(format!(
            "-service-namespace={}",
            config.tenancy.consul_namespace(namespace)
        ));
    }
    if config.tenancy.enable_partitions {
        args.push(format!("-service-partition={}", config.tenancy.partition));
    }
    if !config.tls_enabled {
        args.push("-tls-disabled".to_string());
    }

    let vars = vec![
        env("TMPDIR", VOLUME_PATH),
        field_env("NODE_NAME", "spec.nodeName"),
        env("DP_SERVICE_NODE_NAME", "$(NODE_NAME)-virtual"),
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        field_env("POD_UID", "metadata.uid"),
        env("DP_CREDENTIAL_LOGIN_META", "pod=$(POD_NAMESPACE)/$(POD_NAME)"),
        env("DP_CREDENTIAL_LOGIN_META1", "pod=$(POD_NAMESPACE)/$(POD_NAME)"),
        env("DP_CREDENTIAL_LOGIN_META2", "pod-uid=$(POD_UID)"),
        field_env("HOST_IP", "status.hostIP"),
    ];

    Ok(Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(config.dataplane_image.clone()),
        args: Some(args),
        env: Some(vars),
        volume_mounts: Some(vec![volume_mount()]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(PROXY_INBOUND_PORT.into()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(1),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_user: Some(SIDECAR_UID),
            run_as_group: Some(SIDECAR_UID),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            capabilities: Some(drop_all()),
            seccomp_profile: Some(runtime_default()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Redirection rules consumed by the init container when it programs
/// iptables.
fn redirect_traffic_config() -> Result<String, Error> {
    let config = serde_json::json!({
        "ProxyUserID": SIDECAR_UID.to_string(),
        "ProxyInboundPort": PROXY_INBOUND_PORT,
        "ProxyOutboundPort": PROXY_OUTBOUND_PORT,
        "ExcludeUIDs": [INIT_UID.to_string()],
    });
    Ok(serde_json::to_string(&config)?)
}

fn env(name: &str, value: &str) -> EnvVar {
    env_var(name, value.to_string())
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

fn drop_all() -> Capabilities {
    Capabilities {
        add: None,
        drop: Some(vec!["ALL".to_string()]),
    }
}

fn runtime_default() -> SeccompProfile {
    SeccompProfile {
        type_: "RuntimeDefault".to_string(),
        localhost_profile: None,
    }
}
