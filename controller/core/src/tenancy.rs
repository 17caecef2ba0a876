use crate::{
    meta::{DEFAULT_NAMESPACE, DEFAULT_PARTITION, DEFAULT_PEER, WILDCARD_NAMESPACE},
    resource::Tenancy,
};

/// Describes how Kubernetes namespaces map onto Consul namespaces and
/// partitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenancyConfig {
    pub enable_namespaces: bool,
    /// Namespace all resources are written to when mirroring is disabled.
    pub destination_namespace: String,
    pub enable_mirroring: bool,
    pub mirroring_prefix: String,
    pub enable_partitions: bool,
    pub partition: String,
}

impl TenancyConfig {
    /// Maps a Kubernetes namespace to the Consul namespace it syncs into.
    ///
    /// Returns an empty string when Consul namespaces are disabled.
    pub fn consul_namespace(&self, kube_ns: &str) -> String {
        if !self.enable_namespaces {
            return String::new();
        }

        if self.enable_mirroring {
            return format!("{}{}", self.mirroring_prefix, kube_ns);
        }

        self.destination_namespace.clone()
    }

    /// Like [`Self::consul_namespace`], but never empty.
    pub fn resource_namespace(&self, kube_ns: &str) -> String {
        let ns = self.consul_namespace(kube_ns);
        if ns.is_empty() {
            return DEFAULT_NAMESPACE.to_string();
        }
        ns
    }

    pub fn consul_partition(&self) -> String {
        if !self.enable_partitions || self.partition.is_empty() {
            return DEFAULT_PARTITION.to_string();
        }
        self.partition.clone()
    }

    /// The partition passed to config-entry APIs, empty when partitions are
    /// disabled.
    pub fn entry_partition(&self) -> String {
        if self.enable_partitions {
            return self.partition.clone();
        }
        String::new()
    }

    pub fn resource_tenancy(&self, kube_ns: &str) -> Tenancy {
        Tenancy {
            namespace: self.resource_namespace(kube_ns),
            partition: self.consul_partition(),
            peer_name: DEFAULT_PEER.to_string(),
        }
    }

    /// Resolves the namespace a config entry is written to.
    ///
    /// `own_namespace` is a namespace carried by the entry itself, if any.
    /// Global entries are not mirrored and live in the default namespace.
    pub fn entry_namespace(&self, kube_ns: &str, own_namespace: &str, global: bool) -> String {
        if !self.enable_namespaces {
            return String::new();
        }

        if !own_namespace.is_empty() {
            return own_namespace.to_string();
        }

        if global {
            return DEFAULT_NAMESPACE.to_string();
        }
        if kube_ns == WILDCARD_NAMESPACE {
            return kube_ns.to_string();
        }

        self.consul_namespace(kube_ns)
    }

    /// Names must be unique across Kubernetes namespaces unless each
    /// Kubernetes namespace maps to its own Consul namespace.
    pub fn requires_unique_names(&self) -> bool {
        !(self.enable_namespaces && self.enable_mirroring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mirroring(prefix: &str) -> TenancyConfig {
        TenancyConfig {
            enable_namespaces: true,
            enable_mirroring: true,
            mirroring_prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(TenancyConfig::default(), "apps", "")]
    #[case(mirroring(""), "apps", "apps")]
    #[case(mirroring("k8s-"), "apps", "k8s-apps")]
    #[case(
        TenancyConfig {
            enable_namespaces: true,
            destination_namespace: "shared".to_string(),
            ..Default::default()
        },
        "apps",
        "shared"
    )]
    fn maps_namespaces(#[case] config: TenancyConfig, #[case] kube_ns: &str, #[case] expected: &str) {
        assert_eq!(config.consul_namespace(kube_ns), expected);
    }

    #[test]
    fn resource_tenancy_defaults() {
        let tenancy = TenancyConfig::default().resource_tenancy("apps");
        assert_eq!(tenancy.namespace, "default");
        assert_eq!(tenancy.partition, "default");
        assert_eq!(tenancy.peer_name, "local");
    }

    #[test]
    fn partition_requires_enablement() {
        let config = TenancyConfig {
            partition: "team-a".to_string(),
            ..Default::default()
        };
        assert_eq!(config.consul_partition(), "default");
        assert_eq!(config.entry_partition(), "");

        let config = TenancyConfig {
            enable_partitions: true,
            ..config
        };
        assert_eq!(config.consul_partition(), "team-a");
        assert_eq!(config.entry_partition(), "team-a");
    }

    #[test]
    fn entry_namespace_resolution() {
        let config = TenancyConfig {
            enable_namespaces: true,
            destination_namespace: "shared".to_string(),
            ..mirroring("k8s-")
        };
        assert_eq!(config.entry_namespace("apps", "", false), "k8s-apps");
        assert_eq!(config.entry_namespace("apps", "billing", false), "billing");
        assert_eq!(config.entry_namespace("apps", "", true), "default");
        assert_eq!(config.entry_namespace("apps", "*", false), "*");
        assert_eq!(config.entry_namespace("*", "", false), "*");
        assert_eq!(config.entry_namespace("*", "", true), "default");
        assert_eq!(
            TenancyConfig::default().entry_namespace("apps", "billing", false),
            ""
        );
    }

    #[test]
    fn uniqueness_only_without_mirroring() {
        assert!(TenancyConfig::default().requires_unique_names());
        assert!(!mirroring("").requires_unique_names());
    }
}
