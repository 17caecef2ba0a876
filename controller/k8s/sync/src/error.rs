use consul_controller_core::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Consul(#[from] RemoteError),

    /// A Consul call failed while performing `action`.
    #[error("{action}: {source}")]
    ConsulAction {
        action: String,
        #[source]
        source: RemoteError,
    },

    #[error("adding finalizer: {0}")]
    AddFinalizer(#[source] kube::Error),

    #[error("resource already exists in Consul")]
    ResourceExists,

    #[error("config entry already exists in Consul")]
    EntryExists,

    #[error("config entry managed in different datacenter: {0:?}")]
    OtherDatacenter(String),

    #[error("migration failed: Kubernetes resource does not match existing Consul config entry: consul={consul}, kube={kube}")]
    MigrationMismatch { consul: String, kube: String },

    #[error("PeeringAcceptor backend cannot be changed")]
    BackendChanged,

    #[error("PeeringDialer spec.peer.secret does not exist")]
    MissingSecret,

    #[error("invalid peering version: {0}")]
    PeeringVersion(#[from] std::num::ParseIntError),
}

impl Error {
    pub(crate) fn consul(action: impl Into<String>, source: RemoteError) -> Self {
        Self::ConsulAction {
            action: action.into(),
            source,
        }
    }
}
