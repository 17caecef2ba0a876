use thiserror::Error;

/// Errors returned by the Consul APIs.
///
/// Not-found conditions are distinguished so that reconcilers can decide
/// whether to create, requeue, or fail.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The requested object does not exist.
    #[error("not found")]
    NotFound,

    /// The Consul namespace the object lives in does not exist yet.
    #[error("consul namespace {0:?} not found")]
    NamespaceNotFound(String),

    /// Consul answered with an unexpected status.
    #[error("unexpected response from consul ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode consul response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("consul request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, Self::NamespaceNotFound(_))
    }

    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Transport(error.into())
    }
}
