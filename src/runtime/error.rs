//! Error types for the container runtime adapter.

/// Errors surfaced by a [`ContainerRuntime`](super::ContainerRuntime).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// The engine has no container with this id.
    #[error("Container {id} not found")]
    NotFound { id: String },

    /// The engine could not be reached at all.
    #[error("Container engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// The engine answered but refused the request.
    #[error("Container engine error: {reason}")]
    Engine { reason: String },

    /// The container started without a host binding for the workload port.
    #[error("Container {id} has no host port bound for {port}/tcp")]
    MissingPort { id: String, port: u16 },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classify a bollard error, keeping 404s distinct from transport failures.
    pub fn from_docker(id: &str, err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound { id: id.to_string() },
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => Self::Engine {
                reason: format!("{} ({})", message, status_code),
            },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
