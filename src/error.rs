//! Error types for roomgate, one enum per concern.

pub use crate::runtime::RuntimeError;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Allocation store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// A unique key or compare-and-set guard rejected the write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Reverse-proxy errors (route fragments and reload signalling).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to write route fragment for {route}: {source}")]
    Write {
        route: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove route fragment for {route}: {source}")]
    Remove {
        route: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy reload failed: {reason}")]
    ReloadFailed { reason: String },
}

/// Container lifecycle errors (launch / remove).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid route name {route:?}: {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("Route {route} is already in use")]
    RouteTaken { route: String },

    #[error("Container {container_id} not found")]
    NotFound { container_id: String },

    #[error("Container {container_id}: {source}")]
    Runtime {
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Container {container_id} cannot move from {from} to {to}")]
    InvalidTransition {
        container_id: String,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Session allocation errors.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Invalid session id: {reason}")]
    InvalidSession { reason: String },

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to start HTTP server on {addr}: {reason}")]
    StartupFailed { addr: String, reason: String },
}
