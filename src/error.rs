//! Error types for the service proxy.

use crate::identity::{CallerIdentity, Uid};

/// Errors surfaced to the code activating a proxied service.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Service {service} did not become available after {attempts} discovery attempts")]
    ServiceUnavailable { service: String, attempts: u32 },

    #[error("Worker for {service} rejected the liveness bind: {reason}")]
    BindRejected { service: String, reason: String },

    #[error("Caller not authorized for {service}: {reason}")]
    Unauthorized { service: String, reason: String },

    #[error("Failed to spawn worker for {service}: {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: SpawnError,
    },

    #[error("Remote call on {service} failed: {source}")]
    RemoteFailure {
        service: String,
        #[source]
        source: CallError,
    },
}

impl ProxyError {
    /// Classify a failed forwarded call.
    pub fn from_call(service: impl Into<String>, err: CallError) -> Self {
        let service = service.into();
        match err {
            CallError::Unauthorized { .. } => Self::Unauthorized {
                service,
                reason: err.to_string(),
            },
            other => Self::RemoteFailure {
                service,
                source: other,
            },
        }
    }
}

/// Failure of a single call delivered to an endpoint.
///
/// Per-call failures never affect the lifecycle of the worker that produced
/// them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Caller {caller} is not permitted (expected uid {expected})")]
    Unauthorized {
        caller: CallerIdentity,
        expected: Uid,
    },

    #[error("Unknown method '{method}' on {descriptor}")]
    UnknownMethod { descriptor: String, method: String },

    #[error("Invalid arguments for '{method}': {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("Invalid reply from '{method}': {reason}")]
    InvalidReply { method: String, reason: String },

    #[error("Endpoint {descriptor} is dead (owning process exited)")]
    DeadObject { descriptor: String },

    #[error("{message}")]
    Remote { message: String },
}

impl CallError {
    /// Construct an implementation-level failure passed back verbatim.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}

/// Registry write errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Key '{key}' is already published by a live endpoint")]
    AlreadyPublished { key: String },

    #[error("Registry client for pid {pid} is no longer alive")]
    ClientDead { pid: u32 },
}

/// Privilege spawner errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to launch '{program}': {reason}")]
    Launch { program: String, reason: String },

    #[error("Invalid spawn request: {reason}")]
    InvalidRequest { reason: String },
}

/// Package/identity directory errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Package not found: {package}")]
    PackageNotFound { package: String },

    #[error("Directory lookup for {package} failed: {reason}")]
    Lookup { package: String, reason: String },
}

/// Worker startup errors. Any of these ends the worker with a non-zero exit.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No service class named '{class}' is registered")]
    UnknownService { class: String },

    #[error("Could not resolve owner of package: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Failed to publish endpoint: {0}")]
    Publish(#[from] RegistryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// A service descriptor that cannot be used as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Service descriptor is empty")]
    Empty,

    #[error("Service descriptor '{0}' ends with the reserved control suffix")]
    ReservedSuffix(String),

    #[error("Service descriptor '{0}' contains whitespace")]
    Whitespace(String),
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
