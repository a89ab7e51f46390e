//! Service definitions and the catalog the worker instantiates them from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, WorkerError};
use crate::identity::{ServiceIdentity, Uid};
use crate::ipc::Endpoint;

/// Who may call `killService` on a worker's control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillAccess {
    /// Only the package owner, unless `allow_others` is set.
    #[default]
    HostOnly,
    /// Any caller.
    Anyone,
}

/// Access and lifetime policy declared by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Skip caller authentication on the service endpoint and on `bindToken`.
    pub allow_others: bool,
    /// Ignore client death, `killService` and the kill sent on deactivation.
    pub keep_alive: bool,
    pub kill_access: KillAccess,
}

impl AccessPolicy {
    /// Whether a caller running as `caller` may kill a worker owned by `host`.
    pub fn may_kill(&self, caller: Uid, host: Uid) -> bool {
        match self.kill_access {
            KillAccess::Anyone => true,
            KillAccess::HostOnly => self.allow_others || caller == host,
        }
    }
}

/// A service that runs in a worker process under another identity.
///
/// The same definition is read on both sides: the client proxy uses the
/// descriptor, target uid and policy to spawn and bind, the worker uses them
/// to publish and guard the implementation.
pub trait RootService: Send + Sync {
    /// Interface descriptor, e.g. `com.example.ICalculator`.
    fn descriptor(&self) -> &str;

    fn identity(&self) -> Result<ServiceIdentity, IdentityError> {
        ServiceIdentity::new(self.descriptor())
    }

    /// Uid the worker is spawned as.
    fn target_uid(&self) -> Uid {
        Uid::ROOT
    }

    fn policy(&self) -> AccessPolicy {
        AccessPolicy::default()
    }

    /// The endpoint published under the service key, usually a generated stub.
    fn implementation(&self) -> Arc<dyn Endpoint>;

    /// Implementation usable without activation, when the caller already
    /// runs inside the worker process.
    fn local(&self) -> Option<Arc<dyn Endpoint>> {
        None
    }
}

pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn RootService> + Send + Sync>;

/// Worker class name to service factory.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn RootService> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Arc::new(factory));
    }

    pub fn with_service<F>(mut self, class: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RootService> + Send + Sync + 'static,
    {
        self.register(class, factory);
        self
    }

    pub fn instantiate(&self, class: &str) -> Result<Arc<dyn RootService>, WorkerError> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| WorkerError::UnknownService {
                class: class.to_string(),
            })?;
        Ok(factory())
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

impl fmt::Debug for ServiceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCatalog")
            .field("classes", &self.classes())
            .finish()
    }
}
