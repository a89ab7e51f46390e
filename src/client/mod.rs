//! Client side: activate a service in its worker and hand back a handle.
//!
//! ```text
//! activate()
//!   │
//!   ├─ lookup <name>.Control ── found ───────────────┐
//!   │                                                │
//!   └─ absent ─▶ spawn (once) ─▶ settle ─▶ poll ×N ──┤
//!                                                    ▼
//!                                    bindToken(liveness token)
//!                                                    │
//!                                                    ▼
//!                                     lookup <name> ─▶ ForwardingHandle
//! ```

mod discovery;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, watch};

use crate::client::discovery::{BoundWorker, Discovery};
use crate::config::{DiscoveryConfig, ProxyConfig};
use crate::error::{IdentityError, ProxyError};
use crate::identity::ServiceIdentity;
use crate::ipc::{Channel, LocalChannel, Transaction};
use crate::registry::{ForwardingHandle, ServiceRegistry};
use crate::service::{AccessPolicy, RootService};
use crate::spawner::{PrivilegeSpawner, SpawnRequest};
use crate::worker::ControlProxy;

/// Where a client is in its activation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientBindingState {
    Idle = 0,
    Discovering = 1,
    Spawning = 2,
    Binding = 3,
    Active = 4,
    Unbound = 5,
}

impl ClientBindingState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Discovering,
            2 => Self::Spawning,
            3 => Self::Binding,
            4 => Self::Active,
            _ => Self::Unbound,
        }
    }

    pub fn can_transition_to(self, next: ClientBindingState) -> bool {
        use ClientBindingState::*;
        matches!(
            (self, next),
            (Idle | Unbound, Discovering)
                | (Discovering, Spawning)
                | (Discovering | Spawning, Binding)
                | (Binding, Active)
                | (Discovering | Spawning | Binding | Active, Unbound)
        )
    }
}

pub(crate) struct BindingStateCell {
    state: AtomicU8,
}

impl BindingStateCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ClientBindingState::Idle as u8),
        }
    }

    pub(crate) fn get(&self) -> ClientBindingState {
        ClientBindingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, next: ClientBindingState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ClientBindingState::from_u8(current);
            if !from.can_transition_to(next) {
                tracing::debug!(from = ?from, to = ?next, "Ignoring illegal binding transition");
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Client proxy for one service.
///
/// Activations are serialized: a second `activate()` while `Active` gets
/// the cached handle, a concurrent one waits and then gets it too.
pub struct ServiceProxy {
    service: Arc<dyn RootService>,
    identity: ServiceIdentity,
    class: String,
    package: String,
    registry: Arc<dyn ServiceRegistry>,
    spawner: Arc<dyn PrivilegeSpawner>,
    discovery: DiscoveryConfig,
    entry_point: String,
    state: Arc<BindingStateCell>,
    session: Mutex<Option<BoundWorker>>,
    cancel: std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl ServiceProxy {
    /// `class` is the catalog name the worker instantiates; `package` the
    /// client package whose owner the worker authenticates against.
    pub fn new(
        service: Arc<dyn RootService>,
        class: impl Into<String>,
        package: impl Into<String>,
        registry: Arc<dyn ServiceRegistry>,
        spawner: Arc<dyn PrivilegeSpawner>,
    ) -> Result<Self, IdentityError> {
        let identity = service.identity()?;
        Ok(Self {
            service,
            identity,
            class: class.into(),
            package: package.into(),
            registry,
            spawner,
            discovery: DiscoveryConfig::default(),
            entry_point: "worker".to_string(),
            state: Arc::new(BindingStateCell::new()),
            session: Mutex::new(None),
            cancel: std::sync::Mutex::new(None),
        })
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_config(mut self, config: &ProxyConfig) -> Self {
        self.discovery = config.discovery.clone();
        self.entry_point = config.spawner.worker_subcommand.clone();
        self
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn policy(&self) -> AccessPolicy {
        self.service.policy()
    }

    pub fn state(&self) -> ClientBindingState {
        self.state.get()
    }

    /// Control endpoint of the bound worker.
    pub async fn control(&self) -> Option<ControlProxy> {
        self.session.lock().await.as_ref().map(|b| b.control.clone())
    }

    /// Direct channel to the implementation when running inside the worker
    /// itself. No activation involved.
    pub fn local_handle(&self) -> Option<Arc<dyn Channel>> {
        let endpoint = self.service.local()?;
        let caller = self.registry.credentials().caller();
        Some(Arc::new(LocalChannel::new(endpoint, caller)))
    }

    fn spawn_request(&self) -> SpawnRequest {
        SpawnRequest {
            target_uid: self.service.target_uid(),
            entry_point: self.entry_point.clone(),
            package: self.package.clone(),
            service_class: self.class.clone(),
        }
    }

    fn set_cancel(&self, sender: Option<watch::Sender<bool>>) {
        match self.cancel.lock() {
            Ok(mut slot) => *slot = sender,
            Err(poisoned) => *poisoned.into_inner() = sender,
        }
    }

    fn take_cancel(&self) -> Option<watch::Sender<bool>> {
        match self.cancel.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub async fn activate(&self) -> Result<ForwardingHandle, ProxyError> {
        let mut session = self.session.lock().await;

        if let Some(bound) = session.as_ref() {
            if bound.service.is_alive() {
                return Ok(bound.service.clone());
            }
            tracing::warn!(service = %self.identity, "Bound worker is gone, rediscovering");
            *session = None;
            self.state.transition(ClientBindingState::Unbound);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.set_cancel(Some(cancel_tx));

        let discovery = Discovery {
            identity: self.identity.clone(),
            registry: Arc::clone(&self.registry),
            spawner: Arc::clone(&self.spawner),
            request: self.spawn_request(),
            config: self.discovery.clone(),
            state: Arc::clone(&self.state),
        };
        let result = match tokio::spawn(discovery.run(cancel_rx)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(service = %self.identity, error = %e, "Discovery task failed");
                Err(ProxyError::ServiceUnavailable {
                    service: self.identity.to_string(),
                    attempts: 0,
                })
            }
        };
        self.set_cancel(None);

        match result {
            Ok(bound) => {
                let handle = bound.service.clone();
                self.state.transition(ClientBindingState::Active);
                tracing::info!(
                    service = %self.identity,
                    worker_pid = %handle.publisher().pid(),
                    worker_uid = %handle.publisher().uid(),
                    "Service activated"
                );
                *session = Some(bound);
                Ok(handle)
            }
            Err(e) => {
                self.state.transition(ClientBindingState::Unbound);
                tracing::warn!(service = %self.identity, error = %e, "Activation failed");
                Err(e)
            }
        }
    }

    /// Tear down the binding. Never fails.
    pub async fn deactivate(&self) {
        if let Some(cancel) = self.take_cancel() {
            let _ = cancel.send(true);
        }

        let mut session = self.session.lock().await;
        let Some(bound) = session.take() else {
            return;
        };

        if !self.service.policy().keep_alive
            && let Err(e) = bound.control.kill_service().await
        {
            tracing::warn!(
                service = %self.identity,
                error = %e,
                "killService failed, worker may already be gone"
            );
        }
        bound.token.release();
        self.state.transition(ClientBindingState::Unbound);
        tracing::info!(service = %self.identity, "Service deactivated");
    }

    /// Lifecycle adapter: `None` means the service is unavailable.
    pub async fn on_activate(&self) -> Option<ForwardingHandle> {
        self.activate().await.ok()
    }

    pub async fn on_deactivate(&self) {
        self.deactivate().await;
    }

    /// Forward one untyped call through the active binding.
    pub async fn invoke(&self, txn: Transaction) -> Result<Value, ProxyError> {
        let handle = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|b| b.service.clone())
            .ok_or_else(|| ProxyError::ServiceUnavailable {
                service: self.identity.to_string(),
                attempts: 0,
            })?;
        handle
            .call(txn)
            .await
            .map_err(|e| ProxyError::from_call(self.identity.name(), e))
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.identity.name())
            .field("class", &self.class)
            .field("package", &self.package)
            .field("state", &self.state())
            .finish()
    }
}
