//! Host-wide name registry.
//!
//! Processes never touch the registry map directly. Each one is handed a
//! client bound to its [`ProcessCredentials`]; everything the client
//! publishes is owned by that process and disappears with it, and every
//! handle it looks up stamps calls with that process's identity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{CallError, RegistryError};
use crate::identity::{CallerIdentity, ProcessCredentials};
use crate::ipc::{CallContext, Channel, Endpoint, Transaction};
use crate::liveness::LivenessToken;

/// Registry capability injected into clients and workers.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Credentials this registry client speaks with.
    fn credentials(&self) -> &ProcessCredentials;

    /// Publish an endpoint under `key`.
    ///
    /// First writer wins: fails if a live entry already holds the key.
    async fn publish(&self, key: &str, endpoint: Arc<dyn Endpoint>) -> Result<(), RegistryError>;

    /// Look up a live endpoint. Absence may be transient.
    async fn lookup(&self, key: &str) -> Option<ForwardingHandle>;
}

struct Entry {
    endpoint: Arc<dyn Endpoint>,
    owner: LivenessToken,
    publisher: CallerIdentity,
}

/// In-memory registry shared by every simulated process on a host.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a client for one process.
    pub fn connect(&self, credentials: ProcessCredentials) -> RegistryClient {
        RegistryClient {
            registry: self.clone(),
            credentials,
        }
    }

    /// Keys currently held by live entries. Dead entries are dropped on the
    /// way.
    pub async fn live_keys(&self) -> Vec<String> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.owner.is_alive());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn insert(
        &self,
        key: &str,
        endpoint: Arc<dyn Endpoint>,
        credentials: &ProcessCredentials,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.owner.is_alive());
        if entries.contains_key(key) {
            return Err(RegistryError::AlreadyPublished {
                key: key.to_string(),
            });
        }
        entries.insert(
            key.to_string(),
            Entry {
                endpoint,
                owner: credentials.liveness.clone(),
                publisher: credentials.caller(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str, caller: CallerIdentity) -> Option<ForwardingHandle> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if !entry.owner.is_alive() {
            return None;
        }
        Some(ForwardingHandle {
            key: key.to_string(),
            target: Arc::clone(&entry.endpoint),
            owner: entry.owner.clone(),
            publisher: entry.publisher,
            caller,
        })
    }
}

/// One process's connection to a [`LocalRegistry`].
#[derive(Clone)]
pub struct RegistryClient {
    registry: LocalRegistry,
    credentials: ProcessCredentials,
}

#[async_trait]
impl ServiceRegistry for RegistryClient {
    fn credentials(&self) -> &ProcessCredentials {
        &self.credentials
    }

    async fn publish(&self, key: &str, endpoint: Arc<dyn Endpoint>) -> Result<(), RegistryError> {
        if !self.credentials.liveness.is_alive() {
            return Err(RegistryError::ClientDead {
                pid: self.credentials.pid.0,
            });
        }
        self.registry
            .insert(key, endpoint, &self.credentials)
            .await?;
        tracing::debug!(
            key = %key,
            uid = %self.credentials.uid,
            pid = %self.credentials.pid,
            "Published endpoint"
        );
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Option<ForwardingHandle> {
        self.registry.get(key, self.credentials.caller()).await
    }
}

/// Reference to a published endpoint, held by one process.
///
/// As a [`Channel`] it stamps calls with the holder's identity. Its
/// [`Channel::as_endpoint`] view can be republished; calls arriving through
/// the registry then reach the same object with the original caller passed
/// through, the way a re-shared handle does. The handle itself is not an
/// endpoint, so nobody can hand it a context of their choosing.
#[derive(Clone)]
pub struct ForwardingHandle {
    key: String,
    target: Arc<dyn Endpoint>,
    owner: LivenessToken,
    publisher: CallerIdentity,
    caller: CallerIdentity,
}

impl ForwardingHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identity of the process that published the endpoint.
    pub fn publisher(&self) -> CallerIdentity {
        self.publisher
    }

    /// Identity stamped on calls made through this handle.
    pub fn caller(&self) -> CallerIdentity {
        self.caller
    }

    /// Whether the publishing process is still alive.
    pub fn is_alive(&self) -> bool {
        self.owner.is_alive()
    }
}

async fn deliver(
    target: &Arc<dyn Endpoint>,
    owner: &LivenessToken,
    ctx: &CallContext,
    txn: Transaction,
) -> Result<Value, CallError> {
    if !owner.is_alive() {
        return Err(CallError::DeadObject {
            descriptor: target.descriptor().to_string(),
        });
    }
    target.transact(ctx, txn).await
}

impl std::fmt::Debug for ForwardingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingHandle")
            .field("key", &self.key)
            .field("descriptor", &self.target.descriptor())
            .field("publisher", &self.publisher)
            .field("caller", &self.caller)
            .field("alive", &self.owner.is_alive())
            .finish()
    }
}

#[async_trait]
impl Channel for ForwardingHandle {
    fn descriptor(&self) -> &str {
        self.target.descriptor()
    }

    async fn call(&self, txn: Transaction) -> Result<Value, CallError> {
        let ctx = CallContext::new(self.caller);
        deliver(&self.target, &self.owner, &ctx, txn).await
    }

    fn as_endpoint(&self) -> Arc<dyn Endpoint> {
        Arc::new(Republished {
            target: Arc::clone(&self.target),
            owner: self.owner.clone(),
        })
    }
}

/// A handle's target as seen once republished under another key. The
/// context it forwards is the one the registry stamped for the caller that
/// looked up the new key.
struct Republished {
    target: Arc<dyn Endpoint>,
    owner: LivenessToken,
}

#[async_trait]
impl Endpoint for Republished {
    fn descriptor(&self) -> &str {
        self.target.descriptor()
    }

    async fn transact(&self, ctx: &CallContext, txn: Transaction) -> Result<Value, CallError> {
        deliver(&self.target, &self.owner, ctx, txn).await
    }
}
