//! Call frames and the endpoint abstraction every proxied interface goes
//! through.
//!
//! ```text
//!  client                        registry                         worker
//!  ──────                        ────────                         ──────
//!  CalculatorProxy ──▶ ForwardingHandle ──(caller stamped)──▶ CallAuthenticator
//!                                                                   │
//!                                                                   ▼
//!                                                         CalculatorStub<Impl>
//! ```
//!
//! An [`Endpoint`] accepts [`Transaction`]s: a method name, a JSON argument
//! payload and an optional liveness token attachment. The identity of the
//! caller is never part of the frame; it arrives in the [`CallContext`]
//! that the registry transport fills in.
//!
//! A [`Channel`] is the sending side: a handle bound to the credentials of
//! whoever holds it.

pub mod auth;
pub mod dispatch;

pub use auth::CallAuthenticator;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CallError;
use crate::identity::CallerIdentity;
use crate::liveness::LivenessToken;

/// Per-call context supplied by the transport.
///
/// Only the transport builds one, so an endpoint can trust the caller it
/// reports.
#[derive(Debug)]
pub struct CallContext {
    caller: CallerIdentity,
}

impl CallContext {
    pub(crate) fn new(caller: CallerIdentity) -> Self {
        Self { caller }
    }

    pub fn caller(&self) -> CallerIdentity {
        self.caller
    }
}

/// A single call frame.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub method: String,
    pub args: Value,
    /// Liveness token carried alongside the arguments, the way a handle
    /// object rides inside a marshalled parcel.
    pub token: Option<LivenessToken>,
}

impl Transaction {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
            token: None,
        }
    }

    pub fn with_token(mut self, token: LivenessToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// Anything that can receive call frames.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Interface descriptor this endpoint serves.
    fn descriptor(&self) -> &str;

    async fn transact(&self, ctx: &CallContext, txn: Transaction) -> Result<Value, CallError>;
}

/// Sending side of a connection to an endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    fn descriptor(&self) -> &str;

    /// Deliver a frame, stamped with the holder's identity.
    async fn call(&self, txn: Transaction) -> Result<Value, CallError>;

    /// The channel viewed as an endpoint, so that it can be published.
    fn as_endpoint(&self) -> Arc<dyn Endpoint>;
}

/// In-process channel straight to an endpoint, for code that already runs
/// inside the process hosting the implementation.
#[derive(Clone)]
pub struct LocalChannel {
    endpoint: Arc<dyn Endpoint>,
    caller: CallerIdentity,
}

impl LocalChannel {
    pub(crate) fn new(endpoint: Arc<dyn Endpoint>, caller: CallerIdentity) -> Self {
        Self { endpoint, caller }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn descriptor(&self) -> &str {
        self.endpoint.descriptor()
    }

    async fn call(&self, txn: Transaction) -> Result<Value, CallError> {
        let ctx = CallContext::new(self.caller);
        self.endpoint.transact(&ctx, txn).await
    }

    fn as_endpoint(&self) -> Arc<dyn Endpoint> {
        Arc::clone(&self.endpoint)
    }
}
