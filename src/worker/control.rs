//! Lifecycle control endpoint, published next to every service endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CallError;
use crate::ipc::{CallContext, Channel, Endpoint, Transaction};
use crate::liveness::LivenessToken;
use crate::worker::controller::WorkerCore;

pub const BIND_TOKEN: &str = "bindToken";
pub const KILL_SERVICE: &str = "killService";

/// Worker side of the control interface.
pub(crate) struct ControlEndpoint {
    core: Arc<WorkerCore>,
    descriptor: String,
}

impl ControlEndpoint {
    pub(crate) fn new(core: Arc<WorkerCore>) -> Self {
        let descriptor = core.identity().control_key();
        Self { core, descriptor }
    }

    fn bind_token(&self, ctx: &CallContext, txn: Transaction) -> Result<Value, CallError> {
        let host = self.core.host_uid();
        if !self.core.policy().allow_others && ctx.caller().uid() != host {
            tracing::warn!(
                service = %self.core.identity(),
                caller = %ctx.caller(),
                expected = %host,
                "Rejected liveness bind from foreign caller"
            );
            return Err(CallError::Unauthorized {
                caller: ctx.caller(),
                expected: host,
            });
        }
        let token = txn.token.ok_or_else(|| CallError::InvalidArguments {
            method: BIND_TOKEN.to_string(),
            reason: "missing liveness token".to_string(),
        })?;
        self.core.bind(token)?;
        Ok(Value::Null)
    }

    fn kill_service(&self, ctx: &CallContext) -> Result<Value, CallError> {
        let host = self.core.host_uid();
        if !self.core.policy().may_kill(ctx.caller().uid(), host) {
            tracing::warn!(
                service = %self.core.identity(),
                caller = %ctx.caller(),
                expected = %host,
                "Rejected kill from foreign caller"
            );
            return Err(CallError::Unauthorized {
                caller: ctx.caller(),
                expected: host,
            });
        }
        tracing::info!(service = %self.core.identity(), caller = %ctx.caller(), "Kill requested");
        self.core.die();
        Ok(Value::Null)
    }
}

#[async_trait]
impl Endpoint for ControlEndpoint {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    async fn transact(&self, ctx: &CallContext, txn: Transaction) -> Result<Value, CallError> {
        match txn.method.as_str() {
            BIND_TOKEN => self.bind_token(ctx, txn),
            KILL_SERVICE => self.kill_service(ctx),
            other => Err(CallError::UnknownMethod {
                descriptor: self.descriptor.clone(),
                method: other.to_string(),
            }),
        }
    }
}

/// Client side of the control interface.
#[derive(Clone)]
pub struct ControlProxy {
    channel: Arc<dyn Channel>,
}

impl ControlProxy {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    pub fn as_channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }

    /// Hand the worker a token whose death should shut it down.
    pub async fn bind_token(&self, token: LivenessToken) -> Result<(), CallError> {
        self.channel
            .call(Transaction::new(BIND_TOKEN, Value::Null).with_token(token))
            .await?;
        Ok(())
    }

    pub async fn kill_service(&self) -> Result<(), CallError> {
        self.channel
            .call(Transaction::new(KILL_SERVICE, Value::Null))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ControlProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlProxy")
            .field("descriptor", &self.channel.descriptor())
            .finish()
    }
}
