//! Activation-time discovery: find or spawn the worker, then bind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::client::{BindingStateCell, ClientBindingState};
use crate::config::DiscoveryConfig;
use crate::error::ProxyError;
use crate::identity::ServiceIdentity;
use crate::liveness::LivenessOwner;
use crate::registry::{ForwardingHandle, ServiceRegistry};
use crate::spawner::{PrivilegeSpawner, SpawnRequest};
use crate::worker::ControlProxy;

/// A worker the client has bound its liveness to.
pub(crate) struct BoundWorker {
    pub(crate) service: ForwardingHandle,
    pub(crate) control: ControlProxy,
    pub(crate) token: LivenessOwner,
}

/// One activation attempt. Runs on its own task.
pub(crate) struct Discovery {
    pub(crate) identity: ServiceIdentity,
    pub(crate) registry: Arc<dyn ServiceRegistry>,
    pub(crate) spawner: Arc<dyn PrivilegeSpawner>,
    pub(crate) request: SpawnRequest,
    pub(crate) config: DiscoveryConfig,
    pub(crate) state: Arc<BindingStateCell>,
}

impl Discovery {
    pub(crate) async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<BoundWorker, ProxyError> {
        self.state.transition(ClientBindingState::Discovering);
        let control_key = self.identity.control_key();

        let (control, reached) = match self.registry.lookup(&control_key).await {
            Some(handle) => {
                tracing::debug!(service = %self.identity, "Found running worker");
                (handle, 0)
            }
            None => {
                self.state.transition(ClientBindingState::Spawning);
                self.spawner
                    .spawn(self.request.clone())
                    .await
                    .map_err(|e| ProxyError::SpawnFailed {
                        service: self.identity.to_string(),
                        source: e,
                    })?;
                if !sleep_or_cancel(self.config.settle_delay, &mut cancel).await {
                    return Err(self.unavailable(0));
                }
                self.poll(&control_key, 1, &mut cancel).await?
            }
        };

        self.state.transition(ClientBindingState::Binding);
        let control = ControlProxy::new(Arc::new(control));
        let token = LivenessOwner::new();
        control
            .bind_token(token.token())
            .await
            .map_err(|e| ProxyError::BindRejected {
                service: self.identity.to_string(),
                reason: e.to_string(),
            })?;

        // The service key may still trail the control key; keep polling
        // for it in whatever is left of the window.
        let (service, _) = self
            .poll(&self.identity.service_key(), reached + 1, &mut cancel)
            .await?;

        Ok(BoundWorker {
            service,
            control,
            token,
        })
    }

    /// Poll for `key` from attempt `first` through the configured attempt
    /// count, sleeping `interval` after each miss. The key is always looked
    /// up at least once. Returns the handle and the attempt it was found on.
    async fn poll(
        &self,
        key: &str,
        first: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(ForwardingHandle, u32), ProxyError> {
        let last = self.config.attempts.max(first);
        for attempt in first..=last {
            if let Some(handle) = self.registry.lookup(key).await {
                tracing::debug!(service = %self.identity, key = %key, attempt, "Endpoint published");
                return Ok((handle, attempt));
            }
            tracing::debug!(service = %self.identity, key = %key, attempt, "Endpoint not published yet");
            if !sleep_or_cancel(self.config.interval, cancel).await {
                return Err(self.unavailable(attempt));
            }
        }
        Err(self.unavailable(last))
    }

    fn unavailable(&self, attempts: u32) -> ProxyError {
        ProxyError::ServiceUnavailable {
            service: self.identity.to_string(),
            attempts,
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.changed() => {
            tracing::debug!("Discovery cancelled");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let (_tx, mut rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        assert!(sleep_or_cancel(Duration::from_millis(250), &mut rx).await);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let (tx, mut rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        assert!(!sleep_or_cancel(Duration::from_secs(60), &mut rx).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        assert!(!sleep_or_cancel(Duration::from_secs(60), &mut rx).await);
    }
}
