//! Liveness tokens: observable process lifetime without polling.
//!
//! A [`LivenessOwner`] stands for a live process (or a live binding held by
//! one). Any number of [`LivenessToken`]s can be handed out from it; holders
//! attach death observers that fire once the owner is released or dropped.
//! Dropping the owner is how a crashed process looks from the outside.

use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// The owning side. Dropping it kills every token derived from it.
#[derive(Debug)]
pub struct LivenessOwner {
    id: Uuid,
    alive: watch::Sender<bool>,
}

impl LivenessOwner {
    pub fn new() -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            id: Uuid::new_v4(),
            alive,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A non-owning reference that can be shipped to another process.
    pub fn token(&self) -> LivenessToken {
        LivenessToken {
            id: self.id,
            alive: self.alive.subscribe(),
        }
    }

    /// Explicitly end the lifetime (unbind) instead of waiting for drop.
    pub fn release(self) {
        self.alive.send_replace(false);
    }
}

impl Default for LivenessOwner {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning handle to a [`LivenessOwner`].
#[derive(Debug, Clone)]
pub struct LivenessToken {
    id: Uuid,
    alive: watch::Receiver<bool>,
}

impl LivenessToken {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.has_changed().is_ok() && *self.alive.borrow()
    }

    /// Resolve once the owner is released or dropped.
    pub async fn dead(&self) {
        let mut rx = self.alive.clone();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Attach a death observer.
    ///
    /// `observer` runs at most once, on a background task, when the owner
    /// dies. Dropping the returned [`DeathLink`] leaves the observer
    /// attached; call [`DeathLink::unlink`] to detach it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn link_to_death<F>(&self, observer: F) -> DeathLink
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.dead() => {
                    tracing::debug!(token = %token.id, "Liveness token died");
                    observer();
                }
                Ok(()) = &mut cancel_rx => {}
            }
        });
        DeathLink {
            token_id: self.id,
            cancel: Some(cancel_tx),
        }
    }
}

/// Guard for an attached death observer.
#[derive(Debug)]
pub struct DeathLink {
    token_id: Uuid,
    cancel: Option<oneshot::Sender<()>>,
}

impl DeathLink {
    pub fn token_id(&self) -> Uuid {
        self.token_id
    }

    /// Detach the observer. It will not run even if the owner dies later.
    pub fn unlink(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
