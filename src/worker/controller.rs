//! Worker lifecycle: publish, bind, wait for shutdown.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use crate::config::WorkerConfig;
use crate::directory::PackageDirectory;
use crate::error::{CallError, WorkerError};
use crate::identity::{ServiceIdentity, Uid};
use crate::ipc::{CallAuthenticator, Endpoint};
use crate::liveness::{DeathLink, LivenessToken};
use crate::registry::ServiceRegistry;
use crate::service::{AccessPolicy, ServiceCatalog};
use crate::worker::WorkerExit;
use crate::worker::control::ControlEndpoint;
use crate::worker::shutdown::{ShutdownLatch, ShutdownPhase};

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Unpublished = 0,
    Publishing = 1,
    Bound = 2,
    ShuttingDown = 3,
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unpublished,
            1 => Self::Publishing,
            2 => Self::Bound,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpublished => "unpublished",
            Self::Publishing => "publishing",
            Self::Bound => "bound",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Unpublished, Publishing)
                | (Publishing, Bound)
                | (Publishing, ShuttingDown)
                | (Bound, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct Binding {
    token: LivenessToken,
    link: DeathLink,
}

/// State shared by the controller, its control endpoint and death observers.
pub(crate) struct WorkerCore {
    identity: ServiceIdentity,
    host_uid: Uid,
    policy: AccessPolicy,
    grace: Duration,
    state: AtomicU8,
    latch: ShutdownLatch,
    exit_sequences: AtomicUsize,
    binding: Mutex<Option<Binding>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerCore {
    fn new(
        identity: ServiceIdentity,
        host_uid: Uid,
        policy: AccessPolicy,
        grace: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            host_uid,
            policy,
            grace,
            state: AtomicU8::new(WorkerState::Unpublished as u8),
            latch: ShutdownLatch::new(),
            exit_sequences: AtomicUsize::new(0),
            binding: Mutex::new(None),
            shutdown_tx,
        })
    }

    pub(crate) fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub(crate) fn host_uid(&self) -> Uid {
        self.host_uid
    }

    pub(crate) fn policy(&self) -> AccessPolicy {
        self.policy
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state if the transition is legal. Returns whether it moved.
    fn transition(&self, next: WorkerState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !WorkerState::from_u8(current).can_transition_to(next) {
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

    /// Store the client's liveness token and shut down when it dies.
    pub(crate) fn bind(self: &Arc<Self>, token: LivenessToken) -> Result<(), CallError> {
        if !self.latch.is_running() {
            return Err(CallError::remote(format!(
                "{} is shutting down",
                self.identity
            )));
        }

        let core = Arc::clone(self);
        let link = token.link_to_death(move || {
            tracing::info!(service = %core.identity, "Client liveness token died");
            core.die();
        });

        let previous = {
            let mut binding = self
                .binding
                .lock()
                .map_err(|_| CallError::remote("binding state poisoned"))?;
            binding.replace(Binding {
                token: token.clone(),
                link,
            })
        };
        if let Some(previous) = previous {
            tracing::debug!(
                service = %self.identity,
                token = %previous.token.id(),
                "Replacing previous liveness binding"
            );
            previous.link.unlink();
        }

        self.transition(WorkerState::Bound);
        tracing::info!(service = %self.identity, token = %token.id(), "Liveness token bound");
        Ok(())
    }

    fn unbind(&self) {
        let binding = match self.binding.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(binding) = binding {
            binding.link.unlink();
        }
    }

    fn bound_token(&self) -> Option<LivenessToken> {
        self.binding
            .lock()
            .ok()
            .and_then(|b| b.as_ref().map(|b| b.token.clone()))
    }

    /// Begin the exit sequence. Returns `true` only for the call that
    /// actually started it.
    pub(crate) fn die(self: &Arc<Self>) -> bool {
        if self.policy.keep_alive {
            tracing::debug!(service = %self.identity, "Ignoring shutdown request: keep_alive");
            return false;
        }
        if !self.latch.begin() {
            return false;
        }

        self.exit_sequences.fetch_add(1, Ordering::SeqCst);
        self.transition(WorkerState::ShuttingDown);
        tracing::info!(
            service = %self.identity,
            grace_ms = self.grace.as_millis() as u64,
            "Worker shutting down"
        );

        let core = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(core.grace).await;
            core.latch.finish();
            core.shutdown_tx.send_replace(true);
        });
        true
    }
}

/// External view of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    core: Arc<WorkerCore>,
}

impl WorkerHandle {
    pub fn identity(&self) -> &ServiceIdentity {
        &self.core.identity
    }

    pub fn host_uid(&self) -> Uid {
        self.core.host_uid
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.core.latch.phase()
    }

    /// Number of exit sequences started. Never exceeds one.
    pub fn exit_sequences(&self) -> usize {
        self.core.exit_sequences.load(Ordering::SeqCst)
    }

    /// Liveness token of the currently bound client, if any.
    pub fn bound_token(&self) -> Option<LivenessToken> {
        self.core.bound_token()
    }

    /// Request shutdown, as `killService` does without the access check.
    pub fn die(&self) -> bool {
        self.core.die()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("service", &self.core.identity.name())
            .field("host_uid", &self.core.host_uid)
            .field("state", &self.state())
            .finish()
    }
}

/// A worker whose endpoints are published.
pub struct RunningWorker {
    core: Arc<WorkerCore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunningWorker {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Block until the shutdown signal, then unwind.
    pub async fn wait(mut self) -> WorkerExit {
        loop {
            if *self.shutdown_rx.borrow_and_update() {
                break;
            }
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        self.core.unbind();
        self.core.transition(WorkerState::Terminated);
        tracing::info!(service = %self.core.identity, "Worker terminated");
        WorkerExit::Graceful
    }
}

/// Runs one service class on behalf of one client package.
pub struct WorkerController {
    registry: Arc<dyn ServiceRegistry>,
    catalog: Arc<ServiceCatalog>,
    directory: Arc<dyn PackageDirectory>,
    config: WorkerConfig,
}

impl WorkerController {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        catalog: Arc<ServiceCatalog>,
        directory: Arc<dyn PackageDirectory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            directory,
            config,
        }
    }

    /// Instantiate the service and publish its service and control
    /// endpoints.
    pub async fn start(&self, package: &str, class: &str) -> Result<RunningWorker, WorkerError> {
        let service = self.catalog.instantiate(class)?;
        let identity = service.identity()?;
        let host_uid = self.directory.resolve_owner_uid(package)?;
        let policy = service.policy();

        let core = WorkerCore::new(identity.clone(), host_uid, policy, self.config.shutdown_grace);
        let shutdown_rx = core.shutdown_tx.subscribe();
        core.transition(WorkerState::Publishing);

        // Control goes last: its presence tells clients the service is up.
        let implementation = service.implementation();
        let endpoint: Arc<dyn Endpoint> = if policy.allow_others {
            implementation
        } else {
            Arc::new(CallAuthenticator::new(host_uid, implementation))
        };
        self.registry
            .publish(&identity.service_key(), endpoint)
            .await?;

        let control: Arc<dyn Endpoint> = Arc::new(ControlEndpoint::new(Arc::clone(&core)));
        self.registry
            .publish(&identity.control_key(), control)
            .await?;

        tracing::info!(
            service = %identity,
            package = %package,
            host_uid = %host_uid,
            uid = %self.registry.credentials().uid,
            allow_others = policy.allow_others,
            keep_alive = policy.keep_alive,
            "Worker published"
        );

        Ok(RunningWorker { core, shutdown_rx })
    }

    /// Start, then wait for shutdown. Startup failures end the worker.
    pub async fn run(&self, package: &str, class: &str) -> WorkerExit {
        self.run_observed(package, class, |_| {}).await
    }

    /// Like [`run`](Self::run), handing out a [`WorkerHandle`] once both
    /// endpoints are published.
    pub async fn run_observed<F>(&self, package: &str, class: &str, on_published: F) -> WorkerExit
    where
        F: FnOnce(WorkerHandle) + Send,
    {
        let span = tracing::info_span!("worker", app = %format!("service:{class}"));
        async {
            match self.start(package, class).await {
                Ok(worker) => {
                    on_published(worker.handle());
                    worker.wait().await
                }
                Err(e) => {
                    tracing::error!(package = %package, class = %class, error = %e, "Worker startup failed");
                    WorkerExit::StartupFailed
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::directory::StaticDirectory;
    use crate::error::RegistryError;
    use crate::identity::{Pid, ProcessCredentials};
    use crate::ipc::{Channel, Transaction};
    use crate::liveness::LivenessOwner;
    use crate::registry::LocalRegistry;
    use crate::testing::{CALCULATOR_CLASS, CalculatorService, test_catalog};

    const PACKAGE: &str = "com.example.app";
    const HOST: Uid = Uid(10_050);

    struct Fixture {
        registry: LocalRegistry,
        _worker_owner: LivenessOwner,
        controller: WorkerController,
    }

    fn fixture(grace_ms: u64) -> Fixture {
        let registry = LocalRegistry::new();
        let owner = LivenessOwner::new();
        let client = registry.connect(ProcessCredentials {
            uid: Uid::ROOT,
            pid: Pid::next_simulated(),
            liveness: owner.token(),
        });
        let controller = WorkerController::new(
            Arc::new(client),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new().with_package(PACKAGE, HOST)),
            WorkerConfig {
                shutdown_grace: Duration::from_millis(grace_ms),
            },
        );
        Fixture {
            registry,
            _worker_owner: owner,
            controller,
        }
    }

    #[test]
    fn test_state_transitions() {
        use WorkerState::*;
        assert!(Unpublished.can_transition_to(Publishing));
        assert!(Publishing.can_transition_to(ShuttingDown));
        assert!(Bound.can_transition_to(ShuttingDown));
        assert!(!Terminated.can_transition_to(Publishing));
        assert!(!Terminated.can_transition_to(Bound));
        assert!(!Bound.can_transition_to(Unpublished));
    }

    #[tokio::test]
    async fn test_start_publishes_both_endpoints() {
        let f = fixture(10);
        let worker = f.controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();
        let handle = worker.handle();
        assert_eq!(handle.state(), WorkerState::Publishing);
        assert_eq!(handle.host_uid(), HOST);
        assert_eq!(
            f.registry.live_keys().await,
            vec![
                CalculatorService::DESCRIPTOR.to_string(),
                format!("{}.Control", CalculatorService::DESCRIPTOR),
            ]
        );
    }

    /// Registry client that remembers the order keys were published in.
    struct OrderRecorder {
        inner: crate::registry::RegistryClient,
        published: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ServiceRegistry for OrderRecorder {
        fn credentials(&self) -> &ProcessCredentials {
            self.inner.credentials()
        }

        async fn publish(&self, key: &str, endpoint: Arc<dyn Endpoint>) -> Result<(), RegistryError> {
            self.published.lock().unwrap().push(key.to_string());
            self.inner.publish(key, endpoint).await
        }

        async fn lookup(&self, key: &str) -> Option<crate::registry::ForwardingHandle> {
            self.inner.lookup(key).await
        }
    }

    #[tokio::test]
    async fn test_control_endpoint_is_published_last() {
        let registry = LocalRegistry::new();
        let owner = LivenessOwner::new();
        let recorder = Arc::new(OrderRecorder {
            inner: registry.connect(ProcessCredentials {
                uid: Uid::ROOT,
                pid: Pid::next_simulated(),
                liveness: owner.token(),
            }),
            published: std::sync::Mutex::new(Vec::new()),
        });
        let controller = WorkerController::new(
            recorder.clone(),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new().with_package(PACKAGE, HOST)),
            WorkerConfig::default(),
        );
        let _worker = controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();

        assert_eq!(
            *recorder.published.lock().unwrap(),
            vec![
                CalculatorService::DESCRIPTOR.to_string(),
                format!("{}.Control", CalculatorService::DESCRIPTOR),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_class_fails_startup() {
        let f = fixture(10);
        assert!(matches!(
            f.controller.start(PACKAGE, "NoSuchService").await,
            Err(WorkerError::UnknownService { .. })
        ));
        assert_eq!(
            f.controller.run(PACKAGE, "NoSuchService").await,
            WorkerExit::StartupFailed
        );
    }

    #[tokio::test]
    async fn test_unknown_package_fails_startup() {
        let f = fixture(10);
        assert!(matches!(
            f.controller.start("com.example.missing", CALCULATOR_CLASS).await,
            Err(WorkerError::Directory(_))
        ));
    }

    #[tokio::test]
    async fn test_second_worker_cannot_publish_over_live_one() {
        let f = fixture(10);
        let _first = f.controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();
        match f.controller.start(PACKAGE, CALCULATOR_CLASS).await {
            Err(WorkerError::Publish(RegistryError::AlreadyPublished { key })) => {
                assert_eq!(key, CalculatorService::DESCRIPTOR);
            }
            Err(other) => panic!("Expected AlreadyPublished, got {other}"),
            Ok(_) => panic!("Expected AlreadyPublished, got a running worker"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_die_runs_one_exit_sequence() {
        let f = fixture(100);
        let worker = f.controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();
        let handle = worker.handle();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.die() }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(handle.exit_sequences(), 1);
        assert_eq!(handle.state(), WorkerState::ShuttingDown);

        assert_eq!(worker.wait().await, WorkerExit::Graceful);
        assert_eq!(handle.state(), WorkerState::Terminated);
        assert_eq!(handle.shutdown_phase(), ShutdownPhase::Stopped);
        assert_eq!(handle.exit_sequences(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_death_shuts_worker_down() {
        let f = fixture(100);
        let worker = f.controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();
        let handle = worker.handle();

        let client_owner = LivenessOwner::new();
        handle.core.bind(client_owner.token()).unwrap();
        assert_eq!(handle.state(), WorkerState::Bound);
        assert_eq!(handle.bound_token().map(|t| t.id()), Some(client_owner.id()));

        let started = tokio::time::Instant::now();
        drop(client_owner);
        assert_eq!(worker.wait().await, WorkerExit::Graceful);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.exit_sequences(), 1);
        assert!(handle.bound_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_endpoint_is_guarded() {
        let f = fixture(10);
        let _worker = f.controller.start(PACKAGE, CALCULATOR_CLASS).await.unwrap();

        let owner = LivenessOwner::new();
        let stranger = f.registry.connect(ProcessCredentials {
            uid: Uid(10_099),
            pid: Pid::next_simulated(),
            liveness: owner.token(),
        });
        let handle = stranger
            .lookup(CalculatorService::DESCRIPTOR)
            .await
            .unwrap();
        let err = handle
            .call(Transaction::new("add", json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Unauthorized { expected, .. } if expected == HOST));
    }
}
