//! Test support: a sample interface and a simulated host.
//!
//! [`SimulatedHost`] wires a [`LocalRegistry`], a [`StaticDirectory`] and an
//! [`InProcessSpawner`] together, so that a whole activation cycle (spawn,
//! publish, bind, forwarded calls, kill) runs inside one tokio runtime.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ServiceProxy;
use crate::config::{DiscoveryConfig, WorkerConfig};
use crate::directory::StaticDirectory;
use crate::error::{CallError, IdentityError};
use crate::identity::{Pid, ProcessCredentials, Uid};
use crate::ipc::Endpoint;
use crate::liveness::LivenessOwner;
use crate::registry::{LocalRegistry, RegistryClient};
use crate::service::{AccessPolicy, RootService, ServiceCatalog};
use crate::spawner::InProcessSpawner;

crate::service_interface! {
    /// Arithmetic performed by the worker.
    pub trait Calculator: "com.example.ICalculator" {
        fn add(a: i64, b: i64) -> i64;
        fn divide(a: i64, b: i64) -> i64;
        /// Uid the implementation runs as.
        fn whoami() -> u32;
    }
    stub = CalculatorStub;
    proxy = CalculatorProxy;
}

/// Catalog name of [`CalculatorService`].
pub const CALCULATOR_CLASS: &str = "CalculatorService";

/// The implementation living in the worker.
#[derive(Debug, Clone, Copy)]
pub struct Arithmetic {
    pub uid: Uid,
}

#[async_trait]
impl Calculator for Arithmetic {
    async fn add(&self, a: i64, b: i64) -> Result<i64, CallError> {
        a.checked_add(b)
            .ok_or_else(|| CallError::remote("integer overflow"))
    }

    async fn divide(&self, a: i64, b: i64) -> Result<i64, CallError> {
        if b == 0 {
            return Err(CallError::remote("division by zero"));
        }
        a.checked_div(b)
            .ok_or_else(|| CallError::remote("integer overflow"))
    }

    async fn whoami(&self) -> Result<u32, CallError> {
        Ok(self.uid.as_raw())
    }
}

/// Service definition for [`Calculator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorService {
    policy: AccessPolicy,
    target_uid: Option<Uid>,
    in_worker: bool,
}

impl CalculatorService {
    pub const DESCRIPTOR: &'static str = CalculatorProxy::DESCRIPTOR;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: AccessPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn as_uid(mut self, uid: Uid) -> Self {
        self.target_uid = Some(uid);
        self
    }

    /// The definition as seen from inside the worker process.
    pub fn in_worker(mut self) -> Self {
        self.in_worker = true;
        self
    }

    fn stub(&self) -> CalculatorStub<Arithmetic> {
        CalculatorStub::new(Arc::new(Arithmetic {
            uid: self.target_uid(),
        }))
    }
}

impl RootService for CalculatorService {
    fn descriptor(&self) -> &str {
        Self::DESCRIPTOR
    }

    fn target_uid(&self) -> Uid {
        self.target_uid.unwrap_or(Uid::ROOT)
    }

    fn policy(&self) -> AccessPolicy {
        self.policy
    }

    fn implementation(&self) -> Arc<dyn Endpoint> {
        self.stub().as_endpoint()
    }

    fn local(&self) -> Option<Arc<dyn Endpoint>> {
        self.in_worker.then(|| self.stub().as_endpoint())
    }
}

/// Catalog with [`CalculatorService`] under [`CALCULATOR_CLASS`].
pub fn test_catalog() -> ServiceCatalog {
    ServiceCatalog::new().with_service(CALCULATOR_CLASS, || Arc::new(CalculatorService::new()))
}

/// A simulated process: credentials plus a registry connection.
pub struct SimulatedProcess {
    liveness: Option<LivenessOwner>,
    credentials: ProcessCredentials,
    registry: Arc<RegistryClient>,
}

impl SimulatedProcess {
    pub fn uid(&self) -> Uid {
        self.credentials.uid
    }

    pub fn pid(&self) -> Pid {
        self.credentials.pid
    }

    pub fn registry(&self) -> Arc<RegistryClient> {
        Arc::clone(&self.registry)
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_some()
    }

    /// Kill the process abruptly. Everything it published and every
    /// liveness token it owns dies with it.
    pub fn crash(&mut self) {
        self.liveness.take();
    }
}

/// One host: registry, package directory and an in-process spawner.
pub struct SimulatedHost {
    registry: LocalRegistry,
    spawner: Arc<InProcessSpawner>,
    discovery: DiscoveryConfig,
}

impl SimulatedHost {
    pub fn new(catalog: ServiceCatalog, directory: StaticDirectory, worker: WorkerConfig) -> Self {
        let registry = LocalRegistry::new();
        let spawner = Arc::new(InProcessSpawner::new(
            registry.clone(),
            Arc::new(catalog),
            Arc::new(directory),
            worker,
        ));
        Self {
            registry,
            spawner,
            discovery: DiscoveryConfig::default(),
        }
    }

    /// Host with the calculator catalog and one package owned by `owner`.
    pub fn calculator(package: &str, owner: Uid) -> Self {
        Self::new(
            test_catalog(),
            StaticDirectory::new().with_package(package, owner),
            WorkerConfig::default(),
        )
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    pub fn spawner(&self) -> Arc<InProcessSpawner> {
        Arc::clone(&self.spawner)
    }

    /// Start a simulated process running as `uid`.
    pub fn process(&self, uid: Uid) -> SimulatedProcess {
        let liveness = LivenessOwner::new();
        let credentials = ProcessCredentials {
            uid,
            pid: Pid::next_simulated(),
            liveness: liveness.token(),
        };
        let registry = Arc::new(self.registry.connect(credentials.clone()));
        SimulatedProcess {
            liveness: Some(liveness),
            credentials,
            registry,
        }
    }

    /// Client proxy for `service`, activated from `process` on behalf of
    /// `package`.
    pub fn proxy(
        &self,
        process: &SimulatedProcess,
        service: Arc<dyn RootService>,
        class: &str,
        package: &str,
    ) -> Result<ServiceProxy, IdentityError> {
        Ok(
            ServiceProxy::new(service, class, package, process.registry(), self.spawner())?
                .with_discovery(self.discovery.clone()),
        )
    }
}
