//! Launching workers under another identity.
//!
//! A spawner only starts the worker. Returning from
//! [`PrivilegeSpawner::spawn`] says nothing about readiness; the client
//! finds out by polling the registry.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::{SpawnerConfig, WorkerConfig};
use crate::directory::PackageDirectory;
use crate::error::SpawnError;
use crate::identity::{Pid, ProcessCredentials, Uid};
use crate::liveness::LivenessOwner;
use crate::registry::LocalRegistry;
use crate::service::ServiceCatalog;
use crate::worker::{WorkerController, WorkerExit, WorkerHandle};

/// What to launch and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub target_uid: Uid,
    /// Subcommand that enters worker mode.
    pub entry_point: String,
    /// Package whose owner the worker will authenticate against.
    pub package: String,
    /// Service class the worker instantiates.
    pub service_class: String,
}

impl SpawnRequest {
    pub fn validate(&self) -> Result<(), SpawnError> {
        for (field, value) in [
            ("entry_point", &self.entry_point),
            ("package", &self.package),
            ("service_class", &self.service_class),
        ] {
            if value.trim().is_empty() {
                return Err(SpawnError::InvalidRequest {
                    reason: format!("{field} is empty"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedWorker {
    pub pid: Pid,
    pub target_uid: Uid,
    pub spawned_at: DateTime<Utc>,
}

#[async_trait]
pub trait PrivilegeSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError>;
}

/// Launches the worker as a real process through an escalation program.
pub struct CommandSpawner {
    config: SpawnerConfig,
}

impl CommandSpawner {
    pub fn new(config: SpawnerConfig) -> Self {
        Self { config }
    }

    fn worker_executable(&self) -> Result<PathBuf, SpawnError> {
        match &self.config.worker_executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| SpawnError::Launch {
                program: self.config.escalation_program.clone(),
                reason: format!("cannot locate worker executable: {e}"),
            }),
        }
    }

    /// Arguments passed to the escalation program.
    ///
    /// `-n -u #<uid> -- <exe> <entry> --package <pkg> --service <class>`
    pub fn command_args(&self, request: &SpawnRequest, executable: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(10);
        if self.config.non_interactive {
            args.push("-n".into());
        }
        args.push("-u".into());
        args.push(format!("#{}", request.target_uid).into());
        args.push("--".into());
        args.push(executable.as_os_str().to_os_string());
        args.push(request.entry_point.clone().into());
        args.push("--package".into());
        args.push(request.package.clone().into());
        args.push("--service".into());
        args.push(request.service_class.clone().into());
        args
    }
}

#[async_trait]
impl PrivilegeSpawner for CommandSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        request.validate()?;
        let executable = self.worker_executable()?;
        let program = &self.config.escalation_program;

        let mut cmd = Command::new(program);
        cmd.args(self.command_args(&request, &executable))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| SpawnError::Launch {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().map(Pid).ok_or_else(|| SpawnError::Launch {
            program: program.clone(),
            reason: "child exited before its pid could be read".to_string(),
        })?;

        tracing::info!(
            pid = %pid,
            target_uid = %request.target_uid,
            service = %request.service_class,
            package = %request.package,
            "Spawned worker process"
        );

        let service = request.service_class.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(pid = %pid, service = %service, "Worker process exited");
                }
                Ok(status) => {
                    tracing::warn!(pid = %pid, service = %service, status = %status, "Worker process failed");
                }
                Err(e) => {
                    tracing::warn!(pid = %pid, service = %service, error = %e, "Failed to reap worker process");
                }
            }
        });

        Ok(SpawnedWorker {
            pid,
            target_uid: request.target_uid,
            spawned_at: Utc::now(),
        })
    }
}

/// A worker running as a task under a simulated process identity.
pub struct SimulatedWorker {
    pid: Pid,
    request: SpawnRequest,
    published: Arc<OnceLock<WorkerHandle>>,
    task: JoinHandle<WorkerExit>,
}

impl SimulatedWorker {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn request(&self) -> &SpawnRequest {
        &self.request
    }

    /// Handle to the worker once its endpoints are published.
    pub fn handle(&self) -> Option<WorkerHandle> {
        self.published.get().cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Kill the simulated process without any shutdown sequence.
    pub fn crash(&self) {
        self.task.abort();
    }

    /// Wait for the process to end. `None` if it crashed.
    pub async fn wait(self) -> Option<WorkerExit> {
        self.task.await.ok()
    }
}

/// Runs workers inside the current process, each as its own simulated
/// process on a shared [`LocalRegistry`].
pub struct InProcessSpawner {
    registry: LocalRegistry,
    catalog: Arc<ServiceCatalog>,
    directory: Arc<dyn PackageDirectory>,
    config: WorkerConfig,
    spawn_count: AtomicUsize,
    workers: Mutex<Vec<SimulatedWorker>>,
}

impl InProcessSpawner {
    pub fn new(
        registry: LocalRegistry,
        catalog: Arc<ServiceCatalog>,
        directory: Arc<dyn PackageDirectory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            directory,
            config,
            spawn_count: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Handles of every spawned worker that has published its endpoints.
    pub fn worker_handles(&self) -> Vec<WorkerHandle> {
        match self.workers.lock() {
            Ok(workers) => workers.iter().filter_map(SimulatedWorker::handle).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Take ownership of every worker still tracked. Workers that had already
    /// exited when a later spawn happened are no longer tracked.
    pub fn take_workers(&self) -> Vec<SimulatedWorker> {
        match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl PrivilegeSpawner for InProcessSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        request.validate()?;
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let pid = Pid::next_simulated();
        let process = LivenessOwner::new();
        let client = self.registry.connect(ProcessCredentials {
            uid: request.target_uid,
            pid,
            liveness: process.token(),
        });
        let controller = WorkerController::new(
            Arc::new(client),
            Arc::clone(&self.catalog),
            Arc::clone(&self.directory),
            self.config.clone(),
        );

        let published = Arc::new(OnceLock::new());
        let slot = Arc::clone(&published);
        let package = request.package.clone();
        let class = request.service_class.clone();
        let task = tokio::spawn(async move {
            let exit = controller
                .run_observed(&package, &class, move |handle| {
                    let _ = slot.set(handle);
                })
                .await;
            tracing::debug!(pid = %pid, code = exit.code(), "Simulated worker process exited");
            drop(process);
            exit
        });

        tracing::info!(
            pid = %pid,
            target_uid = %request.target_uid,
            service = %request.service_class,
            package = %request.package,
            "Spawned in-process worker"
        );

        let spawned = SpawnedWorker {
            pid,
            target_uid: request.target_uid,
            spawned_at: Utc::now(),
        };
        let worker = SimulatedWorker {
            pid,
            request,
            published,
            task,
        };
        let mut workers = match self.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        };
        workers.retain(|w| !w.is_finished());
        workers.push(worker);
        Ok(spawned)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::directory::StaticDirectory;
    use crate::registry::ServiceRegistry;
    use crate::testing::{CALCULATOR_CLASS, CalculatorService, test_catalog};

    fn request(class: &str) -> SpawnRequest {
        SpawnRequest {
            target_uid: Uid::ROOT,
            entry_point: "worker".to_string(),
            package: "com.example.app".to_string(),
            service_class: class.to_string(),
        }
    }

    #[test]
    fn test_command_args() {
        let spawner = CommandSpawner::new(SpawnerConfig::default());
        let args = spawner.command_args(
            &SpawnRequest {
                target_uid: Uid(1001),
                ..request("Calc")
            },
            Path::new("/opt/app/bin/app"),
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-n",
                "-u",
                "#1001",
                "--",
                "/opt/app/bin/app",
                "worker",
                "--package",
                "com.example.app",
                "--service",
                "Calc",
            ]
        );
    }

    #[test]
    fn test_command_args_interactive() {
        let spawner = CommandSpawner::new(SpawnerConfig {
            non_interactive: false,
            ..SpawnerConfig::default()
        });
        let args = spawner.command_args(&request("Calc"), Path::new("/bin/app"));
        assert_eq!(args[0], OsString::from("-u"));
        assert_eq!(args[1], OsString::from("#0"));
    }

    #[test]
    fn test_invalid_request() {
        let mut req = request("Calc");
        req.package = "  ".to_string();
        assert!(matches!(
            req.validate(),
            Err(SpawnError::InvalidRequest { ref reason }) if reason.contains("package")
        ));
    }

    #[tokio::test]
    async fn test_missing_escalation_program() {
        let spawner = CommandSpawner::new(SpawnerConfig {
            escalation_program: "/nonexistent/rootservice-escalate".to_string(),
            worker_executable: Some(PathBuf::from("/bin/true")),
            ..SpawnerConfig::default()
        });
        assert!(matches!(
            spawner.spawn(request("Calc")).await,
            Err(SpawnError::Launch { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_process_worker_publishes_and_exits() {
        let registry = LocalRegistry::new();
        let spawner = InProcessSpawner::new(
            registry.clone(),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new().with_package("com.example.app", Uid(10_050))),
            WorkerConfig {
                shutdown_grace: Duration::from_millis(1),
            },
        );
        let spawned = spawner.spawn(request(CALCULATOR_CLASS)).await.unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(spawned.target_uid, Uid::ROOT);

        let observer = LivenessOwner::new();
        let client = registry.connect(ProcessCredentials {
            uid: Uid(10_050),
            pid: Pid::next_simulated(),
            liveness: observer.token(),
        });
        let mut found = None;
        for _ in 0..100 {
            if let Some(handle) = client.lookup(CalculatorService::DESCRIPTOR).await {
                found = Some(handle);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let handle = found.expect("worker should publish");
        assert_eq!(handle.publisher().pid(), spawned.pid);
        assert_eq!(handle.publisher().uid(), Uid::ROOT);

        let worker_handle = spawner.worker_handles().pop().unwrap();
        assert!(worker_handle.die());

        let workers = spawner.take_workers();
        assert_eq!(workers.len(), 1);
        let worker = workers.into_iter().next().unwrap();
        assert_eq!(worker.wait().await, Some(WorkerExit::Graceful));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_crashed_worker_endpoints_die() {
        let registry = LocalRegistry::new();
        let spawner = InProcessSpawner::new(
            registry.clone(),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new().with_package("com.example.app", Uid(10_050))),
            WorkerConfig::default(),
        );
        spawner.spawn(request(CALCULATOR_CLASS)).await.unwrap();
        for _ in 0..100 {
            if !spawner.worker_handles().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.live_keys().await.len(), 2);

        let worker = spawner.take_workers().pop().unwrap();
        worker.crash();
        assert_eq!(worker.wait().await, None);
        assert!(registry.live_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_in_process_startup_failure() {
        let spawner = InProcessSpawner::new(
            LocalRegistry::new(),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new()),
            WorkerConfig::default(),
        );
        spawner.spawn(request(CALCULATOR_CLASS)).await.unwrap();
        let worker = spawner.take_workers().pop().unwrap();
        assert_eq!(worker.wait().await, Some(WorkerExit::StartupFailed));
    }

    #[tokio::test]
    async fn test_finished_workers_are_pruned_on_next_spawn() {
        let spawner = InProcessSpawner::new(
            LocalRegistry::new(),
            Arc::new(test_catalog()),
            Arc::new(StaticDirectory::new()),
            WorkerConfig::default(),
        );
        let all_finished = |spawner: &InProcessSpawner| {
            spawner.workers.lock().unwrap().iter().all(SimulatedWorker::is_finished)
        };

        for _ in 0..3 {
            spawner.spawn(request(CALCULATOR_CLASS)).await.unwrap();
            for _ in 0..100 {
                if all_finished(&spawner) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(all_finished(&spawner));
            assert_eq!(spawner.workers.lock().unwrap().len(), 1);
        }
        assert_eq!(spawner.spawn_count(), 3);
    }
}
