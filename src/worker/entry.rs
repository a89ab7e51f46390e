//! Process entry point for workers.

use std::ffi::OsString;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::directory::PackageDirectory;
use crate::identity::ProcessCredentials;
use crate::registry::{LocalRegistry, ServiceRegistry};
use crate::service::ServiceCatalog;
use crate::testing::test_catalog;
use crate::worker::WorkerExit;
use crate::worker::controller::WorkerController;

/// The two parameters every worker is launched with.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Package whose owner is the expected client
    #[arg(short, long)]
    pub package: String,

    /// Service class to instantiate from the catalog
    #[arg(short, long)]
    pub service: String,
}

#[derive(Parser, Debug)]
#[command(name = "rootservice-worker")]
#[command(about = "Run a proxied service under the current identity")]
struct WorkerCli {
    #[command(flatten)]
    args: WorkerArgs,
}

/// Everything a worker needs from its host.
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub registry: Arc<dyn ServiceRegistry>,
    pub catalog: Arc<ServiceCatalog>,
    pub directory: Arc<dyn PackageDirectory>,
    pub config: WorkerConfig,
}

impl WorkerEnvironment {
    /// Environment for the binary's `worker` subcommand.
    ///
    /// The registry is created here and owned by this process alone, and the
    /// catalog is the sample calculator one. No other process can look up
    /// what the worker publishes, so this mode shows the worker entry point
    /// working on its own; clients reach workers through a shared registry
    /// such as the one [`crate::spawner::InProcessSpawner`] uses.
    pub fn standalone(
        credentials: ProcessCredentials,
        directory: Arc<dyn PackageDirectory>,
        config: WorkerConfig,
    ) -> (Self, LocalRegistry) {
        let registry = LocalRegistry::new();
        let env = Self {
            registry: Arc::new(registry.connect(credentials)),
            catalog: Arc::new(test_catalog()),
            directory,
            config,
        };
        (env, registry)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// A second call is a no-op.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rootservice=info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

pub async fn run_worker(args: &WorkerArgs, env: WorkerEnvironment) -> WorkerExit {
    let controller = WorkerController::new(env.registry, env.catalog, env.directory, env.config);
    controller.run(&args.package, &args.service).await
}

/// Parse a worker command line (program name first) and run it.
pub async fn run_from_args<I, T>(argv: I, env: WorkerEnvironment) -> WorkerExit
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match WorkerCli::try_parse_from(argv) {
        Ok(cli) => run_worker(&cli.args, env).await,
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() {
                WorkerExit::InvalidArguments
            } else {
                WorkerExit::Graceful
            }
        }
    }
}
