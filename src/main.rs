use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use rootservice::config::ProxyConfig;
use rootservice::directory::SystemUserDirectory;
use rootservice::identity::{Pid, ProcessCredentials, Uid};
use rootservice::liveness::LivenessOwner;
use rootservice::testing::{
    CALCULATOR_CLASS, Calculator, CalculatorProxy, CalculatorService, SimulatedHost,
};
use rootservice::worker::entry::init_tracing;
use rootservice::worker::{WorkerArgs, WorkerController, WorkerEnvironment, WorkerExit};

#[derive(Parser, Debug)]
#[command(name = "rootservice")]
#[command(about = "Run services under another identity behind a call proxy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker from the sample catalog against a registry private to
    /// this process (nothing else can discover it)
    Worker(WorkerArgs),

    /// Activate the sample calculator on a simulated host and call it
    Demo {
        /// Uid of the simulated client process
        #[arg(long, default_value_t = 10_050)]
        client_uid: u32,

        /// Package the client belongs to
        #[arg(long, default_value = "com.example.app")]
        package: String,

        a: i64,
        b: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                WorkerExit::InvalidArguments.into()
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing();

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return WorkerExit::StartupFailed.into();
        }
    };

    match cli.command {
        Command::Worker(args) => run_worker(args, config).await.into(),
        Command::Demo {
            client_uid,
            package,
            a,
            b,
        } => match demo(Uid(client_uid), &package, a, b).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Demo failed");
                ExitCode::FAILURE
            }
        },
    }
}

/// Worker mode. Endpoints go to a registry owned by this process and the
/// catalog is the sample one, so no client outside this process can find
/// the worker. SIGINT triggers the same shutdown path as `killService`.
async fn run_worker(args: WorkerArgs, config: ProxyConfig) -> WorkerExit {
    let process = LivenessOwner::new();
    let (env, _registry) = WorkerEnvironment::standalone(
        ProcessCredentials {
            uid: Uid::current(),
            pid: Pid::current(),
            liveness: process.token(),
        },
        Arc::new(SystemUserDirectory),
        config.worker,
    );
    let controller = WorkerController::new(env.registry, env.catalog, env.directory, env.config);

    controller
        .run_observed(&args.package, &args.service, |handle| {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted");
                    handle.die();
                }
            });
        })
        .await
}

async fn demo(client_uid: Uid, package: &str, a: i64, b: i64) -> anyhow::Result<()> {
    let host = SimulatedHost::calculator(package, client_uid);
    let client = host.process(client_uid);
    let proxy = host.proxy(
        &client,
        Arc::new(CalculatorService::new()),
        CALCULATOR_CLASS,
        package,
    )?;

    let handle = proxy.activate().await?;
    let calculator = CalculatorProxy::new(Arc::new(handle));
    let sum = calculator.add(a, b).await?;
    let uid = calculator.whoami().await?;
    println!("{a} + {b} = {sum} (computed as uid {uid})");

    proxy.deactivate().await;
    for worker in host.spawner().take_workers() {
        let pid = worker.pid();
        let exit = worker.wait().await;
        tracing::info!(pid = %pid, exit = ?exit, "Worker finished");
    }
    Ok(())
}
