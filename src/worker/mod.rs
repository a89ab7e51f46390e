//! Worker mode: the process spawned under the target identity.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   rootservice worker -p <pkg> -s <class> │
//! │                                          │
//! │   ServiceCatalog ──▶ RootService         │
//! │                                          │
//! │   <name>.Control ──▶ ControlEndpoint     │◀── bindToken / killService
//! │   <name>         ──▶ CallAuthenticator   │◀── forwarded calls
//! │                        └─▶ implementation│
//! │                                          │
//! │   die() ──▶ ShutdownLatch ──▶ signal     │
//! └──────────────────────────────────────────┘
//! ```

pub mod control;
pub mod controller;
pub mod entry;
pub mod shutdown;

pub use control::ControlProxy;
pub use controller::{RunningWorker, WorkerController, WorkerHandle, WorkerState};
pub use entry::{WorkerArgs, WorkerEnvironment, run_worker};

use std::process::ExitCode;

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown signal observed after a `die()`.
    Graceful,
    /// Instantiation, directory lookup or publishing failed.
    StartupFailed,
    /// The command line could not be parsed.
    InvalidArguments,
}

impl WorkerExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Graceful => 0,
            Self::StartupFailed => 1,
            Self::InvalidArguments => 2,
        }
    }
}

impl From<WorkerExit> for ExitCode {
    fn from(exit: WorkerExit) -> Self {
        ExitCode::from(exit.code())
    }
}
