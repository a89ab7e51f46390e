//! Run a service under another identity and talk to it through an ordinary
//! call interface.
//!
//! ```text
//!  client process (uid = package owner)          worker process (uid = target)
//!  ────────────────────────────────────          ─────────────────────────────
//!  ServiceProxy::activate()
//!    ├─ PrivilegeSpawner::spawn ───────────────▶ rootservice worker -p <pkg> -s <class>
//!    │                                             ├─ publish <name>
//!    │                                             └─ publish <name>.Control
//!    ├─ poll registry (8 × 250 ms)  ◀─── LocalRegistry ───┘
//!    ├─ bindToken(liveness) ───────────────────▶ death observer ──▶ die()
//!    └─ ForwardingHandle ──── calls ──────────▶ CallAuthenticator ──▶ stub ──▶ impl
//! ```
//!
//! Interfaces are declared with [`service_interface!`], which generates a
//! typed trait, a worker-side stub and a client-side proxy.

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod liveness;
pub mod registry;
pub mod service;
pub mod spawner;
pub mod testing;
pub mod worker;

pub use client::{ClientBindingState, ServiceProxy};
pub use config::ProxyConfig;
pub use error::{CallError, ProxyError};
pub use identity::{CallerIdentity, ServiceIdentity, Uid};
pub use registry::{ForwardingHandle, LocalRegistry, ServiceRegistry};
pub use service::{AccessPolicy, KillAccess, RootService, ServiceCatalog};
pub use spawner::{CommandSpawner, InProcessSpawner, PrivilegeSpawner};
pub use worker::{WorkerController, WorkerExit};
