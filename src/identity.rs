//! Principals, process credentials and service names.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::liveness::LivenessToken;

/// Suffix appended to a service name to form its control endpoint key.
pub const CONTROL_SUFFIX: &str = ".Control";

/// Numeric principal a process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    pub const ROOT: Uid = Uid(0);

    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Effective uid of the current OS process.
    #[cfg(unix)]
    pub fn current() -> Self {
        Uid(nix::unistd::geteuid().as_raw())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process id. Simulated processes draw ids from a private counter so they
/// never collide with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

static NEXT_SIMULATED_PID: AtomicU32 = AtomicU32::new(40_000);

impl Pid {
    pub fn current() -> Self {
        Pid(std::process::id())
    }

    pub fn next_simulated() -> Self {
        Pid(NEXT_SIMULATED_PID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever issued a call.
///
/// Only the registry transport constructs this, from the credentials its
/// client was connected with. Call frames carry no identity of their own,
/// and code outside the crate can read one but never build one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub(crate) uid: Uid,
    pub(crate) pid: Pid,
}

impl CallerIdentity {
    pub(crate) fn new(uid: Uid, pid: Pid) -> Self {
        Self { uid, pid }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} pid={}", self.uid, self.pid)
    }
}

/// Credentials a process presents when it connects to the registry.
///
/// `liveness` dies with the process; everything the process publishes dies
/// with it.
#[derive(Debug, Clone)]
pub struct ProcessCredentials {
    pub uid: Uid,
    pub pid: Pid,
    pub liveness: LivenessToken,
}

impl ProcessCredentials {
    pub fn caller(&self) -> CallerIdentity {
        CallerIdentity::new(self.uid, self.pid)
    }
}

/// Registry name of a proxied interface, derived from its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    name: String,
}

impl ServiceIdentity {
    /// Validate a descriptor.
    ///
    /// Names ending in [`CONTROL_SUFFIX`] are refused, otherwise one
    /// interface's service key could equal another's control key.
    pub fn new(descriptor: impl Into<String>) -> Result<Self, IdentityError> {
        let name = descriptor.into();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(IdentityError::Whitespace(name));
        }
        if name.ends_with(CONTROL_SUFFIX) {
            return Err(IdentityError::ReservedSuffix(name));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the business-interface endpoint.
    pub fn service_key(&self) -> String {
        self.name.clone()
    }

    /// Key of the lifecycle control endpoint.
    pub fn control_key(&self) -> String {
        format!("{}{}", self.name, CONTROL_SUFFIX)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
