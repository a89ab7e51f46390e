//! Package owner resolution.
//!
//! The worker authenticates against the uid that owns the client package,
//! never against whoever happens to call `bindToken`.

use std::collections::HashMap;

use crate::error::DirectoryError;
use crate::identity::Uid;

/// Maps a package identity to the uid it runs as.
pub trait PackageDirectory: Send + Sync {
    fn resolve_owner_uid(&self, package: &str) -> Result<Uid, DirectoryError>;
}

/// Fixed in-memory package table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    owners: HashMap<String, Uid>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(mut self, package: impl Into<String>, uid: Uid) -> Self {
        self.owners.insert(package.into(), uid);
        self
    }

    pub fn insert(&mut self, package: impl Into<String>, uid: Uid) {
        self.owners.insert(package.into(), uid);
    }
}

impl PackageDirectory for StaticDirectory {
    fn resolve_owner_uid(&self, package: &str) -> Result<Uid, DirectoryError> {
        self.owners
            .get(package)
            .copied()
            .ok_or_else(|| DirectoryError::PackageNotFound {
                package: package.to_string(),
            })
    }
}

/// Treats a package name as a system user name and resolves it via passwd.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUserDirectory;

#[cfg(unix)]
impl PackageDirectory for SystemUserDirectory {
    fn resolve_owner_uid(&self, package: &str) -> Result<Uid, DirectoryError> {
        if package.is_empty() || package.contains(['/', ':', '\0']) {
            return Err(DirectoryError::Lookup {
                package: package.to_string(),
                reason: "not a valid user name".to_string(),
            });
        }
        match nix::unistd::User::from_name(package) {
            Ok(Some(user)) => Ok(Uid(user.uid.as_raw())),
            Ok(None) => Err(DirectoryError::PackageNotFound {
                package: package.to_string(),
            }),
            Err(e) => Err(DirectoryError::Lookup {
                package: package.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
