//! Host facts the daemon needs but does not own.

use crate::error::{DaemonError, DaemonResult};

/// Source of the local hostname.
pub trait SystemInfo: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the hostname cannot be determined.
    fn hostname(&self) -> DaemonResult<String>;
}

/// Reads the hostname from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSystem;

impl SystemInfo for HostSystem {
    fn hostname(&self) -> DaemonResult<String> {
        let name = hostname::get()?;
        name.into_string()
            .map_err(|raw| DaemonError::Internal(format!("hostname is not UTF-8: {raw:?}")))
    }
}

/// A fixed hostname, for tests and for running several daemons on one host.
#[derive(Debug, Clone)]
pub struct FixedSystem(pub String);

impl FixedSystem {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self(hostname.into())
    }
}

impl SystemInfo for FixedSystem {
    fn hostname(&self) -> DaemonResult<String> {
        Ok(self.0.clone())
    }
}
