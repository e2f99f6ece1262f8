//! Owner-key loss mitigation.
//!
//! When the device policy names the current user as owner but their
//! keystore cannot exercise the private key, the key pair is lost and
//! must be regenerated. The mitigator asks the supervisor (through
//! [`GeneratorLauncher`], breaking the back-reference) to run the
//! key-generator worker as the user; the session manager imports the
//! produced public key, at which point mitigation completes.

use thiserror::Error;
use tracing::{info, warn};

/// Errors from [`RegenMitigator::mitigate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MitigationError {
    /// A mitigation is already in progress; at most one may run.
    #[error("a key-loss mitigation is already in progress")]
    AlreadyMitigating,

    /// The key-generator worker could not be launched.
    #[error("failed to launch the key generator")]
    LaunchFailed,
}

/// Launches the key-generator worker for a user.
///
/// Implemented by the daemon on top of the child supervisor; the
/// mitigator never holds a supervisor reference directly.
pub trait GeneratorLauncher: Send {
    /// Requests a key-generation run impersonating `username`.
    fn launch(&self, username: &str) -> bool;
}

/// Tracks the single allowed in-flight mitigation.
pub struct RegenMitigator {
    mitigating: bool,
    launcher: Box<dyn GeneratorLauncher>,
}

impl RegenMitigator {
    /// Creates a mitigator that launches workers through `launcher`.
    #[must_use]
    pub fn new(launcher: Box<dyn GeneratorLauncher>) -> Self {
        Self {
            mitigating: false,
            launcher,
        }
    }

    /// True while a mitigation is in flight.
    #[must_use]
    pub const fn mitigating(&self) -> bool {
        self.mitigating
    }

    /// Starts mitigation for `username`.
    ///
    /// The flag stays set until [`complete`](Self::complete) is called
    /// after the regenerated key has been imported and stored.
    ///
    /// # Errors
    ///
    /// Returns [`MitigationError`] if one is already in progress or the
    /// worker cannot be launched.
    pub fn mitigate(&mut self, username: &str) -> Result<(), MitigationError> {
        if self.mitigating {
            warn!(username, "refusing concurrent key-loss mitigation");
            return Err(MitigationError::AlreadyMitigating);
        }
        info!(username, "owner key lost; regenerating");
        self.mitigating = true;
        if !self.launcher.launch(username) {
            self.mitigating = false;
            return Err(MitigationError::LaunchFailed);
        }
        Ok(())
    }

    /// Marks the in-flight mitigation as finished.
    pub fn complete(&mut self) {
        self.mitigating = false;
    }
}
