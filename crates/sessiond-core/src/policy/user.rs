//! Per-user policy services.
//!
//! Each user session gets its own policy service whose key and store
//! live under the user's runtime directory, derived from the sanitized
//! user hash. The first `Store` installs the user's signing key;
//! later stores require rotation proof under it.

use std::path::PathBuf;

use tracing::warn;

use super::service::{Persister, PolicyService};
use super::store::PolicyStore;
use crate::error::SessionError;
use crate::owner_key::OwnerKey;
use crate::validate::sanitize_user_name;

/// Produces one policy service per user.
pub struct UserPolicyServiceFactory {
    user_policy_root: PathBuf,
    persister: Persister,
}

impl UserPolicyServiceFactory {
    /// Creates a factory rooted at the per-user runtime directory.
    #[must_use]
    pub fn new(user_policy_root: impl Into<PathBuf>, persister: Persister) -> Self {
        Self {
            user_policy_root: user_policy_root.into(),
            persister,
        }
    }

    /// Builds the policy service for `username`, creating its on-disk
    /// layout if needed and loading whatever state is present.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PolicyInitFail`] when the directory
    /// cannot be created or the key file is unusable.
    pub fn create(&self, username: &str) -> Result<PolicyService, SessionError> {
        let dir = self
            .user_policy_root
            .join(sanitize_user_name(username))
            .join("policy");
        std::fs::create_dir_all(&dir).map_err(|e| {
            warn!(error = %e, "could not create user policy directory");
            SessionError::PolicyInitFail
        })?;

        let mut key = OwnerKey::new(dir.join("key"));
        key.populate_from_disk_if_possible().map_err(|e| {
            warn!(error = %e, username, "user policy key unusable");
            SessionError::PolicyInitFail
        })?;

        let mut store = PolicyStore::new(dir.join("policy"));
        if let Err(e) = store.load_or_create() {
            warn!(error = %e, username, "user policy failed to load, continuing");
        }

        Ok(PolicyService::new(
            key,
            store,
            self.persister.clone(),
            false,
            "user",
        ))
    }
}
