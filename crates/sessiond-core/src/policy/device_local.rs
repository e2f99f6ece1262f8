//! Policy for device-local accounts.
//!
//! Device-local accounts (kiosk and public sessions) are declared in
//! device policy. Each account gets its own store under a root-owned
//! directory; signatures are validated against the device owner key
//! only, and key rotation is never allowed. Account ids come from the
//! wire, so they are escaped before touching the filesystem.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::warn;

use super::envelope::{DeviceSettings, PolicyEnvelope};
use super::service::{PersistJob, Persister, StoreCompletion};
use super::store::PolicyStore;
use crate::error::SessionError;
use crate::owner_key::OwnerKey;

/// Policy stores for all configured device-local accounts.
pub struct DeviceLocalAccountPolicyService {
    root: PathBuf,
    allowed: HashSet<String>,
    stores: HashMap<String, PolicyStore>,
    persister: Persister,
}

impl DeviceLocalAccountPolicyService {
    /// Creates the service rooted at the accounts directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, persister: Persister) -> Self {
        Self {
            root: root.into(),
            allowed: HashSet::new(),
            stores: HashMap::new(),
            persister,
        }
    }

    /// Refreshes the set of configured accounts from device settings.
    pub fn update_device_settings(&mut self, settings: &DeviceSettings) {
        self.allowed = settings.device_local_accounts.iter().cloned().collect();
        self.stores.retain(|id, _| self.allowed.contains(id));
    }

    /// Verifies and stores a policy blob for `account_id`.
    ///
    /// The signature must verify under `owner_key`; any key-change
    /// request in the envelope is refused.
    ///
    /// # Errors
    ///
    /// - [`SessionError::IllegalService`] for unconfigured accounts.
    /// - [`SessionError::NoOwnerKey`] before an owner key exists.
    /// - [`SessionError::VerifyFail`] for parse or signature failure.
    pub fn store(
        &mut self,
        account_id: &str,
        blob: &[u8],
        owner_key: &OwnerKey,
        completion: StoreCompletion,
    ) -> Result<(), SessionError> {
        match self.store_impl(account_id, blob, owner_key) {
            Ok(job) => {
                let mut job = job;
                job.completion = Some(completion);
                self.persister.submit(job);
                Ok(())
            }
            Err(e) => {
                completion.finish(Err(e));
                Err(e)
            }
        }
    }

    fn store_impl(
        &mut self,
        account_id: &str,
        blob: &[u8],
        owner_key: &OwnerKey,
    ) -> Result<PersistJob, SessionError> {
        let Ok(envelope) = PolicyEnvelope::parse(blob) else {
            return Err(SessionError::VerifyFail);
        };
        let data = envelope
            .policy_data
            .as_deref()
            .ok_or(SessionError::VerifyFail)?;
        let signature = envelope
            .policy_data_signature
            .as_deref()
            .ok_or(SessionError::VerifyFail)?;

        if !owner_key.is_populated() {
            return Err(SessionError::NoOwnerKey);
        }
        // Key rotation is never allowed for device-local accounts.
        if envelope
            .new_public_key
            .as_deref()
            .map_or(false, |k| !owner_key.equals(k))
        {
            warn!(account_id, "device-local account policy tried to change keys");
            return Err(SessionError::VerifyFail);
        }
        if !owner_key.verify(data, signature) {
            return Err(SessionError::VerifyFail);
        }

        let store = self.store_for(account_id)?;
        store.set(envelope);
        Ok(PersistJob {
            key_op: None,
            announce_key: false,
            policy_write: Some((store.policy_file().to_path_buf(), store.encoded())),
            completion: None,
        })
    }

    /// Returns the serialized policy for `account_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalService`] for unconfigured
    /// accounts.
    pub fn retrieve(&mut self, account_id: &str) -> Result<Vec<u8>, SessionError> {
        Ok(self.store_for(account_id)?.encoded())
    }

    fn store_for(&mut self, account_id: &str) -> Result<&mut PolicyStore, SessionError> {
        if !self.allowed.contains(account_id) {
            warn!(account_id, "unknown device-local account");
            return Err(SessionError::IllegalService);
        }
        Ok(self
            .stores
            .entry(account_id.to_string())
            .or_insert_with(|| {
                let mut store =
                    PolicyStore::new(self.root.join(escape_account_id(account_id)).join("policy"));
                if let Err(e) = store.load_or_create() {
                    warn!(error = %e, account_id, "device-local policy failed to load");
                }
                store
            }))
    }
}

/// Escapes an account id so it cannot traverse paths: alphanumerics,
/// `-`, and `_` pass through, every other byte becomes `%XX`.
#[must_use]
pub fn escape_account_id(account_id: &str) -> String {
    let mut escaped = String::with_capacity(account_id.len());
    for byte in account_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}
