//! Device-scope policy: owner login handling and key custody.
//!
//! The device policy service owns the owner key exclusively. On top of
//! the base store/verify behavior it recognizes the owner (a policy
//! with no enrollment token whose `username` matches), synthesizes
//! owner whitelist entries on first login, validates freshly generated
//! owner keys, and invokes key-loss mitigation when the recorded owner
//! cannot exercise the private key.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::envelope::{DeviceSettings, PolicyEnvelope, DEVICE_POLICY_TYPE};
use super::service::{KeyFlags, PersistJob, Persister, PolicyService, StoreCompletion};
use super::store::{PolicyStore, PolicyStoreError};
use crate::crypto::{self, keystore::KeySlot};
use crate::error::SessionError;
use crate::events::{Signal, SignalEmitter};
use crate::fs_safe;
use crate::mitigator::RegenMitigator;
use crate::owner_key::{OwnerKey, OwnerKeyError};

/// First sentinel wrapping policy-provided browser flags.
pub const POLICY_SWITCHES_BEGIN: &str = "--policy-switches-begin";

/// Second sentinel wrapping policy-provided browser flags.
pub const POLICY_SWITCHES_END: &str = "--policy-switches-end";

/// Fatal initialization failures; the daemon must not start without a
/// readable ownership state.
#[derive(Debug, Error)]
pub enum DevicePolicyError {
    /// The owner key on disk is corrupt or unreadable.
    #[error("owner key unusable: {0}")]
    OwnerKey(#[from] OwnerKeyError),
}

/// Policy service specialized for device scope.
pub struct DevicePolicyService {
    inner: PolicyService,
    mitigator: RegenMitigator,
    emitter: Arc<dyn SignalEmitter>,
    serial_recovery_flag: PathBuf,
}

impl DevicePolicyService {
    /// Assembles the device policy service.
    #[must_use]
    pub fn new(
        key: OwnerKey,
        store: PolicyStore,
        persister: Persister,
        mitigator: RegenMitigator,
        emitter: Arc<dyn SignalEmitter>,
        serial_recovery_flag: PathBuf,
    ) -> Self {
        Self {
            inner: PolicyService::new(key, store, persister, true, "device"),
            mitigator,
            emitter,
            serial_recovery_flag,
        }
    }

    /// Loads ownership state from disk.
    ///
    /// A corrupt owner key is fatal; an unparseable policy file is
    /// logged and overwritten by the next valid store.
    ///
    /// # Errors
    ///
    /// Returns [`DevicePolicyError`] for an unusable owner key.
    pub fn initialize(&mut self) -> Result<(), DevicePolicyError> {
        self.inner.key_mut().populate_from_disk_if_possible()?;
        match self.inner.store_mut().load_or_create() {
            Ok(()) => {}
            Err(PolicyStoreError::ParseFailure { path }) => {
                warn!(path = %path.display(), "could not load existing device settings, continuing");
            }
            Err(PolicyStoreError::Fs(e)) => {
                warn!(error = %e, "could not read device policy, continuing");
            }
        }
        self.update_serial_sentinel();
        Ok(())
    }

    /// Read-only view of the owner key, stable for one handler.
    #[must_use]
    pub const fn key(&self) -> &OwnerKey {
        self.inner.key()
    }

    /// True once the disk was checked and no owner key was found.
    #[must_use]
    pub fn key_missing(&self) -> bool {
        self.inner.key().have_checked_disk() && !self.inner.key().is_populated()
    }

    /// True while a key-loss mitigation is in flight.
    #[must_use]
    pub const fn mitigating(&self) -> bool {
        self.mitigator.mitigating()
    }

    /// Decoded device settings; empty settings if none stored.
    #[must_use]
    pub fn settings(&self) -> DeviceSettings {
        self.inner
            .store()
            .get()
            .decode_data()
            .and_then(|d| d.decode_settings())
            .unwrap_or_default()
    }

    /// Determines whether `current_user` can act as the owner, fixing
    /// up ownership records or starting mitigation as needed.
    ///
    /// Returns whether the user is the recorded owner.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoOwnerKey`] if a required mitigation
    /// could not be started.
    pub fn check_and_handle_owner_login(
        &mut self,
        current_user: &str,
        slot: &dyn KeySlot,
    ) -> Result<bool, SessionError> {
        let can_access_key = self.inner.key().is_populated()
            && slot.private_key_for(self.inner.key().public_key()).is_some();
        if can_access_key {
            if let Err(e) = self.store_owner_properties(current_user, slot) {
                warn!(error = %e, "could not update owner properties at login");
            }
        }

        // The flip side: if policy names this user as owner but the
        // keystore cannot exercise the key, the key pair is lost.
        let is_owner = self.current_user_is_owner(current_user);
        if is_owner && !can_access_key {
            self.mitigator
                .mitigate(current_user)
                .map_err(|_| SessionError::NoOwnerKey)?;
        }
        Ok(is_owner)
    }

    /// Validates a freshly generated owner public key and takes (or
    /// re-takes) ownership with it.
    ///
    /// `completion`, when supplied, resolves after key and policy
    /// persistence have been attempted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalPubkey`] when the blob is
    /// malformed, the user's keystore cannot exercise it, or the key
    /// store refuses the install; an `OwnerKeySet=false` signal
    /// accompanies every failure.
    pub fn validate_and_store_owner_key(
        &mut self,
        current_user: &str,
        key_blob: &[u8],
        slot: &dyn KeySlot,
        completion: Option<StoreCompletion>,
    ) -> Result<(), SessionError> {
        let result = self.validate_and_store_impl(current_user, key_blob, slot, completion);
        // Mitigation stays marked until this call returns.
        self.mitigator.complete();
        result
    }

    fn validate_and_store_impl(
        &mut self,
        current_user: &str,
        key_blob: &[u8],
        slot: &dyn KeySlot,
        completion: Option<StoreCompletion>,
    ) -> Result<(), SessionError> {
        if !crypto::check_public_key_blob(key_blob) || slot.private_key_for(key_blob).is_none() {
            self.emitter.emit(Signal::OwnerKeySet(false));
            return Err(SessionError::IllegalPubkey);
        }

        let installed = if self.mitigator.mitigating() {
            if self.inner.key().is_populated() {
                self.inner.key_mut().clobber_compromised_key(key_blob)
            } else {
                self.inner.key_mut().populate_from_buffer(key_blob)
            }
        } else {
            // Re-taking ownership outside mitigation starts policy over.
            self.inner.store_mut().set(PolicyEnvelope::default());
            self.inner.key_mut().populate_from_buffer(key_blob)
        };
        if installed.is_err() {
            self.emitter.emit(Signal::OwnerKeySet(false));
            return Err(SessionError::IllegalPubkey);
        }

        let props_stored = match self.store_owner_properties(current_user, slot) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "could not immediately store owner properties in policy");
                false
            }
        };

        let key_op = match self.inner.key().prepare_persist() {
            Ok(op) => Some(op),
            Err(e) => {
                warn!(error = %e, "owner key cannot be persisted");
                None
            }
        };
        self.inner.persister().submit(PersistJob {
            key_op,
            announce_key: true,
            policy_write: props_stored.then(|| {
                (
                    self.inner.store().policy_file().to_path_buf(),
                    self.inner.store().encoded(),
                )
            }),
            completion,
        });
        Ok(())
    }

    /// Ensures the device policy names `current_user` as owner and
    /// whitelists them, synthesizing and signing a fresh envelope when
    /// anything is missing. A store that already records all of it is a
    /// no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalPubkey`] when the envelope cannot
    /// be signed with the owner's private key.
    pub fn store_owner_properties(
        &mut self,
        current_user: &str,
        slot: &dyn KeySlot,
    ) -> Result<(), SessionError> {
        let envelope = self.inner.store().get().clone();
        let mut poldata = envelope.decode_data().unwrap_or_default();
        let mut settings = if poldata.policy_type.as_deref() == Some(DEVICE_POLICY_TYPE) {
            poldata.decode_settings().unwrap_or_default()
        } else {
            poldata.policy_type = Some(DEVICE_POLICY_TYPE.to_string());
            DeviceSettings::default()
        };

        let on_list = settings.user_whitelist.iter().any(|u| u == current_user);
        let key_current = envelope
            .new_public_key
            .as_deref()
            .map_or(false, |k| self.inner.key().equals(k));
        if poldata.username.as_deref() == Some(current_user) && on_list && key_current {
            return Ok(());
        }

        if !on_list {
            settings.user_whitelist.push(current_user.to_string());
            if settings.allow_new_users.is_none() {
                settings.allow_new_users = Some(true);
            }
        }
        poldata.username = Some(current_user.to_string());
        poldata.policy_value = Some(settings.to_bytes());

        let new_data = poldata.to_bytes();
        let signature = self
            .inner
            .key()
            .sign(slot, &new_data)
            .map_err(|_| SessionError::IllegalPubkey)?;

        let mut new_policy = envelope;
        new_policy.policy_data = Some(new_data);
        new_policy.policy_data_signature = Some(signature);
        new_policy.new_public_key = Some(self.inner.key().public_key().to_vec());
        self.inner.store_mut().set(new_policy);
        info!(username = current_user, "owner properties written to device policy");
        Ok(())
    }

    /// Owner-recognition rule: no enrollment token and a matching
    /// `username`. Enterprise-enrolled devices have no consumer owner.
    #[must_use]
    pub fn current_user_is_owner(&self, current_user: &str) -> bool {
        self.inner.store().get().decode_data().map_or(false, |d| {
            !d.is_enterprise() && d.username.as_deref() == Some(current_user)
        })
    }

    /// Stores a device policy blob; `KEY_ROTATE` and friends arrive
    /// from the session manager according to session state.
    ///
    /// # Errors
    ///
    /// See [`PolicyService::store_blob`].
    pub fn store(
        &mut self,
        blob: &[u8],
        flags: KeyFlags,
        completion: StoreCompletion,
    ) -> Result<(), SessionError> {
        let result = self.inner.store_blob(blob, flags, completion);
        if result.is_ok() {
            self.update_serial_sentinel();
        }
        result
    }

    /// Returns the serialized device policy envelope.
    #[must_use]
    pub fn retrieve(&self) -> Vec<u8> {
        self.inner.retrieve()
    }

    /// Persists the device policy synchronously; used on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyStoreError`] on write failure.
    pub fn persist_policy_sync(&self) -> Result<(), PolicyStoreError> {
        self.inner.persist_policy_sync()
    }

    /// Extracts the browser start-up flags from the decoded policy.
    ///
    /// Empty, `-`, and `--` entries are dropped; entries without a dash
    /// are normalized to `--entry`; a non-empty result is wrapped in
    /// the policy-switches sentinels.
    #[must_use]
    pub fn get_start_up_flags(&self) -> Vec<String> {
        let settings = self.settings();
        let mut flags = Vec::new();
        for raw in &settings.start_up_flags {
            if raw.is_empty() || raw == "-" || raw == "--" {
                continue;
            }
            if raw.starts_with('-') {
                flags.push(raw.clone());
            } else {
                flags.push(format!("--{raw}"));
            }
        }
        if flags.is_empty() {
            return flags;
        }
        let mut wrapped = Vec::with_capacity(flags.len() + 2);
        wrapped.push(POLICY_SWITCHES_BEGIN.to_string());
        wrapped.append(&mut flags);
        wrapped.push(POLICY_SWITCHES_END.to_string());
        wrapped
    }

    /// Maintains the serial-recovery sentinel: present iff the policy
    /// is enrolled and marks the serial number missing, or the policy
    /// file is missing/empty.
    pub fn update_serial_sentinel(&self) {
        // Policy persistence is asynchronous; only count the file as
        // absent while the in-memory envelope is empty too.
        let needs_recovery = self
            .inner
            .store()
            .get()
            .decode_data()
            .map_or(false, |d| {
                d.is_enterprise() && d.valid_serial_number_missing == Some(true)
            })
            || (self.inner.store().get().is_empty()
                && self.inner.store().on_disk_missing_or_empty());

        let result = if needs_recovery {
            fs_safe::atomic_write(&self.serial_recovery_flag, b"")
        } else {
            fs_safe::remove_if_exists(&self.serial_recovery_flag)
        };
        if let Err(e) = result {
            warn!(error = %e, "could not update serial-recovery sentinel");
        }
    }
}
