//! On-disk storage for one scope's policy envelope.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use super::envelope::PolicyEnvelope;
use crate::fs_safe::{self, FsError};

/// Upper bound on a policy file read.
const MAX_POLICY_FILE_SIZE: u64 = 1024 * 1024;

/// Errors from policy-store operations.
#[derive(Debug, Error)]
pub enum PolicyStoreError {
    /// The on-disk envelope could not be parsed.
    ///
    /// Recoverable: the store stays usable and a subsequent valid
    /// `set` + `persist` overwrites the bad file.
    #[error("policy file {} could not be parsed", path.display())]
    ParseFailure {
        /// Offending policy file.
        path: PathBuf,
    },

    /// Filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Holds one scope's policy envelope and its backing file.
#[derive(Debug)]
pub struct PolicyStore {
    policy_file: PathBuf,
    policy: PolicyEnvelope,
}

impl PolicyStore {
    /// Creates an empty store backed by `policy_file`.
    #[must_use]
    pub fn new(policy_file: impl Into<PathBuf>) -> Self {
        Self {
            policy_file: policy_file.into(),
            policy: PolicyEnvelope::default(),
        }
    }

    /// Loads the envelope from disk, or starts empty if the file is
    /// missing.
    ///
    /// # Errors
    ///
    /// [`PolicyStoreError::ParseFailure`] is reported but leaves the
    /// store usable; other errors indicate filesystem trouble.
    pub fn load_or_create(&mut self) -> Result<(), PolicyStoreError> {
        if !self.policy_file.exists() {
            info!(path = %self.policy_file.display(), "creating new policy store");
            return Ok(());
        }
        let bytes = fs_safe::bounded_read(&self.policy_file, MAX_POLICY_FILE_SIZE)?;
        match PolicyEnvelope::parse(&bytes) {
            Ok(envelope) => {
                self.policy = envelope;
                Ok(())
            }
            Err(_) => {
                warn!(path = %self.policy_file.display(), "policy file failed to parse");
                Err(PolicyStoreError::ParseFailure {
                    path: self.policy_file.clone(),
                })
            }
        }
    }

    /// The current envelope.
    #[must_use]
    pub const fn get(&self) -> &PolicyEnvelope {
        &self.policy
    }

    /// Replaces the current envelope in memory.
    pub fn set(&mut self, envelope: PolicyEnvelope) {
        self.policy = envelope;
    }

    /// Serialized form of the current envelope.
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        self.policy.to_bytes()
    }

    /// Backing file path.
    #[must_use]
    pub fn policy_file(&self) -> &Path {
        &self.policy_file
    }

    /// True if the backing file is missing or zero-length.
    #[must_use]
    pub fn on_disk_missing_or_empty(&self) -> bool {
        std::fs::metadata(&self.policy_file).map_or(true, |m| m.len() == 0)
    }

    /// Persists the current envelope atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyStoreError::Fs`] on write failure.
    pub fn persist(&self) -> Result<(), PolicyStoreError> {
        fs_safe::atomic_write(&self.policy_file, &self.encoded())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PolicyStore::new(dir.path().join("policy"));
        store.load_or_create().unwrap();
        assert!(store.get().is_empty());
        assert!(store.on_disk_missing_or_empty());
    }

    #[test]
    fn set_persist_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy");

        let envelope = PolicyEnvelope {
            policy_data: Some(b"data".to_vec()),
            policy_data_signature: Some(b"sig".to_vec()),
            ..Default::default()
        };

        let mut store = PolicyStore::new(&path);
        store.load_or_create().unwrap();
        store.set(envelope.clone());
        store.persist().unwrap();
        assert!(!store.on_disk_missing_or_empty());

        let mut reloaded = PolicyStore::new(&path);
        reloaded.load_or_create().unwrap();
        assert_eq!(*reloaded.get(), envelope);
    }

    #[test]
    fn parse_failure_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy");
        std::fs::write(&path, b"\xff\xff\xff\xffnot a policy").unwrap();

        let mut store = PolicyStore::new(&path);
        assert!(matches!(
            store.load_or_create(),
            Err(PolicyStoreError::ParseFailure { .. })
        ));

        // A subsequent valid set + persist overwrites the bad file.
        let envelope = PolicyEnvelope {
            policy_data: Some(b"fresh".to_vec()),
            ..Default::default()
        };
        store.set(envelope.clone());
        store.persist().unwrap();

        let mut reloaded = PolicyStore::new(&path);
        reloaded.load_or_create().unwrap();
        assert_eq!(*reloaded.get(), envelope);
    }
}
