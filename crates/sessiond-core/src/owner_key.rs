//! The device owner's public key store.
//!
//! If there is an owner key on disk, it is loaded at startup and any
//! attempt to set a new key programmatically is refused. If no key is
//! present, one may be installed and persisted. All mutating operations
//! are refused until the disk has been checked, and a persisted key is
//! never silently overwritten: only rotation or a compromised-key
//! clobber sets the replacement flag that allows the file to change.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::{self, keystore::KeySlot};
use crate::fs_safe::{self, FsError};

/// Upper bound on the owner-key file; anything larger is corruption.
const MAX_KEY_FILE_SIZE: u64 = 8 * 1024;

/// Errors from owner-key operations.
#[derive(Debug, Error)]
pub enum OwnerKeyError {
    /// A mutating operation was attempted before the disk was checked.
    #[error("owner key disk state has not been checked yet")]
    DiskNotChecked,

    /// A populate was attempted while a key is already held.
    #[error("an owner key is already populated")]
    AlreadyPopulated,

    /// A rotate or clobber was attempted without a current key.
    #[error("no owner key is populated yet")]
    NotPopulated,

    /// Persist would overwrite an on-disk key without replacement rights.
    #[error("refusing to overwrite existing owner key on disk")]
    WouldOverwrite,

    /// The on-disk key bytes are not a well-formed public key.
    #[error("owner key file {} is corrupted", path.display())]
    Corrupt {
        /// Offending key file.
        path: PathBuf,
    },

    /// The supplied buffer is not a well-formed public key.
    #[error("buffer is not a well-formed public key")]
    MalformedKey,

    /// A rotation signature did not verify under the current key.
    #[error("invalid signature on new key")]
    BadRotationSignature,

    /// The keystore slot does not hold the matching private key.
    #[error("private half of the owner key is not available")]
    NoPrivateKey,

    /// Filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// A single file write or removal, produced by [`OwnerKey::prepare_persist`]
/// so persistence can run on the I/O task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFileOp {
    /// Write these bytes to the path atomically.
    Write(PathBuf, Vec<u8>),
    /// Remove the file if present.
    Remove(PathBuf),
}

impl KeyFileOp {
    /// Executes the operation.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] on filesystem failure.
    pub fn execute(&self) -> Result<(), FsError> {
        match self {
            Self::Write(path, bytes) => fs_safe::atomic_write(path, bytes),
            Self::Remove(path) => fs_safe::remove_if_exists(path),
        }
    }
}

/// Holds the device owner's public key and its lifecycle flags.
#[derive(Debug)]
pub struct OwnerKey {
    key_file: PathBuf,
    key: Vec<u8>,
    have_checked_disk: bool,
    have_replaced: bool,
}

impl OwnerKey {
    /// Creates an unpopulated key store backed by `key_file`.
    #[must_use]
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            key: Vec::new(),
            have_checked_disk: false,
            have_replaced: false,
        }
    }

    /// True once the disk has been checked for a key.
    #[must_use]
    pub const fn have_checked_disk(&self) -> bool {
        self.have_checked_disk
    }

    /// True if a key is currently held.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        !self.key.is_empty()
    }

    /// The current public-key blob; empty if unpopulated.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.key
    }

    /// Backing file path.
    #[must_use]
    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// Byte-equality against the held key; two empty keys are equal.
    #[must_use]
    pub fn equals(&self, other: &[u8]) -> bool {
        self.key == other
    }

    /// Loads the key from disk if the file exists.
    ///
    /// A missing file is success with an empty key. Corruption (a file
    /// that is over-sized, unreadable, or not a well-formed public key)
    /// is a hard failure that leaves the key unpopulated.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::Corrupt`] or [`OwnerKeyError::Fs`].
    pub fn populate_from_disk_if_possible(&mut self) -> Result<(), OwnerKeyError> {
        self.have_checked_disk = true;
        if !self.key_file.exists() {
            info!(path = %self.key_file.display(), "no owner key on disk");
            return Ok(());
        }

        let bytes = match fs_safe::bounded_read(&self.key_file, MAX_KEY_FILE_SIZE) {
            Ok(bytes) => bytes,
            Err(FsError::FileTooLarge { .. }) => {
                return Err(OwnerKeyError::Corrupt {
                    path: self.key_file.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if !crypto::check_public_key_blob(&bytes) {
            return Err(OwnerKeyError::Corrupt {
                path: self.key_file.clone(),
            });
        }
        self.key = bytes;
        Ok(())
    }

    /// Installs a key from a buffer.
    ///
    /// Only legal after the disk has been checked and while no key is
    /// held.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::DiskNotChecked`],
    /// [`OwnerKeyError::AlreadyPopulated`], or
    /// [`OwnerKeyError::MalformedKey`].
    pub fn populate_from_buffer(&mut self, public_key: &[u8]) -> Result<(), OwnerKeyError> {
        if !self.have_checked_disk {
            warn!("haven't checked disk for owner key yet");
            return Err(OwnerKeyError::DiskNotChecked);
        }
        if self.is_populated() {
            return Err(OwnerKeyError::AlreadyPopulated);
        }
        if !crypto::check_public_key_blob(public_key) {
            return Err(OwnerKeyError::MalformedKey);
        }
        self.key = public_key.to_vec();
        Ok(())
    }

    /// Installs the public half of a keypair.
    ///
    /// # Errors
    ///
    /// Same conditions as [`populate_from_buffer`](Self::populate_from_buffer).
    pub fn populate_from_keypair(
        &mut self,
        pair: &ed25519_dalek::SigningKey,
    ) -> Result<(), OwnerKeyError> {
        self.populate_from_buffer(&crypto::public_key_blob(pair))
    }

    /// Computes the write (or removal) that would persist the current
    /// state, enforcing the no-silent-overwrite invariant.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::DiskNotChecked`] or
    /// [`OwnerKeyError::WouldOverwrite`].
    pub fn prepare_persist(&self) -> Result<KeyFileOp, OwnerKeyError> {
        if !self.have_checked_disk {
            return Err(OwnerKeyError::DiskNotChecked);
        }
        if !self.have_replaced && self.key_file.exists() {
            warn!(path = %self.key_file.display(), "tried to overwrite owner key");
            return Err(OwnerKeyError::WouldOverwrite);
        }
        if self.key.is_empty() {
            Ok(KeyFileOp::Remove(self.key_file.clone()))
        } else {
            Ok(KeyFileOp::Write(self.key_file.clone(), self.key.clone()))
        }
    }

    /// Persists the current state synchronously.
    ///
    /// # Errors
    ///
    /// Same conditions as [`prepare_persist`](Self::prepare_persist),
    /// plus filesystem failure.
    pub fn persist(&self) -> Result<(), OwnerKeyError> {
        let op = self.prepare_persist()?;
        op.execute()?;
        Ok(())
    }

    /// Rotates to `public_key`, which must carry a `signature` over its
    /// bytes verifiable under the current key.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::NotPopulated`] or
    /// [`OwnerKeyError::BadRotationSignature`].
    pub fn rotate(&mut self, public_key: &[u8], signature: &[u8]) -> Result<(), OwnerKeyError> {
        if !self.is_populated() {
            return Err(OwnerKeyError::NotPopulated);
        }
        if !self.verify(public_key, signature) {
            warn!("invalid signature on new owner key");
            return Err(OwnerKeyError::BadRotationSignature);
        }
        self.key = public_key.to_vec();
        self.have_replaced = true;
        Ok(())
    }

    /// Replaces a compromised key unconditionally; mitigation only.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::DiskNotChecked`] or
    /// [`OwnerKeyError::NotPopulated`].
    pub fn clobber_compromised_key(&mut self, public_key: &[u8]) -> Result<(), OwnerKeyError> {
        if !self.have_checked_disk {
            return Err(OwnerKeyError::DiskNotChecked);
        }
        if !self.is_populated() {
            return Err(OwnerKeyError::NotPopulated);
        }
        self.key = public_key.to_vec();
        self.have_replaced = true;
        Ok(())
    }

    /// Verifies `signature` over `data` under the held key.
    #[must_use]
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        crypto::verify_signature(&self.key, data, signature)
    }

    /// Signs `data` with the private half of the held key, obtained
    /// through the caller's keystore slot.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerKeyError::NoPrivateKey`] if the slot does not hold
    /// the matching private key.
    pub fn sign(&self, slot: &dyn KeySlot, data: &[u8]) -> Result<Vec<u8>, OwnerKeyError> {
        let private = slot
            .private_key_for(&self.key)
            .ok_or(OwnerKeyError::NoPrivateKey)?;
        Ok(crypto::sign(&private, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_signing_key, public_key_blob, sign};

    fn checked_key(dir: &Path) -> OwnerKey {
        let mut key = OwnerKey::new(dir.join("owner.key"));
        key.populate_from_disk_if_possible().unwrap();
        key
    }

    #[test]
    fn missing_file_is_success_with_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = checked_key(dir.path());
        assert!(key.have_checked_disk());
        assert!(!key.is_populated());
    }

    #[test]
    fn mutations_refused_before_disk_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = OwnerKey::new(dir.path().join("owner.key"));
        let pair = generate_signing_key();

        assert!(matches!(
            key.populate_from_buffer(&public_key_blob(&pair)),
            Err(OwnerKeyError::DiskNotChecked)
        ));
        assert!(matches!(
            key.prepare_persist(),
            Err(OwnerKeyError::DiskNotChecked)
        ));
        assert!(matches!(
            key.clobber_compromised_key(&public_key_blob(&pair)),
            Err(OwnerKeyError::DiskNotChecked)
        ));
    }

    #[test]
    fn persist_round_trips_byte_identically() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_signing_key();
        let blob = public_key_blob(&pair);

        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&blob).unwrap();
        key.persist().unwrap();

        let mut reloaded = OwnerKey::new(key.key_file());
        reloaded.populate_from_disk_if_possible().unwrap();
        assert!(reloaded.is_populated());
        assert!(reloaded.equals(&blob));
    }

    #[test]
    fn persist_refuses_silent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = generate_signing_key();

        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&public_key_blob(&first)).unwrap();
        key.persist().unwrap();
        let on_disk = std::fs::read(key.key_file()).unwrap();

        // A fresh instance that loaded the key from disk has not replaced
        // anything, so persist must refuse and leave the file untouched.
        let mut reloaded = OwnerKey::new(key.key_file());
        reloaded.populate_from_disk_if_possible().unwrap();
        assert!(matches!(
            reloaded.persist(),
            Err(OwnerKeyError::WouldOverwrite)
        ));
        assert_eq!(std::fs::read(key.key_file()).unwrap(), on_disk);
    }

    #[test]
    fn double_populate_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&public_key_blob(&generate_signing_key()))
            .unwrap();

        assert!(matches!(
            key.populate_from_buffer(&public_key_blob(&generate_signing_key())),
            Err(OwnerKeyError::AlreadyPopulated)
        ));
    }

    #[test]
    fn malformed_buffer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = checked_key(dir.path());
        assert!(matches!(
            key.populate_from_buffer(b"not a key"),
            Err(OwnerKeyError::MalformedKey)
        ));
    }

    #[test]
    fn corrupt_file_fails_without_populating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owner.key");
        std::fs::write(&path, b"garbage").unwrap();

        let mut key = OwnerKey::new(&path);
        assert!(matches!(
            key.populate_from_disk_if_possible(),
            Err(OwnerKeyError::Corrupt { .. })
        ));
        assert!(key.have_checked_disk());
        assert!(!key.is_populated());
    }

    #[test]
    fn rotate_requires_valid_signature() {
        let dir = tempfile::tempdir().unwrap();
        let old = generate_signing_key();
        let new = generate_signing_key();
        let new_blob = public_key_blob(&new);

        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&public_key_blob(&old)).unwrap();

        let bad_sig = sign(&new, &new_blob);
        assert!(matches!(
            key.rotate(&new_blob, &bad_sig),
            Err(OwnerKeyError::BadRotationSignature)
        ));
        assert!(key.equals(&public_key_blob(&old)));

        let good_sig = sign(&old, &new_blob);
        key.rotate(&new_blob, &good_sig).unwrap();
        assert!(key.equals(&new_blob));

        // Rotation grants replacement rights; persisting over the old
        // file is now legal.
        key.persist().unwrap();
    }

    #[test]
    fn rotate_requires_populated_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = checked_key(dir.path());
        assert!(matches!(
            key.rotate(&[0u8; 32], &[0u8; 64]),
            Err(OwnerKeyError::NotPopulated)
        ));
    }

    #[test]
    fn clobber_sets_replacement_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&public_key_blob(&generate_signing_key()))
            .unwrap();
        key.persist().unwrap();

        let replacement = public_key_blob(&generate_signing_key());
        key.clobber_compromised_key(&replacement).unwrap();
        assert!(key.equals(&replacement));
        key.persist().unwrap();

        let mut reloaded = OwnerKey::new(key.key_file());
        reloaded.populate_from_disk_if_possible().unwrap();
        assert!(reloaded.equals(&replacement));
    }

    #[test]
    fn empty_key_after_replacement_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owner.key");
        let pair = generate_signing_key();
        std::fs::write(&path, public_key_blob(&pair)).unwrap();

        let mut key = OwnerKey::new(&path);
        key.populate_from_disk_if_possible().unwrap();
        key.clobber_compromised_key(&public_key_blob(&generate_signing_key()))
            .unwrap();
        key.key = Vec::new();
        key.persist().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sign_uses_slot_private_key() {
        use crate::crypto::keystore::{Keystore, MemoryKeystore};

        let dir = tempfile::tempdir().unwrap();
        let pair = generate_signing_key();
        let blob = public_key_blob(&pair);

        let store = MemoryKeystore::new();
        store.insert_key("owner@example.com", pair);
        let slot = store.open_user_slot("owner@example.com").unwrap();

        let mut key = checked_key(dir.path());
        key.populate_from_buffer(&blob).unwrap();

        let sig = key.sign(slot.as_ref(), b"owner data").unwrap();
        assert!(key.verify(b"owner data", &sig));

        let other_slot = store.open_user_slot("other@example.com").unwrap();
        assert!(matches!(
            key.sign(other_slot.as_ref(), b"owner data"),
            Err(OwnerKeyError::NoPrivateKey)
        ));
    }
}
