//! Opaque per-user keystores.
//!
//! A [`KeySlot`] is an external handle into one user's key storage. It
//! outlives a single handler: the session owns it from `StartSession`
//! until the session ends. The policy services only ever ask a slot two
//! things: "do you hold the private half of this public key" and
//! "generate a fresh keypair".
//!
//! Two implementations ship: [`DiskKeystore`] stores secret keys under a
//! root directory with 0600 permissions, [`MemoryKeystore`] backs the
//! test suites.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use thiserror::Error;
use zeroize::Zeroizing;

use super::{generate_signing_key, public_key_blob, SECRET_KEY_LEN};
use crate::validate::sanitize_user_name;

/// Errors from keystore operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// I/O failure against the backing storage.
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored key file did not contain a valid secret key.
    #[error("invalid key material in {}", path.display())]
    InvalidKeyFormat {
        /// Offending key file.
        path: PathBuf,
    },

    /// A key file or directory is readable by others.
    #[error("insecure permissions on {}", path.display())]
    InsecurePermissions {
        /// Offending path.
        path: PathBuf,
    },
}

/// One user's opened key storage.
pub trait KeySlot: Send {
    /// Returns the private key matching `public_key`, if this slot
    /// holds it.
    fn private_key_for(&self, public_key: &[u8]) -> Option<SigningKey>;

    /// Generates a fresh keypair into this slot and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError`] if the key cannot be stored.
    fn generate_keypair(&mut self) -> Result<SigningKey, KeystoreError>;
}

/// Factory for per-user slots.
pub trait Keystore: Send + Sync {
    /// Opens (creating if necessary) the slot for `username`.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError`] if the slot cannot be opened.
    fn open_user_slot(&self, username: &str) -> Result<Box<dyn KeySlot>, KeystoreError>;
}

/// Disk-backed keystore rooted at a directory.
///
/// Layout: `<root>/<user-hash>/<pub-prefix>.key`, key files 0600,
/// directories 0700.
pub struct DiskKeystore {
    root: PathBuf,
}

impl DiskKeystore {
    /// Creates a keystore rooted at `root`, creating the directory with
    /// mode 0700 if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError`] if the root cannot be created or has
    /// permissions open to other users.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, KeystoreError> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        }
        let mode = fs::metadata(&root)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(KeystoreError::InsecurePermissions { path: root });
        }
        Ok(Self { root })
    }
}

impl Keystore for DiskKeystore {
    fn open_user_slot(&self, username: &str) -> Result<Box<dyn KeySlot>, KeystoreError> {
        let dir = self.root.join(sanitize_user_name(username));
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Box::new(DiskSlot { dir }))
    }
}

/// Disk-backed slot: one directory of secret-key files.
struct DiskSlot {
    dir: PathBuf,
}

impl DiskSlot {
    fn load_key(path: &Path) -> Result<SigningKey, KeystoreError> {
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(KeystoreError::InsecurePermissions {
                path: path.to_path_buf(),
            });
        }
        let mut file = File::open(path)?;
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LEN]);
        file.read_exact(&mut *secret)
            .map_err(|_| KeystoreError::InvalidKeyFormat {
                path: path.to_path_buf(),
            })?;
        Ok(SigningKey::from_bytes(&secret))
    }
}

impl KeySlot for DiskSlot {
    fn private_key_for(&self, public_key: &[u8]) -> Option<SigningKey> {
        let entries = fs::read_dir(&self.dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "key") {
                continue;
            }
            let Ok(key) = Self::load_key(&path) else {
                continue;
            };
            if public_key_blob(&key) == public_key {
                return Some(key);
            }
        }
        None
    }

    fn generate_keypair(&mut self) -> Result<SigningKey, KeystoreError> {
        let key = generate_signing_key();
        let public = public_key_blob(&key);
        let name = format!("{}.key", hex::encode(&public[..8]));
        let path = self.dir.join(name);

        let secret = Zeroizing::new(key.to_bytes());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&*secret)?;
        file.sync_all()?;
        Ok(key)
    }
}

/// In-memory keystore for tests; slots share one map of keys.
#[derive(Default, Clone)]
pub struct MemoryKeystore {
    keys: Arc<Mutex<HashMap<String, Vec<SigningKey>>>>,
}

impl MemoryKeystore {
    /// Creates an empty in-memory keystore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `username`'s slot with an existing key.
    pub fn insert_key(&self, username: &str, key: SigningKey) {
        self.keys
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .push(key);
    }
}

impl Keystore for MemoryKeystore {
    fn open_user_slot(&self, username: &str) -> Result<Box<dyn KeySlot>, KeystoreError> {
        Ok(Box::new(MemorySlot {
            username: username.to_string(),
            keys: Arc::clone(&self.keys),
        }))
    }
}

struct MemorySlot {
    username: String,
    keys: Arc<Mutex<HashMap<String, Vec<SigningKey>>>>,
}

impl KeySlot for MemorySlot {
    fn private_key_for(&self, public_key: &[u8]) -> Option<SigningKey> {
        self.keys
            .lock()
            .unwrap()
            .get(&self.username)?
            .iter()
            .find(|k| public_key_blob(k) == public_key)
            .cloned()
    }

    fn generate_keypair(&mut self) -> Result<SigningKey, KeystoreError> {
        let key = generate_signing_key();
        self.keys
            .lock()
            .unwrap()
            .entry(self.username.clone())
            .or_default()
            .push(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_slot_round_trips_generated_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskKeystore::new(dir.path().join("keystore")).unwrap();

        let mut slot = store.open_user_slot("user@example.com").unwrap();
        let key = slot.generate_keypair().unwrap();
        let public = public_key_blob(&key);

        let found = slot.private_key_for(&public).unwrap();
        assert_eq!(found.to_bytes(), key.to_bytes());
    }

    #[test]
    fn disk_slot_misses_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskKeystore::new(dir.path().join("keystore")).unwrap();

        let mut slot = store.open_user_slot("user@example.com").unwrap();
        slot.generate_keypair().unwrap();

        let stranger = generate_signing_key();
        assert!(slot.private_key_for(&public_key_blob(&stranger)).is_none());
    }

    #[test]
    fn disk_key_files_are_0600() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("keystore");
        let store = DiskKeystore::new(&root).unwrap();

        let mut slot = store.open_user_slot("user@example.com").unwrap();
        slot.generate_keypair().unwrap();

        let user_dir = root.join(sanitize_user_name("user@example.com"));
        for entry in fs::read_dir(user_dir).unwrap().flatten() {
            let mode = entry.metadata().unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn slots_are_isolated_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskKeystore::new(dir.path().join("keystore")).unwrap();

        let mut a = store.open_user_slot("a@example.com").unwrap();
        let key = a.generate_keypair().unwrap();

        let b = store.open_user_slot("b@example.com").unwrap();
        assert!(b.private_key_for(&public_key_blob(&key)).is_none());
    }

    #[test]
    fn memory_store_shares_state_across_slots() {
        let store = MemoryKeystore::new();
        let key = generate_signing_key();
        store.insert_key("a@b", key.clone());

        let slot = store.open_user_slot("a@b").unwrap();
        assert!(slot.private_key_for(&public_key_blob(&key)).is_some());
    }
}
