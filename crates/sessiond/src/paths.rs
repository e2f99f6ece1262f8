//! Persisted-state locations.
//!
//! All on-disk paths the daemon touches, collected so tests can root
//! the whole tree in a temp directory.

use std::path::{Path, PathBuf};

/// Every file and directory the daemon owns.
#[derive(Debug, Clone)]
pub struct Paths {
    /// The owner's public key (root-owned).
    pub owner_key: PathBuf,
    /// The device policy envelope (root-owned).
    pub device_policy: PathBuf,
    /// Root of per-user policy directories, keyed by user hash.
    pub user_policy_root: PathBuf,
    /// Root of device-local-account policy directories.
    pub device_local_policy_root: PathBuf,
    /// tmpfs marker: at least one session started since boot.
    pub logged_in_flag: PathBuf,
    /// Factory-reset sentinel consumed by the next boot.
    pub reset_sentinel: PathBuf,
    /// Present iff the device needs serial-number recovery.
    pub serial_recovery_flag: PathBuf,
    /// Root of the per-user keystores.
    pub keystore_root: PathBuf,
    /// Where the key-generator worker leaves the fresh public key.
    pub generated_key_file: PathBuf,
    /// Marker file that disables (re)spawning the browser.
    pub spawn_gate: PathBuf,
    /// Directory for one-shot exec statistics.
    pub exec_stats_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            owner_key: "/var/lib/whitelist/owner.key".into(),
            device_policy: "/var/lib/whitelist/policy".into(),
            user_policy_root: "/var/lib/sessiond/user_policy".into(),
            device_local_policy_root: "/var/lib/device_local_accounts".into(),
            logged_in_flag: "/var/run/sessiond/logged_in".into(),
            reset_sentinel: "/mnt/stateful_partition/factory_install_reset".into(),
            serial_recovery_flag: "/var/lib/sessiond/serial_number_recovery".into(),
            keystore_root: "/var/lib/sessiond/keystore".into(),
            generated_key_file: "/var/run/sessiond/generated_owner.pub".into(),
            spawn_gate: "/var/run/sessiond/disable-spawn".into(),
            exec_stats_dir: "/tmp".into(),
        }
    }
}

impl Paths {
    /// Roots every path under `root`; used by the test suites.
    #[must_use]
    pub fn under_root(root: &Path) -> Self {
        Self {
            owner_key: root.join("whitelist/owner.key"),
            device_policy: root.join("whitelist/policy"),
            user_policy_root: root.join("user_policy"),
            device_local_policy_root: root.join("device_local_accounts"),
            logged_in_flag: root.join("run/logged_in"),
            reset_sentinel: root.join("run/factory_install_reset"),
            serial_recovery_flag: root.join("run/serial_number_recovery"),
            keystore_root: root.join("keystore"),
            generated_key_file: root.join("run/generated_owner.pub"),
            spawn_gate: root.join("run/disable-spawn"),
            exec_stats_dir: root.join("stats"),
        }
    }
}
