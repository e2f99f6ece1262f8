//! Shared fixture for the end-to-end scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use sessiond::events::RecordingPowerControl;
use sessiond::liveness::LivenessChecker;
use sessiond::paths::Paths;
use sessiond::session_manager::SessionManager;
use sessiond::supervisor::{BrowserConfig, ChildEvent, ChildSupervisor, KeygenConfig};
use sessiond_core::crypto::keystore::MemoryKeystore;
use sessiond_core::crypto::{public_key_blob, sign};
use sessiond_core::events::RecordingEmitter;
use sessiond_core::mitigator::{GeneratorLauncher, RegenMitigator};
use sessiond_core::owner_key::OwnerKey;
use sessiond_core::policy::{
    DeviceLocalAccountPolicyService, DevicePolicyService, DeviceSettings, Persister, PolicyData,
    PolicyEnvelope, PolicyStore, UserPolicyServiceFactory, DEVICE_POLICY_TYPE,
};
use tokio::sync::mpsc;

/// Everything a scenario needs to drive the daemon.
pub struct Fixture {
    pub manager: SessionManager,
    pub emitter: Arc<RecordingEmitter>,
    pub power: Arc<RecordingPowerControl>,
    pub keystore: MemoryKeystore,
    pub paths: Paths,
    pub child_events: mpsc::UnboundedReceiver<ChildEvent>,
    pub mitigations: mpsc::UnboundedReceiver<String>,
    _root: tempfile::TempDir,
}

pub struct FixtureOptions {
    pub browser_program: &'static str,
    pub browser_args: Vec<String>,
    pub hang_detection: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            browser_program: "/bin/true",
            browser_args: Vec::new(),
            hang_detection: false,
        }
    }
}

struct ChannelLauncher(mpsc::UnboundedSender<String>);

impl GeneratorLauncher for ChannelLauncher {
    fn launch(&self, username: &str) -> bool {
        self.0.send(username.to_string()).is_ok()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(FixtureOptions::default())
}

pub fn fixture_with(options: FixtureOptions) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let paths = Paths::under_root(root.path());

    let emitter = Arc::new(RecordingEmitter::new());
    let power = Arc::new(RecordingPowerControl::new());
    let keystore = MemoryKeystore::new();
    let (persister, _persister_task) = Persister::spawn(emitter.clone());
    let (child_events_tx, child_events) = mpsc::unbounded_channel();
    let (mitigation_tx, mitigations) = mpsc::unbounded_channel();

    let supervisor = ChildSupervisor::new(
        BrowserConfig {
            program: options.browser_program.into(),
            args: options.browser_args,
            uid: None,
            never_kill: false,
        },
        KeygenConfig {
            program: "/bin/true".into(),
            keystore_root: paths.keystore_root.clone(),
            output_file: paths.generated_key_file.clone(),
        },
        paths.spawn_gate.clone(),
        paths.exec_stats_dir.clone(),
        Duration::from_secs(2),
        child_events_tx,
    );

    let device_policy = DevicePolicyService::new(
        OwnerKey::new(paths.owner_key.clone()),
        PolicyStore::new(paths.device_policy.clone()),
        persister.clone(),
        RegenMitigator::new(Box::new(ChannelLauncher(mitigation_tx))),
        emitter.clone(),
        paths.serial_recovery_flag.clone(),
    );

    let liveness = LivenessChecker::new(emitter.clone(), Duration::from_secs(5), true);

    let mut manager = SessionManager::new(
        device_policy,
        UserPolicyServiceFactory::new(paths.user_policy_root.clone(), persister.clone()),
        DeviceLocalAccountPolicyService::new(
            paths.device_local_policy_root.clone(),
            persister.clone(),
        ),
        supervisor,
        liveness,
        options.hang_detection,
        Arc::new(keystore.clone()),
        emitter.clone(),
        power.clone(),
        persister,
        paths.clone(),
    )
    .unwrap();
    manager.initialize().unwrap();

    Fixture {
        manager,
        emitter,
        power,
        keystore,
        paths,
        child_events,
        mitigations,
        _root: root,
    }
}

/// Builds signed device-scope policy blobs for the scenarios.
pub struct PolicyBlob {
    data: PolicyData,
}

impl PolicyBlob {
    pub fn device() -> Self {
        Self {
            data: PolicyData {
                policy_type: Some(DEVICE_POLICY_TYPE.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.data.username = Some(username.to_string());
        self
    }

    pub fn request_token(mut self, token: &str) -> Self {
        self.data.request_token = Some(token.to_string());
        self
    }

    pub fn settings(mut self, settings: &DeviceSettings) -> Self {
        self.data.policy_value = Some(settings.to_bytes());
        self
    }

    /// Signature and `new_public_key` by the same key: a first install.
    pub fn sign_install(self, key: &SigningKey) -> Vec<u8> {
        let bytes = self.data.to_bytes();
        PolicyEnvelope {
            policy_data_signature: Some(sign(key, &bytes)),
            policy_data: Some(bytes),
            new_public_key: Some(public_key_blob(key)),
            new_public_key_signature: None,
        }
        .to_bytes()
    }

    /// Rotation: signed by the new key, proof signed by the old key.
    pub fn sign_rotate(self, new: &SigningKey, old: &SigningKey) -> Vec<u8> {
        let bytes = self.data.to_bytes();
        PolicyEnvelope {
            policy_data_signature: Some(sign(new, &bytes)),
            policy_data: Some(bytes),
            new_public_key_signature: Some(sign(old, &public_key_blob(new))),
            new_public_key: Some(public_key_blob(new)),
        }
        .to_bytes()
    }

    /// Plain signature under the current key; no key change.
    pub fn sign_with(self, key: &SigningKey) -> Vec<u8> {
        let bytes = self.data.to_bytes();
        PolicyEnvelope {
            policy_data_signature: Some(sign(key, &bytes)),
            policy_data: Some(bytes),
            new_public_key: None,
            new_public_key_signature: None,
        }
        .to_bytes()
    }
}
