//! Signed-policy verification, key-change rules, and persistence.
//!
//! `Store` is synchronous verification followed by asynchronous
//! persistence: the envelope is checked and applied in the handler, the
//! file writes run on a dedicated persister task, and the caller's
//! completion resolves only after the writes have been attempted. Jobs
//! flow through one FIFO queue, so completions for a given scope are
//! serialized in call order.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::PolicyEnvelope;
use super::store::{PolicyStore, PolicyStoreError};
use crate::error::SessionError;
use crate::events::{Signal, SignalEmitter};
use crate::fs_safe;
use crate::owner_key::{KeyFileOp, OwnerKey};

/// Key-change permissions for one `Store` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFlags(u8);

impl KeyFlags {
    /// No key change is permitted.
    pub const NONE: Self = Self(0);
    /// A first key may be installed when none is present.
    pub const INSTALL_NEW: Self = Self(1);
    /// The key may rotate given a proof signed by the current key.
    pub const ROTATE: Self = Self(2);
    /// The key may be replaced without a rotation proof.
    pub const CLOBBER: Self = Self(4);

    /// True if all bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for KeyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Resolves one `Store` call's deferred outcome.
///
/// Every completion is resolved exactly once; dropping the daemon's
/// persister before resolution surfaces as a closed channel to the
/// waiting caller, which the transport reports as failure.
#[derive(Debug)]
pub struct StoreCompletion(oneshot::Sender<Result<(), SessionError>>);

impl StoreCompletion {
    /// Creates a completion and the receiver the caller awaits.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), SessionError>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Resolves the completion; a gone receiver is fine.
    pub fn finish(self, result: Result<(), SessionError>) {
        let _ = self.0.send(result);
    }
}

/// One unit of persistence work.
#[derive(Debug)]
pub struct PersistJob {
    /// Key file write/removal, if the key changed.
    pub key_op: Option<KeyFileOp>,
    /// Emit `OwnerKeySet` after attempting the key write.
    pub announce_key: bool,
    /// Policy file write, if policy changed.
    pub policy_write: Option<(PathBuf, Vec<u8>)>,
    /// Caller completion, resolved after all writes were attempted.
    pub completion: Option<StoreCompletion>,
}

enum PersistRequest {
    Job(PersistJob),
    Flush(oneshot::Sender<()>),
}

/// Handle submitting work to the persister task.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl Persister {
    /// Spawns the persister task; signals are emitted through `emitter`
    /// as each write completes.
    #[must_use]
    pub fn spawn(emitter: Arc<dyn SignalEmitter>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_persister(rx, emitter));
        (Self { tx }, handle)
    }

    /// Enqueues a job; jobs execute and complete in submission order.
    pub fn submit(&self, job: PersistJob) {
        if self.tx.send(PersistRequest::Job(job)).is_err() {
            warn!("persister is gone; dropping persistence job");
        }
    }

    /// Waits until every previously submitted job has been executed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PersistRequest::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_persister(
    mut rx: mpsc::UnboundedReceiver<PersistRequest>,
    emitter: Arc<dyn SignalEmitter>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            PersistRequest::Flush(ack) => {
                let _ = ack.send(());
            }
            PersistRequest::Job(job) => {
                let PersistJob {
                    key_op,
                    announce_key,
                    policy_write,
                    completion,
                } = job;

                let outcome = tokio::task::spawn_blocking(move || {
                    let key_ok = key_op.map(|op| match op.execute() {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "owner key persistence failed");
                            false
                        }
                    });
                    let policy_ok = policy_write.map(|(path, bytes)| {
                        match fs_safe::atomic_write(&path, &bytes) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(error = %e, path = %path.display(),
                                      "policy persistence failed");
                                false
                            }
                        }
                    });
                    (key_ok, policy_ok)
                })
                .await;

                let (key_ok, policy_ok) = outcome.unwrap_or((None, Some(false)));
                if let Some(ok) = key_ok {
                    if announce_key {
                        emitter.emit(Signal::OwnerKeySet(ok));
                    }
                }
                if let Some(ok) = policy_ok {
                    emitter.emit(Signal::PropertyChangeComplete(ok));
                }
                if let Some(completion) = completion {
                    let success = key_ok.unwrap_or(true) && policy_ok.unwrap_or(true);
                    completion.finish(if success {
                        Ok(())
                    } else {
                        Err(SessionError::EncodeFail)
                    });
                }
            }
        }
    }
}

/// Policy service for one scope: a store, its verification key, and
/// the shared persister.
pub struct PolicyService {
    key: OwnerKey,
    store: PolicyStore,
    persister: Persister,
    announce_key_changes: bool,
    scope: &'static str,
}

impl PolicyService {
    /// Creates a service over an already-constructed key and store.
    #[must_use]
    pub fn new(
        key: OwnerKey,
        store: PolicyStore,
        persister: Persister,
        announce_key_changes: bool,
        scope: &'static str,
    ) -> Self {
        Self {
            key,
            store,
            persister,
            announce_key_changes,
            scope,
        }
    }

    /// The scope's verification key.
    #[must_use]
    pub const fn key(&self) -> &OwnerKey {
        &self.key
    }

    /// Mutable access to the scope's verification key.
    pub fn key_mut(&mut self) -> &mut OwnerKey {
        &mut self.key
    }

    /// The scope's policy store.
    #[must_use]
    pub const fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Mutable access to the scope's policy store.
    pub fn store_mut(&mut self) -> &mut PolicyStore {
        &mut self.store
    }

    /// The shared persister handle.
    #[must_use]
    pub const fn persister(&self) -> &Persister {
        &self.persister
    }

    /// Verifies and applies a policy blob, scheduling persistence.
    ///
    /// Verification is synchronous and ordered:
    ///
    /// 1. Parse the blob; parse failure fails with `VerifyFail`.
    /// 2. A `new_public_key` differing from the current key is a key
    ///    change.
    /// 3. The policy signature must verify under the effective key (the
    ///    new key on change, the current key otherwise).
    /// 4. Key changes are admitted per `flags`: install when no key is
    ///    present, rotate with a proof signed by the current key, or
    ///    clobber without proof. Anything else fails with `VerifyFail`.
    ///
    /// On success the in-memory store is updated and a persistence job
    /// (key write if changed, then policy write) is queued; `completion`
    /// resolves after both writes have been attempted.
    ///
    /// # Errors
    ///
    /// Synchronous failures resolve `completion` with the same error
    /// they return.
    pub fn store_blob(
        &mut self,
        blob: &[u8],
        flags: KeyFlags,
        completion: StoreCompletion,
    ) -> Result<(), SessionError> {
        match self.store_impl(blob, flags) {
            Ok(key_changed) => {
                self.schedule_persist(key_changed, Some(completion));
                Ok(())
            }
            Err(e) => {
                completion.finish(Err(e));
                Err(e)
            }
        }
    }

    fn store_impl(&mut self, blob: &[u8], flags: KeyFlags) -> Result<bool, SessionError> {
        let Ok(envelope) = PolicyEnvelope::parse(blob) else {
            warn!(scope = self.scope, "policy blob failed to parse");
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

        let key_changed = envelope
            .new_public_key
            .as_deref()
            .map_or(false, |new_key| !self.key.equals(new_key));

        if key_changed {
            // Checked above: key_changed requires the field.
            let new_key = envelope.new_public_key.as_deref().unwrap_or_default();
            if !crate::crypto::verify_signature(new_key, data, signature) {
                warn!(scope = self.scope, "policy signature invalid under new key");
                return Err(SessionError::VerifyFail);
            }

            let populated = self.key.is_populated();
            let admitted = if !populated && flags.contains(KeyFlags::INSTALL_NEW) {
                self.key.populate_from_buffer(new_key).is_ok()
            } else if populated
                && flags.contains(KeyFlags::ROTATE)
                && envelope.new_public_key_signature.is_some()
            {
                let proof = envelope.new_public_key_signature.as_deref().unwrap_or_default();
                self.key.rotate(new_key, proof).is_ok()
            } else if populated && flags.contains(KeyFlags::CLOBBER) {
                self.key.clobber_compromised_key(new_key).is_ok()
            } else {
                false
            };
            if !admitted {
                warn!(scope = self.scope, "key change not admitted by flags");
                return Err(SessionError::VerifyFail);
            }
        } else {
            if !self.key.is_populated() {
                return Err(SessionError::VerifyFail);
            }
            if !self.key.verify(data, signature) {
                warn!(scope = self.scope, "policy signature invalid");
                return Err(SessionError::VerifyFail);
            }
        }

        debug!(scope = self.scope, key_changed, "policy blob accepted");
        self.store.set(envelope);
        Ok(key_changed)
    }

    /// Queues persistence of the current key (optionally) and policy.
    pub fn schedule_persist(&self, persist_key: bool, completion: Option<StoreCompletion>) {
        let key_op = if persist_key {
            match self.key.prepare_persist() {
                Ok(op) => Some(op),
                Err(e) => {
                    warn!(scope = self.scope, error = %e, "cannot persist key");
                    None
                }
            }
        } else {
            None
        };
        self.persister.submit(PersistJob {
            key_op,
            announce_key: self.announce_key_changes,
            policy_write: Some((self.store.policy_file().to_path_buf(), self.store.encoded())),
            completion,
        });
    }

    /// Returns the serialized current envelope.
    #[must_use]
    pub fn retrieve(&self) -> Vec<u8> {
        self.store.encoded()
    }

    /// Persists the current envelope synchronously, bypassing the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyStoreError`] on write failure.
    pub fn persist_policy_sync(&self) -> Result<(), PolicyStoreError> {
        self.store.persist()
    }
}
