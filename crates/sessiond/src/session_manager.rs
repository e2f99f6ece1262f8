//! The session manager: public surface and lifecycle state machine.
//!
//! One instance orchestrates everything: it validates requests,
//! dispatches policy operations to the right scope, drives the
//! `Stopped -> Started -> Stopping -> Stopped` state machine, owns the
//! child supervisor, and reacts to child exits and liveness ticks
//! delivered by the daemon's main loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use rand::RngCore;
use sessiond_core::crypto::keystore::{KeySlot, Keystore};
use sessiond_core::error::SessionError;
use sessiond_core::events::{SessionState, Signal, SignalEmitter};
use sessiond_core::fs_safe;
use sessiond_core::policy::device::DevicePolicyError;
use sessiond_core::policy::{
    DeviceLocalAccountPolicyService, DevicePolicyService, KeyFlags, Persister, PolicyService,
    StoreCompletion, UserPolicyServiceFactory,
};
use sessiond_core::validate::{
    canonicalize_email, is_incognito_user, sanitize_user_name, split_shell_args, GUEST_USER,
};
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::events::PowerControl;
use crate::liveness::{LivenessAction, LivenessChecker};
use crate::paths::Paths;
use crate::supervisor::{ChildSupervisor, ExitDisposition};

/// Bytes of CSPRNG entropy behind the restart auth cookie.
const COOKIE_ENTROPY_BYTES: usize = 16;

/// Flag the browser uses to open its named testing channel.
const TESTING_CHANNEL_FLAG: &str = "--testing-channel=NamedTestingInterface:";

/// Payload of the factory-reset sentinel.
const RESET_PAYLOAD: &[u8] = b"fast safe";

/// Receiver for the deferred outcome of an asynchronous store.
pub type StoreReceipt = oneshot::Receiver<Result<(), SessionError>>;

/// One signed-in user.
struct UserSession {
    username: String,
    userhash: String,
    is_incognito: bool,
    slot: Box<dyn KeySlot>,
    policy: PolicyService,
}

/// Top-level daemon state machine and RPC surface.
pub struct SessionManager {
    state: SessionState,
    screen_locked: bool,
    user_sessions: HashMap<String, UserSession>,
    device_policy: DevicePolicyService,
    user_policy_factory: UserPolicyServiceFactory,
    device_local_policy: DeviceLocalAccountPolicyService,
    supervisor: ChildSupervisor,
    liveness: LivenessChecker,
    hang_detection: bool,
    keystore: Arc<dyn Keystore>,
    emitter: Arc<dyn SignalEmitter>,
    power: Arc<dyn PowerControl>,
    persister: Persister,
    cookie: String,
    testing_channel_path: Option<PathBuf>,
    paths: Paths,
}

impl SessionManager {
    /// Assembles the session manager around its collaborators.
    ///
    /// # Errors
    ///
    /// Fails if the authentication cookie cannot be generated; that is
    /// fatal for the daemon.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_policy: DevicePolicyService,
        user_policy_factory: UserPolicyServiceFactory,
        device_local_policy: DeviceLocalAccountPolicyService,
        supervisor: ChildSupervisor,
        liveness: LivenessChecker,
        hang_detection: bool,
        keystore: Arc<dyn Keystore>,
        emitter: Arc<dyn SignalEmitter>,
        power: Arc<dyn PowerControl>,
        persister: Persister,
        paths: Paths,
    ) -> Result<Self, rand::Error> {
        let mut entropy = [0u8; COOKIE_ENTROPY_BYTES];
        rand::rngs::OsRng.try_fill_bytes(&mut entropy)?;

        Ok(Self {
            state: SessionState::Stopped,
            screen_locked: false,
            user_sessions: HashMap::new(),
            device_policy,
            user_policy_factory,
            device_local_policy,
            supervisor,
            liveness,
            hang_detection,
            keystore,
            emitter,
            power,
            persister,
            cookie: hex::encode(entropy),
            testing_channel_path: None,
            paths,
        })
    }

    /// Initializes the policy subsystems; failure is fatal.
    ///
    /// # Errors
    ///
    /// Propagates an unusable owner key.
    pub fn initialize(&mut self) -> Result<(), DevicePolicyError> {
        self.device_policy.initialize()?;
        self.device_local_policy
            .update_device_settings(&self.device_policy.settings());
        self.supervisor
            .set_policy_flags(self.device_policy.get_start_up_flags());
        Ok(())
    }

    /// Spawns the browser and arms the liveness checker.
    ///
    /// # Errors
    ///
    /// Returns the OS spawn error.
    pub fn run_browser(&mut self) -> std::io::Result<()> {
        self.supervisor.run()?;
        if self.hang_detection && self.supervisor.browser_pid().is_some() {
            self.liveness.start();
        }
        Ok(())
    }

    /// The cookie the browser launcher hands to children for
    /// `RestartJobWithAuth`.
    #[must_use]
    pub fn auth_cookie(&self) -> &str {
        &self.cookie
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn session_state(&self) -> SessionState {
        self.state
    }

    /// Whether the screen is currently locked.
    #[must_use]
    pub const fn screen_locked(&self) -> bool {
        self.screen_locked
    }

    /// The supervised browser, for wiring and tests.
    #[must_use]
    pub const fn supervisor(&self) -> &ChildSupervisor {
        &self.supervisor
    }

    /// Mutable access to the supervisor.
    pub fn supervisor_mut(&mut self) -> &mut ChildSupervisor {
        &mut self.supervisor
    }

    // -----------------------------------------------------------------
    // Public RPC surface
    // -----------------------------------------------------------------

    /// Emits the legacy `login-prompt-ready` event.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmitFailed`] if emission fails.
    pub fn emit_login_prompt_ready(&self) -> Result<(), SessionError> {
        if self.emitter.emit(Signal::LoginPromptReady) {
            Ok(())
        } else {
            Err(SessionError::EmitFailed)
        }
    }

    /// Emits `login-prompt-visible`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmitFailed`] if emission fails.
    pub fn emit_login_prompt_visible(&self) -> Result<(), SessionError> {
        if self.emitter.emit(Signal::LoginPromptVisible) {
            Ok(())
        } else {
            Err(SessionError::EmitFailed)
        }
    }

    /// Enables the browser testing channel, restarting the browser with
    /// the channel flag appended. Idempotent unless `force_relaunch`.
    ///
    /// Returns the channel path.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EncodeFail`] if a unique path cannot be
    /// allocated.
    pub fn enable_chrome_testing(
        &mut self,
        force_relaunch: bool,
        extra_args: &[String],
    ) -> Result<PathBuf, SessionError> {
        let already_enabled = self.testing_channel_path.is_some();
        if !already_enabled {
            let tmp = tempfile::NamedTempFile::new().map_err(|e| {
                warn!(error = %e, "could not allocate testing channel path");
                SessionError::EncodeFail
            })?;
            let path = tmp.into_temp_path().keep().map_err(|e| {
                warn!(error = %e, "could not keep testing channel path");
                SessionError::EncodeFail
            })?;
            self.testing_channel_path = Some(path);
        }
        // Checked or set just above.
        let path = self.testing_channel_path.clone().unwrap_or_default();

        if already_enabled && !force_relaunch {
            return Ok(path);
        }

        if let Err(e) = fs_safe::remove_if_exists(&path) {
            warn!(error = %e, "could not remove stale testing channel");
        }
        let mut args = extra_args.to_vec();
        args.push(format!("{TESTING_CHANNEL_FLAG}{}", path.display()));
        if let Err(e) = self.supervisor.restart_browser_with_args(args, true) {
            error!(error = %e, "browser restart for testing channel failed");
        }
        Ok(path)
    }

    /// Starts a session for `email`.
    ///
    /// # Errors
    ///
    /// Returns the validation, duplication, keystore, or emission error
    /// that blocked the session.
    pub fn start_session(&mut self, email: &str) -> Result<(), SessionError> {
        if self.supervisor.is_shutting_down() {
            return Err(SessionError::SessionExists);
        }

        let email = canonicalize_email(email);
        let is_incognito = is_incognito_user(&email);
        if !is_incognito && !sessiond_core::validate::validate_email(&email) {
            warn!("provided email address is not valid");
            return Err(SessionError::InvalidEmail);
        }
        if self.user_sessions.contains_key(&email) {
            warn!("provided email address already started a session");
            return Err(SessionError::SessionExists);
        }

        let session = self.create_user_session(&email, is_incognito)?;

        // If this user is the owner, make sure the policy records it;
        // if the policy says so but the key is lost, mitigation starts.
        let user_is_owner = self
            .device_policy
            .check_and_handle_owner_login(&email, session.slot.as_ref())?;

        let is_first_real_user = self.all_sessions_are_incognito() && !is_incognito;

        if !self.emitter.emit(Signal::StartUserSession {
            username: email.clone(),
        }) {
            return Err(SessionError::EmitFailed);
        }

        info!(username = %email, user_is_owner, "starting user session");
        self.supervisor
            .set_browser_session_for_user(&email, &session.userhash);
        self.state = SessionState::Started;
        self.user_sessions.insert(email.clone(), session);
        self.emitter
            .emit(Signal::SessionStateChanged(SessionState::Started));

        if self.device_policy.key_missing()
            && !self.device_policy.mitigating()
            && is_first_real_user
        {
            // First sign-in on an unmanaged device: take ownership.
            if let Err(e) = self.supervisor.run_key_generator(&email) {
                warn!(error = %e, "could not run key generator");
            }
        }

        // Record that a login has completed on this boot.
        if let Err(e) = fs_safe::atomic_write(&self.paths.logged_in_flag, b"1") {
            warn!(error = %e, "could not write logged-in flag");
        }
        Ok(())
    }

    /// Schedules daemon shutdown. Per-user sessions are not torn down
    /// here; they die with the process.
    pub fn stop_session(&mut self) {
        info!("stopping all sessions");
        self.schedule_shutdown();
    }

    /// Stores device policy. Rotation is always allowed; before any
    /// session has started, install and clobber are too.
    ///
    /// # Errors
    ///
    /// Synchronous verification failures; asynchronous persistence
    /// outcomes arrive through the receipt.
    pub fn store_policy(&mut self, blob: &[u8]) -> Result<StoreReceipt, SessionError> {
        let mut flags = KeyFlags::ROTATE;
        if self.state == SessionState::Stopped {
            flags = flags | KeyFlags::INSTALL_NEW | KeyFlags::CLOBBER;
        }
        let (completion, receipt) = StoreCompletion::channel();
        self.device_policy.store(blob, flags, completion)?;

        // Device settings feed the supervisor and the device-local view.
        self.supervisor
            .set_policy_flags(self.device_policy.get_start_up_flags());
        self.device_local_policy
            .update_device_settings(&self.device_policy.settings());
        Ok(receipt)
    }

    /// Returns the serialized device policy envelope.
    #[must_use]
    pub fn retrieve_policy(&self) -> Vec<u8> {
        self.device_policy.retrieve()
    }

    /// Stores policy for a signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] without a session for
    /// `email`, or the synchronous verification failure.
    pub fn store_policy_for_user(
        &mut self,
        email: &str,
        blob: &[u8],
    ) -> Result<StoreReceipt, SessionError> {
        let username = canonicalize_email(email);
        let session = self
            .user_sessions
            .get_mut(&username)
            .ok_or(SessionError::NoSession)?;
        let (completion, receipt) = StoreCompletion::channel();
        session
            .policy
            .store_blob(blob, KeyFlags::INSTALL_NEW | KeyFlags::ROTATE, completion)?;
        Ok(receipt)
    }

    /// Returns the serialized policy for a signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] without a session.
    pub fn retrieve_policy_for_user(&self, email: &str) -> Result<Vec<u8>, SessionError> {
        let username = canonicalize_email(email);
        self.user_sessions
            .get(&username)
            .map(|s| s.policy.retrieve())
            .ok_or(SessionError::NoSession)
    }

    /// Stores policy for a device-local account.
    ///
    /// # Errors
    ///
    /// See [`DeviceLocalAccountPolicyService::store`].
    pub fn store_device_local_account_policy(
        &mut self,
        account_id: &str,
        blob: &[u8],
    ) -> Result<StoreReceipt, SessionError> {
        let (completion, receipt) = StoreCompletion::channel();
        self.device_local_policy
            .store(account_id, blob, self.device_policy.key(), completion)?;
        Ok(receipt)
    }

    /// Returns the serialized policy for a device-local account.
    ///
    /// # Errors
    ///
    /// See [`DeviceLocalAccountPolicyService::retrieve`].
    pub fn retrieve_device_local_account_policy(
        &mut self,
        account_id: &str,
    ) -> Result<Vec<u8>, SessionError> {
        self.device_local_policy.retrieve(account_id)
    }

    /// The lifecycle state string: `stopped`, `started`, or `stopping`.
    #[must_use]
    pub const fn retrieve_session_state(&self) -> &'static str {
        self.state.as_str()
    }

    /// Active sessions as canonical email to user hash.
    #[must_use]
    pub fn retrieve_active_sessions(&self) -> HashMap<String, String> {
        self.user_sessions
            .values()
            .map(|s| (s.username.clone(), s.userhash.clone()))
            .collect()
    }

    /// Asks the browser to lock the screen.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] outside `Started` or when
    /// every session is incognito.
    pub fn lock_screen(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Started {
            warn!("attempt to lock screen outside of a user session");
            return Err(SessionError::NoSession);
        }
        if self.all_sessions_are_incognito() {
            warn!("attempt to lock screen during a guest session");
            return Err(SessionError::NoSession);
        }
        if !self.screen_locked {
            self.screen_locked = true;
            self.emitter.emit(Signal::LockScreen);
        }
        Ok(())
    }

    /// The browser reports the lock screen as shown.
    pub fn handle_lock_screen_shown(&mut self) {
        self.screen_locked = true;
        self.emitter.emit(Signal::ScreenIsLocked);
    }

    /// The browser reports the lock screen as dismissed.
    pub fn handle_lock_screen_dismissed(&mut self) {
        self.screen_locked = false;
        self.emitter.emit(Signal::ScreenIsUnlocked);
    }

    /// Restarts the supervised browser with a caller-provided command
    /// line, starting a guest session for the browse-without-sign-in
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownPid`] for a foreign pid and
    /// [`SessionError::DecodeFail`] for an untokenizable command line.
    pub fn restart_job(&mut self, pid: i32, arguments: &str) -> Result<(), SessionError> {
        if !self.supervisor.is_browser(pid) {
            warn!(pid, "provided pid is unknown");
            return Err(SessionError::UnknownPid);
        }
        let argv = split_shell_args(arguments).map_err(|e| {
            warn!(error = %e, "could not parse restart command");
            SessionError::DecodeFail
        })?;

        // Sets the logged-in state for browse-without-sign-in mode; the
        // restart goes ahead even if the guest session cannot start.
        if let Err(e) = self.start_session(GUEST_USER) {
            warn!(error = %e, "could not start guest session for restart");
        }
        if let Err(e) = self.supervisor.restart_browser_with_args(argv, false) {
            error!(error = %e, "browser restart failed");
        }
        Ok(())
    }

    /// [`restart_job`](Self::restart_job) authenticated by cookie
    /// instead of pid filtering.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalService`] for a bad cookie, then
    /// everything `restart_job` can return.
    pub fn restart_job_with_auth(
        &mut self,
        pid: i32,
        cookie: &str,
        arguments: &str,
    ) -> Result<(), SessionError> {
        let valid: bool = cookie
            .as_bytes()
            .ct_eq(self.cookie.as_bytes())
            .into();
        if !valid {
            warn!("invalid auth cookie");
            return Err(SessionError::IllegalService);
        }
        self.restart_job(pid, arguments)
    }

    /// Marks the device for a factory wipe and requests a restart.
    /// Refused once any session has started this boot.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadySession`] when the logged-in flag
    /// exists, [`SessionError::EncodeFail`] if the sentinel cannot be
    /// written.
    pub fn start_device_wipe(&mut self) -> Result<(), SessionError> {
        if self.paths.logged_in_flag.exists() {
            warn!("a user has already logged in this boot; refusing wipe");
            return Err(SessionError::AlreadySession);
        }
        fs_safe::atomic_write(&self.paths.reset_sentinel, RESET_PAYLOAD).map_err(|e| {
            error!(error = %e, "could not write reset sentinel");
            SessionError::EncodeFail
        })?;
        self.power.request_restart("device wipe");
        Ok(())
    }

    /// Remembers flags to apply on the next in-session browser restart
    /// for `email`.
    pub fn set_flags_for_user(&mut self, email: &str, flags: Vec<String>) {
        let username = canonicalize_email(email);
        self.supervisor.set_flags_for_user(&username, flags);
    }

    /// The browser answered the liveness ping.
    pub fn handle_liveness_confirmed(&mut self) {
        self.liveness.handle_confirmed();
    }

    // -----------------------------------------------------------------
    // Main-loop callbacks
    // -----------------------------------------------------------------

    /// Interval between liveness ticks.
    #[must_use]
    pub const fn liveness_interval(&self) -> std::time::Duration {
        self.liveness.interval()
    }

    /// One liveness timer tick; aborts the browser on a hang.
    pub fn liveness_tick(&mut self) -> LivenessAction {
        let action = self.liveness.tick();
        if action == LivenessAction::AbortBrowser {
            self.supervisor.abort_browser();
        }
        action
    }

    /// Reacts to a browser exit per the supervisor's policy.
    pub fn handle_browser_exit(&mut self, status: &ExitStatus) -> ExitDisposition {
        info!(?status, "browser exited");
        self.liveness.stop();
        let disposition = self
            .supervisor
            .handle_exit_status(status.code(), self.screen_locked);
        match disposition {
            ExitDisposition::Ignore => {}
            ExitDisposition::ShutDownDaemon | ExitDisposition::GiveUp => self.schedule_shutdown(),
            ExitDisposition::Reboot => {
                self.power.request_restart("browser crash-loop escalation");
                self.schedule_shutdown();
            }
            ExitDisposition::Restart => {
                info!("running browser again");
                if let Err(e) = self.supervisor.spawn_browser() {
                    error!(error = %e, "browser respawn failed; shutting down");
                    self.schedule_shutdown();
                } else if self.hang_detection {
                    self.liveness.start();
                }
            }
        }
        disposition
    }

    /// Reacts to a key-generator exit: on success, imports the fresh
    /// public key and completes the ownership flow.
    pub fn handle_generator_exit(&mut self, username: &str, status: &ExitStatus) {
        self.supervisor.notice_generator_exit();
        if status.success() {
            self.import_validate_and_store_generated_key(username);
        } else {
            warn!(username, ?status, "key generator failed");
        }
    }

    /// Pulls the generated public key off disk, deletes the temp file,
    /// and hands it to the device policy service for validation.
    pub fn import_validate_and_store_generated_key(&mut self, username: &str) {
        let path = self.paths.generated_key_file.clone();
        let key = match fs_safe::bounded_read(&path, 8 * 1024) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "could not read generated key");
                return;
            }
        };
        if let Err(e) = fs_safe::remove_if_exists(&path) {
            warn!(error = %e, path = %path.display(), "can't delete generated key file");
        }

        let username = canonicalize_email(username);
        let Some(session) = self.user_sessions.get(&username) else {
            warn!(username = %username, "generated key arrived without a session");
            return;
        };
        if let Err(e) = self.device_policy.validate_and_store_owner_key(
            &username,
            &key,
            session.slot.as_ref(),
            None,
        ) {
            warn!(error = %e, "generated owner key was rejected");
        }
    }

    /// Waits until every queued persistence job has been executed.
    pub async fn flush_persistence(&self) {
        self.persister.flush().await;
    }

    /// Emits `stopping` (once) and enters the drain state.
    pub fn schedule_shutdown(&mut self) {
        if self.state == SessionState::Started {
            self.state = SessionState::Stopping;
            self.emitter
                .emit(Signal::SessionStateChanged(SessionState::Stopping));
        }
        self.liveness.stop();
        self.supervisor.schedule_shutdown();
    }

    /// True once the main loop should drain and exit.
    #[must_use]
    pub const fn should_exit(&self) -> bool {
        self.supervisor.is_shutting_down()
    }

    /// Final drain: flush pending persistence, kill children, persist
    /// policy synchronously, and announce `stopped`.
    pub async fn shutdown(&mut self) {
        self.persister.flush().await;
        let session_started = self.state != SessionState::Stopped;
        self.supervisor.shutdown_children(session_started).await;
        self.finalize();
    }

    fn finalize(&mut self) {
        if let Err(e) = self.device_policy.persist_policy_sync() {
            warn!(error = %e, "device policy persistence on shutdown failed");
        }
        for session in self.user_sessions.values() {
            if let Err(e) = session.policy.persist_policy_sync() {
                warn!(error = %e, username = %session.username,
                      "user policy persistence on shutdown failed");
            }
        }
        if self.state != SessionState::Stopped {
            self.state = SessionState::Stopped;
            self.emitter
                .emit(Signal::SessionStateChanged(SessionState::Stopped));
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn create_user_session(
        &mut self,
        email: &str,
        is_incognito: bool,
    ) -> Result<UserSession, SessionError> {
        let policy = self.user_policy_factory.create(email).map_err(|e| {
            warn!(error = %e, "user policy failed to initialize");
            SessionError::PolicyInitFail
        })?;
        let slot = self.keystore.open_user_slot(email).map_err(|e| {
            warn!(error = %e, "could not open the user's keystore");
            SessionError::NoUserKeystore
        })?;
        Ok(UserSession {
            username: email.to_string(),
            userhash: sanitize_user_name(email),
            is_incognito,
            slot,
            policy,
        })
    }

    fn all_sessions_are_incognito(&self) -> bool {
        self.user_sessions.values().all(|s| s.is_incognito)
    }
}
