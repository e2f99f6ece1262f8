//! Event emission and power-manager plumbing.
//!
//! Boot milestones (`login-prompt-*`, `start-user-session`) go to the
//! init system; everything else is a subscriber signal whose transport
//! lives outside this daemon, so the shipped emitter traces it.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use sessiond_core::events::{Signal, SignalEmitter};
use tracing::{info, warn};

/// Emits boot milestones through `initctl` and traces the rest.
pub struct InitSignalEmitter {
    initctl: Option<PathBuf>,
}

impl InitSignalEmitter {
    /// Creates an emitter shelling out to `initctl`; pass `None` to
    /// trace everything (containers, tests).
    #[must_use]
    pub fn new(initctl: Option<PathBuf>) -> Self {
        Self { initctl }
    }

    fn emit_init_event(&self, event: &str, env: Option<String>) -> bool {
        let Some(initctl) = &self.initctl else {
            info!(event, env = env.as_deref(), "init event");
            return true;
        };
        let mut cmd = Command::new(initctl);
        cmd.arg("emit")
            .arg(event)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(env) = env {
            cmd.arg(env);
        }
        match cmd.spawn() {
            Ok(_) => true,
            Err(e) => {
                warn!(event, error = %e, "failed to emit init event");
                false
            }
        }
    }
}

impl SignalEmitter for InitSignalEmitter {
    fn emit(&self, signal: Signal) -> bool {
        match signal {
            Signal::LoginPromptReady => self.emit_init_event("login-prompt-ready", None),
            Signal::LoginPromptVisible => self.emit_init_event("login-prompt-visible", None),
            Signal::StartUserSession { username } => {
                self.emit_init_event("start-user-session", Some(format!("USER={username}")))
            }
            other => {
                info!(signal = ?other, "emitting signal");
                true
            }
        }
    }
}

/// Requests reboots from the power manager, an external collaborator.
pub trait PowerControl: Send + Sync {
    /// Asks for a restart of the machine.
    fn request_restart(&self, reason: &str);
}

/// Shipped implementation: the power-manager RPC lives outside the
/// core, so the request is logged for the service manager above.
pub struct LoggingPowerControl;

impl PowerControl for LoggingPowerControl {
    fn request_restart(&self, reason: &str) {
        info!(reason, "requesting power-manager restart");
    }
}

/// Records restart requests for the test suites.
#[derive(Default)]
pub struct RecordingPowerControl {
    requests: Mutex<Vec<String>>,
}

impl RecordingPowerControl {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart reasons recorded so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl PowerControl for RecordingPowerControl {
    fn request_restart(&self, reason: &str) {
        self.requests.lock().unwrap().push(reason.to_string());
    }
}
