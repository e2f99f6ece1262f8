//! Session lifecycle states and the signal vocabulary.
//!
//! The daemon is the sole issuer of session lifecycle events. Everything
//! observable by subscribers goes through [`SignalEmitter`]; the daemon
//! binary installs an init-system-backed emitter, tests install a
//! recording one.

use std::fmt;
use std::sync::Mutex;

/// Session lifecycle state as reported by `RetrieveSessionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has started; the initial state.
    Stopped,
    /// At least one user session is active.
    Started,
    /// Shutdown has been scheduled; waiting for the child to exit.
    Stopping,
}

impl SessionState {
    /// The wire string for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every event the daemon emits to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Legacy boot milestone; kept for old subscribers.
    LoginPromptReady,
    /// The login prompt has been drawn.
    LoginPromptVisible,
    /// A user session is starting; carries the canonical email.
    StartUserSession {
        /// Canonical (lower-cased) email of the session user.
        username: String,
    },
    /// The session state machine moved to a new state.
    SessionStateChanged(SessionState),
    /// The browser should lock the screen.
    LockScreen,
    /// The browser reports the lock screen is shown.
    ScreenIsLocked,
    /// The browser reports the lock screen was dismissed.
    ScreenIsUnlocked,
    /// Owner key persistence finished with the given outcome.
    OwnerKeySet(bool),
    /// Policy persistence finished with the given outcome.
    PropertyChangeComplete(bool),
    /// The liveness checker pinged the browser.
    LivenessRequested,
}

/// Sink for daemon events.
///
/// `emit` returns whether the event was delivered (or queued) to the
/// underlying mechanism; callers that are contractually required to
/// report emission failure map `false` to `EmitFailed`.
pub trait SignalEmitter: Send + Sync {
    /// Emits one event.
    fn emit(&self, signal: Signal) -> bool;
}

/// Records every emitted signal in memory; always reports success.
///
/// Used throughout the test suites to assert on signal ordering.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    emitted: Mutex<Vec<Signal>>,
}

impl RecordingEmitter {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of everything emitted so far.
    #[must_use]
    pub fn emitted(&self) -> Vec<Signal> {
        self.emitted.lock().unwrap().clone()
    }

    /// True if `signal` was emitted at least once.
    #[must_use]
    pub fn saw(&self, signal: &Signal) -> bool {
        self.emitted.lock().unwrap().iter().any(|s| s == signal)
    }

    /// Drops all recorded signals.
    pub fn clear(&self) {
        self.emitted.lock().unwrap().clear();
    }
}

impl SignalEmitter for RecordingEmitter {
    fn emit(&self, signal: Signal) -> bool {
        self.emitted.lock().unwrap().push(signal);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_match_wire_contract() {
        assert_eq!(SessionState::Stopped.as_str(), "stopped");
        assert_eq!(SessionState::Started.as_str(), "started");
        assert_eq!(SessionState::Stopping.as_str(), "stopping");
    }

    #[test]
    fn recorder_keeps_order() {
        let rec = RecordingEmitter::new();
        assert!(rec.emit(Signal::LoginPromptVisible));
        assert!(rec.emit(Signal::SessionStateChanged(SessionState::Started)));

        let seen = rec.emitted();
        assert_eq!(seen[0], Signal::LoginPromptVisible);
        assert_eq!(seen[1], Signal::SessionStateChanged(SessionState::Started));
        assert!(rec.saw(&Signal::LoginPromptVisible));
        assert!(!rec.saw(&Signal::LockScreen));
    }
}
