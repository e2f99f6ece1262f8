//! Browser liveness checking.
//!
//! A cooperative tick driven by the daemon's main loop. Each tick
//! either pings the browser (emitting `LivenessRequested` and marking
//! the ping outstanding) or, if the previous ping was never answered
//! and aborting is enabled, asks for the browser to be aborted; the
//! supervisor then observes the exit and restarts or escalates per its
//! own policy.

use std::sync::Arc;
use std::time::Duration;

use sessiond_core::events::{Signal, SignalEmitter};
use tracing::{info, warn};

/// Default interval between liveness pings.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// What the main loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Checker is stopped; nothing to do.
    Wait,
    /// A ping was sent; reschedule the next tick.
    Ping,
    /// The browser hung and must be aborted; the checker stopped.
    AbortBrowser,
}

/// Tracks one outstanding ping against the browser.
pub struct LivenessChecker {
    emitter: Arc<dyn SignalEmitter>,
    interval: Duration,
    enable_aborting: bool,
    outstanding_ping: bool,
    running: bool,
}

impl LivenessChecker {
    /// Creates a stopped checker.
    #[must_use]
    pub fn new(emitter: Arc<dyn SignalEmitter>, interval: Duration, enable_aborting: bool) -> Self {
        Self {
            emitter,
            interval,
            enable_aborting,
            outstanding_ping: false,
            running: false,
        }
    }

    /// Interval between ticks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// (Re)starts the checker with no ping outstanding.
    pub fn start(&mut self) {
        self.outstanding_ping = false;
        self.running = true;
    }

    /// Stops the checker; pending ticks become no-ops.
    pub fn stop(&mut self) {
        self.running = false;
        self.outstanding_ping = false;
    }

    /// True while ticks are live.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// The browser answered the last ping.
    pub fn handle_confirmed(&mut self) {
        info!("browser liveness confirmed");
        self.outstanding_ping = false;
    }

    /// One timer tick.
    pub fn tick(&mut self) -> LivenessAction {
        if !self.running {
            return LivenessAction::Wait;
        }
        if self.outstanding_ping {
            warn!("browser hang detected");
            if self.enable_aborting {
                warn!("aborting browser process");
                self.stop();
                return LivenessAction::AbortBrowser;
            }
        }
        self.outstanding_ping = true;
        self.emitter.emit(Signal::LivenessRequested);
        LivenessAction::Ping
    }
}

#[cfg(test)]
mod tests {
    use sessiond_core::events::RecordingEmitter;

    use super::*;

    fn checker(aborting: bool) -> (LivenessChecker, Arc<RecordingEmitter>) {
        let emitter = Arc::new(RecordingEmitter::new());
        let checker = LivenessChecker::new(emitter.clone(), Duration::from_secs(5), aborting);
        (checker, emitter)
    }

    #[test]
    fn stopped_checker_does_nothing() {
        let (mut checker, emitter) = checker(true);
        assert_eq!(checker.tick(), LivenessAction::Wait);
        assert!(emitter.emitted().is_empty());
    }

    #[test]
    fn answered_pings_keep_the_browser_alive() {
        let (mut checker, emitter) = checker(true);
        checker.start();

        for _ in 0..3 {
            assert_eq!(checker.tick(), LivenessAction::Ping);
            checker.handle_confirmed();
        }
        assert!(checker.is_running());
        assert_eq!(
            emitter
                .emitted()
                .iter()
                .filter(|s| **s == Signal::LivenessRequested)
                .count(),
            3
        );
    }

    #[test]
    fn unanswered_ping_aborts_and_stops() {
        let (mut checker, _emitter) = checker(true);
        checker.start();

        assert_eq!(checker.tick(), LivenessAction::Ping);
        assert_eq!(checker.tick(), LivenessAction::AbortBrowser);
        assert!(!checker.is_running());
        // Further ticks are cancelled.
        assert_eq!(checker.tick(), LivenessAction::Wait);
    }

    #[test]
    fn aborting_disabled_keeps_pinging() {
        let (mut checker, emitter) = checker(false);
        checker.start();

        assert_eq!(checker.tick(), LivenessAction::Ping);
        assert_eq!(checker.tick(), LivenessAction::Ping);
        assert!(checker.is_running());
        assert_eq!(
            emitter
                .emitted()
                .iter()
                .filter(|s| **s == Signal::LivenessRequested)
                .count(),
            2
        );
    }

    #[test]
    fn restart_clears_outstanding_ping() {
        let (mut checker, _emitter) = checker(true);
        checker.start();
        assert_eq!(checker.tick(), LivenessAction::Ping);

        checker.start();
        assert_eq!(checker.tick(), LivenessAction::Ping);
    }
}
