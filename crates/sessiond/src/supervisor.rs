//! Supervision of the browser child and the key-generator worker.
//!
//! The supervisor spawns children in their own process groups, tracks
//! their pids, and reports exits to the main loop over a channel. Exit
//! handling enforces the crash-rate policy: a child that keeps dying
//! too fast escalates to a reboot request, then to bounded respawns,
//! then gives up; an exit under a locked screen takes the whole daemon
//! down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Exit code a browser wrapper uses when it died within too short an
/// uptime.
pub const CHILD_EXITING_TOO_FAST: i32 = 253;

/// Tolerated too-fast exits per [`TOO_CRASHY_WINDOW`].
pub const TOO_CRASHY_LIMIT: usize = 1;

/// Window for counting too-fast exits.
pub const TOO_CRASHY_WINDOW: Duration = Duration::from_secs(180);

/// Tolerated crash-escalation reboots per [`REBOOT_WINDOW`].
pub const REBOOT_LIMIT: usize = 1;

/// Window for counting crash-escalation reboots.
pub const REBOOT_WINDOW: Duration = Duration::from_secs(3 * 180);

/// Respawns allowed per [`RESPAWN_WINDOW`] once escalation started.
pub const RESPAWN_LIMIT: usize = 6;

/// Window for counting respawns.
pub const RESPAWN_WINDOW: Duration = Duration::from_secs(60);

/// Default time to wait for a signalled child before `SIGABRT`.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// A sliding event-count window over wall-clock time.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    window: chrono::Duration,
    events: Vec<DateTime<Utc>>,
}

impl RateWindow {
    /// Creates a window admitting `limit` events per `window`.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            events: Vec::new(),
        }
    }

    /// Records an event; returns true if it was within budget.
    pub fn try_record(&mut self) -> bool {
        let now = Utc::now();
        let window_start = now - self.window;
        self.events.retain(|t| *t >= window_start);
        let within_budget = self.events.len() < self.limit;
        self.events.push(now);
        within_budget
    }
}

/// What the main loop must do about a browser exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The daemon is shutting down; the exit is expected.
    Ignore,
    /// The user is stranded behind a broken lock; stop the daemon.
    ShutDownDaemon,
    /// Crash-rate escalation: request a machine reboot.
    Reboot,
    /// Respawn the browser with its current argument vector.
    Restart,
    /// Respawn budget exhausted; allow graceful exit.
    GiveUp,
}

/// An exit notification from a waiter task.
#[derive(Debug)]
pub enum ChildEvent {
    /// The browser exited.
    BrowserExited {
        /// Pid of the exited browser.
        pid: i32,
        /// Its exit status.
        status: ExitStatus,
    },
    /// The key-generator worker exited.
    GeneratorExited {
        /// User the worker impersonated.
        username: String,
        /// Its exit status.
        status: ExitStatus,
    },
}

/// Static configuration of the browser job.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser executable.
    pub program: PathBuf,
    /// Argument vector template.
    pub args: Vec<String>,
    /// UID the child must run as; inherit when unset.
    pub uid: Option<u32>,
    /// Exempt from shutdown kills.
    pub never_kill: bool,
}

/// Configuration of the key-generator worker.
#[derive(Debug, Clone)]
pub struct KeygenConfig {
    /// Worker executable.
    pub program: PathBuf,
    /// Keystore root handed to the worker.
    pub keystore_root: PathBuf,
    /// Where the worker writes the fresh public key.
    pub output_file: PathBuf,
}

struct TrackedChild {
    pid: i32,
    never_kill: bool,
    exited: Arc<AtomicBool>,
}

impl TrackedChild {
    async fn wait_gone(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.exited.load(Ordering::SeqCst)
    }
}

/// Supervises the browser job and, transiently, the keygen worker.
pub struct ChildSupervisor {
    browser_config: BrowserConfig,
    keygen: KeygenConfig,
    current_args: Vec<String>,
    policy_flags: Vec<String>,
    session_user: Option<String>,
    session_args: Vec<String>,
    user_flags: HashMap<String, Vec<String>>,
    browser: Option<TrackedChild>,
    generator: Option<TrackedChild>,
    shutting_down: bool,
    too_crashy: RateWindow,
    reboots: RateWindow,
    respawns: RateWindow,
    kill_timeout: Duration,
    spawn_gate: PathBuf,
    exec_stats_dir: PathBuf,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
}

impl ChildSupervisor {
    /// Creates a supervisor; exits are reported through `events_tx`.
    #[must_use]
    pub fn new(
        browser_config: BrowserConfig,
        keygen: KeygenConfig,
        spawn_gate: PathBuf,
        exec_stats_dir: PathBuf,
        kill_timeout: Duration,
        events_tx: mpsc::UnboundedSender<ChildEvent>,
    ) -> Self {
        let current_args = browser_config.args.clone();
        Self {
            browser_config,
            keygen,
            current_args,
            policy_flags: Vec::new(),
            session_user: None,
            session_args: Vec::new(),
            user_flags: HashMap::new(),
            browser: None,
            generator: None,
            shutting_down: false,
            too_crashy: RateWindow::new(TOO_CRASHY_LIMIT, TOO_CRASHY_WINDOW),
            reboots: RateWindow::new(REBOOT_LIMIT, REBOOT_WINDOW),
            respawns: RateWindow::new(RESPAWN_LIMIT, RESPAWN_WINDOW),
            kill_timeout,
            spawn_gate,
            exec_stats_dir,
            events_tx,
        }
    }

    /// True unless the on-disk spawn gate disables the browser.
    #[must_use]
    pub fn should_run_browser(&self) -> bool {
        !self.spawn_gate.exists()
    }

    /// True once shutdown was scheduled.
    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Pid of the running browser, if any.
    #[must_use]
    pub fn browser_pid(&self) -> Option<i32> {
        self.browser.as_ref().map(|b| b.pid)
    }

    /// True if `pid` is the supervised browser.
    #[must_use]
    pub fn is_browser(&self, pid: i32) -> bool {
        self.browser_pid() == Some(pid)
    }

    /// True while a key-generator worker is running.
    #[must_use]
    pub const fn generator_running(&self) -> bool {
        self.generator.is_some()
    }

    /// Flags from device policy applied to every browser spawn.
    pub fn set_policy_flags(&mut self, flags: Vec<String>) {
        self.policy_flags = flags;
    }

    /// Remembers flags to apply on the next in-session restart for
    /// `email`.
    pub fn set_flags_for_user(&mut self, email: &str, flags: Vec<String>) {
        self.user_flags.insert(email.to_string(), flags);
    }

    /// Marks the browser as carrying a user session.
    pub fn set_browser_session_for_user(&mut self, email: &str, userhash: &str) {
        self.session_user = Some(email.to_string());
        self.session_args = vec![
            format!("--login-user={email}"),
            format!("--login-profile={userhash}"),
        ];
    }

    /// Spawns the browser if the spawn gate allows it.
    ///
    /// # Errors
    ///
    /// Returns the spawn error from the OS.
    pub fn run(&mut self) -> std::io::Result<()> {
        if !self.should_run_browser() {
            info!("spawn gate present; not running browser");
            return Ok(());
        }
        self.spawn_browser()
    }

    /// Spawns the browser with the composed argument vector.
    ///
    /// # Errors
    ///
    /// Returns the spawn error from the OS.
    pub fn spawn_browser(&mut self) -> std::io::Result<()> {
        self.record_exec_stats("browser");

        let mut argv = self.current_args.clone();
        argv.extend(self.policy_flags.iter().cloned());
        argv.extend(self.session_args.iter().cloned());
        if let Some(user) = &self.session_user {
            if let Some(flags) = self.user_flags.get(user) {
                argv.extend(flags.iter().cloned());
            }
        }

        let mut cmd = tokio::process::Command::new(&self.browser_config.program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);
        if let Some(uid) = self.browser_config.uid {
            cmd.uid(uid);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().map_or(-1, |p| p as i32);
        info!(pid, program = %self.browser_config.program.display(), "running browser");

        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            flag.store(true, Ordering::SeqCst);
            if let Ok(status) = status {
                let _ = tx.send(ChildEvent::BrowserExited { pid, status });
            }
        });

        self.browser = Some(TrackedChild {
            pid,
            never_kill: self.browser_config.never_kill,
            exited,
        });
        Ok(())
    }

    /// Replaces (or extends) the browser argument vector and restarts
    /// it immediately.
    ///
    /// # Errors
    ///
    /// Returns the spawn error from the OS.
    pub fn restart_browser_with_args(
        &mut self,
        args: Vec<String>,
        append: bool,
    ) -> std::io::Result<()> {
        if let Some(browser) = self.browser.take() {
            // Waiting for a clean shutdown takes too long here; the
            // browser has not logged anyone in yet.
            signal_process_group(browser.pid, NixSignal::SIGKILL);
        }
        if append {
            self.current_args.extend(args);
        } else {
            self.current_args = args;
        }
        self.spawn_browser()
    }

    /// Sends `SIGABRT` to the browser's process group.
    pub fn abort_browser(&mut self) {
        if let Some(browser) = &self.browser {
            warn!(pid = browser.pid, "aborting browser");
            signal_process_group(browser.pid, NixSignal::SIGABRT);
        }
    }

    /// Runs the key-generator worker impersonating `username`.
    ///
    /// # Errors
    ///
    /// Returns the spawn error from the OS.
    pub fn run_key_generator(&mut self, username: &str) -> std::io::Result<()> {
        if self.generator.is_some() {
            warn!("key generator already running");
            return Ok(());
        }
        let mut cmd = tokio::process::Command::new(&self.keygen.program);
        cmd.arg(&self.keygen.output_file)
            .arg("--keystore-root")
            .arg(&self.keygen.keystore_root)
            .arg("--user")
            .arg(username)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);
        if let Some(uid) = self.browser_config.uid {
            cmd.uid(uid);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().map_or(-1, |p| p as i32);
        info!(pid, username, "running key generator");

        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let tx = self.events_tx.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            flag.store(true, Ordering::SeqCst);
            if let Ok(status) = status {
                let _ = tx.send(ChildEvent::GeneratorExited { username, status });
            }
        });

        self.generator = Some(TrackedChild {
            pid,
            never_kill: false,
            exited,
        });
        Ok(())
    }

    /// Enters the drain state; new session operations are rejected by
    /// the session manager once this is set.
    pub fn schedule_shutdown(&mut self) {
        self.shutting_down = true;
    }

    /// Decides what to do about a browser exit.
    pub fn handle_exit_status(
        &mut self,
        exit_code: Option<i32>,
        screen_locked: bool,
    ) -> ExitDisposition {
        self.browser = None;

        if self.shutting_down {
            return ExitDisposition::Ignore;
        }
        if screen_locked {
            error!("browser exited while the screen was locked; shutting down");
            return ExitDisposition::ShutDownDaemon;
        }
        if exit_code == Some(CHILD_EXITING_TOO_FAST) && !self.too_crashy.try_record() {
            warn!("browser exiting too fast repeatedly");
            if self.reboots.try_record() {
                return ExitDisposition::Reboot;
            }
            if self.respawns.try_record() {
                return ExitDisposition::Restart;
            }
            error!("respawn budget exhausted; giving up on the browser");
            return ExitDisposition::GiveUp;
        }
        if !self.should_run_browser() {
            info!("spawn gate present; not restarting browser");
            return ExitDisposition::GiveUp;
        }
        ExitDisposition::Restart
    }

    /// Clears the generator tracking after its exit was handled.
    pub fn notice_generator_exit(&mut self) {
        self.generator = None;
    }

    /// Kills remaining children: signal, wait `kill_timeout`, escalate
    /// to `SIGABRT`. Children marked never-kill are exempt.
    pub async fn shutdown_children(&mut self, session_started: bool) {
        let signal = if session_started {
            NixSignal::SIGTERM
        } else {
            NixSignal::SIGKILL
        };

        let mut to_reap = Vec::new();
        for child in [self.browser.take(), self.generator.take()]
            .into_iter()
            .flatten()
        {
            if child.never_kill {
                continue;
            }
            signal_process_group(child.pid, signal);
            to_reap.push(child);
        }
        for child in to_reap {
            if !child.wait_gone(self.kill_timeout).await {
                warn!(pid = child.pid, "child did not exit in time; sending SIGABRT");
                signal_process_group(child.pid, NixSignal::SIGABRT);
                child.wait_gone(self.kill_timeout).await;
            }
        }
    }

    /// Records boot-time uptime and disk stats once per job name.
    fn record_exec_stats(&self, job_name: &str) {
        record_stat_once(
            Path::new("/proc/uptime"),
            &self.exec_stats_dir.join(format!("uptime-{job_name}-exec")),
        );
        record_stat_once(
            Path::new("/sys/block/sda/stat"),
            &self.exec_stats_dir.join(format!("disk-{job_name}-exec")),
        );
    }
}

fn record_stat_once(source: &Path, target: &Path) {
    if target.exists() {
        return;
    }
    let Ok(contents) = std::fs::read(source) else {
        return;
    };
    if let Some(parent) = target.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(target, contents);
}

/// Signals a child's process group, falling back to the pid alone if
/// the group is gone.
fn signal_process_group(pid: i32, signal: NixSignal) {
    if pid <= 0 {
        return;
    }
    if kill(Pid::from_raw(-pid), signal).is_err() {
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &Path) -> (ChildSupervisor, mpsc::UnboundedReceiver<ChildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = ChildSupervisor::new(
            BrowserConfig {
                program: "/bin/true".into(),
                args: vec![],
                uid: None,
                never_kill: false,
            },
            KeygenConfig {
                program: "/bin/true".into(),
                keystore_root: dir.join("keystore"),
                output_file: dir.join("generated.pub"),
            },
            dir.join("disable-spawn"),
            dir.join("stats"),
            Duration::from_millis(500),
            tx,
        );
        (supervisor, rx)
    }

    #[test]
    fn rate_window_budget() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        assert!(window.try_record());
        assert!(window.try_record());
        assert!(!window.try_record());
    }

    #[tokio::test]
    async fn browser_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, mut rx) = supervisor(dir.path());

        supervisor.run().unwrap();
        assert!(supervisor.browser_pid().is_some());

        match rx.recv().await.unwrap() {
            ChildEvent::BrowserExited { pid, status } => {
                assert!(supervisor.is_browser(pid));
                assert!(status.success());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_gate_blocks_running() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("disable-spawn"), b"").unwrap();

        supervisor.run().unwrap();
        assert!(supervisor.browser_pid().is_none());
    }

    #[tokio::test]
    async fn generator_exit_carries_username() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, mut rx) = supervisor(dir.path());

        supervisor.run_key_generator("owner@example.com").unwrap();
        assert!(supervisor.generator_running());

        match rx.recv().await.unwrap() {
            ChildEvent::GeneratorExited { username, status } => {
                assert_eq!(username, "owner@example.com");
                assert!(status.success());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        supervisor.notice_generator_exit();
        assert!(!supervisor.generator_running());
    }

    #[tokio::test]
    async fn exit_during_shutdown_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());

        supervisor.schedule_shutdown();
        assert_eq!(
            supervisor.handle_exit_status(Some(0), false),
            ExitDisposition::Ignore
        );
    }

    #[tokio::test]
    async fn exit_under_locked_screen_stops_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());

        assert_eq!(
            supervisor.handle_exit_status(Some(1), true),
            ExitDisposition::ShutDownDaemon
        );
    }

    #[tokio::test]
    async fn ordinary_exit_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());

        assert_eq!(
            supervisor.handle_exit_status(Some(1), false),
            ExitDisposition::Restart
        );
    }

    #[tokio::test]
    async fn too_crashy_escalates_to_reboot_then_respawns_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());

        // First too-fast exit is within budget: plain restart.
        assert_eq!(
            supervisor.handle_exit_status(Some(CHILD_EXITING_TOO_FAST), false),
            ExitDisposition::Restart
        );
        // Second within the window escalates; the reboot budget admits
        // one reboot.
        assert_eq!(
            supervisor.handle_exit_status(Some(CHILD_EXITING_TOO_FAST), false),
            ExitDisposition::Reboot
        );
        // Further ones burn the respawn budget.
        for _ in 0..RESPAWN_LIMIT {
            assert_eq!(
                supervisor.handle_exit_status(Some(CHILD_EXITING_TOO_FAST), false),
                ExitDisposition::Restart
            );
        }
        assert_eq!(
            supervisor.handle_exit_status(Some(CHILD_EXITING_TOO_FAST), false),
            ExitDisposition::GiveUp
        );
    }

    #[tokio::test]
    async fn shutdown_children_reaps_a_term_friendly_child() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ChildSupervisor::new(
            BrowserConfig {
                program: "/bin/sleep".into(),
                args: vec!["30".into()],
                uid: None,
                never_kill: false,
            },
            KeygenConfig {
                program: "/bin/true".into(),
                keystore_root: dir.path().join("keystore"),
                output_file: dir.path().join("generated.pub"),
            },
            dir.path().join("disable-spawn"),
            dir.path().join("stats"),
            Duration::from_secs(2),
            tx,
        );

        supervisor.run().unwrap();
        assert!(supervisor.browser_pid().is_some());
        supervisor.schedule_shutdown();
        supervisor.shutdown_children(true).await;
        assert!(supervisor.browser_pid().is_none());
    }

    #[tokio::test]
    async fn restart_replaces_or_extends_argv() {
        let dir = tempfile::tempdir().unwrap();
        let (mut supervisor, _rx) = supervisor(dir.path());

        supervisor
            .restart_browser_with_args(vec!["--fresh".into()], false)
            .unwrap();
        assert_eq!(supervisor.current_args, vec!["--fresh"]);

        supervisor
            .restart_browser_with_args(vec!["--extra".into()], true)
            .unwrap();
        assert_eq!(supervisor.current_args, vec!["--fresh", "--extra"]);
    }
}
