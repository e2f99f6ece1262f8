//! sessiond - privileged session and policy daemon.
//!
//! The binary wires the policy core, the child supervisor, and the
//! liveness checker into a single-threaded cooperative main loop.
//! SIGTERM/SIGINT/SIGHUP drive the same graceful shutdown as an
//! RPC-initiated stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sessiond::events::{InitSignalEmitter, LoggingPowerControl, PowerControl};
use sessiond::liveness::{LivenessAction, LivenessChecker, DEFAULT_LIVENESS_INTERVAL};
use sessiond::paths::Paths;
use sessiond::session_manager::SessionManager;
use sessiond::supervisor::{
    BrowserConfig, ChildEvent, ChildSupervisor, KeygenConfig, DEFAULT_KILL_TIMEOUT,
};
use sessiond_core::crypto::keystore::DiskKeystore;
use sessiond_core::events::SignalEmitter;
use sessiond_core::mitigator::{GeneratorLauncher, RegenMitigator};
use sessiond_core::owner_key::OwnerKey;
use sessiond_core::policy::{
    DeviceLocalAccountPolicyService, DevicePolicyService, Persister, PolicyStore,
    UserPolicyServiceFactory,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// sessiond - session and policy management daemon
#[derive(Parser, Debug)]
#[command(name = "sessiond")]
#[command(version, about, long_about = None)]
struct Args {
    /// UID the browser child must run as
    #[arg(long)]
    uid: Option<u32>,

    /// Seconds to wait for a signalled child before SIGABRT
    /// (default 3, or 12 on a spinning-disk profile)
    #[arg(long)]
    kill_timeout: Option<u64>,

    /// Enable browser hang detection, optionally with a ping interval
    /// in seconds
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "60")]
    enable_hang_detection: Option<u64>,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to initctl for init-event emission; omit to log only
    #[arg(long)]
    initctl: Option<std::path::PathBuf>,

    /// Path to the key-generator worker binary
    #[arg(long, default_value = "/usr/sbin/sessiond-keygen")]
    keygen: std::path::PathBuf,

    /// Browser argv template
    #[arg(last = true, required = true)]
    browser_args: Vec<String>,
}

/// Default kill timeout, stretched on spinning-disk profiles where the
/// browser takes longer to flush and exit.
fn default_kill_timeout() -> Duration {
    let rotational = std::fs::read_to_string("/sys/block/sda/queue/rotational")
        .map_or(false, |s| s.trim() == "1");
    if rotational {
        Duration::from_secs(12)
    } else {
        DEFAULT_KILL_TIMEOUT
    }
}

/// Requests key-generator runs through the main loop.
struct ChannelLauncher {
    tx: mpsc::UnboundedSender<String>,
}

impl GeneratorLauncher for ChannelLauncher {
    fn launch(&self, username: &str) -> bool {
        self.tx.send(username.to_string()).is_ok()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = Paths::default();
    let emitter: Arc<dyn SignalEmitter> = Arc::new(InitSignalEmitter::new(args.initctl.clone()));
    let power: Arc<dyn PowerControl> = Arc::new(LoggingPowerControl);
    let keystore =
        Arc::new(DiskKeystore::new(&paths.keystore_root).context("creating keystore root")?);

    let (persister, persister_task) = Persister::spawn(emitter.clone());
    let (child_events_tx, mut child_events) = mpsc::unbounded_channel();
    let (mitigation_tx, mut mitigation_requests) = mpsc::unbounded_channel();

    let mut browser_argv = args.browser_args.clone();
    let browser_program = browser_argv.remove(0);
    let supervisor = ChildSupervisor::new(
        BrowserConfig {
            program: browser_program.into(),
            args: browser_argv,
            uid: args.uid,
            never_kill: false,
        },
        KeygenConfig {
            program: args.keygen.clone(),
            keystore_root: paths.keystore_root.clone(),
            output_file: paths.generated_key_file.clone(),
        },
        paths.spawn_gate.clone(),
        paths.exec_stats_dir.clone(),
        args.kill_timeout
            .map_or_else(default_kill_timeout, Duration::from_secs),
        child_events_tx,
    );

    let device_policy = DevicePolicyService::new(
        OwnerKey::new(paths.owner_key.clone()),
        PolicyStore::new(paths.device_policy.clone()),
        persister.clone(),
        RegenMitigator::new(Box::new(ChannelLauncher {
            tx: mitigation_tx,
        })),
        emitter.clone(),
        paths.serial_recovery_flag.clone(),
    );

    let hang_detection = args.enable_hang_detection.is_some();
    let liveness_interval = args
        .enable_hang_detection
        .map_or(DEFAULT_LIVENESS_INTERVAL, Duration::from_secs);
    let liveness = LivenessChecker::new(emitter.clone(), liveness_interval, true);

    let mut manager = SessionManager::new(
        device_policy,
        UserPolicyServiceFactory::new(paths.user_policy_root.clone(), persister.clone()),
        DeviceLocalAccountPolicyService::new(
            paths.device_local_policy_root.clone(),
            persister.clone(),
        ),
        supervisor,
        liveness,
        hang_detection,
        keystore,
        emitter,
        power,
        persister,
        paths,
    )
    .context("generating the authentication cookie")?;

    manager
        .initialize()
        .context("initializing policy subsystems")?;
    manager.run_browser().context("running browser")?;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let liveness_interval = manager.liveness_interval();
    let mut liveness_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + liveness_interval,
        liveness_interval,
    );
    liveness_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("sessiond running");
    loop {
        tokio::select! {
            Some(event) = child_events.recv() => match event {
                ChildEvent::BrowserExited { status, .. } => {
                    manager.handle_browser_exit(&status);
                }
                ChildEvent::GeneratorExited { username, status } => {
                    manager.handle_generator_exit(&username, &status);
                }
            },
            Some(username) = mitigation_requests.recv() => {
                if let Err(e) = manager.supervisor_mut().run_key_generator(&username) {
                    warn!(error = %e, "mitigation key-generator launch failed");
                }
            },
            _ = liveness_timer.tick(), if hang_detection => {
                if manager.liveness_tick() == LivenessAction::AbortBrowser {
                    warn!("liveness checker aborted the browser");
                }
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                manager.schedule_shutdown();
            },
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                manager.schedule_shutdown();
            },
            _ = sighup.recv() => {
                info!("SIGHUP received; shutting down");
                manager.schedule_shutdown();
            },
        }

        if manager.should_exit() {
            break;
        }
    }

    manager.shutdown().await;
    drop(manager);
    if let Err(e) = persister_task.await {
        error!(error = %e, "persister task failed");
    }
    info!("sessiond exiting");
    Ok(())
}
