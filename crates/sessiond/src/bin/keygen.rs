//! sessiond-keygen - owner key generation worker.
//!
//! Run by the daemon impersonating the session user's UID. Generates a
//! fresh keypair into the user's keystore slot and writes the public
//! half to the output path, where the daemon picks it up for
//! validation. Refuses to run over an existing owner key.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sessiond_core::crypto::keystore::{DiskKeystore, Keystore};
use sessiond_core::owner_key::OwnerKey;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// sessiond-keygen - generate the device owner keypair
#[derive(Parser, Debug)]
#[command(name = "sessiond-keygen")]
#[command(version, about, long_about = None)]
struct Args {
    /// Where to write the generated public key
    output_file: PathBuf,

    /// Root of the per-user keystores
    #[arg(long)]
    keystore_root: PathBuf,

    /// Canonical email of the user taking ownership
    #[arg(long)]
    user: String,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut key = OwnerKey::new(&args.output_file);
    key.populate_from_disk_if_possible()
        .with_context(|| format!("corrupted key on disk at {}", args.output_file.display()))?;
    if key.is_populated() {
        bail!("existing owner key at {}", args.output_file.display());
    }

    let keystore = DiskKeystore::new(&args.keystore_root).context("opening keystore root")?;
    let mut slot = keystore
        .open_user_slot(&args.user)
        .context("opening the user's keystore slot")?;

    info!("generating owner key");
    let pair = slot
        .generate_keypair()
        .context("generating the owner keypair")?;
    key.populate_from_keypair(&pair)
        .context("could not use generated keypair")?;

    info!(path = %args.output_file.display(), "writing owner key");
    key.persist().context("persisting the owner public key")?;
    Ok(())
}
