#![warn(missing_docs)]
//! crdtfs mount daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crdtfs_fuse::{CrdtFs, CrdtFsConfig, FuseBridge};
use crdtfs_store::{MemoryStore, ReplicatedStore};

#[derive(Parser, Debug)]
#[command(name = "crdtfs-mount")]
#[command(about = "Mount a crdtfs filesystem", long_about = None)]
struct Args {
    /// Directory to mount on; overrides the config file.
    mountpoint: Option<PathBuf>,

    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "CRDTFS_CONFIG")]
    config: Option<PathBuf>,

    /// Site id of the local replica.
    #[arg(long, env = "CRDTFS_SITE_ID")]
    site_id: Option<u64>,

    /// Write the demo entries into the root on startup.
    #[arg(long)]
    seed_demo: bool,
}

fn load_config(args: &Args) -> Result<CrdtFsConfig> {
    let mut config = match &args.config {
        Some(path) if path.exists() => CrdtFsConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            CrdtFsConfig::default()
        }
        None => CrdtFsConfig::default(),
    };
    if let Some(mountpoint) = &args.mountpoint {
        config.mountpoint = mountpoint.clone();
    }
    if let Some(site_id) = args.site_id {
        config.site_id = site_id;
    }
    if args.seed_demo {
        config.seed_demo = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(
        "crdtfs starting: mountpoint={} site={}",
        config.mountpoint.display(),
        config.site_id
    );

    // fuser drives callbacks from this thread, so the runtime must not own it
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new(config.site_id));
    let fs = Arc::new(CrdtFs::new(store, &config));
    let bridge = FuseBridge::new(fs, runtime.handle().clone(), &config);

    let mut options = vec![MountOption::FSName(config.fs_name.clone())];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }

    fuser::mount2(bridge, &config.mountpoint, &options)
        .with_context(|| format!("mounting at {}", config.mountpoint.display()))?;
    tracing::info!("crdtfs unmounted");
    Ok(())
}
