//! s3mount — mount an S3/GS-compatible bucket as a POSIX filesystem via FUSE.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use s3fs_core::Stats;
use s3fs_fuse::{Cli, S3FileSystem};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a SIGUSR1 handler that dumps a cache/transfer stats snapshot to
/// the log on request, without interrupting the mount. A background thread
/// polls the flag `signal_hook::flag::register` sets rather than logging
/// from the signal handler itself, which must stay async-signal-safe.
fn install_stats_dump_handler(stats: Arc<Stats>) -> Result<()> {
    let requested = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, requested.clone())
        .context("failed to install SIGUSR1 handler")?;

    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(200));
        if requested.swap(false, Ordering::SeqCst) {
            stats.log_snapshot();
        }
    });

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter()));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn mount_options(cli: &Cli) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(cli.bucket.clone()),
        MountOption::Subtype("s3fs".to_string()),
    ];
    if !cli.foreground {
        options.push(MountOption::AutoUnmount);
    }
    for raw in &cli.mount_options {
        options.push(match raw.as_str() {
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            "default_permissions" => MountOption::DefaultPermissions,
            other => MountOption::CUSTOM(other.to_string()),
        });
    }
    options
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    tracing::info!(bucket = %cli.bucket, mountpoint = %cli.mountpoint.display(), "starting s3mount");

    let mut config = s3fs_core::Config::load(&cli.config, cli.bucket.clone())
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    config.service = cli.service.into();

    let filesystem = S3FileSystem::new(config);
    let options = mount_options(&cli);

    install_stats_dump_handler(filesystem.stats_handle())?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let session = fuser::spawn_mount2(filesystem, &cli.mountpoint, &options)
        .with_context(|| format!("failed to mount {} at {}", cli.bucket, cli.mountpoint.display()))?;

    // Blocks until either the kernel tears the mount down (fusermount -u /
    // umount) or we receive Ctrl-C, at which point dropping the session
    // unmounts explicitly.
    let _ = rx.recv();
    drop(session);

    tracing::info!("unmounted");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("s3mount: {err:#}");
            ExitCode::FAILURE
        }
    }
}
