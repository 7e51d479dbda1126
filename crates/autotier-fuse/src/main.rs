//! autotierfs — mounts the union view and runs the tiering engine.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autotier_config::{LogLevel, DEFAULT_CONFIG_PATH};
use autotier_core::control::ControlServer;
use autotier_core::engine::TierEngine;
use autotier_core::migrate::MigrationGate;
use autotier_core::resolver::TierSet;
use autotier_fuse::filesystem::UnionFs;
use autotier_fuse::mount::MountSpec;

#[derive(Parser)]
#[command(name = "autotierfs")]
#[command(about = "Mount an automatic-tiering union filesystem", long_about = None)]
struct Cli {
    /// Where to mount the union view.
    mountpoint: PathBuf,

    /// Path to the configuration file.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Comma-separated mount options (allow_other, ro, ...).
    #[arg(short = 'o', long)]
    options: Option<String>,

    /// Log at debug level regardless of the configured level.
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Log errors only, regardless of the configured level.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn init_tracing(level: LogLevel, verbose: bool, quiet: bool) {
    let default_filter = if verbose {
        "autotier_fuse=debug,autotier_core=debug,autotier_config=debug"
    } else if quiet {
        "error"
    } else {
        match level {
            LogLevel::None => "error",
            LogLevel::Normal => "info",
            LogLevel::Debug => "autotier_fuse=debug,autotier_core=debug,autotier_config=debug",
        }
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A freshly created default config is still a startup failure: the
    // operator has to fill in the tier sections first.
    let config = match autotier_config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.log_level, cli.verbose, cli.quiet);
    tracing::info!(
        mountpoint = %cli.mountpoint.display(),
        config = %cli.config.display(),
        tiers = config.tiers.len(),
        "autotier starting"
    );

    let mount = match MountSpec::build(
        &cli.mountpoint,
        cli.options.as_deref().unwrap_or(""),
        &config.tiers,
    ) {
        Ok(mount) => mount,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let tiers = Arc::new(TierSet::new(&config.tiers));
    for tier in tiers.tiers() {
        if let Err(e) = tier.refresh() {
            tracing::error!(tier = tier.id(), error = %e, "cannot sample tier at startup");
        }
    }

    let gate = Arc::new(MigrationGate::new());
    let engine = TierEngine::new(
        Arc::clone(&tiers),
        Arc::clone(&gate),
        config.tier_period,
        config.copy_buffer_size,
    );
    let engine_thread = engine.spawn();

    let socket_path = config.control_socket_path(&cli.config);
    let control = ControlServer::bind(&socket_path, Arc::clone(&engine), config.clone())
        .with_context(|| format!("cannot bind control socket at {}", socket_path.display()))?;
    let control_stop = control.shutdown_handle();
    let control_thread = control.spawn();

    let filesystem = UnionFs::new(Arc::clone(&tiers), gate, config.copy_buffer_size);
    let session = fuser::spawn_mount2(filesystem, mount.mountpoint(), mount.fuser_options())
        .with_context(|| format!("mount failed at {}", cli.mountpoint.display()))?;
    tracing::info!(mountpoint = %cli.mountpoint.display(), "mounted");

    wait_for_shutdown().await;

    tracing::info!("shutting down");
    engine.request_stop();
    control_stop.store(true, Ordering::SeqCst);
    drop(session);
    let _ = tokio::task::spawn_blocking(move || {
        let _ = engine_thread.join();
        let _ = control_thread.join();
    })
    .await;
    tracing::info!("unmounted cleanly");
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::debug!("SIGINT received"),
        _ = sigterm.recv() => tracing::debug!("SIGTERM received"),
    }
}
