//! autotier — talks to a running autotierfs daemon over its control
//! socket.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use autotier_config::DEFAULT_CONFIG_PATH;
use autotier_core::control::{send_request, Request};

#[derive(Parser)]
#[command(name = "autotier")]
#[command(about = "Ad-hoc commands for a running autotier mount", long_about = None)]
struct Cli {
    /// Path to the configuration file (locates the control socket).
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trigger an immediate tiering pass.
    Oneshot,
    /// Show per-tier capacity and fill levels.
    Status,
    /// Show which tier currently holds a logical path.
    WhichTier {
        /// Logical path as seen through the mount.
        path: String,
    },
    /// Print the daemon's loaded configuration.
    Config,
}

impl Command {
    fn to_request(&self) -> Request {
        match self {
            Command::Oneshot => Request::Oneshot,
            Command::Status => Request::Status,
            Command::WhichTier { path } => Request::WhichTier(path.clone()),
            Command::Config => Request::ConfigDump,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = autotier_config::load(&cli.config)
        .with_context(|| format!("cannot load config {}", cli.config.display()))?;
    let socket = config.control_socket_path(&cli.config);

    let reply = send_request(&socket, &cli.command.to_request()).with_context(|| {
        format!(
            "cannot reach autotierfs at {} (is the daemon running?)",
            socket.display()
        )
    })?;

    for line in &reply.lines {
        println!("{line}");
    }
    if !reply.ok {
        bail!("daemon reported an error");
    }
    Ok(())
}
