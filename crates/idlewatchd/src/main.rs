//! idlewatchd — the idlewatch daemon.
//!
//! Stops interactive instances that nobody has used for a while. Meant to
//! be driven by cron or a systemd timer (`idlewatchd pass`), or to run its
//! own loop (`idlewatchd run`).
//!
//! # Usage
//!
//! ```text
//! idlewatchd --config /etc/idlewatch/idlewatch.toml pass
//! idlewatchd status research-nb
//! idlewatchd override research-nb --minutes 120
//! idlewatchd set-threshold 45
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_FILTER: &str = "info,idlewatchd=debug,idlewatch=debug";

#[derive(Parser)]
#[command(
    name = "idlewatchd",
    about = "idlewatch — stop idle interactive instances",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file listing monitored instances.
    #[arg(long, global = true, default_value = "/etc/idlewatch/idlewatch.toml")]
    config: PathBuf,

    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/idlewatch")]
    data_dir: PathBuf,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run passes in a loop until interrupted.
    Run,
    /// Run a single pass now.
    Pass,
    /// Validate the configuration file and exit.
    Check,
    /// Show the state of one instance, or all of them.
    Status {
        instance: Option<String>,
    },
    /// Resume proposing shutdowns.
    Enable,
    /// Stop proposing shutdowns; idleness keeps being tracked.
    Disable,
    /// Change the global idle threshold.
    SetThreshold {
        /// Minutes of inactivity before an instance is stopped.
        minutes: u64,
    },
    /// Keep an instance running for a while regardless of idleness.
    Override {
        instance: String,
        /// Length of the override window.
        #[arg(long, default_value = "60")]
        minutes: u64,
    },
    /// Remove an instance's override.
    ClearOverride {
        instance: String,
    },
    /// Drop all live state of a deprovisioned instance.
    Forget {
        instance: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let ctx = commands::Context {
        config: cli.config,
        data_dir: cli.data_dir,
        json: cli.json,
    };

    match cli.command {
        Command::Run => commands::pass::run(&ctx).await,
        Command::Pass => commands::pass::pass(&ctx).await,
        Command::Check => commands::pass::check(&ctx),
        Command::Status { instance } => commands::control::status(&ctx, instance.as_deref()),
        Command::Enable => commands::control::enable(&ctx),
        Command::Disable => commands::control::disable(&ctx),
        Command::SetThreshold { minutes } => commands::control::set_threshold(&ctx, minutes),
        Command::Override { instance, minutes } => {
            commands::control::set_override(&ctx, &instance, minutes)
        }
        Command::ClearOverride { instance } => commands::control::clear_override(&ctx, &instance),
        Command::Forget { instance } => commands::control::forget(&ctx, &instance),
    }
}
