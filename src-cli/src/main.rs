mod commands;
mod state;

use clap::{Parser, Subcommand};
use klapp_config::ConfigOverrides;
use state::AppState;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "klapp", version, about = "Keep a local mirror of a KLAPP parent inbox")]
struct Cli {
    /// Directory holding config.toml. Defaults to the platform config location.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,

    #[arg(long, global = true)]
    request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll on schedule until interrupted, logging every change.
    Run,
    /// Poll once and print the unread messages as JSON.
    Status,
    /// Mark one message read, locally and upstream.
    MarkRead { id: String },
    /// Mark every unread message read with one batch request.
    MarkAllRead,
    /// Store the account password in the OS keychain. Reads it from stdin.
    SetPassword {
        #[arg(long)]
        email: Option<String>,
    },
    /// Remove the stored account password.
    ForgetPassword {
        #[arg(long)]
        email: Option<String>,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            poll_interval_secs: self.poll_interval_secs,
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_dir = cli.config_dir.as_deref();

    match &cli.command {
        Command::SetPassword { email } => {
            return commands::set_password(config_dir, email.as_deref());
        }
        Command::ForgetPassword { email } => {
            return commands::forget_password(config_dir, email.as_deref());
        }
        _ => {}
    }

    let state = AppState::initialize(config_dir, &cli.overrides())?;
    match cli.command {
        Command::Run => commands::run(&state).await,
        Command::Status => commands::status(&state).await,
        Command::MarkRead { id } => commands::mark_read(&state, &id).await,
        Command::MarkAllRead => commands::mark_all_read(&state).await,
        Command::SetPassword { .. } | Command::ForgetPassword { .. } => Ok(()),
    }
}
