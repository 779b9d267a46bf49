use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use backy_daemon::Daemon;

#[derive(Debug, Parser)]
#[command(name = "backy-scheduler", about = "Backup scheduling daemon")]
struct Args {
    /// Path to the scheduler configuration file.
    #[arg(short, long, default_value = "/etc/backy.conf")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "backy_core=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let daemon = match Daemon::start(args.config) {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
