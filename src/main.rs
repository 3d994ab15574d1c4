use std::process::ExitCode;

use clap::Parser;
use kafka_scale::{
    commands,
    config::{Cli, Settings},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,kafka_scale=debug"
    } else {
        "info"
    };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match Settings::from_cli(cli) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid command line");
            return ExitCode::from(2);
        }
    };
    if settings.dry_run {
        println!("{}", settings.describe());
        return ExitCode::SUCCESS;
    }
    info!(command = %settings.command, "startup");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; shutting down");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "can't listen for interrupts"),
        }
    });

    match commands::run(settings, cancel).await {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            ExitCode::FAILURE
        }
    }
}
