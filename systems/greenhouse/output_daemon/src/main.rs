//! Output daemon binary

use aquaflux::components::prelude::*;
use clap::Parser;
use std::process::ExitCode;
use tracing::error;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Output Service Component.
    #[arg(short, long)]
    filepath: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let component = match OutputService::from_config_file(&args.filepath) {
        Ok(component) => component,
        Err(err) => {
            error!("could not load {}: {err}", args.filepath);
            return ExitCode::FAILURE;
        }
    };
    match OutputServiceController::start(component).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
