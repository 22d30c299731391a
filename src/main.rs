//! This file defines the openradiation-relay binary entry point.

#![recursion_limit = "256"]

use openradiation_relay::app;
use openradiation_relay::app_state::AppState;
use openradiation_relay::cli;
use openradiation_relay::metrics;
use openradiation_relay::server;
use openradiation_relay::tracing;

use std::process::ExitCode;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();
    app::init(&args);

    let code = if args.refresh_only {
        refresh(&args).await
    } else {
        let service = app::service(&args);
        server::serve(&args, service).await;
        ExitCode::SUCCESS
    };
    tracing::shutdown_tracing();
    code
}

/// Run one refresh of every dataset.
async fn refresh(args: &cli::CommandLineArgs) -> ExitCode {
    let state = AppState::new(args);
    match state.pipeline.run().await {
        Ok(summary) => {
            ::tracing::info!("Refresh complete: {:?}", summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            ::tracing::error!("Refresh failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
