mod acts;
mod classifier;
mod config;
mod device;
mod models;
mod mqtt_service;
mod presentation;
mod remote;
mod sequencer;
mod service_utils;

use crate::config::Settings;
use crate::device::TracingDevice;
use crate::presentation::Presentation;
use crate::sequencer::ActOutcome;
use crate::service_utils::init_logging;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration; nothing touches the broker or the robot before this succeeds
    let settings = match Settings::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            let _ = init_logging(false, Path::new("."));
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(settings.debug, &settings.log_dir);
    info!("Configuration loaded, broker {}:{}.", settings.broker.host, settings.broker.port);

    let device = Arc::new(TracingDevice::new(&settings.robot));
    let mut presentation = Presentation::new(settings, device);

    if let Some(report) = presentation.start().await {
        let failed = report
            .outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ActOutcome::Failed(_)))
            .count();
        info!(
            "{} act(s) ran, {} failed, finalized: {}.",
            report.outcomes.len(),
            failed,
            report.finalized
        );
    }

    presentation.shutdown().await;
    info!("All services shut down successfully.");
    ExitCode::SUCCESS
}
