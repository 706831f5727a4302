//! Engine RPM monitor
//!
//! Connects to the most likely configured ELM327 adapter, polls engine speed
//! once a second and logs each reading until interrupted.

mod settings;

use anyhow::{anyhow, Context, Result};
use obd_link::{sort_by_likelihood, LinkSession};
use obd_scheduler::{LinkStatus, PollEvent};
use settings::MonitorSettings;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level
        .parse()
        .with_context(|| format!("invalid log level {level:?}"))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Presentation side: turns poll events into log lines
async fn report(mut events: mpsc::Receiver<PollEvent>) {
    while let Some(event) = events.recv().await {
        match event.status() {
            LinkStatus::Reading(rpm) => info!("Engine speed: {} rpm", rpm),
            LinkStatus::WaitingForData => warn!("Waiting for data"),
            LinkStatus::ConnectionProblems => error!("Connection problems: {:?}", event),
            LinkStatus::Rejected => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = MonitorSettings::load().context("Failed to load configuration")?;
    init_logging(&settings.log_level)?;

    let mut devices = settings.devices();
    sort_by_likelihood(&mut devices);
    let device = devices
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no devices configured"))?;

    let mut session = LinkSession::new(settings.opener(), settings.session_config()?);
    let started = match session.start(&device, None).await {
        Ok(started) => started,
        Err(e) => {
            error!("Link {:?}: {}", e.status(), e);
            return Err(e.into());
        }
    };
    info!(
        "Reading from {} ({}, protocol {})",
        device.label(),
        started.banner,
        started.detected_protocol.unwrap_or(started.protocol)
    );

    let mut reporter = tokio::spawn(report(started.events));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = &mut reporter => warn!("Polling ended"),
    }

    if let Some(reason) = session.stop().await? {
        info!("Polling stopped: {:?}", reason);
    }
    if !reporter.is_finished() {
        reporter.await?;
    }
    Ok(())
}
