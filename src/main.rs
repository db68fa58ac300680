use pulse_ingest::persistence::SqliteStore;
use pulse_ingest::transport::ble::BleTransport;
use pulse_ingest::{Config, ConnectionState, IngestionPipeline, PipelineEvent};
use std::error::Error;
use std::time::Duration;

/// How often a dropped or failed link is retried
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let store = SqliteStore::open(&config.database_path)?;
    let transport = BleTransport::new().await?;

    let (pipeline, events) = IngestionPipeline::new(&config, transport, store)?;

    // State changes are already logged by the supervisor; surface the rest
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                PipelineEvent::PersistenceFailed { .. }
                | PipelineEvent::BatchDropped { .. }
                | PipelineEvent::TeardownFailed { .. }
                | PipelineEvent::LinkLost => log::warn!("{:?}", event),
                other => log::debug!("{:?}", other),
            }
        }
    });

    pipeline.start().await?;
    log::info!("Monitoring heart rate, press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {
                if matches!(pipeline.state().await, ConnectionState::Idle | ConnectionState::Failed(_)) {
                    log::info!("Link down, reconnecting");
                    if let Err(e) = pipeline.start().await {
                        log::warn!("Reconnect failed: {}", e);
                    }
                }
            }
        }
    }

    let report = pipeline.stop().await?;
    log::info!(
        "Stopped: {} samples written, {} awaiting retry",
        report.persisted,
        report.retained
    );
    Ok(())
}
