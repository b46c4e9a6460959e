use anyhow::{Context, Result};
use showlink_core::fts::{FileTransferService, FtsEvent};
use showlink_core::timesync::{TimeRelay, TimeSyncEvent, TimeSyncService};
use showlink_core::NodeConfig;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::load();
    if let Some(path) = NodeConfig::config_path() {
        if !path.exists() {
            match config.save() {
                Ok(()) => info!("Wrote default config to {}", path.display()),
                Err(e) => warn!("Could not write default config: {}", e),
            }
        }
    }
    info!("Starting showlink node '{}'", config.device_name);

    let fts = if config.fts.enabled {
        let (service, events) = FileTransferService::start(config.fts_config())
            .await
            .context("Failed to start file transfer service")?;
        tokio::spawn(log_fts_events(events));
        if let Err(e) = service.poll_devices().await {
            warn!("Initial discovery broadcast failed: {}", e);
        }
        Some(service)
    } else {
        None
    };

    let (sync, relay) = if config.timesync.enabled {
        let (service, events) = TimeSyncService::start(config.timesync_config());
        tokio::spawn(log_sync_events(events));
        let relay = match config.relay_config() {
            Some(relay_config) => Some(
                TimeRelay::start(relay_config, service.clock())
                    .await
                    .context("Failed to start time relay")?,
            ),
            None => None,
        };
        (Some(service), relay)
    } else {
        (None, None)
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if let Some(relay) = relay {
        relay.dispose().await;
    }
    if let Some(sync) = sync {
        sync.dispose().await;
    }
    if let Some(fts) = fts {
        fts.dispose().await;
    }
    Ok(())
}

async fn log_fts_events(mut events: mpsc::Receiver<FtsEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            FtsEvent::DeviceFound(device) => info!(
                "Device {} at {} ({}, server: {})",
                device.name, device.ip, device.os, device.is_server
            ),
            FtsEvent::DownloadStarted(request) => info!(
                "Downloading {} from {} ({} bytes)",
                request.source_name(),
                request.remote_addr(),
                request.file_size()
            ),
            FtsEvent::DownloadProgress { .. } => {}
            FtsEvent::DownloadComplete(request) => info!(
                "Downloaded {} in {:.1}s ({:.0} KB/s)",
                request.save_path().display(),
                request.elapsed().as_secs_f64(),
                request.transfer_rate() / 1024.0
            ),
            FtsEvent::DownloadFailed { request, reason } => {
                error!("Download of {} failed: {}", request.source_name(), reason)
            }
            FtsEvent::FileDenied { request, reason } => {
                warn!("{} denied by {}: {}", request.source_name(), request.remote_addr(), reason)
            }
            FtsEvent::FileTimeout(request) => {
                warn!("{} from {} timed out", request.source_name(), request.remote_addr())
            }
            FtsEvent::UploadStarted(upload) => {
                info!("Uploading {} to {}", upload.file_name(), upload.remote_addr())
            }
            FtsEvent::UploadComplete(upload) => {
                info!("Upload of {} to {} complete", upload.file_name(), upload.remote_addr())
            }
            FtsEvent::UploadRejected(upload) => {
                info!("{} rejected {}", upload.remote_addr(), upload.file_name())
            }
            FtsEvent::UploadAwaitingConfirmation(upload) => info!(
                "{} must confirm {} before it is sent",
                upload.remote_addr(),
                upload.file_name()
            ),
            FtsEvent::UploadTimeout(upload) => {
                warn!("Upload of {} to {} went idle", upload.file_name(), upload.remote_addr())
            }
            FtsEvent::PushOffered { from, file } => info!("{} offers {}", from, file),
            FtsEvent::Error { code, message } => error!("FTS error {}: {}", code, message),
        }
    }
}

async fn log_sync_events(mut events: mpsc::Receiver<TimeSyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TimeSyncEvent::Synced { utc, offset } => {
                info!("Clock synced to {} (offset {} ms)", utc, offset.num_milliseconds())
            }
            TimeSyncEvent::Error { code, message } => warn!("Time sync error {}: {}", code, message),
        }
    }
}
