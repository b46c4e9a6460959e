#[cfg(test)]
mod tests {
    use anyhow::Result;
    use showlink_core::fts::{FileTransferService, FtsConfig, FtsEvent, TransferStatus};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn loopback(name: &str, is_server: bool) -> FtsConfig {
        FtsConfig {
            port: 0,
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            device_name: name.to_string(),
            is_server,
            discovery_interval: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_mapped_transfer_both_sides() -> Result<()> {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        // 1. Shared file larger than the in-memory limit on both nodes
        let share = tempdir()?;
        let downloads = tempdir()?;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(share.path().join("reel.mp4"), &data)?;

        let (server, _server_events) = FileTransferService::start(FtsConfig {
            share_dir: share.path().to_path_buf(),
            memory_limit: 1024,
            ..loopback("wall", true)
        })
        .await?;
        let (client, mut client_events) = FileTransferService::start(FtsConfig {
            download_dir: downloads.path().to_path_buf(),
            memory_limit: 1024,
            chunk_size: Some(32_000),
            ..loopback("kiosk", false)
        })
        .await?;

        // 2. Download under a different local name
        let request = client
            .request_file(server.local_addr(), "reel.mp4", Some("copy.mp4"))
            .await?;

        let mut progress_events = 0;
        let result = timeout(Duration::from_secs(15), async {
            while let Some(event) = client_events.recv().await {
                match event {
                    FtsEvent::DownloadProgress { .. } => progress_events += 1,
                    FtsEvent::DownloadComplete(_) => return Ok(()),
                    FtsEvent::DownloadFailed { reason, .. } => return Err(reason),
                    _ => {}
                }
            }
            Err("event channel closed".to_string())
        })
        .await
        .expect("Timeout waiting for download");
        assert_eq!(result, Ok(()));

        // 3. Ten chunks of 32000 cover 300000 bytes
        assert_eq!(request.total_chunks(), 10);
        assert_eq!(progress_events, 10);
        assert_eq!(request.status(), TransferStatus::Finished);
        assert!(request.transfer_rate() > 0.0);

        let saved = std::fs::read(downloads.path().join("copy.mp4"))?;
        assert_eq!(saved.len(), data.len());
        assert_eq!(saved, data);
        assert!(!downloads.path().join("copy.mp4.part").exists());

        client.dispose().await;
        server.dispose().await;
        Ok(())
    }
}
