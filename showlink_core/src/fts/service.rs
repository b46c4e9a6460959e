//! The FTS node: discovery, downloads and uploads over one UDP socket.

use crate::address;
use crate::fts::devices::{DeviceRegistry, RemoteDevice};
use crate::fts::protocol::{
    self, ChunkAck, DenyReason, DeviceInfo, FtsMessage, PROTOCOL_VERSION,
};
use crate::fts::resource::{DEFAULT_RESOURCE_TTL, FileResource, ResourceCache, ResourceError, normalize_key};
use crate::fts::transfer::{ChunkOutcome, FileRequest, FileUpload, RetryDecision, TransferStatus};
use crate::fts::{FtsError, MAX_FILE_NAME_LEN, sanitize_file_name};
use crate::udp::{UdpConnection, UdpConnectionConfig, UdpEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_FTS_PORT: u16 = 7744;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct FtsConfig {
    pub port: u16,
    pub local_ip: Option<IpAddr>,
    pub device_name: String,
    pub os: String,
    /// Serve files from `share_dir` to any requester.
    pub is_server: bool,
    pub share_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Requested chunk size; capped by what fits in one datagram.
    pub chunk_size: Option<u32>,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub resource_ttl: Duration,
    /// Period of the resource eviction and upload idle checks.
    pub maintenance_interval: Duration,
    /// Files above this size are memory-mapped instead of buffered.
    pub memory_limit: u64,
    /// Files above this size are refused with deny code 2.
    pub max_file_size: u64,
    /// Broadcast discovery period; `None` polls only on demand.
    pub discovery_interval: Option<Duration>,
    /// Upper bound of the random delay before answering a discovery query.
    pub discovery_reply_delay: Duration,
    pub upload_timeout: Duration,
    pub auto_accept_push: bool,
    pub event_capacity: usize,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_FTS_PORT,
            local_ip: None,
            device_name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "showlink".to_string()),
            os: std::env::consts::OS.to_string(),
            is_server: false,
            share_dir: PathBuf::from("share"),
            download_dir: PathBuf::from("downloads"),
            chunk_size: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            resource_ttl: DEFAULT_RESOURCE_TTL,
            maintenance_interval: Duration::from_secs(5),
            memory_limit: 64 * 1024 * 1024,
            max_file_size: 4 * 1024 * 1024 * 1024,
            discovery_interval: Some(Duration::from_secs(10)),
            discovery_reply_delay: Duration::from_millis(500),
            upload_timeout: Duration::from_secs(30),
            auto_accept_push: true,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FtsEvent {
    DeviceFound(RemoteDevice),
    DownloadStarted(Arc<FileRequest>),
    DownloadProgress {
        request: Arc<FileRequest>,
        chunks_received: u32,
        total_chunks: u32,
    },
    DownloadComplete(Arc<FileRequest>),
    DownloadFailed {
        request: Arc<FileRequest>,
        reason: String,
    },
    FileDenied {
        request: Arc<FileRequest>,
        reason: DenyReason,
    },
    /// Retries were exhausted without progress.
    FileTimeout(Arc<FileRequest>),
    UploadStarted(Arc<FileUpload>),
    UploadComplete(Arc<FileUpload>),
    UploadRejected(Arc<FileUpload>),
    UploadAwaitingConfirmation(Arc<FileUpload>),
    UploadTimeout(Arc<FileUpload>),
    PushOffered {
        from: SocketAddr,
        file: String,
    },
    Error {
        code: i32,
        message: String,
    },
}

#[derive(Clone)]
pub struct FileTransferService {
    inner: Arc<FtsInner>,
}

struct FtsInner {
    config: FtsConfig,
    udp: UdpConnection,
    local_addr: SocketAddr,
    io_buffer_size: usize,
    events: Mutex<Option<mpsc::Sender<FtsEvent>>>,
    devices: DeviceRegistry,
    requests: Mutex<Vec<Arc<FileRequest>>>,
    uploads: Mutex<Vec<Arc<FileUpload>>>,
    pending_pushes: Mutex<Vec<(SocketAddr, String)>>,
    /// Files offered by `broadcast_file`, served to any requester.
    offered: Mutex<HashSet<String>>,
    resources: Arc<ResourceCache>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl FileTransferService {
    /// Bind the FTS socket and start the receive, maintenance and discovery tasks.
    pub async fn start(config: FtsConfig) -> Result<(Self, mpsc::Receiver<FtsEvent>), FtsError> {
        let (udp, udp_rx) = UdpConnection::new(UdpConnectionConfig {
            port: config.port,
            local_ip: config.local_ip,
            broadcast: true,
            ..Default::default()
        });
        let local_addr = udp.connect(None).await?;
        let io_buffer_size = udp.io_buffer_size();

        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let resources = Arc::new(ResourceCache::new(
            config.share_dir.clone(),
            config.resource_ttl,
            config.memory_limit,
            config.max_file_size,
        ));
        let inner = Arc::new(FtsInner {
            config,
            udp,
            local_addr,
            io_buffer_size,
            events: Mutex::new(Some(tx)),
            devices: DeviceRegistry::default(),
            requests: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            pending_pushes: Mutex::new(Vec::new()),
            offered: Mutex::new(HashSet::new()),
            resources,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&inner).pump(udp_rx));
        tokio::spawn(Arc::clone(&inner).maintenance_loop());
        if let Some(period) = inner.config.discovery_interval {
            tokio::spawn(Arc::clone(&inner).discovery_loop(period));
        }
        info!(
            "FTS node '{}' on {} (server: {}, io buffer {} bytes)",
            inner.config.device_name, local_addr, inner.config.is_server, io_buffer_size
        );
        Ok((Self { inner }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &FtsConfig {
        &self.inner.config
    }

    pub fn devices(&self) -> Vec<RemoteDevice> {
        self.inner.devices.snapshot()
    }

    pub fn requests(&self) -> Vec<Arc<FileRequest>> {
        self.inner.requests.lock().clone()
    }

    pub fn uploads(&self) -> Vec<Arc<FileUpload>> {
        self.inner.uploads.lock().clone()
    }

    /// Broadcast a discovery query on the FTS port.
    pub async fn poll_devices(&self) -> Result<(), FtsError> {
        let query = FtsMessage::Discover(self.inner.device_info()).encode();
        self.inner.udp.broadcast(&query, self.inner.config.port).await?;
        Ok(())
    }

    /// Send a discovery query to one address.
    pub async fn poll_device(&self, target: SocketAddr) -> Result<(), FtsError> {
        let query = FtsMessage::Discover(self.inner.device_info());
        self.inner.send(target, &query).await
    }

    /// Start downloading `file` from `remote`, or return the request already
    /// running for that (remote IP, file) pair.
    pub async fn request_file(
        &self,
        remote: SocketAddr,
        file: &str,
        save_name: Option<&str>,
    ) -> Result<Arc<FileRequest>, FtsError> {
        self.inner.request_file(remote, file, save_name).await
    }

    /// Offer `file` from the share directory to one peer.
    pub async fn push_file(&self, target: SocketAddr, file: &str) -> Result<Arc<FileUpload>, FtsError> {
        let inner = &self.inner;
        inner.check_alive()?;
        let key = inner.checked_key(file)?;
        let resource = inner.load_resource(&key).await?;

        let upload = {
            let mut uploads = inner.uploads.lock();
            match uploads.iter().find(|u| u.matches(target.ip(), &key)) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let upload = Arc::new(FileUpload::new(target, &key, resource, true));
                    uploads.push(Arc::clone(&upload));
                    upload
                }
            }
        };
        inner
            .send(target, &FtsMessage::PushOffer { file: key })
            .await?;
        Ok(upload)
    }

    /// Offer `file` to every peer on the broadcast domain. Best effort.
    pub async fn broadcast_file(&self, file: &str) -> Result<(), FtsError> {
        let inner = &self.inner;
        inner.check_alive()?;
        let key = inner.checked_key(file)?;
        inner.load_resource(&key).await?;
        inner.offered.lock().insert(key.clone());

        let offer = FtsMessage::PushOffer { file: key }.encode();
        inner.udp.broadcast(&offer, inner.config.port).await?;
        Ok(())
    }

    /// Accept a push offer held for confirmation.
    pub async fn accept_push(&self, from: IpAddr, file: &str) -> Result<Arc<FileRequest>, FtsError> {
        let pending = self.inner.take_pending_push(from, file);
        let Some((addr, file)) = pending else {
            return Err(FtsError::Denied(DenyReason::NotFound));
        };
        self.inner.request_file(addr, &file, None).await
    }

    pub async fn reject_push(&self, from: IpAddr, file: &str) -> Result<(), FtsError> {
        let pending = self.inner.take_pending_push(from, file);
        let Some((addr, file)) = pending else {
            return Err(FtsError::Denied(DenyReason::NotFound));
        };
        self.inner
            .send(
                addr,
                &FtsMessage::ChunkRequest {
                    file,
                    ack: ChunkAck::Rejected,
                    chunk_size: 0,
                },
            )
            .await
    }

    /// Cancel a download. The remote is told to drop its upload.
    pub async fn abort_file(&self, remote: IpAddr, file: &str) -> bool {
        let Some(request) = self.inner.remove_request(remote, file) else {
            return false;
        };
        request.fail("aborted");
        let reject = FtsMessage::ChunkRequest {
            file: request.source_name().to_string(),
            ack: ChunkAck::Rejected,
            chunk_size: request.chunk_size(),
        };
        let _ = self.inner.send(request.remote_addr(), &reject).await;
        true
    }

    /// Stop every task and release the socket. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.inner.cancel.cancel();
        let requests: Vec<Arc<FileRequest>> = std::mem::take(&mut *self.inner.requests.lock());
        for request in requests {
            request.fail("service disposed");
        }
        self.inner.uploads.lock().clear();
        self.inner.resources.clear();
        self.inner.udp.dispose().await;
    }
}

impl FtsInner {
    async fn emit(&self, event: FtsEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn check_alive(&self) -> Result<(), FtsError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(FtsError::Disposed)
        } else {
            Ok(())
        }
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            is_server: self.config.is_server,
            name: self.config.device_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            os: self.config.os.clone(),
        }
    }

    fn checked_key(&self, file: &str) -> Result<String, FtsError> {
        if !protocol::is_valid_file_name(file) || file.len() > MAX_FILE_NAME_LEN {
            return Err(FtsError::InvalidFileName(file.to_string()));
        }
        normalize_key(file).ok_or_else(|| FtsError::InvalidFileName(file.to_string()))
    }

    /// Chunk size for `file`, capped so one F4 fits in a datagram.
    fn chunk_size_for(&self, file: &str, requested: Option<u32>) -> u32 {
        let max = protocol::max_chunk_size(self.io_buffer_size, file).max(1) as u32;
        requested
            .or(self.config.chunk_size)
            .unwrap_or(max)
            .clamp(1, max)
    }

    async fn send(&self, to: SocketAddr, message: &FtsMessage) -> Result<(), FtsError> {
        self.udp.send_to_addr(to, &message.encode()).await?;
        Ok(())
    }

    async fn load_resource(&self, key: &str) -> Result<Arc<FileResource>, FtsError> {
        let cache = Arc::clone(&self.resources);
        let name = key.to_string();
        match tokio::task::spawn_blocking(move || cache.get_or_load(&name)).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(FtsError::Resource(ResourceError::Io(std::io::Error::other(e)))),
        }
    }

    fn find_request(&self, remote: IpAddr, file: &str) -> Option<Arc<FileRequest>> {
        self.requests
            .lock()
            .iter()
            .find(|r| r.matches(remote, file))
            .cloned()
    }

    fn remove_request(&self, remote: IpAddr, file: &str) -> Option<Arc<FileRequest>> {
        let mut requests = self.requests.lock();
        let index = requests.iter().position(|r| r.matches(remote, file))?;
        let request = requests.remove(index);
        request.stop_retry_timer();
        Some(request)
    }

    fn find_upload(&self, remote: IpAddr, file: &str) -> Option<Arc<FileUpload>> {
        self.uploads
            .lock()
            .iter()
            .find(|u| u.matches(remote, file))
            .cloned()
    }

    fn remove_upload(&self, remote: IpAddr, file: &str) -> Option<Arc<FileUpload>> {
        let mut uploads = self.uploads.lock();
        let index = uploads.iter().position(|u| u.matches(remote, file))?;
        Some(uploads.remove(index))
    }

    fn take_pending_push(&self, from: IpAddr, file: &str) -> Option<(SocketAddr, String)> {
        let mut pending = self.pending_pushes.lock();
        let index = pending
            .iter()
            .position(|(addr, name)| addr.ip() == from && name == file)?;
        Some(pending.remove(index))
    }

    async fn request_file(
        self: &Arc<Self>,
        remote: SocketAddr,
        file: &str,
        save_name: Option<&str>,
    ) -> Result<Arc<FileRequest>, FtsError> {
        self.check_alive()?;
        let key = self.checked_key(file)?;

        let (request, created) = {
            let mut requests = self.requests.lock();
            match requests.iter().find(|r| r.matches(remote.ip(), &key)) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let save_path = self
                        .config
                        .download_dir
                        .join(sanitize_file_name(save_name.unwrap_or(&key)));
                    let chunk_size = self.chunk_size_for(&key, None);
                    let request = Arc::new(FileRequest::new(remote, &key, save_path, chunk_size));
                    requests.push(Arc::clone(&request));
                    (request, true)
                }
            }
        };
        if !created {
            return Ok(request);
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.download_dir).await {
            warn!("Cannot create download dir {:?}: {}", self.config.download_dir, e);
        }

        let token = self.cancel.child_token();
        request.set_retry_timer(token.clone());
        tokio::spawn(Arc::clone(self).retry_loop(Arc::clone(&request), token));

        debug!("Requesting {} from {}", key, remote);
        request.advance(TransferStatus::Requested);
        self.send_chunk_request(&request, 0).await;
        Ok(request)
    }

    async fn send_chunk_request(&self, request: &FileRequest, part: u32) {
        let message = FtsMessage::ChunkRequest {
            file: request.source_name().to_string(),
            ack: ChunkAck::Part(part),
            chunk_size: request.chunk_size(),
        };
        if let Err(e) = self.send(request.remote_addr(), &message).await {
            debug!("Chunk request to {} failed: {}", request.remote_addr(), e);
        }
    }

    async fn retry_loop(self: Arc<Self>, request: Arc<FileRequest>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match request.retry_tick(self.config.max_retries) {
                RetryDecision::Resend(part) => {
                    debug!(
                        "Retry {} for {} chunk {}",
                        request.retry_count(),
                        request.source_name(),
                        part
                    );
                    self.send_chunk_request(&request, part).await;
                }
                RetryDecision::Stop => return,
                RetryDecision::TimedOut => {
                    warn!(
                        "{} from {} timed out after {} retries",
                        request.source_name(),
                        request.remote_addr(),
                        self.config.max_retries
                    );
                    self.requests.lock().retain(|r| !Arc::ptr_eq(r, &request));
                    self.emit(FtsEvent::FileTimeout(request)).await;
                    return;
                }
            }
        }
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<UdpEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                ev = rx.recv() => ev,
            };
            let Some(event) = event else {
                return;
            };
            match event {
                UdpEvent::Message { from, data } => self.handle_datagram(from, data).await,
                UdpEvent::Error { code, message } => {
                    self.emit(FtsEvent::Error { code, message }).await
                }
                UdpEvent::Close => {
                    warn!("FTS socket closed");
                    return;
                }
                UdpEvent::Open(_) => {}
            }
        }
    }

    fn is_own_datagram(&self, from: SocketAddr) -> bool {
        from.port() == self.local_addr.port()
            && (from.ip() == self.local_addr.ip() || address::is_local_ip(&from.ip()))
    }

    async fn handle_datagram(self: &Arc<Self>, from: SocketAddr, data: Bytes) {
        if self.is_own_datagram(from) {
            return;
        }
        let message = match FtsMessage::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        match message {
            FtsMessage::Discover(info) => {
                self.register_device(from.ip(), info).await;
                tokio::spawn(Arc::clone(self).answer_discovery(from));
            }
            FtsMessage::Announce(info) => self.register_device(from.ip(), info).await,
            FtsMessage::Denied { file, reason } => {
                if let Some(request) = self.remove_request(from.ip(), &file) {
                    info!("{} denied by {}: {}", file, from, reason);
                    request.fail(reason.to_string());
                    self.emit(FtsEvent::FileDenied { request, reason }).await;
                }
            }
            FtsMessage::ChunkRequest {
                file,
                ack,
                chunk_size,
            } => self.handle_chunk_request(from, file, ack, chunk_size).await,
            FtsMessage::Chunk {
                file,
                part,
                chunk_size,
                total_chunks,
                file_size,
                data,
            } => {
                self.handle_chunk(from, &file, part, chunk_size, total_chunks, file_size, &data)
                    .await
            }
            FtsMessage::PushOffer { file } => self.handle_push_offer(from, file).await,
        }
    }

    async fn register_device(&self, ip: IpAddr, info: DeviceInfo) {
        let device = RemoteDevice::from_info(ip, info);
        if self.devices.upsert(device.clone()) {
            debug!("Device {} at {}", device.name, device.ip);
            self.emit(FtsEvent::DeviceFound(device)).await;
        }
    }

    async fn answer_discovery(self: Arc<Self>, to: SocketAddr) {
        let max = self.config.discovery_reply_delay.as_millis() as u64;
        if max > 0 {
            let delay = rand::rng().random_range(0..=max);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let _ = self.send(to, &FtsMessage::Announce(self.device_info())).await;
    }

    async fn deny(&self, to: SocketAddr, file: String, reason: DenyReason) {
        debug!("Denying {} to {}: {}", file, to, reason);
        if reason == DenyReason::TooLarge {
            self.emit(FtsEvent::Error {
                code: reason.code(),
                message: format!("{file} requested by {to}: {reason}"),
            })
            .await;
        }
        let _ = self.send(to, &FtsMessage::Denied { file, reason }).await;
    }

    async fn handle_chunk_request(
        self: &Arc<Self>,
        from: SocketAddr,
        file: String,
        ack: ChunkAck,
        chunk_size: u32,
    ) {
        match ack {
            ChunkAck::Part(part) => {
                let upload = match self.find_upload(from.ip(), &file) {
                    Some(upload) => upload,
                    None => match self.open_upload(from, &file).await {
                        Some(upload) => upload,
                        None => return,
                    },
                };
                upload.touch(from);

                let chunk_size = self.chunk_size_for(&file, Some(chunk_size.max(1)));
                match upload.chunk(part, chunk_size) {
                    Ok((data, chunk_size, total_chunks)) => {
                        let message = FtsMessage::Chunk {
                            file,
                            part,
                            chunk_size,
                            total_chunks,
                            file_size: upload.file_size(),
                            data,
                        };
                        if let Err(e) = self.send(from, &message).await {
                            debug!("Sending chunk {} to {} failed: {}", part, from, e);
                        }
                    }
                    Err(e) => debug!("Ignoring chunk request from {}: {}", from, e),
                }
            }
            ChunkAck::Complete => {
                if let Some(upload) = self.remove_upload(from.ip(), &file) {
                    upload.advance(TransferStatus::Finished);
                    info!("Upload of {} to {} complete", file, from);
                    self.emit(FtsEvent::UploadComplete(upload)).await;
                }
            }
            ChunkAck::NeedsConfirmation => {
                if let Some(upload) = self.find_upload(from.ip(), &file) {
                    upload.touch(from);
                    self.emit(FtsEvent::UploadAwaitingConfirmation(upload)).await;
                }
            }
            ChunkAck::Rejected => {
                if let Some(upload) = self.remove_upload(from.ip(), &file) {
                    upload.advance(TransferStatus::Failed);
                    self.emit(FtsEvent::UploadRejected(upload)).await;
                }
            }
        }
    }

    /// Create the upload for a first chunk request, or answer with F2.
    async fn open_upload(self: &Arc<Self>, from: SocketAddr, file: &str) -> Option<Arc<FileUpload>> {
        let offered = self.offered.lock().contains(file);
        if !self.config.is_server && !offered {
            self.deny(from, file.to_string(), DenyReason::NotAServer).await;
            return None;
        }

        let resource = match self.load_resource(file).await {
            Ok(resource) => resource,
            Err(e) => {
                let reason = match e.code() {
                    2 => DenyReason::TooLarge,
                    _ => DenyReason::NotFound,
                };
                self.deny(from, file.to_string(), reason).await;
                return None;
            }
        };

        let (upload, created) = {
            let mut uploads = self.uploads.lock();
            match uploads.iter().find(|u| u.matches(from.ip(), file)) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let upload = Arc::new(FileUpload::new(from, file, resource, offered));
                    uploads.push(Arc::clone(&upload));
                    (upload, true)
                }
            }
        };
        if created {
            info!("Uploading {} to {}", file, from);
            self.emit(FtsEvent::UploadStarted(Arc::clone(&upload))).await;
        }
        Some(upload)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chunk(
        self: &Arc<Self>,
        from: SocketAddr,
        file: &str,
        part: u32,
        chunk_size: u32,
        total_chunks: u32,
        file_size: u64,
        data: &[u8],
    ) {
        let Some(request) = self.find_request(from.ip(), file) else {
            debug!("Unsolicited chunk {} of {} from {}", part, file, from);
            return;
        };
        let was_started = request.status() == TransferStatus::Started;

        let outcome = request.accept_chunk(
            part,
            chunk_size,
            total_chunks,
            file_size,
            data,
            self.config.memory_limit,
            self.config.max_file_size,
        );
        match outcome {
            ChunkOutcome::Stored { next } => {
                if !was_started {
                    self.emit(FtsEvent::DownloadStarted(Arc::clone(&request))).await;
                }
                self.emit(FtsEvent::DownloadProgress {
                    request: Arc::clone(&request),
                    chunks_received: request.chunks_received(),
                    total_chunks,
                })
                .await;
                match next {
                    Some(next) => self.send_chunk_request(&request, next).await,
                    None => self.finish_download(request).await,
                }
            }
            ChunkOutcome::Duplicate => debug!("Duplicate chunk {} of {}", part, file),
            ChunkOutcome::Rejected(reason) => {
                warn!("Dropping chunk {} of {} from {}: {}", part, file, from, reason)
            }
            ChunkOutcome::TooLarge { file_size } => {
                self.refuse_oversized(from, file, file_size).await
            }
        }
    }

    /// Drop a download whose announced size exceeds `max_file_size` and
    /// tell the sender to release its upload.
    async fn refuse_oversized(self: &Arc<Self>, from: SocketAddr, file: &str, file_size: u64) {
        let Some(request) = self.remove_request(from.ip(), file) else {
            return;
        };
        let reason = DenyReason::TooLarge;
        let message = format!(
            "{file} from {from} is {file_size} bytes, limit {}",
            self.config.max_file_size
        );
        warn!("{}", message);
        request.fail(reason.to_string());

        let reject = FtsMessage::ChunkRequest {
            file: file.to_string(),
            ack: ChunkAck::Rejected,
            chunk_size: request.chunk_size(),
        };
        let _ = self.send(from, &reject).await;

        self.emit(FtsEvent::Error {
            code: reason.code(),
            message,
        })
        .await;
        self.emit(FtsEvent::DownloadFailed {
            request,
            reason: reason.to_string(),
        })
        .await;
    }

    async fn finish_download(self: &Arc<Self>, request: Arc<FileRequest>) {
        request.stop_retry_timer();
        let Some(storage) = request.begin_save() else {
            return;
        };

        let done = FtsMessage::ChunkRequest {
            file: request.source_name().to_string(),
            ack: ChunkAck::Complete,
            chunk_size: request.chunk_size(),
        };
        let _ = self.send(request.remote_addr(), &done).await;

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let path = request.save_path().to_path_buf();
            let persisted = tokio::task::spawn_blocking(move || storage.persist(&path)).await;
            inner.requests.lock().retain(|r| !Arc::ptr_eq(r, &request));

            let failure = match persisted {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            match failure {
                None => {
                    request.advance(TransferStatus::Finished);
                    info!(
                        "Saved {} ({} bytes) to {}",
                        request.source_name(),
                        request.file_size(),
                        request.save_path().display()
                    );
                    inner.emit(FtsEvent::DownloadComplete(request)).await;
                }
                Some(reason) => {
                    warn!("Saving {} failed: {}", request.source_name(), reason);
                    request.fail(reason.clone());
                    inner.emit(FtsEvent::DownloadFailed { request, reason }).await;
                }
            }
        });
    }

    async fn handle_push_offer(self: &Arc<Self>, from: SocketAddr, file: String) {
        if self.checked_key(&file).is_err() {
            debug!("Ignoring push of invalid name {:?} from {}", file, from);
            return;
        }
        self.emit(FtsEvent::PushOffered {
            from,
            file: file.clone(),
        })
        .await;

        if self.config.auto_accept_push {
            if let Err(e) = self.request_file(from, &file, None).await {
                warn!("Accepting push of {} from {} failed: {}", file, from, e);
            }
            return;
        }

        {
            let mut pending = self.pending_pushes.lock();
            if !pending.iter().any(|(a, f)| a.ip() == from.ip() && *f == file) {
                pending.push((from, file.clone()));
            }
        }
        let confirm = FtsMessage::ChunkRequest {
            file,
            ack: ChunkAck::NeedsConfirmation,
            chunk_size: 0,
        };
        let _ = self.send(from, &confirm).await;
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let expired: Vec<Arc<FileUpload>> = {
                let mut uploads = self.uploads.lock();
                let (stale, live): (Vec<_>, Vec<_>) = uploads
                    .drain(..)
                    .partition(|u| u.idle_for() > self.config.upload_timeout);
                *uploads = live;
                stale
            };
            for upload in expired {
                upload.advance(TransferStatus::Failed);
                info!("Upload of {} to {} timed out", upload.file_name(), upload.remote_addr());
                self.emit(FtsEvent::UploadTimeout(upload)).await;
            }

            let evicted = self.resources.evict_expired();
            if evicted > 0 {
                debug!("Evicted {} idle resources", evicted);
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let query = FtsMessage::Discover(self.device_info()).encode();
            if let Err(e) = self.udp.broadcast(&query, self.config.port).await {
                debug!("Discovery broadcast failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;

    struct Node {
        service: FileTransferService,
        events: mpsc::Receiver<FtsEvent>,
        _share: TempDir,
        downloads: TempDir,
    }

    async fn node(name: &str, is_server: bool, tweak: impl FnOnce(&mut FtsConfig)) -> Node {
        let share = tempdir().unwrap();
        let downloads = tempdir().unwrap();
        let mut config = FtsConfig {
            port: 0,
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            device_name: name.to_string(),
            is_server,
            share_dir: share.path().to_path_buf(),
            download_dir: downloads.path().to_path_buf(),
            discovery_interval: None,
            discovery_reply_delay: Duration::from_millis(20),
            retry_interval: Duration::from_millis(200),
            ..Default::default()
        };
        tweak(&mut config);
        let (service, events) = FileTransferService::start(config).await.unwrap();
        Node {
            service,
            events,
            _share: share,
            downloads,
        }
    }

    fn share(node: &Node, name: &str, data: &[u8]) {
        std::fs::write(node.service.config().share_dir.join(name), data).unwrap();
    }

    async fn wait_for<T>(
        rx: &mut mpsc::Receiver<FtsEvent>,
        mut pick: impl FnMut(FtsEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("FTS channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("Timeout waiting for FTS event")
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_download_in_three_chunks() {
        let mut server = node("wall", true, |_| {}).await;
        let mut client = node("kiosk", false, |c| c.chunk_size = Some(65_000)).await;
        let data = sample(150_000);
        share(&server, "sample.bin", &data);

        let request = client
            .service
            .request_file(server.service.local_addr(), "sample.bin", None)
            .await
            .unwrap();

        let done = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::DownloadComplete(r) => Some(r),
            FtsEvent::DownloadFailed { reason, .. } => panic!("Download failed: {reason}"),
            _ => None,
        })
        .await;
        assert!(Arc::ptr_eq(&done, &request));
        assert_eq!(request.status(), TransferStatus::Finished);
        assert_eq!(request.total_chunks(), 3);
        assert_eq!(request.file_size(), 150_000);
        assert_eq!(request.progress(), 1.0);

        let saved = std::fs::read(client.downloads.path().join("sample.bin")).unwrap();
        assert_eq!(saved, data);
        assert!(client.service.requests().is_empty());

        let upload = wait_for(&mut server.events, |ev| match ev {
            FtsEvent::UploadComplete(u) => Some(u),
            _ => None,
        })
        .await;
        assert_eq!(upload.file_name(), "sample.bin");
        assert_eq!(upload.status(), TransferStatus::Finished);

        client.service.dispose().await;
        server.service.dispose().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_emit_one_timeout() {
        let mut client = node("kiosk", false, |c| {
            c.retry_interval = Duration::from_millis(20);
            c.max_retries = 10;
        })
        .await;

        // Bound but silent peer.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = silent.local_addr().unwrap();

        let request = client
            .service
            .request_file(target, "nothing.bin", None)
            .await
            .unwrap();
        let again = client
            .service
            .request_file(target, "nothing.bin", None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&request, &again));

        let timed_out = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::FileTimeout(r) => Some(r),
            _ => None,
        })
        .await;
        assert!(Arc::ptr_eq(&timed_out, &request));
        assert_eq!(request.status(), TransferStatus::Failed);
        assert_eq!(request.retry_count(), 10);

        let extra = timeout(Duration::from_millis(300), async {
            loop {
                if let Some(FtsEvent::FileTimeout(_)) = client.events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(extra.is_err(), "Timeout must be reported once");
        assert!(client.service.requests().is_empty());

        client.service.dispose().await;
    }

    #[tokio::test]
    async fn test_denials() {
        let mut server = node("wall", true, |c| c.max_file_size = 1000).await;
        let mut client = node("kiosk", false, |_| {}).await;
        share(&server, "big.bin", &sample(3000));
        let server_addr = server.service.local_addr();

        client
            .service
            .request_file(server_addr, "missing.bin", None)
            .await
            .unwrap();
        let (request, reason) = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::FileDenied { request, reason } => Some((request, reason)),
            _ => None,
        })
        .await;
        assert_eq!(reason, DenyReason::NotFound);
        assert_eq!(request.status(), TransferStatus::Failed);

        client
            .service
            .request_file(server_addr, "big.bin", None)
            .await
            .unwrap();
        let reason = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::FileDenied { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
        assert_eq!(reason, DenyReason::TooLarge);
        let code = wait_for(&mut server.events, |ev| match ev {
            FtsEvent::Error { code, .. } => Some(code),
            _ => None,
        })
        .await;
        assert_eq!(code, 2);

        // The client does not serve files.
        let mut other = node("desk", false, |_| {}).await;
        other
            .service
            .request_file(client.service.local_addr(), "any.bin", None)
            .await
            .unwrap();
        let reason = wait_for(&mut other.events, |ev| match ev {
            FtsEvent::FileDenied { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
        assert_eq!(reason, DenyReason::NotAServer);

        other.service.dispose().await;
        client.service.dispose().await;
        server.service.dispose().await;
    }

    #[tokio::test]
    async fn test_client_refuses_file_above_its_limit() {
        let mut server = node("wall", true, |_| {}).await;
        let mut client = node("kiosk", false, |c| c.max_file_size = 1000).await;
        share(&server, "big.bin", &sample(3000));

        let request = client
            .service
            .request_file(server.service.local_addr(), "big.bin", None)
            .await
            .unwrap();

        let code = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::Error { code, .. } => Some(code),
            FtsEvent::DownloadStarted(_) => panic!("Oversized download must not start"),
            _ => None,
        })
        .await;
        assert_eq!(code, 2);
        let failed = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::DownloadFailed { request, .. } => Some(request),
            _ => None,
        })
        .await;
        assert!(Arc::ptr_eq(&failed, &request));
        assert_eq!(request.status(), TransferStatus::Failed);
        assert!(client.service.requests().is_empty());
        assert!(!client.downloads.path().join("big.bin").exists());

        // The sender drops its upload on the rejection.
        let rejected = wait_for(&mut server.events, |ev| match ev {
            FtsEvent::UploadRejected(u) => Some(u),
            _ => None,
        })
        .await;
        assert_eq!(rejected.file_name(), "big.bin");

        client.service.dispose().await;
        server.service.dispose().await;
    }

    #[tokio::test]
    async fn test_discovery_round_trip() {
        let mut server = node("wall", true, |_| {}).await;
        let mut client = node("kiosk", false, |_| {}).await;

        client
            .service
            .poll_device(server.service.local_addr())
            .await
            .unwrap();

        let seen_by_server = wait_for(&mut server.events, |ev| match ev {
            FtsEvent::DeviceFound(d) => Some(d),
            _ => None,
        })
        .await;
        assert_eq!(seen_by_server.name, "kiosk");
        assert!(!seen_by_server.is_server);

        let seen_by_client = wait_for(&mut client.events, |ev| match ev {
            FtsEvent::DeviceFound(d) => Some(d),
            _ => None,
        })
        .await;
        assert_eq!(seen_by_client.name, "wall");
        assert!(seen_by_client.is_server);
        assert_eq!(seen_by_client.protocol_version, PROTOCOL_VERSION);
        assert_eq!(client.service.devices().len(), 1);

        client.service.dispose().await;
        server.service.dispose().await;
    }

    #[tokio::test]
    async fn test_push_accepted_automatically() {
        let mut sender = node("desk", false, |_| {}).await;
        let mut receiver = node("wall", false, |c| c.auto_accept_push = true).await;
        let data = sample(5000);
        share(&sender, "slides.pdf", &data);

        let upload = sender
            .service
            .push_file(receiver.service.local_addr(), "slides.pdf")
            .await
            .unwrap();
        assert!(upload.is_push());

        let (from, file) = wait_for(&mut receiver.events, |ev| match ev {
            FtsEvent::PushOffered { from, file } => Some((from, file)),
            _ => None,
        })
        .await;
        assert_eq!(from, sender.service.local_addr());
        assert_eq!(file, "slides.pdf");

        wait_for(&mut receiver.events, |ev| match ev {
            FtsEvent::DownloadComplete(_) => Some(()),
            _ => None,
        })
        .await;
        let saved = std::fs::read(receiver.downloads.path().join("slides.pdf")).unwrap();
        assert_eq!(saved, data);

        wait_for(&mut sender.events, |ev| match ev {
            FtsEvent::UploadComplete(u) => Some(u),
            _ => None,
        })
        .await;

        receiver.service.dispose().await;
        sender.service.dispose().await;
    }

    #[tokio::test]
    async fn test_push_held_for_confirmation() {
        let mut sender = node("desk", false, |_| {}).await;
        let mut receiver = node("wall", false, |c| c.auto_accept_push = false).await;
        share(&sender, "notes.txt", b"remember the milk");

        sender
            .service
            .push_file(receiver.service.local_addr(), "notes.txt")
            .await
            .unwrap();

        wait_for(&mut sender.events, |ev| match ev {
            FtsEvent::UploadAwaitingConfirmation(u) => Some(u),
            _ => None,
        })
        .await;

        let from = sender.service.local_addr().ip();
        receiver.service.accept_push(from, "notes.txt").await.unwrap();
        wait_for(&mut receiver.events, |ev| match ev {
            FtsEvent::DownloadComplete(_) => Some(()),
            _ => None,
        })
        .await;
        assert!(matches!(
            receiver.service.accept_push(from, "notes.txt").await,
            Err(FtsError::Denied(DenyReason::NotFound))
        ));

        receiver.service.dispose().await;
        sender.service.dispose().await;
    }

    #[tokio::test]
    async fn test_invalid_name_and_disposed() {
        let client = node("kiosk", false, |_| {}).await;
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            client.service.request_file(target, "a;b", None).await,
            Err(FtsError::InvalidFileName(_))
        ));
        assert!(matches!(
            client.service.request_file(target, "../etc/passwd", None).await,
            Err(FtsError::InvalidFileName(_))
        ));

        client.service.dispose().await;
        client.service.dispose().await;
        assert!(matches!(
            client.service.request_file(target, "ok.bin", None).await,
            Err(FtsError::Disposed)
        ));
    }
}
