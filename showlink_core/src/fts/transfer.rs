//! Per-transfer state for downloads and uploads.

use crate::fts::bitmap::ChunkBitmap;
use crate::fts::resource::{FileResource, total_chunks};
use crate::fts::storage::{self, ChunkStorage};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Inactive,
    Requested,
    Started,
    Saving,
    Finished,
    Failed,
}

impl TransferStatus {
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Inactive => 0,
            TransferStatus::Requested => 1,
            TransferStatus::Started => 2,
            TransferStatus::Saving => 3,
            TransferStatus::Finished => 4,
            TransferStatus::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Finished | TransferStatus::Failed)
    }

    /// Forward-only progression; `Failed` is reachable from any non-terminal state.
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == TransferStatus::Failed || next.rank() > self.rank()
    }
}

/// What a received chunk did to a download.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// Stored; `next` is the earliest missing chunk, `None` once complete.
    Stored { next: Option<u32> },
    Duplicate,
    Rejected(String),
    /// The announced file size is above the local limit; nothing was allocated.
    TooLarge { file_size: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Resend(u32),
    /// Finished or saving; the timer is no longer needed.
    Stop,
    /// This fire used up the last retry and failed the request.
    TimedOut,
}

struct RequestState {
    status: TransferStatus,
    chunk_size: u32,
    total_chunks: u32,
    file_size: u64,
    bitmap: Option<ChunkBitmap>,
    storage: Option<Box<dyn ChunkStorage>>,
    retry_count: u32,
    bytes_received: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    retry_timer: Option<CancellationToken>,
    failure: Option<String>,
}

/// A download of one file from one remote. Shared by `Arc`.
pub struct FileRequest {
    remote: SocketAddr,
    source_name: String,
    save_path: PathBuf,
    created: Instant,
    state: Mutex<RequestState>,
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("remote", &self.remote)
            .field("source_name", &self.source_name)
            .field("status", &self.status())
            .finish()
    }
}

impl FileRequest {
    pub(crate) fn new(
        remote: SocketAddr,
        source_name: &str,
        save_path: PathBuf,
        chunk_size: u32,
    ) -> Self {
        Self {
            remote,
            source_name: source_name.to_string(),
            save_path,
            created: Instant::now(),
            state: Mutex::new(RequestState {
                status: TransferStatus::Inactive,
                chunk_size,
                total_chunks: 0,
                file_size: 0,
                bitmap: None,
                storage: None,
                retry_count: 0,
                bytes_received: 0,
                started_at: None,
                finished_at: None,
                retry_timer: None,
                failure: None,
            }),
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote.ip()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.state.lock().chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.state.lock().total_chunks
    }

    pub fn chunks_received(&self) -> u32 {
        self.state
            .lock()
            .bitmap
            .as_ref()
            .map(ChunkBitmap::count)
            .unwrap_or(0)
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().retry_count
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub fn progress(&self) -> f32 {
        let state = self.state.lock();
        match &state.bitmap {
            Some(bitmap) if !bitmap.is_empty() => bitmap.count() as f32 / bitmap.len() as f32,
            _ => 0.0,
        }
    }

    /// Time since the request was created, frozen once it finished.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock();
        match state.finished_at {
            Some(done) => done.duration_since(self.created),
            None => self.created.elapsed(),
        }
    }

    /// Bytes per second since the first chunk arrived.
    pub fn transfer_rate(&self) -> f64 {
        let state = self.state.lock();
        let Some(started) = state.started_at else {
            return 0.0;
        };
        let end = state.finished_at.unwrap_or_else(Instant::now);
        let secs = end.duration_since(started).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        state.bytes_received as f64 / secs
    }

    pub fn same_as(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, other)
    }

    pub(crate) fn matches(&self, remote: IpAddr, source_name: &str) -> bool {
        self.remote.ip() == remote && self.source_name == source_name
    }

    pub(crate) fn advance(&self, next: TransferStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.can_advance_to(next) {
            state.status = next;
            if next.is_terminal() {
                state.finished_at = Some(Instant::now());
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn set_retry_timer(&self, token: CancellationToken) {
        if let Some(old) = self.state.lock().retry_timer.replace(token) {
            old.cancel();
        }
    }

    pub(crate) fn stop_retry_timer(&self) {
        if let Some(token) = self.state.lock().retry_timer.take() {
            token.cancel();
        }
    }

    /// One retry timer fire. Gives up after `max_retries` fires without
    /// progress and marks the request failed.
    pub(crate) fn retry_tick(&self, max_retries: u32) -> RetryDecision {
        let mut state = self.state.lock();
        if state.status.is_terminal() || state.status == TransferStatus::Saving {
            return RetryDecision::Stop;
        }
        state.retry_count += 1;
        if state.retry_count >= max_retries {
            state.status = TransferStatus::Failed;
            state.finished_at = Some(Instant::now());
            state.failure = Some(format!("no response after {} retries", state.retry_count));
            state.storage = None;
            return RetryDecision::TimedOut;
        }
        let part = state
            .bitmap
            .as_ref()
            .and_then(ChunkBitmap::missing_chunk)
            .unwrap_or(0);
        RetryDecision::Resend(part)
    }

    /// Store one F4 payload. The first chunk fixes the geometry and
    /// allocates the backing storage.
    pub(crate) fn accept_chunk(
        &self,
        part: u32,
        chunk_size: u32,
        total: u32,
        file_size: u64,
        data: &[u8],
        memory_limit: u64,
        max_file_size: u64,
    ) -> ChunkOutcome {
        let mut state = self.state.lock();
        if state.status.is_terminal() || state.status == TransferStatus::Saving {
            return ChunkOutcome::Duplicate;
        }

        if state.storage.is_none() {
            if chunk_size == 0 || total != total_chunks(file_size, chunk_size) {
                return ChunkOutcome::Rejected(format!(
                    "inconsistent geometry: {total} chunks of {chunk_size} for {file_size} bytes"
                ));
            }
            if file_size > max_file_size {
                return ChunkOutcome::TooLarge { file_size };
            }
            match storage::allocate(file_size, memory_limit, &self.save_path) {
                Ok(storage) => state.storage = Some(storage),
                Err(e) => return ChunkOutcome::Rejected(format!("allocation failed: {e}")),
            }
            state.chunk_size = chunk_size;
            state.total_chunks = total;
            state.file_size = file_size;
            state.bitmap = Some(ChunkBitmap::new(total));
            state.started_at = Some(Instant::now());
            state.status = TransferStatus::Started;
        } else if chunk_size != state.chunk_size || total != state.total_chunks {
            return ChunkOutcome::Rejected("chunk geometry changed mid-transfer".into());
        }

        if part >= state.total_chunks {
            return ChunkOutcome::Rejected(format!("chunk {part} out of range"));
        }
        if state.bitmap.as_ref().is_some_and(|b| b.is_set(part)) {
            return ChunkOutcome::Duplicate;
        }

        let offset = part as u64 * state.chunk_size as u64;
        let expected = (state.file_size - offset).min(state.chunk_size as u64) as usize;
        if data.len() != expected {
            return ChunkOutcome::Rejected(format!(
                "chunk {part} has {} bytes, expected {expected}",
                data.len()
            ));
        }

        let written = match state.storage.as_mut() {
            Some(storage) => storage.write_at(offset, data),
            None => return ChunkOutcome::Rejected("storage released".into()),
        };
        if let Err(e) = written {
            return ChunkOutcome::Rejected(format!("write failed: {e}"));
        }

        state.retry_count = 0;
        state.bytes_received += data.len() as u64;
        let next = match state.bitmap.as_mut() {
            Some(bitmap) => {
                bitmap.set(part);
                bitmap.missing_chunk()
            }
            None => None,
        };
        ChunkOutcome::Stored { next }
    }

    /// Move to `Saving` and hand out the completed storage.
    pub(crate) fn begin_save(&self) -> Option<Box<dyn ChunkStorage>> {
        let mut state = self.state.lock();
        if !state.status.can_advance_to(TransferStatus::Saving) {
            return None;
        }
        state.status = TransferStatus::Saving;
        state.storage.take()
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = TransferStatus::Failed;
        state.finished_at = Some(Instant::now());
        state.failure = Some(reason.into());
        state.storage = None;
        if let Some(token) = state.retry_timer.take() {
            token.cancel();
        }
        true
    }
}

struct UploadState {
    remote: SocketAddr,
    status: TransferStatus,
    chunk_size: u32,
    chunks_sent: u32,
    last_activity: Instant,
}

/// An upload of one cached resource to one remote.
pub struct FileUpload {
    remote: IpAddr,
    file_name: String,
    resource: Arc<FileResource>,
    pushed: bool,
    state: Mutex<UploadState>,
}

impl std::fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUpload")
            .field("remote", &self.remote)
            .field("file_name", &self.file_name)
            .field("status", &self.status())
            .finish()
    }
}

impl FileUpload {
    pub(crate) fn new(
        remote: SocketAddr,
        file_name: &str,
        resource: Arc<FileResource>,
        pushed: bool,
    ) -> Self {
        Self {
            remote: remote.ip(),
            file_name: file_name.to_string(),
            resource,
            pushed,
            state: Mutex::new(UploadState {
                remote,
                status: if pushed {
                    TransferStatus::Requested
                } else {
                    TransferStatus::Inactive
                },
                chunk_size: 0,
                chunks_sent: 0,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where chunks are sent; follows the port of the latest request.
    pub fn remote_addr(&self) -> SocketAddr {
        self.state.lock().remote
    }

    pub fn file_size(&self) -> u64 {
        self.resource.len()
    }

    /// Offered by `push_file` rather than requested by the remote.
    pub fn is_push(&self) -> bool {
        self.pushed
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    pub fn chunks_sent(&self) -> u32 {
        self.state.lock().chunks_sent
    }

    pub fn total_chunks(&self) -> u32 {
        let chunk_size = self.state.lock().chunk_size;
        if chunk_size == 0 {
            0
        } else {
            self.resource.total_chunks(chunk_size)
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub(crate) fn matches(&self, remote: IpAddr, file_name: &str) -> bool {
        self.remote == remote && self.file_name == file_name
    }

    /// Read chunk `part` for an F4 reply. The first request fixes the chunk size.
    /// Returns the payload and the transfer geometry.
    pub(crate) fn chunk(&self, part: u32, chunk_size: u32) -> std::io::Result<(Bytes, u32, u32)> {
        let chunk_size = {
            let mut state = self.state.lock();
            if state.chunk_size == 0 {
                state.chunk_size = chunk_size.max(1);
            }
            state.last_activity = Instant::now();
            state.chunk_size
        };
        let data = self.resource.read_chunk(part, chunk_size)?;

        let mut state = self.state.lock();
        state.chunks_sent += 1;
        if state.status.can_advance_to(TransferStatus::Started) {
            state.status = TransferStatus::Started;
        }
        Ok((data, chunk_size, self.resource.total_chunks(chunk_size)))
    }

    pub(crate) fn touch(&self, from: SocketAddr) {
        let mut state = self.state.lock();
        state.remote = from;
        state.last_activity = Instant::now();
    }

    pub(crate) fn advance(&self, next: TransferStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.can_advance_to(next) {
            state.status = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    const REMOTE: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 7744);

    #[test]
    fn test_status_progression() {
        use TransferStatus::*;
        assert!(Inactive.can_advance_to(Requested));
        assert!(Requested.can_advance_to(Started));
        assert!(!Started.can_advance_to(Requested));
        assert!(Saving.can_advance_to(Failed));
        assert!(!Finished.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Finished));
    }

    #[test]
    fn test_oversized_first_chunk_allocates_nothing() {
        let dir = tempdir().unwrap();
        let save = dir.path().join("huge.bin");
        let request = FileRequest::new(REMOTE, "huge.bin", save.clone(), 100);

        // Geometry claims 10 GB; the limit is 1000 bytes.
        let file_size = 10_000_000_000u64;
        let total = total_chunks(file_size, 100);
        assert_eq!(
            request.accept_chunk(0, 100, total, file_size, &[0u8; 100], 500, 1000),
            ChunkOutcome::TooLarge { file_size }
        );
        assert_eq!(request.total_chunks(), 0);
        assert!(!save.exists());
        assert!(!storage::spill_path(&save).exists());

        assert!(matches!(
            request.accept_chunk(0, 100, 3, 250, &[0u8; 100], 500, 1000),
            ChunkOutcome::Stored { next: Some(1) }
        ));
    }

    #[test]
    fn test_out_of_order_and_duplicate_chunks() {
        let dir = tempdir().unwrap();
        let source: Vec<u8> = (0..250u32).map(|i| (i * 7 % 256) as u8).collect();
        let request = FileRequest::new(REMOTE, "clip.bin", dir.path().join("clip.bin"), 100);

        let chunk = |part: usize| -> Vec<u8> {
            let start = part * 100;
            source[start..(start + 100).min(source.len())].to_vec()
        };

        assert_eq!(
            request.accept_chunk(2, 100, 3, 250, &chunk(2), u64::MAX, u64::MAX),
            ChunkOutcome::Stored { next: Some(0) }
        );
        assert_eq!(
            request.accept_chunk(2, 100, 3, 250, &chunk(2), u64::MAX, u64::MAX),
            ChunkOutcome::Duplicate
        );
        assert_eq!(
            request.accept_chunk(0, 100, 3, 250, &chunk(0), u64::MAX, u64::MAX),
            ChunkOutcome::Stored { next: Some(1) }
        );
        assert!(matches!(
            request.accept_chunk(1, 100, 3, 250, &chunk(1)[..50], u64::MAX, u64::MAX),
            ChunkOutcome::Rejected(_)
        ));
        assert_eq!(
            request.accept_chunk(1, 100, 3, 250, &chunk(1), u64::MAX, u64::MAX),
            ChunkOutcome::Stored { next: None }
        );

        let storage = request.begin_save().unwrap();
        assert_eq!(request.status(), TransferStatus::Saving);
        storage.persist(request.save_path()).unwrap();
        assert_eq!(std::fs::read(request.save_path()).unwrap(), source);
    }

    #[test]
    fn test_retry_gives_up_after_limit() {
        let dir = tempdir().unwrap();
        let request = FileRequest::new(REMOTE, "x.bin", dir.path().join("x.bin"), 100);
        for _ in 0..9 {
            assert_eq!(request.retry_tick(10), RetryDecision::Resend(0));
        }
        assert_eq!(request.retry_tick(10), RetryDecision::TimedOut);
        assert_eq!(request.status(), TransferStatus::Failed);
        assert_eq!(request.retry_tick(10), RetryDecision::Stop);
        assert!(!request.fail("again"));
    }
}
