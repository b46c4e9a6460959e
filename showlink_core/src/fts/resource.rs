//! Server-side cache of shared files.

use crate::fts::storage::MappedFile;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_RESOURCE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Invalid resource path {0:?}")]
    InvalidPath(String),

    #[error("Resource {0} not found")]
    NotFound(String),

    #[error("Resource {name} is {size} bytes, limit is {limit}")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
enum ResourceData {
    Memory(Bytes),
    Mapped(MappedFile),
}

/// One cached file. Shared by `Arc` with the uploads reading it.
#[derive(Debug)]
pub struct FileResource {
    key: String,
    path: PathBuf,
    data: ResourceData,
    last_access: Mutex<Instant>,
}

impl FileResource {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        match &self.data {
            ResourceData::Memory(bytes) => bytes.len() as u64,
            ResourceData::Mapped(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.data, ResourceData::Mapped(_))
    }

    pub fn total_chunks(&self, chunk_size: u32) -> u32 {
        total_chunks(self.len(), chunk_size)
    }

    /// Bytes of chunk `part`. Resets the idle timer.
    pub fn read_chunk(&self, part: u32, chunk_size: u32) -> io::Result<Bytes> {
        self.touch();
        let offset = part as u64 * chunk_size as u64;
        if offset >= self.len() && !(offset == 0 && self.is_empty()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk {} out of range for {}", part, self.key),
            ));
        }
        match &self.data {
            ResourceData::Memory(bytes) => {
                let start = offset as usize;
                let end = (start + chunk_size as usize).min(bytes.len());
                Ok(bytes.slice(start..end))
            }
            ResourceData::Mapped(map) => map.read_at(offset, chunk_size as usize),
        }
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }
}

/// `ceil(size / chunk_size)`, at least one chunk so empty files still
/// produce a single (empty) payload.
pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    size.div_ceil(chunk_size).max(1) as u32
}

/// Normalize a requested name into a cache key relative to the share root.
/// Traversal outside the root is rejected.
pub fn normalize_key(name: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.contains(':') => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub struct ResourceCache {
    root: PathBuf,
    ttl: Duration,
    memory_limit: u64,
    max_file_size: u64,
    entries: Mutex<HashMap<String, Arc<FileResource>>>,
}

impl ResourceCache {
    pub fn new(root: PathBuf, ttl: Duration, memory_limit: u64, max_file_size: u64) -> Self {
        Self {
            root,
            ttl,
            memory_limit,
            max_file_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached resource for `name`, loading it on first use. Blocking.
    pub fn get_or_load(&self, name: &str) -> Result<Arc<FileResource>, ResourceError> {
        let key = normalize_key(name).ok_or_else(|| ResourceError::InvalidPath(name.to_string()))?;
        if let Some(resource) = self.entries.lock().get(&key) {
            resource.touch();
            return Ok(Arc::clone(resource));
        }

        let resource = Arc::new(self.load(&key)?);
        let mut entries = self.entries.lock();
        // Another task may have loaded it meanwhile.
        let entry = entries.entry(key).or_insert(resource);
        entry.touch();
        Ok(Arc::clone(entry))
    }

    fn load(&self, key: &str) -> Result<FileResource, ResourceError> {
        let path = self.root.join(key);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(ResourceError::NotFound(key.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResourceError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let size = meta.len();
        if size > self.max_file_size {
            return Err(ResourceError::TooLarge {
                name: key.to_string(),
                size,
                limit: self.max_file_size,
            });
        }

        let data = if size > self.memory_limit {
            ResourceData::Mapped(MappedFile::open(&path)?)
        } else {
            ResourceData::Memory(Bytes::from(std::fs::read(&path)?))
        };
        debug!("Loaded resource {} ({} bytes)", key, size);
        Ok(FileResource {
            key: key.to_string(),
            path,
            data,
            last_access: Mutex::new(Instant::now()),
        })
    }

    /// Drop entries idle longer than the TTL that no upload still holds.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, resource| {
            let keep = Arc::strong_count(resource) > 1 || resource.idle_for() < self.ttl;
            if !keep {
                debug!("Evicting idle resource {}", key);
            }
            keep
        });
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("videos/intro.mp4").as_deref(), Some("videos/intro.mp4"));
        assert_eq!(normalize_key("\\videos\\.\\intro.mp4").as_deref(), Some("videos/intro.mp4"));
        assert_eq!(normalize_key("../secret"), None);
        assert_eq!(normalize_key("a/../../b"), None);
        assert_eq!(normalize_key("C:/windows"), None);
        assert_eq!(normalize_key("/"), None);
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(150_000, 65_000), 3);
        assert_eq!(total_chunks(130_000, 65_000), 2);
        assert_eq!(total_chunks(0, 65_000), 1);
    }

    #[test]
    fn test_load_read_and_limits() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("small.bin"), vec![7u8; 100]).unwrap();
        std::fs::write(dir.path().join("large.bin"), vec![9u8; 3000]).unwrap();

        let cache = ResourceCache::new(dir.path().to_path_buf(), DEFAULT_RESOURCE_TTL, 1000, 2000);
        let small = cache.get_or_load("small.bin").unwrap();
        assert!(!small.is_mapped());
        assert_eq!(small.total_chunks(40), 3);
        assert_eq!(small.read_chunk(2, 40).unwrap().len(), 20);
        assert!(small.read_chunk(3, 40).is_err());

        let again = cache.get_or_load("./small.bin").unwrap();
        assert!(Arc::ptr_eq(&small, &again));

        assert!(matches!(
            cache.get_or_load("large.bin"),
            Err(ResourceError::TooLarge { size: 3000, .. })
        ));
        assert!(matches!(
            cache.get_or_load("missing.bin"),
            Err(ResourceError::NotFound(_))
        ));

        let mapped = ResourceCache::new(dir.path().to_path_buf(), DEFAULT_RESOURCE_TTL, 1000, 10_000);
        let large = mapped.get_or_load("large.bin").unwrap();
        assert!(large.is_mapped());
        assert_eq!(&large.read_chunk(1, 2000).unwrap()[..], &[9u8; 1000][..]);
    }

    #[test]
    fn test_eviction_skips_held_resources() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"aaaa").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"bbbb").unwrap();

        let cache = ResourceCache::new(dir.path().to_path_buf(), Duration::ZERO, 1000, 1000);
        let held = cache.get_or_load("a.bin").unwrap();
        drop(cache.get_or_load("b.bin").unwrap());

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        drop(held);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
