//! Backing buffers for downloads and cached files.
//!
//! Small files live in memory; anything above the in-memory limit is
//! memory-mapped from a spill file next to its destination.

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of the spill file a mapped download writes into.
pub const SPILL_SUFFIX: &str = ".part";

pub trait ChunkStorage: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of `len` bytes at `offset`, truncated at the end of the storage.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Write the contents to `path`, consuming the storage.
    fn persist(self: Box<Self>, path: &Path) -> io::Result<()>;

    fn is_mapped(&self) -> bool;
}

fn range(len: u64, offset: u64, count: usize) -> io::Result<(usize, usize)> {
    if offset > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} beyond length {len}"),
        ));
    }
    let start = offset as usize;
    let end = (offset.saturating_add(count as u64)).min(len) as usize;
    Ok((start, end))
}

fn check_write(len: u64, offset: u64, count: usize) -> io::Result<usize> {
    let end = offset.saturating_add(count as u64);
    if end > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("write of {count} bytes at {offset} exceeds length {len}"),
        ));
    }
    Ok(offset as usize)
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0; size as usize],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ChunkStorage for MemoryStorage {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let (start, end) = range(self.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = check_write(self.len(), offset, data.len())?;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn persist(self: Box<Self>, path: &Path) -> io::Result<()> {
        std::fs::write(path, &self.data)
    }

    fn is_mapped(&self) -> bool {
        false
    }
}

/// Writable mapping over a spill file, renamed into place on persist.
#[derive(Debug)]
pub struct MappedStorage {
    map: MmapMut,
    spill: PathBuf,
    _file: File,
    persisted: bool,
}

impl MappedStorage {
    pub fn create(spill: PathBuf, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&spill)?;
        file.set_len(size)?;
        // SAFETY: the spill file is created and owned by this storage.
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("Mapped {} bytes at {}", size, spill.display());
        Ok(Self {
            map,
            spill,
            _file: file,
            persisted: false,
        })
    }
}

impl ChunkStorage for MappedStorage {
    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let (start, end) = range(self.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&self.map[start..end]))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = check_write(self.len(), offset, data.len())?;
        self.map[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn persist(self: Box<Self>, path: &Path) -> io::Result<()> {
        let mut this = self;
        this.map.flush()?;
        this.persisted = true;
        let spill = this.spill.clone();
        drop(this);
        if spill.as_path() == path {
            return Ok(());
        }
        match std::fs::rename(&spill, path) {
            Ok(()) => Ok(()),
            // Different filesystems: fall back to a copy.
            Err(_) => {
                std::fs::copy(&spill, path)?;
                std::fs::remove_file(&spill)
            }
        }
    }

    fn is_mapped(&self) -> bool {
        true
    }
}

impl Drop for MappedStorage {
    // An abandoned download leaves no spill file behind.
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.spill);
        }
    }
}

/// Read-only mapping of an existing file, used by the resource cache.
#[derive(Debug)]
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: shared files are treated as immutable while cached.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let (start, end) = range(self.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&self.map[start..end]))
    }
}

/// Spill path used for a mapped download of `destination`.
pub fn spill_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SPILL_SUFFIX);
    destination.with_file_name(name)
}

/// Pick the backing for a download of `size` bytes destined for `destination`.
pub fn allocate(
    size: u64,
    memory_limit: u64,
    destination: &Path,
) -> io::Result<Box<dyn ChunkStorage>> {
    // Empty files cannot be mapped.
    if size <= memory_limit || size == 0 {
        return Ok(Box::new(MemoryStorage::new(size)));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Box::new(MappedStorage::create(spill_path(destination), size)?))
}
