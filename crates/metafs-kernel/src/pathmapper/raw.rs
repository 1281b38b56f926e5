//! Open backing files for raw access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{VfsError, VfsResult};
use crate::types::{RawHandle, RawMode};

/// A backing file opened through `raw_open`.
#[derive(Debug)]
pub struct RawFile {
    file: tokio::sync::Mutex<fs::File>,
    /// Virtual path the file was opened under.
    path: String,
    writable: bool,
}

impl RawFile {
    /// Open `real_path` with the access described by `mode`.
    pub async fn open(real_path: &Path, virtual_path: &str, mode: RawMode) -> VfsResult<Self> {
        let mut options = fs::OpenOptions::new();
        options.read(mode.read);
        // append without write ("ra") opens read-only
        if mode.write && mode.append {
            options.append(true);
        } else if mode.write {
            options.write(true);
            // "w" replaces the content
            if !mode.read {
                options.truncate(true);
            }
        }
        let file = options.open(real_path).await.map_err(VfsError::from)?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            path: virtual_path.to_string(),
            writable: mode.write,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Read up to `size` bytes at `offset`. Short at end of file.
    pub async fn read_at(&self, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(VfsError::from)?;

        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await.map_err(VfsError::from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        if !self.writable {
            return Err(VfsError::permission_denied(&self.path));
        }
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(VfsError::from)?;
        file.write_all(data).await.map_err(VfsError::from)?;
        Ok(data.len())
    }

    pub async fn set_len(&self, len: u64) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::permission_denied(&self.path));
        }
        let file = self.file.lock().await;
        file.set_len(len).await.map_err(VfsError::from)
    }

    /// Flush to stable storage; `datasync` skips metadata.
    pub async fn sync(&self, datasync: bool) -> VfsResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await.map_err(VfsError::from)?;
        if datasync {
            file.sync_data().await.map_err(VfsError::from)
        } else {
            file.sync_all().await.map_err(VfsError::from)
        }
    }
}

/// Table of open raw files keyed by handle.
#[derive(Debug)]
pub struct RawFiles {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Arc<RawFile>>>,
}

impl Default for RawFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl RawFiles {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: RawFile) -> RawHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, Arc::new(file));
        RawHandle(id)
    }

    pub fn get(&self, handle: RawHandle) -> VfsResult<Arc<RawFile>> {
        self.open
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| VfsError::invalid_argument(format!("unknown raw handle {}", handle.0)))
    }

    pub fn remove(&self, handle: RawHandle) -> Option<Arc<RawFile>> {
        self.open.lock().remove(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
