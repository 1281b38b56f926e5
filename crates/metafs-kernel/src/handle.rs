//! Open-file state.
//!
//! A [`FileHandle`] is either raw, holding the token a filesystem returned
//! from `raw_open` and forwarding every call to it, or buffered, holding
//! the whole file content in memory and writing it back on flush.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::RequestContext;
use crate::error::{VfsError, VfsResult};
use crate::ops::VirtualDir;
use crate::types::{OpenFlags, RawHandle};

/// Process-wide handle counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Largest length a buffered file may be truncated or extended to.
pub const MAX_BUFFERED_SIZE: u64 = 1 << 30;

/// Cut or zero-extend `buf` to `len` bytes.
///
/// Growth is capped at [`MAX_BUFFERED_SIZE`] and reserved fallibly, so an
/// oversized request fails with `FileTooLarge` and leaves `buf` untouched.
pub(crate) fn resize_zeroed(buf: &mut Vec<u8>, len: u64, path: &str) -> VfsResult<()> {
    let too_large = || VfsError::file_too_large(format!("{path}: {len} bytes"));
    if len > MAX_BUFFERED_SIZE {
        return Err(too_large());
    }
    let len = usize::try_from(len).map_err(|_| too_large())?;
    if let Some(extra) = len.checked_sub(buf.len()) {
        buf.try_reserve_exact(extra).map_err(|_| too_large())?;
    }
    buf.resize(len, 0);
    Ok(())
}

/// State of one open file.
#[derive(Debug)]
pub struct FileHandle {
    id: u64,
    path: String,
    flags: OpenFlags,
    buffer: Vec<u8>,
    raw: Option<RawHandle>,
    modified: bool,
}

impl FileHandle {
    /// A buffered handle with an empty, clean buffer.
    pub fn new(path: impl Into<String>, flags: OpenFlags) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            flags,
            buffer: Vec::new(),
            raw: None,
            modified: false,
        }
    }

    /// Open `path` on `fs`.
    ///
    /// The filesystem is offered raw access first. If it declines, the
    /// handle is buffered:
    ///
    /// - read-only opens load the whole content;
    /// - write opens require `can_write`;
    /// - a file that was just created starts empty and dirty, so the first
    ///   flush creates it even if nothing is written;
    /// - write-only opens without append start empty, as do truncating
    ///   opens (which are also dirty);
    /// - read-write and append opens load the existing content.
    pub async fn open(
        fs: &dyn VirtualDir,
        ctx: &RequestContext,
        path: &str,
        flags: OpenFlags,
        created: bool,
    ) -> VfsResult<Self> {
        if !flags.read && !flags.write {
            return Err(VfsError::permission_denied(path));
        }
        let mut handle = Self::new(path, flags);

        handle.raw = fs.raw_open(ctx, path, flags.raw_mode()).await?;
        if handle.raw.is_some() {
            return Ok(handle);
        }

        if !flags.write {
            if !created {
                handle.buffer = fs.read_file(ctx, path).await?;
            }
            return Ok(handle);
        }

        if !fs.can_write(ctx, path).await {
            return Err(VfsError::permission_denied(path));
        }
        if created {
            handle.create();
        } else if flags.truncate {
            handle.modified = true;
        } else if flags.read || flags.append {
            handle.buffer = fs.read_file(ctx, path).await?;
        }
        Ok(handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The filesystem's raw token, for raw handles.
    pub fn raw(&self) -> Option<RawHandle> {
        self.raw
    }

    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Buffered content.
    pub fn contents(&self) -> &[u8] {
        &self.buffer
    }

    /// Reset to an empty, dirty buffer.
    pub fn create(&mut self) {
        self.buffer.clear();
        self.modified = true;
    }

    /// Bytes `[offset, offset + size)` of the buffer, clipped to its end.
    pub fn read_buffer(&self, offset: u64, size: u32) -> Vec<u8> {
        let len = self.buffer.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        self.buffer[start..end].to_vec()
    }

    /// Write into the buffer.
    ///
    /// Append-mode writes and writes at or past the end are appended
    /// whatever the offset, without zero fill. Other writes overwrite in
    /// place, growing the buffer if they run past the end.
    pub fn write_buffer(&mut self, offset: u64, data: &[u8]) -> usize {
        let len = self.buffer.len();
        match usize::try_from(offset) {
            Ok(start) if !self.flags.append && start < len => {
                let end = start + data.len();
                if end > len {
                    self.buffer.resize(end, 0);
                }
                self.buffer[start..end].copy_from_slice(data);
            }
            _ => self.buffer.extend_from_slice(data),
        }
        self.modified = true;
        data.len()
    }

    /// Cut or zero-extend the buffer to `len` bytes.
    pub fn truncate_buffer(&mut self, len: u64) -> VfsResult<()> {
        if len != self.buffer.len() as u64 {
            resize_zeroed(&mut self.buffer, len, &self.path)?;
            self.modified = true;
        }
        Ok(())
    }

    pub async fn read(
        &self,
        fs: &dyn VirtualDir,
        ctx: &RequestContext,
        offset: u64,
        size: u32,
    ) -> VfsResult<Vec<u8>> {
        match self.raw {
            Some(raw) => fs.raw_read(ctx, &self.path, offset, size, raw).await,
            None => Ok(self.read_buffer(offset, size)),
        }
    }

    pub async fn write(
        &mut self,
        fs: &dyn VirtualDir,
        ctx: &RequestContext,
        offset: u64,
        data: &[u8],
    ) -> VfsResult<usize> {
        match self.raw {
            Some(raw) => fs.raw_write(ctx, &self.path, offset, data, raw).await,
            None => Ok(self.write_buffer(offset, data)),
        }
    }

    /// Write a dirty buffer back with `write_to`.
    ///
    /// Returns true when content was written. Raw handles and clean
    /// buffers have nothing to write, so repeated flushes are cheap.
    pub async fn flush(&mut self, fs: &dyn VirtualDir, ctx: &RequestContext) -> VfsResult<bool> {
        if self.raw.is_some() || !self.modified {
            return Ok(false);
        }
        fs.write_to(ctx, &self.path, &self.buffer).await?;
        self.modified = false;
        Ok(true)
    }

    /// Set the file length through this handle.
    pub async fn truncate(
        &mut self,
        fs: &dyn VirtualDir,
        ctx: &RequestContext,
        len: u64,
    ) -> VfsResult<()> {
        match self.raw {
            Some(raw) => {
                fs.raw_truncate(ctx, &self.path, len, Some(raw)).await?;
            }
            None => self.truncate_buffer(len)?,
        }
        Ok(())
    }

    /// Commit to storage: `raw_sync` for raw handles, a flush otherwise.
    ///
    /// Returns true when buffered content was written back.
    pub async fn sync(
        &mut self,
        fs: &dyn VirtualDir,
        ctx: &RequestContext,
        datasync: bool,
    ) -> VfsResult<bool> {
        match self.raw {
            Some(raw) => {
                fs.raw_sync(ctx, &self.path, datasync, raw).await?;
                Ok(false)
            }
            None => self.flush(fs, ctx).await,
        }
    }

    /// Finish with the handle: close raw files, flush buffered ones.
    ///
    /// Returns true when the file now exists in the filesystem because of
    /// this handle: a raw file was closed or buffered content was written.
    pub async fn release(&mut self, fs: &dyn VirtualDir, ctx: &RequestContext) -> VfsResult<bool> {
        match self.raw.take() {
            Some(raw) => {
                fs.raw_close(ctx, &self.path, raw).await?;
                Ok(true)
            }
            None => self.flush(fs, ctx).await,
        }
    }
}
