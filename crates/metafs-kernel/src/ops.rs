//! The virtual-directory contract.
//!
//! Every filesystem object mounted into the namespace implements
//! [`VirtualDir`]. All methods have a default body, so an implementation
//! overrides only what it supports and the dispatcher never has to ask
//! whether an operation exists.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{VfsError, VfsResult};
use crate::stats::UsageStats;
use crate::types::{RawHandle, RawMode, Statistics, Times, XattrMap};

/// Core virtual-directory trait.
///
/// Paths are rooted at the implementing object: `/` is the object itself
/// and `/a/b` is two levels beneath it.
///
/// Optional operations that an implementation does not support report
/// [`VfsError::NotSupported`] or return their documented default. Callers
/// walking a tree treat `NotSupported` as "declined" and fall back.
#[async_trait]
pub trait VirtualDir: Send + Sync {
    // ========================================================================
    // Queries
    // ========================================================================

    async fn is_directory(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    async fn is_file(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    /// Names directly beneath a directory, in listing order.
    async fn contents(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn is_executable(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    /// Size of a file in bytes.
    ///
    /// Defaults to the length of the whole file content.
    async fn size(&self, ctx: &RequestContext, path: &str) -> VfsResult<u64> {
        Ok(self.read_file(ctx, path).await?.len() as u64)
    }

    async fn times(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Times> {
        Ok(Times::default())
    }

    async fn read_file(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Vec<u8>> {
        Ok(Vec::new())
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Whether `path` may be written. Applies to files only; see
    /// [`VirtualDir::can_mkdir`] for directories.
    async fn can_write(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    /// Replace a file's content, creating the file if needed.
    async fn write_to(&self, _ctx: &RequestContext, _path: &str, _data: &[u8]) -> VfsResult<()> {
        Ok(())
    }

    async fn can_delete(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    async fn delete(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn can_mkdir(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    /// Create a directory. Does not create intermediate directories.
    ///
    /// With `template`, the given directory object is installed at `path`
    /// by reference instead of a fresh one. Implementations that cannot
    /// hold arbitrary directory objects decline that form.
    async fn mkdir(
        &self,
        _ctx: &RequestContext,
        path: &str,
        template: Option<Arc<dyn VirtualDir>>,
    ) -> VfsResult<()> {
        match template {
            None => Ok(()),
            Some(_) => Err(VfsError::not_supported(format!("mkdir with directory object: {path}"))),
        }
    }

    async fn can_rmdir(&self, _ctx: &RequestContext, _path: &str) -> bool {
        false
    }

    async fn rmdir(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<()> {
        Ok(())
    }

    async fn touch(&self, _ctx: &RequestContext, _path: &str, _mtime: SystemTime) -> VfsResult<()> {
        Ok(())
    }

    /// Move `from` to `to` natively.
    ///
    /// `Ok(false)` means "not handled here" and lets the caller fall back to
    /// copy and delete. `owner` is the filesystem that owns `to` when a move
    /// crosses subtrees; implementations that cannot insert into a foreign
    /// owner decline that form.
    async fn rename(
        &self,
        _ctx: &RequestContext,
        from: &str,
        _to: &str,
        owner: Option<&dyn VirtualDir>,
    ) -> VfsResult<bool> {
        match owner {
            None => Ok(false),
            Some(_) => Err(VfsError::not_supported(format!("rename with owner: {from}"))),
        }
    }

    // ========================================================================
    // Raw access
    // ========================================================================

    /// Open a backing file directly. `None` declines, and the caller uses
    /// buffered access instead.
    async fn raw_open(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _mode: RawMode,
    ) -> VfsResult<Option<RawHandle>> {
        Ok(None)
    }

    async fn raw_read(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _offset: u64,
        _size: u32,
        _handle: RawHandle,
    ) -> VfsResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Returns the number of bytes written.
    async fn raw_write(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _offset: u64,
        _data: &[u8],
        _handle: RawHandle,
    ) -> VfsResult<usize> {
        Ok(0)
    }

    /// Truncate the backing file, through `handle` when one is open.
    /// `Ok(false)` means truncation is not handled here.
    async fn raw_truncate(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _len: u64,
        _handle: Option<RawHandle>,
    ) -> VfsResult<bool> {
        Ok(false)
    }

    async fn raw_sync(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _datasync: bool,
        _handle: RawHandle,
    ) -> VfsResult<()> {
        Ok(())
    }

    async fn raw_close(&self, _ctx: &RequestContext, _path: &str, _handle: RawHandle) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    async fn xattr(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<XattrMap> {
        Ok(XattrMap::new())
    }

    async fn set_xattr(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _name: &str,
        _value: &[u8],
    ) -> VfsResult<()> {
        Ok(())
    }

    async fn remove_xattr(&self, _ctx: &RequestContext, _path: &str, _name: &str) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Accounting and lifecycle
    // ========================================================================

    async fn statistics(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Statistics> {
        Ok(Statistics::default())
    }

    /// The accounting node covering this whole object, if it keeps one.
    ///
    /// Parents use it to re-hang a subtree's totals when the object is
    /// mounted into or moved within another tree.
    fn usage(&self) -> Option<Arc<UsageStats>> {
        None
    }

    /// Called once the filesystem is mounted.
    async fn mounted(&self) {}

    /// Called when the filesystem is unmounted.
    async fn unmounted(&self) {}
}
