//! Kernel-request dispatch.
//!
//! [`Dispatcher`] sits between a FUSE-style request loop and the root
//! [`VirtualDir`]. Each call resolves the path, checks the matching `can_*`
//! permission, runs the operation and returns a [`VfsError`] whose
//! [`errno`](VfsError::errno) is what the kernel sees.
//!
//! Open files are tracked here by numeric handle. Files created with
//! `mknod` exist only as markers until their first write-back, so getattr
//! can report them as empty files in the meantime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::context::RequestContext;
use crate::error::{VfsError, VfsResult, or_default};
use crate::handle::{FileHandle, resize_zeroed};
use crate::ops::VirtualDir;
use crate::path;
use crate::types::{DirEntry, FileType, OpenFlags, Stat, StatFs, Times, is_regular_mode};

/// Child name used to ask a directory whether entries may be created in it.
const CHECK_NAME: &str = "._metafs_check_";

type SharedHandle = Arc<tokio::sync::Mutex<FileHandle>>;

/// Log a failed dispatch call and pass the result through.
fn logged<T>(op: &'static str, path: &str, result: VfsResult<T>) -> VfsResult<T> {
    if let Err(e) = &result {
        tracing::debug!(op, path, errno = e.errno().raw_os_error(), error = %e, "request failed");
    }
    result
}

/// Translates kernel requests into [`VirtualDir`] calls.
pub struct Dispatcher {
    root: Arc<dyn VirtualDir>,
    /// Files created by mknod that have not been written back yet.
    created: Mutex<HashMap<String, Stat>>,
    handles: Mutex<HashMap<u64, SharedHandle>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("created", &self.created.lock().len())
            .field("handles", &self.handles.lock().len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(root: Arc<dyn VirtualDir>) -> Self {
        Self {
            root,
            created: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Arc<dyn VirtualDir> {
        &self.root
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// True while `path` was created but not yet written back.
    pub fn is_pending_create(&self, path: &str) -> bool {
        self.created.lock().contains_key(path)
    }

    fn handle(&self, fh: u64) -> VfsResult<SharedHandle> {
        self.handles
            .lock()
            .get(&fh)
            .cloned()
            .ok_or_else(|| VfsError::invalid_argument(format!("bad file handle {fh}")))
    }

    fn clear_marker(&self, path: &str) {
        self.created.lock().remove(path);
    }

    // ========================================================================
    // Attributes and listing
    // ========================================================================

    /// Attributes of `path`.
    ///
    /// Directories are `0o777` when a child could be created or
    /// written and `0o555` otherwise. Files are `0o444`, plus `0o222` when
    /// writable and `0o111` when executable.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.getattr")]
    pub async fn getattr(&self, ctx: &RequestContext, path: &str) -> VfsResult<Stat> {
        ctx.check_cancelled()?;
        logged("getattr", path, self.getattr_inner(ctx, path).await)
    }

    async fn getattr_inner(&self, ctx: &RequestContext, path: &str) -> VfsResult<Stat> {
        let root = &*self.root;

        if path::is_root(path) || root.is_directory(ctx, path).await {
            let check = path::join(path, CHECK_NAME);
            let perm = if root.can_mkdir(ctx, &check).await || root.can_write(ctx, &check).await {
                0o777
            } else {
                0o555
            };
            let times = or_default(root.times(ctx, path).await, Times::default())?;
            return Ok(Stat::directory(perm, ctx.owner, times));
        }

        if let Some(stat) = self.created.lock().get(path).cloned() {
            return Ok(stat);
        }

        if root.is_file(ctx, path).await {
            let mut perm = 0o444;
            if root.can_write(ctx, path).await {
                perm |= 0o222;
            }
            if root.is_executable(ctx, path).await {
                perm |= 0o111;
            }
            let size = root.size(ctx, path).await?;
            let times = or_default(root.times(ctx, path).await, Times::default())?;
            return Ok(Stat::file(perm, size, ctx.owner, times));
        }

        Err(VfsError::not_found(path))
    }

    /// Entries of a directory, starting with `.` and `..`.
    ///
    /// Files created but not yet written back are listed too.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.readdir")]
    pub async fn readdir(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<DirEntry>> {
        ctx.check_cancelled()?;
        logged("readdir", path, self.readdir_inner(ctx, path).await)
    }

    async fn readdir_inner(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<DirEntry>> {
        let root = &*self.root;
        if !path::is_root(path) && !root.is_directory(ctx, path).await {
            return Err(if root.is_file(ctx, path).await {
                VfsError::not_a_directory(path)
            } else {
                VfsError::not_found(path)
            });
        }

        let mut entries = vec![
            DirEntry::new(".", Some(FileType::Directory)),
            DirEntry::new("..", Some(FileType::Directory)),
        ];
        let names = root.contents(ctx, path).await?;
        for name in &names {
            let child = path::join(path, name);
            let kind = if root.is_directory(ctx, &child).await {
                Some(FileType::Directory)
            } else if root.is_file(ctx, &child).await {
                Some(FileType::File)
            } else {
                None
            };
            entries.push(DirEntry::new(name.clone(), kind));
        }

        let mut pending: Vec<String> = self
            .created
            .lock()
            .keys()
            .filter_map(|p| {
                let (parent, name) = p.rsplit_once('/')?;
                let same_dir = path::scan_path(parent) == path::scan_path(path);
                (same_dir && !names.iter().any(|n| n == name)).then(|| name.to_string())
            })
            .collect();
        pending.sort();
        entries.extend(pending.into_iter().map(|n| DirEntry::new(n, Some(FileType::File))));

        Ok(entries)
    }

    /// Filesystem usage in statvfs form.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.statfs")]
    pub async fn statfs(&self, ctx: &RequestContext, path: &str) -> VfsResult<StatFs> {
        ctx.check_cancelled()?;
        let stats = logged("statfs", path, self.root.statistics(ctx, path).await)?;
        Ok(stats.to_statvfs())
    }

    // ========================================================================
    // Namespace changes
    // ========================================================================

    #[tracing::instrument(skip(self, ctx), name = "dispatch.mkdir")]
    pub async fn mkdir(&self, ctx: &RequestContext, path: &str, _mode: u32) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let result = async {
            if !self.root.can_mkdir(ctx, path).await {
                return Err(VfsError::permission_denied(path));
            }
            self.root.mkdir(ctx, path, None).await
        }
        .await;
        logged("mkdir", path, result)
    }

    /// Create an empty regular file.
    ///
    /// Nothing reaches the filesystem until the file is first written
    /// back; until then getattr reports the marker.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.mknod")]
    pub async fn mknod(&self, ctx: &RequestContext, path: &str, mode: u32) -> VfsResult<()> {
        ctx.check_cancelled()?;
        if !is_regular_mode(mode) || !self.root.can_write(ctx, path).await {
            return logged("mknod", path, Err(VfsError::permission_denied(path)));
        }
        let stat = Stat::file(mode & 0o7777, 0, ctx.caller, Times::all(SystemTime::now()));
        self.created.lock().insert(path.to_string(), stat);
        Ok(())
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.unlink")]
    pub async fn unlink(&self, ctx: &RequestContext, path: &str) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let result = async {
            if self.is_pending_create(path) && !self.root.is_file(ctx, path).await {
                self.clear_marker(path);
                return Ok(());
            }
            if !self.root.can_delete(ctx, path).await {
                return Err(VfsError::permission_denied(path));
            }
            self.clear_marker(path);
            self.root.delete(ctx, path).await
        }
        .await;
        logged("unlink", path, result)
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.rmdir")]
    pub async fn rmdir(&self, ctx: &RequestContext, path: &str) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let result = async {
            if !self.root.can_rmdir(ctx, path).await {
                return Err(VfsError::permission_denied(path));
            }
            self.root.rmdir(ctx, path).await
        }
        .await;
        logged("rmdir", path, result)
    }

    /// Move `from` to `to`.
    ///
    /// The filesystem's own rename is tried first. When it declines, a
    /// file is copied and the original deleted; a directory cannot be
    /// moved that way and the call is denied.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.rename")]
    pub async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> VfsResult<()> {
        ctx.check_cancelled()?;
        logged("rename", from, self.rename_inner(ctx, from, to).await)
    }

    async fn rename_inner(&self, ctx: &RequestContext, from: &str, to: &str) -> VfsResult<()> {
        let root = &*self.root;
        if path::scan_path(from) == path::scan_path(to) {
            return Ok(());
        }
        if path::is_within(to, from) && root.is_directory(ctx, from).await {
            return Err(VfsError::invalid_argument(format!("cannot move {from} into {to}")));
        }

        if or_default(root.rename(ctx, from, to, None).await, false)? {
            self.move_marker(from, to);
            return Ok(());
        }

        if root.is_file(ctx, from).await
            && root.can_write(ctx, to).await
            && root.can_delete(ctx, from).await
        {
            let data = root.read_file(ctx, from).await?;
            root.write_to(ctx, to, &data).await?;
            root.delete(ctx, from).await?;
            self.move_marker(from, to);
            tracing::debug!(from, to, bytes = data.len(), "renamed by copy");
            return Ok(());
        }

        Err(VfsError::permission_denied(from))
    }

    fn move_marker(&self, from: &str, to: &str) {
        let mut created = self.created.lock();
        if let Some(stat) = created.remove(from) {
            created.insert(to.to_string(), stat);
        }
    }

    /// Set the modification time. The access time is not tracked.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.utime")]
    pub async fn utime(
        &self,
        ctx: &RequestContext,
        path: &str,
        _atime: SystemTime,
        mtime: SystemTime,
    ) -> VfsResult<()> {
        ctx.check_cancelled()?;
        logged("utime", path, self.root.touch(ctx, path, mtime).await)
    }

    /// Set a file's length by path.
    ///
    /// Filesystems with raw access truncate the backing file; others get
    /// the content cut or zero-extended and written back.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.truncate")]
    pub async fn truncate(&self, ctx: &RequestContext, path: &str, len: u64) -> VfsResult<()> {
        ctx.check_cancelled()?;
        logged("truncate", path, self.truncate_inner(ctx, path, len).await)
    }

    async fn truncate_inner(&self, ctx: &RequestContext, path: &str, len: u64) -> VfsResult<()> {
        let root = &*self.root;
        if !root.can_write(ctx, path).await {
            return Err(VfsError::permission_denied(path));
        }
        if or_default(root.raw_truncate(ctx, path, len, None).await, false)? {
            return Ok(());
        }

        let mut data = if self.is_pending_create(path) {
            Vec::new()
        } else {
            root.read_file(ctx, path).await?
        };
        resize_zeroed(&mut data, len, path)?;
        root.write_to(ctx, path, &data).await?;
        self.clear_marker(path);
        Ok(())
    }

    // ========================================================================
    // Open files
    // ========================================================================

    /// Open `path` and return the new handle number.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.open")]
    pub async fn open(&self, ctx: &RequestContext, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        ctx.check_cancelled()?;
        let created = self.is_pending_create(path);
        let handle = logged(
            "open",
            path,
            FileHandle::open(&*self.root, ctx, path, flags, created).await,
        )?;
        let fh = handle.id();
        tracing::trace!(fh, raw = handle.is_raw(), "opened");
        self.handles
            .lock()
            .insert(fh, Arc::new(tokio::sync::Mutex::new(handle)));
        Ok(fh)
    }

    /// `mknod` followed by `open`.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        path: &str,
        mode: u32,
        flags: OpenFlags,
    ) -> VfsResult<u64> {
        self.mknod(ctx, path, mode).await?;
        self.open(ctx, path, flags).await
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.read")]
    pub async fn read(&self, ctx: &RequestContext, fh: u64, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        ctx.check_cancelled()?;
        let handle = self.handle(fh)?;
        let handle = handle.lock().await;
        logged("read", handle.path(), handle.read(&*self.root, ctx, offset, size).await)
    }

    #[tracing::instrument(skip(self, ctx, data), fields(len = data.len()), name = "dispatch.write")]
    pub async fn write(&self, ctx: &RequestContext, fh: u64, offset: u64, data: &[u8]) -> VfsResult<usize> {
        ctx.check_cancelled()?;
        let handle = self.handle(fh)?;
        let mut handle = handle.lock().await;
        let result = handle.write(&*self.root, ctx, offset, data).await;
        logged("write", handle.path(), result)
    }

    /// Write back a buffered handle if it is dirty.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.flush")]
    pub async fn flush(&self, ctx: &RequestContext, fh: u64) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let handle = self.handle(fh)?;
        let mut handle = handle.lock().await;
        let result = handle.flush(&*self.root, ctx).await;
        if logged("flush", handle.path(), result)? {
            self.clear_marker(handle.path());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.fsync")]
    pub async fn fsync(&self, ctx: &RequestContext, fh: u64, datasync: bool) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let handle = self.handle(fh)?;
        let mut handle = handle.lock().await;
        let result = handle.sync(&*self.root, ctx, datasync).await;
        if logged("fsync", handle.path(), result)? {
            self.clear_marker(handle.path());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.ftruncate")]
    pub async fn ftruncate(&self, ctx: &RequestContext, fh: u64, len: u64) -> VfsResult<()> {
        ctx.check_cancelled()?;
        let handle = self.handle(fh)?;
        let mut handle = handle.lock().await;
        let result = handle.truncate(&*self.root, ctx, len).await;
        logged("ftruncate", handle.path(), result)
    }

    /// Close a handle, flushing or closing the raw file first.
    ///
    /// The handle is gone afterwards even if the final write-back fails.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.release")]
    pub async fn release(&self, ctx: &RequestContext, fh: u64) -> VfsResult<()> {
        let handle = self
            .handles
            .lock()
            .remove(&fh)
            .ok_or_else(|| VfsError::invalid_argument(format!("bad file handle {fh}")))?;
        let mut handle = handle.lock().await;
        let result = handle.release(&*self.root, ctx).await;
        if logged("release", handle.path(), result)? {
            self.clear_marker(handle.path());
        }
        Ok(())
    }

    /// Release every open handle, logging failures.
    pub async fn release_all(&self, ctx: &RequestContext) {
        let handles: Vec<u64> = self.handles.lock().keys().copied().collect();
        for fh in handles {
            if let Err(e) = self.release(ctx, fh).await {
                tracing::warn!(fh, error = %e, "failed to release handle");
            }
        }
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    #[tracing::instrument(skip(self, ctx), name = "dispatch.getxattr")]
    pub async fn getxattr(&self, ctx: &RequestContext, path: &str, name: &str) -> VfsResult<Vec<u8>> {
        ctx.check_cancelled()?;
        let result = async {
            self.root
                .xattr(ctx, path)
                .await?
                .remove(name)
                .ok_or_else(|| VfsError::attribute_not_found(name))
        }
        .await;
        logged("getxattr", path, result)
    }

    /// Attribute names of `path`, sorted.
    #[tracing::instrument(skip(self, ctx), name = "dispatch.listxattr")]
    pub async fn listxattr(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<String>> {
        ctx.check_cancelled()?;
        let attrs = logged("listxattr", path, self.root.xattr(ctx, path).await)?;
        Ok(attrs.into_keys().collect())
    }

    #[tracing::instrument(skip(self, ctx, value), name = "dispatch.setxattr")]
    pub async fn setxattr(&self, ctx: &RequestContext, path: &str, name: &str, value: &[u8]) -> VfsResult<()> {
        ctx.check_cancelled()?;
        logged("setxattr", path, self.root.set_xattr(ctx, path, name, value).await)
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatch.removexattr")]
    pub async fn removexattr(&self, ctx: &RequestContext, path: &str, name: &str) -> VfsResult<()> {
        ctx.check_cancelled()?;
        logged("removexattr", path, self.root.remove_xattr(ctx, path, name).await)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn mounted(&self) {
        self.root.mounted().await;
    }

    pub async fn unmounted(&self) {
        self.root.unmounted().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Identity;
    use crate::metadir::MetaDir;
    use crate::stats::Quota;
    use rustix::fs::OFlags;

    const FILE_MODE: u32 = 0o100644;

    fn setup() -> (Dispatcher, RequestContext) {
        let ctx = RequestContext::owner(Identity::new(1000, 1000));
        (Dispatcher::new(Arc::new(MetaDir::new())), ctx)
    }

    #[tokio::test]
    async fn test_getattr_root_and_missing() {
        let (d, ctx) = setup();
        let root = d.getattr(&ctx, "/").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(root.perm, 0o777);
        assert_eq!(root.nlink, 1);
        assert_eq!(root.uid, 1000);

        let err = d.getattr(&ctx, "/missing").await.unwrap_err();
        assert_eq!(err.errno(), rustix::io::Errno::NOENT);
    }

    #[tokio::test]
    async fn test_getattr_permissions_follow_caller() {
        let (d, ctx) = setup();
        d.root().write_to(&ctx, "/f", b"abc").await.unwrap();

        let file = d.getattr(&ctx, "/f").await.unwrap();
        assert!(file.is_file());
        assert_eq!(file.perm, 0o666);
        assert_eq!(file.size, 3);

        let stranger = ctx.as_caller(Identity::new(2000, 2000));
        assert_eq!(d.getattr(&stranger, "/f").await.unwrap().perm, 0o444);
        assert_eq!(d.getattr(&stranger, "/").await.unwrap().perm, 0o555);
    }

    #[tokio::test]
    async fn test_mknod_open_write_release() {
        let (d, ctx) = setup();
        d.mknod(&ctx, "/new.txt", FILE_MODE).await.unwrap();
        let marker = d.getattr(&ctx, "/new.txt").await.unwrap();
        assert_eq!(marker.size, 0);
        assert_eq!(marker.perm, 0o644);
        let listing: Vec<String> = d.readdir(&ctx, "/").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(listing, vec![".", "..", "new.txt"]);

        let fh = d.open(&ctx, "/new.txt", OpenFlags::write_only()).await.unwrap();
        assert_eq!(d.write(&ctx, fh, 0, b"hello").await.unwrap(), 5);
        d.flush(&ctx, fh).await.unwrap();
        assert!(!d.is_pending_create("/new.txt"));
        d.release(&ctx, fh).await.unwrap();
        assert_eq!(d.open_handles(), 0);

        assert_eq!(d.root().read_file(&ctx, "/new.txt").await.unwrap(), b"hello");
        assert_eq!(d.getattr(&ctx, "/new.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_created_file_is_written_on_release_without_data() {
        let (d, ctx) = setup();
        let fh = d
            .create(&ctx, "/empty", FILE_MODE, OpenFlags::from_bits(OFlags::WRONLY.bits()))
            .await
            .unwrap();
        d.release(&ctx, fh).await.unwrap();
        assert!(d.root().is_file(&ctx, "/empty").await);
        assert!(!d.is_pending_create("/empty"));
    }

    #[tokio::test]
    async fn test_mknod_rejects_non_regular() {
        let (d, ctx) = setup();
        let err = d.mknod(&ctx, "/fifo", 0o010644).await.unwrap_err();
        assert!(matches!(err, VfsError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_readdir_kinds() {
        let (d, ctx) = setup();
        d.mkdir(&ctx, "/dir", 0o755).await.unwrap();
        d.root().write_to(&ctx, "/file", b"x").await.unwrap();
        let entries = d.readdir(&ctx, "/").await.unwrap();
        assert_eq!(entries[0], DirEntry::new(".", Some(FileType::Directory)));
        assert!(entries.contains(&DirEntry::new("dir", Some(FileType::Directory))));
        assert!(entries.contains(&DirEntry::new("file", Some(FileType::File))));

        assert!(matches!(
            d.readdir(&ctx, "/file").await,
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_rmdir_unlink_permissions() {
        let (d, ctx) = setup();
        let stranger = ctx.as_caller(Identity::new(2000, 2000));
        assert!(matches!(
            d.mkdir(&stranger, "/a", 0o755).await,
            Err(VfsError::PermissionDenied(_))
        ));
        d.mkdir(&ctx, "/a", 0o755).await.unwrap();
        d.root().write_to(&ctx, "/a/f", b"1").await.unwrap();

        assert!(d.unlink(&stranger, "/a/f").await.is_err());
        d.unlink(&ctx, "/a/f").await.unwrap();
        assert!(d.rmdir(&stranger, "/a").await.is_err());
        d.rmdir(&ctx, "/a").await.unwrap();
        assert!(d.getattr(&ctx, "/a").await.is_err());
    }

    #[tokio::test]
    async fn test_truncate_by_path() {
        let (d, ctx) = setup();
        d.root().write_to(&ctx, "/f", b"abcdef").await.unwrap();
        d.truncate(&ctx, "/f", 2).await.unwrap();
        assert_eq!(d.root().read_file(&ctx, "/f").await.unwrap(), b"ab");
        d.truncate(&ctx, "/f", 4).await.unwrap();
        assert_eq!(d.root().read_file(&ctx, "/f").await.unwrap(), b"ab\0\0");
    }

    #[tokio::test]
    async fn test_truncate_to_huge_length_fails() {
        let (d, ctx) = setup();
        d.root().write_to(&ctx, "/f", b"abc").await.unwrap();
        let err = d.truncate(&ctx, "/f", 1u64 << 62).await.unwrap_err();
        assert_eq!(err.errno(), rustix::io::Errno::FBIG);
        assert_eq!(d.root().read_file(&ctx, "/f").await.unwrap(), b"abc");

        let fh = d.open(&ctx, "/f", OpenFlags::read_write()).await.unwrap();
        let err = d.ftruncate(&ctx, fh, 1u64 << 62).await.unwrap_err();
        assert!(matches!(err, VfsError::FileTooLarge(_)));
        assert_eq!(d.read(&ctx, fh, 0, 10).await.unwrap(), b"abc");
        d.release(&ctx, fh).await.unwrap();
        assert_eq!(d.root().read_file(&ctx, "/f").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_ftruncate_and_fsync_buffered() {
        let (d, ctx) = setup();
        d.root().write_to(&ctx, "/f", b"abcdef").await.unwrap();
        let fh = d.open(&ctx, "/f", OpenFlags::read_write()).await.unwrap();
        d.ftruncate(&ctx, fh, 3).await.unwrap();
        assert_eq!(d.read(&ctx, fh, 0, 10).await.unwrap(), b"abc");
        d.fsync(&ctx, fh, false).await.unwrap();
        assert_eq!(d.root().read_file(&ctx, "/f").await.unwrap(), b"abc");
        d.release(&ctx, fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_directory_into_itself() {
        let (d, ctx) = setup();
        d.mkdir(&ctx, "/a", 0o755).await.unwrap();
        let err = d.rename(&ctx, "/a", "/a/b").await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_xattr_calls() {
        let (d, ctx) = setup();
        d.root().write_to(&ctx, "/f", b"").await.unwrap();
        d.setxattr(&ctx, "/f", "user.b", b"2").await.unwrap();
        d.setxattr(&ctx, "/f", "user.a", b"1").await.unwrap();
        assert_eq!(d.listxattr(&ctx, "/f").await.unwrap(), vec!["user.a", "user.b"]);
        assert_eq!(d.getxattr(&ctx, "/f", "user.a").await.unwrap(), b"1");

        d.removexattr(&ctx, "/f", "user.a").await.unwrap();
        let err = d.getxattr(&ctx, "/f", "user.a").await.unwrap_err();
        assert_eq!(err.errno(), rustix::io::Errno::NODATA);
    }

    #[tokio::test]
    async fn test_statfs_blocks() {
        let root = Arc::new(MetaDir::with_quota(
            Quota {
                max_space: Some(8 * 1024),
                max_nodes: Some(10),
            },
            false,
        ));
        let d = Dispatcher::new(root);
        let ctx = RequestContext::local();
        d.root().write_to(&ctx, "/f", &[0u8; 2048]).await.unwrap();

        let vfs = d.statfs(&ctx, "/").await.unwrap();
        assert_eq!(vfs.bsize, 1024);
        assert_eq!(vfs.blocks, 8);
        assert_eq!(vfs.bfree, 6);
        assert_eq!(vfs.files, 10);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let (d, ctx) = setup();
        ctx.cancel.cancel();
        assert!(matches!(d.getattr(&ctx, "/").await, Err(VfsError::Interrupted)));
    }

    #[tokio::test]
    async fn test_bad_handle() {
        let (d, ctx) = setup();
        assert!(matches!(d.read(&ctx, 9999, 0, 1).await, Err(VfsError::InvalidArgument(_))));
        assert!(d.release(&ctx, 9999).await.is_err());
    }
}
