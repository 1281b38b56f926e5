//! Filesystem projecting real files onto arbitrary virtual paths.
//!
//! A [`PathMapperFs`] serves a tree of virtual paths in which every file is
//! backed by a real file elsewhere on disk and directories exist only to
//! hold mapped files. Typical use is presenting a media library by tag
//! rather than by on-disk layout:
//!
//! ```no_run
//! use metafs_kernel::config::MapperConfig;
//! use metafs_kernel::pathmapper::PathMapperFs;
//!
//! let fs = PathMapperFs::create(["/music"], MapperConfig::default(), |real| {
//!     let name = real.file_name()?.to_str()?;
//!     Some(format!("/by-name/{name}"))
//! })?;
//! # Ok::<(), metafs_kernel::VfsError>(())
//! ```
//!
//! Files can be read through buffered access or, with
//! `use_raw_file_access`, directly from the backing file. Writes go to the
//! backing files and require `allow_write`; the mapping itself is changed
//! only through [`PathMapperFs::map_file`], [`PathMapperFs::cleanup`] or a
//! background [`Scanner`].

pub mod raw;
pub mod tree;
pub mod xattr;

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::fs;

use crate::config::{MapperConfig, MountConfig, ScanConfig};
use crate::context::RequestContext;
use crate::error::{VfsError, VfsResult};
use crate::ops::VirtualDir;
use crate::scan::{ScanLoop, Scanner};
use crate::stats::UsageStats;
use crate::types::{RawHandle, RawMode, Statistics, Times, XattrMap};

use raw::{RawFile, RawFiles};
use tree::{MapOptions, MappedNode, MappedTree};

/// Option that makes a node and everything below it read-only.
pub const READ_ONLY: &str = "read_only";

/// What a virtual path resolves to, copied out of the tree.
enum Lookup {
    Missing,
    Dir { overlay: XattrMap },
    File {
        real_path: PathBuf,
        writable: bool,
        overlay: XattrMap,
    },
}

/// Filesystem of virtual paths backed by real files.
pub struct PathMapperFs {
    tree: Arc<RwLock<MappedTree>>,
    use_raw_file_access: AtomicBool,
    allow_write: AtomicBool,
    raw: RawFiles,
    scan: Option<Arc<ScanLoop>>,
}

impl std::fmt::Debug for PathMapperFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathMapperFs")
            .field("use_raw_file_access", &self.use_raw_file_access())
            .field("allow_write", &self.allow_write())
            .field("nodes", &self.tree.read().len())
            .field("open_raw", &self.raw.len())
            .finish()
    }
}

impl Default for PathMapperFs {
    fn default() -> Self {
        Self::new(MapperConfig::default())
    }
}

impl PathMapperFs {
    pub fn new(config: MapperConfig) -> Self {
        Self::with_stats(config, UsageStats::new())
    }

    /// Create an empty filesystem from a mount configuration.
    ///
    /// The quota is reported through `statistics`. It is never enforced,
    /// even when strict, because file sizes change outside the mount.
    pub fn from_config(config: &MountConfig) -> Self {
        Self::with_stats(config.mapper, config.usage_stats())
    }

    /// Create an empty filesystem counted against `stats`.
    pub fn with_stats(config: MapperConfig, stats: Arc<UsageStats>) -> Self {
        Self {
            tree: Arc::new(RwLock::new(MappedTree::new(stats))),
            use_raw_file_access: AtomicBool::new(config.use_raw_file_access),
            allow_write: AtomicBool::new(config.allow_write),
            raw: RawFiles::new(),
            scan: None,
        }
    }

    /// Create a filesystem and map every file under `dirs` through `mapper`.
    ///
    /// See [`PathMapperFs::map_directory`].
    pub fn create<I, P, F>(dirs: I, config: MapperConfig, mapper: F) -> VfsResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: FnMut(&Path) -> Option<String>,
    {
        let fs = Self::new(config);
        fs.map_directory(dirs, mapper)?;
        Ok(fs)
    }

    /// Keep the tree in sync with `scanner` while mounted.
    ///
    /// `config` is handed to [`Scanner::configure`] before the loop takes
    /// ownership. The scan loop starts on [`VirtualDir::mounted`] and stops
    /// on [`VirtualDir::unmounted`].
    pub fn with_scanner(mut self, mut scanner: impl Scanner, config: &ScanConfig) -> Self {
        scanner.configure(config);
        let scan = ScanLoop::new(Arc::new(scanner), Arc::clone(&self.tree), config.poll_interval())
            .with_watch(config.watch);
        self.scan = Some(Arc::new(scan));
        self
    }

    /// The background scan loop, if one is configured.
    pub fn scan_loop(&self) -> Option<&Arc<ScanLoop>> {
        self.scan.as_ref()
    }

    /// Shared handle to the mapped tree.
    pub fn tree(&self) -> &Arc<RwLock<MappedTree>> {
        &self.tree
    }

    pub fn use_raw_file_access(&self) -> bool {
        self.use_raw_file_access.load(Ordering::Relaxed)
    }

    pub fn set_use_raw_file_access(&self, enabled: bool) {
        self.use_raw_file_access.store(enabled, Ordering::Relaxed);
    }

    pub fn allow_write(&self) -> bool {
        self.allow_write.load(Ordering::Relaxed)
    }

    pub fn set_allow_write(&self, enabled: bool) {
        self.allow_write.store(enabled, Ordering::Relaxed);
    }

    /// Map `real_path` to appear at `virtual_path`.
    pub fn map_file(
        &self,
        real_path: impl Into<PathBuf>,
        virtual_path: &str,
        options: MapOptions,
    ) -> VfsResult<()> {
        self.tree
            .write()
            .map_file(real_path, virtual_path, options)
            .map(|_| ())
    }

    /// Create a directory node carrying `options`, such as [`READ_ONLY`].
    pub fn map_dir(&self, virtual_path: &str, options: MapOptions) -> VfsResult<()> {
        self.tree.write().mkdir(virtual_path, options).map(|_| ())
    }

    /// Walk `dirs` recursively and map each regular file to the path
    /// `mapper` returns for it. Files for which it returns `None` are
    /// skipped. Returns the number of files mapped.
    ///
    /// This is a one-off bulk population, not a live sync.
    pub fn map_directory<I, P, F>(&self, dirs: I, mut mapper: F) -> VfsResult<usize>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: FnMut(&Path) -> Option<String>,
    {
        let mut mapped = 0;
        let mut tree = self.tree.write();
        for dir in dirs {
            for entry in walkdir::WalkDir::new(dir.as_ref()).follow_links(true) {
                let entry = entry.map_err(|e| VfsError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(virtual_path) = mapper(entry.path()) {
                    tree.map_file(entry.path(), &virtual_path, MapOptions::default())?;
                    mapped += 1;
                }
            }
        }
        tracing::debug!(mapped, "mapped directory");
        Ok(mapped)
    }

    /// The real file behind `virtual_path`.
    pub fn unmap(&self, virtual_path: &str) -> Option<PathBuf> {
        self.tree.read().unmap(virtual_path).map(Path::to_path_buf)
    }

    pub fn is_mapped(&self, virtual_path: &str) -> bool {
        self.tree.read().node_id(virtual_path).is_some()
    }

    /// Remove file nodes for which `discard` returns true, and any
    /// directories left empty by those removals. Returns the number of
    /// nodes removed.
    ///
    /// Directories that were empty beforehand, like those made with
    /// [`PathMapperFs::map_dir`], stay in place.
    pub fn cleanup<F>(&self, discard: F) -> usize
    where
        F: FnMut(&MappedNode) -> bool,
    {
        self.tree.write().cleanup(discard)
    }

    fn lookup(&self, path: &str) -> Lookup {
        let tree = self.tree.read();
        let Some(id) = tree.node_id(path) else {
            return Lookup::Missing;
        };
        let Some(node) = tree.get(id) else {
            return Lookup::Missing;
        };
        let overlay = node.options.xattr.clone();
        match node.real_path() {
            None => Lookup::Dir { overlay },
            Some(real_path) => {
                let read_only = tree
                    .inherited_option(id, READ_ONLY)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Lookup::File {
                    real_path: real_path.to_path_buf(),
                    writable: self.allow_write() && !read_only,
                    overlay,
                }
            }
        }
    }

    /// Real path of a mapped file, or the error for what `path` is instead.
    fn real_file(&self, path: &str) -> VfsResult<(PathBuf, bool)> {
        match self.lookup(path) {
            Lookup::File {
                real_path,
                writable,
                ..
            } => Ok((real_path, writable)),
            Lookup::Dir { .. } => Err(VfsError::is_a_directory(path)),
            Lookup::Missing => Err(VfsError::not_found(path)),
        }
    }

    /// Re-stat the backing file of `path` and account for any size change.
    ///
    /// The stat happens before the tree lock is taken. If the node was
    /// repointed in between, the stale size is dropped.
    async fn refresh_size(&self, path: &str) {
        let Ok((real_path, _)) = self.real_file(path) else {
            return;
        };
        let size = fs::metadata(&real_path).await.map(|m| m.len()).unwrap_or(0);
        let mut tree = self.tree.write();
        let Some(id) = tree.node_id(path) else {
            return;
        };
        if let Some(delta) = tree.set_size(id, &real_path, size) {
            tracing::trace!(path, delta, "refreshed mapped file size");
        }
    }
}

fn metadata_times(meta: &std::fs::Metadata) -> Times {
    let ctime = UNIX_EPOCH
        + Duration::new(
            meta.ctime().max(0) as u64,
            meta.ctime_nsec().clamp(0, 999_999_999) as u32,
        );
    Times {
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime,
    }
}

#[async_trait]
impl VirtualDir for PathMapperFs {
    async fn is_directory(&self, _ctx: &RequestContext, path: &str) -> bool {
        matches!(self.lookup(path), Lookup::Dir { .. })
    }

    async fn is_file(&self, _ctx: &RequestContext, path: &str) -> bool {
        match self.lookup(path) {
            Lookup::File { real_path, .. } => fs::metadata(&real_path)
                .await
                .is_ok_and(|meta| meta.is_file()),
            _ => false,
        }
    }

    async fn contents(&self, _ctx: &RequestContext, path: &str) -> VfsResult<Vec<String>> {
        let tree = self.tree.read();
        let id = tree.node_id(path).ok_or_else(|| VfsError::not_found(path))?;
        tree.children(id)
            .ok_or_else(|| VfsError::not_a_directory(path))
    }

    async fn is_executable(&self, _ctx: &RequestContext, path: &str) -> bool {
        let Ok((real_path, _)) = self.real_file(path) else {
            return false;
        };
        fs::metadata(&real_path)
            .await
            .is_ok_and(|meta| meta.permissions().mode() & 0o111 != 0)
    }

    async fn size(&self, _ctx: &RequestContext, path: &str) -> VfsResult<u64> {
        match self.lookup(path) {
            Lookup::File { real_path, .. } => {
                Ok(fs::metadata(&real_path).await.map_err(VfsError::from)?.len())
            }
            Lookup::Dir { .. } => Ok(0),
            Lookup::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn times(&self, _ctx: &RequestContext, path: &str) -> VfsResult<Times> {
        match self.lookup(path) {
            Lookup::File { real_path, .. } => {
                let meta = fs::metadata(&real_path).await.map_err(VfsError::from)?;
                Ok(metadata_times(&meta))
            }
            Lookup::Dir { .. } => Ok(Times::default()),
            Lookup::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn read_file(&self, _ctx: &RequestContext, path: &str) -> VfsResult<Vec<u8>> {
        let (real_path, _) = self.real_file(path)?;
        fs::read(&real_path).await.map_err(VfsError::from)
    }

    /// Only existing mapped files can be written; there is nothing to back
    /// a new one.
    async fn can_write(&self, ctx: &RequestContext, path: &str) -> bool {
        matches!(self.lookup(path), Lookup::File { writable: true, .. })
            && self.is_file(ctx, path).await
    }

    async fn write_to(&self, _ctx: &RequestContext, path: &str, data: &[u8]) -> VfsResult<()> {
        let (real_path, writable) = self.real_file(path)?;
        if !writable {
            return Err(VfsError::permission_denied(path));
        }
        fs::write(&real_path, data).await.map_err(VfsError::from)?;
        self.refresh_size(path).await;
        Ok(())
    }

    async fn raw_open(
        &self,
        _ctx: &RequestContext,
        path: &str,
        mode: RawMode,
    ) -> VfsResult<Option<RawHandle>> {
        if !self.use_raw_file_access() {
            return Ok(None);
        }
        let (real_path, writable) = self.real_file(path)?;
        if mode.write && !writable {
            return Ok(None);
        }
        let file = RawFile::open(&real_path, path, mode).await?;
        let handle = self.raw.insert(file);
        tracing::trace!(path, mode = %mode, handle = handle.0, "raw open");
        Ok(Some(handle))
    }

    async fn raw_read(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        offset: u64,
        size: u32,
        handle: RawHandle,
    ) -> VfsResult<Vec<u8>> {
        self.raw.get(handle)?.read_at(offset, size).await
    }

    async fn raw_write(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        offset: u64,
        data: &[u8],
        handle: RawHandle,
    ) -> VfsResult<usize> {
        self.raw.get(handle)?.write_at(offset, data).await
    }

    async fn raw_truncate(
        &self,
        _ctx: &RequestContext,
        path: &str,
        len: u64,
        handle: Option<RawHandle>,
    ) -> VfsResult<bool> {
        match handle {
            Some(handle) => {
                // size is refreshed when the handle closes
                self.raw.get(handle)?.set_len(len).await?;
            }
            None => {
                let (real_path, writable) = self.real_file(path)?;
                if !writable {
                    return Err(VfsError::permission_denied(path));
                }
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&real_path)
                    .await
                    .map_err(VfsError::from)?;
                file.set_len(len).await.map_err(VfsError::from)?;
                self.refresh_size(path).await;
            }
        }
        Ok(true)
    }

    async fn raw_sync(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        datasync: bool,
        handle: RawHandle,
    ) -> VfsResult<()> {
        self.raw.get(handle)?.sync(datasync).await
    }

    async fn raw_close(&self, _ctx: &RequestContext, _path: &str, handle: RawHandle) -> VfsResult<()> {
        let Some(file) = self.raw.remove(handle) else {
            return Err(VfsError::invalid_argument(format!("unknown raw handle {}", handle.0)));
        };
        if file.is_writable() {
            file.sync(true).await?;
            self.refresh_size(file.path()).await;
        }
        tracing::trace!(path = file.path(), handle = handle.0, "raw close");
        Ok(())
    }

    /// Native attributes of the backing file, overlaid with the attributes
    /// set in the node's options.
    async fn xattr(&self, _ctx: &RequestContext, path: &str) -> VfsResult<XattrMap> {
        match self.lookup(path) {
            Lookup::File {
                real_path, overlay, ..
            } => {
                let mut attrs = match xattr::list(real_path).await {
                    Ok(attrs) => attrs,
                    Err(e) if e.is_declined() => XattrMap::new(),
                    Err(e) => return Err(e),
                };
                attrs.extend(overlay);
                Ok(attrs)
            }
            Lookup::Dir { overlay } => Ok(overlay),
            Lookup::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn set_xattr(
        &self,
        _ctx: &RequestContext,
        path: &str,
        name: &str,
        value: &[u8],
    ) -> VfsResult<()> {
        let real_path = self.native_xattr_target(path, name)?;
        xattr::set(real_path, name.to_string(), value.to_vec()).await
    }

    async fn remove_xattr(&self, _ctx: &RequestContext, path: &str, name: &str) -> VfsResult<()> {
        let real_path = self.native_xattr_target(path, name)?;
        xattr::remove(real_path, name.to_string()).await
    }

    async fn statistics(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Statistics> {
        Ok(self.tree.read().stats().statistics())
    }

    fn usage(&self) -> Option<Arc<UsageStats>> {
        Some(Arc::clone(self.tree.read().stats()))
    }

    async fn mounted(&self) {
        if let Some(scan) = &self.scan {
            if let Err(e) = scan.start() {
                tracing::error!(error = %e, "failed to start scan loop");
            }
        }
    }

    async fn unmounted(&self) {
        if let Some(scan) = &self.scan {
            let scan = Arc::clone(scan);
            // joining waits for any pass in progress
            if let Err(e) = tokio::task::spawn_blocking(move || scan.stop()).await {
                tracing::error!(error = %e, "failed to stop scan loop");
            }
        }
    }
}

impl PathMapperFs {
    /// Backing file whose native attribute `name` may be changed.
    ///
    /// Attributes set through the node's options shadow the native ones
    /// and cannot be changed this way.
    fn native_xattr_target(&self, path: &str, name: &str) -> VfsResult<PathBuf> {
        match self.lookup(path) {
            Lookup::File {
                real_path,
                writable,
                overlay,
            } => {
                if overlay.contains_key(name) || !writable {
                    Err(VfsError::permission_denied(format!("{path}: {name}")))
                } else {
                    Ok(real_path)
                }
            }
            Lookup::Dir { overlay } if overlay.contains_key(name) => {
                Err(VfsError::permission_denied(format!("{path}: {name}")))
            }
            Lookup::Dir { .. } => Err(VfsError::not_supported(format!("xattr on directory {path}"))),
            Lookup::Missing => Err(VfsError::not_found(path)),
        }
    }
}
