//! In-memory directory tree.
//!
//! A [`MetaDir`] maps names to files (byte content) and to directories.
//! A directory entry is any [`VirtualDir`]: usually another `MetaDir`, but
//! any filesystem object can be mounted beneath a name and receives every
//! call for paths under it, rooted at itself.
//!
//! ```text
//! /                 MetaDir
//! ├── notes.txt     file
//! ├── docs          MetaDir
//! │   └── a.md      file
//! └── dict          delegated VirtualDir, sees "/word" for "/dict/word"
//! ```
//!
//! Mutations are permitted for the mount owner only. Delegated filesystems
//! make their own decisions.
//!
//! Each `MetaDir` keeps its own accounting node descending from its
//! parent's, so statistics can be reported for the whole tree or for one
//! subtree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::MountConfig;
use crate::context::RequestContext;
use crate::error::{VfsError, VfsResult, or_default};
use crate::ops::VirtualDir;
use crate::path;
use crate::stats::{Quota, UsageStats};
use crate::types::{RawHandle, RawMode, Statistics, Times, XattrMap};

/// Key under which the directory's own attributes are stored.
const SELF_XATTR: &str = "";

enum Entry {
    File { data: Vec<u8>, times: Times },
    Dir(Arc<dyn VirtualDir>),
}

enum Kind {
    File { len: u64, times: Times },
    Dir(Arc<dyn VirtualDir>),
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    xattr: HashMap<String, XattrMap>,
}

/// Where a path lands relative to this directory.
enum Route {
    /// The directory itself.
    Root,
    /// A name directly inside this directory.
    Leaf(String),
    /// A path beneath a child directory, rooted at that child.
    Delegate(Arc<dyn VirtualDir>, String),
    /// A path beneath something that is not a directory here.
    Missing,
}

/// A fully in-memory, recursively nestable directory.
pub struct MetaDir {
    inner: RwLock<Inner>,
    stats: Arc<UsageStats>,
    created: SystemTime,
}

impl Default for MetaDir {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaDir {
    /// Create an empty root directory with its own accounting.
    pub fn new() -> Self {
        Self::with_stats(UsageStats::new())
    }

    /// Create an empty root directory with quota-limited accounting.
    pub fn with_quota(quota: Quota, strict: bool) -> Self {
        Self::with_stats(UsageStats::with_quota(quota, strict))
    }

    /// Create an empty root directory accounted as `config` describes.
    pub fn from_config(config: &MountConfig) -> Self {
        Self::with_stats(config.usage_stats())
    }

    /// Create an empty directory counted against `stats`.
    pub fn with_stats(stats: Arc<UsageStats>) -> Self {
        stats.record(0, 1);
        Self::from_counted(stats)
    }

    /// Wrap an accounting node that already counts this directory.
    fn from_counted(stats: Arc<UsageStats>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            stats,
            created: SystemTime::now(),
        }
    }

    /// The accounting node for this subtree.
    pub fn stats(&self) -> &Arc<UsageStats> {
        &self.stats
    }

    fn route(&self, path: &str) -> Route {
        match path::split_path(path) {
            None => Route::Root,
            Some((head, None)) => Route::Leaf(head.to_string()),
            Some((head, Some(rest))) => match self.inner.read().entries.get(head) {
                Some(Entry::Dir(dir)) => Route::Delegate(Arc::clone(dir), rest),
                _ => Route::Missing,
            },
        }
    }

    fn kind(&self, name: &str) -> Option<Kind> {
        self.inner.read().entries.get(name).map(|entry| match entry {
            Entry::File { data, times } => Kind::File {
                len: data.len() as u64,
                times: *times,
            },
            Entry::Dir(dir) => Kind::Dir(Arc::clone(dir)),
        })
    }

    fn names(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    fn file_data(&self, name: &str) -> Option<Vec<u8>> {
        match self.inner.read().entries.get(name) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Set a file's mtime, or hand back the directory to forward to.
    fn touch_entry(&self, name: &str, mtime: SystemTime) -> VfsResult<Option<Arc<dyn VirtualDir>>> {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(name) {
            Some(Entry::File { times, .. }) => {
                times.mtime = mtime;
                Ok(None)
            }
            Some(Entry::Dir(dir)) => Ok(Some(Arc::clone(dir))),
            None => Err(VfsError::not_found(name)),
        }
    }

    fn remove_attr(&self, key: &str, name: &str) -> VfsResult<()> {
        let mut inner = self.inner.write();
        match inner.xattr.get_mut(key).and_then(|attrs| attrs.remove(name)) {
            Some(_) => Ok(()),
            None => Err(VfsError::attribute_not_found(name)),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.read().entries.contains_key(name)
    }

    fn store_file(&self, name: &str, data: &[u8]) -> VfsResult<()> {
        let mut inner = self.inner.write();
        let (old_len, new_node) = match inner.entries.get(name) {
            Some(Entry::File { data, .. }) => (data.len() as i64, 0),
            Some(Entry::Dir(_)) => return Err(VfsError::is_a_directory(name)),
            None => (0, 1),
        };
        self.stats.adjust(data.len() as i64 - old_len, new_node)?;

        let now = SystemTime::now();
        match inner.entries.get_mut(name) {
            Some(Entry::File { data: content, times }) => {
                *content = data.to_vec();
                times.mtime = now;
                times.ctime = now;
            }
            _ => {
                inner.entries.insert(
                    name.to_string(),
                    Entry::File {
                        data: data.to_vec(),
                        times: Times::all(now),
                    },
                );
            }
        }
        Ok(())
    }

    fn remove_file(&self, name: &str) -> VfsResult<()> {
        let mut inner = self.inner.write();
        match inner.entries.get(name) {
            Some(Entry::File { .. }) => {}
            Some(Entry::Dir(_)) => return Err(VfsError::is_a_directory(name)),
            None => return Err(VfsError::not_found(name)),
        }
        if let Some(Entry::File { data, .. }) = inner.entries.remove(name) {
            self.stats.record(-(data.len() as i64), -1);
        }
        inner.xattr.remove(name);
        Ok(())
    }

    /// Install `template`, or a fresh child `MetaDir`, under `name`.
    fn install_dir(&self, name: &str, template: Option<Arc<dyn VirtualDir>>) -> VfsResult<()> {
        if self.exists(name) {
            return Err(VfsError::already_exists(name));
        }
        let dir: Arc<dyn VirtualDir> = match template {
            None => {
                let stats = self.stats.child();
                stats.adjust(0, 1)?;
                Arc::new(MetaDir::from_counted(stats))
            }
            Some(dir) => {
                match dir.usage() {
                    Some(usage) => usage.attach(&self.stats)?,
                    None => self.stats.adjust(0, 1)?,
                }
                dir
            }
        };
        self.inner
            .write()
            .entries
            .insert(name.to_string(), Entry::Dir(dir));
        Ok(())
    }

    /// Drop a child directory entry and its accounting.
    fn remove_dir_entry(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.write();
            if !matches!(inner.entries.get(name), Some(Entry::Dir(_))) {
                return;
            }
            inner.xattr.remove(name);
            inner.entries.remove(name)
        };
        if let Some(Entry::Dir(dir)) = removed {
            match dir.usage() {
                Some(usage) => usage.detach(),
                None => self.stats.record(0, -1),
            }
        }
    }

    /// Attribute map key for a leaf name, or the directory itself.
    fn xattr_key(&self, name: Option<&str>, path: &str) -> VfsResult<String> {
        match name {
            None => Ok(SELF_XATTR.to_string()),
            Some(name) if self.exists(name) => Ok(name.to_string()),
            Some(_) => Err(VfsError::not_found(path)),
        }
    }

    fn copy_xattrs_from(&self, name: &str) -> XattrMap {
        self.inner.read().xattr.get(name).cloned().unwrap_or_default()
    }

    /// Move a file or directory named directly in this directory.
    async fn rename_entry(
        &self,
        ctx: &RequestContext,
        name: &str,
        to: &str,
        target: &dyn VirtualDir,
    ) -> VfsResult<bool> {
        match self.kind(name) {
            Some(Kind::File { .. }) => {
                if !(self.can_delete(ctx, name).await && target.can_write(ctx, to).await) {
                    return Ok(false);
                }
                let data = self.read_file(ctx, name).await?;
                target.write_to(ctx, to, &data).await?;
                for (attr, value) in self.copy_xattrs_from(name) {
                    or_default(target.set_xattr(ctx, to, &attr, &value).await, ())?;
                }
                self.remove_file(name)?;
                Ok(true)
            }
            Some(Kind::Dir(dir)) => {
                // can_rmdir is not checked, it would refuse non-empty directories
                if !(ctx.is_mount_owner() && target.can_mkdir(ctx, to).await) {
                    return Ok(false);
                }
                let usage = dir.usage();
                match &usage {
                    Some(usage) => usage.detach(),
                    None => self.stats.record(0, -1),
                }
                if let Err(e) = target.mkdir(ctx, to, Some(Arc::clone(&dir))).await {
                    match &usage {
                        Some(usage) => usage.attach(&self.stats)?,
                        None => self.stats.record(0, 1),
                    }
                    return if e.is_declined() { Ok(false) } else { Err(e) };
                }
                let attrs = self.copy_xattrs_from(name);
                {
                    let mut inner = self.inner.write();
                    inner.xattr.remove(name);
                    inner.entries.remove(name);
                }
                for (attr, value) in attrs {
                    or_default(target.set_xattr(ctx, to, &attr, &value).await, ())?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl VirtualDir for MetaDir {
    async fn is_directory(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root => true,
            Route::Leaf(name) => matches!(self.kind(&name), Some(Kind::Dir(_))),
            Route::Delegate(dir, rest) => dir.is_directory(ctx, &rest).await,
            Route::Missing => false,
        }
    }

    async fn is_file(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root | Route::Missing => false,
            Route::Leaf(name) => matches!(self.kind(&name), Some(Kind::File { .. })),
            Route::Delegate(dir, rest) => dir.is_file(ctx, &rest).await,
        }
    }

    async fn contents(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<String>> {
        match self.route(path) {
            Route::Root => Ok(self.names()),
            Route::Leaf(name) => match self.kind(&name) {
                Some(Kind::Dir(dir)) => or_default(dir.contents(ctx, "/").await, Vec::new()),
                Some(Kind::File { .. }) => Err(VfsError::not_a_directory(path)),
                None => Err(VfsError::not_found(path)),
            },
            Route::Delegate(dir, rest) => or_default(dir.contents(ctx, &rest).await, Vec::new()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn is_executable(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Delegate(dir, rest) => dir.is_executable(ctx, &rest).await,
            _ => false,
        }
    }

    async fn size(&self, ctx: &RequestContext, path: &str) -> VfsResult<u64> {
        match self.route(path) {
            Route::Root => Ok(0),
            Route::Leaf(name) => match self.kind(&name) {
                Some(Kind::File { len, .. }) => Ok(len),
                Some(Kind::Dir(_)) => Ok(0),
                None => Err(VfsError::not_found(path)),
            },
            Route::Delegate(dir, rest) => or_default(dir.size(ctx, &rest).await, 0),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn times(&self, ctx: &RequestContext, path: &str) -> VfsResult<Times> {
        match self.route(path) {
            Route::Root => Ok(Times::all(self.created)),
            Route::Leaf(name) => match self.kind(&name) {
                Some(Kind::File { times, .. }) => Ok(times),
                Some(Kind::Dir(dir)) => or_default(dir.times(ctx, "/").await, Times::default()),
                None => Err(VfsError::not_found(path)),
            },
            Route::Delegate(dir, rest) => or_default(dir.times(ctx, &rest).await, Times::default()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn read_file(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<u8>> {
        match self.route(path) {
            Route::Root => Err(VfsError::is_a_directory(path)),
            Route::Leaf(name) => match self.kind(&name) {
                Some(Kind::File { .. }) => {
                    self.file_data(&name).ok_or_else(|| VfsError::not_found(path))
                }
                Some(Kind::Dir(_)) => Err(VfsError::is_a_directory(path)),
                None => Err(VfsError::not_found(path)),
            },
            Route::Delegate(dir, rest) => or_default(dir.read_file(ctx, &rest).await, Vec::new()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn can_write(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root | Route::Missing => false,
            Route::Leaf(name) => {
                ctx.is_mount_owner() && !matches!(self.kind(&name), Some(Kind::Dir(_)))
            }
            Route::Delegate(dir, rest) => dir.can_write(ctx, &rest).await,
        }
    }

    async fn write_to(&self, ctx: &RequestContext, path: &str, data: &[u8]) -> VfsResult<()> {
        match self.route(path) {
            Route::Root => Err(VfsError::is_a_directory(path)),
            Route::Leaf(name) => self.store_file(&name, data),
            Route::Delegate(dir, rest) => or_default(dir.write_to(ctx, &rest, data).await, ()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn can_delete(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root | Route::Missing => false,
            Route::Leaf(name) => {
                ctx.is_mount_owner() && matches!(self.kind(&name), Some(Kind::File { .. }))
            }
            Route::Delegate(dir, rest) => dir.can_delete(ctx, &rest).await,
        }
    }

    async fn delete(&self, ctx: &RequestContext, path: &str) -> VfsResult<()> {
        match self.route(path) {
            Route::Root => Err(VfsError::is_a_directory(path)),
            Route::Leaf(name) => self.remove_file(&name),
            Route::Delegate(dir, rest) => or_default(dir.delete(ctx, &rest).await, ()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn can_mkdir(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root | Route::Missing => false,
            Route::Leaf(name) => ctx.is_mount_owner() && !self.exists(&name),
            Route::Delegate(dir, rest) => dir.can_mkdir(ctx, &rest).await,
        }
    }

    async fn mkdir(
        &self,
        ctx: &RequestContext,
        path: &str,
        template: Option<Arc<dyn VirtualDir>>,
    ) -> VfsResult<()> {
        match self.route(path) {
            Route::Root => Err(VfsError::already_exists(path)),
            Route::Leaf(name) => self.install_dir(&name, template),
            Route::Delegate(dir, rest) => {
                if template.is_some() {
                    // a declined explicit object is reported to the caller
                    dir.mkdir(ctx, &rest, template).await
                } else {
                    or_default(dir.mkdir(ctx, &rest, None).await, ())
                }
            }
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn can_rmdir(&self, ctx: &RequestContext, path: &str) -> bool {
        match self.route(path) {
            Route::Root | Route::Missing => false,
            Route::Leaf(name) => {
                if !ctx.is_mount_owner() {
                    return false;
                }
                match self.kind(&name) {
                    Some(Kind::Dir(dir)) => dir
                        .contents(ctx, "/")
                        .await
                        .map(|names| names.is_empty())
                        .unwrap_or(true),
                    _ => false,
                }
            }
            Route::Delegate(dir, rest) => dir.can_rmdir(ctx, &rest).await,
        }
    }

    async fn rmdir(&self, ctx: &RequestContext, path: &str) -> VfsResult<()> {
        match self.route(path) {
            Route::Root => Err(VfsError::permission_denied("cannot remove root")),
            Route::Leaf(name) => {
                let dir = match self.kind(&name) {
                    Some(Kind::Dir(dir)) => dir,
                    Some(Kind::File { .. }) => return Err(VfsError::not_a_directory(path)),
                    None => return Err(VfsError::not_found(path)),
                };
                if !or_default(dir.contents(ctx, "/").await, Vec::new())?.is_empty() {
                    return Err(VfsError::directory_not_empty(path));
                }
                self.remove_dir_entry(&name);
                Ok(())
            }
            Route::Delegate(dir, rest) => or_default(dir.rmdir(ctx, &rest).await, ()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn touch(&self, ctx: &RequestContext, path: &str, mtime: SystemTime) -> VfsResult<()> {
        match self.route(path) {
            Route::Root => Ok(()),
            Route::Leaf(name) => match self.touch_entry(&name, mtime)? {
                Some(dir) => or_default(dir.touch(ctx, "/", mtime).await, ()),
                None => Ok(()),
            },
            Route::Delegate(dir, rest) => or_default(dir.touch(ctx, &rest, mtime).await, ()),
            Route::Missing => Err(VfsError::not_found(path)),
        }
    }

    async fn rename(
        &self,
        ctx: &RequestContext,
        from: &str,
        to: &str,
        owner: Option<&dyn VirtualDir>,
    ) -> VfsResult<bool> {
        // an owner equal to ourselves is the same as no owner
        let owner = owner.filter(|o| !std::ptr::addr_eq(*o, self));

        let Some((from_head, from_rest)) = path::split_path(from) else {
            return Err(VfsError::permission_denied("cannot move root"));
        };
        if owner.is_none() && path::is_within(to, from) {
            return Err(VfsError::invalid_argument(format!("cannot move {from} into itself")));
        }

        let Some(from_rest) = from_rest else {
            let target: &dyn VirtualDir = owner.unwrap_or(self);
            return self.rename_entry(ctx, from_head, to, target).await;
        };

        let Some(Kind::Dir(subdir)) = self.kind(from_head) else {
            return Ok(false);
        };

        let result = match owner {
            Some(owner) => subdir.rename(ctx, &from_rest, to, Some(owner)).await,
            None => match path::split_path(to) {
                Some((to_head, Some(to_rest))) if to_head == from_head => {
                    subdir.rename(ctx, &from_rest, &to_rest, None).await
                }
                Some((to_head, None)) if to_head == from_head => return Ok(false),
                _ => {
                    // moving out of the subdirectory: the destination is
                    // inserted at this level, so authorise it here
                    let allowed = if self.is_file(ctx, to).await {
                        self.can_write(ctx, to).await
                    } else {
                        self.can_mkdir(ctx, to).await
                    };
                    if !allowed {
                        return Ok(false);
                    }
                    subdir
                        .rename(ctx, &from_rest, to, Some(self as &dyn VirtualDir))
                        .await
                }
            },
        };
        or_default(result, false)
    }

    async fn raw_open(
        &self,
        ctx: &RequestContext,
        path: &str,
        mode: RawMode,
    ) -> VfsResult<Option<RawHandle>> {
        match self.route(path) {
            Route::Delegate(dir, rest) => or_default(dir.raw_open(ctx, &rest, mode).await, None),
            _ => Ok(None),
        }
    }

    async fn raw_read(
        &self,
        ctx: &RequestContext,
        path: &str,
        offset: u64,
        size: u32,
        handle: RawHandle,
    ) -> VfsResult<Vec<u8>> {
        match self.route(path) {
            Route::Delegate(dir, rest) => dir.raw_read(ctx, &rest, offset, size, handle).await,
            _ => Ok(Vec::new()),
        }
    }

    async fn raw_write(
        &self,
        ctx: &RequestContext,
        path: &str,
        offset: u64,
        data: &[u8],
        handle: RawHandle,
    ) -> VfsResult<usize> {
        match self.route(path) {
            Route::Delegate(dir, rest) => dir.raw_write(ctx, &rest, offset, data, handle).await,
            _ => Ok(0),
        }
    }

    async fn raw_truncate(
        &self,
        ctx: &RequestContext,
        path: &str,
        len: u64,
        handle: Option<RawHandle>,
    ) -> VfsResult<bool> {
        match self.route(path) {
            Route::Delegate(dir, rest) => {
                or_default(dir.raw_truncate(ctx, &rest, len, handle).await, false)
            }
            _ => Ok(false),
        }
    }

    async fn raw_sync(
        &self,
        ctx: &RequestContext,
        path: &str,
        datasync: bool,
        handle: RawHandle,
    ) -> VfsResult<()> {
        match self.route(path) {
            Route::Delegate(dir, rest) => {
                or_default(dir.raw_sync(ctx, &rest, datasync, handle).await, ())
            }
            _ => Ok(()),
        }
    }

    async fn raw_close(&self, ctx: &RequestContext, path: &str, handle: RawHandle) -> VfsResult<()> {
        match self.route(path) {
            Route::Delegate(dir, rest) => or_default(dir.raw_close(ctx, &rest, handle).await, ()),
            _ => Ok(()),
        }
    }

    async fn xattr(&self, ctx: &RequestContext, path: &str) -> VfsResult<XattrMap> {
        let name = match self.route(path) {
            Route::Root => None,
            Route::Leaf(name) => Some(name),
            Route::Delegate(dir, rest) => {
                return or_default(dir.xattr(ctx, &rest).await, XattrMap::new());
            }
            Route::Missing => return Err(VfsError::not_found(path)),
        };
        let key = self.xattr_key(name.as_deref(), path)?;
        Ok(self.copy_xattrs_from(&key))
    }

    async fn set_xattr(
        &self,
        ctx: &RequestContext,
        path: &str,
        name: &str,
        value: &[u8],
    ) -> VfsResult<()> {
        let entry = match self.route(path) {
            Route::Root => None,
            Route::Leaf(entry) => Some(entry),
            Route::Delegate(dir, rest) => {
                return or_default(dir.set_xattr(ctx, &rest, name, value).await, ());
            }
            Route::Missing => return Err(VfsError::not_found(path)),
        };
        let key = self.xattr_key(entry.as_deref(), path)?;
        if !ctx.is_mount_owner() {
            return Err(VfsError::permission_denied(path));
        }
        self.inner
            .write()
            .xattr
            .entry(key)
            .or_default()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove_xattr(&self, ctx: &RequestContext, path: &str, name: &str) -> VfsResult<()> {
        let entry = match self.route(path) {
            Route::Root => None,
            Route::Leaf(entry) => Some(entry),
            Route::Delegate(dir, rest) => {
                return or_default(dir.remove_xattr(ctx, &rest, name).await, ());
            }
            Route::Missing => return Err(VfsError::not_found(path)),
        };
        let key = self.xattr_key(entry.as_deref(), path)?;
        if !ctx.is_mount_owner() {
            return Err(VfsError::permission_denied(path));
        }
        self.remove_attr(&key, name)
    }

    async fn statistics(&self, ctx: &RequestContext, path: &str) -> VfsResult<Statistics> {
        match self.route(path) {
            Route::Leaf(name) => match self.kind(&name) {
                // a subdirectory reports its own subtree
                Some(Kind::Dir(dir)) => {
                    or_default(dir.statistics(ctx, "/").await, Statistics::default())
                }
                _ => Ok(self.stats.statistics()),
            },
            Route::Delegate(dir, rest) => {
                or_default(dir.statistics(ctx, &rest).await, Statistics::default())
            }
            Route::Root | Route::Missing => Ok(self.stats.statistics()),
        }
    }

    fn usage(&self) -> Option<Arc<UsageStats>> {
        Some(Arc::clone(&self.stats))
    }

    async fn mounted(&self) {
        for dir in self.subdirs() {
            dir.mounted().await;
        }
    }

    async fn unmounted(&self) {
        for dir in self.subdirs() {
            dir.unmounted().await;
        }
    }
}

impl MetaDir {
    fn subdirs(&self) -> Vec<Arc<dyn VirtualDir>> {
        self.inner
            .read()
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Dir(dir) => Some(Arc::clone(dir)),
                Entry::File { .. } => None,
            })
            .collect()
    }
}
