//! End-to-end behaviour of in-memory trees through the dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use metafs_kernel::{
    Dispatcher, Identity, MetaDir, MountConfig, OpenFlags, RequestContext, Session, VfsError,
    VfsResult, VirtualDir,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn owner() -> RequestContext {
    RequestContext::owner(Identity::new(1000, 1000))
}

/// Flat file store that counts write-backs and declines native renames.
#[derive(Default)]
struct FileStore {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl FileStore {
    fn with_file(path: &str, data: &[u8]) -> Self {
        let store = Self::default();
        store.files.lock().insert(path.to_string(), data.to_vec());
        store
    }
}

#[async_trait]
impl VirtualDir for FileStore {
    async fn is_directory(&self, _ctx: &RequestContext, path: &str) -> bool {
        path == "/"
    }

    async fn is_file(&self, _ctx: &RequestContext, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    async fn contents(&self, _ctx: &RequestContext, _path: &str) -> VfsResult<Vec<String>> {
        Ok(self
            .files
            .lock()
            .keys()
            .map(|p| p.trim_start_matches('/').to_string())
            .collect())
    }

    async fn read_file(&self, _ctx: &RequestContext, path: &str) -> VfsResult<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn can_write(&self, _ctx: &RequestContext, _path: &str) -> bool {
        true
    }

    async fn write_to(&self, _ctx: &RequestContext, path: &str, data: &[u8]) -> VfsResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn can_delete(&self, _ctx: &RequestContext, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    async fn delete(&self, _ctx: &RequestContext, path: &str) -> VfsResult<()> {
        self.files.lock().remove(path);
        Ok(())
    }
}

#[tokio::test]
async fn nested_directories_hold_written_files() {
    init_tracing();
    let ctx = owner();
    let root = MetaDir::new();

    root.mkdir(&ctx, "/a", None).await.unwrap();
    root.mkdir(&ctx, "/a/b", None).await.unwrap();
    root.write_to(&ctx, "/a/b/f.txt", b"hello").await.unwrap();

    assert_eq!(root.contents(&ctx, "/a").await.unwrap(), vec!["b"]);
    assert_eq!(root.contents(&ctx, "/a/b").await.unwrap(), vec!["f.txt"]);
    assert_eq!(root.size(&ctx, "/a/b/f.txt").await.unwrap(), 5);
    assert_eq!(root.read_file(&ctx, "/a/b/f.txt").await.unwrap(), b"hello");

    for path in ["/", "/a", "/a/b", "/a/b/f.txt", "/a/missing"] {
        let dir = root.is_directory(&ctx, path).await;
        let file = root.is_file(&ctx, path).await;
        assert!(!(dir && file), "{path} is both a file and a directory");
    }
}

#[tokio::test]
async fn usage_matches_live_content() {
    let ctx = owner();
    let root = MetaDir::new();
    root.mkdir(&ctx, "/docs", None).await.unwrap();
    root.write_to(&ctx, "/docs/one", b"12345").await.unwrap();
    root.write_to(&ctx, "/docs/two", b"123").await.unwrap();
    root.write_to(&ctx, "/docs/one", b"1").await.unwrap();
    root.delete(&ctx, "/docs/two").await.unwrap();
    root.write_to(&ctx, "/top", b"xy").await.unwrap();

    let all = root.statistics(&ctx, "/").await.unwrap();
    assert_eq!(all.used_space, 3);
    // root, docs, docs/one, top
    assert_eq!(all.used_nodes, 4);

    let docs = root.statistics(&ctx, "/docs").await.unwrap();
    assert_eq!(docs.used_space, 1);
}

#[tokio::test]
async fn mount_options_enforce_strict_quota() {
    let ctx = owner();
    let config = MountConfig::from_mount_options("max_space=4096,max_nodes=3,strict_quota").unwrap();
    let root = Arc::new(MetaDir::from_config(&config));
    let d = Dispatcher::new(root.clone());

    d.mkdir(&ctx, "/docs", 0o755).await.unwrap();
    root.write_to(&ctx, "/docs/a", &[7u8; 4000]).await.unwrap();

    let err = root.write_to(&ctx, "/docs/b", &[7u8; 200]).await.unwrap_err();
    assert!(matches!(err, VfsError::NoSpace(_)));
    let err = d.truncate(&ctx, "/docs/a", 5000).await.unwrap_err();
    assert_eq!(err.errno(), rustix::io::Errno::NOSPC);
    assert_eq!(root.size(&ctx, "/docs/a").await.unwrap(), 4000);

    // root, docs and a fill the node quota
    let err = d.mkdir(&ctx, "/more", 0o755).await.unwrap_err();
    assert!(matches!(err, VfsError::NoSpace(_)));

    let vfs = d.statfs(&ctx, "/").await.unwrap();
    assert_eq!(vfs.blocks, 4);
    assert_eq!(vfs.files, 3);
    assert_eq!(vfs.ffree, 0);

    // without strict_quota the limits are only reported
    let lenient = MetaDir::from_config(&MountConfig::from_mount_options("max_space=4").unwrap());
    lenient.write_to(&ctx, "/big", &[0u8; 64]).await.unwrap();
    assert_eq!(lenient.statistics(&ctx, "/").await.unwrap().max_space, Some(4));
}

#[tokio::test]
async fn rename_preserves_subtree_and_xattrs() {
    let ctx = owner();
    let root = MetaDir::new();
    root.mkdir(&ctx, "/src", None).await.unwrap();
    root.mkdir(&ctx, "/src/tree", None).await.unwrap();
    root.mkdir(&ctx, "/src/tree/deep", None).await.unwrap();
    root.write_to(&ctx, "/src/tree/deep/leaf", b"leaf").await.unwrap();
    root.set_xattr(&ctx, "/src/tree/deep/leaf", "user.tag", b"green")
        .await
        .unwrap();
    root.mkdir(&ctx, "/dst", None).await.unwrap();

    // same directory
    assert!(root.rename(&ctx, "/src/tree", "/src/moved", None).await.unwrap());
    // across subtrees
    assert!(root.rename(&ctx, "/src/moved", "/dst/tree", None).await.unwrap());

    assert!(!root.is_directory(&ctx, "/src/moved").await);
    assert_eq!(root.read_file(&ctx, "/dst/tree/deep/leaf").await.unwrap(), b"leaf");
    let attrs = root.xattr(&ctx, "/dst/tree/deep/leaf").await.unwrap();
    assert_eq!(attrs.get("user.tag").map(Vec::as_slice), Some(&b"green"[..]));
}

#[tokio::test]
async fn declined_delegated_rename_reports_failure() {
    let ctx = owner();
    let root = MetaDir::new();
    let store = Arc::new(FileStore::with_file("/file1", b"payload"));
    root.mkdir(&ctx, "/a", Some(store.clone() as Arc<dyn VirtualDir>))
        .await
        .unwrap();
    root.mkdir(&ctx, "/b", None).await.unwrap();

    let moved = root.rename(&ctx, "/a/file1", "/b/file2", None).await.unwrap();
    assert!(!moved);
    assert!(root.is_file(&ctx, "/a/file1").await);
    assert!(!root.is_file(&ctx, "/b/file2").await);
}

#[tokio::test]
async fn dispatcher_falls_back_to_copy_and_delete() {
    let ctx = owner();
    let root = Arc::new(MetaDir::new());
    let store = Arc::new(FileStore::with_file("/file1", b"payload"));
    root.mkdir(&ctx, "/a", Some(store.clone() as Arc<dyn VirtualDir>))
        .await
        .unwrap();
    root.mkdir(&ctx, "/b", None).await.unwrap();

    let d = Dispatcher::new(root.clone());
    d.rename(&ctx, "/a/file1", "/b/file2").await.unwrap();

    assert_eq!(root.read_file(&ctx, "/b/file2").await.unwrap(), b"payload");
    assert!(!store.files.lock().contains_key("/file1"));

    // directories are not copied
    root.mkdir(&ctx, "/b/sub", None).await.unwrap();
    let stranger = ctx.as_caller(Identity::new(2000, 2000));
    let err = d.rename(&stranger, "/b/sub", "/a/sub").await.unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));
}

#[tokio::test]
async fn flush_twice_writes_back_once() {
    let ctx = owner();
    let store = Arc::new(FileStore::with_file("/f", b"old"));
    let d = Dispatcher::new(store.clone());

    let fh = d.open(&ctx, "/f", OpenFlags::read_write()).await.unwrap();
    assert_eq!(d.read(&ctx, fh, 0, 100).await.unwrap(), b"old");
    d.write(&ctx, fh, 0, b"new").await.unwrap();
    d.flush(&ctx, fh).await.unwrap();
    d.flush(&ctx, fh).await.unwrap();
    d.release(&ctx, fh).await.unwrap();

    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert_eq!(store.files.lock().get("/f").map(Vec::as_slice), Some(&b"new"[..]));
}

#[tokio::test]
async fn getattr_lists_delegated_files() {
    let ctx = owner();
    let root = Arc::new(MetaDir::new());
    let store = Arc::new(FileStore::with_file("/inside", b"1234"));
    root.mkdir(&ctx, "/store", Some(store as Arc<dyn VirtualDir>))
        .await
        .unwrap();
    let d = Dispatcher::new(root);

    let names: Vec<String> = d
        .readdir(&ctx, "/store")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "inside"]);

    let stat = d.getattr(&ctx, "/store/inside").await.unwrap();
    assert!(stat.is_file());
    assert_eq!(stat.size, 4);
    assert_eq!(stat.perm, 0o666);
}

#[tokio::test]
async fn session_rejects_requests_after_stop() {
    let session = Session::with_owner(Arc::new(MetaDir::new()), Identity::new(1000, 1000));
    session.start().await.unwrap();
    let ctx = session.context(1000, 1000);
    session.dispatcher().mkdir(&ctx, "/d", 0o755).await.unwrap();

    session.stop().await;
    let err = session.dispatcher().mkdir(&ctx, "/e", 0o755).await.unwrap_err();
    assert_eq!(err.errno(), rustix::io::Errno::INTR);
}
