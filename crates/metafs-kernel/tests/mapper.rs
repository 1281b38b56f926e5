//! Path-mapped filesystems backed by real files and SQLite.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use metafs_kernel::{
    Dispatcher, Identity, MapOptions, MappedRow, MapperConfig, MountConfig, OpenFlags,
    PathMapperFs, RawMode, RequestContext, Session, SqliteScanner, VfsError, VirtualDir,
};

fn owner() -> RequestContext {
    RequestContext::owner(Identity::new(1000, 1000))
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn mapped_file_is_evicted_once_backing_file_is_gone() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("x.txt");
    std::fs::write(&real, b"abc").unwrap();

    let fs = PathMapperFs::new(MapperConfig::default());
    fs.map_file(&real, "/t/x", MapOptions::new()).unwrap();
    fs.map_dir("/inbox", MapOptions::new()).unwrap();

    assert_eq!(fs.unmap("/t/x"), Some(real.clone()));
    assert_eq!(fs.size(&ctx, "/t/x").await.unwrap(), 3);
    assert!(fs.is_directory(&ctx, "/t").await);
    assert_eq!(fs.read_file(&ctx, "/t/x").await.unwrap(), b"abc");

    std::fs::remove_file(&real).unwrap();
    let removed = fs.cleanup(|node| node.real_path().is_some_and(|p| !p.exists()));
    assert_eq!(removed, 2);
    assert!(!fs.is_mapped("/t/x"));
    assert!(!fs.is_mapped("/t"));
    // empty before the pass, so not swept
    assert!(fs.is_directory(&ctx, "/inbox").await);
    assert!(fs.is_directory(&ctx, "/").await);
    assert_eq!(fs.cleanup(|_| true), 0);
    assert!(fs.is_mapped("/inbox"));
}

#[tokio::test]
async fn raw_writes_update_size_once_at_close() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("data.bin");
    std::fs::write(&real, b"").unwrap();

    let fs = PathMapperFs::new(MapperConfig {
        use_raw_file_access: true,
        allow_write: true,
    });
    fs.map_file(&real, "/data.bin", MapOptions::new()).unwrap();
    let stats = fs.usage().unwrap();

    let handle = fs
        .raw_open(&ctx, "/data.bin", RawMode::parse("rw").unwrap())
        .await
        .unwrap()
        .expect("raw access enabled");
    assert_eq!(fs.raw_write(&ctx, "/data.bin", 0, b"hello", handle).await.unwrap(), 5);
    assert_eq!(fs.raw_write(&ctx, "/data.bin", 5, b"world", handle).await.unwrap(), 5);
    assert_eq!(stats.used_space(), 0);

    fs.raw_close(&ctx, "/data.bin", handle).await.unwrap();
    assert_eq!(stats.used_space(), 10);
    assert_eq!(std::fs::read(&real).unwrap(), b"helloworld");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_and_truncates_refresh_size() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("notes.txt");
    std::fs::write(&real, b"abc").unwrap();

    let fs = Arc::new(PathMapperFs::new(MapperConfig {
        use_raw_file_access: false,
        allow_write: true,
    }));
    fs.map_file(&real, "/notes.txt", MapOptions::new()).unwrap();
    let stats = fs.usage().unwrap();
    assert_eq!(stats.used_space(), 3);

    fs.write_to(&ctx, "/notes.txt", b"a longer note").await.unwrap();
    assert_eq!(stats.used_space(), 13);

    let d = Dispatcher::new(fs.clone());
    d.truncate(&ctx, "/notes.txt", 4).await.unwrap();
    assert_eq!(stats.used_space(), 4);
    assert_eq!(std::fs::read(&real).unwrap(), b"a lo");

    // a remapped node keeps the size of its new backing file
    let other = dir.path().join("other.txt");
    std::fs::write(&other, b"xy").unwrap();
    fs.map_file(&other, "/notes.txt", MapOptions::new()).unwrap();
    assert_eq!(stats.used_space(), 2);
    assert_eq!(fs.size(&ctx, "/notes.txt").await.unwrap(), 2);
}

#[tokio::test]
async fn dispatcher_uses_raw_handles() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("log.txt");
    std::fs::write(&real, b"0123456789").unwrap();

    let fs = Arc::new(PathMapperFs::new(MapperConfig {
        use_raw_file_access: true,
        allow_write: true,
    }));
    fs.map_file(&real, "/logs/log.txt", MapOptions::new()).unwrap();
    let d = Dispatcher::new(fs.clone());

    let fh = d.open(&ctx, "/logs/log.txt", OpenFlags::read_write()).await.unwrap();
    assert_eq!(d.read(&ctx, fh, 2, 3).await.unwrap(), b"234");
    d.write(&ctx, fh, 10, b"ab").await.unwrap();
    d.ftruncate(&ctx, fh, 11).await.unwrap();
    d.fsync(&ctx, fh, true).await.unwrap();
    d.release(&ctx, fh).await.unwrap();

    assert_eq!(std::fs::read(&real).unwrap(), b"0123456789a");
    assert_eq!(d.getattr(&ctx, "/logs/log.txt").await.unwrap().size, 11);
    let statfs = d.statfs(&ctx, "/").await.unwrap();
    // root, logs, log.txt
    assert_eq!(statfs.files, 3);
}

#[tokio::test]
async fn mount_options_set_reported_quota() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("big.bin");
    std::fs::write(&real, vec![0u8; 3072]).unwrap();

    let config =
        MountConfig::from_mount_options("use_raw_file_access,max_space=2048,max_nodes=8").unwrap();
    let fs = Arc::new(PathMapperFs::from_config(&config));
    assert!(fs.use_raw_file_access());
    assert!(!fs.allow_write());
    fs.map_file(&real, "/big.bin", MapOptions::new()).unwrap();

    let d = Dispatcher::new(fs);
    let vfs = d.statfs(&ctx, "/").await.unwrap();
    assert_eq!(vfs.blocks, 2);
    assert_eq!(vfs.bfree, 0);
    assert_eq!(vfs.files, 8);
    assert_eq!(vfs.ffree, 6);
}

#[tokio::test]
async fn read_only_mapping_refuses_writes() {
    let ctx = owner();
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("ro.txt");
    std::fs::write(&real, b"keep").unwrap();

    let fs = Arc::new(PathMapperFs::new(MapperConfig {
        use_raw_file_access: false,
        allow_write: true,
    }));
    fs.map_dir("/locked", MapOptions::new().with(metafs_kernel::READ_ONLY, true))
        .unwrap();
    fs.map_file(&real, "/locked/ro.txt", MapOptions::new()).unwrap();
    let d = Dispatcher::new(fs);

    assert_eq!(d.getattr(&ctx, "/locked/ro.txt").await.unwrap().perm, 0o444);
    let err = d
        .open(&ctx, "/locked/ro.txt", OpenFlags::write_only())
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));
    assert_eq!(std::fs::read(&real).unwrap(), b"keep");
}

fn create_db(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE tracks (path TEXT NOT NULL, file TEXT NOT NULL);")
        .unwrap();
    conn
}

#[tokio::test]
async fn sqlite_rescan_follows_database() {
    let dir = tempfile::tempdir().unwrap();
    let one = dir.path().join("one.flac");
    let two = dir.path().join("two.flac");
    std::fs::write(&one, b"1").unwrap();
    std::fs::write(&two, b"22").unwrap();

    let db_path = dir.path().join("library.db");
    let conn = create_db(&db_path);
    conn.execute(
        "INSERT INTO tracks VALUES ('/album/one.flac', ?1)",
        [one.to_str().unwrap()],
    )
    .unwrap();

    let config = MountConfig::from_mount_options("nowatch,busy_timeout=2000").unwrap();
    assert!(!config.scan.watch);
    let scanner = SqliteScanner::new(&db_path, "SELECT path, file FROM tracks", |row| {
        let path: String = row.get(0)?;
        let file: String = row.get(1)?;
        Ok(Some(MappedRow::new(path, file)))
    });

    let fs = Arc::new(PathMapperFs::from_config(&config).with_scanner(scanner, &config.scan));
    fs.map_file(&two, "/manual/two.flac", MapOptions::new()).unwrap();

    let session = Session::with_owner(fs.clone(), Identity::new(1000, 1000));
    session.start().await.unwrap();
    let scan = Arc::clone(fs.scan_loop().unwrap());
    wait_for("first scan", || scan.passes() >= 1).await;
    assert!(fs.is_mapped("/album/one.flac"));

    conn.execute("DELETE FROM tracks", []).unwrap();
    conn.execute(
        "INSERT INTO tracks VALUES ('/album/two.flac', ?1)",
        [two.to_str().unwrap()],
    )
    .unwrap();
    scan.trigger();
    wait_for("rescan", || scan.passes() >= 2).await;

    assert!(!fs.is_mapped("/album/one.flac"));
    assert!(fs.is_mapped("/album/two.flac"));
    // entries mapped by hand are not scan-owned
    assert!(fs.is_mapped("/manual/two.flac"));

    let ctx = session.context(1000, 1000);
    let d = session.dispatcher();
    let fh = d.open(&ctx, "/album/two.flac", OpenFlags::read_only()).await.unwrap();
    assert_eq!(d.read(&ctx, fh, 0, 16).await.unwrap(), b"22");
    d.release(&ctx, fh).await.unwrap();

    session.stop().await;
    assert!(!scan.is_running());
}
