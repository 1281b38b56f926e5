//! Native extended attributes of backing files.
//!
//! The syscalls are blocking, so each call runs on the blocking pool.

use std::path::{Path, PathBuf};

use rustix::fs::XattrFlags;
use rustix::io::Errno;

use crate::error::{VfsError, VfsResult};
use crate::types::XattrMap;

fn to_vfs(err: Errno, name: &str) -> VfsError {
    match err {
        Errno::NODATA => VfsError::attribute_not_found(name),
        Errno::NOTSUP => VfsError::not_supported(format!("xattr {name}")),
        e => VfsError::Io(e.into()),
    }
}

async fn blocking<T, F>(f: F) -> VfsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> VfsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VfsError::other(format!("xattr task failed: {e}")))?
}

fn list_names(path: &Path) -> Result<Vec<String>, Errno> {
    loop {
        let len = rustix::fs::listxattr(path, &mut [])?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf: Vec<u8> = vec![0; len];
        match rustix::fs::listxattr(path, &mut buf) {
            Ok(n) => {
                let bytes: Vec<u8> = buf[..n].iter().map(|&c| c as u8).collect();
                return Ok(bytes
                    .split(|&b| b == 0)
                    .filter(|name| !name.is_empty())
                    .map(|name| String::from_utf8_lossy(name).into_owned())
                    .collect());
            }
            // the list grew between the two calls
            Err(Errno::RANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn get_value(path: &Path, name: &str) -> Result<Vec<u8>, Errno> {
    loop {
        let len = rustix::fs::getxattr(path, name, &mut [])?;
        let mut buf = vec![0u8; len];
        match rustix::fs::getxattr(path, name, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(Errno::RANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// All native attributes of `path`.
///
/// A filesystem without xattr support reports an empty map.
pub async fn list(path: PathBuf) -> VfsResult<XattrMap> {
    blocking(move || {
        let names = match list_names(&path) {
            Ok(names) => names,
            Err(Errno::NOTSUP) => return Ok(XattrMap::new()),
            Err(e) => return Err(VfsError::Io(e.into())),
        };
        let mut map = XattrMap::new();
        for name in names {
            match get_value(&path, &name) {
                Ok(value) => {
                    map.insert(name, value);
                }
                // removed since listing
                Err(Errno::NODATA) => {}
                Err(e) => return Err(to_vfs(e, &name)),
            }
        }
        Ok(map)
    })
    .await
}

pub async fn set(path: PathBuf, name: String, value: Vec<u8>) -> VfsResult<()> {
    blocking(move || {
        rustix::fs::setxattr(&path, name.as_str(), &value, XattrFlags::empty())
            .map_err(|e| to_vfs(e, &name))
    })
    .await
}

pub async fn remove(path: PathBuf, name: String) -> VfsResult<()> {
    blocking(move || rustix::fs::removexattr(&path, name.as_str()).map_err(|e| to_vfs(e, &name)))
        .await
}
