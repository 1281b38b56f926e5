//! Core VFS types.
//!
//! These are the values that cross the virtual-directory contract and the
//! dispatch boundary: attributes, usage figures, open modes and raw tokens.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use rustix::fs::OFlags;
use serde::{Deserialize, Serialize};

use crate::context::Identity;

/// Block size used when converting usage figures to statvfs blocks.
pub const BLOCK_SIZE: u64 = 1024;

/// Maximum name length reported by statfs.
pub const NAME_MAX: u32 = 255;

/// Extended attributes of a single path, sorted by name.
pub type XattrMap = BTreeMap<String, Vec<u8>>;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    fn raw_format(&self) -> u32 {
        let kind = match self {
            FileType::File => rustix::fs::FileType::RegularFile,
            FileType::Directory => rustix::fs::FileType::Directory,
        };
        kind.as_raw_mode() as u32
    }
}

/// Returns true if `mode` carries the regular-file format bits.
pub fn is_regular_mode(mode: u32) -> bool {
    rustix::fs::FileType::from_raw_mode(mode as rustix::fs::RawMode)
        == rustix::fs::FileType::RegularFile
}

/// Access, modification and change times of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Times {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Default for Times {
    fn default() -> Self {
        Self::all(SystemTime::UNIX_EPOCH)
    }
}

impl Times {
    /// All three timestamps set to `t`.
    pub fn all(t: SystemTime) -> Self {
        Self {
            atime: t,
            mtime: t,
            ctime: t,
        }
    }
}

/// File attributes as reported by getattr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// File type.
    pub kind: FileType,
    /// Permission bits (e.g. 0o644), without the format bits.
    pub perm: u32,
    /// Size in bytes.
    pub size: u64,
    /// Number of hard links.
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub times: Times,
}

impl Stat {
    /// Attributes for a directory.
    ///
    /// nlink is 1 for directories so that `find` does not try to use the
    /// link count to skip subdirectories.
    pub fn directory(perm: u32, owner: Identity, times: Times) -> Self {
        Self {
            kind: FileType::Directory,
            perm,
            size: 0,
            nlink: 1,
            uid: owner.uid,
            gid: owner.gid,
            times,
        }
    }

    /// Attributes for a regular file.
    pub fn file(perm: u32, size: u64, owner: Identity, times: Times) -> Self {
        Self {
            kind: FileType::File,
            perm,
            size,
            nlink: 1,
            uid: owner.uid,
            gid: owner.gid,
            times,
        }
    }

    /// Full `st_mode`: format bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.raw_format() | (self.perm & 0o7777)
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type, if known.
    pub kind: Option<FileType>,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: Option<FileType>) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Usage figures reported by a filesystem for df-style output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Bytes in use.
    pub used_space: u64,
    /// Files plus directories in use.
    pub used_nodes: u64,
    /// Total space, if a quota is configured.
    pub max_space: Option<u64>,
    /// Total nodes, if a quota is configured.
    pub max_nodes: Option<u64>,
}

impl Statistics {
    /// Convert to block-based statvfs fields.
    ///
    /// Missing totals default to the used values, which reports the
    /// filesystem as full and signals that no quota is configured.
    pub fn to_statvfs(&self) -> StatFs {
        let total_space = self.max_space.unwrap_or(self.used_space);
        let total_nodes = self.max_nodes.unwrap_or(self.used_nodes);
        let free = total_space.saturating_sub(self.used_space) / BLOCK_SIZE;
        StatFs {
            blocks: total_space / BLOCK_SIZE,
            bfree: free,
            bavail: free,
            files: total_nodes,
            ffree: total_nodes.saturating_sub(self.used_nodes),
            bsize: BLOCK_SIZE as u32,
            frsize: BLOCK_SIZE as u32,
            namelen: NAME_MAX,
        }
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Fragment size.
    pub frsize: u32,
    /// Maximum name length.
    pub namelen: u32,
}

/// Open file flags, decoded from the raw `open(2)` flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Truncate on open.
    pub truncate: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate: false,
        }
    }
}

impl OpenFlags {
    /// Decode kernel open flags.
    ///
    /// Append only counts when the handle is opened for writing.
    pub fn from_bits(bits: u32) -> Self {
        let flags = OFlags::from_bits_retain(bits);
        let access = bits & (OFlags::WRONLY.bits() | OFlags::RDWR.bits());
        let (read, write) = if access == OFlags::RDWR.bits() {
            (true, true)
        } else if access == OFlags::WRONLY.bits() {
            (false, true)
        } else {
            (true, false)
        };
        Self {
            read,
            write,
            append: write && flags.contains(OFlags::APPEND),
            truncate: flags.contains(OFlags::TRUNC),
        }
    }

    /// Read-only access.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Write-only access.
    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            ..Default::default()
        }
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Write access in append mode.
    pub fn append() -> Self {
        Self {
            read: false,
            write: true,
            append: true,
            ..Default::default()
        }
    }

    /// The raw mode offered to `raw_open`.
    pub fn raw_mode(&self) -> RawMode {
        RawMode {
            read: self.read,
            write: self.write,
            append: self.append,
        }
    }
}

/// Access mode handed to `raw_open`.
///
/// Renders as `r`, `ra`, `rw`, `rwa`, `w` or `wa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
}

impl RawMode {
    /// Read-only raw mode.
    pub const READ: RawMode = RawMode {
        read: true,
        write: false,
        append: false,
    };

    /// Parse a mode string such as `rw` or `wa`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "r" => Some(Self::READ),
            "ra" => Some(RawMode {
                append: true,
                ..Self::READ
            }),
            "rw" => Some(RawMode {
                read: true,
                write: true,
                append: false,
            }),
            "rwa" => Some(RawMode {
                read: true,
                write: true,
                append: true,
            }),
            "w" => Some(RawMode {
                read: false,
                write: true,
                append: false,
            }),
            "wa" => Some(RawMode {
                read: false,
                write: true,
                append: true,
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match (self.read, self.write, self.append) {
            (true, false, false) => "r",
            (true, false, true) => "ra",
            (true, true, false) => "rw",
            (true, true, true) => "rwa",
            (false, true, false) => "w",
            (false, true, true) => "wa",
            (false, false, _) => "r",
        }
    }
}

impl fmt::Display for RawMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token returned by a filesystem's `raw_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statvfs_conversion() {
        let stats = Statistics {
            used_space: 1000 * 1024,
            used_nodes: 5,
            max_space: Some(1200 * 1024),
            max_nodes: Some(12),
        };
        let vfs = stats.to_statvfs();
        assert_eq!(vfs.bsize, 1024);
        assert_eq!(vfs.blocks, 1200);
        assert_eq!(vfs.bfree, 200);
        assert_eq!(vfs.bavail, 200);
        assert_eq!(vfs.files, 12);
        assert_eq!(vfs.ffree, 7);
    }

    #[test]
    fn test_statvfs_without_quota_is_full() {
        let stats = Statistics {
            used_space: 4096,
            used_nodes: 3,
            ..Default::default()
        };
        let vfs = stats.to_statvfs();
        assert_eq!(vfs.blocks, 4);
        assert_eq!(vfs.bfree, 0);
        assert_eq!(vfs.files, 3);
        assert_eq!(vfs.ffree, 0);
    }

    #[test]
    fn test_open_flags_from_bits() {
        let ro = OpenFlags::from_bits(OFlags::RDONLY.bits());
        assert!(ro.read && !ro.write && !ro.append);

        let wa = OpenFlags::from_bits((OFlags::WRONLY | OFlags::APPEND).bits());
        assert!(!wa.read && wa.write && wa.append);
        assert_eq!(wa.raw_mode().as_str(), "wa");

        let rw = OpenFlags::from_bits((OFlags::RDWR | OFlags::TRUNC).bits());
        assert!(rw.read && rw.write && rw.truncate);
        assert_eq!(rw.raw_mode().as_str(), "rw");

        // O_APPEND on a read-only handle is ignored
        let ra = OpenFlags::from_bits((OFlags::RDONLY | OFlags::APPEND).bits());
        assert!(!ra.append);
    }

    #[test]
    fn test_raw_mode_strings() {
        for s in ["r", "ra", "rw", "rwa", "w", "wa"] {
            let mode = RawMode::parse(s).unwrap();
            assert_eq!(mode.as_str(), s);
        }
        assert!(RawMode::parse("x").is_none());
    }

    #[test]
    fn test_stat_mode() {
        let owner = Identity { uid: 1000, gid: 100 };
        let dir = Stat::directory(0o555, owner, Times::default());
        assert!(dir.is_dir());
        assert_eq!(dir.mode() & 0o7777, 0o555);
        assert!(!is_regular_mode(dir.mode()));

        let file = Stat::file(0o644, 12, owner, Times::default());
        assert!(is_regular_mode(file.mode()));
        assert_eq!(file.uid, 1000);
        assert_eq!(file.nlink, 1);
    }
}
