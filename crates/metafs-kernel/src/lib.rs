//! # metafs-kernel
//!
//! Virtual filesystem dispatch layer.
//!
//! Everything mounted is a [`VirtualDir`]. A filesystem is built from:
//! - [`MetaDir`]: an in-memory tree that other directories can be mounted into
//! - [`PathMapperFs`]: a virtual tree whose files are backed by real files,
//!   optionally kept current by a background [`ScanLoop`]
//! - [`Dispatcher`]: turns kernel requests into contract calls and tracks
//!   open [`FileHandle`]s
//! - [`Session`]: the lifecycle of one mount
//!
//! Every contract call takes a [`RequestContext`] carrying the caller, the
//! mount owner and a cancellation token. Operations a directory does not
//! support fall back to the defaults on [`VirtualDir`], and a declined
//! optional form (`mkdir` with an object, `rename` into a foreign owner)
//! reports [`VfsError::NotSupported`] so callers can fall back.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod metadir;
pub mod ops;
pub mod path;
pub mod pathmapper;
pub mod scan;
pub mod session;
pub mod sqlite;
pub mod stats;
pub mod types;

pub use config::{ConfigError, MapperConfig, MountConfig, ScanConfig};
pub use context::{Identity, RequestContext};
pub use dispatch::Dispatcher;
pub use error::{VfsError, VfsResult, or_default};
pub use handle::{FileHandle, MAX_BUFFERED_SIZE};
pub use metadir::MetaDir;
pub use ops::VirtualDir;
pub use pathmapper::{
    PathMapperFs, READ_ONLY,
    tree::{MapOptions, MappedNode, MappedTree, NodeId, NodeKind},
};
pub use scan::{SCAN_GENERATION, ScanLoop, ScanTrigger, Scanner, WatchGuard};
pub use session::{Session, SessionState};
pub use sqlite::{MappedRow, SqliteScanner};
pub use stats::{Quota, UsageStats};
pub use types::{
    DirEntry, FileType, OpenFlags, RawHandle, RawMode, Stat, StatFs, Statistics, Times, XattrMap,
};
