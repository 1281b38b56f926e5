//! Mapped trees populated from a SQLite query.
//!
//! Each pass opens the database read-only, runs the configured query and
//! hands every row to a caller-supplied mapper that decides where (and
//! whether) the row appears in the tree. A watcher on the database's
//! directory requests a rescan whenever the database or its journal changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rusqlite::{Connection, OpenFlags, Row};

use crate::config::ScanConfig;
use crate::pathmapper::tree::{MapOptions, MappedTree};
use crate::scan::{SCAN_GENERATION, ScanTrigger, Scanner, WatchGuard};

/// Where a database row appears in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub virtual_path: String,
    pub real_path: PathBuf,
    pub options: MapOptions,
}

impl MappedRow {
    pub fn new(virtual_path: impl Into<String>, real_path: impl Into<PathBuf>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            real_path: real_path.into(),
            options: MapOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MapOptions) -> Self {
        self.options = options;
        self
    }
}

/// Turns a result row into a mapping. `None` skips the row.
pub type RowMapper = dyn Fn(&Row<'_>) -> rusqlite::Result<Option<MappedRow>> + Send + Sync;

/// [`Scanner`] backed by a SQLite query.
pub struct SqliteScanner {
    db_path: PathBuf,
    sql: String,
    busy_timeout: Duration,
    map_row: Box<RowMapper>,
}

impl std::fmt::Debug for SqliteScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteScanner")
            .field("db_path", &self.db_path)
            .field("sql", &self.sql)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl SqliteScanner {
    /// Default time to wait on a locked database.
    pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new<F>(db_path: impl Into<PathBuf>, sql: impl Into<String>, map_row: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<Option<MappedRow>> + Send + Sync + 'static,
    {
        Self {
            db_path: db_path.into(),
            sql: sql.into(),
            busy_timeout: Self::DEFAULT_BUSY_TIMEOUT,
            map_row: Box::new(map_row),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run the query and collect the mapped rows.
    pub fn query(&self) -> anyhow::Result<Vec<MappedRow>> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening {}", self.db_path.display()))?;
        conn.busy_timeout(self.busy_timeout)?;

        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt.query_map([], |row| (self.map_row)(row))?;

        let mut mapped = Vec::new();
        for row in rows {
            if let Some(row) = row? {
                mapped.push(row);
            }
        }
        Ok(mapped)
    }
}

/// True when `path` is the database at `db_path` or one of its journal files.
fn is_database_file(db_path: &Path, path: &Path) -> bool {
    let (Some(name), Some(db_name)) = (path.file_name(), db_path.file_name()) else {
        return false;
    };
    name.to_string_lossy()
        .starts_with(db_name.to_string_lossy().as_ref())
}

impl Scanner for SqliteScanner {
    fn configure(&mut self, config: &ScanConfig) {
        self.busy_timeout = config.busy_timeout();
    }

    fn scan(&self, tree: &mut MappedTree, generation: u64) -> anyhow::Result<()> {
        let rows = self.query()?;
        let count = rows.len();
        for row in rows {
            let options = row.options.with(SCAN_GENERATION, generation);
            if let Err(e) = tree.map_file(&row.real_path, &row.virtual_path, options) {
                tracing::warn!(path = %row.virtual_path, error = %e, "skipping unmappable row");
            }
        }
        tracing::debug!(generation, rows = count, db = %self.db_path.display(), "sqlite scan");
        Ok(())
    }

    fn watch(&self, trigger: ScanTrigger) -> anyhow::Result<Option<WatchGuard>> {
        let dir = match self.db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let db_path = self.db_path.clone();
        let watched = db_path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    if event.paths.iter().any(|p| is_database_file(&watched, p)) {
                        trigger.fire();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "database watch error"),
            },
            notify::Config::default(),
        )?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        tracing::debug!(db = %db_path.display(), "watching database for changes");
        Ok(Some(WatchGuard::new(watcher)))
    }
}
