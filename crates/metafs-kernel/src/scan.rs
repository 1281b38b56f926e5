//! Background rescans of a mapped tree.
//!
//! A [`Scanner`] repopulates a [`MappedTree`] from some external source of
//! truth. [`ScanLoop`] runs it on a dedicated thread: the thread sleeps on a
//! condition variable until a rescan is requested (by a change watcher, a
//! poll interval or an explicit [`ScanLoop::trigger`]) and holds the tree's
//! write lock for the whole pass.
//!
//! Every pass gets a new generation number. Scanners tag the nodes they map
//! with it under [`SCAN_GENERATION`], and after a successful pass any node
//! still carrying an older generation is evicted.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;

use crate::config::ScanConfig;
use crate::pathmapper::tree::{MappedNode, MappedTree};

/// Option key holding the generation of the pass that last mapped a node.
pub const SCAN_GENERATION: &str = "scan_generation";

/// Source of mapped entries for a [`ScanLoop`].
pub trait Scanner: Send + Sync + 'static {
    /// Map every entry currently present in the source into `tree`, tagging
    /// each with `generation`.
    fn scan(&self, tree: &mut MappedTree, generation: u64) -> anyhow::Result<()>;

    /// Apply mount-level scan settings. Sources with nothing to tune
    /// ignore them.
    fn configure(&mut self, _config: &ScanConfig) {}

    /// Start watching the source for changes, calling `trigger` on each.
    ///
    /// The returned guard stops the watch when dropped. `None` means the
    /// source cannot be watched and only polls or explicit triggers apply.
    fn watch(&self, _trigger: ScanTrigger) -> anyhow::Result<Option<WatchGuard>> {
        Ok(None)
    }
}

/// Keeps a change watcher alive.
pub struct WatchGuard(#[allow(dead_code)] Box<dyn Send>);

impl WatchGuard {
    pub fn new(inner: impl Send + 'static) -> Self {
        Self(Box::new(inner))
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WatchGuard")
    }
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    pending: bool,
    generation: u64,
    passes: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn request(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        self.wake.notify_one();
    }
}

/// Cloneable handle that requests a rescan.
#[derive(Debug, Clone)]
pub struct ScanTrigger {
    shared: Arc<Shared>,
}

impl ScanTrigger {
    pub fn fire(&self) {
        self.shared.request();
    }
}

/// True when `node` was mapped by a pass older than `generation`.
///
/// Nodes mapped outside of any scan carry no generation and are kept.
pub fn is_stale(node: &MappedNode, generation: u64) -> bool {
    node.options
        .get(SCAN_GENERATION)
        .and_then(Value::as_u64)
        .is_some_and(|g| g != generation)
}

/// Run one pass of `scanner` against `tree`.
///
/// Stale entries are evicted only when the scan succeeds, so a source that
/// is briefly unreachable does not empty the tree.
pub fn scan_once(
    scanner: &dyn Scanner,
    tree: &RwLock<MappedTree>,
    generation: u64,
) -> anyhow::Result<usize> {
    let mut tree = tree.write();
    scanner.scan(&mut tree, generation)?;
    Ok(tree.cleanup(|node| is_stale(node, generation)))
}

/// Dedicated thread driving a [`Scanner`].
pub struct ScanLoop {
    scanner: Arc<dyn Scanner>,
    tree: Arc<RwLock<MappedTree>>,
    poll: Option<Duration>,
    watch_source: bool,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    watch: Mutex<Option<WatchGuard>>,
}

impl std::fmt::Debug for ScanLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLoop")
            .field("poll", &self.poll)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ScanLoop {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        tree: Arc<RwLock<MappedTree>>,
        poll: Option<Duration>,
    ) -> Self {
        Self {
            scanner,
            tree,
            poll,
            watch_source: true,
            shared: Arc::new(Shared::default()),
            thread: Mutex::new(None),
            watch: Mutex::new(None),
        }
    }

    /// Whether to ask the scanner for a change watcher on start.
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch_source = watch;
        self
    }

    /// A handle that requests a rescan from any thread.
    pub fn trigger_handle(&self) -> ScanTrigger {
        ScanTrigger {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Generation of the most recent pass.
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Number of passes that completed successfully.
    pub fn passes(&self) -> u64 {
        self.shared.state.lock().passes
    }

    /// Spawn the scan thread and run the first pass on it.
    ///
    /// Does nothing if the loop is already running. A watcher that fails to
    /// start is logged and the loop runs without it.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut thread = self.thread.lock();
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.pending = true;
        }

        if self.watch_source {
            match self.scanner.watch(self.trigger_handle()) {
                Ok(guard) => *self.watch.lock() = guard,
                Err(e) => tracing::warn!(error = %e, "scan watcher unavailable, relying on polling"),
            }
        }

        let scanner = Arc::clone(&self.scanner);
        let tree = Arc::clone(&self.tree);
        let shared = Arc::clone(&self.shared);
        let poll = self.poll;
        let handle = std::thread::Builder::new()
            .name("metafs-scan".into())
            .spawn(move || run(scanner.as_ref(), &tree, &shared, poll));
        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::info!(poll_ms = poll.map(|d| d.as_millis() as u64), "scan loop started");
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().running = false;
                self.watch.lock().take();
                Err(e.into())
            }
        }
    }

    /// Request a rescan.
    pub fn trigger(&self) {
        self.shared.request();
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// A pass in progress completes first.
    pub fn stop(&self) {
        self.watch.lock().take();
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.wake.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("scan thread panicked");
            }
            tracing::info!("scan loop stopped");
        }
    }
}

impl Drop for ScanLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    scanner: &dyn Scanner,
    tree: &RwLock<MappedTree>,
    shared: &Shared,
    poll: Option<Duration>,
) {
    loop {
        let generation = {
            let mut state = shared.state.lock();
            while state.running && !state.pending {
                match poll {
                    Some(interval) => {
                        if shared.wake.wait_for(&mut state, interval).timed_out() {
                            break;
                        }
                    }
                    None => shared.wake.wait(&mut state),
                }
            }
            if !state.running {
                break;
            }
            state.pending = false;
            state.generation += 1;
            state.generation
        };

        match scan_once(scanner, tree, generation) {
            Ok(evicted) => {
                shared.state.lock().passes += 1;
                tracing::debug!(generation, evicted, "scan pass complete");
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "scan pass failed, keeping current entries");
            }
        }
    }
}
