//! Usage accounting for df-style reporting.
//!
//! Each accounting node covers one subtree. Adjustments are signed deltas
//! applied to the node and then to every ancestor, so the root always
//! holds whole-tree totals while a nested node holds its subtree's totals.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{VfsError, VfsResult};
use crate::types::Statistics;

/// Optional space and node limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    pub max_space: Option<u64>,
    pub max_nodes: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    space: u64,
    nodes: u64,
}

/// A node in the accounting chain.
#[derive(Debug, Default)]
pub struct UsageStats {
    counts: Mutex<Counts>,
    quota: Quota,
    strict: bool,
    parent: RwLock<Option<Arc<UsageStats>>>,
}

impl UsageStats {
    /// A root accounting node without quotas.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A root accounting node with quotas.
    ///
    /// When `strict` is set, adjustments that would exceed a quota at any
    /// level of the chain fail with `NoSpace` instead of being applied.
    pub fn with_quota(quota: Quota, strict: bool) -> Arc<Self> {
        Arc::new(Self {
            quota,
            strict,
            ..Default::default()
        })
    }

    /// A fresh accounting node descending from `self`.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            strict: self.strict,
            parent: RwLock::new(Some(Arc::clone(self))),
            ..Default::default()
        })
    }

    pub fn used_space(&self) -> u64 {
        self.counts.lock().space
    }

    pub fn used_nodes(&self) -> u64 {
        self.counts.lock().nodes
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn parent(&self) -> Option<Arc<UsageStats>> {
        self.parent.read().clone()
    }

    /// Apply a signed delta to this node and all its ancestors.
    pub fn adjust(&self, space: i64, nodes: i64) -> VfsResult<()> {
        if space == 0 && nodes == 0 {
            return Ok(());
        }
        if self.strict && (space > 0 || nodes > 0) {
            self.check_quota(space, nodes)?;
        }
        self.record(space, nodes);
        Ok(())
    }

    fn check_quota(&self, space: i64, nodes: i64) -> VfsResult<()> {
        let counts = *self.counts.lock();
        if let Some(max) = self.quota.max_space {
            if space > 0 && counts.space.saturating_add(space as u64) > max {
                return Err(VfsError::no_space(format!(
                    "space quota of {max} bytes exceeded"
                )));
            }
        }
        if let Some(max) = self.quota.max_nodes {
            if nodes > 0 && counts.nodes.saturating_add(nodes as u64) > max {
                return Err(VfsError::no_space(format!("node quota of {max} exceeded")));
            }
        }
        match self.parent() {
            Some(parent) => parent.check_quota(space, nodes),
            None => Ok(()),
        }
    }

    /// Apply a signed delta up the chain without quota checks.
    pub fn record(&self, space: i64, nodes: i64) {
        {
            let mut counts = self.counts.lock();
            counts.space = counts.space.saturating_add_signed(space);
            counts.nodes = counts.nodes.saturating_add_signed(nodes);
        }
        if let Some(parent) = self.parent() {
            parent.record(space, nodes);
        }
    }

    /// Hang this subtree's accounting under `parent`, adding its totals to
    /// the new ancestor chain.
    pub fn attach(&self, parent: &Arc<UsageStats>) -> VfsResult<()> {
        self.detach();
        let counts = *self.counts.lock();
        parent.adjust(counts.space as i64, counts.nodes as i64)?;
        *self.parent.write() = Some(Arc::clone(parent));
        Ok(())
    }

    /// Remove this subtree's accounting from its ancestor chain.
    pub fn detach(&self) {
        let Some(parent) = self.parent.write().take() else {
            return;
        };
        let counts = *self.counts.lock();
        parent.record(-(counts.space as i64), -(counts.nodes as i64));
    }

    /// Totals for this subtree, with this node's quotas.
    pub fn statistics(&self) -> Statistics {
        let counts = *self.counts.lock();
        Statistics {
            used_space: counts.space,
            used_nodes: counts.nodes,
            max_space: self.quota.max_space,
            max_nodes: self.quota.max_nodes,
        }
    }
}
