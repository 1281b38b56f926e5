//! Per-request identity and cancellation.
//!
//! Every contract call receives a [`RequestContext`] explicitly. Nested
//! permission checks read the caller from it instead of ambient state.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{VfsError, VfsResult};

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Identity of the running process.
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
        }
    }
}

/// Request-scoped state threaded through every contract call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Who issued the request.
    pub caller: Identity,
    /// Who mounted the filesystem.
    pub owner: Identity,
    /// Fires when the request or the whole session is cancelled.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(caller: Identity, owner: Identity, cancel: CancellationToken) -> Self {
        Self {
            caller,
            owner,
            cancel,
        }
    }

    /// Context for a call made by the mount owner itself.
    ///
    /// Used for programmatic setup (populating a tree before mounting)
    /// and in tests.
    pub fn owner(owner: Identity) -> Self {
        Self::new(owner, owner, CancellationToken::new())
    }

    /// Context for the current process acting as mount owner.
    pub fn local() -> Self {
        Self::owner(Identity::current())
    }

    /// A context for `caller` sharing this context's owner and cancellation.
    pub fn as_caller(&self, caller: Identity) -> Self {
        Self::new(caller, self.owner, self.cancel.clone())
    }

    /// True when the caller is the identity that mounted the filesystem.
    pub fn is_mount_owner(&self) -> bool {
        self.caller.uid == self.owner.uid
    }

    /// Fail with `Interrupted` if the request has been cancelled.
    pub fn check_cancelled(&self) -> VfsResult<()> {
        if self.cancel.is_cancelled() {
            Err(VfsError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_owner() {
        let owner = Identity::new(1000, 1000);
        let ctx = RequestContext::owner(owner);
        assert!(ctx.is_mount_owner());

        let other = ctx.as_caller(Identity::new(1001, 1000));
        assert!(!other.is_mount_owner());
        assert_eq!(other.owner, owner);
    }

    #[test]
    fn test_cancellation() {
        let ctx = RequestContext::owner(Identity::new(0, 0));
        assert!(ctx.check_cancelled().is_ok());
        let child = ctx.as_caller(Identity::new(5, 5));
        ctx.cancel.cancel();
        assert!(matches!(child.check_cancelled(), Err(VfsError::Interrupted)));
    }
}
