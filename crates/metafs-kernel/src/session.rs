//! Mount session lifecycle.
//!
//! A [`Session`] owns the dispatcher for one mount, the identity that
//! mounted it, and the cancellation token every request context descends
//! from. Stopping the session cancels that token, so requests still in
//! flight or arriving late fail with `Interrupted`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{Identity, RequestContext};
use crate::dispatch::Dispatcher;
use crate::error::{VfsError, VfsResult};
use crate::ops::VirtualDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

/// One mounted filesystem.
#[derive(Debug)]
pub struct Session {
    dispatcher: Arc<Dispatcher>,
    owner: Identity,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    /// A session owned by the current process identity.
    pub fn new(root: Arc<dyn VirtualDir>) -> Self {
        Self::with_owner(root, Identity::current())
    }

    pub fn with_owner(root: Arc<dyn VirtualDir>, owner: Identity) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(root)),
            owner,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Created),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn owner(&self) -> Identity {
        self.owner
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Context for a request issued by `uid`/`gid`.
    ///
    /// Contexts made after [`Session::stop`] are already cancelled.
    pub fn context(&self, uid: u32, gid: u32) -> RequestContext {
        RequestContext::new(Identity::new(uid, gid), self.owner, self.cancel.child_token())
    }

    /// Notify the filesystem that it is mounted.
    pub async fn start(&self) -> VfsResult<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                return Err(VfsError::other(format!("session cannot start from {:?}", *state)));
            }
            *state = SessionState::Running;
        }
        tracing::info!(uid = self.owner.uid, "session started");
        self.dispatcher.mounted().await;
        Ok(())
    }

    /// Cancel outstanding requests, release open files and unmount.
    ///
    /// Stopping a session that never started or already stopped does
    /// nothing beyond cancelling.
    pub async fn stop(&self) {
        let was_running = {
            let mut state = self.state.lock();
            let running = *state == SessionState::Running;
            *state = SessionState::Stopped;
            running
        };
        self.cancel.cancel();
        if !was_running {
            return;
        }

        // open handles are released by the owner on a fresh token
        let ctx = RequestContext::owner(self.owner);
        self.dispatcher.release_all(&ctx).await;
        self.dispatcher.unmounted().await;
        tracing::info!(uid = self.owner.uid, "session stopped");
    }
}
