//! Cancellation tokens for calls and handlers.
//!
//! A `CancellationToken` can be checked synchronously and awaited. Callers
//! pass one into `CallRegistry::perform_call`; the dispatcher hands one to
//! every handler invocation so it can stop cooperatively.

use futures::future::select_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Node {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of async operations.
///
/// Clones share state: cancelling any clone cancels all of them. A child
/// token created with [`CancellationToken::child_token`] observes its
/// parent's cancellation, but cancelling the child leaves the parent alone.
///
/// # Example
///
/// ```
/// use tether_core::cancel::CancellationToken;
///
/// let parent = CancellationToken::new();
/// let child = parent.child_token();
///
/// child.cancel();
/// assert!(child.is_cancelled());
/// assert!(!parent.is_cancelled());
///
/// parent.cancel();
/// assert!(parent.child_token().is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    node: Arc<Node>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task awaiting [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::SeqCst);
        self.node.notify.notify_waiters();
    }

    /// Check if cancellation has been requested on this token or an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Create a child token that is cancelled whenever this token is.
    pub fn child_token(&self) -> Self {
        Self {
            node: Arc::new(Node::default()),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Wait until this token or one of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        let mut nodes = Vec::new();
        let mut current = Some(self);
        while let Some(token) = current {
            nodes.push(token.node.clone());
            current = token.parent.as_deref();
        }

        loop {
            let mut waits: Vec<_> = nodes.iter().map(|n| Box::pin(n.notify.notified())).collect();
            // Register interest before re-checking the flags so a concurrent
            // cancel() cannot slip between the check and the wait.
            for wait in waits.iter_mut() {
                wait.as_mut().enable();
            }
            if self.is_cancelled() {
                return;
            }
            let _ = select_all(waits).await;
        }
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Cancel this token once `delay` elapses.
    ///
    /// The timer is dropped together with the returned guard, so a call that
    /// finishes early never fires its deadline.
    pub fn cancel_after(&self, delay: Duration) -> DeadlineGuard {
        let fired = Arc::new(AtomicBool::new(false));
        let token = self.clone();
        let fired_flag = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fired_flag.store(true, Ordering::SeqCst);
            token.cancel();
        });
        DeadlineGuard { handle, fired }
    }
}

/// Timer that cancels a token at a deadline; aborted when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl DeadlineGuard {
    /// Whether the deadline elapsed and cancelled the token.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::RpcError {
    fn from(_: CancelledError) -> Self {
        crate::error::RpcError::Cancelled
    }
}
