//! Cooperative shutdown for delivery workers.
//!
//! Workers never give up on a batch by themselves, so the only way to stop one that
//! is stuck against an unreachable pool is to cancel it. The token is checked at
//! every suspension point: input receive, connect attempt, backoff sleep and the
//! registrar handoff.

use std::sync::Arc;

use tokio::sync::watch;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The process is shutting down.
    #[default]
    Shutdown,
    /// An interrupt or termination signal was received.
    Signal,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::Signal => write!(f, "Signal"),
        }
    }
}

/// A lightweight, cloneable cancellation token.
/// Multiple workers can listen for the same cancellation.
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    /// Completes once cancellation is triggered. Pends forever if every handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut state = self.state.clone();
        if state.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The handle that triggers cancellation.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let (tx, rx) = watch::channel(None);
    (
        CancelToken { state: rx },
        CancelHandle {
            state: Arc::new(tx),
        },
    )
}
