//! Cancellation token threaded from callers down to spawned commands

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a cancellable operation stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller fired the token (client went away, shutdown, ...)
    Requested,

    /// The token's deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Cloneable cancellation token with an optional deadline.
///
/// All clones share the same trigger. [`CancelToken::with_timeout`] derives a
/// token that shares the trigger but carries a tighter deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            deadline: None,
        }
    }

    /// Derive a token that also expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(current) if current < candidate => current,
            _ => candidate,
        };
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            deadline: Some(deadline),
        }
    }

    /// Fire the token for every clone
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.is_expired()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Why the token is cancelled, `None` while it is still live
    pub fn reason(&self) -> Option<CancelReason> {
        if *self.rx.borrow() {
            Some(CancelReason::Requested)
        } else if self.is_expired() {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the token fires or the deadline passes
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        let fired = async move {
            // The sender lives in `self`, so wait_for only errors if every
            // token was dropped, which cannot happen while we borrow one.
            if rx.wait_for(|v| *v).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = fired => CancelReason::Requested,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                fired.await;
                CancelReason::Requested
            }
        }
    }

    /// A new token that is also cancelled when this one is. Cancelling the
    /// child leaves this token alone. Must be called within a tokio runtime.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let (parent, linked) = (self.clone(), child.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        child
    }

    /// Cancel the token when the returned guard is dropped
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: self.clone(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires its token on drop
#[derive(Debug)]
pub struct CancelOnDrop {
    token: CancelToken,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
