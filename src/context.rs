//! Cancellation and deadline scope for a logical call.
//!
//! A [`Context`] pairs a [`CancellationToken`] with an optional deadline. Child contexts
//! share cancellation with their parent and can only tighten the deadline, never extend it.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a child bounded by `deadline`, or by the parent's deadline if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn err(&self) -> Option<Cancellation> {
        if self.token.is_cancelled() {
            return Some(Cancellation::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cancellation::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Cancellation {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Cancellation::Cancelled,
                    () = sleep_until(deadline) => Cancellation::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Cancellation::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{Cancellation, Context};

    #[tokio::test(start_paused = true)]
    async fn child_deadline_never_exceeds_parent_deadline() {
        let parent = Context::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(child.done().await, Cancellation::DeadlineExceeded);
        assert!(Instant::now() >= parent.deadline().expect("deadline should be set"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_parent_cancels_child() {
        let parent = Context::new();
        let child = parent.with_timeout(Duration::from_secs(30));
        assert_eq!(child.err(), None);

        parent.cancel();

        assert_eq!(child.err(), Some(Cancellation::Cancelled));
        assert_eq!(child.done().await, Cancellation::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_child_leaves_parent_running() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }
}
