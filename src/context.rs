//! Per-call deadline and cancellation state.
//!
//! Every call carries a [`CallContext`]. Handlers receive a clone and use it as
//! a cancellation token: [`CallContext::check`] and [`CallContext::sleep`] are
//! the step boundaries at which a canceled or expired call stops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::{status::CallStatus, RpcError};

#[derive(Debug, Clone)]
pub struct CallContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    deadline: Option<Instant>,
    state: watch::Sender<CallStatus>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A context without a deadline; the call runs until it finishes or is canceled.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (state, _) = watch::channel(CallStatus::Running);
        Self {
            inner: Arc::new(Inner { deadline, state }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn status(&self) -> CallStatus {
        self.observe_deadline();
        self.inner.state.borrow().clone()
    }

    /// Moves the call to a terminal status.
    ///
    /// Returns `false` when a terminal status was already set; the first one wins.
    pub fn finish(&self, status: CallStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        self.observe_deadline();
        self.transition(status)
    }

    pub fn complete(&self) -> bool {
        self.finish(CallStatus::Ok)
    }

    pub fn cancel(&self) -> bool {
        self.finish(CallStatus::Canceled)
    }

    pub fn failure(&self) -> Option<RpcError> {
        self.status().error()
    }

    /// Step boundary for handlers: errors once the call was canceled or expired.
    pub fn check(&self) -> Result<(), RpcError> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until the call reaches a terminal status, including deadline expiry.
    pub async fn finished(&self) -> CallStatus {
        let mut state = self.inner.state.subscribe();
        let terminal = async move {
            let _ = state.wait_for(CallStatus::is_terminal).await;
        };

        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = terminal => {}
                    _ = time::sleep_until(deadline) => {
                        self.transition(CallStatus::DeadlineExceeded);
                    }
                }
            }
            None => terminal.await,
        }

        self.status()
    }

    /// Resolves with the failure of this call. Never resolves if the call succeeds.
    pub async fn failed(&self) -> RpcError {
        match self.finished().await.error() {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Sleeps for `duration`, returning early with an error if the call fails first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), RpcError> {
        self.check()?;
        tokio::select! {
            _ = time::sleep(duration) => self.check(),
            err = self.failed() => Err(err),
        }
    }

    /// Runs `work` until it completes or the call fails, whichever comes first.
    ///
    /// On failure the future is dropped, so a handler is aborted even between
    /// its own checkpoints.
    pub async fn run<F, T>(&self, work: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        tokio::select! {
            result = work => result,
            err = self.failed() => Err(err),
        }
    }

    fn observe_deadline(&self) {
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                self.transition(CallStatus::DeadlineExceeded);
            }
        }
    }

    fn transition(&self, status: CallStatus) -> bool {
        self.inner.state.send_if_modified(move |current| {
            if current.is_terminal() {
                false
            } else {
                *current = status;
                true
            }
        })
    }
}
