//! Cancellation primitives used by every blocking wait in the stack.
//!
//! A [`Token`] is a one-shot, broadcastable cancel flag. Signalling it
//! wakes every future parked on it and runs any registered hooks
//! synchronously on the signalling thread.
//!
//! A [`Sink`] binds a token to a wait site guarded by a
//! [`tokio::sync::Notify`]. The waiter registers interest on the `Notify`
//! *before* evaluating its readiness predicate, so a notification or a
//! cancellation that races with the start of the wait is never lost.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Hook = Box<dyn FnOnce() + Send + 'static>;

// ── Token ────────────────────────────────────────────────────────

/// One-shot cancellation flag shared between an owner and any number of
/// waiters.
#[derive(Clone, Default)]
pub struct Token {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancel: CancellationToken,
    hooks: Mutex<Vec<Hook>>,
}

impl Token {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token. Returns `true` if this call performed the transition;
    /// later calls are no-ops.
    pub fn signal(&self) -> bool {
        let hooks = {
            let mut hooks = self.inner.hooks.lock().expect("token hooks poisoned");
            if self.inner.cancel.is_cancelled() {
                return false;
            }
            self.inner.cancel.cancel();
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
        true
    }

    /// Cheap, non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Completes once the token has been signalled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Register a hook that runs once when the token fires. If the token
    /// is already set the hook runs immediately on the calling thread.
    pub fn on_signal<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.inner.hooks.lock().expect("token hooks poisoned");
            if !self.inner.cancel.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// A token that fires whenever `self` fires, but can also be
    /// signalled on its own without affecting the parent.
    pub fn child(&self) -> Token {
        let child = Token::new();
        let propagate = child.clone();
        self.on_signal(move || {
            propagate.signal();
        });
        child
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── Waiting ──────────────────────────────────────────────────────

/// Why a cancellable wait returned without its condition becoming true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The bound token was signalled.
    Cancelled,
    /// The deadline passed; carries the original budget.
    TimedOut(Duration),
}

/// Convert a millisecond budget into a deadline. `0` means "no deadline"
/// and is only accepted by the waits that document it.
pub fn deadline_after(timeout_ms: u64) -> Option<Instant> {
    (timeout_ms != 0).then(|| Instant::now() + Duration::from_millis(timeout_ms))
}

/// Milliseconds left before `deadline`, rounded up, in the form the timed
/// waits take: `Some(0)` when there is no deadline, `None` once it passed.
pub fn remaining_ms(deadline: Option<Instant>) -> Option<u64> {
    let Some(deadline) = deadline else {
        return Some(0);
    };
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return None;
    }
    let ms = left.as_micros().div_ceil(1000);
    Some(u64::try_from(ms).unwrap_or(u64::MAX))
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Binds a [`Token`] to wait sites so that parked waiters observe a
/// cancellation immediately.
#[derive(Debug, Clone, Copy)]
pub struct Sink<'a> {
    token: &'a Token,
}

impl<'a> Sink<'a> {
    pub fn new(token: &'a Token) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &'a Token {
        self.token
    }

    /// Park on `signal` until `ready` yields a value.
    ///
    /// The token is checked before the predicate, so a token that is
    /// already set fails the wait even if the condition holds.
    pub async fn wait_until<T, F>(
        &self,
        signal: &Notify,
        deadline: Option<Instant>,
        mut ready: F,
    ) -> Result<T, WaitError>
    where
        F: FnMut() -> Option<T>,
    {
        let budget = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.token.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            if let Some(value) = ready() {
                return Ok(value);
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(WaitError::Cancelled),
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => return Err(WaitError::TimedOut(budget)),
            }
        }
    }

    /// Run `fut` to completion unless the token fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, WaitError> {
        if self.token.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(WaitError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signal_is_idempotent() {
        let token = Token::new();
        assert!(!token.is_cancelled());
        assert!(token.signal());
        assert!(!token.signal());
        assert!(token.is_cancelled());
    }

    #[test]
    fn hooks_run_once() {
        let token = Token::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.on_signal(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.signal();
        token.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_after_signal_runs_immediately() {
        let token = Token::new();
        token.signal();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.on_signal(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_follows_parent_but_not_vice_versa() {
        let parent = Token::new();
        let child = parent.child();
        child.signal();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.signal();
        assert!(child.is_cancelled());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        assert!(deadline_after(0).is_none());
        assert!(deadline_after(10).is_some());
    }

    #[tokio::test]
    async fn wait_until_returns_ready_value() {
        let token = Token::new();
        let notify = Notify::new();
        let v = Sink::new(&token)
            .wait_until(&notify, None, || Some(7))
            .await;
        assert_eq!(v, Ok(7));
    }

    #[tokio::test]
    async fn wait_until_fails_fast_on_signalled_token() {
        let token = Token::new();
        token.signal();
        let notify = Notify::new();
        let v = Sink::new(&token)
            .wait_until(&notify, None, || Some(()))
            .await;
        assert_eq!(v, Err(WaitError::Cancelled));
    }

    #[tokio::test]
    async fn wait_until_wakes_on_concurrent_signal() {
        let token = Token::new();
        let notify = Arc::new(Notify::new());
        let t = token.clone();
        let waiter = tokio::spawn({
            let notify = notify.clone();
            async move {
                Sink::new(&t)
                    .wait_until(&notify, None, || None::<()>)
                    .await
            }
        });
        tokio::task::yield_now().await;
        token.signal();
        let res = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter hung")
            .unwrap();
        assert_eq!(res, Err(WaitError::Cancelled));
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let token = Token::new();
        let notify = Notify::new();
        let res = Sink::new(&token)
            .wait_until(&notify, deadline_after(20), || None::<()>)
            .await;
        assert!(matches!(res, Err(WaitError::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_budget_shrinks() {
        assert_eq!(remaining_ms(None), Some(0));
        let deadline = deadline_after(100);
        assert_eq!(remaining_ms(deadline), Some(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(remaining_ms(deadline), Some(40));
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(remaining_ms(deadline), None);
    }
}
