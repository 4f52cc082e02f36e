use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use uuid::Uuid;

use super::JobResult;
use crate::cancel::{Sink, Token, WaitError, deadline_after};
use crate::package::Package;
use crate::queue::BoundedQueue;

/// What a send waiter observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub result: JobResult,
    /// Set when the wait was released by [`SendJob::urgently_wake`] rather
    /// than by a terminal result.
    pub urgently_waked: bool,
}

#[derive(Debug, Default)]
struct JobState {
    send: Option<JobResult>,
    response: Option<JobResult>,
    send_waiters: usize,
    response_waiters: usize,
    send_epoch: u64,
    response_epoch: u64,
    cancel_requested: bool,
}

#[derive(Clone, Copy)]
enum Phase {
    Send,
    Response,
}

/// One package in flight.
///
/// Each phase (send, response) records its terminal result at most once.
/// Every waiter, including one that arrives after the wake, observes that
/// same value.
pub struct SendJob {
    package: Arc<Package>,
    state: Mutex<JobState>,
    send_done: Notify,
    response_done: Notify,
    responses: BoundedQueue<Arc<Package>>,
}

impl SendJob {
    pub fn new(package: Package, response_history: usize) -> Self {
        Self {
            package: Arc::new(package),
            state: Mutex::new(JobState::default()),
            send_done: Notify::new(),
            response_done: Notify::new(),
            responses: BoundedQueue::new(response_history.max(1)),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.package.uuid()
    }

    pub fn command(&self) -> u32 {
        self.package.command()
    }

    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    /// Terminal send result, if one was recorded.
    pub fn send_result(&self) -> Option<JobResult> {
        self.lock().send
    }

    pub fn response_result(&self) -> Option<JobResult> {
        self.lock().response
    }

    pub fn send_waiters(&self) -> usize {
        self.lock().send_waiters
    }

    pub fn response_waiters(&self) -> usize {
        self.lock().response_waiters
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    /// Mark the job so that a write already in progress completes as `Fail`.
    pub fn request_cancel(&self) {
        self.lock().cancel_requested = true;
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Record the send result and release every send waiter. Returns
    /// `false` if a result was already recorded.
    pub fn wake_send_waitings(&self, result: JobResult) -> bool {
        {
            let mut state = self.lock();
            if state.send.is_some() {
                return false;
            }
            let result = if state.cancel_requested && result.is_success() {
                JobResult::Fail
            } else {
                result
            };
            state.send = Some(result);
        }
        self.send_done.notify_waiters();
        true
    }

    /// Close the response phase with `result` and release every response
    /// waiter. Responses already queued are still delivered first.
    pub fn wake_response_waitings(&self, result: JobResult) -> bool {
        {
            let mut state = self.lock();
            if state.response.is_some() {
                return false;
            }
            state.response = Some(result);
        }
        self.response_done.notify_waiters();
        true
    }

    /// Release current waiters of both phases without recording a result.
    pub fn urgently_wake(&self) {
        {
            let mut state = self.lock();
            state.send_epoch += 1;
            state.response_epoch += 1;
        }
        self.send_done.notify_waiters();
        self.response_done.notify_waiters();
    }

    /// Queue a response, waiting for room while the history is full.
    ///
    /// Responses arriving after the response phase closed are refused with
    /// `InvalidJob`, and so is a response still waiting for room when the
    /// phase closes.
    pub async fn push_response(
        &self,
        response: Arc<Package>,
        token: &Token,
        timeout_ms: u64,
    ) -> Result<(), JobResult> {
        let sink = Sink::new(token);
        let closed = sink.wait_until(&self.response_done, None, || {
            self.lock().response.map(|_| ())
        });
        tokio::select! {
            biased;
            closed = closed => Err(closed.map_or_else(wait_result, |()| JobResult::InvalidJob)),
            added = self.responses.add(response, token, timeout_ms) => {
                added.map_err(|e| wait_result(e.reason))?;
                self.response_done.notify_waiters();
                Ok(())
            }
        }
    }

    /// Wait for the send phase to finish. `timeout_ms == 0` waits forever.
    pub async fn wait_for_send(&self, timeout_ms: u64) -> SendOutcome {
        self.wait_for_send_with(&Token::new(), timeout_ms).await
    }

    /// As [`wait_for_send`](Self::wait_for_send), also returning early with
    /// `ConnClosedByUser` when `token` fires.
    pub async fn wait_for_send_with(&self, token: &Token, timeout_ms: u64) -> SendOutcome {
        let _waiter = WaiterGuard::enter(self, Phase::Send);
        let epoch = self.lock().send_epoch;
        let res = Sink::new(token)
            .wait_until(&self.send_done, deadline_after(timeout_ms), || {
                let state = self.lock();
                if let Some(result) = state.send {
                    Some(SendOutcome {
                        result,
                        urgently_waked: false,
                    })
                } else if state.send_epoch != epoch {
                    Some(SendOutcome {
                        result: JobResult::UrgentlyWaked,
                        urgently_waked: true,
                    })
                } else {
                    None
                }
            })
            .await;
        res.unwrap_or_else(|e| SendOutcome {
            result: wait_result(e),
            urgently_waked: false,
        })
    }

    /// Wait for the next response. `timeout_ms == 0` waits forever.
    pub async fn wait_for_response(&self, timeout_ms: u64) -> Result<Arc<Package>, JobResult> {
        self.wait_for_response_with(&Token::new(), timeout_ms).await
    }

    pub async fn wait_for_response_with(
        &self,
        token: &Token,
        timeout_ms: u64,
    ) -> Result<Arc<Package>, JobResult> {
        let _waiter = WaiterGuard::enter(self, Phase::Response);
        let epoch = self.lock().response_epoch;
        Sink::new(token)
            .wait_until(&self.response_done, deadline_after(timeout_ms), || {
                if let Some(response) = self.responses.try_take() {
                    return Some(Ok(response));
                }
                let state = self.lock();
                if let Some(send) = state.send.filter(|r| !r.is_success()) {
                    return Some(Err(send));
                }
                if let Some(result) = state.response {
                    let result = if result.is_success() {
                        JobResult::NoResponse
                    } else {
                        result
                    };
                    return Some(Err(result));
                }
                (state.response_epoch != epoch).then_some(Err(JobResult::UrgentlyWaked))
            })
            .await
            .unwrap_or_else(|e| Err(wait_result(e)))
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().expect("job state poisoned")
    }
}

impl std::fmt::Debug for SendJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SendJob")
            .field("uuid", &self.uuid())
            .field("command", &format_args!("{:#x}", self.command()))
            .field("send", &state.send)
            .field("response", &state.response)
            .finish()
    }
}

fn wait_result(e: WaitError) -> JobResult {
    match e {
        WaitError::Cancelled => JobResult::ConnClosedByUser,
        WaitError::TimedOut(_) => JobResult::Timeout,
    }
}

struct WaiterGuard<'a> {
    job: &'a SendJob,
    phase: Phase,
}

impl<'a> WaiterGuard<'a> {
    fn enter(job: &'a SendJob, phase: Phase) -> Self {
        {
            let mut state = job.lock();
            match phase {
                Phase::Send => state.send_waiters += 1,
                Phase::Response => state.response_waiters += 1,
            }
        }
        Self { job, phase }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.job.lock();
        match self.phase {
            Phase::Send => state.send_waiters -= 1,
            Phase::Response => state.response_waiters -= 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job() -> Arc<SendJob> {
        let mut pkg = Package::new(0x1000);
        pkg.ensure_uuid();
        Arc::new(SendJob::new(pkg, 2))
    }

    #[tokio::test]
    async fn wake_send_is_idempotent() {
        let job = job();
        assert!(job.wake_send_waitings(JobResult::Success));
        assert!(!job.wake_send_waitings(JobResult::Fail));
        let out = job.wait_for_send(0).await;
        assert_eq!(out.result, JobResult::Success);
        assert!(!out.urgently_waked);
        // late waiter sees the same value
        assert_eq!(job.wait_for_send(0).await.result, JobResult::Success);
    }

    #[tokio::test]
    async fn all_waiters_observe_broadcast() {
        let job = job();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let job = job.clone();
                tokio::spawn(async move { job.wait_for_send(5_000).await })
            })
            .collect();
        while job.send_waiters() < 4 {
            tokio::task::yield_now().await;
        }
        job.wake_send_waitings(JobResult::ConnClosedByPeer);
        for w in waiters {
            assert_eq!(w.await.unwrap().result, JobResult::ConnClosedByPeer);
        }
        assert_eq!(job.send_waiters(), 0);
    }

    #[tokio::test]
    async fn wait_for_send_times_out() {
        let job = job();
        let out = job.wait_for_send(20).await;
        assert_eq!(out.result, JobResult::Timeout);
        assert_eq!(job.send_result(), None);
    }

    #[tokio::test]
    async fn urgent_wake_releases_without_result() {
        let job = job();
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_for_send(0).await })
        };
        while job.send_waiters() < 1 {
            tokio::task::yield_now().await;
        }
        job.urgently_wake();
        let out = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("timeout")
            .unwrap();
        assert!(out.urgently_waked);
        assert_eq!(job.send_result(), None);
    }

    #[tokio::test]
    async fn cancelled_write_completes_as_fail() {
        let job = job();
        job.request_cancel();
        job.wake_send_waitings(JobResult::Success);
        assert_eq!(job.send_result(), Some(JobResult::Fail));
    }

    #[tokio::test]
    async fn responses_delivered_before_close() {
        let job = job();
        let token = Token::new();
        job.wake_send_waitings(JobResult::Success);
        let resp = Arc::new(Package::response_to(job.package(), 0x1000));
        job.push_response(resp.clone(), &token, 100).await.unwrap();
        job.wake_response_waitings(JobResult::Success);

        assert_eq!(job.wait_for_response(100).await.unwrap(), resp);
        assert_eq!(job.wait_for_response(100).await, Err(JobResult::NoResponse));
        assert_eq!(
            job.push_response(resp, &token, 100).await,
            Err(JobResult::InvalidJob)
        );
    }

    #[tokio::test]
    async fn closing_responses_releases_a_blocked_push() {
        let job = job();
        let token = Token::new();
        for _ in 0..2 {
            let r = Arc::new(Package::response_to(job.package(), 0x1001));
            job.push_response(r, &token, 50).await.unwrap();
        }
        let pusher = {
            let job = job.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let r = Arc::new(Package::response_to(job.package(), 0x1001));
                job.push_response(r, &token, 0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        job.wake_response_waitings(JobResult::Success);
        let res = tokio::time::timeout(Duration::from_secs(5), pusher)
            .await
            .expect("push stayed blocked")
            .unwrap();
        assert_eq!(res, Err(JobResult::InvalidJob));
        assert_eq!(job.pending_responses(), 2);
    }

    #[tokio::test]
    async fn failed_send_fails_response_wait() {
        let job = job();
        job.wake_send_waitings(JobResult::SendQueueIsFull);
        assert_eq!(
            job.wait_for_response(0).await,
            Err(JobResult::SendQueueIsFull)
        );
    }

    #[tokio::test]
    async fn response_history_is_bounded() {
        let job = job();
        let token = Token::new();
        for _ in 0..2 {
            let r = Arc::new(Package::response_to(job.package(), 0x1001));
            job.push_response(r, &token, 50).await.unwrap();
        }
        let r = Arc::new(Package::response_to(job.package(), 0x1001));
        assert_eq!(job.push_response(r, &token, 20).await, Err(JobResult::Timeout));
        assert_eq!(job.pending_responses(), 2);
    }
}
