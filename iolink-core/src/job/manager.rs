use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{JobResult, SendJob, SendOutcome};
use crate::IoError;
use crate::cancel::Token;
use crate::package::Package;

// ── Pool ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Pool {
    /// Queued, unsent jobs, oldest first.
    active: VecDeque<Arc<SendJob>>,
    /// The job handed to the consumer and not yet put back.
    busy: Option<Arc<SendJob>>,
    /// Reserved heartbeat slot.
    heartbeat: Option<Arc<SendJob>>,
    /// Jobs that may still receive responses, by correlation id.
    registered: HashMap<Uuid, Arc<SendJob>>,
    accepting: bool,
    closed: Option<JobResult>,
}

impl Pool {
    fn unsent(&self) -> usize {
        let busy_user = self
            .busy
            .as_ref()
            .is_some_and(|b| !self.heartbeat.as_ref().is_some_and(|h| Arc::ptr_eq(b, h)));
        self.active.len() + usize::from(busy_user)
    }
}

/// Per-connection table of in-flight jobs.
///
/// Any number of callers submit; exactly one consumer (the writer task)
/// walks the active list through [`next_active_job`](Self::next_active_job)
/// and [`put_active_job`](Self::put_active_job).
#[derive(Debug)]
pub struct JobManager {
    sender: Uuid,
    max_active: usize,
    response_history: usize,
    pool: Mutex<Pool>,
    work: Notify,
}

impl JobManager {
    pub fn new(sender: Uuid, max_active: usize, response_history: usize) -> Arc<Self> {
        Arc::new(Self {
            sender,
            max_active: max_active.max(1),
            response_history,
            pool: Mutex::new(Pool::default()),
            work: Notify::new(),
        })
    }

    pub fn sender(&self) -> Uuid {
        self.sender
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Jobs submitted but not yet written, including the one being written.
    pub fn active_count(&self) -> usize {
        self.lock().unsent()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn registered_count(&self) -> usize {
        self.lock().registered.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Woken whenever there is new work for the consumer.
    pub fn work_signal(&self) -> &Notify {
        &self.work
    }

    pub fn wake_consumer(&self) {
        self.work.notify_one();
    }

    /// Open the pool for submissions.
    pub fn start_accepting(&self) {
        let mut pool = self.lock();
        pool.accepting = true;
        pool.closed = None;
    }

    /// Bind `job` to its correlation id for response lookup.
    pub fn register_package_uuid(&self, job: &Arc<SendJob>) -> Result<(), IoError> {
        let mut pool = self.lock();
        Self::register_locked(&mut pool, job)
    }

    fn register_locked(pool: &mut Pool, job: &Arc<SendJob>) -> Result<(), IoError> {
        let uuid = job.uuid();
        if uuid.is_nil() {
            return Err(IoError::Job(JobResult::InvalidPackage));
        }
        if pool.registered.contains_key(&uuid) {
            return Err(IoError::Job(JobResult::InvalidJob));
        }
        pool.registered.insert(uuid, job.clone());
        Ok(())
    }

    /// Create a job for `package` and queue it.
    ///
    /// The returned handle is always usable: when the job is refused, both
    /// phases already carry the refusal (`SendQueueIsFull`,
    /// `InvalidPackage`, `InvalidJob` or the close reason) and no waiter
    /// blocks. `urgent` bypasses the ceiling but not FIFO order.
    pub fn init_active_job(self: &Arc<Self>, mut package: Package, urgent: bool) -> JobHandle {
        package.ensure_uuid();
        package.set_sender(self.sender);
        let job = Arc::new(SendJob::new(package, self.response_history));

        let refused = {
            let mut pool = self.lock();
            if job.package().is_heartbeat() {
                Some(JobResult::InvalidPackage)
            } else if !pool.accepting {
                Some(pool.closed.unwrap_or(JobResult::ConnClosedByUser))
            } else if !urgent && pool.unsent() >= self.max_active {
                Some(JobResult::SendQueueIsFull)
            } else if let Err(e) = Self::register_locked(&mut pool, &job) {
                Some(e.job_result())
            } else {
                pool.active.push_back(job.clone());
                None
            }
        };

        match refused {
            Some(result) => {
                debug!(uuid = %job.uuid(), %result, urgent, "job refused");
                job.wake_send_waitings(result);
                job.wake_response_waitings(result);
            }
            None => {
                trace!(uuid = %job.uuid(), command = job.command(), urgent, "job queued");
                self.wake_consumer();
            }
        }

        JobHandle {
            job,
            manager: Arc::downgrade(self),
        }
    }

    /// Take the oldest queued job. Returns `None` while a job is still busy.
    pub fn next_active_job(&self) -> Option<Arc<SendJob>> {
        let mut pool = self.lock();
        if pool.busy.is_some() {
            return None;
        }
        let job = pool.active.pop_front()?;
        pool.busy = Some(job.clone());
        Some(job)
    }

    /// Occupy the heartbeat slot with a fresh heartbeat job.
    pub fn heartbeat_job(&self) -> Option<Arc<SendJob>> {
        let mut pool = self.lock();
        if pool.busy.is_some() || pool.heartbeat.is_some() {
            return None;
        }
        let job = Arc::new(SendJob::new(Package::heartbeat(self.sender), 1));
        pool.heartbeat = Some(job.clone());
        pool.busy = Some(job.clone());
        Some(job)
    }

    /// Return the busy job with its send result.
    pub fn put_active_job(&self, job: &Arc<SendJob>, result: JobResult) {
        {
            let mut pool = self.lock();
            if pool.busy.as_ref().is_some_and(|b| Arc::ptr_eq(b, job)) {
                pool.busy = None;
            }
            if pool.heartbeat.as_ref().is_some_and(|h| Arc::ptr_eq(h, job)) {
                pool.heartbeat = None;
            }
            if !result.is_success() {
                pool.registered.remove(&job.uuid());
            }
        }
        job.wake_send_waitings(result);
        if !result.is_success() {
            job.wake_response_waitings(result);
        } else if job.package().is_heartbeat() {
            job.wake_response_waitings(JobResult::NoResponse);
        }
    }

    pub fn find_job_by_response(&self, response: &Package) -> Option<Arc<SendJob>> {
        self.lock().registered.get(&response.uuid()).cloned()
    }

    /// Drop the response registration for `uuid` if it still belongs to
    /// `job`. The job stays queued if unsent.
    pub fn release(&self, job: &Arc<SendJob>) {
        let mut pool = self.lock();
        if pool
            .registered
            .get(&job.uuid())
            .is_some_and(|j| Arc::ptr_eq(j, job))
        {
            pool.registered.remove(&job.uuid());
        }
    }

    /// Cancel a job. A queued job is removed and fails; a job being written
    /// finishes its write and then fails.
    pub fn cancel(&self, job: &Arc<SendJob>) -> JobResult {
        let removed = {
            let mut pool = self.lock();
            if let Some(pos) = pool.active.iter().position(|j| Arc::ptr_eq(j, job)) {
                pool.active.remove(pos);
                pool.registered.remove(&job.uuid());
                true
            } else if pool.busy.as_ref().is_some_and(|b| Arc::ptr_eq(b, job)) {
                job.request_cancel();
                return JobResult::SendPended;
            } else {
                false
            }
        };
        if !removed {
            return JobResult::InvalidJob;
        }
        debug!(uuid = %job.uuid(), "queued job cancelled");
        job.wake_send_waitings(JobResult::Fail);
        job.wake_response_waitings(JobResult::Fail);
        JobResult::Success
    }

    /// Stop accepting and complete every outstanding job with `result`.
    /// Returns how many jobs were failed.
    pub fn fail_all(&self, result: JobResult) -> usize {
        let jobs: Vec<Arc<SendJob>> = {
            let mut pool = self.lock();
            pool.accepting = false;
            pool.closed.get_or_insert(result);
            let mut jobs: Vec<_> = pool.active.drain(..).collect();
            jobs.extend(pool.busy.take());
            pool.heartbeat = None;
            jobs.extend(pool.registered.drain().map(|(_, j)| j));
            jobs
        };
        let mut failed = 0;
        for job in &jobs {
            let send = job.wake_send_waitings(result);
            let response = job.wake_response_waitings(result);
            if send || response {
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, %result, "outstanding jobs failed");
        }
        self.work.notify_waiters();
        failed
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().expect("job pool poisoned")
    }
}

// ── JobHandle ────────────────────────────────────────────────────

/// Caller side of a submitted job. Dropping the handle closes the
/// response phase and stops response routing; an unsent package is still
/// written.
#[derive(Debug)]
pub struct JobHandle {
    job: Arc<SendJob>,
    manager: Weak<JobManager>,
}

impl JobHandle {
    pub fn uuid(&self) -> Uuid {
        self.job.uuid()
    }

    pub fn job(&self) -> &Arc<SendJob> {
        &self.job
    }

    /// The recorded send result, or `SendPended` while unsent.
    pub fn send_result(&self) -> JobResult {
        self.job.send_result().unwrap_or(JobResult::SendPended)
    }

    /// `true` if the job was refused at submission or has already failed.
    pub fn is_failed(&self) -> bool {
        self.job.send_result().is_some_and(|r| !r.is_success())
    }

    pub async fn wait_for_send(&self, timeout_ms: u64) -> SendOutcome {
        self.job.wait_for_send(timeout_ms).await
    }

    pub async fn wait_for_send_with(&self, token: &Token, timeout_ms: u64) -> SendOutcome {
        self.job.wait_for_send_with(token, timeout_ms).await
    }

    pub async fn wait_for_response(&self, timeout_ms: u64) -> Result<Arc<Package>, JobResult> {
        self.job.wait_for_response(timeout_ms).await
    }

    pub async fn wait_for_response_with(
        &self,
        token: &Token,
        timeout_ms: u64,
    ) -> Result<Arc<Package>, JobResult> {
        self.job.wait_for_response_with(token, timeout_ms).await
    }

    /// Stop expecting responses; pending response waiters get `NoResponse`.
    pub fn close_responses(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.job);
        }
        self.job.wake_response_waitings(JobResult::Success);
    }

    pub fn cancel(&self) -> JobResult {
        match self.manager.upgrade() {
            Some(manager) => manager.cancel(&self.job),
            None => JobResult::InvalidJob,
        }
    }

    pub fn urgently_wake(&self) {
        self.job.urgently_wake();
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.close_responses();
    }
}
