//! The connection writer: one task per connection that owns the socket's
//! write half and drains the job pool onto it.
//!
//! ```text
//!  Stopped ──► Starting ──► Started ──► Stopping ──► Stopped
//!                  │                                    ▲
//!                  └──────────── startup failure ───────┘
//! ```
//!
//! While `Started` the writer may be paused for a connection handover:
//! [`SocketWriter::send_and_pause_writing`] pushes one urgent control
//! package and holds back user jobs until
//! [`SocketWriter::continue_writing`]. Heartbeats and TLS record drains
//! carry on while paused.

mod io;
mod task;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::IoError;
use crate::cancel::{Sink, Token, WaitError};
use crate::handshake::ProtocolVersion;
use crate::job::{JobHandle, JobManager, JobResult};
use crate::package::Package;
use crate::route::RouteTable;
use crate::state::WriterState;
use crate::tls::TlsEngine;

// ── Observer ─────────────────────────────────────────────────────

/// Hooks invoked around every user package write.
pub trait SendObserver: Send + Sync {
    fn before_send(&self, _package: &Package) {}

    /// Called exactly once per written or failed user package.
    fn after_send(&self, _package: &Package, _result: JobResult) {}
}

// ── Params ───────────────────────────────────────────────────────

/// Everything a writer needs for one run.
pub struct WriterParams<W> {
    /// Write half of the connection. Dropped when the writer stops.
    pub socket: W,
    /// Stamped as the sender of every outgoing package.
    pub local_uuid: Uuid,
    /// Version from the peer's handshake; gates heartbeats.
    pub peer_version: ProtocolVersion,
    pub routes: Arc<RouteTable>,
    /// Encrypted channel, if one was negotiated.
    pub tls: Option<Arc<TlsEngine>>,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Budget for writing one package, flush included.
    pub write_timeout: Duration,
    pub observer: Option<Arc<dyn SendObserver>>,
}

impl<W> WriterParams<W> {
    pub fn new(socket: W, local_uuid: Uuid, routes: Arc<RouteTable>) -> Self {
        Self {
            socket,
            local_uuid,
            peer_version: ProtocolVersion::CURRENT,
            routes,
            tls: None,
            heartbeat_interval: None,
            write_timeout: Duration::from_secs(30),
            observer: None,
        }
    }
}

// ── Shared control block ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    Running,
    /// The control package with this id is queued; pause once written.
    Pending(Uuid),
    Paused(Uuid),
}

#[derive(Debug)]
pub(crate) struct Control {
    pub state: WriterState,
    pub pause: Pause,
    pub stop_reason: Option<JobResult>,
    pub stop: Token,
}

#[derive(Debug)]
pub(crate) struct Shared {
    control: Mutex<Control>,
    /// notify_waiters on every state or pause change.
    changed: Notify,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().expect("writer control poisoned")
    }

    pub fn notify(&self) {
        self.changed.notify_waiters();
    }

    async fn wait_state<F>(&self, deadline: Option<Instant>, mut done: F) -> Result<WriterState, WaitError>
    where
        F: FnMut(WriterState) -> bool,
    {
        let never = Token::new();
        Sink::new(&never)
            .wait_until(&self.changed, deadline, || {
                let state = self.lock().state;
                done(state).then_some(state)
            })
            .await
    }
}

// ── SocketWriter ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct SocketWriter {
    jobs: Arc<JobManager>,
    shared: Arc<Shared>,
}

impl SocketWriter {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self {
            jobs,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: WriterState::Stopped,
                    pause: Pause::Running,
                    stop_reason: None,
                    stop: Token::new(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn state(&self) -> WriterState {
        self.shared.lock().state
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().pause != Pause::Running
    }

    /// Token signalled when the current writer run ends, for any reason.
    /// Companion tasks such as the connection reader stop on it.
    pub fn stop_token(&self) -> Token {
        self.shared.lock().stop.clone()
    }

    /// Why the writer last stopped.
    pub fn stop_reason(&self) -> Option<JobResult> {
        self.shared.lock().stop_reason
    }

    /// Spawn the writer task and wait until it reports `Started`, or until
    /// a startup failure collapses it back to `Stopped`.
    pub async fn start<W>(&self, params: WriterParams<W>, timeout: Duration) -> Result<(), IoError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stop = {
            let mut control = self.shared.lock();
            control.state.transition(WriterState::Starting)?;
            if params.routes.requires_ssl_by_default() && params.tls.is_none() {
                control.state.transition(WriterState::Stopped)?;
                return Err(IoError::TlsConfig(
                    "route table requires an encrypted channel".into(),
                ));
            }
            control.pause = Pause::Running;
            control.stop_reason = None;
            control.stop = Token::new();
            control.stop.clone()
        };
        self.shared.notify();

        let span = info_span!("writer", local = %params.local_uuid, peer_version = %params.peer_version);
        let run = task::WriterTask::new(self.jobs.clone(), self.shared.clone(), stop.clone(), params);
        tokio::spawn(run.run().instrument(span));

        let settled = self
            .shared
            .wait_state(Some(Instant::now() + timeout), |s| s != WriterState::Starting)
            .await;
        match settled {
            Ok(WriterState::Started) => Ok(()),
            Ok(_) => Err(IoError::Job(self.stop_reason().unwrap_or(JobResult::Fail))),
            Err(_) => {
                warn!(?timeout, "writer did not start in time");
                self.abort(JobResult::Timeout);
                Err(IoError::Timeout(timeout))
            }
        }
    }

    /// Queue `package`. Only accepted while `Started`; otherwise the handle
    /// already carries the refusal.
    pub fn submit(&self, package: Package, urgent: bool) -> JobHandle {
        self.jobs.init_active_job(package, urgent)
    }

    /// Send `package` urgently and pause user-job dispatch once it is
    /// written. On any failure the pause is rolled back.
    pub async fn send_and_pause_writing(
        &self,
        mut package: Package,
        timeout_ms: u64,
    ) -> Result<JobHandle, IoError> {
        let uuid = package.ensure_uuid();
        {
            let mut control = self.shared.lock();
            if control.state != WriterState::Started {
                return Err(IoError::InvalidState("writer is not started"));
            }
            if control.pause != Pause::Running {
                return Err(IoError::AlreadyPaused);
            }
            control.pause = Pause::Pending(uuid);
        }

        let handle = self.jobs.init_active_job(package, true);
        let outcome = handle.wait_for_send(timeout_ms).await;
        if outcome.result.is_success() {
            debug!(%uuid, "writing paused");
            self.shared.notify();
            return Ok(handle);
        }

        if outcome.result == JobResult::Timeout {
            handle.cancel();
        }
        self.rollback_pause(uuid);
        warn!(%uuid, result = %outcome.result, "pause rolled back");
        Err(IoError::Job(outcome.result))
    }

    /// Resume user-job dispatch after a pause.
    pub fn continue_writing(&self) -> Result<(), IoError> {
        {
            let mut control = self.shared.lock();
            match control.pause {
                Pause::Running => return Err(IoError::InvalidState("writing is not paused")),
                Pause::Pending(_) => {
                    return Err(IoError::InvalidState("pause request still in flight"));
                }
                Pause::Paused(_) => control.pause = Pause::Running,
            }
        }
        debug!("writing resumed");
        self.shared.notify();
        self.jobs.wake_consumer();
        Ok(())
    }

    fn rollback_pause(&self, uuid: Uuid) {
        {
            let mut control = self.shared.lock();
            if matches!(control.pause, Pause::Pending(id) | Pause::Paused(id) if id == uuid) {
                control.pause = Pause::Running;
            }
        }
        self.shared.notify();
        self.jobs.wake_consumer();
    }

    /// Ask the writer to stop with `reason`. The first recorded reason wins.
    pub fn abort(&self, reason: JobResult) {
        let stop = {
            let mut control = self.shared.lock();
            control.stop_reason.get_or_insert(reason);
            control.stop.clone()
        };
        stop.signal();
    }

    /// Stop the writer and wait until it has torn down. Returns the reason
    /// every outstanding job was failed with.
    pub async fn stop_write_thread(&self, timeout: Duration) -> Result<JobResult, IoError> {
        if self.state() == WriterState::Stopped {
            return Ok(self.stop_reason().unwrap_or(JobResult::ConnClosedByUser));
        }
        self.abort(JobResult::ConnClosedByUser);
        self.wait_stopped(timeout).await
    }

    /// Wait for the writer to reach `Stopped` without requesting it.
    pub async fn wait_stopped(&self, timeout: Duration) -> Result<JobResult, IoError> {
        self.shared
            .wait_state(Some(Instant::now() + timeout), |s| s == WriterState::Stopped)
            .await
            .map_err(|_| IoError::Timeout(timeout))?;
        Ok(self.stop_reason().unwrap_or(JobResult::ConnClosedByUser))
    }
}

impl Drop for SocketWriter {
    fn drop(&mut self) {
        let control = self.shared.lock();
        if control.state != WriterState::Stopped {
            control.stop.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};

    use futures::StreamExt;
    use tokio::io::{AsyncWrite, DuplexStream};
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::codec::PackageCodec;
    use crate::command;
    use crate::route::SecurityLevel;

    const WAIT: Duration = Duration::from_secs(5);

    /// Accepts `budget` bytes, then fails every write with a reset.
    struct FailingWriter {
        budget: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A socket that may move between threads but is not `Sync`.
    struct Unshared {
        inner: DuplexStream,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl AsyncWrite for Unshared {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<(&'static str, u32, Option<JobResult>)>>,
    }

    impl SendObserver for Recorder {
        fn before_send(&self, package: &Package) {
            self.events.lock().unwrap().push(("before", package.command(), None));
        }

        fn after_send(&self, package: &Package, result: JobResult) {
            self.events.lock().unwrap().push(("after", package.command(), Some(result)));
        }
    }

    fn writer(max_active: usize) -> SocketWriter {
        SocketWriter::new(JobManager::new(Uuid::new_v4(), max_active, 4))
    }

    fn params<W>(socket: W) -> WriterParams<W> {
        WriterParams::new(socket, Uuid::new_v4(), Arc::new(RouteTable::default()))
    }

    async fn start_duplex(w: &SocketWriter, buffer: usize) -> FramedRead<DuplexStream, PackageCodec> {
        let (ours, theirs) = tokio::io::duplex(buffer);
        w.start(params(ours), WAIT).await.unwrap();
        FramedRead::new(theirs, PackageCodec::new())
    }

    async fn next_package(rx: &mut FramedRead<DuplexStream, PackageCodec>) -> Package {
        tokio::time::timeout(WAIT, rx.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("decode failed")
    }

    fn bulk(cmd: u32, len: usize) -> Package {
        Package::with_buffers(cmd, [vec![0x5Au8; len]]).unwrap()
    }

    #[tokio::test]
    async fn start_submit_and_receive() {
        let w = writer(8);
        let mut rx = start_duplex(&w, 64 * 1024).await;
        assert_eq!(w.state(), WriterState::Started);

        let handle = w.submit(bulk(0x1001, 10), false);
        assert_eq!(handle.wait_for_send(5_000).await.result, JobResult::Success);

        let got = next_package(&mut rx).await;
        assert_eq!(got.command(), 0x1001);
        assert_eq!(got.uuid(), handle.uuid());
        assert_eq!(got.sender(), w.jobs().sender());
        assert_eq!(got.buffers()[0].len(), 10);
    }

    #[tokio::test]
    async fn socket_only_needs_to_be_send() {
        let w = writer(8);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let socket = Unshared {
            inner: ours,
            _not_sync: PhantomData,
        };
        w.start(params(socket), WAIT).await.unwrap();
        let mut rx = FramedRead::new(theirs, PackageCodec::new());

        let handle = w.submit(bulk(0x1002, 4), false);
        assert_eq!(handle.wait_for_send(5_000).await.result, JobResult::Success);
        assert_eq!(next_package(&mut rx).await.command(), 0x1002);
    }

    #[tokio::test]
    async fn submit_before_start_is_refused() {
        let w = writer(8);
        let handle = w.submit(bulk(0x1001, 1), false);
        assert!(handle.is_failed());
        assert_eq!(handle.send_result(), JobResult::ConnClosedByUser);
    }

    #[tokio::test]
    async fn high_security_without_tls_does_not_start() {
        let w = writer(8);
        let (ours, _theirs) = tokio::io::duplex(64);
        let mut p = params(ours);
        p.routes = Arc::new(RouteTable::for_level(SecurityLevel::High));
        assert!(matches!(w.start(p, WAIT).await, Err(IoError::TlsConfig(_))));
        assert_eq!(w.state(), WriterState::Stopped);
    }

    #[tokio::test]
    async fn required_ssl_route_without_tls_fails_only_that_job() {
        let w = writer(8);
        let mut rx = start_duplex(&w, 64 * 1024).await;

        let keyboard = w.submit(Package::new(command::KEYBOARD_SCANCODE), false);
        assert_eq!(keyboard.wait_for_send(5_000).await.result, JobResult::Fail);

        let plain = w.submit(bulk(0x1200, 4), false);
        assert_eq!(plain.wait_for_send(5_000).await.result, JobResult::Success);
        assert_eq!(next_package(&mut rx).await.command(), 0x1200);
        assert_eq!(w.state(), WriterState::Started);
    }

    #[tokio::test]
    async fn ceiling_and_urgent_ordering_on_a_live_writer() {
        let w = writer(3);
        // small pipe: the first job stalls mid-write until we read
        let mut rx = start_duplex(&w, 256).await;

        let first = w.submit(bulk(0x1000, 4096), false);
        while w.jobs().queued_count() != 0 {
            tokio::task::yield_now().await;
        }
        let second = w.submit(bulk(0x1001, 8), false);
        let third = w.submit(bulk(0x1002, 8), false);
        let fourth = w.submit(bulk(0x1003, 8), false);
        let fifth = w.submit(bulk(0x1004, 8), false);
        assert_eq!(fourth.send_result(), JobResult::SendQueueIsFull);
        assert_eq!(fifth.send_result(), JobResult::SendQueueIsFull);

        let urgent = w.submit(Package::new(command::DETACH_REQUEST), true);
        assert_eq!(urgent.send_result(), JobResult::SendPended);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(next_package(&mut rx).await.command());
        }
        assert_eq!(order, vec![0x1000, 0x1001, 0x1002, command::DETACH_REQUEST]);
        for h in [&first, &second, &third, &urgent] {
            assert_eq!(h.wait_for_send(5_000).await.result, JobResult::Success);
        }
    }

    #[tokio::test]
    async fn reset_mid_buffer_fails_every_job() {
        let w = writer(8);
        let observer = Arc::new(Recorder::default());
        let mut p = params(FailingWriter {
            // marker + header + one full buffer + half of the second
            budget: 1 + crate::header::HEADER_SIZE + 100 + 50,
        });
        p.observer = Some(observer.clone());
        w.start(p, WAIT).await.unwrap();

        w.shared.lock().pause = Pause::Paused(Uuid::nil());
        let writing = w.submit(
            Package::with_buffers(0x1100, [vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]]).unwrap(),
            false,
        );
        let waiting = w.submit(bulk(0x1101, 10), false);
        {
            w.shared.lock().pause = Pause::Running;
        }
        w.jobs().wake_consumer();

        assert_eq!(writing.wait_for_send(5_000).await.result, JobResult::ConnClosedByPeer);
        assert_eq!(writing.wait_for_response(5_000).await, Err(JobResult::ConnClosedByPeer));
        assert_eq!(waiting.wait_for_send(5_000).await.result, JobResult::ConnClosedByPeer);
        assert_eq!(waiting.wait_for_response(5_000).await, Err(JobResult::ConnClosedByPeer));

        assert_eq!(w.wait_stopped(WAIT).await.unwrap(), JobResult::ConnClosedByPeer);
        assert_eq!(w.state(), WriterState::Stopped);

        let events = observer.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ("before", 0x1100, None),
                ("after", 0x1100, Some(JobResult::ConnClosedByPeer)),
            ]
        );
    }

    #[tokio::test]
    async fn failed_pause_request_rolls_back() {
        let w = writer(8);
        w.start(params(FailingWriter { budget: 0 }), WAIT).await.unwrap();

        let res = w
            .send_and_pause_writing(Package::new(command::DETACH_REQUEST), 5_000)
            .await;
        assert!(matches!(res, Err(IoError::Job(JobResult::ConnClosedByPeer))));
        assert!(!w.is_paused());
        w.wait_stopped(WAIT).await.unwrap();
        assert_eq!(w.state(), WriterState::Stopped);
    }

    #[tokio::test]
    async fn pause_holds_user_jobs_until_continue() {
        let w = writer(8);
        let mut rx = start_duplex(&w, 64 * 1024).await;

        let detach = w
            .send_and_pause_writing(Package::new(command::DETACH_REQUEST), 5_000)
            .await
            .unwrap();
        assert_eq!(detach.send_result(), JobResult::Success);
        assert!(w.is_paused());
        assert_eq!(next_package(&mut rx).await.command(), command::DETACH_REQUEST);

        let again = w
            .send_and_pause_writing(Package::new(command::DETACH_REQUEST), 5_000)
            .await;
        assert!(matches!(again, Err(IoError::AlreadyPaused)));

        let held = w.submit(bulk(0x1300, 4), false);
        assert_eq!(held.wait_for_send(100).await.result, JobResult::Timeout);

        w.continue_writing().unwrap();
        assert_eq!(held.wait_for_send(5_000).await.result, JobResult::Success);
        assert_eq!(next_package(&mut rx).await.command(), 0x1300);
        assert!(w.continue_writing().is_err());
    }

    #[tokio::test]
    async fn heartbeats_flow_while_idle_and_paused() {
        let w = writer(8);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut p = params(ours);
        p.heartbeat_interval = Some(Duration::from_millis(20));
        w.start(p, WAIT).await.unwrap();
        let mut rx = FramedRead::new(theirs, PackageCodec::new());

        assert!(next_package(&mut rx).await.is_heartbeat());
        w.send_and_pause_writing(Package::new(command::DETACH_REQUEST), 5_000)
            .await
            .unwrap();
        let mut saw_heartbeat_after_pause = false;
        for _ in 0..4 {
            if next_package(&mut rx).await.is_heartbeat() {
                saw_heartbeat_after_pause = true;
            }
        }
        assert!(saw_heartbeat_after_pause);
    }

    #[tokio::test]
    async fn old_peer_gets_no_heartbeats() {
        let w = writer(8);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut p = params(ours);
        p.heartbeat_interval = Some(Duration::from_millis(10));
        p.peer_version = ProtocolVersion::new(1, 0);
        w.start(p, WAIT).await.unwrap();
        let mut rx = FramedRead::new(theirs, PackageCodec::new());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let h = w.submit(bulk(0x1000, 1), false);
        h.wait_for_send(5_000).await;
        assert_eq!(next_package(&mut rx).await.command(), 0x1000);
    }

    #[tokio::test]
    async fn stop_fails_queued_jobs_as_user_close() {
        let w = writer(8);
        let (ours, _theirs) = tokio::io::duplex(64 * 1024);
        w.start(params(ours), WAIT).await.unwrap();

        {
            w.shared.lock().pause = Pause::Paused(Uuid::nil());
        }
        let queued = w.submit(bulk(0x1000, 1), false);

        assert_eq!(w.stop_write_thread(WAIT).await.unwrap(), JobResult::ConnClosedByUser);
        assert_eq!(w.state(), WriterState::Stopped);
        assert!(!w.is_paused());
        assert_eq!(queued.wait_for_send(0).await.result, JobResult::ConnClosedByUser);

        let late = w.submit(bulk(0x1000, 1), false);
        assert_eq!(late.send_result(), JobResult::ConnClosedByUser);
    }

    #[tokio::test]
    async fn writer_restarts_after_stop() {
        let w = writer(8);
        let (ours, _theirs) = tokio::io::duplex(1024);
        w.start(params(ours), WAIT).await.unwrap();
        w.stop_write_thread(WAIT).await.unwrap();

        let mut rx = start_duplex(&w, 1024).await;
        let h = w.submit(bulk(0x1000, 1), false);
        assert_eq!(h.wait_for_send(5_000).await.result, JobResult::Success);
        assert_eq!(next_package(&mut rx).await.command(), 0x1000);
    }
}
