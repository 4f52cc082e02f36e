use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::io::{WriteDeadline, drain_engine, flush_by, write_all_by};
use super::{Pause, SendObserver, Shared, WriterParams};
use crate::IoError;
use crate::cancel::{Token, sleep_until_opt};
use crate::command;
use crate::header::FRAME_MARKER;
use crate::job::{JobManager, JobResult, SendJob};
use crate::package::Package;
use crate::route::{RouteTable, TransportMode};
use crate::state::WriterState;
use crate::tls::TlsEngine;

/// Plaintext handed to the TLS engine per call.
const TLS_CHUNK: usize = 16 * 1024;

/// Budget for the close_notify flush during an orderly stop.
const CLOSE_FLUSH: Duration = Duration::from_secs(1);

pub(super) struct WriterTask<W> {
    jobs: Arc<JobManager>,
    shared: Arc<Shared>,
    stop: Token,
    socket: W,
    routes: Arc<RouteTable>,
    tls: Option<Arc<TlsEngine>>,
    heartbeat: Option<Duration>,
    write_timeout: Duration,
    observer: Option<Arc<dyn SendObserver>>,
}

impl<W> WriterTask<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        jobs: Arc<JobManager>,
        shared: Arc<Shared>,
        stop: Token,
        params: WriterParams<W>,
    ) -> Self {
        let heartbeat = params
            .heartbeat_interval
            .filter(|_| params.peer_version.supports_heartbeat());
        if params.heartbeat_interval.is_some() && heartbeat.is_none() {
            debug!(peer_version = %params.peer_version, "peer predates heartbeats");
        }
        Self {
            jobs,
            shared,
            stop,
            socket: params.socket,
            routes: params.routes,
            tls: params.tls,
            heartbeat,
            write_timeout: params.write_timeout,
            observer: params.observer,
        }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.startup().await {
            error!(error = %e, "writer failed to start");
            self.collapse(e.job_result());
            return;
        }

        let outcome = self.steady().await;
        let reason = match &outcome {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "writer stopping on error");
                Some(e.job_result())
            }
        };
        self.teardown(reason).await;
    }

    // ── Start ────────────────────────────────────────────────────

    async fn startup(&mut self) -> Result<(), IoError> {
        if let Some(engine) = &self.tls {
            drain_engine(&mut self.socket, engine, WriteDeadline::after(self.write_timeout)).await?;
        }
        {
            let mut control = self.shared.lock();
            if self.stop.is_cancelled() {
                return Err(IoError::ClosedByUser);
            }
            control.state.transition(WriterState::Started)?;
        }
        self.jobs.start_accepting();
        self.shared.notify();
        info!(heartbeat = ?self.heartbeat, tls = self.tls.is_some(), "writer started");
        Ok(())
    }

    fn collapse(&self, reason: JobResult) {
        self.stop.signal();
        {
            let mut control = self.shared.lock();
            control.stop_reason.get_or_insert(reason);
            control.pause = Pause::Running;
            let _ = control.state.transition(WriterState::Stopped);
        }
        self.jobs.fail_all(reason);
        self.shared.notify();
    }

    // ── Steady state ─────────────────────────────────────────────

    /// Runs until stop is requested (`Ok`) or a write fails (`Err`).
    async fn steady(&mut self) -> Result<(), IoError> {
        let mut next_heartbeat = self.heartbeat.map(|i| Instant::now() + i);

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            if let Some(engine) = self.tls.clone() {
                drain_engine(&mut self.socket, &engine, WriteDeadline::after(self.write_timeout))
                    .await?;
            }

            let heartbeat_due = next_heartbeat.is_some_and(|at| at <= Instant::now());
            let job = if heartbeat_due {
                next_heartbeat = self.heartbeat.map(|i| Instant::now() + i);
                self.jobs.heartbeat_job()
            } else if self.is_paused() {
                None
            } else {
                self.jobs.next_active_job()
            };

            match job {
                Some(job) => self.dispatch(job).await?,
                None => self.idle(next_heartbeat).await,
            }
        }
    }

    fn is_paused(&self) -> bool {
        matches!(self.shared.lock().pause, Pause::Paused(_))
    }

    async fn idle(&mut self, next_heartbeat: Option<Instant>) {
        let outgoing = async {
            match &self.tls {
                Some(engine) => engine.outgoing_signal().notified().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {}
            _ = self.jobs.work_signal().notified() => {}
            _ = outgoing => {}
            _ = sleep_until_opt(next_heartbeat) => {}
        }
    }

    async fn dispatch(&mut self, job: Arc<SendJob>) -> Result<(), IoError> {
        let package = job.package().clone();
        let user_job = !package.is_heartbeat();

        let mode = match self.routes.find_route(package.command()).resolve(self.tls.is_some()) {
            Some(mode) => mode,
            None => {
                warn!(
                    command = %command::describe(package.command()),
                    "no encrypted channel for required route"
                );
                self.finish(&job, &package, user_job, JobResult::Fail);
                return Ok(());
            }
        };

        if user_job {
            if let Some(observer) = &self.observer {
                observer.before_send(&package);
            }
        }

        let written = match mode {
            TransportMode::Plain => self.write_plain(&package).await,
            TransportMode::Ssl => self.write_ssl(&package).await,
        };

        match written {
            Ok(()) => {
                trace!(uuid = %package.uuid(), command = %command::describe(package.command()), %mode, "package sent");
                self.mark_paused_if_pending(&package);
                self.finish(&job, &package, user_job, JobResult::Success);
                Ok(())
            }
            Err(e) => {
                self.finish(&job, &package, user_job, e.job_result());
                Err(e)
            }
        }
    }

    fn finish(&self, job: &Arc<SendJob>, package: &Package, user_job: bool, result: JobResult) {
        self.jobs.put_active_job(job, result);
        if !user_job {
            return;
        }
        if let Some(observer) = &self.observer {
            observer.after_send(package, job.send_result().unwrap_or(result));
        }
    }

    fn mark_paused_if_pending(&self, package: &Package) {
        let mut control = self.shared.lock();
        if control.pause == Pause::Pending(package.uuid()) {
            control.pause = Pause::Paused(package.uuid());
        }
    }

    async fn write_plain(&mut self, package: &Package) -> Result<(), IoError> {
        let deadline = WriteDeadline::after(self.write_timeout);
        let mut head = [0u8; 1 + crate::header::HEADER_SIZE];
        head[0] = FRAME_MARKER;
        head[1..].copy_from_slice(&package.header().encode());
        write_all_by(&mut self.socket, &head, deadline).await?;
        for buf in package.buffers() {
            write_all_by(&mut self.socket, buf, deadline).await?;
        }
        flush_by(&mut self.socket, deadline).await
    }

    async fn write_ssl(&mut self, package: &Package) -> Result<(), IoError> {
        let Some(engine) = self.tls.clone() else {
            return Err(IoError::EncryptionUnavailable(package.command()));
        };
        let deadline = WriteDeadline::after(self.write_timeout);
        self.complete_handshake(&engine, deadline).await?;
        engine.verify_peer_once()?;

        let mut head = BytesMut::with_capacity(1 + crate::header::HEADER_SIZE);
        head.extend_from_slice(&[FRAME_MARKER]);
        head.extend_from_slice(&package.header().encode());
        engine.write_plaintext(&head)?;
        drain_engine(&mut self.socket, &engine, deadline).await?;
        for buf in package.buffers() {
            for chunk in buf.chunks(TLS_CHUNK) {
                engine.write_plaintext(chunk)?;
                drain_engine(&mut self.socket, &engine, deadline).await?;
            }
        }
        Ok(())
    }

    /// Keep draining handshake records until the engine is ready.
    async fn complete_handshake(&mut self, engine: &TlsEngine, deadline: WriteDeadline) -> Result<(), IoError> {
        while engine.is_handshaking() {
            drain_engine(&mut self.socket, engine, deadline).await?;
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(IoError::ClosedByUser),
                res = engine.wait_handshake(&self.stop, Some(deadline.at)) => {
                    if let Err(IoError::Timeout(_)) = res {
                        return Err(IoError::Timeout(deadline.budget));
                    }
                }
                _ = engine.outgoing_signal().notified() => {}
            }
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn teardown(mut self, error: Option<JobResult>) {
        self.stop.signal();
        let reason = {
            let mut control = self.shared.lock();
            let reason = *control
                .stop_reason
                .get_or_insert(error.unwrap_or(JobResult::ConnClosedByUser));
            let _ = control.state.transition(WriterState::Stopping);
            reason
        };
        self.shared.notify();

        let failed = self.jobs.fail_all(reason);

        if let Some(engine) = self.tls.take() {
            if error.is_none() {
                engine.close();
                let _ = drain_engine(&mut self.socket, &engine, WriteDeadline::after(CLOSE_FLUSH)).await;
            }
            engine.wake_all();
        }
        if error.is_none() {
            let _ = tokio::time::timeout(CLOSE_FLUSH, self.socket.shutdown()).await;
        }
        drop(self.socket);

        {
            let mut control = self.shared.lock();
            control.pause = Pause::Running;
            let _ = control.state.transition(WriterState::Stopped);
        }
        self.shared.notify();
        info!(%reason, failed, "writer stopped");
    }
}
