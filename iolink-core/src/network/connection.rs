use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::reader::Reader;
use crate::IoError;
use crate::cancel::{deadline_after, remaining_ms};
use crate::command;
use crate::config::TransportConfig;
use crate::handshake::{Handshake, exchange_handshake};
use crate::job::{JobHandle, JobManager, JobResult};
use crate::package::Package;
use crate::state::{SenderPhase, WriterState};
use crate::tls::{TlsContext, TlsEngine};
use crate::writer::{SendObserver, SocketWriter, WriterParams};

/// Unsolicited packages buffered for the application.
const INBOUND_CAPACITY: usize = 256;

/// One established transport connection: a writer task draining the job
/// pool onto the socket and a reader task routing what comes back.
///
/// Responses to submitted packages are delivered through their
/// [`JobHandle`]; everything else arrives through [`recv`](Self::recv).
#[derive(Debug)]
pub struct Connection {
    local: Uuid,
    peer: Handshake,
    peer_uuid: Arc<OnceLock<Uuid>>,
    phase: Mutex<SenderPhase>,
    writer: Arc<SocketWriter>,
    tls: Option<Arc<TlsEngine>>,
    inbound: mpsc::Receiver<Package>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl Connection {
    /// Run the handshake over `stream` and start the writer and reader.
    ///
    /// A TLS engine is created when the configured route table uses the
    /// encrypted channel and `tls` is given. Both peers must agree on this.
    pub async fn establish<S>(
        stream: S,
        config: &TransportConfig,
        tls: Option<&TlsContext>,
    ) -> Result<Self, IoError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::establish_with(stream, config, tls, None).await
    }

    /// Like [`establish`](Self::establish) with a send observer.
    pub async fn establish_with<S>(
        stream: S,
        config: &TransportConfig,
        tls: Option<&TlsContext>,
        observer: Option<Arc<dyn SendObserver>>,
    ) -> Result<Self, IoError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut phase = SenderPhase::default();
        phase.begin_connect()?;

        let local = Uuid::new_v4();
        let (mut rd, mut wr) = tokio::io::split(stream);
        let hello = Handshake::local(&config.handshake.description);
        let peer = exchange_handshake(&mut rd, &mut wr, &hello, config.handshake_timeout()).await?;
        if !peer.version.is_compatible() {
            return Err(IoError::UnsupportedVersion {
                major: peer.version.major,
                minor: peer.version.minor,
            });
        }

        let routes = Arc::new(config.route_table());
        let engine = match tls {
            Some(ctx) if routes.uses_ssl() => Some(Arc::new(ctx.new_engine()?)),
            _ => None,
        };

        let jobs = JobManager::new(
            local,
            config.max_active_jobs(),
            config.jobs.response_history.max(1),
        );
        let writer = Arc::new(SocketWriter::new(jobs.clone()));

        let mut params = WriterParams::new(wr, local, routes);
        params.peer_version = peer.version;
        params.tls = engine.clone();
        params.heartbeat_interval = config.heartbeat_interval();
        params.write_timeout = config.write_timeout();
        params.observer = observer;
        if let Err(e) = writer.start(params, config.start_timeout()).await {
            phase.force_disconnect();
            return Err(e);
        }

        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let peer_uuid = Arc::new(OnceLock::new());
        let reader = Reader::new(
            rd,
            engine.clone(),
            jobs,
            tx,
            peer_uuid.clone(),
            writer.stop_token(),
        );
        let reader = tokio::spawn(
            reader
                .run(Arc::downgrade(&writer))
                .instrument(info_span!("reader", %local)),
        );

        phase.complete_connect()?;
        info!(
            %local,
            peer_version = %peer.version,
            peer = peer.description(),
            tls = engine.is_some(),
            "connection established"
        );

        Ok(Self {
            local,
            peer,
            peer_uuid,
            phase: Mutex::new(phase),
            writer,
            tls: engine,
            inbound,
            reader: Mutex::new(Some(reader)),
            stop_timeout: config.start_timeout(),
        })
    }

    /// Connect over TCP and establish.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: &TransportConfig,
        tls: Option<&TlsContext>,
    ) -> Result<Self, IoError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::establish(stream, config, tls).await
    }

    /// Accept one TCP peer and establish.
    pub async fn accept(
        listener: &TcpListener,
        config: &TransportConfig,
        tls: Option<&TlsContext>,
    ) -> Result<(Self, SocketAddr), IoError> {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let conn = Self::establish(stream, config, tls).await?;
        Ok((conn, addr))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn local_uuid(&self) -> Uuid {
        self.local
    }

    /// The peer's handshake record.
    pub fn peer(&self) -> &Handshake {
        &self.peer
    }

    /// The peer's connection id, taken from the sender field of the first
    /// package it sent. `None` until anything arrived.
    pub fn peer_uuid(&self) -> Option<Uuid> {
        self.peer_uuid.get().copied()
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        self.writer.jobs()
    }

    pub fn tls(&self) -> Option<&Arc<TlsEngine>> {
        self.tls.as_ref()
    }

    pub fn writer_state(&self) -> WriterState {
        self.writer.state()
    }

    pub fn is_paused(&self) -> bool {
        self.writer.is_paused()
    }

    /// The sender phase. A writer that stopped on its own drops the
    /// phase to `Disconnected`.
    pub fn phase(&self) -> SenderPhase {
        let mut phase = self.lock_phase();
        if phase.is_connected() && self.writer.state() == WriterState::Stopped {
            phase.force_disconnect();
        }
        phase.clone()
    }

    /// Why the connection stopped, once it has.
    pub fn stop_reason(&self) -> Option<JobResult> {
        self.writer.stop_reason()
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Queue `package`; the handle reports the send and any responses.
    pub fn submit(&self, package: Package) -> JobHandle {
        self.writer.submit(package, false)
    }

    /// Queue `package` past the active-job ceiling.
    pub fn submit_urgent(&self, package: Package) -> JobHandle {
        self.writer.submit(package, true)
    }

    /// Queue `package` and wait until it is written.
    pub async fn send(&self, package: Package, timeout_ms: u64) -> Result<JobHandle, IoError> {
        let handle = self.submit(package);
        let outcome = handle.wait_for_send(timeout_ms).await;
        if outcome.result.is_success() {
            return Ok(handle);
        }
        if outcome.result == JobResult::Timeout {
            handle.cancel();
        }
        Err(IoError::Job(outcome.result))
    }

    /// Send `package` and wait for the first response to it. `timeout_ms`
    /// bounds the whole exchange, not each step.
    pub async fn request(&self, package: Package, timeout_ms: u64) -> Result<Arc<Package>, IoError> {
        let deadline = deadline_after(timeout_ms);
        let handle = self.send(package, timeout_ms).await?;
        let Some(left) = remaining_ms(deadline) else {
            return Err(IoError::Job(JobResult::Timeout));
        };
        handle.wait_for_response(left).await.map_err(IoError::Job)
    }

    /// Next unsolicited package. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Package> {
        self.inbound.recv().await
    }

    // ── Detach ───────────────────────────────────────────────────

    /// Send a detach request and hold back user packages once it is out.
    pub async fn pause_for_detach(&self, timeout_ms: u64) -> Result<JobHandle, IoError> {
        self.writer
            .send_and_pause_writing(Package::new(command::DETACH_REQUEST), timeout_ms)
            .await
    }

    pub fn continue_writing(&self) -> Result<(), IoError> {
        self.writer.continue_writing()
    }

    // ── Stop ─────────────────────────────────────────────────────

    /// Stop both tasks. Outstanding jobs fail with `ConnClosedByUser`
    /// unless the connection already failed for another reason, which is
    /// then returned.
    pub async fn stop(&self) -> Result<JobResult, IoError> {
        {
            let mut phase = self.lock_phase();
            match *phase {
                SenderPhase::Disconnected => {
                    return Ok(self.stop_reason().unwrap_or(JobResult::ConnClosedByUser));
                }
                SenderPhase::Disconnecting => {}
                _ => phase.begin_disconnect()?,
            }
        }

        let result = self.writer.stop_write_thread(self.stop_timeout).await;
        let reader = self.reader.lock().expect("reader slot poisoned").take();
        if let Some(reader) = reader {
            if tokio::time::timeout(self.stop_timeout, reader).await.is_err() {
                warn!(local = %self.local, "reader did not finish in time");
            }
        }

        let mut phase = self.lock_phase();
        if phase.finish_disconnect().is_err() {
            phase.force_disconnect();
        }
        result
    }

    /// Wait until the connection stops without requesting it.
    pub async fn closed(&self, timeout: Duration) -> Result<JobResult, IoError> {
        self.writer.wait_stopped(timeout).await
    }

    fn lock_phase(&self) -> MutexGuard<'_, SenderPhase> {
        self.phase.lock().expect("sender phase poisoned")
    }
}
