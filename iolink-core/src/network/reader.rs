//! Connection reader.
//!
//! One task per connection reads the socket and splits it into wire units:
//! plain package units (`0xA5` marker) go straight to a [`PackageCodec`],
//! TLS records are fed to the shared engine and the decrypted stream is
//! decoded by a second codec. Decoded packages are either responses to a
//! local job or unsolicited traffic for the application.

use std::sync::{Arc, OnceLock, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::IoError;
use crate::cancel::Token;
use crate::codec::PackageCodec;
use crate::header::FRAME_MARKER;
use crate::job::JobManager;
use crate::package::Package;
use crate::tls::{self, MAX_RECORD_LEN, RECORD_HEADER_LEN, TlsEngine};
use crate::writer::SocketWriter;

const READ_CHUNK: usize = 64 * 1024;

enum Unit {
    Package(Package),
    Record(Bytes),
}

pub(crate) struct Reader<R> {
    socket: R,
    buf: BytesMut,
    plain: PackageCodec,
    tls: Option<Arc<TlsEngine>>,
    decrypted: BytesMut,
    sealed: PackageCodec,
    jobs: Arc<JobManager>,
    inbound: mpsc::Sender<Package>,
    peer: Arc<OnceLock<Uuid>>,
    stop: Token,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(
        socket: R,
        tls: Option<Arc<TlsEngine>>,
        jobs: Arc<JobManager>,
        inbound: mpsc::Sender<Package>,
        peer: Arc<OnceLock<Uuid>>,
        stop: Token,
    ) -> Self {
        Self {
            socket,
            buf: BytesMut::with_capacity(READ_CHUNK),
            plain: PackageCodec::new(),
            tls,
            decrypted: BytesMut::new(),
            sealed: PackageCodec::new(),
            jobs,
            inbound,
            peer,
            stop,
        }
    }

    /// Read until stopped or the stream fails. A failure stops the writer,
    /// which fails every outstanding job with the classified result.
    pub async fn run(mut self, writer: Weak<SocketWriter>) {
        let Err(e) = self.pump().await else {
            debug!("reader stopped");
            return;
        };

        match &e {
            IoError::ClosedByPeer => info!("peer closed the connection"),
            e if e.is_protocol_violation() => error!(error = %e, "protocol violation"),
            e => warn!(error = %e, "read failed"),
        }
        if let Some(writer) = writer.upgrade() {
            writer.abort(e.job_result());
        }
        if let Some(engine) = &self.tls {
            engine.wake_all();
        }
    }

    async fn pump(&mut self) -> Result<(), IoError> {
        loop {
            while let Some(unit) = self.next_unit()? {
                match unit {
                    Unit::Package(package) => self.deliver(package).await,
                    Unit::Record(record) => self.open_record(&record).await?,
                }
                if self.stop.is_cancelled() {
                    return Ok(());
                }
            }

            self.buf.reserve(READ_CHUNK);
            let n = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                n = self.socket.read_buf(&mut self.buf) => n?,
            };
            if n == 0 {
                return Err(IoError::ClosedByPeer);
            }
            trace!(read = n, buffered = self.buf.len(), "socket read");
        }
    }

    /// Split the next complete wire unit off the read buffer.
    fn next_unit(&mut self) -> Result<Option<Unit>, IoError> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };

        if self.plain.is_mid_package() || first == FRAME_MARKER {
            return Ok(self.plain.decode(&mut self.buf)?.map(Unit::Package));
        }
        if !tls::is_record_type(first) {
            return Err(IoError::UnknownFrameMarker(first));
        }
        if self.tls.is_none() {
            return Err(IoError::ProtocolViolation("tls record on a plain connection"));
        }
        if self.buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        if len > MAX_RECORD_LEN {
            return Err(IoError::ProtocolViolation("tls record too long"));
        }
        if self.buf.len() < RECORD_HEADER_LEN + len {
            return Ok(None);
        }
        Ok(Some(Unit::Record(self.buf.split_to(RECORD_HEADER_LEN + len).freeze())))
    }

    async fn open_record(&mut self, record: &[u8]) -> Result<(), IoError> {
        let Some(engine) = self.tls.clone() else {
            return Err(IoError::ProtocolViolation("tls record on a plain connection"));
        };
        let fed = engine.feed_records(record)?;
        if fed.handshake_done {
            engine.verify_peer_once()?;
        }

        self.decrypted.extend_from_slice(&fed.plaintext);
        while let Some(package) = self.sealed.decode(&mut self.decrypted)? {
            self.deliver(package).await;
        }
        if fed.peer_closed {
            return Err(IoError::ClosedByPeer);
        }
        Ok(())
    }

    async fn deliver(&mut self, package: Package) {
        let sender = package.sender();
        if !sender.is_nil() && self.peer.set(sender).is_ok() {
            debug!(peer = %sender, "peer identified");
        }
        if package.is_heartbeat() {
            trace!(sender = %package.sender(), "heartbeat");
            return;
        }

        let uuid = package.uuid();
        if let Some(job) = self.jobs.find_job_by_response(&package) {
            match job.push_response(Arc::new(package), &self.stop, 0).await {
                Ok(()) => trace!(%uuid, "response routed"),
                Err(result) => debug!(%uuid, %result, "response dropped"),
            }
            return;
        }

        // never blocks; a full backlog drops the package
        match self.inbound.try_send(package) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(%uuid, command = dropped.command(), "inbound backlog full, package dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(%uuid, "no inbound receiver, package dropped");
            }
        }
    }
}
