//! In-memory TLS engine shared by a connection's reader and writer.
//!
//! The engine never touches the socket. The reader feeds it raw records
//! and collects decrypted bytes; the writer hands it plaintext and drains
//! the records it produces.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use rustls::{Connection, HandshakeKind};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::identity::{Identity, Subject, fingerprint};
use crate::IoError;
use crate::cancel::{Sink, Token};

/// Result of feeding records into the engine.
#[derive(Debug, Default)]
pub struct Fed {
    pub plaintext: Vec<u8>,
    pub peer_closed: bool,
    /// The handshake completed during this call.
    pub handshake_done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerCheck {
    Pending,
    Passed,
    Failed(String, String),
}

struct EngineState {
    conn: Connection,
    check: PeerCheck,
}

pub struct TlsEngine {
    state: Mutex<EngineState>,
    identity: Arc<Identity>,
    /// notify_one: new records are waiting to be written.
    outgoing: Notify,
    /// notify_waiters: handshake or peer check state changed.
    progress: Notify,
}

impl TlsEngine {
    pub(crate) fn new(mut conn: Connection, identity: Arc<Identity>) -> Self {
        conn.set_buffer_limit(None);
        Self {
            state: Mutex::new(EngineState {
                conn,
                check: PeerCheck::Pending,
            }),
            identity,
            outgoing: Notify::new(),
            progress: Notify::new(),
        }
    }

    pub fn local_identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn is_handshaking(&self) -> bool {
        self.lock().conn.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.lock().conn.wants_write()
    }

    /// Signalled whenever records are ready for the socket.
    pub fn outgoing_signal(&self) -> &Notify {
        &self.outgoing
    }

    /// Encrypt `data`. Before the handshake finishes the bytes are held
    /// and released once it does.
    pub fn write_plaintext(&self, data: &[u8]) -> Result<(), IoError> {
        self.lock().conn.writer().write_all(data)?;
        self.outgoing.notify_one();
        Ok(())
    }

    /// Take every record the engine wants to send.
    pub fn take_outgoing(&self) -> Result<Vec<u8>, IoError> {
        let mut out = Vec::new();
        let mut state = self.lock();
        while state.conn.wants_write() {
            state.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    /// Feed raw records read from the socket.
    pub fn feed_records(&self, mut data: &[u8]) -> Result<Fed, IoError> {
        let mut fed = Fed::default();
        {
            let mut state = self.lock();
            let was_handshaking = state.conn.is_handshaking();
            while !data.is_empty() {
                state.conn.read_tls(&mut data)?;
                let io = state.conn.process_new_packets()?;
                let available = io.plaintext_bytes_to_read();
                if available > 0 {
                    let start = fed.plaintext.len();
                    fed.plaintext.resize(start + available, 0);
                    state.conn.reader().read_exact(&mut fed.plaintext[start..])?;
                }
                fed.peer_closed |= io.peer_has_closed();
            }
            fed.handshake_done = was_handshaking && !state.conn.is_handshaking();
            if fed.handshake_done {
                info!(
                    suite = ?state.conn.negotiated_cipher_suite().map(|s| s.suite()),
                    kind = ?state.conn.handshake_kind(),
                    "tls handshake complete"
                );
            }
        }
        if self.wants_write() {
            self.outgoing.notify_one();
        }
        if fed.handshake_done {
            self.progress.notify_waiters();
        }
        Ok(fed)
    }

    /// Verify the peer's role once the handshake is done. The outcome is
    /// remembered; later calls return it without re-checking.
    pub fn verify_peer_once(&self) -> Result<(), IoError> {
        let mut state = self.lock();
        if state.conn.is_handshaking() {
            return Err(IoError::InvalidState("tls handshake still in progress"));
        }
        if state.check == PeerCheck::Pending {
            state.check = match check_peer_identity(&state.conn, &self.identity) {
                Ok(()) => PeerCheck::Passed,
                Err(IoError::PeerIdentity { expected, actual }) => PeerCheck::Failed(expected, actual),
                Err(e) => return Err(e),
            };
        }
        match &state.check {
            PeerCheck::Failed(expected, actual) => Err(IoError::PeerIdentity {
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Wait until the handshake completes.
    pub async fn wait_handshake(&self, token: &Token, deadline: Option<Instant>) -> Result<(), IoError> {
        Sink::new(token)
            .wait_until(&self.progress, deadline, || (!self.is_handshaking()).then_some(()))
            .await?;
        Ok(())
    }

    /// Queue a close_notify alert.
    pub fn close(&self) {
        self.lock().conn.send_close_notify();
        self.outgoing.notify_one();
    }

    /// Release anyone parked on the engine, e.g. during teardown.
    pub fn wake_all(&self) {
        self.progress.notify_waiters();
        self.outgoing.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("tls engine poisoned")
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.is_handshaking())
            .field("identity", &self.identity)
            .finish()
    }
}

/// Post-handshake role check. Skipped for resumed sessions and whenever
/// either side is anonymous.
fn check_peer_identity(conn: &Connection, local: &Identity) -> Result<(), IoError> {
    if conn.handshake_kind() == Some(HandshakeKind::Resumed) {
        debug!("resumed session, peer check skipped");
        return Ok(());
    }
    if local.is_anonymous() {
        return Ok(());
    }
    let Some(peer_cert) = conn.peer_certificates().and_then(|c| c.first()) else {
        return Ok(());
    };
    let peer = Subject::parse(peer_cert)?;
    if peer.is_anonymous() {
        debug!(peer = %fingerprint(peer_cert), "anonymous peer, check skipped");
        return Ok(());
    }
    let expected = local.subject().role_or_cn().unwrap_or_default();
    let actual = peer.role_or_cn().unwrap_or_default();
    if expected != actual {
        return Err(IoError::PeerIdentity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    debug!(peer = %fingerprint(peer_cert), role = actual, "peer identity verified");
    Ok(())
}
