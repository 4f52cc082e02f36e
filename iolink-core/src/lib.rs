//! # iolink-core
//!
//! Package transport layer for a peer-to-peer management link.
//!
//! This crate contains:
//! - **Wire format**: `Handshake`, `PackageHeader`, `Package` and the
//!   `PackageCodec` for framed I/O via `tokio_util`
//! - **Jobs**: `JobManager` and `SendJob`, correlating every submitted
//!   package with its send completion and its responses
//! - **Routing**: `RouteTable`, choosing plain or TLS transport per command
//! - **TLS**: rustls-backed tunnel with certificate or anonymous identities
//! - **Writer**: `SocketWriter`, the per-connection task that owns the
//!   socket's write half (heartbeats, pause for detach, teardown)
//! - **Network**: `Connection`, handshake plus writer and reader tasks
//! - **Cancellation**: `Token`/`Sink` and the `BoundedQueue` built on them
//! - **Error**: `IoError`, a `thiserror`-based error hierarchy

pub mod cancel;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod handshake;
pub mod header;
pub mod job;
pub mod network;
pub mod package;
pub mod queue;
pub mod route;
pub mod state;
pub mod tls;
pub mod writer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use cancel::{Sink, Token, WaitError};
pub use codec::PackageCodec;
pub use config::TransportConfig;
pub use error::IoError;
pub use handshake::{Handshake, ProtocolVersion};
pub use header::{HEADER_SIZE, MAX_BUFFER_SIZE, MAX_BUFFERS, PackageHeader};
pub use job::{JobHandle, JobManager, JobResult, SendJob, SendOutcome};
pub use network::Connection;
pub use package::Package;
pub use queue::BoundedQueue;
pub use route::{Criticality, Route, RouteTable, SecurityLevel, TransportMode, TransportModes};
pub use state::{SenderPhase, WriterState};
pub use tls::{CertificateAuthority, Identity, TlsContext, TlsEngine, TlsRole};
pub use writer::{SendObserver, SocketWriter, WriterParams};
