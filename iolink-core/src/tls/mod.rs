//! TLS tunnel support: identities, the shared per-role context, peer
//! verification and the in-memory engine driven by a connection.

mod cache;
mod context;
mod engine;
mod identity;
mod verifier;

pub use cache::{DEFAULT_EPHEMERAL_BITS, EphemeralIdentityCache};
pub use context::{TlsContext, TlsRole};
pub use engine::{Fed, TlsEngine};
pub use identity::{ANONYMOUS_ROLE, CertificateAuthority, Identity, ROLE_OID, Subject, fingerprint};
pub use verifier::PeerVerifier;

/// Whether `byte` starts a TLS record (change_cipher_spec through heartbeat).
pub fn is_record_type(byte: u8) -> bool {
    (20..=24).contains(&byte)
}

/// Length of a TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record length a peer may announce (2^14 plus expansion).
pub const MAX_RECORD_LEN: usize = 16384 + 2048;
