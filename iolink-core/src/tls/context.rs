use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::ServerSessionMemoryCache;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tracing::info;

use super::cache::{DEFAULT_EPHEMERAL_BITS, EphemeralIdentityCache};
use super::engine::TlsEngine;
use super::identity::Identity;
use super::verifier::PeerVerifier;
use crate::IoError;

/// Name sent by initiators. Peers are not identified by host name.
const PEER_SERVER_NAME: &str = "iolink.peer";
const SESSION_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Opened the connection; runs the TLS client side.
    Initiator,
    /// Accepted the connection; runs the TLS server side.
    Acceptor,
}

enum RoleConfig {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// Shared TLS configuration for one role. Build once, then create one
/// engine per connection.
pub struct TlsContext {
    role: TlsRole,
    identity: Arc<Identity>,
    config: RoleConfig,
}

impl TlsContext {
    /// Without credentials the context runs anonymously using the cached
    /// ephemeral identity.
    pub fn new(role: TlsRole, credentials: Option<Identity>) -> Result<Self, IoError> {
        let identity = match credentials {
            Some(identity) => Arc::new(identity),
            None => EphemeralIdentityCache::global().get(DEFAULT_EPHEMERAL_BITS)?,
        };
        Self::with_identity(role, identity)
    }

    pub fn with_identity(role: TlsRole, identity: Arc<Identity>) -> Result<Self, IoError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(PeerVerifier::new(&identity, &provider)?);
        let config = match role {
            TlsRole::Initiator => RoleConfig::Client(client_config(&identity, &provider, verifier)?),
            TlsRole::Acceptor => RoleConfig::Server(server_config(&identity, &provider, verifier)?),
        };
        info!(
            ?role,
            anonymous = identity.is_anonymous(),
            fingerprint = identity.fingerprint(),
            "tls context ready"
        );
        Ok(Self {
            role,
            identity,
            config,
        })
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.is_anonymous()
    }

    /// A fresh engine for one connection.
    pub fn new_engine(&self) -> Result<TlsEngine, IoError> {
        let conn: rustls::Connection = match &self.config {
            RoleConfig::Client(config) => {
                let name = ServerName::try_from(PEER_SERVER_NAME)
                    .map_err(|e| IoError::TlsConfig(e.to_string()))?;
                ClientConnection::new(config.clone(), name)?.into()
            }
            RoleConfig::Server(config) => ServerConnection::new(config.clone())?.into(),
        };
        Ok(TlsEngine::new(conn, self.identity.clone()))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .finish()
    }
}

fn client_config(
    identity: &Identity,
    provider: &Arc<CryptoProvider>,
    verifier: Arc<PeerVerifier>,
) -> Result<Arc<ClientConfig>, IoError> {
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.presented_chain(), identity.private_key())?;
    Ok(Arc::new(config))
}

fn server_config(
    identity: &Identity,
    provider: &Arc<CryptoProvider>,
    verifier: Arc<PeerVerifier>,
) -> Result<Arc<ServerConfig>, IoError> {
    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.presented_chain(), identity.private_key())?;
    config.session_storage = ServerSessionMemoryCache::new(SESSION_CACHE_SIZE);
    Ok(Arc::new(config))
}
