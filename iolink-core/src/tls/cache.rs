//! Process-wide cache of ephemeral anonymous identities, keyed by key size.
//!
//! Generated lazily on first use and kept for the life of the process, so
//! connections without credentials do not pay for key generation each time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use super::identity::{ANONYMOUS_ROLE, Identity};
use crate::IoError;

/// Key size used when none is requested.
pub const DEFAULT_EPHEMERAL_BITS: u32 = 256;

#[derive(Debug, Default)]
pub struct EphemeralIdentityCache {
    entries: Mutex<HashMap<u32, Arc<Identity>>>,
}

impl EphemeralIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static EphemeralIdentityCache {
        static CACHE: OnceLock<EphemeralIdentityCache> = OnceLock::new();
        CACHE.get_or_init(EphemeralIdentityCache::new)
    }

    /// The anonymous identity for `bits` (256 or 384), generating it once.
    pub fn get(&self, bits: u32) -> Result<Arc<Identity>, IoError> {
        let alg = match bits {
            256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            other => {
                return Err(IoError::TlsConfig(format!(
                    "unsupported ephemeral key size {other}"
                )));
            }
        };
        let mut entries = self.entries.lock().expect("identity cache poisoned");
        if let Some(identity) = entries.get(&bits) {
            return Ok(identity.clone());
        }
        let identity = Arc::new(Identity::generate_with(ANONYMOUS_ROLE, ANONYMOUS_ROLE, alg)?);
        debug!(bits, fingerprint = identity.fingerprint(), "ephemeral identity generated");
        entries.insert(bits, identity.clone());
        Ok(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("identity cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
