//! Certificate verification shared by both roles.
//!
//! Anonymous peers are always accepted; their handshake signatures are
//! still checked. Other peers must chain to the local trust roots. Host
//! names are not checked: peers are identified by role, not by address.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use super::identity::{Identity, Subject, fingerprint};
use crate::IoError;

#[derive(Debug)]
pub struct PeerVerifier {
    /// Chain validation for non-anonymous peers. `None` when the local side
    /// is itself anonymous and authenticates nobody.
    chain: Option<Arc<dyn ClientCertVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PeerVerifier {
    pub fn new(local: &Identity, provider: &Arc<CryptoProvider>) -> Result<Self, IoError> {
        let chain = if local.is_anonymous() {
            None
        } else {
            let mut roots = RootCertStore::empty();
            for cert in local.trust_roots() {
                roots.add(cert)?;
            }
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()?;
            Some(verifier)
        };
        Ok(Self {
            chain,
            algorithms: provider.signature_verification_algorithms,
        })
    }

    fn verify_peer(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let subject = Subject::parse(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
        if subject.is_anonymous() {
            debug!(peer = %fingerprint(end_entity), "anonymous peer accepted");
            return Ok(());
        }
        let Some(chain) = &self.chain else {
            return Ok(());
        };
        chain
            .verify_client_cert(end_entity, intermediates, now)
            .map(|_| ())
            .inspect_err(|e| {
                warn!(peer = %fingerprint(end_entity), error = %e, "peer certificate rejected")
            })
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_peer(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PeerVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_peer(end_entity, intermediates, now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::identity::CertificateAuthority;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    #[test]
    fn chain_member_accepted_stranger_rejected() {
        let ca = CertificateAuthority::generate("root").unwrap();
        let local = ca.issue("agent", "a").unwrap();
        let peer = ca.issue("agent", "b").unwrap();
        let stranger = Identity::generate_self_signed("agent", "c").unwrap();

        let v = PeerVerifier::new(&local, &provider()).unwrap();
        let now = UnixTime::now();
        assert!(v.verify_peer(peer.certificate(), peer.chain(), now).is_ok());
        assert!(v.verify_peer(stranger.certificate(), &[], now).is_err());
    }

    #[test]
    fn anonymous_peer_always_accepted() {
        let local = Identity::generate_self_signed("agent", "a").unwrap();
        let anon = Identity::generate_with("anonymous", "anonymous", &rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap();
        let v = PeerVerifier::new(&local, &provider()).unwrap();
        assert!(v.verify_peer(anon.certificate(), &[], UnixTime::now()).is_ok());
    }

    #[test]
    fn anonymous_local_side_accepts_anyone() {
        let anon = Identity::generate_with("anonymous", "anonymous", &rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap();
        let stranger = Identity::generate_self_signed("agent", "c").unwrap();
        let v = PeerVerifier::new(&anon, &provider()).unwrap();
        assert!(v.verify_peer(stranger.certificate(), &[], UnixTime::now()).is_ok());
    }
}
