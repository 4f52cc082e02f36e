//! Certificate identities: loading, generation and subject inspection.

use std::fmt;
use std::io::BufReader;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::IoError;

/// Subject attribute carrying the peer role.
pub const ROLE_OID: &str = "1.3.6.1.4.1.51234.7.1";
const ROLE_OID_ARCS: [u64; 9] = [1, 3, 6, 1, 4, 1, 51234, 7, 1];

/// Role of an identity that authenticates nobody.
pub const ANONYMOUS_ROLE: &str = "anonymous";

// ── Subject ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    pub common_name: Option<String>,
    pub role: Option<String>,
}

impl Subject {
    /// Parse the subject of a DER certificate.
    pub fn parse(der: &[u8]) -> Result<Self, IoError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| IoError::Certificate(format!("unparsable certificate: {e}")))?;
        let name = cert.subject();
        let common_name = name
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        let role = name
            .iter_attributes()
            .find(|attr| attr.attr_type().to_id_string() == ROLE_OID)
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        Ok(Self { common_name, role })
    }

    /// The value compared during peer identity checks: the role, or the
    /// common name when no role is present.
    pub fn role_or_cn(&self) -> Option<&str> {
        self.role.as_deref().or(self.common_name.as_deref())
    }

    pub fn is_anonymous(&self) -> bool {
        self.role.as_deref() == Some(ANONYMOUS_ROLE)
    }
}

// ── Identity ─────────────────────────────────────────────────────

/// A certificate, its private key and the chain presented with it.
pub struct Identity {
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    subject: Subject,
    fingerprint: String,
}

impl Identity {
    pub fn from_der(
        certificate: CertificateDer<'static>,
        private_key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self, IoError> {
        let subject = Subject::parse(&certificate)?;
        let fingerprint = fingerprint(&certificate);
        debug!(%fingerprint, role = ?subject.role_or_cn(), "identity loaded");
        Ok(Self {
            certificate,
            private_key,
            chain,
            subject,
            fingerprint,
        })
    }

    /// Load from PEM text. `chain_pem` may hold any number of certificates.
    pub fn from_pem(cert_pem: &str, key_pem: &str, chain_pem: Option<&str>) -> Result<Self, IoError> {
        let certificate = read_certs(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| IoError::Certificate("no certificate in PEM input".into()))?;
        let private_key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| IoError::Certificate(format!("bad private key PEM: {e}")))?
            .ok_or_else(|| IoError::Certificate("no private key in PEM input".into()))?;
        let chain = match chain_pem {
            Some(pem) => read_certs(pem)?,
            None => Vec::new(),
        };
        Self::from_der(certificate, private_key, chain)
    }

    /// A fresh self-signed identity using ECDSA P-256.
    pub fn generate_self_signed(role: &str, common_name: &str) -> Result<Self, IoError> {
        Self::generate_with(role, common_name, &rcgen::PKCS_ECDSA_P256_SHA256)
    }

    pub(crate) fn generate_with(
        role: &str,
        common_name: &str,
        alg: &'static SignatureAlgorithm,
    ) -> Result<Self, IoError> {
        let key = KeyPair::generate_for(alg)?;
        let cert = leaf_params(role, common_name)?.self_signed(&key)?;
        Self::from_der(cert.der().clone(), pkcs8(&key), Vec::new())
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject.is_anonymous()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Leaf certificate followed by the chain, as sent in a handshake.
    pub fn presented_chain(&self) -> Vec<CertificateDer<'static>> {
        std::iter::once(self.certificate.clone())
            .chain(self.chain.iter().cloned())
            .collect()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }

    /// Certificates the peer's chain must end in: the configured chain, or
    /// the own certificate when there is none.
    pub fn trust_roots(&self) -> Vec<CertificateDer<'static>> {
        if self.chain.is_empty() {
            vec![self.certificate.clone()]
        } else {
            self.chain.clone()
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

// ── CertificateAuthority ─────────────────────────────────────────

/// Issues leaf identities that verify against a common root.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self, IoError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    pub fn certificate_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf carrying `role`, with this CA as its chain.
    pub fn issue(&self, role: &str, common_name: &str) -> Result<Identity, IoError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let cert = leaf_params(role, common_name)?.signed_by(&key, &self.cert, &self.key)?;
        Identity::from_der(cert.der().clone(), pkcs8(&key), vec![self.cert.der().clone()])
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn leaf_params(role: &str, common_name: &str) -> Result<CertificateParams, IoError> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::CustomDnType(ROLE_OID_ARCS.to_vec()), role);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    Ok(params)
}

fn pkcs8(key: &KeyPair) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}

fn read_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, IoError> {
    rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IoError::Certificate(format!("bad certificate PEM: {e}")))
}

/// Short blake3 fingerprint of a DER certificate for log lines.
pub fn fingerprint(der: &[u8]) -> String {
    blake3::hash(der).to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_carries_role() {
        let id = Identity::generate_self_signed("dispatcher", "node-a").unwrap();
        assert_eq!(id.subject().role.as_deref(), Some("dispatcher"));
        assert_eq!(id.subject().common_name.as_deref(), Some("node-a"));
        assert_eq!(id.subject().role_or_cn(), Some("dispatcher"));
        assert!(!id.is_anonymous());
        assert_eq!(id.fingerprint().len(), 16);
        assert_eq!(id.trust_roots().len(), 1);
    }

    #[test]
    fn role_falls_back_to_common_name() {
        let s = Subject {
            common_name: Some("cn".into()),
            role: None,
        };
        assert_eq!(s.role_or_cn(), Some("cn"));
    }

    #[test]
    fn ca_issued_identity_has_chain() {
        let ca = CertificateAuthority::generate("test root").unwrap();
        let leaf = ca.issue("agent", "leaf-1").unwrap();
        assert_eq!(leaf.chain().len(), 1);
        assert_eq!(leaf.presented_chain().len(), 2);
        assert_eq!(leaf.trust_roots()[0], *ca.certificate());
    }

    #[test]
    fn pem_roundtrip() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = leaf_params("agent", "pem-node").unwrap().self_signed(&key).unwrap();
        let id = Identity::from_pem(&cert.pem(), &key.serialize_pem(), None).unwrap();
        assert_eq!(id.subject().role.as_deref(), Some("agent"));
        assert_eq!(id.certificate(), cert.der());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Subject::parse(b"not a certificate").is_err());
        assert!(Identity::from_pem("", "", None).is_err());
    }
}
