//! One-time connection handshake record.
//!
//! ```text
//! magic "IOLK" | major u16 | minor u16 | description [u8; 64]
//! ```
//!
//! Both sides write their record as soon as the socket is up and then read
//! the peer's. The negotiated version decides optional behaviour such as
//! heartbeats.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::IoError;

pub const HANDSHAKE_MAGIC: [u8; 4] = *b"IOLK";
pub const DESCRIPTION_LEN: usize = 64;
pub const HANDSHAKE_SIZE: usize = 4 + 2 + 2 + DESCRIPTION_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion::new(1, 2);
    /// First version that understands heartbeat packages.
    pub const HEARTBEAT: ProtocolVersion = ProtocolVersion::new(1, 1);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn supports_heartbeat(self) -> bool {
        self >= Self::HEARTBEAT
    }

    /// Peers must share the major version.
    pub fn is_compatible(self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: ProtocolVersion,
    description: String,
}

impl Handshake {
    /// Longer descriptions are cut at a char boundary to fit 64 bytes.
    pub fn new(version: ProtocolVersion, description: &str) -> Self {
        let mut end = description.len().min(DESCRIPTION_LEN);
        while !description.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            version,
            description: description[..end].to_string(),
        }
    }

    pub fn local(description: &str) -> Self {
        Self::new(ProtocolVersion::CURRENT, description)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[0..4].copy_from_slice(&HANDSHAKE_MAGIC);
        out[4..6].copy_from_slice(&self.version.major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version.minor.to_le_bytes());
        let desc = self.description.as_bytes();
        out[8..8 + desc.len()].copy_from_slice(desc);
        out
    }

    pub fn decode(bytes: &[u8; HANDSHAKE_SIZE]) -> Result<Self, IoError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != HANDSHAKE_MAGIC {
            return Err(IoError::InvalidMagic(magic));
        }
        let version = ProtocolVersion::new(
            u16::from_le_bytes([bytes[4], bytes[5]]),
            u16::from_le_bytes([bytes[6], bytes[7]]),
        );
        if !version.is_compatible() {
            return Err(IoError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        let raw = &bytes[8..];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(Self {
            version,
            description: String::from_utf8_lossy(&raw[..len]).into_owned(),
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), IoError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, IoError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        match reader.read_exact(&mut buf).await {
            Ok(_) => Self::decode(&buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(IoError::ClosedByPeer),
            Err(e) => Err(e.into()),
        }
    }
}

/// Send `local` and read the peer's record, bounded by `timeout`.
pub async fn exchange_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &Handshake,
    timeout: Duration,
) -> Result<Handshake, IoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        local.write_to(writer).await?;
        Handshake::read_from(reader).await
    };
    let peer = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| IoError::Timeout(timeout))??;
    debug!(
        local = %local.version,
        peer = %peer.version,
        description = peer.description(),
        "handshake complete"
    );
    Ok(peer)
}
