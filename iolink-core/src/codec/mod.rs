//! Framing codec for plain package units: `[0xA5][header][buffers]`.
//!
//! The decoder validates the header as soon as its bytes are available, so
//! a corrupt header is reported without waiting for a payload whose length
//! cannot be trusted.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::IoError;
use crate::header::{FRAME_MARKER, HEADER_SIZE, PackageHeader, PackageHeaderBytes};
use crate::package::Package;

#[derive(Debug, Default)]
pub struct PackageCodec {
    pending: Option<PackageHeader>,
}

impl PackageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A header has been consumed and its payload is still incomplete.
    pub fn is_mid_package(&self) -> bool {
        self.pending.is_some()
    }
}

impl Decoder for PackageCodec {
    type Item = Package;
    type Error = IoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.is_empty() {
                    return Ok(None);
                }
                if src[0] != FRAME_MARKER {
                    return Err(IoError::UnknownFrameMarker(src[0]));
                }
                if src.len() < 1 + HEADER_SIZE {
                    src.reserve(1 + HEADER_SIZE - src.len());
                    return Ok(None);
                }
                let mut raw: PackageHeaderBytes = [0; HEADER_SIZE];
                raw.copy_from_slice(&src[1..1 + HEADER_SIZE]);
                let header = PackageHeader::decode(&raw)?;
                src.advance(1 + HEADER_SIZE);
                header
            }
        };

        let payload = header.payload_len();
        if src.len() < payload {
            src.reserve(payload - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let buffers = header
            .sizes()
            .iter()
            .map(|&size| src.split_to(size as usize).freeze())
            .collect();
        Package::from_parts(&header, buffers).map(Some)
    }
}

impl Encoder<Package> for PackageCodec {
    type Error = IoError;

    fn encode(&mut self, item: Package, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<&Package> for PackageCodec {
    type Error = IoError;

    fn encode(&mut self, item: &Package, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Package {
        let mut pkg = Package::with_buffers(0x1201, [&b"hello"[..], &b"world!"[..]]).unwrap();
        pkg.ensure_uuid();
        pkg
    }

    #[test]
    fn decodes_across_partial_reads() {
        let pkg = sample();
        let mut wire = BytesMut::new();
        PackageCodec::new().encode(&pkg, &mut wire).unwrap();

        let mut codec = PackageCodec::new();
        let mut src = BytesMut::new();
        let mut out = None;
        for byte in wire.iter() {
            src.extend_from_slice(&[*byte]);
            if let Some(p) = codec.decode(&mut src).unwrap() {
                out = Some(p);
            }
        }
        assert_eq!(out, Some(pkg));
        assert!(src.is_empty());
    }

    #[test]
    fn two_units_back_to_back() {
        let a = sample();
        let b = Package::heartbeat(uuid::Uuid::new_v4());
        let mut src = BytesMut::new();
        let mut codec = PackageCodec::new();
        codec.encode(&a, &mut src).unwrap();
        codec.encode(&b, &mut src).unwrap();
        assert_eq!(codec.decode(&mut src).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(b));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn bad_marker_is_fatal() {
        let mut src = BytesMut::from(&[0x42u8, 0, 0][..]);
        let err = PackageCodec::new().decode(&mut src).unwrap_err();
        assert!(matches!(err, IoError::UnknownFrameMarker(0x42)));
    }

    #[test]
    fn corrupt_header_reported_before_payload_arrives() {
        let mut wire = BytesMut::new();
        sample().encode(&mut wire);
        wire[10] ^= 0xFF;
        wire.truncate(1 + HEADER_SIZE);
        let err = PackageCodec::new().decode(&mut wire).unwrap_err();
        assert!(matches!(err, IoError::ChecksumMismatch { .. }));
    }
}
