use crc::{CRC_16_IBM_3740, Crc};
use uuid::Uuid;

use crate::IoError;

/// First byte of every package unit on the wire.
pub const FRAME_MARKER: u8 = 0xA5;

/// Capacity of the buffer-size table.
pub const MAX_BUFFERS: usize = 16;

/// Largest single buffer a peer may declare.
pub const MAX_BUFFER_SIZE: u32 = 16 * 1024 * 1024;

/// Encoded header length in bytes.
pub const HEADER_SIZE: usize = 4 + 16 + 16 + 4 + 4 * MAX_BUFFERS + 2;

pub type PackageHeaderBytes = [u8; HEADER_SIZE];

const CRC_OFFSET: usize = HEADER_SIZE - 2;
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/IBM-3740 over the header with the checksum field zeroed.
pub fn header_crc(bytes: &PackageHeaderBytes) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&bytes[..CRC_OFFSET]);
    digest.update(&[0, 0]);
    digest.finalize()
}

#[derive(Clone, PartialEq, Eq)]
pub struct PackageHeader {
    pub command: u32,
    pub uuid: Uuid,
    pub sender: Uuid,
    pub buffer_count: u32,
    pub buffer_sizes: [u32; MAX_BUFFERS],
}

impl PackageHeader {
    pub fn new(command: u32, uuid: Uuid, sender: Uuid) -> Self {
        Self {
            command,
            uuid,
            sender,
            buffer_count: 0,
            buffer_sizes: [0; MAX_BUFFERS],
        }
    }

    /// Sizes of the buffers actually in use.
    pub fn sizes(&self) -> &[u32] {
        let used = (self.buffer_count as usize).min(MAX_BUFFERS);
        &self.buffer_sizes[..used]
    }

    /// Total payload length following the header.
    pub fn payload_len(&self) -> usize {
        self.sizes().iter().map(|&s| s as usize).sum()
    }

    pub fn encode(&self) -> PackageHeaderBytes {
        let mut out: PackageHeaderBytes = [0; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..20].copy_from_slice(self.uuid.as_bytes());
        out[20..36].copy_from_slice(self.sender.as_bytes());
        out[36..40].copy_from_slice(&self.buffer_count.to_le_bytes());
        for (i, size) in self.buffer_sizes.iter().enumerate() {
            let at = 40 + i * 4;
            out[at..at + 4].copy_from_slice(&size.to_le_bytes());
        }
        let crc = header_crc(&out);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse and validate a header. The checksum is verified before any
    /// field is trusted.
    pub fn decode(bytes: &PackageHeaderBytes) -> Result<Self, IoError> {
        let expected = u16::from_le_bytes([bytes[CRC_OFFSET], bytes[CRC_OFFSET + 1]]);
        let actual = header_crc(bytes);
        if expected != actual {
            return Err(IoError::ChecksumMismatch { expected, actual });
        }

        let buffer_count = read_u32(bytes, 36);
        if buffer_count as usize > MAX_BUFFERS {
            return Err(IoError::TooManyBuffers {
                count: buffer_count,
                max: MAX_BUFFERS,
            });
        }

        let mut buffer_sizes = [0u32; MAX_BUFFERS];
        for (i, size) in buffer_sizes.iter_mut().enumerate() {
            *size = read_u32(bytes, 40 + i * 4);
        }
        for &size in &buffer_sizes[..buffer_count as usize] {
            if size > MAX_BUFFER_SIZE {
                return Err(IoError::BufferTooLarge {
                    size: size as u64,
                    max: MAX_BUFFER_SIZE,
                });
            }
        }
        if buffer_sizes[buffer_count as usize..].iter().any(|&s| s != 0) {
            return Err(IoError::ProtocolViolation("size declared for unused buffer slot"));
        }

        Ok(Self {
            command: read_u32(bytes, 0),
            uuid: Uuid::from_bytes(read_16(bytes, 4)),
            sender: Uuid::from_bytes(read_16(bytes, 20)),
            buffer_count,
            buffer_sizes,
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_16(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[at..at + 16]);
    out
}

impl std::fmt::Debug for PackageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageHeader")
            .field("command", &format_args!("{:#x}", self.command))
            .field("uuid", &self.uuid)
            .field("sender", &self.sender)
            .field("sizes", &self.sizes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageHeader {
        let mut h = PackageHeader::new(0x1001, Uuid::new_v4(), Uuid::new_v4());
        h.buffer_count = 3;
        h.buffer_sizes[0] = 12;
        h.buffer_sizes[1] = 0;
        h.buffer_sizes[2] = 4096;
        h
    }

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(HEADER_SIZE, 106);
        assert_eq!(sample().encode().len(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let h = sample();
        let decoded = PackageHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.sizes(), &[12, 0, 4096]);
        assert_eq!(decoded.payload_len(), 4108);
    }

    #[test]
    fn full_table_roundtrips() {
        let mut h = PackageHeader::new(7, Uuid::new_v4(), Uuid::nil());
        h.buffer_count = MAX_BUFFERS as u32;
        for (i, s) in h.buffer_sizes.iter_mut().enumerate() {
            *s = i as u32 * 100;
        }
        assert_eq!(PackageHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn any_altered_byte_fails_crc() {
        let bytes = sample().encode();
        for i in 0..HEADER_SIZE {
            let mut tampered = bytes;
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    PackageHeader::decode(&tampered),
                    Err(IoError::ChecksumMismatch { .. })
                ),
                "byte {i} not covered"
            );
        }
    }

    #[test]
    fn count_over_capacity_is_rejected() {
        let mut h = sample();
        h.buffer_count = MAX_BUFFERS as u32 + 1;
        let err = PackageHeader::decode(&h.encode()).unwrap_err();
        assert!(matches!(err, IoError::TooManyBuffers { count: 17, .. }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn oversized_buffer_is_rejected() {
        let mut h = sample();
        h.buffer_sizes[1] = MAX_BUFFER_SIZE + 1;
        assert!(matches!(
            PackageHeader::decode(&h.encode()),
            Err(IoError::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn crc_matches_reference_vector() {
        // CRC-16/IBM-3740 check value.
        assert_eq!(CRC16.checksum(b"123456789"), 0x29B1);
    }
}
