//! The in-memory package: command id, correlation uuid, sender uuid and a
//! list of opaque buffers.
//!
//! A package is built by the application, owned by its send job until the
//! writer has put it on the wire, and then shared read-only behind an `Arc`.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::IoError;
use crate::command;
use crate::header::{FRAME_MARKER, HEADER_SIZE, MAX_BUFFER_SIZE, MAX_BUFFERS, PackageHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    command: u32,
    uuid: Uuid,
    sender: Uuid,
    buffers: Vec<Bytes>,
}

impl Package {
    /// A package with no buffers and an unassigned (nil) correlation id.
    pub fn new(command: u32) -> Self {
        Self {
            command,
            uuid: Uuid::nil(),
            sender: Uuid::nil(),
            buffers: Vec::new(),
        }
    }

    pub fn with_buffers<I, B>(command: u32, buffers: I) -> Result<Self, IoError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut pkg = Self::new(command);
        for buf in buffers {
            pkg.push_buffer(buf)?;
        }
        Ok(pkg)
    }

    pub fn heartbeat(sender: Uuid) -> Self {
        Self {
            command: command::HEARTBEAT,
            uuid: Uuid::new_v4(),
            sender,
            buffers: Vec::new(),
        }
    }

    /// A reply that the peer will correlate with `request`.
    pub fn response_to(request: &Package, command: u32) -> Self {
        Self {
            command,
            uuid: request.uuid,
            sender: Uuid::nil(),
            buffers: Vec::new(),
        }
    }

    pub fn push_buffer(&mut self, buf: impl Into<Bytes>) -> Result<(), IoError> {
        if self.buffers.len() >= MAX_BUFFERS {
            return Err(IoError::TooManyBuffers {
                count: self.buffers.len() as u32 + 1,
                max: MAX_BUFFERS,
            });
        }
        let buf = buf.into();
        if buf.len() as u64 > MAX_BUFFER_SIZE as u64 {
            return Err(IoError::BufferTooLarge {
                size: buf.len() as u64,
                max: MAX_BUFFER_SIZE,
            });
        }
        self.buffers.push(buf);
        Ok(())
    }

    pub fn command(&self) -> u32 {
        self.command
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn sender(&self) -> Uuid {
        self.sender
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == command::HEARTBEAT
    }

    /// Assign a fresh correlation id if none is set. Returns the id in use.
    pub fn ensure_uuid(&mut self) -> Uuid {
        if self.uuid.is_nil() {
            self.uuid = Uuid::new_v4();
        }
        self.uuid
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    pub fn set_sender(&mut self, sender: Uuid) {
        self.sender = sender;
    }

    pub fn header(&self) -> PackageHeader {
        let mut header = PackageHeader::new(self.command, self.uuid, self.sender);
        header.buffer_count = self.buffers.len() as u32;
        for (slot, buf) in header.buffer_sizes.iter_mut().zip(&self.buffers) {
            *slot = buf.len() as u32;
        }
        header
    }

    /// Rebuild a package from a validated header and its payload buffers.
    pub fn from_parts(header: &PackageHeader, buffers: Vec<Bytes>) -> Result<Self, IoError> {
        if buffers.len() != header.sizes().len()
            || buffers
                .iter()
                .zip(header.sizes())
                .any(|(b, &s)| b.len() != s as usize)
        {
            return Err(IoError::ProtocolViolation("buffers do not match header size table"));
        }
        Ok(Self {
            command: header.command,
            uuid: header.uuid,
            sender: header.sender,
            buffers,
        })
    }

    /// Total encoded length of the unit: marker, header and payload.
    pub fn wire_len(&self) -> usize {
        1 + HEADER_SIZE + self.buffers.iter().map(Bytes::len).sum::<usize>()
    }

    /// Append the full wire unit to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u8(FRAME_MARKER);
        dst.put_slice(&self.header().encode());
        for buf in &self.buffers {
            dst.put_slice(buf);
        }
    }
}
