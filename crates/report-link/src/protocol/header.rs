use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header preceding every inbound collector frame.
///
/// Wire layout (big-endian): `u16 total_len | u16 server_type | u16 message_id`,
/// where `total_len` counts the header itself plus the payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReportFrameHeader {
    pub total_len: u16,
    pub server_type: u16,
    pub message_id: u16,
}

/// A decoded inbound frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReportFrame {
    pub header: ReportFrameHeader,
    pub payload: Bytes,
}

impl ReportFrameHeader {
    pub const SIZE: usize = 6;

    pub fn new(server_type: u16, message_id: u16, payload_len: usize) -> Option<Self> {
        let total = Self::SIZE.checked_add(payload_len)?;
        Some(Self {
            total_len: u16::try_from(total).ok()?,
            server_type,
            message_id,
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(Self::SIZE)
    }

    /// Prepends the header to `payload`. Returns [Header + Payload].
    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE + payload.len());
        buf.put_u16(self.total_len);
        buf.put_u16(self.server_type);
        buf.put_u16(self.message_id);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Parses one frame from a datagram.
    ///
    /// Rejects buffers shorter than the header, lengths smaller than the
    /// header, and lengths that overrun the buffer. Trailing bytes beyond
    /// `total_len` are ignored.
    pub fn decode(mut buf: Bytes) -> Option<ReportFrame> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let total_len = buf.get_u16();
        let server_type = buf.get_u16();
        let message_id = buf.get_u16();
        let header = Self {
            total_len,
            server_type,
            message_id,
        };
        if (total_len as usize) < Self::SIZE || header.payload_len() > buf.len() {
            return None;
        }
        let payload = buf.split_to(header.payload_len());
        Some(ReportFrame { header, payload })
    }
}

/// Splits a byte stream into whole frames using the header length field.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame (header included), if any.
    ///
    /// A length field smaller than the header cannot be resynchronized, so
    /// the buffered bytes are discarded and `Err` is returned.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, usize> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let total = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if total < ReportFrameHeader::SIZE {
            let dropped = self.buf.len();
            self.buf.clear();
            return Err(dropped);
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }
}
