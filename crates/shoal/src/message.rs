//! Length-prefixed request/reply frames carrying batched sub-operations.
//!
//! A frame is `[magic:4][op:4][flags:4][length:4][count:4]` (little-endian)
//! followed by `length` bytes of body holding `count` sub-operation records.
//! Attached bulk regions (write payloads, streamed read content) follow the
//! body on the same stream and are not accounted by `length`.

use crate::semantics::{Safety, Semantics};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u32 = u32::from_le_bytes(*b"SHL1");
pub const HEADER_LEN: usize = 20;

/// Upper bound on a frame body. Anything larger is a protocol error.
pub const MAX_BODY_LEN: u32 = 1 << 27; // 128 MiB

/// Flag bits requesting a reply at the given safety level.
pub const SAFETY_NETWORK: u32 = 0x1;
pub const SAFETY_STORAGE: u32 = 0x2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    None = 0,
    ObjectCreate = 1,
    ObjectDelete = 2,
    ObjectOpen = 3,
    ObjectClose = 4,
    ObjectStatus = 5,
    ObjectSync = 6,
    ObjectRead = 7,
    ObjectWrite = 8,
    KvPut = 9,
    KvDelete = 10,
    KvGet = 11,
}

impl TryFrom<u32> for Opcode {
    type Error = crate::Error;

    fn try_from(value: u32) -> crate::Result<Self> {
        Ok(match value {
            0 => Opcode::None,
            1 => Opcode::ObjectCreate,
            2 => Opcode::ObjectDelete,
            3 => Opcode::ObjectOpen,
            4 => Opcode::ObjectClose,
            5 => Opcode::ObjectStatus,
            6 => Opcode::ObjectSync,
            7 => Opcode::ObjectRead,
            8 => Opcode::ObjectWrite,
            9 => Opcode::KvPut,
            10 => Opcode::KvDelete,
            11 => Opcode::KvGet,
            other => {
                return Err(crate::Error::UnknownOpcode {
                    op: other,
                    flags: 0,
                })
            }
        })
    }
}

pub struct Message {
    op: Opcode,
    flags: u32,
    count: u32,
    body: BytesMut,
    bulk: Vec<Bytes>,
    recv: Bytes,
    cursor: usize,
}

impl Message {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            flags: 0,
            count: 0,
            body: BytesMut::new(),
            bulk: Vec::new(),
            recv: Bytes::new(),
            cursor: 0,
        }
    }

    /// A reply frame answering `request`: same opcode, no safety flags.
    pub fn reply_to(request: &Message) -> Self {
        Self::new(request.op)
    }

    pub fn op(&self) -> Opcode {
        self.op
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the sender asked for a reply at any safety level.
    pub fn wants_reply(&self) -> bool {
        self.flags & (SAFETY_NETWORK | SAFETY_STORAGE) != 0
    }

    /// Whether the sender asked for durable persistence before the reply.
    pub fn wants_storage(&self) -> bool {
        self.flags & SAFETY_STORAGE != 0
    }

    pub fn set_safety(&mut self, semantics: &Semantics) {
        self.flags = match semantics.safety {
            Safety::None => 0,
            Safety::Network => SAFETY_NETWORK,
            Safety::Storage => SAFETY_STORAGE,
        };
    }

    /// Close the previous sub-operation record and open the next one.
    pub fn add_operation(&mut self) {
        self.count += 1;
    }

    pub fn append_u32(&mut self, value: u32) {
        self.body.put_u32_le(value);
    }

    pub fn append_u64(&mut self, value: u64) {
        self.body.put_u64_le(value);
    }

    pub fn append_i64(&mut self, value: i64) {
        self.body.put_i64_le(value);
    }

    pub fn append_bytes(&mut self, data: &[u8]) {
        self.body.put_slice(data);
    }

    /// Append a NUL-terminated string.
    pub fn append_str(&mut self, value: &str) {
        self.body.put_slice(value.as_bytes());
        self.body.put_u8(0);
    }

    /// Attach an out-of-band bulk region, transmitted after the frame body
    /// in attachment order.
    pub fn add_send(&mut self, data: Bytes) {
        self.bulk.push(data);
    }

    pub fn get_u32(&mut self) -> crate::Result<u32> {
        let mut field = self.get_bytes(4)?;
        Ok(field.get_u32_le())
    }

    pub fn get_u64(&mut self) -> crate::Result<u64> {
        let mut field = self.get_bytes(8)?;
        Ok(field.get_u64_le())
    }

    pub fn get_i64(&mut self) -> crate::Result<i64> {
        let mut field = self.get_bytes(8)?;
        Ok(field.get_i64_le())
    }

    /// The returned Bytes shares the frame's buffer; no copy is made.
    pub fn get_bytes(&mut self, len: usize) -> crate::Result<Bytes> {
        if self.recv.len() - self.cursor < len {
            return Err(crate::Error::Protocol("sub-operation field out of bounds"));
        }
        let field = self.recv.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        Ok(field)
    }

    /// Read the next NUL-terminated string.
    pub fn get_str(&mut self) -> crate::Result<String> {
        let rest = &self.recv[self.cursor..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(crate::Error::Protocol("unterminated string field"))?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|_| crate::Error::Protocol("string field is not valid UTF-8"))?
            .to_string();
        self.cursor += nul + 1;
        Ok(value)
    }

    /// Write header, body, and attached bulk regions to `w`.
    pub async fn send<W>(&self, w: &mut W) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(self.op as u32).to_le_bytes());
        header[8..12].copy_from_slice(&self.flags.to_le_bytes());
        header[12..16].copy_from_slice(&(self.body.len() as u32).to_le_bytes());
        header[16..20].copy_from_slice(&self.count.to_le_bytes());

        w.write_all(&header).await?;
        w.write_all(&self.body).await?;
        for region in &self.bulk {
            w.write_all(region).await?;
        }
        w.flush().await?;
        Ok(())
    }

    /// Read one frame from `r`. Returns None on a clean end-of-stream at a
    /// frame boundary; an end-of-stream inside a frame is a protocol error.
    pub async fn receive<R>(r: &mut R) -> crate::Result<Option<Message>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = r.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(crate::Error::Protocol("stream closed mid-header"));
            }
            filled += n;
        }

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(crate::Error::Protocol("bad frame magic"));
        }
        let raw_op = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let flags = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let length = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let count = u32::from_le_bytes(header[16..20].try_into().unwrap());

        if length > MAX_BODY_LEN {
            return Err(crate::Error::Protocol("frame body exceeds maximum"));
        }

        // Consume the body before rejecting an unknown opcode, leaving the
        // stream aligned on the next frame so a server may skip this one.
        // The flags ride along in the error so the skipped frame can still
        // be acknowledged when it asked for a reply.
        let mut body = vec![0u8; length as usize];
        r.read_exact(&mut body).await?;
        let op = Opcode::try_from(raw_op).map_err(|_| crate::Error::UnknownOpcode {
            op: raw_op,
            flags,
        })?;

        Ok(Some(Message {
            op,
            flags,
            count,
            body: BytesMut::new(),
            bulk: Vec::new(),
            recv: Bytes::from(body),
            cursor: 0,
        }))
    }

    /// Receive a frame that must be present: a peer hanging up while a
    /// reply is owed is a protocol error.
    pub(crate) async fn receive_reply<R>(r: &mut R) -> crate::Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        Self::receive(r)
            .await?
            .ok_or(crate::Error::Protocol("server closed the connection"))
    }
}
