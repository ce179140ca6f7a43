//! Frame layout
//!
//! ```text
//! +-------+---------+------+----------+------------+--------+--------+
//! | magic | version | kind | reserved | request id | length | crc32c |
//! |  u32  |   u8    |  u8  |   u16    |    u64     |  u32   |  u32   |
//! +-------+---------+------+----------+------------+--------+--------+
//! | body (length bytes)                                              |
//! +------------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. The checksum covers the body only.

use fidias_common::checksum;
use fidias_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic ("FIDS")
pub const FRAME_MAGIC: u32 = 0x4649_4453;

/// Protocol version
pub const FRAME_VERSION: u8 = 1;

/// Encoded header size
pub const HEADER_SIZE: usize = 24;

/// Frame kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            _ => Err(Error::Serialization(format!("invalid frame kind: {value}"))),
        }
    }
}

/// Decoded frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub request_id: u64,
    pub length: u32,
    pub crc: u32,
}

impl FrameHeader {
    /// Header for a body
    pub fn for_body(kind: FrameKind, request_id: u64, body: &[u8]) -> Result<Self> {
        let length = u32::try_from(body.len())
            .map_err(|_| Error::Serialization(format!("frame body too large: {}", body.len())))?;
        Ok(Self {
            kind,
            request_id,
            length,
            crc: checksum::crc32c(body),
        })
    }

    /// Encode to the fixed header layout
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf[4] = FRAME_VERSION;
        buf[5] = self.kind as u8;
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.crc.to_be_bytes());
        buf
    }

    /// Decode and check magic and version
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FRAME_MAGIC {
            return Err(Error::Serialization(format!("bad frame magic: {magic:#010x}")));
        }
        if buf[4] != FRAME_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported frame version: {}",
                buf[4]
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        Ok(Self {
            kind: FrameKind::try_from(buf[5])?,
            request_id: u64::from_be_bytes(id),
            length: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            crc: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// Encode a complete frame
pub fn encode_frame(kind: FrameKind, request_id: u64, body: &[u8]) -> Result<Vec<u8>> {
    let header = FrameHeader::for_body(kind, request_id, body)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Split a complete frame into header and verified body
pub fn decode_frame(buf: &[u8], max_body: usize) -> Result<(FrameHeader, &[u8])> {
    let header_bytes: &[u8; HEADER_SIZE] = buf
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::Serialization("truncated frame header".into()))?;
    let header = FrameHeader::decode(header_bytes)?;
    let len = header.length as usize;
    if len > max_body {
        return Err(Error::Serialization(format!(
            "frame body of {len} bytes exceeds limit {max_body}"
        )));
    }
    let body = buf
        .get(HEADER_SIZE..HEADER_SIZE + len)
        .ok_or_else(|| Error::Serialization("truncated frame body".into()))?;
    verify(&header, body)?;
    Ok((header, body))
}

/// Read one frame from a stream
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<(FrameHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes)?;
    let len = header.length as usize;
    if len > max_body {
        return Err(Error::Serialization(format!(
            "frame body of {len} bytes exceeds limit {max_body}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    verify(&header, &body)?;
    Ok((header, body))
}

/// Write one frame to a stream
pub async fn write_frame<W>(
    writer: &mut W,
    kind: FrameKind,
    request_id: u64,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader::for_body(kind, request_id, body)?;
    writer.write_all(&header.encode()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn verify(header: &FrameHeader, body: &[u8]) -> Result<()> {
    let actual = checksum::crc32c(body);
    if actual != header.crc {
        return Err(Error::Serialization(format!(
            "frame checksum mismatch: expected {:#010x}, got {actual:#010x}",
            header.crc
        )));
    }
    Ok(())
}
