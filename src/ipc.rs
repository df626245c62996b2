//! Length-prefixed message framing over the engine's stdio pipes.
//!
//! Every message is framed with a 2-byte magic, a 4-byte little-endian
//! payload length and a 2-byte little-endian channel id, so one pipe pair
//! multiplexes the control channel and the slot-index channel. No partial
//! reads, no buffer management in the callers.

use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 2] = *b"PC";
pub const HEADER_SIZE: usize = 8;
/// Sanity cap; control payloads are small and slot indices are 4 bytes.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Control channel: commands, replies, acks (JSON payloads).
pub const CHAN_CONTROL: u16 = 1;
/// Frame channel: published slot indices (raw u32 LE payloads).
pub const CHAN_FRAMES: u16 = 2;

fn encode_header(len: u32, chan: u16) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..2].copy_from_slice(&MAGIC);
    header[2..6].copy_from_slice(&len.to_le_bytes());
    header[6..8].copy_from_slice(&chan.to_le_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_SIZE]) -> io::Result<(usize, u16)> {
    if header[0..2] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame magic",
        ));
    }
    let len = u32::from_le_bytes(header[2..6].try_into().unwrap()) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {len} bytes exceeds cap"),
        ));
    }
    let chan = u16::from_le_bytes(header[6..8].try_into().unwrap());
    Ok((len, chan))
}

/// Blocking frame writer (engine side).
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame and flush, so the peer sees it immediately.
    pub fn write(&mut self, chan: u16, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(&encode_header(payload.len() as u32, chan))?;
        self.inner.write_all(payload)?;
        self.inner.flush()
    }
}

/// Blocking frame reader (engine side).
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one complete frame; `UnexpectedEof` when the peer is gone.
    pub fn read(&mut self) -> io::Result<(u16, Vec<u8>)> {
        let mut header = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        let (len, chan) = decode_header(&header)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        Ok((chan, payload))
    }
}

/// Cooperative frame read (session side).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u16, Vec<u8>)> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (len, chan) = decode_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((chan, payload))
}

/// Cooperative frame write (session side).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    chan: u16,
    payload: &[u8],
) -> io::Result<()> {
    writer
        .write_all(&encode_header(payload.len() as u32, chan))
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_round_trip() {
        let mut buf = Vec::new();
        {
            let mut w = FrameWriter::new(&mut buf);
            w.write(CHAN_CONTROL, b"{\"kind\":\"pause\"}").unwrap();
            w.write(CHAN_FRAMES, &[2, 0, 0, 0]).unwrap();
        }
        let mut r = FrameReader::new(buf.as_slice());
        let (chan, payload) = r.read().unwrap();
        assert_eq!(chan, CHAN_CONTROL);
        assert_eq!(payload, b"{\"kind\":\"pause\"}");
        let (chan, payload) = r.read().unwrap();
        assert_eq!(chan, CHAN_FRAMES);
        assert_eq!(payload, [2, 0, 0, 0]);
        assert!(r.read().is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write(CHAN_CONTROL, b"x").unwrap();
        buf[0] = b'X';
        let err = FrameReader::new(buf.as_slice()).read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let header = encode_header((MAX_PAYLOAD + 1) as u32, CHAN_CONTROL);
        let err = FrameReader::new(header.as_slice()).read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn async_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, CHAN_FRAMES, &[1, 0, 0, 0]).await.unwrap();
        let (chan, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(chan, CHAN_FRAMES);
        assert_eq!(payload, [1, 0, 0, 0]);
    }
}
