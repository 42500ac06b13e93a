//! Binary protocol between the simulated bus and its TCP peers.
//!
//! ```text
//! server -> client   MAGIC(u16 BE) VERSION(u16 BE)
//! client -> server   MAGIC(u16 BE) VERSION(u16 BE) UDID(8)
//!
//! either way         0x00 len data[len]     packet
//! server -> client   0x01 addr              address assignment
//! server -> client   0xFF                   forced disconnect
//! ```

use crate::protocol::{Address, Payload, Udid, MAX_PACKET_SIZE, UDID_SIZE};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u16 = 0x7082;
pub const VERSION: u16 = 0x0000;

pub const HELLO_SIZE: usize = 4;
pub const FRAME_CAPACITY: usize = MAX_PACKET_SIZE + 2;

pub(crate) const CMD_PACKET: u8 = 0x00;
pub(crate) const CMD_ASSIGN: u8 = 0x01;
pub(crate) const CMD_QUIT: u8 = 0xFF;

const MAJOR_MASK: u16 = 0xFF00;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no magic")]
    BadMagic,

    #[error("incompatible versions (peer: {peer:04x}, local: {local:04x})")]
    IncompatibleVersion { peer: u16, local: u16 },

    #[error("handshake timed out")]
    Timeout,

    #[error("rejected by the bus")]
    Rejected,

    #[error("{0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: unknown command {0:#04x}")]
    UnknownCommand(u8),

    #[error("protocol violation: invalid packet length {0}")]
    InvalidLength(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Payload),
    Assigned(Address),
    Quit,
}

pub fn hello() -> [u8; HELLO_SIZE] {
    let mut hello = [0u8; HELLO_SIZE];
    hello[..2].copy_from_slice(&MAGIC.to_be_bytes());
    hello[2..].copy_from_slice(&VERSION.to_be_bytes());
    hello
}

/// Validates a peer greeting and returns the peer's version.
pub fn check_hello(hello: [u8; HELLO_SIZE]) -> Result<u16, HandshakeError> {
    let magic = u16::from_be_bytes([hello[0], hello[1]]);
    if magic != MAGIC {
        return Err(HandshakeError::BadMagic);
    }

    let peer = u16::from_be_bytes([hello[2], hello[3]]);
    if peer & MAJOR_MASK != VERSION & MAJOR_MASK {
        return Err(HandshakeError::IncompatibleVersion {
            peer,
            local: VERSION,
        });
    }
    Ok(peer)
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    w.write_all(&hello()).await
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, HandshakeError> {
    let mut hello = [0u8; HELLO_SIZE];
    r.read_exact(&mut hello).await?;
    check_hello(hello)
}

pub async fn read_udid<R: AsyncRead + Unpin>(r: &mut R) -> Result<Udid, HandshakeError> {
    let mut udid = [0u8; UDID_SIZE];
    r.read_exact(&mut udid).await?;
    Ok(Udid(udid))
}

pub fn encode_packet(data: &[u8]) -> Result<heapless::Vec<u8, FRAME_CAPACITY>, FrameError> {
    if data.is_empty() || data.len() > MAX_PACKET_SIZE {
        return Err(FrameError::InvalidLength(data.len()));
    }

    let mut frame = heapless::Vec::new();
    // capacity is checked above
    let _ = frame.push(CMD_PACKET);
    let _ = frame.push(data.len() as u8);
    let _ = frame.extend_from_slice(data);
    Ok(frame)
}

/// Reads the next frame, or `None` if the peer closed the connection cleanly.
///
/// Not cancellation safe: a frame interrupted halfway is lost.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut cmd = [0u8; 1];
    if r.read(&mut cmd).await? == 0 {
        return Ok(None);
    }

    match cmd[0] {
        CMD_PACKET => {
            let len = usize::from(r.read_u8().await?);
            if len == 0 || len > MAX_PACKET_SIZE {
                return Err(FrameError::InvalidLength(len));
            }

            let mut data = [0u8; MAX_PACKET_SIZE];
            r.read_exact(&mut data[..len]).await?;
            let payload = Payload::from_slice(&data[..len]).map_err(|()| FrameError::InvalidLength(len))?;
            Ok(Some(Frame::Packet(payload)))
        }
        CMD_ASSIGN => Ok(Some(Frame::Assigned(r.read_u8().await?))),
        CMD_QUIT => Ok(Some(Frame::Quit)),
        other => Err(FrameError::UnknownCommand(other)),
    }
}
