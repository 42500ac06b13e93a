use super::wire::{self, Frame, FrameError, HandshakeError};
use crate::protocol::{Address, Udid, UDID_SIZE};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// The slave end of a simulated bus connection.
#[derive(Debug)]
pub struct SimSlave {
    udid: Udid,
    addr: Address,
    receiver: SlaveReceiver,
    sender: SlaveSender,
}

impl SimSlave {
    /// Connects to a simulated bus and waits for an address.
    pub async fn connect(bus: impl ToSocketAddrs, udid: Udid) -> Result<Self, HandshakeError> {
        let stream = TcpStream::connect(bus).await?;
        let (mut reader, mut writer) = stream.into_split();

        wire::read_hello(&mut reader).await?;
        let mut hello = [0u8; wire::HELLO_SIZE + UDID_SIZE];
        hello[..wire::HELLO_SIZE].copy_from_slice(&wire::hello());
        hello[wire::HELLO_SIZE..].copy_from_slice(udid.as_bytes());
        writer.write_all(&hello).await?;

        let addr = match wire::read_frame(&mut reader).await? {
            Some(Frame::Assigned(addr)) => addr,
            Some(Frame::Quit) | None => return Err(HandshakeError::Rejected),
            Some(Frame::Packet(_)) => return Err(FrameError::UnknownCommand(wire::CMD_PACKET).into()),
        };
        debug!(%udid, addr = %format_args!("{:02X}", addr), "joined simulated bus");

        Ok(Self {
            udid,
            addr,
            receiver: SlaveReceiver { reader },
            sender: SlaveSender { writer },
        })
    }

    pub fn udid(&self) -> Udid {
        self.udid
    }

    /// The address assigned by the bus.
    pub fn address(&self) -> Address {
        self.addr
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.sender.send(data).await
    }

    /// Reads the next frame from the bus. `None` means the bus hung up.
    pub async fn recv(&mut self) -> Result<Option<Frame>, FrameError> {
        let frame = self.receiver.recv().await?;
        if let Some(Frame::Assigned(addr)) = frame {
            self.addr = addr;
        }
        Ok(frame)
    }

    /// Splits the connection so that reading and writing can happen in
    /// separate tasks.
    pub fn into_split(self) -> (SlaveReceiver, SlaveSender) {
        (self.receiver, self.sender)
    }
}

#[derive(Debug)]
pub struct SlaveReceiver {
    reader: OwnedReadHalf,
}

impl SlaveReceiver {
    pub async fn recv(&mut self) -> Result<Option<Frame>, FrameError> {
        wire::read_frame(&mut self.reader).await
    }
}

#[derive(Debug)]
pub struct SlaveSender {
    writer: OwnedWriteHalf,
}

impl SlaveSender {
    pub async fn send(&mut self, data: &[u8]) -> Result<(), FrameError> {
        let frame = wire::encode_packet(data)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
