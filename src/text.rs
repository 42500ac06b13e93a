//! Line oriented text protocol spoken by the `zbus` command on stdin/stdout.
//!
//! Inbound commands are whitespace separated tokens:
//!
//! ```text
//! RST
//! PKT <addr> <len> <data>
//! ```
//!
//! `addr` and `len` are hexadecimal bytes and `data` is `len` bytes in hex,
//! split into tokens at any even boundary. Outbound, the bus reports:
//!
//! ```text
//! ZBUS <version>
//! RST
//! PKT <addr> <len>       followed by the data, 32 bytes per line
//! ERR <addr>
//! CONN <addr>
//! DISC <addr>
//! ```

use crate::bus::BusHandle;
use crate::error::BusError;
use crate::protocol::{ErrorKind, Event, Packet, MAX_PACKET_SIZE};
use arrayvec::{ArrayString, ArrayVec};
use std::io::{self, Write as _};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Longest accepted token.
pub const MAX_TOKEN_LEN: usize = 256;

/// Data bytes per output line.
pub const LINE_WIDTH: usize = 32;

const HEX: &[u8; 16] = b"0123456789ABCDEF";
const RENDER_CAPACITY: usize = 512;

#[derive(Debug, Error)]
pub enum TextError {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Reset,
    Packet(Packet),
}

/// Reads commands from `input` and submits them through `bus` until the input
/// ends.
///
/// A submit waits for room in the command queue, and the engine only frees
/// room while its events are consumed. Run this on its own task, never on the
/// task draining the events.
pub async fn forward<R: AsyncRead + Unpin>(input: R, bus: BusHandle) -> Result<(), TextError> {
    let mut reader = TextReader::new(input);
    while let Some(request) = reader.read_command().await? {
        match request {
            Request::Reset => bus.reset().await?,
            Request::Packet(packet) => bus.send(packet).await?,
        }
    }
    Ok(())
}

pub struct TextReader<R> {
    inner: BufReader<R>,
    token: ArrayString<MAX_TOKEN_LEN>,
}

impl<R: AsyncRead + Unpin> TextReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            token: ArrayString::new(),
        }
    }

    /// Reads the next command. Returns `None` at the end of input.
    ///
    /// Not cancellation safe.
    pub async fn read_command(&mut self) -> Result<Option<Request>, TextError> {
        if !self.next_token().await? {
            return Ok(None);
        }

        match self.token.as_str() {
            "RST" => Ok(Some(Request::Reset)),
            "PKT" => Ok(Some(Request::Packet(self.read_packet().await?))),
            _ => Err(TextError::Protocol("unknown command")),
        }
    }

    async fn read_packet(&mut self) -> Result<Packet, TextError> {
        let addr = self.next_byte().await?;
        let len = usize::from(self.next_byte().await?);
        if len == 0 || len > MAX_PACKET_SIZE {
            return Err(TextError::Protocol("invalid packet length"));
        }

        let mut data = [0u8; MAX_PACKET_SIZE];
        let mut filled = 0;
        while filled < len {
            if !self.next_token().await? {
                return Err(TextError::Protocol("truncated packet"));
            }

            let token = self.token.as_bytes();
            if token.len() % 2 != 0 || filled + token.len() / 2 > len {
                return Err(TextError::Protocol("packet data does not match its length"));
            }

            for pair in token.chunks_exact(2) {
                data[filled] = hex_byte(pair[0], pair[1]).ok_or(TextError::Protocol("invalid hex digit"))?;
                filled += 1;
            }
        }

        Packet::new(addr, &data[..len]).map_err(|_| TextError::Protocol("invalid packet length"))
    }

    async fn next_byte(&mut self) -> Result<u8, TextError> {
        if !self.next_token().await? {
            return Err(TextError::Protocol("truncated command"));
        }
        if !self.token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TextError::Protocol("invalid hex byte"));
        }
        u8::from_str_radix(&self.token, 16).map_err(|_| TextError::Protocol("invalid hex byte"))
    }

    /// Reads one token into `self.token`. Returns false at the end of input.
    async fn next_token(&mut self) -> Result<bool, TextError> {
        self.token.clear();
        loop {
            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                return Ok(!self.token.is_empty());
            }

            let mut used = 0;
            let mut complete = false;
            for &b in buf {
                used += 1;
                if is_space(b) {
                    if !self.token.is_empty() {
                        complete = true;
                        break;
                    }
                } else if b.is_ascii_graphic() {
                    self.token
                        .try_push(char::from(b))
                        .map_err(|_| TextError::Protocol("token too long"))?;
                } else {
                    return Err(TextError::Protocol("invalid character"));
                }
            }

            self.inner.consume(used);
            if complete {
                return Ok(true);
            }
        }
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)
}

fn hex_byte(high: u8, low: u8) -> Option<u8> {
    let high = char::from(high).to_digit(16)?;
    let low = char::from(low).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

pub struct TextWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> TextWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn write_greeting(&mut self, version: &str) -> io::Result<()> {
        self.inner.write_all(format!("ZBUS {}\n", version).as_bytes()).await?;
        self.inner.flush().await
    }

    /// Writes `event` and flushes.
    ///
    /// `Error{System}` has no text form and is skipped.
    pub async fn write_event(&mut self, event: &Event) -> io::Result<()> {
        let text = render(event)?;
        if text.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&text).await?;
        self.inner.flush().await
    }
}

fn render(event: &Event) -> io::Result<ArrayVec<u8, RENDER_CAPACITY>> {
    let mut out = ArrayVec::new();
    match event {
        Event::Reset => writeln!(out, "RST")?,
        Event::Connect { addr, .. } => writeln!(out, "CONN {:02X}", addr)?,
        Event::Disconnect { addr } => writeln!(out, "DISC {:02X}", addr)?,
        Event::Error {
            kind: ErrorKind::System,
            ..
        } => {}
        Event::Error { addr, .. } => writeln!(out, "ERR {:02X}", addr.unwrap_or(0))?,
        Event::Packet(packet) => {
            writeln!(out, "PKT {:02X} {:02X}", packet.addr, packet.len())?;
            for line in packet.data.chunks(LINE_WIDTH) {
                for &b in line {
                    out.write_all(&[HEX[usize::from(b >> 4)], HEX[usize::from(b & 0x0F)]])?;
                }
                out.write_all(b"\n")?;
            }
        }
    }
    Ok(out)
}
