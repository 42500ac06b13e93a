use core::fmt;
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Bus address of a slave or one of the reserved broadcast addresses.
pub type Address = u8;

/// General call address, used for the broadcast reset.
pub const CALL_ADDR: Address = 0x00;
/// Configuration broadcast answered by slaves that have no address yet.
pub const CONF_ADDR: Address = 0x76;
/// Poll broadcast answered by the slave holding pending data.
pub const POLL_ADDR: Address = 0x77;

/// Lower bound of the slave address space (inclusive).
pub const MIN_ADDR: Address = 0x10;
/// Upper bound of the slave address space (exclusive).
pub const MAX_ADDR: Address = 0x50;
/// Number of assignable slave addresses.
pub const NUM_ADDR: usize = (MAX_ADDR - MIN_ADDR) as usize;

/// Maximum number of slaves registered at the same time.
pub const MAX_SLAVES: usize = 32;
/// Maximum payload size of a single packet.
pub const MAX_PACKET_SIZE: usize = 128;
/// Size of a unique device identifier.
pub const UDID_SIZE: usize = 8;

const_assert!(MAX_SLAVES <= NUM_ADDR);
const_assert!(MAX_PACKET_SIZE <= u8::MAX as usize);
const_assert!(CONF_ADDR >= MAX_ADDR && POLL_ADDR >= MAX_ADDR);

/// Returns true if `addr` lies in the assignable slave range.
pub fn is_slave_addr(addr: Address) -> bool {
    (MIN_ADDR..MAX_ADDR).contains(&addr)
}

/// Unique device identifier burned into every slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Udid(pub [u8; UDID_SIZE]);

impl Udid {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; UDID_SIZE] = bytes.get(..UDID_SIZE)?.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; UDID_SIZE] {
        &self.0
    }
}

impl fmt::Display for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("UDID must be exactly {} hex digits", UDID_SIZE * 2)]
pub struct ParseUdidError;

impl FromStr for Udid {
    type Err = ParseUdidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != UDID_SIZE * 2 || !s.is_ascii() {
            return Err(ParseUdidError);
        }

        let mut id = [0u8; UDID_SIZE];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseUdidError)?;
        }
        Ok(Self(id))
    }
}

/// A peer that answered discovery but holds no address yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub udid: Udid,
}

impl Device {
    pub fn new(udid: Udid) -> Self {
        Self { udid }
    }
}

pub type Payload = Vec<u8, MAX_PACKET_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("invalid packet length {0}, expected 1..={MAX_PACKET_SIZE}")]
    InvalidLength(usize),
}

/// A packet travelling to or from a slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub addr: Address,
    pub data: Payload,
}

impl Packet {
    pub fn new(addr: Address, data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::InvalidLength(0));
        }
        let data = Vec::from_slice(data).map_err(|()| PacketError::InvalidLength(data.len()))?;
        Ok(Self { addr, data })
    }

    /// Payload length; always within `1..=MAX_PACKET_SIZE`.
    pub fn len(&self) -> u8 {
        self.data.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Inconsistent bus state, e.g. a malformed poll reply.
    Bus,
    /// An addressed slave did not acknowledge.
    Ack,
    Crc,
    /// The address table is full.
    Registration,
    /// Unrecoverable failure; the bus terminates after reporting it.
    System,
}

/// Everything the bus reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    Packet(Packet),
    Error {
        kind: ErrorKind,
        addr: Option<Address>,
    },
    Connect {
        addr: Address,
        device: Device,
    },
    Disconnect {
        addr: Address,
    },
    Reset,
}

impl Event {
    pub fn error(kind: ErrorKind) -> Self {
        Event::Error { kind, addr: None }
    }

    pub fn error_at(kind: ErrorKind, addr: Address) -> Self {
        Event::Error {
            kind,
            addr: Some(addr),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::Error {
                kind: ErrorKind::System,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_length_bounds() {
        assert_eq!(Packet::new(0x10, &[]), Err(PacketError::InvalidLength(0)));
        assert!(Packet::new(0x10, &[0xAB]).is_ok());
        assert!(Packet::new(0x10, &[0u8; MAX_PACKET_SIZE]).is_ok());
        assert_eq!(
            Packet::new(0x10, &[0u8; MAX_PACKET_SIZE + 1]),
            Err(PacketError::InvalidLength(MAX_PACKET_SIZE + 1))
        );
    }

    #[test]
    fn test_udid_text_form() {
        let udid: Udid = "0102030405060708".parse().unwrap();
        assert_eq!(udid, Udid([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(udid.to_string(), "0102030405060708");

        let udid: Udid = "aabbccddeeff0000".parse().unwrap();
        assert_eq!(udid.to_string(), "AABBCCDDEEFF0000");

        assert!("0102".parse::<Udid>().is_err());
        assert!("zz02030405060708".parse::<Udid>().is_err());
    }

    #[test]
    fn test_reserved_addresses_are_not_assignable() {
        for addr in [CALL_ADDR, CONF_ADDR, POLL_ADDR] {
            assert!(!is_slave_addr(addr));
        }
        assert!(is_slave_addr(0x10));
        assert!(is_slave_addr(0x4F));
        assert!(!is_slave_addr(0x50));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&Event::Disconnect { addr: 0x12 }).unwrap();
        assert_eq!(json, r#"{"type":"Disconnect","addr":18}"#);

        let json = serde_json::to_string(&Event::Reset).unwrap();
        assert_eq!(json, r#"{"type":"Reset"}"#);
    }
}
