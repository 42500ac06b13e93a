//! Hardware transport over an I2C adapter.
//!
//! The whole protocol is expressed as sequences of one primitive, an addressed
//! transaction in a single direction. A transaction the addressed peer does
//! not acknowledge is a normal outcome (`Ok(false)`), not an error.

use super::{EventSink, Transport};
use crate::arp::Arp;
use crate::error::BusError;
use crate::protocol::{
    Address, Device, ErrorKind, Event, Packet, Udid, CALL_ADDR, CONF_ADDR, MAX_PACKET_SIZE,
    NUM_ADDR, POLL_ADDR, UDID_SIZE,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

const RESET_COMMAND: u8 = 0x00;
const POLL_REPLY_SIZE: usize = 2;
// UDID followed by the address the device proposes for itself
const DISCOVERY_REPLY_SIZE: usize = UDID_SIZE + 1;
// Guards against a device that keeps answering the configuration broadcast.
const MAX_DISCOVERY_ROUNDS: usize = NUM_ADDR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One addressed bus transaction.
pub trait I2cTransfer: Send {
    /// Reads into or writes from `buf`.
    ///
    /// Returns `Ok(true)` when the peer acknowledged, `Ok(false)` when nobody
    /// answered at `addr`, and an error only when the adapter itself failed.
    fn transfer(&mut self, addr: Address, direction: Direction, buf: &mut [u8]) -> Result<bool, BusError>;

    fn close(&mut self) {}
}

#[derive(Debug)]
pub struct HardwareTransport<D> {
    device: D,
}

impl<D: I2cTransfer> HardwareTransport<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// Probes every silent slave with an empty write and drops the ones that
    /// do not answer.
    async fn ping_silent(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        for id in arp.inactive() {
            let addr = id.address();
            if self.device.transfer(addr, Direction::Write, &mut [])? {
                arp.touch(addr);
                continue;
            }

            arp.unregister(id);
            info!(addr = %format_args!("{:02X}", addr), "slave went silent, disconnected");
            events.emit(Event::Disconnect { addr }).await;
        }
        Ok(())
    }

    async fn configure_new(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        for _ in 0..MAX_DISCOVERY_ROUNDS {
            let mut reply = [0u8; DISCOVERY_REPLY_SIZE];
            if !self.device.transfer(CONF_ADDR, Direction::Read, &mut reply)? {
                // nobody else is waiting for an address
                return Ok(());
            }

            let mut id = [0u8; UDID_SIZE];
            id.copy_from_slice(&reply[..UDID_SIZE]);
            let udid = Udid(id);
            let device = Device::new(udid);
            let replaced = arp.find_by_udid(udid).map(|slave| slave.address());

            let addr = match arp.register(device) {
                Ok(slave) => slave.address(),
                Err(e) => {
                    warn!(%udid, "cannot register device: {}", e);
                    events.emit(Event::error(ErrorKind::Registration)).await;
                    return Ok(());
                }
            };

            if let Some(old) = replaced.filter(|&old| old != addr) {
                events.emit(Event::Disconnect { addr: old }).await;
            }

            info!(
                %udid,
                addr = %format_args!("{:02X}", addr),
                proposed = %format_args!("{:02X}", reply[UDID_SIZE]),
                "device connected"
            );
            events.emit(Event::Connect { addr, device }).await;
        }

        warn!("discovery stopped after {} rounds", MAX_DISCOVERY_ROUNDS);
        Ok(())
    }
}

#[async_trait]
impl<D: I2cTransfer> Transport for HardwareTransport<D> {
    async fn reset(&mut self) -> Result<(), BusError> {
        // an empty bus does not acknowledge the general call
        let acked = self.device.transfer(CALL_ADDR, Direction::Write, &mut [RESET_COMMAND])?;
        debug!(acked, "bus reset sent");
        Ok(())
    }

    async fn discover(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        self.ping_silent(arp, events).await?;
        self.configure_new(arp, events).await
    }

    async fn poll(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        let mut reply = [0u8; POLL_REPLY_SIZE];
        if !self.device.transfer(POLL_ADDR, Direction::Read, &mut reply)? {
            // no pending data
            return Ok(());
        }

        let [addr, len] = reply;
        let len = usize::from(len);
        if arp.find_by_address(addr).is_none() || !(1..=MAX_PACKET_SIZE).contains(&len) {
            warn!(
                addr = %format_args!("{:02X}", addr),
                len,
                "invalid poll reply"
            );
            events.emit(Event::error(ErrorKind::Bus)).await;
            return Ok(());
        }

        let mut data = [0u8; MAX_PACKET_SIZE];
        if !self.device.transfer(addr, Direction::Read, &mut data[..len])? {
            debug!(addr = %format_args!("{:02X}", addr), "slave did not deliver polled data");
            events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
            return Ok(());
        }

        arp.touch(addr);
        match Packet::new(addr, &data[..len]) {
            Ok(packet) => events.emit(Event::Packet(packet)).await,
            Err(e) => {
                warn!("dropping polled data: {}", e);
                events.emit(Event::error(ErrorKind::Bus)).await;
            }
        }
        Ok(())
    }

    async fn send(&mut self, arp: &mut Arp, events: &EventSink, packet: Packet) -> Result<(), BusError> {
        let addr = packet.addr;
        if arp.find_by_address(addr).is_none() {
            debug!(addr = %format_args!("{:02X}", addr), "send to unknown slave");
            events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
            return Ok(());
        }

        let mut data = packet.data;
        if self.device.transfer(addr, Direction::Write, &mut data)? {
            arp.touch(addr);
        } else {
            debug!(addr = %format_args!("{:02X}", addr), "slave did not acknowledge packet");
            events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.device.close();
    }
}

#[cfg(target_os = "linux")]
pub use linux::{LinuxI2c, MAX_I2C_DEVICE};

#[cfg(target_os = "linux")]
mod linux {
    use super::{Direction, I2cTransfer};
    use crate::config::I2cConfig;
    use crate::error::{BusError, ConfigError};
    use crate::protocol::Address;
    use static_assertions::const_assert_eq;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use tracing::{info, trace};

    /// Highest `/dev/i2c-N` index accepted.
    pub const MAX_I2C_DEVICE: u32 = 9;

    // <linux/i2c-dev.h>, <linux/i2c.h>
    const I2C_FUNCS: libc::c_ulong = 0x0705;
    const I2C_RDWR: libc::c_ulong = 0x0707;
    const I2C_FUNC_I2C: libc::c_ulong = 0x0000_0001;
    const I2C_M_RD: u16 = 0x0001;

    #[repr(C)]
    struct I2cMsg {
        addr: u16,
        flags: u16,
        len: u16,
        buf: *mut u8,
    }

    #[repr(C)]
    struct I2cRdwrIoctlData {
        msgs: *mut I2cMsg,
        nmsgs: u32,
    }

    const_assert_eq!(
        core::mem::size_of::<I2cMsg>(),
        8 + core::mem::size_of::<usize>()
    );

    /// A Linux `/dev/i2c-N` adapter driven through `I2C_RDWR`.
    #[derive(Debug)]
    pub struct LinuxI2c {
        file: File,
        policy: I2cConfig,
    }

    impl LinuxI2c {
        pub fn open(index: u32, policy: I2cConfig) -> Result<Self, BusError> {
            if index > MAX_I2C_DEVICE {
                return Err(ConfigError::Invalid {
                    field: "I2C device number",
                    requirement: "between 0 and 9",
                }
                .into());
            }

            let path = format!("/dev/i2c-{}", index);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;

            let mut funcs: libc::c_ulong = 0;
            // SAFETY: I2C_FUNCS writes one unsigned long into `funcs`.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_FUNCS as _, &mut funcs as *mut libc::c_ulong) };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if funcs & I2C_FUNC_I2C == 0 {
                return Err(BusError::Unsupported);
            }

            info!(path = %path, "I2C adapter opened");
            Ok(Self { file, policy })
        }
    }

    impl I2cTransfer for LinuxI2c {
        fn transfer(&mut self, addr: Address, direction: Direction, buf: &mut [u8]) -> Result<bool, BusError> {
            let len = u16::try_from(buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too long"))?;

            let mut msg = I2cMsg {
                addr: u16::from(addr),
                flags: match direction {
                    Direction::Read => I2C_M_RD,
                    Direction::Write => 0,
                },
                len,
                buf: buf.as_mut_ptr(),
            };
            let mut data = I2cRdwrIoctlData {
                msgs: &mut msg,
                nmsgs: 1,
            };

            // SAFETY: `msg` describes `buf`, which stays borrowed for the whole
            // call; the kernel touches at most `len` bytes of it.
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    I2C_RDWR as _,
                    &mut data as *mut I2cRdwrIoctlData,
                )
            };
            if rc >= 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(errno) if self.policy.is_nack(errno) => {
                    trace!(addr, errno, "transfer not acknowledged");
                    Ok(false)
                }
                _ => Err(BusError::Io(err)),
            }
        }
    }
}
