//! Address resolution: which device holds which bus address.

use crate::protocol::{is_slave_addr, Address, Device, Udid, MAX_SLAVES, MIN_ADDR, NUM_ADDR};
use heapless::Vec;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_SILENCE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArpError {
    #[error("too many slaves")]
    TooManySlaves,
}

/// Handle to one particular registration of a slave.
///
/// A device that re-registers gets a new handle even if it ends up at the same
/// address, so stale handles never free someone else's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveId {
    addr: Address,
    serial: u64,
}

impl SlaveId {
    pub fn address(&self) -> Address {
        self.addr
    }
}

#[derive(Debug, Clone)]
pub struct Slave {
    addr: Address,
    udid: Udid,
    last_seen: Instant,
    serial: u64,
}

impl Slave {
    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn udid(&self) -> Udid {
        self.udid
    }

    pub fn device(&self) -> Device {
        Device::new(self.udid)
    }

    pub fn id(&self) -> SlaveId {
        SlaveId {
            addr: self.addr,
            serial: self.serial,
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_active(&self, now: Instant, silence_limit: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < silence_limit
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn index(&self) -> usize {
        slot_index(self.addr)
    }
}

fn slot_index(addr: Address) -> usize {
    usize::from(addr - MIN_ADDR)
}

/// Fixed-capacity table of registered slaves, indexed by address offset.
#[derive(Debug)]
pub struct Arp {
    slots: [Option<Slave>; NUM_ADDR],
    count: usize,
    capacity: usize,
    silence_limit: Duration,
    next_serial: u64,
}

impl Arp {
    pub fn new(capacity: usize, silence_limit: Duration) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            count: 0,
            capacity: capacity.min(MAX_SLAVES),
            silence_limit,
            next_serial: 0,
        }
    }

    /// Registers `device` at the lowest free address.
    ///
    /// A slave already registered with the same UDID is dropped first, so a
    /// reconnecting device never occupies two slots.
    pub fn register(&mut self, device: Device) -> Result<&Slave, ArpError> {
        if let Some(previous) = self.find_by_udid(device.udid).map(Slave::id) {
            self.unregister(previous);
        }

        if self.count >= self.capacity {
            return Err(ArpError::TooManySlaves);
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ArpError::TooManySlaves)?;

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        self.count += 1;

        debug_assert!(
            self.count <= self.capacity,
            "ARP occupancy {} exceeds capacity {}",
            self.count,
            self.capacity
        );

        let slave = self.slots[index].insert(Slave {
            addr: MIN_ADDR + index as Address,
            udid: device.udid,
            last_seen: Instant::now(),
            serial,
        });
        Ok(slave)
    }

    /// Frees the slot of `id`, unless it has been re-registered since.
    pub fn unregister(&mut self, id: SlaveId) -> bool {
        if !is_slave_addr(id.addr) {
            return false;
        }

        let slot = &mut self.slots[slot_index(id.addr)];
        match slot {
            Some(slave) if slave.serial == id.serial => {
                *slot = None;
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn find_by_udid(&self, udid: Udid) -> Option<&Slave> {
        self.iter().find(|slave| slave.udid == udid)
    }

    pub fn find_by_address(&self, addr: Address) -> Option<&Slave> {
        if !is_slave_addr(addr) {
            return None;
        }
        self.slots[slot_index(addr)].as_ref()
    }

    /// Marks the slave at `addr` as seen right now.
    pub fn touch(&mut self, addr: Address) -> bool {
        if !is_slave_addr(addr) {
            return false;
        }
        match self.slots[slot_index(addr)].as_mut() {
            Some(slave) => {
                slave.touch();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, slave: &Slave) -> bool {
        slave.is_active(Instant::now(), self.silence_limit)
    }

    /// Slaves that have been silent for at least the silence limit.
    pub fn inactive(&self) -> Vec<SlaveId, MAX_SLAVES> {
        let now = Instant::now();
        self.iter()
            .filter(|slave| !slave.is_active(now, self.silence_limit))
            .map(Slave::id)
            .take(MAX_SLAVES)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slave> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn silence_limit(&self) -> Duration {
        self.silence_limit
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.count = 0;
    }
}

impl Default for Arp {
    fn default() -> Self {
        Self::new(MAX_SLAVES, DEFAULT_SILENCE_LIMIT)
    }
}
