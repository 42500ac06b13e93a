use std::time::Duration;
use zbus::arp::{Arp, ArpError};
use zbus::protocol::*;

fn device(bytes: [u8; UDID_SIZE]) -> Device {
    Device::new(Udid(bytes))
}

fn numbered(n: u8) -> Device {
    device([0xD0, 0, 0, 0, 0, 0, 0, n])
}

#[test]
fn test_two_devices_get_consecutive_addresses() {
    let mut arp = Arp::default();

    let first = arp.register(device([1, 2, 3, 4, 5, 6, 7, 8])).unwrap().id();
    let second = arp
        .register(device([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x00]))
        .unwrap()
        .id();
    assert_eq!(first.address(), 0x10);
    assert_eq!(second.address(), 0x11);

    assert!(arp.unregister(first));
    assert!(arp.find_by_address(0x10).is_none());

    let remaining = arp.find_by_address(0x11).unwrap();
    assert_eq!(remaining.id(), second);
    assert_eq!(remaining.udid().to_string(), "AABBCCDDEEFF1100");
    assert_eq!(arp.len(), 1);
}

#[test]
fn test_freed_address_is_reused_first() {
    let mut arp = Arp::default();
    for n in 0..4 {
        arp.register(numbered(n)).unwrap();
    }

    let second = arp.find_by_address(0x11).unwrap().id();
    arp.unregister(second);

    assert_eq!(arp.register(numbered(9)).unwrap().address(), 0x11);
    assert_eq!(arp.register(numbered(10)).unwrap().address(), 0x14);
}

#[test]
fn test_capacity_is_enforced() {
    let mut arp = Arp::new(MAX_SLAVES, Duration::from_secs(5));
    for n in 0..MAX_SLAVES as u8 {
        assert!(arp.register(numbered(n)).is_ok());
    }
    assert_eq!(arp.len(), MAX_SLAVES);

    assert_eq!(
        arp.register(numbered(200)).map(|slave| slave.address()),
        Err(ArpError::TooManySlaves)
    );
    assert_eq!(arp.len(), MAX_SLAVES);
    assert!(arp.iter().all(|slave| is_slave_addr(slave.address())));
}

#[test]
fn test_capacity_is_capped_at_max_slaves() {
    let arp = Arp::new(1000, Duration::from_secs(5));
    assert_eq!(arp.capacity(), MAX_SLAVES);
}

#[test]
fn test_smaller_capacity() {
    let mut arp = Arp::new(2, Duration::from_secs(5));
    arp.register(numbered(1)).unwrap();
    arp.register(numbered(2)).unwrap();
    assert!(arp.register(numbered(3)).is_err());
}

#[test]
fn test_reregistering_keeps_occupancy() {
    let mut arp = Arp::default();
    arp.register(numbered(1)).unwrap();
    arp.register(numbered(2)).unwrap();

    let again = arp.register(numbered(1)).unwrap().address();
    assert_eq!(again, 0x10);
    assert_eq!(arp.len(), 2);
    assert_eq!(
        arp.iter().filter(|slave| slave.udid() == numbered(1).udid).count(),
        1
    );
}

#[test]
fn test_reregistering_in_a_full_table_succeeds() {
    let mut arp = Arp::new(3, Duration::from_secs(5));
    for n in 0..3 {
        arp.register(numbered(n)).unwrap();
    }
    assert!(arp.register(numbered(1)).is_ok());
    assert_eq!(arp.len(), 3);
}

#[test]
fn test_lookups() {
    let mut arp = Arp::default();
    let udid = numbered(7).udid;
    arp.register(numbered(7)).unwrap();

    assert_eq!(arp.find_by_udid(udid).unwrap().address(), 0x10);
    assert!(arp.find_by_udid(numbered(8).udid).is_none());
    assert!(arp.find_by_address(POLL_ADDR).is_none());
    assert!(arp.find_by_address(CALL_ADDR).is_none());
    assert!(!arp.touch(0x11));
}

#[tokio::test(start_paused = true)]
async fn test_activity_follows_silence_limit() {
    let mut arp = Arp::new(MAX_SLAVES, Duration::from_secs(5));
    arp.register(numbered(1)).unwrap();
    arp.register(numbered(2)).unwrap();

    let first = arp.find_by_address(0x10).unwrap();
    assert!(arp.is_active(first));
    assert!(arp.inactive().is_empty());

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(arp.touch(0x10));

    tokio::time::advance(Duration::from_secs(2)).await;
    // 0x11 has now been silent for exactly the limit
    let inactive = arp.inactive();
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].address(), 0x11);
    assert!(arp.is_active(arp.find_by_address(0x10).unwrap()));

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(arp.inactive().len(), 2);
}
