use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zbus::alert::{self, NoAlert};
use zbus::arp::Arp;
use zbus::error::BusError;
use zbus::protocol::*;
use zbus::transport::{EventSink, Transport};
use zbus::{Bus, BusConfig, BusState};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Reset,
    Discover,
    Poll,
    Send(Address),
    Close,
}

type Ops = Arc<Mutex<Vec<Op>>>;

#[derive(Default)]
struct FakeTransport {
    ops: Ops,
    pending: VecDeque<Packet>,
    chatty: bool,
    joining: Vec<Device>,
    fail_send: bool,
}

impl FakeTransport {
    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn reset(&mut self) -> Result<(), BusError> {
        self.record(Op::Reset);
        Ok(())
    }

    async fn discover(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        self.record(Op::Discover);
        for device in self.joining.drain(..) {
            let addr = arp.register(device).unwrap().address();
            events.emit(Event::Connect { addr, device }).await;
        }
        Ok(())
    }

    async fn poll(&mut self, _arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        self.record(Op::Poll);
        if let Some(packet) = self.pending.pop_front() {
            events.emit(Event::Packet(packet)).await;
        } else if self.chatty {
            events.emit(Event::Packet(Packet::new(0x10, &[0]).unwrap())).await;
        }
        Ok(())
    }

    async fn send(&mut self, arp: &mut Arp, events: &EventSink, packet: Packet) -> Result<(), BusError> {
        self.record(Op::Send(packet.addr));
        if self.fail_send {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "wire cut").into());
        }
        if arp.find_by_address(packet.addr).is_none() {
            events.emit(Event::error_at(ErrorKind::Ack, packet.addr)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.record(Op::Close);
    }
}

fn snapshot(ops: &Ops) -> Vec<Op> {
    ops.lock().unwrap().clone()
}

fn count(ops: &Ops, op: &Op) -> usize {
    ops.lock().unwrap().iter().filter(|o| *o == op).count()
}

async fn wait_until(ops: &Ops, done: impl Fn(&[Op]) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&ops.lock().unwrap()) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("engine did not get there in time");
}

fn packet(addr: Address) -> Packet {
    Packet::new(addr, &[addr, 0xEE]).unwrap()
}

#[tokio::test]
async fn test_commands_run_in_order() {
    let transport = FakeTransport::default();
    let ops = transport.ops.clone();
    let mut bus = Bus::new(Box::new(transport), Box::new(NoAlert), BusConfig::default()).unwrap();
    let handle = bus.handle();

    handle.reset().await.unwrap();
    handle.send(packet(0x10)).await.unwrap();
    handle.send(packet(0x11)).await.unwrap();
    wait_until(&ops, |ops| ops.contains(&Op::Send(0x11))).await;

    assert_eq!(
        snapshot(&ops),
        vec![Op::Reset, Op::Send(0x10), Op::Send(0x11)]
    );
    assert_eq!(bus.next_event().await, Some(Event::Reset));
    assert_eq!(bus.next_event().await, Some(Event::error_at(ErrorKind::Ack, 0x10)));
    assert_eq!(bus.next_event().await, Some(Event::error_at(ErrorKind::Ack, 0x11)));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_poll_burst_is_capped() {
    let transport = FakeTransport::default();
    let ops = transport.ops.clone();
    let (trigger, line) = alert::line();
    trigger.assert();

    let mut bus = Bus::new(Box::new(transport), Box::new(line), BusConfig::default()).unwrap();

    // the line never deasserts, so polling continues across bursts
    wait_until(&ops, |ops| ops.len() > 3 * MAX_SLAVES).await;

    let before = count(&ops, &Op::Poll);
    bus.send(packet(0x12)).await.unwrap();
    wait_until(&ops, |ops| ops.contains(&Op::Send(0x12))).await;

    let log = snapshot(&ops);
    let sent_at = log.iter().position(|op| *op == Op::Send(0x12)).unwrap();
    let polls_in_between = log[..sent_at].iter().filter(|op| **op == Op::Poll).count() - before;
    assert!(
        polls_in_between <= MAX_SLAVES,
        "command waited for {} polls",
        polls_in_between
    );

    bus.close().await.unwrap();
    assert_eq!(snapshot(&ops).last(), Some(&Op::Close));
}

#[tokio::test]
async fn test_polled_packets_become_events() {
    let mut transport = FakeTransport::default();
    transport.pending.push_back(packet(0x10));
    transport.pending.push_back(packet(0x11));
    let (trigger, line) = alert::line();

    let mut bus = Bus::new(Box::new(transport), Box::new(line), BusConfig::default()).unwrap();
    trigger.assert();

    assert_eq!(bus.next_event().await, Some(Event::Packet(packet(0x10))));
    assert_eq!(bus.next_event().await, Some(Event::Packet(packet(0x11))));

    trigger.deassert();
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_deasserted_line_stops_polling() {
    let transport = FakeTransport::default();
    let ops = transport.ops.clone();
    let (trigger, line) = alert::line();
    trigger.assert();
    trigger.deassert();

    let mut bus = Bus::new(Box::new(transport), Box::new(line), BusConfig::default()).unwrap();
    bus.send(packet(0x10)).await.unwrap();
    wait_until(&ops, |ops| ops.contains(&Op::Send(0x10))).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // the burst sees the deassertion right after its first poll
    assert!(count(&ops, &Op::Poll) <= 1);
    bus.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_discovery_runs_on_timer() {
    let mut transport = FakeTransport::default();
    transport.joining.push(Device::new(Udid([1, 2, 3, 4, 5, 6, 7, 8])));
    let ops = transport.ops.clone();

    let mut bus = Bus::new(Box::new(transport), Box::new(NoAlert), BusConfig::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count(&ops, &Op::Discover), 0);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(count(&ops, &Op::Discover), 1);
    assert!(matches!(
        bus.next_event().await,
        Some(Event::Connect { addr: 0x10, .. })
    ));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(count(&ops, &Op::Discover), 3);

    bus.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reset_forgets_slaves() {
    let mut transport = FakeTransport::default();
    transport.joining.push(Device::new(Udid([1, 2, 3, 4, 5, 6, 7, 8])));
    let mut bus = Bus::new(Box::new(transport), Box::new(NoAlert), BusConfig::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(matches!(
        bus.next_event().await,
        Some(Event::Connect { addr: 0x10, .. })
    ));

    // known slave: no event
    bus.send(packet(0x10)).await.unwrap();
    bus.reset().await.unwrap();
    assert_eq!(bus.next_event().await, Some(Event::Reset));

    bus.send(packet(0x10)).await.unwrap();
    assert_eq!(bus.next_event().await, Some(Event::error_at(ErrorKind::Ack, 0x10)));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_alert_is_fatal() {
    let transport = FakeTransport::default();
    let ops = transport.ops.clone();
    let (trigger, line) = alert::line();

    let mut bus = Bus::new(Box::new(transport), Box::new(line), BusConfig::default()).unwrap();
    drop(trigger);

    assert_eq!(bus.next_event().await, Some(Event::error(ErrorKind::System)));
    assert_eq!(bus.next_event().await, None);
    assert!(bus.wait_for_state(BusState::Closed).await);
    assert_eq!(snapshot(&ops), vec![Op::Close]);

    assert!(matches!(bus.send(packet(0x10)).await, Err(BusError::Closed)));
    assert!(matches!(bus.close().await, Err(BusError::AlertClosed)));
}

#[tokio::test]
async fn test_transport_failure_is_fatal() {
    let transport = FakeTransport {
        fail_send: true,
        ..FakeTransport::default()
    };
    let mut bus = Bus::new(Box::new(transport), Box::new(NoAlert), BusConfig::default()).unwrap();

    bus.send(packet(0x10)).await.unwrap();
    assert_eq!(bus.next_event().await, Some(Event::error(ErrorKind::System)));
    assert_eq!(bus.next_event().await, None);
    assert!(matches!(bus.close().await, Err(BusError::Io(_))));
}

#[tokio::test]
async fn test_close_is_clean_and_idempotent() {
    let transport = FakeTransport::default();
    let ops = transport.ops.clone();
    let mut bus = Bus::new(Box::new(transport), Box::new(NoAlert), BusConfig::default()).unwrap();
    let handle = bus.handle();
    assert_eq!(bus.state(), BusState::Running);

    bus.close().await.unwrap();
    assert_eq!(bus.state(), BusState::Closed);
    assert_eq!(snapshot(&ops), vec![Op::Close]);
    assert_eq!(bus.next_event().await, None);

    bus.close().await.unwrap();
    assert!(handle.is_closed());
    assert!(matches!(handle.reset().await, Err(BusError::Closed)));
    assert!(matches!(bus.send(packet(0x10)).await, Err(BusError::Closed)));
}

#[tokio::test]
async fn test_close_with_unread_events_does_not_hang() {
    let transport = FakeTransport {
        chatty: true,
        ..FakeTransport::default()
    };
    let (trigger, line) = alert::line();
    trigger.assert();

    let mut bus = Bus::new(Box::new(transport), Box::new(line), BusConfig::default()).unwrap();
    // let the engine fill the stream and block on it
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }

    tokio::time::timeout(Duration::from_secs(5), bus.close())
        .await
        .expect("close blocked on a full event stream")
        .unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = BusConfig {
        event_capacity: 0,
        ..BusConfig::default()
    };
    let result = Bus::new(Box::new(FakeTransport::default()), Box::new(NoAlert), config);
    assert!(matches!(result, Err(BusError::Config(_))));
}
