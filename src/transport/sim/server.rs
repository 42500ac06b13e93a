use super::wire::{self, Frame, HandshakeError, CMD_ASSIGN, CMD_QUIT};
use crate::alert::{AlertSource, Level};
use crate::arp::Arp;
use crate::config::SimConfig;
use crate::error::BusError;
use crate::protocol::{Address, Device, ErrorKind, Event, Packet, Payload};
use crate::transport::{EventSink, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ConnId = u64;

/// Work handed from connection tasks to the transport.
#[derive(Debug)]
enum Inbound {
    Joined {
        conn: ConnId,
        peer: SocketAddr,
        device: Device,
        stream: TcpStream,
    },
    Packet {
        conn: ConnId,
        addr: Address,
        data: Payload,
        /// Returned to the mailbox when the packet is consumed.
        room: OwnedSemaphorePermit,
    },
    Left {
        conn: ConnId,
        addr: Address,
        fault: bool,
    },
}

/// Pending work plus the alert level derived from it.
///
/// The level is asserted exactly while the queue is not empty; both are
/// updated under the same lock. Packets need a permit from `room` before they
/// are queued, so at most `capacity` of them wait at any time.
#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<Inbound>>,
    level: watch::Sender<Level>,
    room: Arc<Semaphore>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        let (level, _) = watch::channel(Level::Deasserted);
        Self {
            queue: Mutex::new(VecDeque::new()),
            level,
            room: Arc::new(Semaphore::new(capacity)),
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Inbound>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_level(&self, level: Level) {
        self.level.send_if_modified(|current| {
            let changed = *current != level;
            *current = level;
            changed
        });
    }

    fn push(&self, item: Inbound) {
        let mut queue = self.lock();
        queue.push_back(item);
        self.set_level(Level::Asserted);
    }

    fn pop(&self) -> Option<Inbound> {
        let mut queue = self.lock();
        let item = queue.pop_front();
        if queue.is_empty() {
            self.set_level(Level::Deasserted);
        }
        item
    }

    fn clear(&self) {
        let mut queue = self.lock();
        queue.clear();
        self.set_level(Level::Deasserted);
    }
}

/// Alert source of a [`SimTransport`]: asserted while connection tasks have
/// queued work for the bus.
#[derive(Debug)]
pub struct SimAlert {
    level: watch::Receiver<Level>,
    closed: bool,
}

#[async_trait]
impl AlertSource for SimAlert {
    async fn next_level(&mut self) -> Result<Level, BusError> {
        if self.closed {
            return std::future::pending().await;
        }
        self.level.changed().await.map_err(|_| BusError::AlertClosed)?;
        let level = *self.level.borrow_and_update();
        Ok(level)
    }

    fn try_level(&mut self) -> Result<Option<Level>, BusError> {
        match self.level.has_changed() {
            Ok(true) => Ok(Some(*self.level.borrow_and_update())),
            Ok(false) => Ok(None),
            Err(_) => Err(BusError::AlertClosed),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug)]
struct Client {
    conn: ConnId,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Client {
    /// Tells the peer to go away and tears the connection down.
    async fn quit(mut self, timeout: Duration) {
        let _ = time::timeout(timeout, self.writer.write_all(&[CMD_QUIT])).await;
        let _ = time::timeout(timeout, self.writer.shutdown()).await;
        self.reader.abort();
        debug!(peer = %self.peer, conn = self.conn, "client dropped");
    }

    fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }
}

/// A bus simulated over TCP: every accepted connection is one slave.
///
/// Connections are accepted and greeted in background tasks; everything that
/// touches the address table happens inside the [`Transport`] operations,
/// on the engine's task.
#[derive(Debug)]
pub struct SimTransport {
    local_addr: SocketAddr,
    config: SimConfig,
    mailbox: Arc<Mailbox>,
    next_conn: Arc<AtomicU64>,
    acceptor: Option<JoinHandle<()>>,
    clients: HashMap<Address, Client>,
}

impl SimTransport {
    /// Starts listening on `addr`.
    ///
    /// The returned alert must be handed to the same bus as the transport.
    pub async fn bind(addr: impl ToSocketAddrs, config: SimConfig) -> Result<(Self, SimAlert), BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let mailbox = Arc::new(Mailbox::new(config.inbound_capacity));
        let mut level = mailbox.level.subscribe();
        level.mark_changed();
        let alert = SimAlert {
            level,
            closed: false,
        };

        let mut transport = Self {
            local_addr,
            config,
            mailbox,
            next_conn: Arc::new(AtomicU64::new(0)),
            acceptor: None,
            clients: HashMap::new(),
        };
        transport.listen(listener);

        info!(addr = %local_addr, "simulated bus listening");
        Ok((transport, alert))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of slaves currently connected.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connections, packets and hangups waiting for the bus.
    pub fn queued(&self) -> usize {
        self.mailbox.len()
    }

    fn listen(&mut self, listener: TcpListener) {
        self.acceptor = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.mailbox),
            Arc::clone(&self.next_conn),
            self.config.handshake_timeout(),
        )));
    }

    /// Stops accepting and drops every connection, pending or registered.
    async fn shut_down(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            // owns the listener and the pending handshakes; wait until they
            // are gone so the address can be bound again
            acceptor.abort();
            let _ = acceptor.await;
        }

        let timeout = self.config.write_timeout();
        for (_, client) in self.clients.drain() {
            client.quit(timeout).await;
        }
        self.mailbox.clear();
    }

    async fn drop_client(&mut self, addr: Address) {
        if let Some(client) = self.clients.remove(&addr) {
            client.quit(self.config.write_timeout()).await;
        }
    }

    fn is_current(&self, addr: Address, conn: ConnId) -> bool {
        self.clients.get(&addr).map(|client| client.conn) == Some(conn)
    }

    /// Handles one queued item. Returns true if a packet was delivered.
    async fn dispatch(&mut self, item: Inbound, arp: &mut Arp, events: &EventSink) -> bool {
        match item {
            Inbound::Joined {
                conn,
                peer,
                device,
                stream,
            } => {
                self.admit(conn, peer, device, stream, arp, events).await;
                false
            }
            Inbound::Packet { conn, addr, data, .. } => {
                if !self.is_current(addr, conn) {
                    debug!(conn, "dropping packet from a replaced connection");
                    return false;
                }
                arp.touch(addr);
                events.emit(Event::Packet(Packet { addr, data })).await;
                true
            }
            Inbound::Left { conn, addr, fault } => {
                if !self.is_current(addr, conn) {
                    return false;
                }
                self.drop_client(addr).await;
                if let Some(id) = arp.find_by_address(addr).map(|slave| slave.id()) {
                    arp.unregister(id);
                }
                if fault {
                    events.emit(Event::error_at(ErrorKind::Bus, addr)).await;
                }
                info!(addr = %format_args!("{:02X}", addr), "slave disconnected");
                events.emit(Event::Disconnect { addr }).await;
                false
            }
        }
    }

    async fn admit(
        &mut self,
        conn: ConnId,
        peer: SocketAddr,
        device: Device,
        stream: TcpStream,
        arp: &mut Arp,
        events: &EventSink,
    ) {
        let timeout = self.config.write_timeout();
        let replaced = arp.find_by_udid(device.udid).map(|slave| slave.address());

        let (addr, id) = match arp.register(device) {
            Ok(slave) => (slave.address(), slave.id()),
            Err(e) => {
                warn!(%peer, udid = %device.udid, "cannot register device: {}", e);
                reject(stream, timeout).await;
                events.emit(Event::error(ErrorKind::Registration)).await;
                return;
            }
        };

        if let Some(old) = replaced {
            self.drop_client(old).await;
            if old != addr {
                events.emit(Event::Disconnect { addr: old }).await;
            }
        }
        self.drop_client(addr).await;

        let (reader, mut writer) = stream.into_split();
        match time::timeout(timeout, writer.write_all(&[CMD_ASSIGN, addr])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%peer, "cannot send address assignment: {}", e);
                arp.unregister(id);
                events.emit(Event::error_at(ErrorKind::Bus, addr)).await;
                return;
            }
            Err(_) => {
                warn!(%peer, "address assignment timed out");
                arp.unregister(id);
                events.emit(Event::error_at(ErrorKind::Bus, addr)).await;
                return;
            }
        }

        let reader = tokio::spawn(read_loop(reader, conn, addr, Arc::clone(&self.mailbox)));
        self.clients.insert(
            addr,
            Client {
                conn,
                peer,
                writer,
                reader,
            },
        );

        info!(
            %peer,
            udid = %device.udid,
            addr = %format_args!("{:02X}", addr),
            "device connected"
        );
        events.emit(Event::Connect { addr, device }).await;
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn reset(&mut self) -> Result<(), BusError> {
        self.shut_down().await;
        let listener = TcpListener::bind(self.local_addr).await?;
        self.listen(listener);
        info!(addr = %self.local_addr, "simulated bus reset");
        Ok(())
    }

    async fn discover(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        // a silent slave is fine as long as its connection is still up
        for id in arp.inactive() {
            let addr = id.address();
            if self.clients.get(&addr).is_some_and(Client::is_connected) {
                arp.touch(addr);
                continue;
            }

            self.drop_client(addr).await;
            arp.unregister(id);
            info!(addr = %format_args!("{:02X}", addr), "slave connection lost");
            events.emit(Event::Disconnect { addr }).await;
        }

        while let Some(item) = self.mailbox.pop() {
            self.dispatch(item, arp, events).await;
        }
        Ok(())
    }

    async fn poll(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError> {
        while let Some(item) = self.mailbox.pop() {
            if self.dispatch(item, arp, events).await {
                break;
            }
        }
        Ok(())
    }

    async fn send(&mut self, arp: &mut Arp, events: &EventSink, packet: Packet) -> Result<(), BusError> {
        let addr = packet.addr;
        let frame = match wire::encode_packet(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot encode packet: {}", e);
                events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
                return Ok(());
            }
        };

        let id = arp.find_by_address(addr).map(|slave| slave.id());
        let (Some(id), Some(client)) = (id, self.clients.get_mut(&addr)) else {
            debug!(addr = %format_args!("{:02X}", addr), "send to unknown slave");
            events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
            return Ok(());
        };

        let failure = match time::timeout(self.config.write_timeout(), client.writer.write_all(&frame)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("write timed out".to_string()),
        };

        match failure {
            None => {
                arp.touch(addr);
            }
            Some(reason) => {
                // the stream may hold half a frame now, so the slave is gone
                warn!(addr = %format_args!("{:02X}", addr), "send failed: {}", reason);
                events.emit(Event::error_at(ErrorKind::Ack, addr)).await;
                self.drop_client(addr).await;
                arp.unregister(id);
                events.emit(Event::Disconnect { addr }).await;
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.shut_down().await;
        debug!(addr = %self.local_addr, "simulated bus closed");
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        for client in self.clients.values() {
            client.reader.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, mailbox: Arc<Mailbox>, next_conn: Arc<AtomicU64>, timeout: Duration) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, conn, "new connection");
                    handshakes.spawn(greet(stream, peer, conn, Arc::clone(&mailbox), timeout));
                }
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

async fn greet(mut stream: TcpStream, peer: SocketAddr, conn: ConnId, mailbox: Arc<Mailbox>, timeout: Duration) {
    let greeting = async {
        wire::write_hello(&mut stream).await?;
        wire::read_hello(&mut stream).await?;
        wire::read_udid(&mut stream).await
    };

    let result = match time::timeout(timeout, greeting).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    };

    match result {
        Ok(udid) => mailbox.push(Inbound::Joined {
            conn,
            peer,
            device: Device::new(udid),
            stream,
        }),
        Err(e) => warn!(%peer, "client handshake failed: {}", e),
    }
}

async fn reject(mut stream: TcpStream, timeout: Duration) {
    let _ = time::timeout(timeout, stream.write_all(&[CMD_QUIT])).await;
    let _ = time::timeout(timeout, stream.shutdown()).await;
}

async fn read_loop(mut reader: OwnedReadHalf, conn: ConnId, addr: Address, mailbox: Arc<Mailbox>) {
    let fault = loop {
        match wire::read_frame(&mut reader).await {
            Ok(Some(Frame::Packet(data))) => {
                // a busy bus stops the reader, and TCP stops the slave
                let Ok(room) = Arc::clone(&mailbox.room).acquire_owned().await else {
                    break false;
                };
                mailbox.push(Inbound::Packet { conn, addr, data, room });
            }
            Ok(Some(frame)) => {
                warn!(conn, ?frame, "unexpected frame from slave");
                break true;
            }
            Ok(None) => break false,
            Err(e) => {
                warn!(conn, "slave connection failed: {}", e);
                break true;
            }
        }
    };
    mailbox.push(Inbound::Left { conn, addr, fault });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_level_follows_queue() {
        let mailbox = Mailbox::new(4);
        let level = mailbox.level.subscribe();
        assert_eq!(*level.borrow(), Level::Deasserted);

        mailbox.push(Inbound::Left {
            conn: 0,
            addr: 0x10,
            fault: false,
        });
        mailbox.push(Inbound::Left {
            conn: 1,
            addr: 0x11,
            fault: false,
        });
        assert_eq!(*level.borrow(), Level::Asserted);

        assert!(mailbox.pop().is_some());
        assert_eq!(*level.borrow(), Level::Asserted);
        assert!(mailbox.pop().is_some());
        assert_eq!(*level.borrow(), Level::Deasserted);
        assert!(mailbox.pop().is_none());
    }

    #[test]
    fn test_mailbox_packets_hold_room() {
        let mailbox = Mailbox::new(2);
        for conn in 0..2 {
            let room = Arc::clone(&mailbox.room).try_acquire_owned().unwrap();
            mailbox.push(Inbound::Packet {
                conn,
                addr: 0x10,
                data: Payload::from_slice(&[1]).unwrap(),
                room,
            });
        }
        assert!(Arc::clone(&mailbox.room).try_acquire_owned().is_err());

        drop(mailbox.pop());
        assert_eq!(mailbox.room.available_permits(), 1);
        mailbox.clear();
        assert_eq!(mailbox.room.available_permits(), 2);
    }

    #[test]
    fn test_mailbox_clear_deasserts() {
        let mailbox = Mailbox::new(4);
        let level = mailbox.level.subscribe();
        mailbox.push(Inbound::Left {
            conn: 0,
            addr: 0x10,
            fault: true,
        });
        mailbox.clear();
        assert_eq!(*level.borrow(), Level::Deasserted);
        assert!(mailbox.pop().is_none());
    }
}
