//! The bus transport contract and its realizations.
//!
//! A transport knows how to talk to slaves over one physical (or simulated)
//! medium. The engine owns both the transport and the [`Arp`] and lends the
//! table to every operation, so a transport never keeps its own copy of who
//! is on the bus.
//!
//! Every operation distinguishes two kinds of failure:
//!
//! - Protocol level outcomes (a slave did not answer, a reply made no sense,
//!   the table is full) are reported through the [`EventSink`] and the
//!   operation returns `Ok(())`.
//! - Failures of the medium itself are returned as [`BusError`] and terminate
//!   the engine.

pub mod i2c;
pub mod sim;

pub use i2c::{Direction, HardwareTransport, I2cTransfer};
#[cfg(target_os = "linux")]
pub use i2c::LinuxI2c;
pub use sim::{FrameError, HandshakeError, SimAlert, SimSlave, SimTransport, SlaveFrame};

use crate::arp::Arp;
use crate::error::BusError;
use crate::protocol::{Event, Packet};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[async_trait]
pub trait Transport: Send {
    /// Broadcasts a bus reset. Calling it repeatedly is harmless.
    async fn reset(&mut self) -> Result<(), BusError>;

    /// Re-checks silent slaves, then registers every device that has not been
    /// given an address yet.
    async fn discover(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError>;

    /// Fetches at most one pending packet.
    async fn poll(&mut self, arp: &mut Arp, events: &EventSink) -> Result<(), BusError>;

    /// Delivers `packet` to its destination slave.
    async fn send(&mut self, arp: &mut Arp, events: &EventSink, packet: Packet) -> Result<(), BusError>;

    async fn close(&mut self);
}

/// Producer side of the bounded event stream.
///
/// Emitting waits while the stream is full. Once the owning bus starts
/// shutting down, an event that cannot be delivered is dropped instead.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl EventSink {
    /// Creates a free-standing sink and the matching event stream.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, shutdown: None }, rx)
    }

    pub(crate) fn with_shutdown(tx: mpsc::Sender<Event>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            tx,
            shutdown: Some(shutdown),
        }
    }

    pub async fn emit(&self, event: Event) {
        let delivered = match &self.shutdown {
            None => self.tx.send(event).await.is_ok(),
            Some(shutdown) => {
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    biased;
                    sent = self.tx.send(event) => sent.is_ok(),
                    _ = shutdown_requested(&mut shutdown) => false,
                }
            }
        };

        if !delivered {
            debug!("event dropped, nobody is listening");
        }
    }
}

/// Resolves once shutdown has been requested or the requester is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}
