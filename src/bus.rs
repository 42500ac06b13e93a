//! The bus engine.
//!
//! A [`Bus`] runs one engine task that owns the transport, the alert source
//! and the address table. Everything the engine does is serialized: a
//! discovery round, a queued command, or a burst of polls while the alert is
//! asserted. Results come back as [`Event`]s on a bounded stream.

use crate::alert::AlertSource;
use crate::arp::Arp;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::protocol::{ErrorKind, Event, Packet};
use crate::transport::{shutdown_requested, EventSink, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusState {
    Running,
    /// Shutdown requested, the engine is finishing its current operation.
    Closing,
    /// A fatal error stopped the engine; teardown is in progress.
    Faulted,
    Closed,
}

#[derive(Debug)]
enum Command {
    Reset,
    Send(Packet),
}

/// Cloneable command side of a [`Bus`].
#[derive(Debug, Clone)]
pub struct BusHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
}

impl BusHandle {
    /// Queues a bus reset.
    pub async fn reset(&self) -> Result<(), BusError> {
        self.submit(Command::Reset).await
    }

    /// Queues `packet` for delivery. Delivery failures show up as events.
    pub async fn send(&self, packet: Packet) -> Result<(), BusError> {
        self.submit(Command::Send(packet)).await
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.commands.is_closed()
    }

    async fn submit(&self, command: Command) -> Result<(), BusError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(BusError::Closed);
        }

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => Err(BusError::Closed),
            sent = self.commands.send(command) => sent.map_err(|_| BusError::Closed),
        }
    }
}

/// A running bus master.
///
/// Must be created inside a tokio runtime. Dropping the bus requests shutdown
/// without waiting for it; call [`close`](Bus::close) to wait and to learn
/// whether the engine failed.
#[derive(Debug)]
pub struct Bus {
    handle: BusHandle,
    events: mpsc::Receiver<Event>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<BusState>,
    engine: Option<JoinHandle<Result<(), BusError>>>,
}

impl Bus {
    pub fn new(
        transport: Box<dyn Transport>,
        alert: Box<dyn AlertSource>,
        config: BusConfig,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(BusState::Running);
        let (commands_tx, commands) = mpsc::channel(config.command_capacity);
        let (events_tx, events) = mpsc::channel(config.event_capacity);

        let engine = Engine {
            arp: Arp::new(config.max_slaves, config.silence_limit()),
            transport,
            alert,
            events: EventSink::with_shutdown(events_tx, shutdown_rx.clone()),
            commands,
            shutdown: shutdown_rx.clone(),
            state: state_tx,
            asserted: false,
            config,
        };
        let engine = tokio::spawn(engine.run());

        info!("bus started");
        Ok(Self {
            handle: BusHandle {
                commands: commands_tx,
                shutdown: shutdown_rx,
            },
            events,
            shutdown,
            state,
            engine: Some(engine),
        })
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub async fn reset(&self) -> Result<(), BusError> {
        self.handle.reset().await
    }

    pub async fn send(&self, packet: Packet) -> Result<(), BusError> {
        self.handle.send(packet).await
    }

    /// The event stream. It ends once the engine has shut down.
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn state(&self) -> BusState {
        *self.state.borrow()
    }

    /// Waits until the engine reaches `state`. Returns false if the engine is
    /// gone before that.
    pub async fn wait_for_state(&mut self, state: BusState) -> bool {
        self.state.wait_for(|current| *current == state).await.is_ok()
    }

    /// Shuts the bus down and waits for the engine to finish.
    ///
    /// Returns the error that stopped the engine, if any. Closing twice is a
    /// no-op.
    pub async fn close(&mut self) -> Result<(), BusError> {
        self.shutdown.send_replace(true);

        let Some(engine) = self.engine.take() else {
            return Ok(());
        };
        match engine.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Engine {
    transport: Box<dyn Transport>,
    alert: Box<dyn AlertSource>,
    arp: Arp,
    events: EventSink,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<BusState>,
    config: BusConfig,
    // last level reported by the alert source
    asserted: bool,
}

impl Engine {
    async fn run(mut self) -> Result<(), BusError> {
        let result = self.serve().await;

        match &result {
            Ok(()) => {
                self.state.send_replace(BusState::Closing);
                debug!("bus shutting down");
            }
            Err(e) => {
                self.state.send_replace(BusState::Faulted);
                error!("bus failed: {}", e);
                self.events.emit(Event::error(ErrorKind::System)).await;
            }
        }

        self.alert.close();
        self.transport.close().await;
        self.commands.close();
        // the event stream ends when the engine drops its sink
        self.state.send_replace(BusState::Closed);
        info!("bus closed");
        result
    }

    async fn serve(&mut self) -> Result<(), BusError> {
        let period = self.config.discovery_interval();
        let mut timer = time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command).await?,
                    None => return Ok(()),
                },
                _ = timer.tick() => {
                    trace!(slaves = self.arp.len(), "discovery round");
                    self.transport.discover(&mut self.arp, &self.events).await?;
                }
                level = self.alert.next_level() => {
                    self.asserted = level?.is_asserted();
                }
                // a line still asserted after a full burst gets another one
                _ = task::yield_now(), if self.asserted => {}
            }

            self.poll_burst().await?;
        }
    }

    async fn execute(&mut self, command: Command) -> Result<(), BusError> {
        match command {
            Command::Reset => {
                self.transport.reset().await?;
                self.arp.clear();
                info!("bus reset");
                self.events.emit(Event::Reset).await;
            }
            Command::Send(packet) => {
                debug!(
                    addr = %format_args!("{:02X}", packet.addr),
                    len = packet.len(),
                    "sending packet"
                );
                self.transport.send(&mut self.arp, &self.events, packet).await?;
            }
        }
        Ok(())
    }

    /// Polls while the alert stays asserted, up to the burst limit.
    async fn poll_burst(&mut self) -> Result<(), BusError> {
        let mut polls = 0;
        while self.asserted && polls < self.config.poll_burst_limit {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            self.transport.poll(&mut self.arp, &self.events).await?;
            polls += 1;

            if let Some(level) = self.alert.try_level()? {
                self.asserted = level.is_asserted();
            }
        }

        if self.asserted {
            trace!(polls, "poll burst limit reached");
        }
        Ok(())
    }
}
