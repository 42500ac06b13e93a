//! Simulated bus over TCP.
//!
//! Each TCP connection stands in for one slave. The server greets every new
//! connection, learns its UDID and queues it for registration; registration,
//! packet delivery and disconnect handling all run inside the [`Transport`]
//! operations, so the address table has a single owner.
//!
//! The alert line is simulated too: [`SimAlert`] is asserted whenever
//! connection tasks have queued work.
//!
//! [`Transport`]: crate::transport::Transport

mod client;
mod server;
pub mod wire;

pub use client::{SimSlave, SlaveReceiver, SlaveSender};
pub use server::{SimAlert, SimTransport};
pub use wire::{Frame as SlaveFrame, FrameError, HandshakeError};
