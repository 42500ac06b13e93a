//! # ZEN-bus master
//!
//! Master side of the ZEN-bus protocol: a small packet bus where slaves are
//! discovered and addressed dynamically and signal pending data on a shared
//! alert line.
//!
//! ## Features
//!
//! - **Dynamic addressing**: devices identify themselves by UDID and get the
//!   lowest free address between 0x10 and 0x4F
//! - **Alert-driven polling**: the bus is polled only while the alert line is
//!   asserted, in bounded bursts
//! - **Two transports**: Linux I2C with a GPIO alert pin, and a simulated bus
//!   over TCP for development and tests
//! - **Bounded memory**: fixed-size packets and a fixed-size address table
//!
//! ## Quick Start
//!
//! ```no_run
//! use zbus::{Bus, BusConfig, Packet, SimTransport};
//!
//! # async fn run() -> Result<(), zbus::BusError> {
//! let config = BusConfig::default();
//! let (transport, alert) = SimTransport::bind("127.0.0.1:7082", config.sim.clone()).await?;
//! let mut bus = Bus::new(Box::new(transport), Box::new(alert), config)?;
//!
//! bus.send(Packet::new(0x10, b"hello").expect("valid packet")).await?;
//! while let Some(event) = bus.next_event().await {
//!     println!("{:?}", event);
//! }
//! bus.close().await
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - The engine task and its public handle
//! - [`transport`] - The transport contract, I2C and simulated transports
//! - [`arp`] - Address table
//! - [`alert`] - Alert line sources
//! - [`protocol`] - Addresses, packets and events
//! - [`text`] - Text protocol used by the `zbus` command
//! - [`config`] - Bus configuration

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod alert;
pub mod arp;
pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod text;
pub mod transport;

/// Protocol version reported in the `ZBUS` greeting.
pub const VERSION: &str = "0.1.0";

pub use alert::{AlertSource, Level};
pub use arp::Arp;
pub use bus::{Bus, BusHandle, BusState};
pub use config::BusConfig;
pub use error::BusError;
pub use protocol::{Address, Device, ErrorKind, Event, Packet, Udid};
pub use transport::{SimTransport, Transport};
