//! Sources of the out-of-band alert signal.
//!
//! Slaves pull the alert line low while they hold data for the master. The
//! engine only cares about the level: while it is [`Level::Asserted`] the bus
//! is polled.

use crate::error::BusError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    /// Line pulled low, some slave has pending data.
    Asserted,
    Deasserted,
}

impl Level {
    /// Maps a raw line value (0 = low) to a level.
    pub fn from_raw(value: u8) -> Self {
        if value == 0 {
            Level::Asserted
        } else {
            Level::Deasserted
        }
    }

    pub fn is_asserted(self) -> bool {
        self == Level::Asserted
    }
}

#[async_trait]
pub trait AlertSource: Send {
    /// Waits for the next level report.
    ///
    /// An error means the source is gone for good; a source that ends without
    /// being closed reports [`BusError::AlertClosed`].
    async fn next_level(&mut self) -> Result<Level, BusError>;

    /// Returns the most recent level reported since the last call, if any,
    /// without waiting.
    fn try_level(&mut self) -> Result<Option<Level>, BusError>;

    /// Stops the source. Must interrupt a pending [`next_level`](Self::next_level).
    fn close(&mut self);
}

/// Creates an alert line driven from inside the process.
pub fn line() -> (AlertTrigger, AlertLine) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AlertTrigger { tx }, AlertLine { rx })
}

/// Driving end of an [`AlertLine`]. Dropping every trigger ends the stream.
#[derive(Debug, Clone)]
pub struct AlertTrigger {
    tx: mpsc::UnboundedSender<Level>,
}

impl AlertTrigger {
    /// Returns false once the line has been closed.
    pub fn set(&self, level: Level) -> bool {
        self.tx.send(level).is_ok()
    }

    pub fn assert(&self) -> bool {
        self.set(Level::Asserted)
    }

    pub fn deassert(&self) -> bool {
        self.set(Level::Deasserted)
    }
}

#[derive(Debug)]
pub struct AlertLine {
    rx: mpsc::UnboundedReceiver<Level>,
}

#[async_trait]
impl AlertSource for AlertLine {
    async fn next_level(&mut self) -> Result<Level, BusError> {
        self.rx.recv().await.ok_or(BusError::AlertClosed)
    }

    fn try_level(&mut self) -> Result<Option<Level>, BusError> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(level) => latest = Some(level),
                Err(TryRecvError::Empty) => return Ok(latest),
                Err(TryRecvError::Disconnected) => {
                    return match latest {
                        Some(level) => Ok(Some(level)),
                        None => Err(BusError::AlertClosed),
                    };
                }
            }
        }
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// An alert that never fires.
#[derive(Debug, Default)]
pub struct NoAlert;

#[async_trait]
impl AlertSource for NoAlert {
    async fn next_level(&mut self) -> Result<Level, BusError> {
        std::future::pending().await
    }

    fn try_level(&mut self) -> Result<Option<Level>, BusError> {
        Ok(None)
    }

    fn close(&mut self) {}
}

#[cfg(target_os = "linux")]
pub use gpio::{GpioAlert, MAX_GPIO_PIN};

#[cfg(target_os = "linux")]
mod gpio {
    use super::{AlertSource, Level};
    use crate::error::{BusError, ConfigError};
    use async_trait::async_trait;
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::PathBuf;
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::task::JoinHandle;
    use tracing::{debug, info};

    pub const MAX_GPIO_PIN: u32 = 999;

    const LEVEL_QUEUE: usize = 16;

    /// Alert line on a sysfs GPIO pin, watched for both edges.
    ///
    /// A background task waits for edge notifications and forwards every
    /// level it reads; closing the alert aborts that task.
    #[derive(Debug)]
    pub struct GpioAlert {
        levels: mpsc::Receiver<io::Result<Level>>,
        watcher: JoinHandle<()>,
    }

    impl GpioAlert {
        /// Configures `/sys/class/gpio/gpio<pin>` as an edge-triggered input
        /// and starts watching it. Needs a running tokio runtime.
        pub fn open(pin: u32) -> Result<Self, BusError> {
            if pin > MAX_GPIO_PIN {
                return Err(ConfigError::Invalid {
                    field: "GPIO pin number",
                    requirement: "between 0 and 999",
                }
                .into());
            }

            let base = PathBuf::from(format!("/sys/class/gpio/gpio{}", pin));
            std::fs::write(base.join("direction"), "in").map_err(BusError::Alert)?;
            std::fs::write(base.join("edge"), "both").map_err(BusError::Alert)?;

            let value = File::open(base.join("value")).map_err(BusError::Alert)?;
            let value = AsyncFd::with_interest(value, Interest::PRIORITY).map_err(BusError::Alert)?;

            let (tx, levels) = mpsc::channel(LEVEL_QUEUE);
            let watcher = tokio::spawn(watch(value, tx));

            info!(pin, "watching alert pin");
            Ok(Self { levels, watcher })
        }
    }

    async fn watch(value: AsyncFd<File>, tx: mpsc::Sender<io::Result<Level>>) {
        loop {
            let level = read_level(value.get_ref());
            let failed = level.is_err();
            if tx.send(level).await.is_err() || failed {
                return;
            }

            match value.ready(Interest::PRIORITY).await {
                Ok(mut guard) => guard.clear_ready(),
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    fn read_level(value: &File) -> io::Result<Level> {
        let mut buf = [0u8; 16];
        let n = value.read_at(&mut buf, 0)?;
        if buf[..n].starts_with(b"0") {
            Ok(Level::Asserted)
        } else {
            Ok(Level::Deasserted)
        }
    }

    #[async_trait]
    impl AlertSource for GpioAlert {
        async fn next_level(&mut self) -> Result<Level, BusError> {
            match self.levels.recv().await {
                Some(level) => level.map_err(BusError::Alert),
                None => Err(BusError::AlertClosed),
            }
        }

        fn try_level(&mut self) -> Result<Option<Level>, BusError> {
            let mut latest = None;
            loop {
                match self.levels.try_recv() {
                    Ok(level) => latest = Some(level.map_err(BusError::Alert)?),
                    Err(TryRecvError::Empty) => return Ok(latest),
                    Err(TryRecvError::Disconnected) => {
                        return latest.map(Some).ok_or(BusError::AlertClosed);
                    }
                }
            }
        }

        fn close(&mut self) {
            debug!("closing alert pin");
            self.watcher.abort();
            self.levels.close();
        }
    }

    impl Drop for GpioAlert {
        fn drop(&mut self) {
            self.watcher.abort();
        }
    }
}
