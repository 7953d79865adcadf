//! Byte-stream transports
//!
//! A [`Connector`] moves raw bytes between a device and the hardware, over a
//! serial port or a TCP socket. It knows nothing about framing: every chunk
//! read from the underlying stream is handed unmodified to the registered
//! [`DataHandler`], on the connector's own reader thread.
//!
//! Connectors never fail loudly. Writes to a disconnected connector are
//! dropped, invalid settings are logged and ignored, and only `connect`
//! reports failure to the caller.

mod ethernet;
mod memory;
mod reader;
mod serial;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Error, Result};

pub use ethernet::{EthernetConnector, EthernetOptions};
pub use memory::MemoryConnector;
pub use serial::{
    list_ports, DataBits, FlowControl, Parity, PortInfo, SerialConnector, SerialOptions, StopBits,
};

/// Callback receiving the bytes of one read
pub type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// Local serial port
    Serial,
    /// TCP socket
    Ethernet,
    /// In-process connector, see [`MemoryConnector`]
    Memory,
}

impl ConnectorKind {
    /// Name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Serial => "serial",
            ConnectorKind::Ethernet => "ethernet",
            ConnectorKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(ConnectorKind::Serial),
            "ethernet" | "tcp" => Ok(ConnectorKind::Ethernet),
            "memory" => Ok(ConnectorKind::Memory),
            other => Err(Error::UnknownConnector(other.to_string())),
        }
    }
}

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Closed, writes are dropped
    Disconnected,
    /// Open and reading
    Connected,
}

/// Duplex byte-stream transport owned by one device
pub trait Connector: Send + Sync {
    /// Transport variant
    fn kind(&self) -> ConnectorKind;

    /// Apply recognized settings. Invalid values are logged and leave the
    /// previous value in place.
    fn configure(&self, settings: &dyn Settings);

    /// Open the transport. Connecting an open connector succeeds immediately.
    fn connect(&self) -> Result<()>;

    /// Close the transport. Safe to call repeatedly.
    fn disconnect(&self);

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Shorthand for `state() == Connected`
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Send bytes. Empty writes and writes while disconnected are dropped.
    fn write(&self, data: &[u8]);

    /// Register the callback receiving incoming bytes, replacing any previous one
    fn set_data_handler(&self, handler: DataHandler);

    /// Human readable description of the settings and state
    fn info(&self) -> String;
}

/// Create an unconfigured connector for a kind name such as `"serial"` or
/// `"ethernet"`. Unknown names are logged and yield `None`.
pub fn make_connector(kind: &str) -> Option<Box<dyn Connector>> {
    match kind.parse::<ConnectorKind>() {
        Ok(kind) => Some(connector_for(kind)),
        Err(e) => {
            tracing::warn!("make_connector: {}", e);
            None
        }
    }
}

/// Create an unconfigured connector of the given kind
pub fn connector_for(kind: ConnectorKind) -> Box<dyn Connector> {
    match kind {
        ConnectorKind::Serial => Box::new(SerialConnector::new()),
        ConnectorKind::Ethernet => Box::new(EthernetConnector::new()),
        ConnectorKind::Memory => Box::new(MemoryConnector::new()),
    }
}

/// Read and validate one setting. A present but unusable value is logged,
/// clears `clean` and yields `None` so the caller keeps its previous value.
pub(crate) fn read_setting<T>(
    owner: &str,
    settings: &dyn Settings,
    key: &str,
    valid: impl Fn(&T) -> bool,
    clean: &mut bool,
) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = settings.raw(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(_) => {
            tracing::warn!("{}: rejected value '{}' for '{}'", owner, raw, key);
            *clean = false;
            None
        }
        Err(e) => {
            tracing::warn!("{}: invalid value '{}' for '{}': {}", owner, raw, key, e);
            *clean = false;
            None
        }
    }
}

/// Shared slot for a connector's data handler, read by the reader thread
#[derive(Clone, Default)]
pub(crate) struct HandlerSlot(Arc<std::sync::RwLock<Option<DataHandler>>>);

impl HandlerSlot {
    pub(crate) fn set(&self, handler: DataHandler) {
        match self.0.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    /// Hand `data` to the current handler, if one is registered. The handler is
    /// called without holding the slot lock.
    pub(crate) fn deliver(&self, data: &[u8]) {
        let handler = match self.0.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match handler {
            Some(handler) => handler(data),
            None => tracing::debug!(
                "Connector: dropping {} bytes, no data handler set",
                data.len()
            ),
        }
    }
}
