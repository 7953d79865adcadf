//! Devices
//!
//! A device owns one [`Connector`] and speaks one wire protocol over it. The
//! set of devices is closed ([`Device`]); what a device can do is expressed by
//! the capability traits it implements:
//!
//! - [`Connectable`]: lifecycle, connection control and the periodic `update`
//! - [`PowerControllable`]: RF output and power setpoint
//! - [`MatchNetworkControllable`]: matching network capacitors
//! - [`PortSwitchable`]: RF path switching

pub mod cesar;
pub mod hofi;
pub mod kjl;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::connector::{Connector, DataHandler};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};
use crate::queue::to_hex;
use crate::{lock, read_lock, write_lock};

pub use cesar::CesarGenerator;
pub use hofi::HofiSwitch;
pub use kjl::KjlGenerator;

/// Process-unique device identifier
pub type DeviceId = u64;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next device id. Ids start at 1 and never repeat.
pub fn next_device_id() -> DeviceId {
    NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Who is allowed to operate the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Controlled over the connector
    Remote,
    /// Controlled from the front panel
    Local,
    /// Both at once
    Mixed,
}

/// Matching network behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchNetworkMode {
    /// The generator tunes the capacitors itself
    Automatic,
    /// Capacitors only move on request
    Manual,
}

/// State and connector handling shared by every device
pub struct DeviceCore {
    id: DeviceId,
    name: &'static str,
    connector: RwLock<Option<Arc<dyn Connector>>>,
    control_mode: Mutex<Option<ControlMode>>,
    events: EventBus,
}

impl DeviceCore {
    /// Create a core with a fresh id and no connector
    pub fn new(name: &'static str, events: EventBus) -> Self {
        Self {
            id: next_device_id(),
            name,
            connector: RwLock::new(None),
            control_mode: Mutex::new(None),
            events,
        }
    }

    /// Process-unique id
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Name used as prefix in log messages
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bus the device publishes to
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Install a connector and route its incoming data to `handler`. An
    /// existing connector is disconnected and replaced.
    pub fn attach(&self, connector: Box<dyn Connector>, handler: DataHandler) {
        connector.set_data_handler(handler);
        let previous = write_lock(&self.connector).replace(Arc::from(connector));
        if let Some(previous) = previous {
            tracing::warn!("{}: overwriting connector {}", self.name, previous.info());
            previous.disconnect();
        }
    }

    /// Installed connector, if any
    pub fn connector(&self) -> Option<Arc<dyn Connector>> {
        read_lock(&self.connector).clone()
    }

    fn require_connector(&self, operation: &str) -> Result<Arc<dyn Connector>> {
        self.connector().ok_or_else(|| {
            tracing::error!(
                "{}: {} was called but no connector was set up",
                self.name,
                operation
            );
            Error::NoConnector
        })
    }

    /// Whether a connector is installed and connected
    pub fn is_connected(&self) -> bool {
        match self.require_connector("is_connected") {
            Ok(connector) => connector.is_connected(),
            Err(_) => false,
        }
    }

    /// Connect and publish the outcome as a connection event
    pub fn connect(&self) -> Result<()> {
        let connector = self.require_connector("connect")?;
        let result = connector.connect();
        self.events.publish(DeviceEvent::ConnectionStatusChanged {
            device: self.id,
            connected: result.is_ok(),
        });
        result
    }

    /// Disconnect, publishing an event if the device was connected
    pub fn disconnect(&self) {
        if let Ok(connector) = self.require_connector("disconnect") {
            let was_connected = connector.is_connected();
            connector.disconnect();
            if was_connected {
                self.events.publish(DeviceEvent::ConnectionStatusChanged {
                    device: self.id,
                    connected: false,
                });
            }
        }
    }

    /// Write raw bytes through the connector
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self.connector() {
            Some(connector) => {
                connector.write(data);
                Ok(())
            }
            None => {
                tracing::error!(
                    "{}: send was called but no connector was set up; data to be sent is {} (hex)",
                    self.name,
                    to_hex(data)
                );
                Err(Error::NoConnector)
            }
        }
    }

    /// Configure the connector from `settings` and connect. Failures are
    /// logged with the connector's description.
    pub fn init_connector(&self, settings: &dyn Settings) -> Result<()> {
        let connector = self.connector().ok_or_else(|| {
            tracing::warn!(
                "{}: init called but no connector was set up. Call set_connector with a valid connector first.",
                self.name
            );
            Error::NoConnector
        })?;

        connector.configure(settings);
        match self.connect() {
            Ok(()) => {
                tracing::debug!("{}: connected. Connector info:\n{}", self.name, connector.info());
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "{}: an error occurred while trying to connect: {}. Connector info:\n{}",
                    self.name,
                    e,
                    connector.info()
                );
                Err(e)
            }
        }
    }

    /// Last control mode accepted by the device
    pub fn control_mode(&self) -> Option<ControlMode> {
        *lock(&self.control_mode)
    }

    pub(crate) fn set_control_mode(&self, mode: ControlMode) {
        *lock(&self.control_mode) = Some(mode);
    }
}

impl fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected", &self.connector().map(|c| c.is_connected()))
            .finish()
    }
}

/// Lifecycle and connection control
pub trait Connectable {
    /// Shared connector and id handling
    fn core(&self) -> &DeviceCore;

    /// Install the connector, replacing (and disconnecting) any previous one
    fn set_connector(&self, connector: Box<dyn Connector>);

    /// Configure the connector, connect and run any protocol handshake
    fn init(&self, settings: &dyn Settings) -> Result<()>;

    /// Periodic tick; emits coalesced telemetry when available
    fn update(&self) {}

    /// Process-unique id
    fn id(&self) -> DeviceId {
        self.core().id()
    }

    /// Connect the installed connector
    fn connect(&self) -> Result<()> {
        self.core().connect()
    }

    /// Disconnect the installed connector
    fn disconnect(&self) {
        self.core().disconnect()
    }

    /// Whether the installed connector is connected
    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    /// Switch between remote, local or mixed control
    fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        tracing::debug!(
            "{}: ignoring unsupported control mode {:?}",
            self.core().name(),
            mode
        );
        Err(Error::UnsupportedMode(format!("{:?}", mode)))
    }

    /// Last control mode accepted by the device
    fn control_mode(&self) -> Option<ControlMode> {
        self.core().control_mode()
    }
}

/// RF output and power control
pub trait PowerControllable {
    /// Switch RF output on
    fn output_on(&self) -> Result<()>;
    /// Switch RF output off
    fn output_off(&self) -> Result<()>;
    /// Set the target power in watts
    fn set_target_power(&self, power: i32) -> Result<()>;
    /// Request the forward power; the reply lands in the parameters
    fn query_forward_power(&self) -> Result<()>;
    /// Request the reflected power; the reply lands in the parameters
    fn query_reflected_power(&self) -> Result<()>;
}

/// Matching network control
pub trait MatchNetworkControllable {
    /// Move the load capacitor
    fn set_load_capacitor_position(&self, position: i32) -> Result<()>;
    /// Move the tune capacitor
    fn set_tune_capacitor_position(&self, position: i32) -> Result<()>;

    /// Choose automatic or manual matching
    fn set_matchnetwork_mode(&self, mode: MatchNetworkMode) -> Result<()> {
        tracing::debug!("ignoring unsupported match network mode {:?}", mode);
        Err(Error::UnsupportedMode(format!("{:?}", mode)))
    }

    /// Request both capacitor positions
    fn query_capacitor_positions(&self) -> Result<()>;
    /// Request the external feedback value
    fn query_external_feedback(&self) -> Result<()>;
}

/// RF path switching
pub trait PortSwitchable {
    /// Select the output port
    fn set_port(&self, port: u8) -> Result<()>;
    /// Last port reported by the switch
    fn port(&self) -> Option<u8>;
}

/// Supported device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Cesar RF generator, binary AE-bus protocol
    Cesar,
    /// KJL RF generator, text echo protocol
    Kjl,
    /// Hofi RF switch
    Hofi,
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cesar" => Ok(DeviceKind::Cesar),
            "kjl" => Ok(DeviceKind::Kjl),
            "hofi" => Ok(DeviceKind::Hofi),
            other => Err(Error::UnknownDevice(other.to_string())),
        }
    }
}

/// Every concrete device
#[derive(Debug)]
pub enum Device {
    /// Cesar generator
    Cesar(CesarGenerator),
    /// KJL generator
    Kjl(KjlGenerator),
    /// Hofi switch
    Hofi(HofiSwitch),
}

impl Device {
    /// Create a device without connector
    pub fn new(kind: DeviceKind, events: EventBus) -> Self {
        match kind {
            DeviceKind::Cesar => Device::Cesar(CesarGenerator::new(events)),
            DeviceKind::Kjl => Device::Kjl(KjlGenerator::new(events)),
            DeviceKind::Hofi => Device::Hofi(HofiSwitch::new(events)),
        }
    }

    /// Family of this device
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cesar(_) => DeviceKind::Cesar,
            Device::Kjl(_) => DeviceKind::Kjl,
            Device::Hofi(_) => DeviceKind::Hofi,
        }
    }

    /// Lifecycle and connection control
    pub fn connectable(&self) -> &dyn Connectable {
        match self {
            Device::Cesar(d) => d,
            Device::Kjl(d) => d,
            Device::Hofi(d) => d,
        }
    }

    /// Power control, for generators
    pub fn power(&self) -> Option<&dyn PowerControllable> {
        match self {
            Device::Cesar(d) => Some(d),
            Device::Kjl(d) => Some(d),
            Device::Hofi(_) => None,
        }
    }

    /// Matching network control, for generators
    pub fn match_network(&self) -> Option<&dyn MatchNetworkControllable> {
        match self {
            Device::Cesar(d) => Some(d),
            Device::Kjl(d) => Some(d),
            Device::Hofi(_) => None,
        }
    }

    /// Port switching, for switches
    pub fn switch(&self) -> Option<&dyn PortSwitchable> {
        match self {
            Device::Hofi(d) => Some(d),
            _ => None,
        }
    }

    /// Process-unique id
    pub fn id(&self) -> DeviceId {
        self.connectable().id()
    }
}
