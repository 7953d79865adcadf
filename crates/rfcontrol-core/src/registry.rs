//! Device registry
//!
//! Builds the configured devices from a JSON device list, connects them and
//! drives their periodic `update`. All devices of a registry publish to the
//! same [`EventBus`].
//!
//! ```json
//! {
//!   "devices": [
//!     {
//!       "name": "generator",
//!       "kind": "cesar",
//!       "connector": "serial",
//!       "settings": { "portname": "/dev/ttyUSB0", "baudrate": 19200, "busaddress": 1 }
//!     },
//!     {
//!       "name": "switch",
//!       "kind": "hofi",
//!       "connector": "ethernet",
//!       "settings": { "address": "192.168.0.50", "port": 4001 }
//!     }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::JsonSettings;
use crate::connector::{connector_for, Connector, ConnectorKind};
use crate::device::{Device, DeviceId, DeviceKind};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};

/// One entry of the device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique name used to look the device up
    pub name: String,
    /// Device family to create
    pub kind: DeviceKind,
    /// Transport the device talks over
    pub connector: ConnectorKind,
    /// Connector and device settings
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceDefinition>,
}

struct Entry {
    definition: DeviceDefinition,
    device: Device,
}

/// The set of configured devices
pub struct DeviceRegistry {
    events: EventBus,
    entries: Vec<Entry>,
}

impl DeviceRegistry {
    /// Create an empty registry publishing to `events`
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            entries: Vec::new(),
        }
    }

    /// Build a registry from definitions. Names must be unique.
    pub fn from_definitions(definitions: Vec<DeviceDefinition>, events: EventBus) -> Result<Self> {
        let mut registry = Self::new(events);
        for definition in definitions {
            registry.add(definition)?;
        }
        Ok(registry)
    }

    /// Build a registry from a JSON device list
    pub fn from_json(content: &str, events: EventBus) -> anyhow::Result<Self> {
        let list: DeviceList =
            serde_json::from_str(content).context("Failed to parse device list")?;
        let registry = Self::from_definitions(list.devices, events)?;
        Ok(registry)
    }

    /// Load a JSON device list from disk
    pub fn load_file<P: AsRef<Path>>(path: P, events: EventBus) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        Self::from_json(&content, events)
            .with_context(|| format!("Invalid device list in {}", path.display()))
    }

    /// Create the device and connector described by `definition`
    pub fn add(&mut self, definition: DeviceDefinition) -> Result<DeviceId> {
        let connector = connector_for(definition.connector);
        self.add_with_connector(definition, connector)
    }

    /// Like [`DeviceRegistry::add`], with a caller supplied connector instead
    /// of the one named in the definition
    pub fn add_with_connector(
        &mut self,
        definition: DeviceDefinition,
        connector: Box<dyn Connector>,
    ) -> Result<DeviceId> {
        if self.get(&definition.name).is_some() {
            return Err(Error::InvalidSetting {
                key: "name".to_string(),
                message: format!("device '{}' is defined more than once", definition.name),
            });
        }

        let device = Device::new(definition.kind, self.events.clone());
        device.connectable().set_connector(connector);
        let id = device.id();
        tracing::debug!(
            "DeviceRegistry: added {:?} device '{}' with id {}",
            definition.kind,
            definition.name,
            id
        );
        self.entries.push(Entry { definition, device });
        Ok(id)
    }

    /// Initialize every device with its settings. Returns the number of
    /// devices that came up; failures are logged.
    pub fn init_all(&self) -> usize {
        let mut ready = 0;
        for entry in &self.entries {
            let settings = JsonSettings::new(entry.definition.settings.clone());
            match entry.device.connectable().init(&settings) {
                Ok(()) => ready += 1,
                Err(e) => tracing::error!(
                    "DeviceRegistry: unable to initialize '{}': {}",
                    entry.definition.name,
                    e
                ),
            }
        }
        ready
    }

    /// Tick `update` on every device
    pub fn update_all(&self) {
        for entry in &self.entries {
            entry.device.connectable().update();
        }
    }

    /// Disconnect every device
    pub fn disconnect_all(&self) {
        for entry in &self.entries {
            entry.device.connectable().disconnect();
        }
    }

    /// Device registered under `name`
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.entries
            .iter()
            .find(|e| e.definition.name == name)
            .map(|e| &e.device)
    }

    /// Device with the given id
    pub fn get_by_id(&self, id: DeviceId) -> Option<&Device> {
        self.entries
            .iter()
            .map(|e| &e.device)
            .find(|d| d.id() == id)
    }

    /// Definition the device `name` was created from
    pub fn definition(&self, name: &str) -> Option<&DeviceDefinition> {
        self.entries
            .iter()
            .map(|e| &e.definition)
            .find(|d| d.name == name)
    }

    /// Device names in definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.definition.name.as_str())
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bus shared by all devices
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to events of every device
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
