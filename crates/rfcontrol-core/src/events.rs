//! Device events
//!
//! Devices publish state changes through an [`EventBus`], a
//! [`tokio::sync::broadcast`] channel. Publishing never blocks and works from
//! plain OS threads, so events leave the device on whatever thread produced
//! them (usually a connector's reader thread). Consumers may receive them from
//! async code or by polling with `try_recv`/`blocking_recv`.

use tokio::sync::broadcast;

use crate::device::DeviceId;
use crate::parameters::GeneratorReading;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event emitted by a device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A generator collected a complete set of parameters
    ParametersReady {
        /// Device that produced the reading
        device: DeviceId,
        /// The completed reading
        reading: GeneratorReading,
    },

    /// A device connected or disconnected
    ConnectionStatusChanged {
        /// Device whose connection changed
        device: DeviceId,
        /// `true` if the device is now connected
        connected: bool,
    },

    /// An RF switch reported its active port
    PortChanged {
        /// Switch that reported the port
        device: DeviceId,
        /// Active port as reported by the switch
        port: u8,
    },
}

impl DeviceEvent {
    /// Device this event belongs to
    pub fn device(&self) -> DeviceId {
        match self {
            DeviceEvent::ParametersReady { device, .. }
            | DeviceEvent::ConnectionStatusChanged { device, .. }
            | DeviceEvent::PortChanged { device, .. } => *device,
        }
    }
}

/// Cloneable sending side shared by all devices of one context
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: DeviceEvent) {
        tracing::debug!("EventBus: publishing {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
