//! Hofi RF switch
//!
//! The switch understands two commands, `HOFIPORT<n>` to select an output and
//! `HOFISTATU` to report the current one. There is no documented reply format;
//! the last byte of a reply of at least four bytes carries the port.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::ReceiveBuffer;
use crate::config::Settings;
use crate::connector::Connector;
use crate::device::{Connectable, DeviceCore, PortSwitchable};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};
use crate::lock;
use crate::queue::to_hex;

const NAME: &str = "HofiSwitch";

/// Query for the active port
pub const STATUS_COMMAND: &[u8] = b"HOFISTATU";

/// Lowest and highest selectable port
pub const PORT_RANGE: (u8, u8) = (1, 5);

/// Status value reported besides the regular ports
pub const PORT_NONE: u8 = 0x0A;

const MIN_REPLY_LEN: usize = 4;

const UNKNOWN_PORT: u8 = 0;

struct Inner {
    core: DeviceCore,
    buffer: Mutex<ReceiveBuffer>,
    port: AtomicU8,
}

/// Hofi RF switch
pub struct HofiSwitch {
    inner: Arc<Inner>,
}

impl HofiSwitch {
    /// Create a switch without connector
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DeviceCore::new(NAME, events),
                buffer: Mutex::new(ReceiveBuffer::new()),
                port: AtomicU8::new(UNKNOWN_PORT),
            }),
        }
    }

    /// Create a switch and install `connector`
    pub fn with_connector(connector: Box<dyn Connector>, events: EventBus) -> Self {
        let switch = Self::new(events);
        switch.set_connector(connector);
        switch
    }

    /// Ask the switch for its active port
    pub fn query_status(&self) -> Result<()> {
        self.inner.core.send(STATUS_COMMAND)
    }
}

/// Interpret a reply byte as a port
fn decode_port(byte: u8) -> Option<u8> {
    let (min, max) = PORT_RANGE;
    if (min..=max).contains(&byte) || byte == PORT_NONE {
        Some(byte)
    } else {
        None
    }
}

impl Inner {
    fn handle_data_received(&self, data: &[u8]) {
        tracing::debug!("{}: received '{}'", NAME, to_hex(data));

        let raw = {
            let mut buffer = lock(&self.buffer);
            buffer.extend(data);
            if buffer.len() < MIN_REPLY_LEN {
                return;
            }
            // Only the last byte matters, earlier messages are discarded
            let len = buffer.len();
            buffer.split_to(len)
        };

        let Some(&byte) = raw.last() else {
            return;
        };
        match decode_port(byte) {
            Some(port) => {
                self.port.store(port, Ordering::Release);
                self.core.events().publish(DeviceEvent::PortChanged {
                    device: self.core.id(),
                    port,
                });
            }
            None => tracing::warn!(
                "{}: unrecognized reply from switch, got '{}'",
                NAME,
                String::from_utf8_lossy(&raw)
            ),
        }
    }
}

impl Connectable for HofiSwitch {
    fn core(&self) -> &DeviceCore {
        &self.inner.core
    }

    fn set_connector(&self, connector: Box<dyn Connector>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.core.attach(
            connector,
            Arc::new(move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_data_received(data);
                }
            }),
        );
    }

    fn init(&self, settings: &dyn Settings) -> Result<()> {
        self.inner.core.init_connector(settings)?;
        self.query_status()
    }
}

impl PortSwitchable for HofiSwitch {
    fn set_port(&self, port: u8) -> Result<()> {
        let (min, max) = PORT_RANGE;
        if !(min..=max).contains(&port) {
            let err = Error::OutOfRange {
                what: "port",
                value: i64::from(port),
                min: i64::from(min),
                max: i64::from(max),
            };
            tracing::error!("{}: {}", NAME, err);
            return Err(err);
        }

        self.inner.core.send(format!("HOFIPORT{}", port).as_bytes())?;
        self.query_status()
    }

    fn port(&self) -> Option<u8> {
        match self.inner.port.load(Ordering::Acquire) {
            UNKNOWN_PORT => None,
            port => Some(port),
        }
    }
}

impl fmt::Debug for HofiSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HofiSwitch")
            .field("core", &self.inner.core)
            .field("port", &self.port())
            .field("buffered", &to_hex(lock(&self.inner.buffer).as_slice()))
            .finish()
    }
}
