//! In-process connector
//!
//! [`MemoryConnector`] stands in for real hardware: writes are recorded and
//! incoming bytes are injected with [`MemoryConnector::feed`]. Clones share the
//! same state, so a caller can hand one clone to a device and keep another to
//! play the instrument's side of the conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{ConnectionState, Connector, ConnectorKind, DataHandler, HandlerSlot};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lock;

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    written: Mutex<Vec<Vec<u8>>>,
    handlers: HandlerSlot,
}

/// Connector backed by memory instead of a device
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Create a disconnected connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail, as if the device were unreachable
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connect.store(refuse, Ordering::Release);
    }

    /// Deliver bytes to the data handler as one read
    pub fn feed(&self, data: &[u8]) {
        self.shared.handlers.deliver(data);
    }

    /// Every write so far, one entry per call
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.written).clone()
    }

    /// Return and forget the recorded writes
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.shared.written))
    }
}

impl Connector for MemoryConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Memory
    }

    fn configure(&self, _settings: &dyn Settings) {}

    fn connect(&self) -> Result<()> {
        if self.shared.refuse_connect.load(Ordering::Acquire) {
            return Err(Error::ConnectionFailed("connection refused".to_string()));
        }
        self.shared.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        if self.shared.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn write(&self, data: &[u8]) {
        if data.is_empty() || !self.is_connected() {
            return;
        }
        lock(&self.shared.written).push(data.to_vec());
    }

    fn set_data_handler(&self, handler: DataHandler) {
        self.shared.handlers.set(handler);
    }

    fn info(&self) -> String {
        format!(
            "MemoryConnector:\n\twrites: {}\n\tstate: {:?}",
            lock(&self.shared.written).len(),
            self.state()
        )
    }
}
