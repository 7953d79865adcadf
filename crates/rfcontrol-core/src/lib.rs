//! # RF Control Core Library
//!
//! Device communication for laboratory RF generators and RF switches.
//!
//! This library provides:
//! - Serial and TCP byte-stream connectors
//! - An acknowledged command queue with bounded retries
//! - The Cesar binary protocol (AE bus framing with XOR checksum)
//! - The KJL text echo protocol
//! - The Hofi RF switch protocol
//! - Coalesced generator telemetry published on an event bus
//!
//! ## Supported devices
//!
//! - Cesar RF generators
//! - KJL RF generators
//! - Hofi RF switches
//!
//! ## Example
//!
//! ```rust,ignore
//! use rfcontrol_core::prelude::*;
//!
//! let registry = DeviceRegistry::load_file("devices.json", EventBus::default())?;
//! let mut events = registry.subscribe();
//! registry.init_all();
//!
//! if let Some(power) = registry.get("generator").and_then(|d| d.power()) {
//!     power.set_target_power(300)?;
//!     power.output_on()?;
//! }
//!
//! loop {
//!     registry.update_all();
//!     while let Ok(event) = events.try_recv() {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod buffer;
pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod events;
pub mod parameters;
pub mod queue;
pub mod registry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{JsonSettings, Settings};
    pub use crate::connector::{make_connector, Connector, ConnectorKind, MemoryConnector};
    pub use crate::device::{
        CesarGenerator, Connectable, ControlMode, Device, DeviceId, DeviceKind, HofiSwitch,
        KjlGenerator, MatchNetworkControllable, MatchNetworkMode, PortSwitchable,
        PowerControllable,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::events::{DeviceEvent, EventBus};
    pub use crate::parameters::{GeneratorReading, Parameter, ParameterSet};
    pub use crate::registry::{DeviceDefinition, DeviceRegistry};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-lock an `RwLock`, recovering from poisoning
pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock an `RwLock`, recovering from poisoning
pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
