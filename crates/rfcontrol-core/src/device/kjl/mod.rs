//! KJL RF generator
//!
//! Commands are written as soon as they are issued; the generator echoes each
//! one, so replies are matched by their echoed command rather than by order.

pub mod codec;

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::ReceiveBuffer;
use crate::config::Settings;
use crate::connector::Connector;
use crate::device::{Connectable, DeviceCore, MatchNetworkControllable, PowerControllable};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};
use crate::lock;
use crate::parameters::{Parameter, ParameterAggregator, ParameterSet};
use crate::queue::to_hex;

use codec::{KjlCommand, Reply, CAPACITOR_RANGE};

const NAME: &str = "KJLGenerator";

struct Inner {
    core: DeviceCore,
    buffer: Mutex<ReceiveBuffer>,
    parameters: ParameterAggregator,
}

/// KJL generator speaking the text echo protocol
pub struct KjlGenerator {
    inner: Arc<Inner>,
}

impl KjlGenerator {
    /// Create a generator without connector
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DeviceCore::new(NAME, events),
                buffer: Mutex::new(ReceiveBuffer::new()),
                parameters: ParameterAggregator::new(),
            }),
        }
    }

    /// Create a generator and install `connector`
    pub fn with_connector(connector: Box<dyn Connector>, events: EventBus) -> Self {
        let generator = Self::new(events);
        generator.set_connector(connector);
        generator
    }

    /// Request setpoint, forward and reflected power in one reply
    pub fn query_status(&self) -> Result<()> {
        self.inner.send(KjlCommand::QueryStatus)
    }

    /// Queue every query needed to complete one reading
    pub fn query_all(&self) -> Result<()> {
        self.query_status()?;
        self.query_external_feedback()?;
        self.query_capacitor_positions()
    }

    /// Fields received since the last completed reading
    pub fn parameters(&self) -> ParameterSet {
        self.inner.parameters.snapshot()
    }
}

impl Inner {
    fn send(&self, command: KjlCommand) -> Result<()> {
        tracing::debug!("{}: sending '{}'", NAME, command);
        self.core.send(&command.encode())
    }

    fn handle_data_received(&self, data: &[u8]) {
        // Replies are handled after the buffer lock is released
        let replies = {
            let mut buffer = lock(&self.buffer);
            buffer.extend(data);
            codec::split_replies(&mut buffer)
        };

        for raw in replies {
            self.handle_reply(&raw);
        }
    }

    fn handle_reply(&self, raw: &[u8]) {
        let reply = match codec::parse_reply(raw) {
            Ok(reply) => reply,
            Err(Error::CommandRejected(command)) => {
                tracing::warn!("{}: command '{}' was rejected by the generator", NAME, command);
                return;
            }
            Err(e) => {
                tracing::warn!("{}: {}", NAME, e);
                return;
            }
        };

        match reply {
            Reply::Accepted(command) => {
                tracing::trace!("{}: command '{}' accepted", NAME, command)
            }
            Reply::ExternalFeedback(value) => {
                self.parameters.record(Parameter::ExternalFeedback, value);
                tracing::debug!("{}: external feedback returned {}", NAME, value);
            }
            Reply::LoadCapacitor(value) => {
                self.parameters.record(Parameter::LoadCapPosition, value);
                tracing::debug!("{}: load capacitor position returned {}", NAME, value);
            }
            Reply::TuneCapacitor(value) => {
                self.parameters.record(Parameter::TuneCapPosition, value);
                tracing::debug!("{}: tune capacitor position returned {}", NAME, value);
            }
            Reply::ForwardPower(value) => {
                self.parameters.record(Parameter::ForwardPower, value);
                tracing::debug!("{}: forward power returned {}", NAME, value);
            }
            Reply::ReflectedPower(value) => {
                self.parameters.record(Parameter::ReflectedPower, value);
                tracing::debug!("{}: reflected power returned {}", NAME, value);
            }
            Reply::Status {
                setpoint,
                forward_power,
                reflected_power,
            } => {
                self.parameters.record_all(&[
                    (Parameter::Setpoint, setpoint),
                    (Parameter::ForwardPower, forward_power),
                    (Parameter::ReflectedPower, reflected_power),
                ]);
                tracing::debug!(
                    "{}: status returned {} (setpoint), {} (forward power), {} (reflected power)",
                    NAME,
                    setpoint,
                    forward_power,
                    reflected_power
                );
            }
        }
    }
}

fn check_capacitor(what: &'static str, position: i32) -> Result<u8> {
    let (min, max) = CAPACITOR_RANGE;
    if (min..=max).contains(&position) {
        return Ok(position as u8);
    }
    let err = Error::OutOfRange {
        what,
        value: i64::from(position),
        min: i64::from(min),
        max: i64::from(max),
    };
    tracing::warn!("{}: {}", NAME, err);
    Err(err)
}

impl Connectable for KjlGenerator {
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
        self.inner.core.init_connector(settings)
    }

    fn update(&self) {
        if let Some(reading) = self.inner.parameters.take_complete() {
            self.inner.core.events().publish(DeviceEvent::ParametersReady {
                device: self.inner.core.id(),
                reading,
            });
        }
    }
}

impl PowerControllable for KjlGenerator {
    fn output_on(&self) -> Result<()> {
        self.inner.send(KjlCommand::OutputOn)
    }

    fn output_off(&self) -> Result<()> {
        self.inner.send(KjlCommand::OutputOff)
    }

    fn set_target_power(&self, power: i32) -> Result<()> {
        let watts = u32::try_from(power).map_err(|_| {
            let err = Error::OutOfRange {
                what: "target power",
                value: i64::from(power),
                min: 0,
                max: i64::from(i32::MAX),
            };
            tracing::warn!("{}: {}", NAME, err);
            err
        })?;
        self.inner.send(KjlCommand::SetPower(watts))
    }

    fn query_forward_power(&self) -> Result<()> {
        self.inner.send(KjlCommand::QueryForwardPower)
    }

    fn query_reflected_power(&self) -> Result<()> {
        self.inner.send(KjlCommand::QueryReflectedPower)
    }
}

impl MatchNetworkControllable for KjlGenerator {
    fn set_load_capacitor_position(&self, position: i32) -> Result<()> {
        let position = check_capacitor("load capacitor position", position)?;
        self.inner.send(KjlCommand::SetLoadCapacitor(position))
    }

    fn set_tune_capacitor_position(&self, position: i32) -> Result<()> {
        let position = check_capacitor("tune capacitor position", position)?;
        self.inner.send(KjlCommand::SetTuneCapacitor(position))
    }

    fn query_capacitor_positions(&self) -> Result<()> {
        self.inner.send(KjlCommand::QueryLoadCapacitor)?;
        self.inner.send(KjlCommand::QueryTuneCapacitor)
    }

    fn query_external_feedback(&self) -> Result<()> {
        self.inner.send(KjlCommand::QueryExternalFeedback)
    }
}

impl fmt::Debug for KjlGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KjlGenerator")
            .field("core", &self.inner.core)
            .field("buffered", &to_hex(lock(&self.inner.buffer).as_slice()))
            .finish()
    }
}
