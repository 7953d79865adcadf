//! Cesar RF generator
//!
//! Every command is a checksummed frame that the generator acknowledges with
//! `ACK` or `NACK`, so commands go through a [`CommandQueue`] and only one is
//! in flight at a time. Query replies arrive as frames of their own; they are
//! acknowledged and written into the parameter set.

pub mod codec;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::ReceiveBuffer;
use crate::config::Settings;
use crate::connector::Connector;
use crate::device::{
    Connectable, ControlMode, DeviceCore, MatchNetworkControllable, MatchNetworkMode,
    PowerControllable,
};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};
use crate::lock;
use crate::parameters::{Parameter, ParameterAggregator, ParameterSet};
use crate::queue::{to_hex, CommandFrame, CommandQueue};

use codec::{CesarCommand, Decoded, Packet, ACK, MAX_ADDRESS, NACK};

/// Capacitor positions accepted by the generator
pub const CAPACITOR_RANGE: (i32, i32) = (40, 960);

const NAME: &str = "CesarGenerator";

struct Inner {
    core: DeviceCore,
    address: AtomicU8,
    queue: Mutex<CommandQueue>,
    buffer: Mutex<ReceiveBuffer>,
    parameters: ParameterAggregator,
}

/// Cesar generator speaking the AE bus protocol
pub struct CesarGenerator {
    inner: Arc<Inner>,
}

impl CesarGenerator {
    /// Create a generator at bus address 0 without connector
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DeviceCore::new(NAME, events),
                address: AtomicU8::new(0),
                queue: Mutex::new(CommandQueue::new()),
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

    /// Bus address used in outgoing frames
    pub fn address(&self) -> u8 {
        self.inner.address.load(Ordering::Relaxed)
    }

    /// Request the power setpoint and regulation mode
    pub fn query_setpoint(&self) -> Result<()> {
        self.inner
            .queue_command(CesarCommand::ReportSetPointAndRegulationMode, &[])
    }

    /// Request the fault status register. The reply is only logged.
    pub fn query_fault_status(&self) -> Result<()> {
        self.inner
            .queue_command(CesarCommand::ReportFaultStatusRegister, &[])
    }

    /// Queue every query needed to complete one reading
    pub fn query_all(&self) -> Result<()> {
        self.query_setpoint()?;
        self.query_forward_power()?;
        self.query_reflected_power()?;
        self.query_external_feedback()?;
        self.query_capacitor_positions()
    }

    /// Fields received since the last completed reading
    pub fn parameters(&self) -> ParameterSet {
        self.inner.parameters.snapshot()
    }

    /// Commands waiting in the queue, including the one in flight
    pub fn pending_commands(&self) -> usize {
        lock(&self.inner.queue).len()
    }
}

impl Inner {
    fn queue_command(&self, command: CesarCommand, data: &[u8]) -> Result<()> {
        if self.core.connector().is_none() {
            tracing::warn!(
                "{}: queue_command was called but no connector was set up, command was {:?} '{}'",
                NAME,
                command,
                to_hex(data)
            );
            return Err(Error::NoConnector);
        }

        let address = self.address.load(Ordering::Relaxed);
        let frame = codec::encode_frame(address, command.code(), data)?;
        tracing::debug!("{}: queueing {:?} as {}", NAME, command, frame.to_hex());

        let to_send = lock(&self.queue).enqueue(frame);
        self.transmit(to_send);
        Ok(())
    }

    fn transmit(&self, frame: Option<CommandFrame>) {
        if let Some(frame) = frame {
            let _ = self.core.send(frame.as_bytes());
        }
    }

    fn handle_data_received(&self, data: &[u8]) {
        let decoded = {
            let mut buffer = lock(&self.buffer);
            buffer.extend(data);
            codec::decode(&mut buffer)
        };

        for item in decoded {
            match item {
                Decoded::Ack => {
                    let next = lock(&self.queue).on_ack();
                    self.transmit(next);
                }
                Decoded::Nack => {
                    tracing::debug!("{}: received NACK", NAME);
                    let next = lock(&self.queue).on_nack();
                    self.transmit(next);
                }
                Decoded::Packet(packet) => {
                    let _ = self.core.send(&[ACK]);
                    self.handle_reply(&packet);
                }
                Decoded::Corrupt(frame) => {
                    let err = Error::ChecksumMismatch {
                        frame: to_hex(&frame),
                    };
                    tracing::warn!("{}: {}", NAME, err);
                    let _ = self.core.send(&[NACK]);
                }
            }
        }
    }

    fn record_u16(&self, packet: &Packet, parameter: Parameter, command: CesarCommand) {
        match packet.u16_at(0) {
            Some(value) => {
                self.parameters.record(parameter, i32::from(value));
                tracing::debug!("{}: {:?} returned {}", NAME, command, value);
            }
            None => tracing::warn!(
                "{}: not enough data in the reply to {:?}, got '{}'",
                NAME,
                command,
                to_hex(&packet.data)
            ),
        }
    }

    fn handle_reply(&self, packet: &Packet) {
        let Some(command) = packet.command() else {
            tracing::warn!(
                "{}: ignoring reply with unknown command {} and data '{}'",
                NAME,
                packet.command,
                to_hex(&packet.data)
            );
            return;
        };

        match command {
            CesarCommand::ReportSetPointAndRegulationMode => {
                self.record_u16(packet, Parameter::Setpoint, command)
            }
            CesarCommand::ReportForwardPower => {
                self.record_u16(packet, Parameter::ForwardPower, command)
            }
            CesarCommand::ReportReflectedPower => {
                self.record_u16(packet, Parameter::ReflectedPower, command)
            }
            CesarCommand::ReportExternalFeedback => {
                self.record_u16(packet, Parameter::ExternalFeedback, command)
            }
            CesarCommand::ReportCapacitorPositions => {
                match (packet.u16_at(0), packet.u16_at(2)) {
                    (Some(load), Some(tune)) => {
                        // Positions are reported in tenths
                        let load = i32::from(load) / 10;
                        let tune = i32::from(tune) / 10;
                        self.parameters.record_all(&[
                            (Parameter::LoadCapPosition, load),
                            (Parameter::TuneCapPosition, tune),
                        ]);
                        tracing::debug!(
                            "{}: capacitor positions load {} tune {}",
                            NAME,
                            load,
                            tune
                        );
                    }
                    _ => tracing::warn!(
                        "{}: not enough data in the reply to ReportCapacitorPositions, got '{}'",
                        NAME,
                        to_hex(&packet.data)
                    ),
                }
            }
            CesarCommand::ReportFaultStatusRegister => match packet.u16_at(0) {
                Some(status) => {
                    tracing::warn!("{}: fault status register {:#06x}", NAME, status)
                }
                None => tracing::warn!(
                    "{}: not enough data in the reply to ReportFaultStatusRegister, got '{}'",
                    NAME,
                    to_hex(&packet.data)
                ),
            },
            CesarCommand::ErrorMatchingNetworkNotConnected => {
                tracing::error!("{}: matching network is not connected", NAME)
            }
            other => tracing::debug!(
                "{}: unhandled reply to {:?} with data '{}'",
                NAME,
                other,
                to_hex(&packet.data)
            ),
        }
    }
}

fn check_range(what: &'static str, value: i32, min: i32, max: i32) -> Result<()> {
    if (min..=max).contains(&value) {
        return Ok(());
    }
    let err = Error::OutOfRange {
        what,
        value: i64::from(value),
        min: i64::from(min),
        max: i64::from(max),
    };
    tracing::warn!("{}: {}", NAME, err);
    Err(err)
}

impl Connectable for CesarGenerator {
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
        if let Some(address) = settings.get::<u8>("busaddress") {
            if address <= MAX_ADDRESS {
                self.inner.address.store(address, Ordering::Relaxed);
            } else {
                tracing::warn!(
                    "{}: bus address {} is outside [0, {}], keeping {}",
                    NAME,
                    address,
                    MAX_ADDRESS,
                    self.address()
                );
            }
        }
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

    fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        let mode_id = match mode {
            ControlMode::Remote => 2,
            ControlMode::Local => 6,
            ControlMode::Mixed => {
                tracing::debug!("{}: ignoring unsupported control mode {:?}", NAME, mode);
                return Err(Error::UnsupportedMode(format!("{:?}", mode)));
            }
        };
        self.inner
            .queue_command(CesarCommand::SelectActiveControlMode, &[mode_id])?;
        self.inner.core.set_control_mode(mode);
        Ok(())
    }
}

impl PowerControllable for CesarGenerator {
    fn output_on(&self) -> Result<()> {
        self.inner.queue_command(CesarCommand::OutputOn, &[])
    }

    fn output_off(&self) -> Result<()> {
        self.inner.queue_command(CesarCommand::OutputOff, &[])
    }

    fn set_target_power(&self, power: i32) -> Result<()> {
        check_range("target power", power, 0, i32::from(u16::MAX))?;
        self.inner.queue_command(
            CesarCommand::SetPowerSetPoint,
            &codec::u16_bytes(power as u16),
        )
    }

    fn query_forward_power(&self) -> Result<()> {
        self.inner.queue_command(CesarCommand::ReportForwardPower, &[])
    }

    fn query_reflected_power(&self) -> Result<()> {
        self.inner.queue_command(CesarCommand::ReportReflectedPower, &[])
    }
}

impl MatchNetworkControllable for CesarGenerator {
    fn set_load_capacitor_position(&self, position: i32) -> Result<()> {
        let (min, max) = CAPACITOR_RANGE;
        check_range("load capacitor position", position, min, max)?;
        self.inner.queue_command(
            CesarCommand::MoveLoadCapPosition,
            &codec::u16_bytes(position as u16),
        )
    }

    fn set_tune_capacitor_position(&self, position: i32) -> Result<()> {
        let (min, max) = CAPACITOR_RANGE;
        check_range("tune capacitor position", position, min, max)?;
        self.inner.queue_command(
            CesarCommand::MoveTuneCapPosition,
            &codec::u16_bytes(position as u16),
        )
    }

    fn set_matchnetwork_mode(&self, mode: MatchNetworkMode) -> Result<()> {
        let mode_id = match mode {
            MatchNetworkMode::Manual => 0,
            MatchNetworkMode::Automatic => 1,
        };
        self.inner
            .queue_command(CesarCommand::SetMatchNetworkControl, &[mode_id])
    }

    fn query_capacitor_positions(&self) -> Result<()> {
        self.inner
            .queue_command(CesarCommand::ReportCapacitorPositions, &[])
    }

    fn query_external_feedback(&self) -> Result<()> {
        self.inner
            .queue_command(CesarCommand::ReportExternalFeedback, &[])
    }
}

impl fmt::Debug for CesarGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CesarGenerator")
            .field("core", &self.inner.core)
            .field("address", &self.address())
            .field("pending", &self.pending_commands())
            .field("buffered", &to_hex(lock(&self.inner.buffer).as_slice()))
            .finish()
    }
}
