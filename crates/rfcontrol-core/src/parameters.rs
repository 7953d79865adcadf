//! Generator telemetry aggregation
//!
//! Reply handlers record telemetry fields one at a time, in whatever order the
//! generator answers. [`ParameterAggregator::take_complete`] turns a fully
//! populated set into a single [`GeneratorReading`] and clears every field, so
//! a consumer never sees a mix of old and new values.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock;

/// A telemetry field tracked by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    /// External feedback (DC bias voltage)
    ExternalFeedback,
    /// Forward power in watts
    ForwardPower,
    /// Reflected power in watts
    ReflectedPower,
    /// Power setpoint in watts
    Setpoint,
    /// Load capacitor position
    LoadCapPosition,
    /// Tune capacitor position
    TuneCapPosition,
}

impl Parameter {
    /// Every tracked parameter
    pub const ALL: [Parameter; 6] = [
        Parameter::ExternalFeedback,
        Parameter::ForwardPower,
        Parameter::ReflectedPower,
        Parameter::Setpoint,
        Parameter::LoadCapPosition,
        Parameter::TuneCapPosition,
    ];
}

/// Partially collected telemetry. `None` means "not received yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSet {
    /// See [`Parameter::ExternalFeedback`]
    pub external_feedback: Option<i32>,
    /// See [`Parameter::ForwardPower`]
    pub forward_power: Option<i32>,
    /// See [`Parameter::ReflectedPower`]
    pub reflected_power: Option<i32>,
    /// See [`Parameter::Setpoint`]
    pub setpoint: Option<i32>,
    /// See [`Parameter::LoadCapPosition`]
    pub load_cap_position: Option<i32>,
    /// See [`Parameter::TuneCapPosition`]
    pub tune_cap_position: Option<i32>,
}

impl ParameterSet {
    fn slot(&mut self, parameter: Parameter) -> &mut Option<i32> {
        match parameter {
            Parameter::ExternalFeedback => &mut self.external_feedback,
            Parameter::ForwardPower => &mut self.forward_power,
            Parameter::ReflectedPower => &mut self.reflected_power,
            Parameter::Setpoint => &mut self.setpoint,
            Parameter::LoadCapPosition => &mut self.load_cap_position,
            Parameter::TuneCapPosition => &mut self.tune_cap_position,
        }
    }

    /// Overwrite a single field
    pub fn set(&mut self, parameter: Parameter, value: i32) {
        *self.slot(parameter) = Some(value);
    }

    /// Current value of a field
    pub fn get(&self, parameter: Parameter) -> Option<i32> {
        match parameter {
            Parameter::ExternalFeedback => self.external_feedback,
            Parameter::ForwardPower => self.forward_power,
            Parameter::ReflectedPower => self.reflected_power,
            Parameter::Setpoint => self.setpoint,
            Parameter::LoadCapPosition => self.load_cap_position,
            Parameter::TuneCapPosition => self.tune_cap_position,
        }
    }

    /// Whether every field has been received
    pub fn is_complete(&self) -> bool {
        Parameter::ALL.iter().all(|p| self.get(*p).is_some())
    }

    /// Whether no field has been received
    pub fn is_empty(&self) -> bool {
        Parameter::ALL.iter().all(|p| self.get(*p).is_none())
    }

    /// Mark every field as unset
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Build a reading if every field is present
    pub fn to_reading(&self) -> Option<GeneratorReading> {
        Some(GeneratorReading {
            external_feedback: self.external_feedback?,
            forward_power: self.forward_power?,
            reflected_power: self.reflected_power?,
            setpoint: self.setpoint?,
            load_cap_position: self.load_cap_position?,
            tune_cap_position: self.tune_cap_position?,
            received_at: Utc::now(),
        })
    }
}

/// A complete, coalesced set of generator telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorReading {
    /// External feedback (DC bias voltage)
    pub external_feedback: i32,
    /// Forward power in watts
    pub forward_power: i32,
    /// Reflected power in watts
    pub reflected_power: i32,
    /// Power setpoint in watts
    pub setpoint: i32,
    /// Load capacitor position
    pub load_cap_position: i32,
    /// Tune capacitor position
    pub tune_cap_position: i32,
    /// When the set was completed
    pub received_at: DateTime<Utc>,
}

/// Thread-safe [`ParameterSet`] with all-or-nothing hand-off
#[derive(Debug, Default)]
pub struct ParameterAggregator {
    set: Mutex<ParameterSet>,
}

impl ParameterAggregator {
    /// Create an aggregator with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one field, replacing any earlier value
    pub fn record(&self, parameter: Parameter, value: i32) {
        lock(&self.set).set(parameter, value);
    }

    /// Record several fields under a single lock
    pub fn record_all(&self, values: &[(Parameter, i32)]) {
        let mut set = lock(&self.set);
        for (parameter, value) in values {
            set.set(*parameter, *value);
        }
    }

    /// Copy of the fields collected so far
    pub fn snapshot(&self) -> ParameterSet {
        *lock(&self.set)
    }

    /// If every field is present, return the reading and reset all fields.
    /// Otherwise leave the set untouched.
    pub fn take_complete(&self) -> Option<GeneratorReading> {
        let mut set = lock(&self.set);
        let reading = set.to_reading()?;
        set.reset();
        Some(reading)
    }
}
