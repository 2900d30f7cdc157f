//! Output field table
//!
//! Every output carries the same fixed set of numeric fields. The wire refers
//! to them by the djb2 hash of their name, so the table also owns the reverse
//! mapping from hash to field.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::hash::hash_name;
use crate::protocol::SCENE_HASH;

/// Number of fields per output
pub const FIELD_COUNT: usize = 24;

/// A configurable parameter of one output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Mode,
    Quantization,
    VOct,
    RootNote,
    MinVoltage,
    MaxVoltage,
    SlewTime,
    Portamento,
    MidiChannel,
    MidiPriorityChannel,
    MidiCc,
    ClockTempo,
    ClockDivision,
    LfoPeriod,
    LfoDepth,
    LfoWaveform,
    Attack,
    Decay,
    Sustain,
    Release,
    LinkedTo,
    Probability,
    Duration,
    VoltageSetpoint,
}

impl Field {
    /// All fields in table order
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::Mode,
        Field::Quantization,
        Field::VOct,
        Field::RootNote,
        Field::MinVoltage,
        Field::MaxVoltage,
        Field::SlewTime,
        Field::Portamento,
        Field::MidiChannel,
        Field::MidiPriorityChannel,
        Field::MidiCc,
        Field::ClockTempo,
        Field::ClockDivision,
        Field::LfoPeriod,
        Field::LfoDepth,
        Field::LfoWaveform,
        Field::Attack,
        Field::Decay,
        Field::Sustain,
        Field::Release,
        Field::LinkedTo,
        Field::Probability,
        Field::Duration,
        Field::VoltageSetpoint,
    ];

    /// Name as known to the device firmware
    pub fn name(self) -> &'static str {
        match self {
            Field::Mode => "mode",
            Field::Quantization => "quantization",
            Field::VOct => "v_oct",
            Field::RootNote => "root_note",
            Field::MinVoltage => "min_voltage",
            Field::MaxVoltage => "max_voltage",
            Field::SlewTime => "slew_time",
            Field::Portamento => "portamento",
            Field::MidiChannel => "midi_channel",
            Field::MidiPriorityChannel => "midi_priority_channel",
            Field::MidiCc => "midi_cc",
            Field::ClockTempo => "clock_tempo",
            Field::ClockDivision => "clock_division",
            Field::LfoPeriod => "lfo_period",
            Field::LfoDepth => "lfo_depth",
            Field::LfoWaveform => "lfo_waveform",
            Field::Attack => "attack",
            Field::Decay => "decay",
            Field::Sustain => "sustain",
            Field::Release => "release",
            Field::LinkedTo => "linked_to",
            Field::Probability => "probability",
            Field::Duration => "duration",
            Field::VoltageSetpoint => "voltage_setpoint",
        }
    }

    /// Power-on value before the device has reported anything
    pub fn default_value(self) -> f64 {
        match self {
            Field::VOct => 1.0,
            Field::RootNote => 60.0,
            Field::MinVoltage => -5.0,
            Field::MaxVoltage => 10.0,
            Field::ClockTempo => 120.0,
            Field::ClockDivision => 9.0,
            Field::LfoPeriod => 1.0,
            Field::LfoDepth => 1.0,
            Field::Attack => 0.1,
            Field::Decay => 0.1,
            Field::Sustain => 0.7,
            Field::Release => 2.1,
            Field::Probability => 100.0,
            Field::Duration => 1.0,
            Field::VoltageSetpoint => 1.0,
            _ => 0.0,
        }
    }

    /// Position in [`Field::ALL`] and in every output's value array
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn hash(self) -> u32 {
        hash_name(self.name())
    }

    /// Look a field up by its firmware name
    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.name() == name)
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash → field lookup, validated for collisions at construction
#[derive(Debug, Clone)]
pub struct FieldTable {
    by_hash: HashMap<u32, Field>,
}

impl FieldTable {
    /// Build the lookup, failing if two fields share a hash or a field
    /// shadows the scene selector
    pub fn build() -> SyncResult<Self> {
        let mut by_hash: HashMap<u32, Field> = HashMap::with_capacity(FIELD_COUNT);
        for field in Field::ALL {
            let hash = field.hash();
            if hash == SCENE_HASH {
                return Err(SyncError::HashCollision {
                    first: "scene",
                    second: field.name(),
                    hash,
                });
            }
            if let Some(existing) = by_hash.insert(hash, field) {
                return Err(SyncError::HashCollision {
                    first: existing.name(),
                    second: field.name(),
                    hash,
                });
            }
        }
        Ok(Self { by_hash })
    }

    pub fn lookup(&self, hash: u32) -> Option<Field> {
        self.by_hash.get(&hash).copied()
    }
}
