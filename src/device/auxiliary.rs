//! Auxiliary input tracking
//!
//! Every input port that is not the device itself is tracked here. midir
//! callback threads record traffic directly into the shared map; the engine
//! and the REPL read and toggle it.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::midi::{compact_hex, MidiMessage};

/// Tracking state of one auxiliary input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuxState {
    /// Forward this input's messages to the device
    pub active: bool,
    /// Last message received, lowercase hex
    pub last_message: Option<String>,
}

/// Shared map of auxiliary inputs keyed by port name
#[derive(Debug, Clone, Default)]
pub struct AuxInputs {
    ports: Arc<DashMap<String, AuxState>>,
}

impl AuxInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a port; an already tracked port keeps its state
    pub fn register(&self, name: &str, active: bool) {
        self.ports
            .entry(name.to_string())
            .or_insert_with(|| AuxState {
                active,
                last_message: None,
            });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.ports.get(name).map(|s| s.active).unwrap_or(false)
    }

    /// Record a message; returns true when it should be forwarded
    ///
    /// SysEx is recorded but never forwarded.
    pub fn record(&self, name: &str, data: &[u8]) -> bool {
        let Some(mut state) = self.ports.get_mut(name) else {
            return false;
        };
        state.last_message = Some(compact_hex(data));

        let message = MidiMessage::parse(data);
        if let Some(msg @ (MidiMessage::NoteOn { .. } | MidiMessage::NoteOff { .. })) = &message {
            debug!("[{}] {}", name, msg);
        }

        state.active && !message.map(|m| m.is_sysex()).unwrap_or(false)
    }

    /// Flip the activation flag; None if the port is unknown
    pub fn toggle(&self, name: &str) -> Option<bool> {
        let mut state = self.ports.get_mut(name)?;
        state.active = !state.active;
        Some(state.active)
    }

    /// Drop ports that are no longer present; returns the removed names
    pub fn prune(&self, present: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .ports
            .iter()
            .filter(|entry| !present.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in &stale {
            self.ports.remove(name);
        }
        stale
    }

    pub fn clear(&self) {
        self.ports.clear();
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Sorted copy of the map for display
    pub fn snapshot(&self) -> Vec<(String, AuxState)> {
        let mut ports: Vec<(String, AuxState)> = self
            .ports
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        ports.sort_by(|a, b| a.0.cmp(&b.0));
        ports
    }
}
