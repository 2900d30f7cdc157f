//! midir-backed port provider

use anyhow::{anyhow, Context, Result};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::trace;

use super::{InputHandler, OutputPort, PortProvider};
use crate::midi::format_hex;

/// Opens real MIDI ports through midir
#[derive(Debug, Clone)]
pub struct MidirPorts {
    client_name: String,
}

impl MidirPorts {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn midi_in(&self, suffix: &str) -> Result<MidiInput> {
        let mut midi_in = MidiInput::new(&format!("{}-{}", self.client_name, suffix))
            .context("Failed to create MIDI input")?;
        // SysEx carries the whole protocol
        midi_in.ignore(Ignore::None);
        Ok(midi_in)
    }

    fn midi_out(&self, suffix: &str) -> Result<MidiOutput> {
        MidiOutput::new(&format!("{}-{}", self.client_name, suffix))
            .context("Failed to create MIDI output")
    }
}

impl PortProvider for MidirPorts {
    type Input = MidiInputConnection<()>;
    type Output = MidirOutput;

    fn input_names(&self) -> Result<Vec<String>> {
        let midi_in = self.midi_in("scan")?;
        Ok(midi_in
            .ports()
            .iter()
            .filter_map(|port| midi_in.port_name(port).ok())
            .collect())
    }

    fn output_names(&self) -> Result<Vec<String>> {
        let midi_out = self.midi_out("scan")?;
        Ok(midi_out
            .ports()
            .iter()
            .filter_map(|port| midi_out.port_name(port).ok())
            .collect())
    }

    fn open_input(&self, name: &str, mut handler: InputHandler) -> Result<Self::Input> {
        let midi_in = self.midi_in("in")?;
        let port = midi_in
            .ports()
            .into_iter()
            .find(|p| midi_in.port_name(p).map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("Input port '{}' not found", name))?;

        midi_in
            .connect(
                &port,
                &self.client_name,
                move |_timestamp, data, _| handler(data),
                (),
            )
            .map_err(|e| anyhow!("Failed to connect to input port '{}': {}", name, e))
    }

    fn open_output(&self, name: &str) -> Result<Self::Output> {
        let midi_out = self.midi_out("out")?;
        let port = midi_out
            .ports()
            .into_iter()
            .find(|p| midi_out.port_name(p).map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("Output port '{}' not found", name))?;

        let conn = midi_out
            .connect(&port, &self.client_name)
            .map_err(|e| anyhow!("Failed to connect to output port '{}': {}", name, e))?;
        Ok(MidirOutput { conn })
    }
}

/// An open midir output connection
pub struct MidirOutput {
    conn: MidiOutputConnection,
}

impl OutputPort for MidirOutput {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.conn
            .send(bytes)
            .map_err(|e| anyhow!("Failed to send MIDI message: {}", e))?;
        trace!("Sent: {}", format_hex(bytes));
        Ok(())
    }
}
