//! Device session - MIDI port discovery and binding
//!
//! The device is found by case-insensitive substring match on port names.
//! Its input feeds the engine; every other input is tracked as an auxiliary
//! controller whose messages can be forwarded to the device output.
//!
//! Ports are reached through [`PortProvider`] so the session can run against
//! midir or an in-memory double.

pub mod auxiliary;
mod midir_ports;

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use auxiliary::{AuxInputs, AuxState};
pub use midir_ports::{MidirOutput, MidirPorts};

use crate::error::SyncError;

/// Port names of the supported device family
pub const DEFAULT_DEVICE_PATTERNS: [&str; 3] = ["yoctocore", "zeptocore", "ectocore"];

/// Receives raw bytes on the MIDI callback thread
pub type InputHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// An open output connection
pub trait OutputPort: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Enumerates and opens MIDI ports
///
/// Dropping an `Input` closes the connection.
pub trait PortProvider {
    type Input: Send;
    type Output: OutputPort;

    fn input_names(&self) -> Result<Vec<String>>;
    fn output_names(&self) -> Result<Vec<String>>;
    fn open_input(&self, name: &str, handler: InputHandler) -> Result<Self::Input>;
    fn open_output(&self, name: &str) -> Result<Self::Output>;
}

/// Traffic from bound inputs, delivered to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Bytes from the device input
    Device(Vec<u8>),
    /// A message from an active auxiliary input, to forward verbatim
    Aux { port: String, data: Vec<u8> },
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub primary_input: Option<String>,
    pub output: Option<String>,
    /// The output was bound during this pass
    pub newly_connected: bool,
    pub aux_added: Vec<String>,
    pub aux_pruned: Vec<String>,
}

struct Bound<C> {
    name: String,
    conn: C,
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    let name = name.to_lowercase();
    patterns.iter().any(|p| name.contains(p.as_str()))
}

fn lowercase_all(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}

pub struct DeviceSession<P: PortProvider> {
    provider: P,
    device_patterns: Vec<String>,
    auto_activate: Vec<String>,
    events: mpsc::UnboundedSender<PortEvent>,
    primary: Option<Bound<P::Input>>,
    output: Option<Bound<P::Output>>,
    aux_connections: HashMap<String, P::Input>,
    aux: AuxInputs,
}

impl<P: PortProvider> DeviceSession<P> {
    pub fn new(
        provider: P,
        device_patterns: &[String],
        auto_activate: &[String],
        events: mpsc::UnboundedSender<PortEvent>,
    ) -> Self {
        Self {
            provider,
            device_patterns: lowercase_all(device_patterns),
            auto_activate: lowercase_all(auto_activate),
            events,
            primary: None,
            output: None,
            aux_connections: HashMap::new(),
            aux: AuxInputs::new(),
        }
    }

    /// Replace the name patterns; takes effect on the next discovery
    pub fn set_patterns(&mut self, device_patterns: &[String], auto_activate: &[String]) {
        self.device_patterns = lowercase_all(device_patterns);
        self.auto_activate = lowercase_all(auto_activate);
    }

    pub fn aux(&self) -> &AuxInputs {
        &self.aux
    }

    pub fn is_connected(&self) -> bool {
        self.output.is_some()
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output.as_ref().map(|b| b.name.as_str())
    }

    pub fn primary_input_name(&self) -> Option<&str> {
        self.primary.as_ref().map(|b| b.name.as_str())
    }

    /// Enumerate ports and bind whatever is missing
    ///
    /// Already bound ports that are still present are left alone, so this is
    /// safe to call repeatedly.
    pub fn discover(&mut self) -> Result<DiscoveryReport> {
        let inputs = self.provider.input_names()?;
        let outputs = self.provider.output_names()?;
        let mut report = DiscoveryReport::default();

        self.bind_primary_input(&inputs);
        self.bind_aux_inputs(&inputs, &mut report);
        report.newly_connected = self.bind_output(&outputs);

        report.primary_input = self.primary_input_name().map(str::to_string);
        report.output = self.output_name().map(str::to_string);
        Ok(report)
    }

    fn bind_primary_input(&mut self, inputs: &[String]) {
        if let Some(bound) = &self.primary {
            if inputs.contains(&bound.name) {
                return;
            }
            info!("Device input '{}' disappeared", bound.name);
            self.primary = None;
        }

        let Some(name) = inputs
            .iter()
            .find(|n| matches_any(n, &self.device_patterns))
        else {
            return;
        };

        let tx = self.events.clone();
        let handler: InputHandler = Box::new(move |data| {
            let _ = tx.send(PortEvent::Device(data.to_vec()));
        });
        match self.provider.open_input(name, handler) {
            Ok(conn) => {
                info!("Connected to device input: {}", name);
                self.primary = Some(Bound {
                    name: name.clone(),
                    conn,
                });
            }
            Err(e) => warn!("{:#}", e),
        }
    }

    fn bind_aux_inputs(&mut self, inputs: &[String], report: &mut DiscoveryReport) {
        for name in inputs {
            if matches_any(name, &self.device_patterns) || self.aux_connections.contains_key(name) {
                continue;
            }

            let aux = self.aux.clone();
            let tx = self.events.clone();
            let port = name.clone();
            let handler: InputHandler = Box::new(move |data| {
                if aux.record(&port, data) {
                    let _ = tx.send(PortEvent::Aux {
                        port: port.clone(),
                        data: data.to_vec(),
                    });
                }
            });

            match self.provider.open_input(name, handler) {
                Ok(conn) => {
                    let active = matches_any(name, &self.auto_activate);
                    self.aux.register(name, active);
                    self.aux_connections.insert(name.clone(), conn);
                    info!(active, "Tracking auxiliary input: {}", name);
                    report.aux_added.push(name.clone());
                }
                Err(e) => debug!("Skipping auxiliary input: {:#}", e),
            }
        }

        report.aux_pruned = self.aux.prune(inputs);
        self.aux_connections.retain(|name, _| inputs.contains(name));
        for name in &report.aux_pruned {
            info!("Auxiliary input '{}' removed", name);
        }
    }

    /// Returns true when an output was bound during this call
    fn bind_output(&mut self, outputs: &[String]) -> bool {
        if let Some(bound) = &self.output {
            if outputs.contains(&bound.name) {
                return false;
            }
            info!("Device output '{}' disappeared", bound.name);
            self.output = None;
        }

        let Some(name) = outputs
            .iter()
            .find(|n| matches_any(n, &self.device_patterns))
        else {
            warn!(
                "{}",
                SyncError::TransportUnavailable(self.device_patterns.join(", "))
            );
            return false;
        };

        match self.provider.open_output(name) {
            Ok(conn) => {
                info!("Connected to device output: {}", name);
                self.output = Some(Bound {
                    name: name.clone(),
                    conn,
                });
                true
            }
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    /// Drop every binding and stop tracking auxiliary inputs
    pub fn disconnect(&mut self) {
        self.primary = None;
        self.output = None;
        self.aux_connections.clear();
        self.aux.clear();
        info!("Device session disconnected");
    }

    /// Send raw bytes to the device output
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| SyncError::TransportUnavailable("no output bound".to_string()))?;
        output.conn.send(bytes)
    }

    /// Forward an auxiliary message if its port is still active
    pub fn forward_aux(&mut self, port: &str, data: &[u8]) -> Result<()> {
        if !self.aux.is_active(port) || self.output.is_none() {
            return Ok(());
        }
        debug!("Forwarding from {}: {}", port, crate::midi::format_hex(data));
        self.send(data)
    }
}

/// Print every port, marking the ones that match the device family
pub fn list_ports_formatted(provider: &impl PortProvider, device_patterns: &[String]) -> Result<()> {
    use colored::*;

    let patterns = lowercase_all(device_patterns);
    let marker = |name: &str| {
        if matches_any(name, &patterns) {
            "[DEVICE]".green()
        } else {
            "[AUX]   ".yellow()
        }
    };

    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

    for (title, names) in [
        ("Input Ports:", provider.input_names()?),
        ("Output Ports:", provider.output_names()?),
    ] {
        println!("\n{}", title.bold());
        if names.is_empty() {
            println!("  {}", "No ports found".dimmed());
        }
        for name in names {
            println!("  {} {}", marker(&name), name);
        }
    }

    println!();
    Ok(())
}
