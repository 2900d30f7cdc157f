//! Sync engine - owns the protocol core and the device session
//!
//! A single task multiplexes handle commands, inbound MIDI, protocol
//! deadlines and the liveness tick. Nothing else touches protocol state;
//! collaborators talk to the engine through [`EngineHandle`].
//!
//! ```text
//! EngineHandle ──commands──┐
//! midir callbacks ─frames──┤
//!                          ▼
//!                    SyncEngine::run ──► SyncCore (store, debounce, acks)
//!                          │                 │
//!                          │◄──── outbox ────┘
//!                          ▼
//!                    DeviceSession ──► device output
//! ```

pub mod sync_core;
mod debounce;
mod decoder;
mod delivery;
pub mod liveness;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub use self::sync_core::{
    DeliveryStats, StateCallback, StateEvent, SyncCore, SyncTiming, TelemetryCallback,
};
pub use self::liveness::{LivenessMonitor, LivenessTiming, Verdict};

use crate::device::{AuxState, DeviceSession, PortEvent, PortProvider, DEFAULT_DEVICE_PATTERNS};
use crate::error::SyncResult;
use crate::midi::{decode_sysex, encode_sysex, format_hex, MidiMessage};
use crate::state::{Change, FieldKey, OutputConfig};

/// Device connection state as seen by collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected { port: String },
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected { port } => write!(f, "connected ({})", port),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Invoked on every connection status transition
pub type StatusCallback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Everything the engine can be reconfigured with at runtime
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub sync: SyncTiming,
    pub liveness: LivenessTiming,
    pub device_patterns: Vec<String>,
    pub auto_activate: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sync: SyncTiming::default(),
            liveness: LivenessTiming::default(),
            device_patterns: DEFAULT_DEVICE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            auto_activate: Vec::new(),
        }
    }
}

/// Snapshot for status display
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub connection: ConnectionStatus,
    pub input: Option<String>,
    pub active_scene: u8,
    pub queued: usize,
    pub debouncing: usize,
    pub deliveries: DeliveryStats,
    pub aux: Vec<(String, AuxState)>,
}

/// Commands accepted by the engine task
pub enum EngineCommand {
    SetField {
        key: FieldKey,
        value: f64,
        response: oneshot::Sender<SyncResult<Vec<Change>>>,
    },
    SelectScene {
        scene: u8,
        response: oneshot::Sender<SyncResult<()>>,
    },
    ToggleAux {
        port: String,
        response: oneshot::Sender<Option<bool>>,
    },
    ResetDevice,
    Rediscover,
    GetOutput {
        scene: u8,
        output: u8,
        response: oneshot::Sender<Option<OutputConfig>>,
    },
    GetTelemetry {
        index: usize,
        response: oneshot::Sender<Vec<f64>>,
    },
    GetStatus {
        response: oneshot::Sender<EngineStatus>,
    },
    ApplySettings(EngineSettings),
    Shutdown,
}

/// Cloneable client of the engine task
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    connected: Arc<AtomicBool>,
    status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(response_tx))
            .map_err(|_| anyhow!("Engine is not running"))?;
        response_rx
            .await
            .map_err(|_| anyhow!("Engine stopped before replying"))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Edit a field; returns the resulting change set
    pub async fn set_field(&self, key: FieldKey, value: f64) -> Result<Vec<Change>> {
        let changes = self
            .request(|response| EngineCommand::SetField {
                key,
                value,
                response,
            })
            .await??;
        Ok(changes)
    }

    pub async fn select_scene(&self, scene: u8) -> Result<()> {
        self.request(|response| EngineCommand::SelectScene { scene, response })
            .await??;
        Ok(())
    }

    /// Flip an auxiliary input's forwarding flag; None if the port is unknown
    pub async fn toggle_aux(&self, port: &str) -> Option<bool> {
        let port = port.to_string();
        self.request(|response| EngineCommand::ToggleAux { port, response })
            .await
            .ok()
            .flatten()
    }

    /// Fire-and-forget
    pub fn reset_device(&self) {
        let _ = self.cmd_tx.send(EngineCommand::ResetDevice);
    }

    /// Fire-and-forget
    pub fn rediscover(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Rediscover);
    }

    pub fn apply_settings(&self, settings: EngineSettings) {
        let _ = self.cmd_tx.send(EngineCommand::ApplySettings(settings));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_output(&self, scene: u8, output: u8) -> Option<OutputConfig> {
        self.request(|response| EngineCommand::GetOutput {
            scene,
            output,
            response,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn telemetry(&self, index: usize) -> Vec<f64> {
        self.request(|response| EngineCommand::GetTelemetry { index, response })
            .await
            .unwrap_or_default()
    }

    pub async fn status(&self) -> Option<EngineStatus> {
        self.request(|response| EngineCommand::GetStatus { response })
            .await
            .ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Register a connection status callback
    pub fn on_status(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

fn liveness_interval(timing: &LivenessTiming) -> Interval {
    let mut interval = tokio::time::interval(timing.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub struct SyncEngine<P: PortProvider> {
    core: SyncCore,
    session: DeviceSession<P>,
    liveness: LivenessMonitor,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    port_rx: mpsc::UnboundedReceiver<PortEvent>,
    connected: Arc<AtomicBool>,
    status: ConnectionStatus,
    status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
}

impl<P: PortProvider> SyncEngine<P> {
    /// Build an engine and its handle; nothing runs until [`SyncEngine::run`]
    pub fn new(provider: P, settings: EngineSettings) -> SyncResult<(Self, EngineHandle)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let status_callbacks = Arc::new(RwLock::new(Vec::new()));

        let engine = Self {
            core: SyncCore::new(settings.sync)?,
            session: DeviceSession::new(
                provider,
                &settings.device_patterns,
                &settings.auto_activate,
                port_tx,
            ),
            liveness: LivenessMonitor::new(settings.liveness, now()),
            cmd_rx,
            port_rx,
            connected: connected.clone(),
            status: ConnectionStatus::Disconnected,
            status_callbacks: status_callbacks.clone(),
        };
        let handle = EngineHandle {
            cmd_tx,
            connected,
            status_callbacks,
        };
        Ok((engine, handle))
    }

    pub fn on_state_change(&mut self, callback: StateCallback) {
        self.core.subscribe_state(callback);
    }

    pub fn on_telemetry(&mut self, callback: TelemetryCallback) {
        self.core.subscribe_telemetry(callback);
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        info!("Sync engine started");
        self.rediscover();
        self.flush();

        let mut tick = liveness_interval(&self.liveness.timing());

        loop {
            let deadline = self.core.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(cmd) => {
                        self.handle_command(cmd);
                        if tick.period() != self.liveness.timing().tick {
                            tick = liveness_interval(&self.liveness.timing());
                        }
                    }
                },
                Some(event) = self.port_rx.recv() => self.handle_port_event(event),
                _ = sleep_until(deadline) => self.core.poll(now()),
                _ = tick.tick() => self.on_tick(),
            }
            self.flush();
        }

        self.session.disconnect();
        self.set_status(ConnectionStatus::Disconnected);
        info!("Sync engine stopped");
        Ok(())
    }

    /// Transmit everything the core queued
    fn flush(&mut self) {
        for message in self.core.drain_outbox() {
            let payload = message.payload();
            trace!("→ {}", payload);
            if let Err(e) = self.session.send(&encode_sysex(&payload)) {
                debug!("Send of '{}' failed: {:#}", payload, e);
            }
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetField {
                key,
                value,
                response,
            } => {
                let result = self.core.set_field(key, value, now());
                if let Err(e) = &result {
                    debug!("Rejected edit of {}: {}", key, e);
                }
                let _ = response.send(result);
            }
            EngineCommand::SelectScene { scene, response } => {
                let result = self.core.select_scene(scene, now());
                if let Err(e) = &result {
                    debug!("Rejected scene select: {}", e);
                }
                let _ = response.send(result);
            }
            EngineCommand::ToggleAux { port, response } => {
                let active = self.session.aux().toggle(&port);
                if let Some(active) = active {
                    info!(active, "Auxiliary input '{}' toggled", port);
                }
                let _ = response.send(active);
            }
            EngineCommand::ResetDevice => self.core.reset_device(),
            EngineCommand::Rediscover => self.rediscover(),
            EngineCommand::GetOutput {
                scene,
                output,
                response,
            } => {
                let _ = response.send(self.core.store().output(scene, output).cloned());
            }
            EngineCommand::GetTelemetry { index, response } => {
                let _ = response.send(self.core.telemetry().samples(index));
            }
            EngineCommand::GetStatus { response } => {
                let _ = response.send(self.snapshot());
            }
            EngineCommand::ApplySettings(settings) => {
                self.core.set_timing(settings.sync);
                self.liveness.set_timing(settings.liveness);
                self.session
                    .set_patterns(&settings.device_patterns, &settings.auto_activate);
                info!("Engine settings updated");
            }
            // Handled by the run loop
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_port_event(&mut self, event: PortEvent) {
        match event {
            PortEvent::Device(bytes) => {
                let now = now();
                self.liveness.on_message(now);
                match decode_sysex(&bytes) {
                    Some(payload) => {
                        trace!("← {}", payload);
                        self.core.handle_payload(&payload, now);
                    }
                    None => match MidiMessage::parse(&bytes) {
                        Some(msg) => info!("[device] {}", msg),
                        None => info!("[device] {}", format_hex(&bytes)),
                    },
                }
            }
            PortEvent::Aux { port, data } => {
                if let Err(e) = self.session.forward_aux(&port, &data) {
                    warn!("Failed to forward from {}: {:#}", port, e);
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = now();
        match self.liveness.check(now, self.session.is_connected()) {
            Verdict::Quiet => {}
            Verdict::Probe => self.core.send_probe(),
            Verdict::Disconnect => {
                // Without a device this is just the periodic rescan
                if self.session.is_connected() {
                    warn!("Device silent, disconnecting");
                    self.core.on_disconnected();
                    self.session.disconnect();
                    self.set_status(ConnectionStatus::Disconnected);
                }
                self.rediscover();
            }
        }
    }

    /// Enumerate ports and bind the device if it is present
    fn rediscover(&mut self) {
        let now = now();
        let was_connected = self.session.is_connected();
        self.liveness.on_rediscover(now);

        let report = match self.session.discover() {
            Ok(report) => report,
            Err(e) => {
                warn!("Port discovery failed: {:#}", e);
                return;
            }
        };

        if report.newly_connected {
            self.core.on_connected(now);
            self.liveness.on_connected(now);
            if let Some(port) = report.output {
                self.set_status(ConnectionStatus::Connected { port });
            }
        } else if was_connected && !self.session.is_connected() {
            self.core.on_disconnected();
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.connected.store(
            matches!(status, ConnectionStatus::Connected { .. }),
            Ordering::Relaxed,
        );
        if self.status == status {
            return;
        }
        info!("Device {}", status);
        for callback in self.status_callbacks.read().iter() {
            callback(&status);
        }
        self.status = status;
    }

    fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            connection: self.status.clone(),
            input: self.session.primary_input_name().map(str::to_string),
            active_scene: self.core.store().active_scene(),
            queued: self.core.queued(),
            debouncing: self.core.debouncing(),
            deliveries: self.core.stats(),
            aux: self.session.aux().snapshot(),
        }
    }
}
