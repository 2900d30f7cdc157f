//! SyncCore - the protocol state machine
//!
//! Owns the scene store and every piece of protocol bookkeeping: per-field
//! debounce, the delivery queue, the two acknowledgement slots and the
//! outbox. It never blocks and never reads the clock; every entry point takes
//! `now` and the runner supplies it. Messages to transmit are collected in
//! the outbox and drained by the runner after each call.
//!
//! # Exclusivity
//!
//! Field updates and resync queries share one slot: at most one is awaiting
//! acknowledgement, the rest wait in FIFO order. Scene messages use their own
//! slot and are sent at once; a newer scene message replaces an older one
//! still waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::debounce::Debouncer;
use super::delivery::{AckClass, AckSlot, Delivery, DeliveryQueue, Expiry};
use crate::error::{SyncError, SyncResult};
use crate::protocol::Outbound;
use crate::state::{
    check_scene, Change, Field, FieldKey, Origin, SceneStore, Telemetry, OUTPUT_COUNT,
    SCENE_COUNT,
};

/// Debounce and retry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTiming {
    pub debounce: Duration,
    pub ack_timeout: Duration,
    /// Total sends per delivery, first attempt included
    pub max_attempts: u8,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            ack_timeout: Duration::from_millis(200),
            max_attempts: 3,
        }
    }
}

/// Something observable happened to the store
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEvent {
    Field(Change),
    SceneSelected { scene: u8, origin: Origin },
}

/// Invoked for every store mutation
pub type StateCallback = Arc<dyn Fn(&StateEvent) + Send + Sync>;

/// Invoked with (output index, samples oldest-first) after each telemetry sample
pub type TelemetryCallback = Arc<dyn Fn(usize, &[f64]) + Send + Sync>;

/// Delivery counters, for status display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub sent: u64,
    pub retried: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
}

pub struct SyncCore {
    pub(super) store: SceneStore,
    pub(super) telemetry: Telemetry,
    timing: SyncTiming,
    debouncer: Debouncer<FieldKey, f64>,
    queue: DeliveryQueue,
    pub(super) field_slot: AckSlot,
    pub(super) scene_slot: AckSlot,
    resynced: [bool; SCENE_COUNT],
    connected: bool,
    outbox: Vec<Outbound>,
    pub(super) stats: DeliveryStats,
    state_listeners: Vec<StateCallback>,
    pub(super) telemetry_listeners: Vec<TelemetryCallback>,
}

impl SyncCore {
    /// Create a core with default store contents
    ///
    /// Fails only if the field table is inconsistent.
    pub fn new(timing: SyncTiming) -> SyncResult<Self> {
        Ok(Self {
            store: SceneStore::new()?,
            telemetry: Telemetry::new(),
            timing,
            debouncer: Debouncer::new(timing.debounce),
            queue: DeliveryQueue::default(),
            field_slot: AckSlot::default(),
            scene_slot: AckSlot::default(),
            resynced: [false; SCENE_COUNT],
            connected: false,
            outbox: Vec::new(),
            stats: DeliveryStats::default(),
            state_listeners: Vec::new(),
            telemetry_listeners: Vec::new(),
        })
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    pub fn timing(&self) -> SyncTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: SyncTiming) {
        self.timing = timing;
        self.debouncer.set_window(timing.debounce);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of field deliveries waiting for the slot
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of keys inside their debounce window
    pub fn debouncing(&self) -> usize {
        self.debouncer.len()
    }

    pub fn subscribe_state(&mut self, callback: StateCallback) {
        self.state_listeners.push(callback);
    }

    pub fn subscribe_telemetry(&mut self, callback: TelemetryCallback) {
        self.telemetry_listeners.push(callback);
    }

    pub(super) fn emit(&self, event: StateEvent) {
        for listener in &self.state_listeners {
            listener(&event);
        }
    }

    // =========================================================================
    // Local mutation API
    // =========================================================================

    /// Edit a field from the control surface
    ///
    /// Every resulting change is debounced under its own key and eventually
    /// delivered.
    pub fn set_field(&mut self, key: FieldKey, value: f64, now: Instant) -> SyncResult<Vec<Change>> {
        let changes = self.store.set_local(key, value)?;
        for change in &changes {
            trace!(key = %change.key, old = change.old, new = change.new, "Local edit");
            self.debouncer.schedule(change.key, change.new, now);
            self.emit(StateEvent::Field(*change));
        }
        Ok(changes)
    }

    /// Select a scene from the control surface; sent without debounce
    pub fn select_scene(&mut self, scene: u8, now: Instant) -> SyncResult<()> {
        let scene = check_scene(scene as i64)?;
        if self.store.set_active_scene(scene)? {
            self.emit(StateEvent::SceneSelected {
                scene,
                origin: Origin::Local,
            });
        }

        if !self.connected {
            debug!(scene, "Scene selected while disconnected, device will be queried on connect");
            return Ok(());
        }

        self.start_delivery(Delivery::new(Outbound::SceneSelect { scene }), now);
        self.resync_scene(scene);
        self.pump(now);
        Ok(())
    }

    /// Reboot the device into its bootloader; fire-and-forget
    pub fn reset_device(&mut self) {
        info!("Sending device reset");
        self.outbox.push(Outbound::DiskMode);
    }

    /// Queue a heartbeat probe
    pub fn send_probe(&mut self) {
        trace!("Sending version probe");
        self.outbox.push(Outbound::VersionProbe);
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Primary output bound: ask for the active scene and resume deliveries
    pub fn on_connected(&mut self, now: Instant) {
        self.connected = true;
        self.start_delivery(Delivery::new(Outbound::SceneQuery), now);
        self.pump(now);
    }

    /// Device lost: cancel acknowledgement waits
    ///
    /// Queued and debouncing edits are kept and go out after reconnect.
    /// Resync flags are cleared so the next connection reads the device again.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        for slot in [&mut self.field_slot, &mut self.scene_slot] {
            if let Some(delivery) = slot.cancel() {
                debug!(payload = %delivery.message, "Cancelled acknowledgement wait");
            }
        }
        self.resynced = [false; SCENE_COUNT];
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Advance timers: release debounced edits, retry or abandon expired
    /// deliveries and start the next queued one
    pub fn poll(&mut self, now: Instant) {
        for (key, value) in self.debouncer.take_due(now) {
            trace!(%key, value, "Debounce window elapsed");
            self.queue.push(Delivery::new(Outbound::Update {
                scene: key.scene,
                output: key.output,
                hash: key.hash(),
                value,
            }));
        }

        self.expire(AckClass::Field, now);
        self.expire(AckClass::Scene, now);
        self.pump(now);
    }

    /// Earliest instant at which [`SyncCore::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.debouncer.next_deadline(),
            self.field_slot.deadline(),
            self.scene_slot.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Take everything queued for transmission
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn slot_mut(&mut self, class: AckClass) -> &mut AckSlot {
        match class {
            AckClass::Field => &mut self.field_slot,
            AckClass::Scene => &mut self.scene_slot,
        }
    }

    fn expire(&mut self, class: AckClass, now: Instant) {
        let SyncTiming {
            ack_timeout,
            max_attempts,
            ..
        } = self.timing;

        match self.slot_mut(class).expire(now, ack_timeout, max_attempts) {
            Expiry::Pending => {}
            Expiry::Retry(message) => {
                debug!(payload = %message, "No acknowledgement, retrying");
                self.stats.retried += 1;
                self.outbox.push(message);
            }
            Expiry::Abandoned(delivery) => {
                let err = SyncError::AcknowledgementTimeout {
                    payload: delivery.message.payload(),
                    attempts: delivery.attempts,
                };
                warn!("Giving up: {}", err);
                self.stats.abandoned += 1;
            }
        }
    }

    /// Put a delivery into its class slot and send the first attempt
    fn start_delivery(&mut self, delivery: Delivery, now: Instant) {
        let timeout = self.timing.ack_timeout;
        let (message, superseded) = self.slot_mut(delivery.class()).start(delivery, now, timeout);
        if let Some(old) = superseded {
            debug!(payload = %old.message, "Superseded before acknowledgement");
        }
        trace!(payload = %message, "Sending");
        self.stats.sent += 1;
        self.outbox.push(message);
    }

    /// Start the next field delivery if the slot is free
    pub(super) fn pump(&mut self, now: Instant) {
        if !self.connected || self.field_slot.is_busy() {
            return;
        }
        if let Some(delivery) = self.queue.pop() {
            self.start_delivery(delivery, now);
        }
    }

    /// Query every field of a scene so the store reflects the device
    ///
    /// Runs at most once per scene per connection.
    pub(super) fn resync_scene(&mut self, scene: u8) {
        if !self.connected || self.resynced[scene as usize] {
            return;
        }
        self.resynced[scene as usize] = true;

        info!(scene, "Reading scene from device");
        for output in 0..OUTPUT_COUNT as u8 {
            for field in Field::ALL {
                self.queue.push(Delivery::new(Outbound::Query {
                    scene,
                    output,
                    hash: field.hash(),
                }));
            }
        }
    }
}
