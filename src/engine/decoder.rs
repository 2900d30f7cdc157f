//! Inbound decoder
//!
//! Applies device payloads to the store. Values reported by the device go
//! through [`SceneStore::apply_remote`](crate::state::SceneStore::apply_remote)
//! and never touch the debouncer, so nothing decoded here is sent back.

use std::time::Instant;

use tracing::{debug, info, trace};

use super::sync_core::{StateEvent, SyncCore};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Inbound, Outbound, WireUpdate, SCENE_HASH};
use crate::state::{check_indices, check_scene, FieldKey, Origin};

impl SyncCore {
    /// Handle one decoded SysEx payload from the primary input
    pub fn handle_payload(&mut self, payload: &str, now: Instant) {
        match Inbound::parse(payload) {
            Ok(Inbound::Version(version)) => {
                trace!(%version, "Heartbeat");
            }
            Ok(Inbound::Telemetry { index, value }) => {
                if let Some(samples) = self.telemetry.push(index, value) {
                    for listener in &self.telemetry_listeners {
                        listener(index, samples);
                    }
                }
            }
            Ok(Inbound::Update(update)) => {
                if let Err(e) = self.handle_update(update) {
                    debug!("Dropped '{}': {}", payload, e);
                }
            }
            Ok(Inbound::Unrecognized(text)) => {
                info!("[device] {}", text);
            }
            Err(e) => {
                debug!("Dropped '{}': {}", payload, e);
            }
        }

        // An acknowledgement may have freed the field slot
        self.pump(now);
    }

    fn handle_update(&mut self, update: WireUpdate) -> SyncResult<()> {
        if let Some(done) = self.field_slot.resolve(&update) {
            trace!(payload = %done.message, attempts = done.attempts, "Acknowledged");
            self.stats.acknowledged += 1;
        }

        if update.hash == SCENE_HASH {
            return self.handle_scene_report(update);
        }

        let (scene, output) = check_indices(update.scene, update.output)?;
        let field = self
            .store
            .field_for_hash(update.hash)
            .ok_or(SyncError::UnknownParameterHash {
                scene,
                output,
                hash: update.hash,
            })?;

        let key = FieldKey {
            scene,
            output,
            field,
        };
        if let Some(change) = self.store.apply_remote(key, update.value)? {
            debug!(%key, old = change.old, new = change.new, "Device update");
            self.emit(StateEvent::Field(change));
        }
        Ok(())
    }

    /// The device reported (or confirmed) its active scene
    fn handle_scene_report(&mut self, update: WireUpdate) -> SyncResult<()> {
        if let Some(done) = self.scene_slot.resolve(&update) {
            trace!(payload = %done.message, attempts = done.attempts, "Acknowledged");
            self.stats.acknowledged += 1;
        }

        // Our newest select is still unconfirmed; a report of any other scene is stale
        if let Some(Outbound::SceneSelect { scene }) = self.scene_slot.current().map(|d| &d.message) {
            debug!(wanted = scene, reported = update.value, "Ignoring stale scene report");
            return Ok(());
        }

        if update.value.fract() != 0.0 {
            return Err(SyncError::MalformedMessage(format!(
                "scene {}",
                update.value
            )));
        }
        let scene = check_scene(update.value as i64)?;

        if self.store.set_active_scene(scene)? {
            info!(scene, "Device switched scene");
            self.emit(StateEvent::SceneSelected {
                scene,
                origin: Origin::Device,
            });
        }
        self.resync_scene(scene);
        Ok(())
    }
}
