//! Scene store - the engine-owned copy of the device configuration
//!
//! All writes go through two entry points that differ only in where the value
//! came from:
//!
//! - [`SceneStore::set_local`] for edits made on the control surface. Applies
//!   surface rules (voltage limits, per-mode defaults) and reports changes
//!   with [`Origin::Local`]; the engine debounces and sends those.
//! - [`SceneStore::apply_remote`] for values reported by the device. Stores
//!   the value verbatim and reports [`Origin::Device`]; the engine never sends
//!   those back, which is what keeps inbound updates from echoing.

use serde::Serialize;

use super::fields::{Field, FieldTable, FIELD_COUNT};
use crate::error::{SyncError, SyncResult};

/// Scenes held by the device
pub const SCENE_COUNT: usize = 8;
/// Outputs per scene
pub const OUTPUT_COUNT: usize = 8;

/// Upper limit for `max_voltage` on local edits
pub const MAX_VOLTAGE_LIMIT: f64 = 10.0;
/// Lower limit for `min_voltage` on local edits
pub const MIN_VOLTAGE_LIMIT: f64 = -5.0;

/// Address of a single field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FieldKey {
    pub scene: u8,
    pub output: u8,
    pub field: Field,
}

impl FieldKey {
    /// Build a key from unchecked indices (e.g. straight off the wire)
    pub fn checked(scene: i64, output: i64, field: Field) -> SyncResult<Self> {
        let (scene, output) = check_indices(scene, output)?;
        Ok(Self {
            scene,
            output,
            field,
        })
    }

    /// Wire id of the field
    pub fn hash(&self) -> u32 {
        self.field.hash()
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scene, self.output, self.field)
    }
}

/// Validate a scene index
pub fn check_scene(scene: i64) -> SyncResult<u8> {
    if (0..SCENE_COUNT as i64).contains(&scene) {
        Ok(scene as u8)
    } else {
        Err(SyncError::OutOfRangeIndex {
            what: "scene",
            index: scene,
        })
    }
}

/// Validate a (scene, output) pair
pub fn check_indices(scene: i64, output: i64) -> SyncResult<(u8, u8)> {
    let scene = check_scene(scene)?;
    if !(0..OUTPUT_COUNT as i64).contains(&output) {
        return Err(SyncError::OutOfRangeIndex {
            what: "output",
            index: output,
        });
    }
    Ok((scene, output as u8))
}

/// Where a change originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Control surface edit
    Local,
    /// Reported by the device
    Device,
}

/// One field value that changed
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Change {
    pub key: FieldKey,
    pub old: f64,
    pub new: f64,
    pub origin: Origin,
}

/// Field values of one output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputConfig {
    values: [f64; FIELD_COUNT],
}

impl OutputConfig {
    pub fn get(&self, field: Field) -> f64 {
        self.values[field.index()]
    }

    fn set(&mut self, field: Field, value: f64) {
        self.values[field.index()] = value;
    }

    /// (field, value) pairs in table order
    pub fn iter(&self) -> impl Iterator<Item = (Field, f64)> + '_ {
        Field::ALL.iter().map(move |&f| (f, self.get(f)))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            values: Field::ALL.map(Field::default_value),
        }
    }
}

/// Values the control surface applies when an output's mode changes
fn mode_defaults(mode: f64) -> &'static [(Field, f64)] {
    match mode as i64 {
        0 => &[(Field::Quantization, 0.0)],
        1 => &[
            (Field::Quantization, 1.0),
            (Field::RootNote, 60.0),
            (Field::MinVoltage, 0.0),
            (Field::MaxVoltage, 10.0),
            (Field::Probability, 100.0),
        ],
        4 | 5 => &[(Field::MinVoltage, 0.0)],
        6 => &[(Field::Quantization, 0.0)],
        _ => &[],
    }
}

/// 8 scenes × 8 outputs plus the active scene index
#[derive(Debug, Clone)]
pub struct SceneStore {
    scenes: Vec<Vec<OutputConfig>>,
    active_scene: u8,
    fields: FieldTable,
}

impl SceneStore {
    /// Create a store with power-on defaults
    ///
    /// Fails if the field table has a hash collision.
    pub fn new() -> SyncResult<Self> {
        Ok(Self {
            scenes: vec![vec![OutputConfig::default(); OUTPUT_COUNT]; SCENE_COUNT],
            active_scene: 0,
            fields: FieldTable::build()?,
        })
    }

    pub fn active_scene(&self) -> u8 {
        self.active_scene
    }

    /// Switch the active scene; returns whether it changed
    pub fn set_active_scene(&mut self, scene: u8) -> SyncResult<bool> {
        let scene = check_scene(scene as i64)?;
        let changed = self.active_scene != scene;
        self.active_scene = scene;
        Ok(changed)
    }

    /// Reverse lookup of a wire id
    pub fn field_for_hash(&self, hash: u32) -> Option<Field> {
        self.fields.lookup(hash)
    }

    pub fn output(&self, scene: u8, output: u8) -> Option<&OutputConfig> {
        self.scenes.get(scene as usize)?.get(output as usize)
    }

    pub fn get(&self, key: FieldKey) -> Option<f64> {
        self.output(key.scene, key.output).map(|o| o.get(key.field))
    }

    fn output_mut(&mut self, scene: u8, output: u8) -> SyncResult<&mut OutputConfig> {
        check_indices(scene as i64, output as i64)?;
        Ok(&mut self.scenes[scene as usize][output as usize])
    }

    /// Write a value, reporting a change only when it differs
    fn write(&mut self, key: FieldKey, value: f64, origin: Origin) -> SyncResult<Option<Change>> {
        let output = self.output_mut(key.scene, key.output)?;
        let old = output.get(key.field);
        if old == value {
            return Ok(None);
        }
        output.set(key.field, value);
        Ok(Some(Change {
            key,
            old,
            new: value,
            origin,
        }))
    }

    /// Apply an edit from the control surface
    ///
    /// Returns every field that changed, including limits and mode defaults
    /// applied as a consequence. Empty when the value was already current.
    pub fn set_local(&mut self, key: FieldKey, value: f64) -> SyncResult<Vec<Change>> {
        if !value.is_finite() {
            return Err(SyncError::InvalidValue(value, key.field.name()));
        }

        let value = match key.field {
            Field::MaxVoltage => value.min(MAX_VOLTAGE_LIMIT),
            Field::MinVoltage => value.max(MIN_VOLTAGE_LIMIT),
            _ => value,
        };

        let mut changes = Vec::new();
        let Some(change) = self.write(key, value, Origin::Local)? else {
            return Ok(changes);
        };
        changes.push(change);

        if key.field == Field::Mode {
            for &(field, default) in mode_defaults(value) {
                let target = FieldKey { field, ..key };
                if let Some(change) = self.write(target, default, Origin::Local)? {
                    changes.push(change);
                }
            }
        }

        Ok(changes)
    }

    /// Apply a value reported by the device
    pub fn apply_remote(&mut self, key: FieldKey, value: f64) -> SyncResult<Option<Change>> {
        self.write(key, value, Origin::Device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scene: u8, output: u8, field: Field) -> FieldKey {
        FieldKey {
            scene,
            output,
            field,
        }
    }

    #[test]
    fn test_defaults() {
        let store = SceneStore::new().unwrap();
        assert_eq!(store.active_scene(), 0);
        assert_eq!(store.get(key(7, 7, Field::ClockTempo)), Some(120.0));
        assert_eq!(store.get(key(3, 1, Field::Sustain)), Some(0.7));
    }

    #[test]
    fn test_set_local_reports_change() {
        let mut store = SceneStore::new().unwrap();
        let changes = store.set_local(key(1, 2, Field::Attack), 0.5).unwrap();
        assert_eq!(
            changes,
            vec![Change {
                key: key(1, 2, Field::Attack),
                old: 0.1,
                new: 0.5,
                origin: Origin::Local,
            }]
        );
        assert_eq!(store.get(key(1, 2, Field::Attack)), Some(0.5));
        assert_eq!(store.get(key(1, 3, Field::Attack)), Some(0.1));
    }

    #[test]
    fn test_set_local_unchanged_is_empty() {
        let mut store = SceneStore::new().unwrap();
        assert!(store.set_local(key(0, 0, Field::ClockTempo), 120.0).unwrap().is_empty());
    }

    #[test]
    fn test_voltage_limits() {
        let mut store = SceneStore::new().unwrap();
        store.set_local(key(0, 0, Field::MaxVoltage), 12.0).unwrap();
        assert_eq!(store.get(key(0, 0, Field::MaxVoltage)), Some(10.0));

        store.set_local(key(0, 0, Field::MinVoltage), -9.0).unwrap();
        assert_eq!(store.get(key(0, 0, Field::MinVoltage)), Some(-5.0));
    }

    #[test]
    fn test_mode_defaults_applied() {
        let mut store = SceneStore::new().unwrap();
        let changes = store.set_local(key(2, 4, Field::Mode), 1.0).unwrap();
        let fields: Vec<Field> = changes.iter().map(|c| c.key.field).collect();
        // root_note, max_voltage and probability already hold their defaults
        assert_eq!(
            fields,
            vec![Field::Mode, Field::Quantization, Field::MinVoltage]
        );
        assert_eq!(store.get(key(2, 4, Field::MinVoltage)), Some(0.0));
        assert_eq!(store.get(key(2, 4, Field::Quantization)), Some(1.0));
    }

    #[test]
    fn test_remote_skips_surface_rules() {
        let mut store = SceneStore::new().unwrap();
        let change = store
            .apply_remote(key(0, 0, Field::Mode), 1.0)
            .unwrap()
            .unwrap();
        assert_eq!(change.origin, Origin::Device);
        assert_eq!(store.get(key(0, 0, Field::Quantization)), Some(0.0));

        store.apply_remote(key(0, 0, Field::MaxVoltage), 12.0).unwrap();
        assert_eq!(store.get(key(0, 0, Field::MaxVoltage)), Some(12.0));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut store = SceneStore::new().unwrap();
        assert!(matches!(
            store.set_local(key(0, 0, Field::Decay), f64::NAN),
            Err(SyncError::InvalidValue(_, "decay"))
        ));
    }

    #[test]
    fn test_index_checks() {
        assert!(FieldKey::checked(7, 7, Field::Mode).is_ok());
        assert!(matches!(
            FieldKey::checked(8, 0, Field::Mode),
            Err(SyncError::OutOfRangeIndex { what: "scene", index: 8 })
        ));
        assert!(matches!(
            FieldKey::checked(0, -1, Field::Mode),
            Err(SyncError::OutOfRangeIndex { what: "output", index: -1 })
        ));

        let mut store = SceneStore::new().unwrap();
        assert!(store.set_local(key(9, 0, Field::Mode), 1.0).is_err());
        assert!(store.set_active_scene(8).is_err());
        assert_eq!(store.set_active_scene(3), Ok(true));
        assert_eq!(store.set_active_scene(3), Ok(false));
    }
}
