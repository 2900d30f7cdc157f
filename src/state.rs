//! State management module - the engine's copy of the device configuration
//!
//! Holds the scene/output field values, the field table used to address them
//! on the wire, and the telemetry history streamed by the device.

mod fields;
mod store;
pub mod telemetry;

pub use fields::{Field, FieldTable, FIELD_COUNT};
pub use store::{
    check_indices, check_scene, Change, FieldKey, Origin, OutputConfig, SceneStore, OUTPUT_COUNT,
    SCENE_COUNT,
};
pub use telemetry::{Telemetry, TELEMETRY_CAPACITY};
