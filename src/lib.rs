//! yocto-sync - configuration sync for yoctocore-family CV modules
//!
//! Keeps a host-side copy of the device's scenes in step with the hardware
//! over MIDI SysEx: hashed field addressing, debounced and acknowledged
//! updates, loop-free application of device reports, and liveness
//! detection with automatic rediscovery.

pub mod cli;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod hash;
pub mod midi;
pub mod paths;
pub mod protocol;
pub mod state;

pub use engine::{EngineHandle, EngineSettings, SyncEngine};
pub use error::{SyncError, SyncResult};
