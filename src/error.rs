//! Error taxonomy for the sync protocol
//!
//! Every variant here is recovered locally by the engine: logged, then the
//! message is dropped or the delivery abandoned. Application plumbing
//! (config, port enumeration) uses `anyhow` instead.

use thiserror::Error;

/// Protocol and transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// No port matching the device family is present
    #[error("no device found: {0}")]
    TransportUnavailable(String),

    /// A delivery exhausted its attempts without a reply
    #[error("no acknowledgement for '{payload}' after {attempts} attempts")]
    AcknowledgementTimeout { payload: String, attempts: u8 },

    /// Wrong field count or a field that does not parse as a number
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Parameter hash does not name any field of the addressed output
    #[error("unknown parameter hash {hash} for scene {scene} output {output}")]
    UnknownParameterHash { scene: u8, output: u8, hash: u32 },

    /// Scene or output index outside [0, 7]
    #[error("{what} index {index} out of range")]
    OutOfRangeIndex { what: &'static str, index: i64 },

    /// Two field names reduce to the same wire id
    #[error("hash collision: '{first}' and '{second}' both hash to {hash}")]
    HashCollision {
        first: &'static str,
        second: &'static str,
        hash: u32,
    },

    /// Locally supplied value cannot be represented on the wire
    #[error("invalid value {0} for field '{1}'")]
    InvalidValue(f64, &'static str),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
