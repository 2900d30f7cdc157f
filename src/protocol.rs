//! Payload grammar
//!
//! All payloads are ASCII strings carried inside a SysEx frame (see
//! [`crate::midi::encode_sysex`]). Fields are joined by underscores:
//!
//! | payload | meaning |
//! |---|---|
//! | `<scene>_<output>_<hash>_<value>` | field update (either direction) |
//! | `<scene>_<output>_<hash>` | field query, answered with an update |
//! | `0_0_<hash("scene")>_<n>` | select scene `n` |
//! | `0_0_<hash("scene")>` | ask the device for its active scene |
//! | `v<token>` | heartbeat / version |
//! | `spark_<index>_<value>` | telemetry sample |
//! | `diskmode1` | reboot the device into its bootloader |

use std::fmt;

use crate::error::{SyncError, SyncResult};
use crate::hash::hash_djb;

/// Wire id of the scene selector pseudo-field
pub const SCENE_HASH: u32 = hash_djb(b"scene");

/// Heartbeat probe sent by the liveness monitor
pub const VERSION_PROBE: &str = "version0";

/// Reset command, never acknowledged
pub const DISK_MODE: &str = "diskmode1";

/// Significant digits used for field values on the wire
pub const VALUE_PRECISION: usize = 4;

/// A four-field update as read off the wire, before range checks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireUpdate {
    pub scene: i64,
    pub output: i64,
    pub hash: u32,
    pub value: f64,
}

/// A decoded inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `v...` heartbeat or version reply
    Version(String),
    /// `spark_<index>_<value>`
    Telemetry { index: usize, value: f64 },
    /// Four-field update, including scene selects
    Update(WireUpdate),
    /// Anything else: device console output
    Unrecognized(String),
}

impl Inbound {
    /// Parse a payload string
    ///
    /// Only telemetry and four-field updates can fail; any other shape is
    /// returned as [`Inbound::Unrecognized`].
    pub fn parse(payload: &str) -> SyncResult<Self> {
        if payload.starts_with('v') {
            return Ok(Inbound::Version(payload.to_string()));
        }

        if let Some(rest) = payload.strip_prefix("spark_") {
            return parse_telemetry(rest).map(|(index, value)| Inbound::Telemetry { index, value });
        }

        // Firmware echoes use spaces, the host uses underscores
        let fields: Vec<&str> = payload
            .split(|c: char| c == '_' || c.is_ascii_whitespace())
            .filter(|s| !s.is_empty())
            .collect();

        let numeric = payload.starts_with(|c: char| c.is_ascii_digit() || c == '-');
        if numeric && fields.len() == 4 {
            return parse_update(&fields).map(Inbound::Update);
        }

        Ok(Inbound::Unrecognized(payload.to_string()))
    }
}

fn parse_telemetry(rest: &str) -> SyncResult<(usize, f64)> {
    let malformed = || SyncError::MalformedMessage(format!("spark_{}", rest));

    let mut parts = rest.split('_');
    let index: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    let value = parts.next().and_then(parse_finite).ok_or_else(malformed)?;

    if index >= 8 {
        return Err(SyncError::OutOfRangeIndex {
            what: "telemetry",
            index: index as i64,
        });
    }
    Ok((index, value))
}

fn parse_update(fields: &[&str]) -> SyncResult<WireUpdate> {
    let malformed = || SyncError::MalformedMessage(fields.join("_"));

    Ok(WireUpdate {
        scene: fields[0].parse().map_err(|_| malformed())?,
        output: fields[1].parse().map_err(|_| malformed())?,
        hash: fields[2].parse().map_err(|_| malformed())?,
        value: parse_finite(fields[3]).ok_or_else(malformed)?,
    })
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// A payload the host sends to the device
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Set a field value
    Update {
        scene: u8,
        output: u8,
        hash: u32,
        value: f64,
    },
    /// Ask for a field's current value
    Query { scene: u8, output: u8, hash: u32 },
    /// Switch the device to another scene
    SceneSelect { scene: u8 },
    /// Ask which scene is active
    SceneQuery,
    /// Liveness probe
    VersionProbe,
    /// Reset into bootloader
    DiskMode,
}

impl Outbound {
    /// Render the ASCII payload
    pub fn payload(&self) -> String {
        match *self {
            Outbound::Update {
                scene,
                output,
                hash,
                value,
            } => format!(
                "{}_{}_{}_{}",
                scene,
                output,
                hash,
                format_precision(value, VALUE_PRECISION)
            ),
            Outbound::Query { scene, output, hash } => format!("{}_{}_{}", scene, output, hash),
            Outbound::SceneSelect { scene } => format!("0_0_{}_{}", SCENE_HASH, scene),
            Outbound::SceneQuery => format!("0_0_{}", SCENE_HASH),
            Outbound::VersionProbe => VERSION_PROBE.to_string(),
            Outbound::DiskMode => DISK_MODE.to_string(),
        }
    }

    /// Whether the device answers this message with a four-field update
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Outbound::VersionProbe | Outbound::DiskMode)
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload())
    }
}

/// Significant digits needed to write any f64 out exactly
const EXACT_DIGITS: usize = 767;

/// Format a number with `digits` significant digits
///
/// Matches ECMAScript `Number.prototype.toPrecision`, which the firmware's
/// parser was written against: fixed notation while the decimal exponent is
/// within `[-6, digits)`, otherwise `d.ddde±x`. Exact halfway values round
/// away from zero.
pub fn format_precision(value: f64, digits: usize) -> String {
    let digits = digits.clamp(1, EXACT_DIGITS);

    if !value.is_finite() {
        return value.to_string();
    }
    if value == 0.0 {
        return format!("{:.*}", digits - 1, 0.0);
    }

    // Full decimal expansion; std rounding is only reached past the last real digit
    let exact = format!("{:.*e}", EXACT_DIGITS, value.abs());
    let (mantissa, exponent) = exact.split_once('e').unwrap_or((exact.as_str(), "0"));
    let mut exponent = exponent.parse::<i32>().unwrap_or(0);
    let expansion: Vec<u8> = mantissa.bytes().filter(u8::is_ascii_digit).collect();

    let mut kept = expansion[..digits.min(expansion.len())].to_vec();
    if expansion.get(digits).is_some_and(|&d| d >= b'5') && round_up(&mut kept) {
        exponent += 1;
    }
    let kept: String = kept.into_iter().map(char::from).collect();

    let body = if exponent < -6 || exponent >= digits as i32 {
        let (lead, rest) = kept.split_at(1);
        let sign = if exponent < 0 { '-' } else { '+' };
        if rest.is_empty() {
            format!("{}e{}{}", lead, sign, exponent.abs())
        } else {
            format!("{}.{}e{}{}", lead, rest, sign, exponent.abs())
        }
    } else if exponent >= 0 {
        let (int, frac) = kept.split_at(exponent as usize + 1);
        if frac.is_empty() {
            int.to_string()
        } else {
            format!("{}.{}", int, frac)
        }
    } else {
        format!("0.{}{}", "0".repeat((-exponent - 1) as usize), kept)
    };

    if value < 0.0 {
        format!("-{}", body)
    } else {
        body
    }
}

/// Add one unit in the last place; true when the digits carried over into a new one
fn round_up(digits: &mut [u8]) -> bool {
    for d in digits.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return false;
        }
    }
    if let Some(first) = digits.first_mut() {
        *first = b'1';
    }
    true
}
