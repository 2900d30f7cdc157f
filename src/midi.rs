//! MIDI framing utilities
//!
//! SysEx framing for the device protocol plus just enough channel-message
//! parsing to describe what auxiliary controllers send.

use std::fmt;

/// Start of System Exclusive
pub const SYSEX_START: u8 = 0xF0;
/// End of System Exclusive
pub const SYSEX_END: u8 = 0xF7;

/// MIDI message types seen on auxiliary inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (1-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Pitch Bend: channel (0-15), value (0-16383, 14-bit)
    PitchBend { channel: u8, value: u16 },

    /// System Exclusive payload (frame bytes stripped)
    SysEx { data: Vec<u8> },

    /// Anything else, kept as its status byte
    Other { status: u8 },
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let status = *data.first()?;

        // Running status is not tracked
        if status < 0x80 {
            return None;
        }

        if status == SYSEX_START {
            let end = data.iter().position(|&b| b == SYSEX_END).unwrap_or(data.len());
            return Some(MidiMessage::SysEx {
                data: data[1..end].to_vec(),
            });
        }

        let channel = status & 0x0F;
        let data1 = data.get(1).map(|b| b & 0x7F);
        let data2 = data.get(2).map(|b| b & 0x7F);

        match (status & 0xF0, data1, data2) {
            (0x80, Some(note), Some(velocity)) => Some(MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            }),
            // Note On with velocity 0 is a Note Off
            (0x90, Some(note), Some(0)) => Some(MidiMessage::NoteOff {
                channel,
                note,
                velocity: 0,
            }),
            (0x90, Some(note), Some(velocity)) => Some(MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            }),
            (0xB0, Some(cc), Some(value)) => Some(MidiMessage::ControlChange {
                channel,
                cc,
                value,
            }),
            (0xE0, Some(lsb), Some(msb)) => Some(MidiMessage::PitchBend {
                channel,
                value: ((msb as u16) << 7) | lsb as u16,
            }),
            _ => Some(MidiMessage::Other { status }),
        }
    }

    pub fn is_sysex(&self) -> bool {
        matches!(self, MidiMessage::SysEx { .. })
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "note_off ch={}, note={}, vel={}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "note_on ch={}, note={}, vel={}", channel + 1, note, velocity)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "cc ch={}, cc={}, value={}", channel + 1, cc, value)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "pitch_bend ch={}, value={}", channel + 1, value)
            }
            MidiMessage::SysEx { ref data } => write!(f, "sysex {} bytes", data.len()),
            MidiMessage::Other { status } => write!(f, "status 0x{:02X}", status),
        }
    }
}

/// Frame an ASCII payload as SysEx, clearing the high bit of every byte
pub fn encode_sysex(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(SYSEX_START);
    frame.extend(payload.bytes().map(|b| b & 0x7F));
    frame.push(SYSEX_END);
    frame
}

/// Extract the ASCII payload from a SysEx frame
///
/// Returns `None` for anything that does not start with the SysEx marker. A
/// missing end marker is tolerated; the payload then runs to the end.
pub fn decode_sysex(frame: &[u8]) -> Option<String> {
    if frame.first() != Some(&SYSEX_START) {
        return None;
    }
    let body = &frame[1..];
    let end = body.iter().position(|&b| b == SYSEX_END).unwrap_or(body.len());
    Some(body[..end].iter().map(|&b| char::from(b & 0x7F)).collect())
}

/// Format MIDI bytes as spaced upper-case hex for logs
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compact lower-case hex, the form shown for an auxiliary input's last message
pub fn compact_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sysex_frames_payload() {
        assert_eq!(
            encode_sysex("v1"),
            vec![0xF0, b'v', b'1', 0xF7]
        );
    }

    #[test]
    fn test_encode_sysex_masks_high_bit() {
        let frame = encode_sysex("é");
        assert_eq!(frame.first(), Some(&SYSEX_START));
        assert_eq!(frame.last(), Some(&SYSEX_END));
        assert!(frame[1..frame.len() - 1].iter().all(|b| b & 0x80 == 0));
    }

    #[test]
    fn test_decode_sysex() {
        let frame = encode_sysex("spark_2_0.5");
        assert_eq!(decode_sysex(&frame).as_deref(), Some("spark_2_0.5"));
        assert_eq!(decode_sysex(&[0x90, 60, 100]), None);
        assert_eq!(decode_sysex(&[0xF0, b'v', b'2']).as_deref(), Some("v2"));
    }

    #[test]
    fn test_note_on_velocity_zero() {
        let msg = MidiMessage::parse(&[0x90, 60, 0]).unwrap();
        assert_eq!(
            msg,
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            }
        );
    }

    #[test]
    fn test_note_on_display() {
        let msg = MidiMessage::parse(&[0x93, 64, 100]).unwrap();
        assert_eq!(msg.to_string(), "note_on ch=4, note=64, vel=100");
    }

    #[test]
    fn test_pitch_bend() {
        let msg = MidiMessage::parse(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(msg, MidiMessage::PitchBend { channel: 0, value: 8192 });
    }

    #[test]
    fn test_sysex_detection() {
        assert!(MidiMessage::parse(&[0xF0, 1, 2, 0xF7]).unwrap().is_sysex());
        assert!(!MidiMessage::parse(&[0xF8]).unwrap().is_sysex());
        assert_eq!(MidiMessage::parse(&[0x40]), None);
    }

    #[test]
    fn test_hex_formats() {
        assert_eq!(format_hex(&[0x90, 0x3C, 0x64]), "90 3C 64");
        assert_eq!(compact_hex(&[0x90, 0x3C, 0x64]), "903c64");
    }
}
