//! SLIP framing for the co-processor serial link.
//!
//! Wire format:
//! ```text
//! ┌──────┬──────────────────────────────────────┬──────┐
//! │ 0x7E │ payload, reserved bytes escaped as   │ 0x7F │
//! │ START│ 0x7D, byte ^ 0x20                    │ END  │
//! └──────┴──────────────────────────────────────┴──────┘
//! ```
//!
//! Frame delimiters are written raw; every payload byte equal to START,
//! END or the escape marker itself is replaced by the two-byte escape
//! sequence. Bytes arriving outside a frame are co-processor boot log
//! characters and never touch protocol state.

use heapless::Vec;
use log::trace;

use crate::error::TransportError;
use crate::link::serial::SerialLink;

/// Frame start marker.
pub const START: u8 = 0x7E;
/// Frame end marker.
pub const END: u8 = 0x7F;
/// Escape marker.
pub const ESC: u8 = 0x7D;
/// XOR applied to an escaped byte.
pub const ESC_XOR: u8 = 0x20;

/// Receive buffer capacity. A full MQTT_SETUP reply fits with headroom;
/// anything longer is silently truncated (known lossy condition — the
/// protocol offers no backpressure).
pub const MAX_FRAME: usize = 512;

// ── Writer side ──────────────────────────────────────────────

/// Emit the frame start marker, unescaped.
pub fn begin_frame<S: SerialLink>(link: &mut S) -> Result<(), TransportError> {
    link.write_all(&[START])
}

/// Emit one payload byte, escaping reserved values.
pub fn write_byte<S: SerialLink>(link: &mut S, byte: u8) -> Result<(), TransportError> {
    match byte {
        START | END | ESC => link.write_all(&[ESC, byte ^ ESC_XOR]),
        _ => link.write_all(&[byte]),
    }
}

/// Emit a run of payload bytes, escaping each.
pub fn write_all<S: SerialLink>(link: &mut S, data: &[u8]) -> Result<(), TransportError> {
    for &b in data {
        write_byte(link, b)?;
    }
    Ok(())
}

/// Emit the trailing CRC (escaped, little-endian) and the end marker.
pub fn end_frame<S: SerialLink>(link: &mut S, crc: u16) -> Result<(), TransportError> {
    write_all(link, &crc.to_le_bytes())?;
    link.write_all(&[END])
}

// ── Reader side ──────────────────────────────────────────────

/// Streaming SLIP decoder.
///
/// Feed raw serial bytes one at a time; a completed frame payload is
/// returned when the end marker arrives. The returned slice is valid until
/// the next call to [`feed_byte`](Self::feed_byte).
pub struct SlipDecoder {
    buf: Vec<u8, MAX_FRAME>,
    escaped: bool,
    in_frame: bool,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            escaped: false,
            in_frame: false,
        }
    }

    /// Feed one raw byte. Returns the accumulated payload when this byte
    /// closed a frame.
    pub fn feed_byte(&mut self, byte: u8) -> Option<&[u8]> {
        match byte {
            ESC => {
                self.escaped = true;
                None
            }
            START => {
                self.buf.clear();
                self.escaped = false;
                self.in_frame = true;
                None
            }
            END => {
                if self.in_frame {
                    self.in_frame = false;
                    Some(&self.buf)
                } else {
                    // Stray end marker in boot noise.
                    None
                }
            }
            mut b => {
                if self.escaped {
                    b ^= ESC_XOR;
                    self.escaped = false;
                }
                if self.in_frame {
                    // Overflow drops the byte; the damaged frame will then
                    // fail its CRC and be discarded upstream.
                    let _ = self.buf.push(b);
                } else {
                    // Out-of-frame traffic is the co-processor's boot log.
                    trace!("coproc: {}", b as char);
                }
                None
            }
        }
    }

    /// Discard partial state (e.g. after a bridge teardown).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.escaped = false;
        self.in_frame = false;
    }
}
