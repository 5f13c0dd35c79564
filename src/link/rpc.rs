//! Command/response RPC with the WiFi co-processor.
//!
//! Every exchange is a SLIP frame carrying one packet:
//!
//! ```text
//! ┌────────┬──────────┬─────────────┬────────┬───────────────────┬───────┐
//! │ opcode │ callback │ return_slot │ argc   │ argc × argument   │ crc16 │
//! │ u16 LE │ u32 LE   │ u32 LE      │ u16 LE │ (u16 len + bytes) │ LE    │
//! └────────┴──────────┴─────────────┴────────┴───────────────────┴───────┘
//! ```
//!
//! Outbound arguments are padded to a 4-byte multiple and the length field
//! carries the padded size; the CRC covers every field in transmission
//! order, padding included. The `callback` field is an opaque token the
//! co-processor echoes back verbatim in unsolicited packets; token 0 means
//! the packet is a synchronous return for the single call in flight.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{ProtocolError, Result, TimeoutError, TransportError};
use crate::link::serial::SerialLink;
use crate::link::{crc, slip};

/// Commands understood by the co-processor firmware.
///
/// The firmware also reserves opcodes 11..=14 for an HTTP client; the
/// gateway never generates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Reset = 1,
    IsReady = 2,
    WifiConnect = 3,
    MqttSetup = 4,
    MqttConnect = 5,
    MqttDisconnect = 6,
    MqttPublish = 7,
    MqttSubscribe = 8,
    MqttLwt = 9,
    /// Inbound only: the co-processor stamps this on the unsolicited
    /// packets that carry broker traffic back to the host.
    MqttEvents = 10,
}

/// Callback token meaning "no callback": the reply is a synchronous return.
pub const NO_CALLBACK: u32 = 0;

/// Pacing for the receive pump while a caller is blocked on a reply.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// A fully parsed and CRC-validated inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u16,
    pub callback: u32,
    pub return_value: u32,
    args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(Vec::as_slice)
    }
}

/// Sequential reader over a packet's length-prefixed arguments.
pub struct ResponseReader<'a> {
    packet: &'a Packet,
    next: usize,
}

impl<'a> ResponseReader<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        Self { packet, next: 0 }
    }

    /// Pop the next argument as raw bytes.
    pub fn pop_bytes(&mut self) -> Option<&'a [u8]> {
        let arg = self.packet.arg(self.next)?;
        self.next += 1;
        Some(arg)
    }

    /// Pop the next argument as a little-endian u32.
    pub fn pop_u32(&mut self) -> Option<u32> {
        let bytes = self.pop_bytes()?;
        let fixed: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(fixed))
    }

    /// Pop the next argument as text, replacing invalid UTF-8.
    pub fn pop_string(&mut self) -> Option<String> {
        self.pop_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Parse a de-framed packet, validating the trailing CRC.
///
/// Inbound argument length fields carry the exact byte count; only the
/// outbound direction pads.
pub fn parse_packet(frame: &[u8]) -> std::result::Result<Packet, ProtocolError> {
    const HEADER: usize = 12;
    if frame.len() < HEADER + 2 {
        return Err(ProtocolError::Truncated {
            offset: frame.len(),
            len: frame.len(),
        });
    }

    let opcode = u16::from_le_bytes([frame[0], frame[1]]);
    let callback = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let return_value = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
    let argc = u16::from_le_bytes([frame[10], frame[11]]);

    let mut computed = crc::compute(0, &frame[..HEADER]);
    let mut offset = HEADER;
    let mut args = Vec::with_capacity(usize::from(argc));

    for _ in 0..argc {
        let Some(len_bytes) = frame.get(offset..offset + 2) else {
            return Err(ProtocolError::BadArgCount { argc });
        };
        let len = usize::from(u16::from_le_bytes([len_bytes[0], len_bytes[1]]));
        let Some(data) = frame.get(offset + 2..offset + 2 + len) else {
            return Err(ProtocolError::BadArgCount { argc });
        };
        computed = crc::compute(computed, len_bytes);
        computed = crc::compute(computed, data);
        args.push(data.to_vec());
        offset += 2 + len;
    }

    let Some(crc_bytes) = frame.get(offset..offset + 2) else {
        return Err(ProtocolError::Truncated {
            offset,
            len: frame.len(),
        });
    };
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if computed != received {
        return Err(ProtocolError::CrcMismatch { computed, received });
    }

    Ok(Packet {
        opcode,
        callback,
        return_value,
        args,
    })
}

/// Resolution slot for the single synchronous call in flight.
#[derive(Debug, Default)]
struct PendingCall {
    resolved: bool,
    opcode: u16,
    value: u32,
}

/// The RPC engine: frames commands out, pumps replies in.
///
/// `&mut self` on every operation enforces one request in flight per link;
/// concurrent users share the engine behind a mutex at the bridge layer, so
/// request byte streams never interleave on the wire.
pub struct CoprocessorRpc<S: SerialLink> {
    link: S,
    decoder: slip::SlipDecoder,
    pending: PendingCall,
    events: VecDeque<Packet>,
}

impl<S: SerialLink> CoprocessorRpc<S> {
    pub fn new(link: S) -> Self {
        Self {
            link,
            decoder: slip::SlipDecoder::new(),
            pending: PendingCall::default(),
            events: VecDeque::new(),
        }
    }

    /// Frame and send one command. Each entry of `args` is the argument's
    /// little-endian byte image; padding to 4-byte multiples happens here.
    pub fn send(
        &mut self,
        opcode: Opcode,
        callback: u32,
        return_slot: u32,
        args: &[&[u8]],
    ) -> std::result::Result<(), TransportError> {
        let argc = args.len() as u16;

        slip::begin_frame(&mut self.link)?;

        let mut acc = 0u16;
        acc = self.write_field(&(opcode as u16).to_le_bytes(), acc)?;
        acc = self.write_field(&callback.to_le_bytes(), acc)?;
        acc = self.write_field(&return_slot.to_le_bytes(), acc)?;
        acc = self.write_field(&argc.to_le_bytes(), acc)?;

        for arg in args {
            let padded = (arg.len() + 3) & !3;
            acc = self.write_field(&(padded as u16).to_le_bytes(), acc)?;
            acc = self.write_field(arg, acc)?;
            for _ in arg.len()..padded {
                acc = self.write_field(&[0u8], acc)?;
            }
        }

        slip::end_frame(&mut self.link, acc)?;
        trace!("rpc: sent {opcode:?} argc={argc}");
        Ok(())
    }

    fn write_field(
        &mut self,
        bytes: &[u8],
        acc: u16,
    ) -> std::result::Result<u16, TransportError> {
        slip::write_all(&mut self.link, bytes)?;
        Ok(crc::compute(acc, bytes))
    }

    /// Drain whatever the serial line has buffered, without blocking.
    ///
    /// Damaged frames are dropped here and never surface to callers; the
    /// protocol has no retransmission, so the caller's timeout is the only
    /// recovery for a lost reply.
    pub fn process(&mut self) -> std::result::Result<(), TransportError> {
        self.pump(Duration::ZERO)
    }

    fn pump(&mut self, read_timeout: Duration) -> std::result::Result<(), TransportError> {
        while let Some(byte) = self.link.try_read_byte(read_timeout)? {
            let Some(frame) = self.decoder.feed_byte(byte) else {
                continue;
            };
            match parse_packet(frame) {
                Ok(packet) => {
                    if packet.callback != NO_CALLBACK {
                        self.events.push_back(packet);
                    } else if packet.argc() == 0 {
                        self.pending.resolved = true;
                        self.pending.opcode = packet.opcode;
                        self.pending.value = packet.return_value;
                    } else {
                        debug!(
                            "rpc: unsolicited packet opcode={} argc={} dropped",
                            packet.opcode,
                            packet.argc()
                        );
                    }
                }
                Err(e) => debug!("rpc: dropping frame: {e}"),
            }
        }
        Ok(())
    }

    /// Next callback-bearing packet, if any arrived.
    pub fn poll_event(&mut self) -> Option<Packet> {
        self.events.pop_front()
    }

    /// Send a command and block until its synchronous return or `timeout`.
    pub fn call_and_wait(
        &mut self,
        opcode: Opcode,
        return_slot: u32,
        args: &[&[u8]],
        timeout: Duration,
    ) -> Result<u32> {
        self.pending = PendingCall::default();
        self.send(opcode, NO_CALLBACK, return_slot, args)?;

        let deadline = Instant::now() + timeout;
        while !self.pending.resolved {
            if Instant::now() >= deadline {
                warn!("rpc: {opcode:?} reply missed {}ms deadline", timeout.as_millis());
                return Err(TimeoutError::Rpc {
                    opcode: opcode as u16,
                    millis: timeout.as_millis() as u64,
                }
                .into());
            }
            self.pump(PUMP_READ_TIMEOUT)?;
        }
        trace!(
            "rpc: {opcode:?} returned {} (echo opcode {})",
            self.pending.value, self.pending.opcode
        );
        Ok(self.pending.value)
    }

    /// Drop any partial frame and queued events (bridge teardown).
    pub fn clear(&mut self) {
        self.decoder.reset();
        self.events.clear();
        self.pending = PendingCall::default();
    }

    pub fn link_mut(&mut self) -> &mut S {
        &mut self.link
    }
}
