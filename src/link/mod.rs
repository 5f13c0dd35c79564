//! The serial side of the gateway: everything between raw UART bytes and a
//! validated co-processor packet.
//!
//! Layering, bottom up:
//! - [`serial`] — the byte channel port (`SerialLink`) and its UART adapter.
//! - [`crc`] — the firmware's CRC-16 fold.
//! - [`slip`] — frame delimiting and byte escaping.
//! - [`rpc`] — packet build/parse, callback tokens, call-and-wait.

pub mod crc;
pub mod rpc;
pub mod serial;
pub mod slip;

pub use rpc::{CoprocessorRpc, Opcode, Packet, ResponseReader, NO_CALLBACK};
pub use serial::{NullLink, SerialLink, UartLink};
pub use slip::SlipDecoder;
