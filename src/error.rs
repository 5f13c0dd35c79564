//! Unified error taxonomy for the gateway.
//!
//! Four families, each with its own recovery contract:
//!
//! - [`TransportError`] — link or peer unreachable. Retried forever with a
//!   fixed delay; never escalated past the owning worker.
//! - [`ProtocolError`] — a damaged frame on the co-processor link. The frame
//!   is dropped and reading continues; the protocol has no retransmission
//!   handshake, so the caller's timeout is the only recovery.
//! - [`TimeoutError`] — an RPC reply missed its deadline. Recovery is
//!   caller-specific: state machines hold position and retry. A missed
//!   liveness deadline is not an error; the supervisor ends the cycle.
//! - [`InitError`] — a device or resource could not be brought up. Aborts
//!   the owning worker only; the supervisor's outer loop restarts the cycle.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every fallible operation in the gateway funnels into this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("timeout: {0}")]
    Timeout(#[from] TimeoutError),
    #[error("init: {0}")]
    Init(#[from] InitError),
}

/// Link-level failures: the peer exists but cannot currently be reached.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),
    #[error("co-processor not responding")]
    CoprocessorUnreachable,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("serial write failed: {0}")]
    SerialWrite(String),
    #[error("no transport is active")]
    NotConnected,
}

/// Damaged or malformed frames on the SLIP link.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("CRC mismatch (computed {computed:#06x}, received {received:#06x})")]
    CrcMismatch { computed: u16, received: u16 },
    #[error("frame truncated at {offset} of {len} bytes")]
    Truncated { offset: usize, len: usize },
    #[error("argument count {argc} exceeds frame contents")]
    BadArgCount { argc: u16 },
}

/// A deadline expired.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("RPC opcode {opcode} timed out after {millis}ms")]
    Rpc { opcode: u16, millis: u64 },
}

/// Bring-up failures.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot open serial device {device}: {source}")]
    SerialOpen {
        device: String,
        #[source]
        source: serialport::Error,
    },
    #[error("cannot load config {path}: {reason}")]
    Config { path: String, reason: String },
}
