//! MQTT transports and the arbitration between them.
//!
//! Two independent paths to the broker:
//! - [`eth`] — wired TCP, a plain MQTT client.
//! - [`wifi`] — the co-processor bridge: MQTT terminates on the remote chip
//!   and is driven over the serial RPC link.
//!
//! [`selector`] races both bring-ups and routes all traffic through the
//! first one that reports ready.

use std::sync::mpsc::Sender;

use crate::error::TransportError;

pub mod eth;
pub mod selector;
pub mod wifi;

/// A message that arrived on a subscribed topic, whichever path carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Sink for inbound traffic; both transports push into the same channel so
/// the dispatch layer never knows which path is active.
pub type InboundSink = Sender<InboundMessage>;

/// One path to the broker.
///
/// Implementations are owned by a single thread at a time; the selector
/// hands the winning transport to the workers behind a mutex.
pub trait MqttTransport: Send {
    /// Human-readable path name for logs ("eth", "wifi").
    fn name(&self) -> &'static str;

    /// Open the broker session. The last step of bring-up; probe workers
    /// call this once their path reports ready.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Publish a payload. Errors are transport-family: callers retry.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to a topic filter.
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Give the transport a bounded slice of time to move inbound traffic
    /// into the sink and service its session. Called from the subscribe
    /// worker's loop.
    fn poll(&mut self) -> Result<(), TransportError>;

    /// Tear the session down. Best-effort; errors are logged by callers.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}
