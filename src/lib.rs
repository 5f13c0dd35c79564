//! Building-services controller gateway.
//!
//! A field controller that keeps an MQTT uplink alive over whichever of
//! two paths comes up first: the wired interface, or a WiFi co-processor
//! driven over a SLIP-framed serial RPC link. A selfping health loop
//! proves the whole path end to end and rebuilds the network stack
//! whenever the probe stops coming back.
//!
//! ```text
//! ┌───────────────────────────── gateway ─────────────────────────────┐
//! │                                                                    │
//! │  sensors ─▶ workers ─▶ active transport ─┬─▶ eth: rumqttc client   │
//! │  outputs ◀─ dispatch ◀─ inbound sink ◀───┤                         │
//! │                 ▲                        └─▶ wifi: SLIP RPC bridge │
//! │          selfping loop                        (co-processor MQTT)  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Layers:
//! - [`link`] — serial port, CRC, SLIP framing, co-processor RPC
//! - [`transport`] — the two MQTT paths and first-ready arbitration
//! - [`supervisor`] — worker threads, selfping, rework
//! - [`dispatch`] — downlink topic routing
//! - [`io`] — sensor and output ports
//! - [`config`] / [`error`] — ambient plumbing

pub mod config;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod link;
pub mod supervisor;
pub mod transport;

pub use config::{Credentials, GatewayConfig};
pub use error::{Error, Result};
