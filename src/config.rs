//! Gateway configuration.
//!
//! All tunable parameters for the gateway daemon. Values come from a JSON
//! file at startup; WiFi credentials can additionally be replaced at runtime
//! by a `config` message on the downlink topic (which triggers a rework).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{InitError, Result};

/// Connection credentials for one up-cycle.
///
/// Immutable for the lifetime of a connection attempt; both transports
/// borrow these, they never copy them. The supervisor replaces them only
/// between cycles, after all workers have stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Device identity; becomes the MQTT client id and the topic suffix.
    pub uid: String,
    /// Broker username.
    pub username: String,
    /// Broker password.
    pub password: String,
    /// WiFi network name for the co-processor path.
    pub ssid: String,
    /// WiFi pre-shared key.
    pub psk: String,
}

/// Core gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub credentials: Credentials,

    // --- Broker ---
    /// MQTT broker hostname or address.
    pub broker_host: String,
    /// MQTT broker port.
    pub broker_port: u16,
    /// MQTT keepalive (seconds).
    pub keepalive_secs: u16,

    // --- Co-processor serial link ---
    /// Serial device carrying the SLIP link (e.g. `/dev/ttyS1`).
    pub serial_device: String,
    /// Serial baud rate.
    pub serial_baud: u32,
    /// Per-call RPC reply deadline (milliseconds).
    pub rpc_timeout_ms: u64,

    // --- Supervision ---
    /// Selfping acknowledgment deadline (seconds).
    pub selfping_timeout_secs: u64,
    /// Pause between selfping cycles (seconds).
    pub selfping_interval_secs: u64,

    // --- Worker pacing ---
    /// Sensor publish period (seconds).
    pub publish_period_secs: u64,
    /// Hardware sampling period (seconds).
    pub sample_period_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials {
                uid: "864-dev".into(),
                username: "admin".into(),
                password: String::new(),
                ssid: "wifi_ssid".into(),
                psk: "wifi_psk".into(),
            },
            broker_host: "broker.local".into(),
            broker_port: 1883,
            keepalive_secs: 30,
            serial_device: "/dev/ttyS1".into(),
            serial_baud: 115_200,
            rpc_timeout_ms: 2000,
            selfping_timeout_secs: 30,
            selfping_interval_secs: 5,
            publish_period_secs: 5,
            sample_period_secs: 1,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| InitError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let cfg = serde_json::from_str(&text).map_err(|e| InitError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(cfg)
    }

    /// Downlink topic root: commands and acks arrive under this prefix.
    pub fn topic_sub_root(&self) -> String {
        format!("/down/bs/{}", self.credentials.uid)
    }

    /// Uplink topic root: readings and probes are published under this prefix.
    pub fn topic_pub_root(&self) -> String {
        format!("/up/bs/{}", self.credentials.uid)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn selfping_timeout(&self) -> Duration {
        Duration::from_secs(self.selfping_timeout_secs)
    }

    pub fn selfping_interval(&self) -> Duration {
        Duration::from_secs(self.selfping_interval_secs)
    }
}
