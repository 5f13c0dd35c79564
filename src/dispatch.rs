//! Routing for messages arriving on the downlink topic tree.
//!
//! Subtopics under `/down/bs/<uid>`:
//! - `output/<NAME>` — drive a relay (`on`/`off`) or a PWM duty value
//! - `config[/...]`  — update WiFi credentials, then rework the network
//! - `selfping`      — the gateway's own liveness probe coming back

use log::{info, warn};
use serde::Deserialize;

use crate::io::OutputPort;
use crate::transport::InboundMessage;

/// What the supervisor should do after a message was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Applied locally, nothing further.
    Handled,
    /// The selfping probe returned.
    SelfPingAck,
    /// Credentials changed; tear the network down and rebuild it.
    Rework(CredentialUpdate),
    /// Unknown or malformed; logged and dropped.
    Ignored,
}

/// Fields a remote config message may replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CredentialUpdate {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

impl CredentialUpdate {
    pub fn is_empty(&self) -> bool {
        self.ssid.is_none() && self.password.is_none()
    }
}

/// Parse a config payload.
///
/// Two accepted shapes: the legacy comma form `ssid=<name>,password=<psk>`
/// and a JSON object with the same optional fields.
pub fn parse_config_update(payload: &str) -> Option<CredentialUpdate> {
    if let Some(rest) = payload.strip_prefix("ssid=") {
        let mut update = CredentialUpdate::default();
        let mut parts = rest.splitn(2, ',');
        update.ssid = parts.next().map(str::to_string).filter(|s| !s.is_empty());
        if let Some(pw) = parts.next().and_then(|p| p.strip_prefix("password=")) {
            update.password = Some(pw.to_string());
        }
        return Some(update).filter(|u| !u.is_empty());
    }
    serde_json::from_str::<CredentialUpdate>(payload)
        .ok()
        .filter(|u| !u.is_empty())
}

/// Routes inbound messages to the output port and the supervisor.
pub struct Dispatcher {
    sub_root: String,
}

impl Dispatcher {
    pub fn new(sub_root: String) -> Self {
        Self { sub_root }
    }

    pub fn handle(&self, msg: &InboundMessage, outputs: &mut dyn OutputPort) -> Outcome {
        let Some(subtopic) = msg
            .topic
            .strip_prefix(&self.sub_root)
            .map(|s| s.trim_start_matches('/'))
        else {
            warn!("dispatch: topic outside downlink root: {}", msg.topic);
            return Outcome::Ignored;
        };
        let payload = String::from_utf8_lossy(&msg.payload);

        let mut parts = subtopic.splitn(2, '/');
        match parts.next() {
            Some("output") => {
                let Some(name) = parts.next() else {
                    warn!("dispatch: output without a name");
                    return Outcome::Ignored;
                };
                self.drive_output(name, &payload, outputs)
            }
            Some("config") => match parse_config_update(&payload) {
                Some(update) => {
                    info!("dispatch: credentials update, network rework requested");
                    Outcome::Rework(update)
                }
                None => {
                    warn!("dispatch: unreadable config payload");
                    Outcome::Ignored
                }
            },
            Some("selfping") => Outcome::SelfPingAck,
            other => {
                warn!("dispatch: unsupported subtopic {other:?}");
                Outcome::Ignored
            }
        }
    }

    fn drive_output(&self, name: &str, act: &str, outputs: &mut dyn OutputPort) -> Outcome {
        if name.starts_with("RELAY") {
            let on = match act {
                "on" => true,
                "off" => false,
                _ => {
                    warn!("dispatch: unsupported relay act {act:?}");
                    return Outcome::Ignored;
                }
            };
            if outputs.set_relay(name, on) {
                info!("dispatch: {name} -> {act}");
                return Outcome::Handled;
            }
        } else if name.starts_with("PWM") {
            if let Ok(duty) = act.trim().parse::<u8>() {
                if outputs.set_pwm(name, duty) {
                    info!("dispatch: {name} -> {duty}%");
                    return Outcome::Handled;
                }
            } else {
                warn!("dispatch: bad PWM duty {act:?}");
                return Outcome::Ignored;
            }
        }
        warn!("dispatch: unknown output {name:?}");
        Outcome::Ignored
    }
}
