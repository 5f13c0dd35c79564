//! The WiFi path: MQTT terminated on the co-processor, driven over RPC.
//!
//! Bring-up is a one-way state machine:
//!
//! ```text
//! Idle ──reset──▶ Reset ──▶ ReadyPoll ──▶ WifiAssociate ──▶ WifiConnected
//!                                                               │
//!                Ready ◀── MqttSetup ◀─────────────────────────┘
//! ```
//!
//! `step()` advances at most one state per call and never regresses; only
//! `reset()` returns to `Idle`. There is no failure terminal: a stalled
//! bring-up sits in place until the owner resets it, so a flapping access
//! point can never strand the bridge in a dead state.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{Error, TransportError};
use crate::link::{CoprocessorRpc, Opcode, Packet, ResponseReader, SerialLink};
use crate::transport::{InboundMessage, InboundSink, MqttTransport};

/// Callback tokens handed to the co-processor and echoed back in
/// unsolicited packets. Opaque u32s on the wire; never addresses.
pub mod token {
    pub const WIFI_STATUS: u32 = 1;
    pub const MQTT_CONNECTED: u32 = 2;
    pub const MQTT_DISCONNECTED: u32 = 3;
    pub const MQTT_PUBLISHED: u32 = 4;
    pub const MQTT_DATA: u32 = 5;
}

/// Station status values reported by the co-processor's WiFi stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Idle,
    Connecting,
    WrongPassword,
    NoApFound,
    ConnectFail,
    GotIp,
}

impl WifiStatus {
    fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::WrongPassword,
            3 => Self::NoApFound,
            4 => Self::ConnectFail,
            5 => Self::GotIp,
            _ => return None,
        })
    }
}

/// Bring-up progress. Ordering is the bring-up order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Reset,
    ReadyPoll,
    WifiAssociate,
    WifiConnected,
    MqttSetup,
    Ready,
}

const RESET_SETTLE: Duration = Duration::from_millis(500);
const READY_ATTEMPTS: u8 = 5;
const READY_TIMEOUT: Duration = Duration::from_secs(1);
/// Remote session without TLS; the co-processor firmware offers no cert
/// store worth trusting anyway.
const SECURITY_NONE: u8 = 0;
const CLEAN_SESSION: u8 = 1;

fn into_transport(e: Error) -> TransportError {
    match e {
        Error::Transport(t) => t,
        other => {
            warn!("wifi: link error during bring-up: {other}");
            TransportError::CoprocessorUnreachable
        }
    }
}

/// MQTT-over-RPC bridge to the WiFi co-processor.
pub struct WifiBridge<S: SerialLink> {
    rpc: CoprocessorRpc<S>,
    state: BridgeState,
    ready_attempts: u8,
    /// Session handle returned by MQTT_SETUP; first argument of every MQTT
    /// command after it. Targeting a stale instance silently addresses the
    /// wrong remote session, so this is cleared on every reset.
    remote_instance: Option<u32>,
    wifi_got_ip: bool,
    mqtt_connected: bool,
    sink: InboundSink,
    cfg: GatewayConfig,
}

impl<S: SerialLink> WifiBridge<S> {
    pub fn new(link: S, cfg: GatewayConfig, sink: InboundSink) -> Self {
        Self {
            rpc: CoprocessorRpc::new(link),
            state: BridgeState::Idle,
            ready_attempts: 0,
            remote_instance: None,
            wifi_got_ip: false,
            mqtt_connected: false,
            sink,
            cfg,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BridgeState::Ready
    }

    /// True when the ready poll has exhausted its attempts without an
    /// answer. The owner decides whether to `reset()`.
    pub fn is_stalled(&self) -> bool {
        self.state == BridgeState::ReadyPoll && self.ready_attempts >= READY_ATTEMPTS
    }

    /// Return to `Idle`, discarding the remote session handle and any
    /// partial frame on the link.
    pub fn reset(&mut self) {
        debug!("wifi: bridge reset from {:?}", self.state);
        self.state = BridgeState::Idle;
        self.ready_attempts = 0;
        self.remote_instance = None;
        self.wifi_got_ip = false;
        self.mqtt_connected = false;
        self.rpc.clear();
    }

    /// Advance the bring-up by at most one state.
    pub fn step(&mut self) -> Result<(), TransportError> {
        match self.state {
            BridgeState::Idle => {
                self.rpc.send(Opcode::Reset, 0, 0, &[])?;
                thread::sleep(RESET_SETTLE);
                self.state = BridgeState::Reset;
            }
            BridgeState::Reset => {
                self.ready_attempts = 0;
                self.state = BridgeState::ReadyPoll;
            }
            BridgeState::ReadyPoll => {
                if self.ready_attempts >= READY_ATTEMPTS {
                    return Ok(()); // stalled; owner resets
                }
                self.ready_attempts += 1;
                let timeout = READY_TIMEOUT.min(self.cfg.rpc_timeout());
                match self.rpc.call_and_wait(Opcode::IsReady, 1, &[], timeout) {
                    Ok(v) if v != 0 => {
                        info!("wifi: co-processor ready");
                        self.associate()?;
                        self.state = BridgeState::WifiAssociate;
                    }
                    Ok(_) | Err(Error::Timeout(_)) => {
                        debug!(
                            "wifi: not ready (attempt {}/{})",
                            self.ready_attempts, READY_ATTEMPTS
                        );
                    }
                    Err(e) => return Err(into_transport(e)),
                }
            }
            BridgeState::WifiAssociate => {
                self.drain_events()?;
                if self.wifi_got_ip {
                    info!("wifi: station got IP");
                    self.state = BridgeState::WifiConnected;
                }
            }
            BridgeState::WifiConnected => match self.mqtt_setup() {
                Ok(instance) => {
                    info!("wifi: remote MQTT session {instance}");
                    self.remote_instance = Some(instance);
                    self.state = BridgeState::MqttSetup;
                }
                Err(Error::Timeout(_)) => {
                    debug!("wifi: MQTT_SETUP reply pending");
                }
                Err(e) => return Err(into_transport(e)),
            },
            BridgeState::MqttSetup => {
                let topic = format!("{}/status", self.cfg.topic_pub_root());
                match self.set_lwt(&topic, b"offline", 0, 0) {
                    Ok(()) => self.state = BridgeState::Ready,
                    Err(Error::Timeout(_)) => debug!("wifi: LWT reply pending"),
                    Err(e) => return Err(into_transport(e)),
                }
            }
            BridgeState::Ready => {}
        }
        Ok(())
    }

    fn associate(&mut self) -> Result<(), TransportError> {
        let creds = &self.cfg.credentials;
        self.rpc.send(
            Opcode::WifiConnect,
            token::WIFI_STATUS,
            0,
            &[creds.ssid.as_bytes(), creds.psk.as_bytes()],
        )
    }

    fn mqtt_setup(&mut self) -> crate::error::Result<u32> {
        let creds = self.cfg.credentials.clone();
        let keepalive = self.cfg.keepalive_secs.to_le_bytes();
        let timeout = self.cfg.rpc_timeout();
        self.rpc.call_and_wait(
            Opcode::MqttSetup,
            1,
            &[
                creds.uid.as_bytes(),
                creds.username.as_bytes(),
                creds.password.as_bytes(),
                &keepalive,
                &[CLEAN_SESSION],
                &token::MQTT_CONNECTED.to_le_bytes(),
                &token::MQTT_DISCONNECTED.to_le_bytes(),
                &token::MQTT_PUBLISHED.to_le_bytes(),
                &token::MQTT_DATA.to_le_bytes(),
            ],
            timeout,
        )
    }

    /// Register the broker's last-will message for this session.
    pub fn set_lwt(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: u8,
        retain: u8,
    ) -> crate::error::Result<()> {
        let instance = self.instance()?.to_le_bytes();
        let timeout = self.cfg.rpc_timeout();
        self.rpc.call_and_wait(
            Opcode::MqttLwt,
            1,
            &[&instance, topic.as_bytes(), message, &[qos], &[retain]],
            timeout,
        )?;
        Ok(())
    }

    fn instance(&self) -> Result<u32, TransportError> {
        self.remote_instance
            .ok_or(TransportError::CoprocessorUnreachable)
    }

    /// Pump the link and apply any callback-bearing packets to local state.
    fn drain_events(&mut self) -> Result<(), TransportError> {
        self.rpc.process()?;
        while let Some(packet) = self.rpc.poll_event() {
            self.apply_event(&packet);
        }
        Ok(())
    }

    fn apply_event(&mut self, packet: &Packet) {
        match packet.callback {
            token::WIFI_STATUS => {
                let mut r = ResponseReader::new(packet);
                match r.pop_u32().and_then(WifiStatus::from_wire) {
                    Some(WifiStatus::GotIp) => self.wifi_got_ip = true,
                    Some(status) => debug!("wifi: station status {status:?}"),
                    None => warn!("wifi: unreadable status packet"),
                }
            }
            token::MQTT_CONNECTED => {
                info!("wifi: remote broker session up");
                self.mqtt_connected = true;
            }
            token::MQTT_DISCONNECTED => {
                warn!("wifi: remote broker session lost");
                self.mqtt_connected = false;
            }
            token::MQTT_PUBLISHED => {
                debug!("wifi: publish acknowledged");
            }
            token::MQTT_DATA => {
                let mut r = ResponseReader::new(packet);
                let Some(topic) = r.pop_string() else {
                    warn!("wifi: data packet without topic");
                    return;
                };
                let payload = r.pop_bytes().unwrap_or_default().to_vec();
                if self
                    .sink
                    .send(InboundMessage { topic, payload })
                    .is_err()
                {
                    debug!("wifi: inbound sink closed");
                }
            }
            other => debug!("wifi: unknown callback token {other}"),
        }
    }
}

impl<S: SerialLink + Send> MqttTransport for WifiBridge<S> {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let instance = self.instance()?.to_le_bytes();
        let host = self.cfg.broker_host.clone();
        let port = u32::from(self.cfg.broker_port).to_le_bytes();
        self.rpc.send(
            Opcode::MqttConnect,
            0,
            0,
            &[&instance, host.as_bytes(), &port, &[SECURITY_NONE]],
        )?;

        // Confirmation arrives as a connected-event, not a return.
        let deadline = std::time::Instant::now() + self.cfg.rpc_timeout();
        while !self.mqtt_connected {
            if std::time::Instant::now() >= deadline {
                return Err(TransportError::BrokerUnreachable(format!(
                    "{}:{} via wifi",
                    self.cfg.broker_host, self.cfg.broker_port
                )));
            }
            self.drain_events()?;
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let instance = self.instance()?.to_le_bytes();
        let len = (payload.len() as u16).to_le_bytes();
        self.rpc
            .send(
                Opcode::MqttPublish,
                0,
                0,
                &[&instance, topic.as_bytes(), payload, &len, &[0], &[0]],
            )
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let instance = self.instance()?.to_le_bytes();
        self.rpc
            .send(Opcode::MqttSubscribe, 0, 0, &[&instance, topic.as_bytes(), &[0]])
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    fn poll(&mut self) -> Result<(), TransportError> {
        self.drain_events()
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let instance = self.instance()?.to_le_bytes();
        self.rpc.send(Opcode::MqttDisconnect, 0, 0, &[&instance])?;
        self.mqtt_connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{crc, NullLink};
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Scripted serial double. Each reply is armed against a request
    /// ordinal and only becomes readable after that many complete request
    /// frames have been written, mirroring a device that answers what it
    /// was asked. Ordinal 0 releases immediately (unsolicited events).
    struct ScriptedLink {
        written: Vec<u8>,
        requests_seen: usize,
        scripted: Vec<(usize, Vec<u8>)>,
        readable: VecDeque<u8>,
    }

    impl ScriptedLink {
        fn new() -> Self {
            Self {
                written: Vec::new(),
                requests_seen: 0,
                scripted: Vec::new(),
                readable: VecDeque::new(),
            }
        }

        fn slip_encode(payload: &[u8]) -> Vec<u8> {
            let mut out = vec![0x7E];
            for &b in payload {
                match b {
                    0x7D..=0x7F => {
                        out.push(0x7D);
                        out.push(b ^ 0x20);
                    }
                    _ => out.push(b),
                }
            }
            out.push(0x7F);
            out
        }

        fn respond_after(
            &mut self,
            after_request: usize,
            opcode: u16,
            callback: u32,
            ret: u32,
            args: &[&[u8]],
        ) {
            let mut p = Vec::new();
            p.extend_from_slice(&opcode.to_le_bytes());
            p.extend_from_slice(&callback.to_le_bytes());
            p.extend_from_slice(&ret.to_le_bytes());
            p.extend_from_slice(&(args.len() as u16).to_le_bytes());
            for a in args {
                p.extend_from_slice(&(a.len() as u16).to_le_bytes());
                p.extend_from_slice(a);
            }
            let c = crc::compute(0, &p);
            p.extend_from_slice(&c.to_le_bytes());
            self.scripted.push((after_request, Self::slip_encode(&p)));
        }

        fn release_due(&mut self) {
            let due = self.requests_seen;
            let mut i = 0;
            while i < self.scripted.len() {
                if self.scripted[i].0 <= due {
                    let (_, bytes) = self.scripted.remove(i);
                    self.readable.extend(bytes);
                } else {
                    i += 1;
                }
            }
        }
    }

    impl SerialLink for ScriptedLink {
        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(data);
            // A lone raw 0x7F closes a request frame; escaped 0x7F arrives
            // as a two-byte slice and never matches.
            if data == [0x7F] {
                self.requests_seen += 1;
                self.release_due();
            }
            Ok(())
        }

        fn try_read_byte(&mut self, _t: Duration) -> Result<Option<u8>, TransportError> {
            self.release_due();
            Ok(self.readable.pop_front())
        }
    }

    fn bridge_with(link: ScriptedLink) -> (WifiBridge<ScriptedLink>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel();
        let mut cfg = GatewayConfig::default();
        cfg.rpc_timeout_ms = 50; // keep test-side waits short
        (WifiBridge::new(link, cfg, tx), rx)
    }

    #[test]
    fn step_advances_at_most_one_state() {
        let mut link = ScriptedLink::new();
        link.respond_after(2, 2, 0, 1, &[]); // IsReady → 1
        let (mut b, _rx) = bridge_with(link);

        assert_eq!(b.state(), BridgeState::Idle);
        b.step().unwrap();
        assert_eq!(b.state(), BridgeState::Reset);
        b.step().unwrap();
        assert_eq!(b.state(), BridgeState::ReadyPoll);
        b.step().unwrap();
        assert_eq!(b.state(), BridgeState::WifiAssociate);
    }

    #[test]
    fn ready_poll_exhausts_then_stalls() {
        // A dead device: NullLink accepts writes and never answers.
        let (tx, _rx) = mpsc::channel();
        let mut cfg = GatewayConfig::default();
        cfg.rpc_timeout_ms = 50;
        let mut b = WifiBridge::new(NullLink, cfg, tx);
        b.step().unwrap(); // Idle → Reset
        b.step().unwrap(); // Reset → ReadyPoll
        for _ in 0..READY_ATTEMPTS {
            b.step().unwrap();
            assert_eq!(b.state(), BridgeState::ReadyPoll);
        }
        assert!(b.is_stalled());
        b.step().unwrap(); // stalled steps are inert
        assert_eq!(b.state(), BridgeState::ReadyPoll);
        b.reset();
        assert_eq!(b.state(), BridgeState::Idle);
        assert!(!b.is_stalled());
    }

    #[test]
    fn got_ip_event_moves_past_association() {
        let mut link = ScriptedLink::new();
        link.respond_after(2, 2, 0, 1, &[]); // IsReady
        link.respond_after(3, 3, token::WIFI_STATUS, 0, &[&5u32.to_le_bytes()]); // GotIp
        let (mut b, _rx) = bridge_with(link);
        for _ in 0..3 {
            b.step().unwrap();
        }
        assert_eq!(b.state(), BridgeState::WifiAssociate);
        b.step().unwrap();
        assert_eq!(b.state(), BridgeState::WifiConnected);
    }

    #[test]
    fn full_bringup_retains_remote_instance() {
        let mut link = ScriptedLink::new();
        link.respond_after(2, 2, 0, 1, &[]); // IsReady
        link.respond_after(3, 3, token::WIFI_STATUS, 0, &[&5u32.to_le_bytes()]);
        link.respond_after(4, 4, 0, 0x4242, &[]); // MQTT_SETUP → instance
        link.respond_after(5, 9, 0, 1, &[]); // LWT ack
        let (mut b, _rx) = bridge_with(link);
        for _ in 0..6 {
            b.step().unwrap();
        }
        assert_eq!(b.state(), BridgeState::Ready);
        assert_eq!(b.remote_instance, Some(0x4242));
    }

    #[test]
    fn data_event_reaches_the_sink() {
        let mut link = ScriptedLink::new();
        link.respond_after(
            0,
            10,
            token::MQTT_DATA,
            0,
            &[b"/down/bs/864-dev/selfping", b"p"],
        );
        let (mut b, rx) = bridge_with(link);
        b.poll().unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "/down/bs/864-dev/selfping");
        assert_eq!(msg.payload, b"p");
    }

    #[test]
    fn publish_without_session_fails() {
        let (mut b, _rx) = bridge_with(ScriptedLink::new());
        assert!(b.publish("/up/bs/x", b"1").is_err());
    }

    #[test]
    fn reset_frame_bytes_are_exact() {
        let (mut b, _rx) = bridge_with(ScriptedLink::new());
        b.step().unwrap(); // Idle: sends RESET

        // opcode 0x0001 then eleven zero header bytes, escaped CRC, end.
        let mut expected = vec![0x7E, 0x01];
        expected.extend_from_slice(&[0x00; 11]);
        let mut header = [0u8; 12];
        header[0] = 0x01;
        let c = crc::compute(0, &header);
        for b in c.to_le_bytes() {
            match b {
                0x7D..=0x7F => {
                    expected.push(0x7D);
                    expected.push(b ^ 0x20);
                }
                _ => expected.push(b),
            }
        }
        expected.push(0x7F);
        assert_eq!(b.rpc.link_mut().written, expected);
    }
}
