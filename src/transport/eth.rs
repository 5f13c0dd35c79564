//! The wired path: a plain MQTT client over the Ethernet interface.
//!
//! Unlike the WiFi bridge there is no bring-up choreography; the session
//! either opens or it does not. Failed attempts surface as transport
//! errors and the probe worker retries them with a fixed delay.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};

use crate::config::GatewayConfig;
use crate::error::TransportError;
use crate::transport::{InboundMessage, InboundSink, MqttTransport};

/// How long a connect attempt waits for the broker's CONNACK.
const CONNACK_WAIT: Duration = Duration::from_secs(5);
/// Upper bound on one `poll()` call when the session is quiet.
const POLL_WAIT: Duration = Duration::from_millis(100);
/// Request queue depth between the client handle and the event loop.
const REQUEST_CAP: usize = 10;

struct Session {
    client: Client,
    connection: Connection,
}

/// MQTT over the wired interface.
pub struct EthMqttClient {
    cfg: GatewayConfig,
    sink: InboundSink,
    session: Option<Session>,
}

impl EthMqttClient {
    pub fn new(cfg: GatewayConfig, sink: InboundSink) -> Self {
        Self {
            cfg,
            sink,
            session: None,
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }

    fn options(&self) -> MqttOptions {
        let creds = &self.cfg.credentials;
        let mut opts = MqttOptions::new(
            creds.uid.clone(),
            self.cfg.broker_host.clone(),
            self.cfg.broker_port,
        );
        opts.set_keep_alive(Duration::from_secs(u64::from(self.cfg.keepalive_secs)));
        opts.set_credentials(creds.username.clone(), creds.password.clone());
        opts.set_last_will(LastWill::new(
            format!("{}/status", self.cfg.topic_pub_root()),
            "offline",
            QoS::AtMostOnce,
            false,
        ));
        opts
    }

    /// Forward one event-loop notification. Inbound publishes go to the
    /// sink; session errors become transport errors for the caller.
    fn handle_event(
        sink: &InboundSink,
        event: Result<Event, rumqttc::ConnectionError>,
    ) -> Result<Option<Event>, TransportError> {
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if sink.send(msg).is_err() {
                    debug!("eth: inbound sink closed");
                }
                Ok(Some(Event::Incoming(Packet::Publish(publish))))
            }
            Ok(other) => Ok(Some(other)),
            Err(e) => Err(TransportError::BrokerUnreachable(e.to_string())),
        }
    }
}

impl MqttTransport for EthMqttClient {
    fn name(&self) -> &'static str {
        "eth"
    }

    /// One attempt: open the session and wait for CONNACK. The probe
    /// worker owns the retry loop.
    fn connect(&mut self) -> Result<(), TransportError> {
        let (client, mut connection) = Client::new(self.options(), REQUEST_CAP);

        let deadline = Instant::now() + CONNACK_WAIT;
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::BrokerUnreachable(format!(
                    "{}:{}: no CONNACK",
                    self.cfg.broker_host, self.cfg.broker_port
                )));
            }
            match connection.recv_timeout(POLL_WAIT) {
                Ok(event) => match Self::handle_event(&self.sink, event)? {
                    Some(Event::Incoming(Packet::ConnAck(_))) => break,
                    _ => continue,
                },
                Err(rumqttc::RecvTimeoutError::Timeout) => continue,
                Err(rumqttc::RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::NotConnected);
                }
            }
        }

        info!(
            "eth: connected to {}:{}",
            self.cfg.broker_host, self.cfg.broker_port
        );
        self.session = Some(Session { client, connection });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let session = self.session_mut()?;
        session
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let session = self.session_mut()?;
        session
            .client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    fn poll(&mut self) -> Result<(), TransportError> {
        let sink = self.sink.clone();
        let session = self.session_mut()?;
        match session.connection.recv_timeout(POLL_WAIT) {
            Ok(event) => Self::handle_event(&sink, event).map(|_| ()),
            Err(rumqttc::RecvTimeoutError::Timeout) => Ok(()),
            Err(rumqttc::RecvTimeoutError::Disconnected) => {
                Err(TransportError::NotConnected)
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.disconnect() {
                warn!("eth: disconnect: {e}");
            }
        }
        Ok(())
    }
}
