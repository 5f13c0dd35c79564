//! Races both transport bring-ups and picks the first to finish.
//!
//! One probe worker per path runs on its own thread and deposits its
//! transport into a slot once the path is connected end to end. The
//! selector polls the Ethernet slot before the WiFi slot on every pass,
//! so a same-tick tie always resolves to the wired path. Arbitration is
//! one-shot: the result holds until the health supervisor tears the world
//! down and runs it again.

use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::link::SerialLink;
use crate::transport::eth::EthMqttClient;
use crate::transport::wifi::WifiBridge;
use crate::transport::{InboundSink, MqttTransport};

/// Pacing between probe attempts.
const PROBE_RETRY: Duration = Duration::from_secs(1);
/// Pacing of the arbitration poll loop.
const ARBITRATE_TICK: Duration = Duration::from_millis(100);
/// Reachability TCP connect deadline.
const REACH_TIMEOUT: Duration = Duration::from_secs(2);

/// Which path won arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Eth,
    Wifi,
}

/// Network-side readiness checks for the wired interface.
///
/// The wired path has no co-processor to interrogate, so readiness is
/// judged from the host's own network state: an address first, then a
/// route that actually reaches the broker.
pub trait NetProbe: Send {
    fn has_ip(&mut self) -> bool;
    fn internet_reachable(&mut self) -> bool;
}

/// Default probe: routing-table source address plus a bounded TCP connect
/// against the broker itself.
pub struct TcpProbe {
    host: String,
    port: u16,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    fn target(&self) -> Option<std::net::SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()?
            .next()
    }
}

impl NetProbe for TcpProbe {
    /// A UDP connect sends nothing but makes the kernel pick a source
    /// address from the routing table; an unspecified or loopback answer
    /// means DHCP has not delivered yet.
    fn has_ip(&mut self) -> bool {
        let Some(target) = self.target() else {
            return false;
        };
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
            return false;
        };
        if socket.connect(target).is_err() {
            return false;
        }
        match socket.local_addr() {
            Ok(addr) => !addr.ip().is_unspecified() && !addr.ip().is_loopback(),
            Err(_) => false,
        }
    }

    fn internet_reachable(&mut self) -> bool {
        let Some(target) = self.target() else {
            return false;
        };
        TcpStream::connect_timeout(&target, REACH_TIMEOUT).is_ok()
    }
}

/// The winner, ready for traffic.
pub struct SelectedTransport {
    pub kind: PathKind,
    pub transport: Box<dyn MqttTransport>,
}

type Slot = Arc<Mutex<Option<Box<dyn MqttTransport>>>>;

/// Owns the probe workers and the two deposit slots.
pub struct TransportSelector {
    eth_slot: Slot,
    wifi_slot: Slot,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSelector {
    pub fn new() -> Self {
        Self {
            eth_slot: Arc::new(Mutex::new(None)),
            wifi_slot: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Start the wired probe worker: wait for an address, then for broker
    /// reachability, then connect. Transport errors retry forever.
    pub fn spawn_eth(
        &mut self,
        cfg: GatewayConfig,
        sink: InboundSink,
        mut probe: Box<dyn NetProbe>,
    ) {
        let slot = Arc::clone(&self.eth_slot);
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("probe-eth".into())
            .spawn(move || {
                let mut transport = EthMqttClient::new(cfg, sink);
                while !stop.load(Ordering::Acquire) {
                    if !probe.has_ip() {
                        debug!("eth probe: waiting for address");
                    } else if !probe.internet_reachable() {
                        debug!("eth probe: address up, broker unreachable");
                    } else {
                        match transport.connect() {
                            Ok(()) => {
                                deposit(&slot, Box::new(transport));
                                return;
                            }
                            Err(e) => warn!("eth probe: connect failed: {e}"),
                        }
                    }
                    thread::sleep(PROBE_RETRY);
                }
                debug!("eth probe: cancelled");
            });
        match handle {
            Ok(h) => self.handles.push(h),
            Err(e) => warn!("selector: cannot spawn eth probe: {e}"),
        }
    }

    /// Start the WiFi probe worker: drive the bridge state machine until
    /// ready, resetting it whenever the ready poll stalls, then connect.
    pub fn spawn_wifi<S: SerialLink + Send + 'static>(&mut self, mut bridge: WifiBridge<S>) {
        let slot = Arc::clone(&self.wifi_slot);
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("probe-wifi".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if bridge.is_stalled() {
                        warn!("wifi probe: ready poll exhausted, resetting bridge");
                        bridge.reset();
                    }
                    if let Err(e) = bridge.step() {
                        warn!("wifi probe: {e}");
                        bridge.reset();
                        thread::sleep(PROBE_RETRY);
                        continue;
                    }
                    if bridge.is_ready() {
                        match bridge.connect() {
                            Ok(()) => {
                                deposit(&slot, Box::new(bridge));
                                return;
                            }
                            Err(e) => {
                                warn!("wifi probe: broker connect failed: {e}");
                                bridge.reset();
                            }
                        }
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                debug!("wifi probe: cancelled");
            });
        match handle {
            Ok(h) => self.handles.push(h),
            Err(e) => warn!("selector: cannot spawn wifi probe: {e}"),
        }
    }

    /// One arbitration pass. Ethernet slot first: a same-tick tie goes to
    /// the wired path.
    pub fn poll_winner(&self) -> Option<SelectedTransport> {
        if let Some(transport) = take(&self.eth_slot) {
            return Some(SelectedTransport {
                kind: PathKind::Eth,
                transport,
            });
        }
        if let Some(transport) = take(&self.wifi_slot) {
            return Some(SelectedTransport {
                kind: PathKind::Wifi,
                transport,
            });
        }
        None
    }

    /// Block until a path wins. Cancels and returns `None` if `cancel` is
    /// raised before either path comes up.
    pub fn wait_winner(&self, cancel: &AtomicBool) -> Option<SelectedTransport> {
        loop {
            if let Some(winner) = self.poll_winner() {
                info!("selector: {:?} path won arbitration", winner.kind);
                self.stop.store(true, Ordering::Release);
                return Some(winner);
            }
            if cancel.load(Ordering::Acquire) {
                return None;
            }
            thread::sleep(ARBITRATE_TICK);
        }
    }

    /// Stop the probes, join them, and tear down a late loser that made it
    /// into a slot after arbitration.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("selector: probe worker panicked");
            }
        }
        for slot in [&self.eth_slot, &self.wifi_slot] {
            if let Some(mut leftover) = take(slot) {
                info!("selector: tearing down losing {} path", leftover.name());
                if let Err(e) = leftover.disconnect() {
                    debug!("selector: loser teardown: {e}");
                }
            }
        }
    }
}

fn deposit(slot: &Slot, transport: Box<dyn MqttTransport>) {
    if let Ok(mut guard) = slot.lock() {
        info!("selector: {} path ready", transport.name());
        *guard = Some(transport);
    }
}

fn take(slot: &Slot) -> Option<Box<dyn MqttTransport>> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    struct FakeTransport {
        name: &'static str,
        disconnected: Arc<AtomicBool>,
    }

    impl FakeTransport {
        fn boxed(name: &'static str) -> (Box<dyn MqttTransport>, Arc<AtomicBool>) {
            let flag = Arc::new(AtomicBool::new(false));
            (
                Box::new(Self {
                    name,
                    disconnected: Arc::clone(&flag),
                }),
                flag,
            )
        }
    }

    impl MqttTransport for FakeTransport {
        fn name(&self) -> &'static str {
            self.name
        }
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn publish(&mut self, _: &str, _: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn subscribe(&mut self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn poll(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), TransportError> {
            self.disconnected.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn tie_resolves_to_ethernet() {
        let selector = TransportSelector::new();
        let (eth, _) = FakeTransport::boxed("eth");
        let (wifi, _) = FakeTransport::boxed("wifi");
        deposit(&selector.eth_slot, eth);
        deposit(&selector.wifi_slot, wifi);

        let winner = selector.poll_winner().unwrap();
        assert_eq!(winner.kind, PathKind::Eth);
    }

    #[test]
    fn wifi_wins_when_alone() {
        let selector = TransportSelector::new();
        let (wifi, _) = FakeTransport::boxed("wifi");
        deposit(&selector.wifi_slot, wifi);

        let winner = selector.poll_winner().unwrap();
        assert_eq!(winner.kind, PathKind::Wifi);
    }

    #[test]
    fn no_candidate_yields_nothing() {
        let selector = TransportSelector::new();
        assert!(selector.poll_winner().is_none());
    }

    #[test]
    fn shutdown_tears_down_the_loser() {
        let selector = TransportSelector::new();
        let (eth, _) = FakeTransport::boxed("eth");
        let (wifi, wifi_down) = FakeTransport::boxed("wifi");
        deposit(&selector.eth_slot, eth);
        deposit(&selector.wifi_slot, wifi);

        let winner = selector.poll_winner().unwrap();
        assert_eq!(winner.kind, PathKind::Eth);
        selector.shutdown();
        assert!(wifi_down.load(Ordering::Acquire));
    }

    #[test]
    fn cancelled_wait_returns_none() {
        let selector = TransportSelector::new();
        let cancel = AtomicBool::new(true);
        assert!(selector.wait_winner(&cancel).is_none());
    }
}
