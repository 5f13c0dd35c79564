//! Worker threads and the selfping health loop.
//!
//! One network cycle:
//!
//! ```text
//! arbitrate ─▶ subscribe ─▶ spawn workers ─▶ selfping loop ─▶ teardown
//!     ▲                                                          │
//!     └──────────────────────── rework ◀────────────────────────┘
//! ```
//!
//! The selfping probe is published to the gateway's own downlink topic and
//! must come back through the broker. A round trip proves the entire path
//! (transport, broker session, subscription) is alive; a missed deadline
//! triggers exactly one rework. Workers stop cooperatively: an exit flag
//! checked every iteration, a join, and a stop mutex so concurrent
//! teardown requests serialize instead of racing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{CredentialUpdate, Dispatcher, Outcome};
use crate::io::{OutputPort, SensorPort};
use crate::link::UartLink;
use crate::transport::selector::{TcpProbe, TransportSelector};
use crate::transport::wifi::WifiBridge;
use crate::transport::{InboundMessage, MqttTransport};

/// Announcement topic shared by every gateway; payload is the uid.
const CHECKIN_TOPIC: &str = "/up/bs/checkin";
/// Selfping probe payload.
const PING_PAYLOAD: &[u8] = b"p";
/// Poll worker pacing.
const POLL_TICK: Duration = Duration::from_millis(10);
/// Granularity of interruptible sleeps.
const SLEEP_TICK: Duration = Duration::from_millis(50);
/// Retry pacing for the checkin publish.
const CHECKIN_RETRY: Duration = Duration::from_secs(1);

/// Why a cycle ended. Either way the whole network stack is rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum CycleEnd {
    /// The selfping probe never came back.
    SelfPingMiss,
    /// A remote credentials update asked for the rebuild.
    ConfigRework(CredentialUpdate),
}

/// Ack rendezvous between the dispatch worker and the selfping loop.
struct SelfPing {
    acked: Mutex<bool>,
    cv: Condvar,
}

impl SelfPing {
    fn new() -> Self {
        Self {
            acked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn arm(&self) {
        if let Ok(mut acked) = self.acked.lock() {
            *acked = false;
        }
    }

    fn ack(&self) {
        if let Ok(mut acked) = self.acked.lock() {
            *acked = true;
            self.cv.notify_all();
        }
    }

    /// Wait for the probe to come back; `false` means the deadline passed.
    fn wait_ack(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.acked.lock() else {
            return false;
        };
        match self.cv.wait_timeout_while(guard, timeout, |acked| !*acked) {
            Ok((acked, _)) => *acked,
            Err(_) => false,
        }
    }
}

/// The running worker set for one cycle.
struct Workers {
    exit: Arc<AtomicBool>,
    stop_lock: Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    fn new() -> Self {
        Self {
            exit: Arc::new(AtomicBool::new(false)),
            stop_lock: Mutex::new(()),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn spawn<F: FnOnce(Arc<AtomicBool>) + Send + 'static>(&self, name: &str, body: F) {
        let exit = Arc::clone(&self.exit);
        match thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(exit))
        {
            Ok(handle) => {
                if let Ok(mut handles) = self.handles.lock() {
                    handles.push(handle);
                }
            }
            Err(e) => error!("supervisor: cannot spawn {name}: {e}"),
        }
    }

    /// Raise the exit flag and join everyone. Safe to call from multiple
    /// threads; the stop mutex serializes them and the second caller finds
    /// nothing left to join.
    fn stop(&self) {
        let _guard = self.stop_lock.lock();
        self.exit.store(true, Ordering::Release);
        let drained = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for handle in drained {
            if handle.join().is_err() {
                warn!("supervisor: worker panicked during stop");
            }
        }
    }
}

type SharedTransport = Arc<Mutex<Box<dyn MqttTransport>>>;
type Readings = Arc<Mutex<Vec<(&'static str, f64)>>>;

/// Run one full network cycle on an already-arbitrated transport.
///
/// Returns after the single teardown that ends the cycle: workers joined,
/// transport disconnected.
pub fn run_cycle(
    cfg: &GatewayConfig,
    transport: Box<dyn MqttTransport>,
    inbound: Receiver<InboundMessage>,
    sensors: Box<dyn SensorPort>,
    outputs: Box<dyn OutputPort>,
) -> CycleEnd {
    let transport: SharedTransport = Arc::new(Mutex::new(transport));
    let selfping = Arc::new(SelfPing::new());
    let rework_requested = Arc::new(AtomicBool::new(false));
    let pending_update = Arc::new(Mutex::new(None::<CredentialUpdate>));
    let readings: Readings = Arc::new(Mutex::new(Vec::new()));
    let workers = Workers::new();

    subscribe_downlink(cfg, &transport);
    spawn_poll_worker(&workers, &transport);
    spawn_sample_worker(&workers, cfg, sensors, &readings);
    spawn_publish_worker(&workers, cfg, &transport, &readings);
    spawn_dispatch_worker(
        &workers,
        cfg,
        inbound,
        outputs,
        &selfping,
        &rework_requested,
        &pending_update,
    );

    let end = selfping_loop(cfg, &transport, &selfping, &rework_requested, &pending_update);

    info!("supervisor: cycle ending ({end:?}), tearing down");
    workers.stop();
    if let Ok(mut t) = transport.lock() {
        if let Err(e) = t.disconnect() {
            debug!("supervisor: disconnect during teardown: {e}");
        }
    }
    end
}

fn subscribe_downlink(cfg: &GatewayConfig, transport: &SharedTransport) {
    let filter = format!("{}/#", cfg.topic_sub_root());
    for attempt in 1..=3 {
        let result = match transport.lock() {
            Ok(mut t) => t.subscribe(&filter),
            Err(_) => return,
        };
        match result {
            Ok(()) => {
                info!("supervisor: subscribed {filter}");
                return;
            }
            Err(e) => {
                warn!("supervisor: subscribe attempt {attempt} failed: {e}");
                thread::sleep(CHECKIN_RETRY);
            }
        }
    }
    // Left unsubscribed: the selfping probe cannot come back, so the
    // deadline miss will rework the cycle.
}

fn spawn_poll_worker(workers: &Workers, transport: &SharedTransport) {
    let transport = Arc::clone(transport);
    workers.spawn("worker-poll", move |exit| {
        while !exit.load(Ordering::Acquire) {
            let result = match transport.lock() {
                Ok(mut t) => t.poll(),
                Err(_) => return,
            };
            if let Err(e) = result {
                debug!("poll worker: {e}");
                sleep_until_exit(&exit, Duration::from_secs(1));
                continue;
            }
            thread::sleep(POLL_TICK);
        }
    });
}

fn spawn_sample_worker(
    workers: &Workers,
    cfg: &GatewayConfig,
    mut sensors: Box<dyn SensorPort>,
    readings: &Readings,
) {
    let readings = Arc::clone(readings);
    let period = Duration::from_secs(cfg.sample_period_secs);
    workers.spawn("worker-sample", move |exit| {
        while !exit.load(Ordering::Acquire) {
            let snapshot: Vec<(&'static str, f64)> = sensors
                .inputs()
                .iter()
                .filter_map(|&name| sensors.read(name).map(|v| (name, v)))
                .collect();
            if let Ok(mut table) = readings.lock() {
                *table = snapshot;
            }
            sleep_until_exit(&exit, period);
        }
    });
}

fn spawn_publish_worker(
    workers: &Workers,
    cfg: &GatewayConfig,
    transport: &SharedTransport,
    readings: &Readings,
) {
    let transport = Arc::clone(transport);
    let readings = Arc::clone(readings);
    let uid = cfg.credentials.uid.clone();
    let pub_root = cfg.topic_pub_root();
    let period = Duration::from_secs(cfg.publish_period_secs);
    workers.spawn("worker-publish", move |exit| {
        // Announce ourselves before anything else; retried until the
        // broker takes it.
        while !exit.load(Ordering::Acquire) {
            let result = match transport.lock() {
                Ok(mut t) => t.publish(CHECKIN_TOPIC, uid.as_bytes()),
                Err(_) => return,
            };
            match result {
                Ok(()) => {
                    info!("publish worker: checked in as {uid}");
                    break;
                }
                Err(e) => {
                    warn!("publish worker: checkin failed: {e}");
                    sleep_until_exit(&exit, CHECKIN_RETRY);
                }
            }
        }

        while !exit.load(Ordering::Acquire) {
            let snapshot = match readings.lock() {
                Ok(table) => table.clone(),
                Err(_) => return,
            };
            for (name, value) in snapshot {
                let topic = format!("{pub_root}/input/{name}");
                let payload = format!("{value:.1}");
                let result = match transport.lock() {
                    Ok(mut t) => t.publish(&topic, payload.as_bytes()),
                    Err(_) => return,
                };
                if let Err(e) = result {
                    warn!("publish worker: {name}: {e}");
                }
            }
            sleep_until_exit(&exit, period);
        }
    });
}

fn spawn_dispatch_worker(
    workers: &Workers,
    cfg: &GatewayConfig,
    inbound: Receiver<InboundMessage>,
    mut outputs: Box<dyn OutputPort>,
    selfping: &Arc<SelfPing>,
    rework_requested: &Arc<AtomicBool>,
    pending_update: &Arc<Mutex<Option<CredentialUpdate>>>,
) {
    let dispatcher = Dispatcher::new(cfg.topic_sub_root());
    let selfping = Arc::clone(selfping);
    let rework_requested = Arc::clone(rework_requested);
    let pending_update = Arc::clone(pending_update);
    workers.spawn("worker-dispatch", move |exit| {
        while !exit.load(Ordering::Acquire) {
            let msg = match inbound.recv_timeout(SLEEP_TICK) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("dispatch worker: inbound channel closed");
                    return;
                }
            };
            match dispatcher.handle(&msg, outputs.as_mut()) {
                Outcome::SelfPingAck => selfping.ack(),
                Outcome::Rework(update) => {
                    if let Ok(mut pending) = pending_update.lock() {
                        *pending = Some(update);
                    }
                    rework_requested.store(true, Ordering::Release);
                }
                Outcome::Handled | Outcome::Ignored => {}
            }
        }
    });
}

fn selfping_loop(
    cfg: &GatewayConfig,
    transport: &SharedTransport,
    selfping: &Arc<SelfPing>,
    rework_requested: &Arc<AtomicBool>,
    pending_update: &Arc<Mutex<Option<CredentialUpdate>>>,
) -> CycleEnd {
    let probe_topic = format!("{}/selfping", cfg.topic_sub_root());
    loop {
        selfping.arm();
        let publish = match transport.lock() {
            Ok(mut t) => t.publish(&probe_topic, PING_PAYLOAD),
            Err(_) => Err(crate::error::TransportError::NotConnected),
        };
        if let Err(e) = publish {
            // The probe could not even leave; let the deadline run, the
            // miss below will rework.
            warn!("supervisor: selfping publish failed: {e}");
        }

        if !selfping.wait_ack(cfg.selfping_timeout()) {
            warn!("supervisor: selfping missed its deadline");
            // A credentials update staged while we waited must still end
            // the cycle through the rework path; the message is QoS 0 and
            // will never be redelivered.
            return take_rework(rework_requested, pending_update)
                .unwrap_or(CycleEnd::SelfPingMiss);
        }
        debug!("supervisor: selfping acked");

        if let Some(end) = take_rework(rework_requested, pending_update) {
            return end;
        }
        let interval_end = Instant::now() + cfg.selfping_interval();
        while Instant::now() < interval_end {
            if let Some(end) = take_rework(rework_requested, pending_update) {
                return end;
            }
            thread::sleep(SLEEP_TICK);
        }
    }
}

fn take_rework(
    rework_requested: &AtomicBool,
    pending_update: &Mutex<Option<CredentialUpdate>>,
) -> Option<CycleEnd> {
    if !rework_requested.swap(false, Ordering::AcqRel) {
        return None;
    }
    let update = pending_update
        .lock()
        .ok()
        .and_then(|mut p| p.take())
        .unwrap_or_default();
    Some(CycleEnd::ConfigRework(update))
}

fn sleep_until_exit(exit: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if exit.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(SLEEP_TICK.min(total));
    }
}

/// Ports constructor: each cycle consumes fresh sensor and output
/// adapters, so the caller supplies a factory.
pub type PortsFactory = Box<dyn FnMut() -> (Box<dyn SensorPort>, Box<dyn OutputPort>)>;

/// The daemon body: arbitrate, run a cycle, rework, forever.
pub fn run(mut cfg: GatewayConfig, mut ports: PortsFactory) -> ! {
    loop {
        let (sink, inbound) = mpsc::channel();
        let mut selector = TransportSelector::new();
        selector.spawn_eth(
            cfg.clone(),
            sink.clone(),
            Box::new(TcpProbe::new(&cfg.broker_host, cfg.broker_port)),
        );
        match UartLink::open(&cfg.serial_device, cfg.serial_baud) {
            Ok(link) => selector.spawn_wifi(WifiBridge::new(link, cfg.clone(), sink.clone())),
            Err(e) => warn!("supervisor: wifi path unavailable this cycle: {e}"),
        }
        drop(sink);

        let cancel = AtomicBool::new(false);
        let Some(winner) = selector.wait_winner(&cancel) else {
            continue;
        };
        info!("supervisor: starting cycle on {} path", winner.transport.name());
        selector.shutdown();

        let (sensors, outputs) = ports();
        match run_cycle(&cfg, winner.transport, inbound, sensors, outputs) {
            CycleEnd::SelfPingMiss => {
                warn!("supervisor: reworking network after selfping miss");
            }
            CycleEnd::ConfigRework(update) => {
                // Workers are already stopped, so the credentials swap
                // cannot race an in-flight connection attempt.
                if let Some(ssid) = update.ssid {
                    cfg.credentials.ssid = ssid;
                }
                if let Some(password) = update.password {
                    cfg.credentials.psk = password;
                }
                info!("supervisor: reworking network with new credentials");
            }
        }
    }
}
