//! End-to-end exercises of the serial RPC stack against a scripted link:
//! request framing on the wire, reply correlation, and loss behavior.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bscgw::config::GatewayConfig;
use bscgw::error::{Error, TimeoutError, TransportError};
use bscgw::link::rpc::parse_packet;
use bscgw::link::serial::SerialLink;
use bscgw::link::{crc, CoprocessorRpc, Opcode, NO_CALLBACK};
use bscgw::transport::wifi::{token, WifiBridge};
use bscgw::transport::MqttTransport;

/// Serial double with a canned inbound byte stream and a write recording.
struct ScriptedLink {
    written: Vec<u8>,
    inbound: VecDeque<u8>,
}

impl ScriptedLink {
    fn new() -> Self {
        Self {
            written: Vec::new(),
            inbound: VecDeque::new(),
        }
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    fn push_frame(&mut self, payload: &[u8]) {
        self.inbound.push_back(0x7E);
        for &b in payload {
            match b {
                0x7D..=0x7F => {
                    self.inbound.push_back(0x7D);
                    self.inbound.push_back(b ^ 0x20);
                }
                _ => self.inbound.push_back(b),
            }
        }
        self.inbound.push_back(0x7F);
    }

    fn push_response(&mut self, opcode: u16, callback: u32, ret: u32, args: &[&[u8]]) {
        self.push_frame(&build_response(opcode, callback, ret, args));
    }
}

impl SerialLink for ScriptedLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.written.extend_from_slice(data);
        Ok(())
    }

    fn try_read_byte(&mut self, _t: Duration) -> Result<Option<u8>, TransportError> {
        Ok(self.inbound.pop_front())
    }
}

/// Serial double for driving a whole bridge bring-up: each scripted reply
/// is released only after a given number of complete request frames have
/// been written, like a device answering what it was asked. The write
/// recording is shared so the test can still read it once the bridge is
/// boxed behind the transport trait.
struct GatedLink {
    written: Arc<Mutex<Vec<u8>>>,
    requests_seen: usize,
    scripted: Vec<(usize, Vec<u8>)>,
    readable: VecDeque<u8>,
}

impl GatedLink {
    fn new(written: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            written,
            requests_seen: 0,
            scripted: Vec::new(),
            readable: VecDeque::new(),
        }
    }

    fn respond_after(
        &mut self,
        after_request: usize,
        opcode: u16,
        callback: u32,
        ret: u32,
        args: &[&[u8]],
    ) {
        let payload = build_response(opcode, callback, ret, args);
        let mut wire = vec![0x7E];
        for &b in &payload {
            match b {
                0x7D..=0x7F => {
                    wire.push(0x7D);
                    wire.push(b ^ 0x20);
                }
                _ => wire.push(b),
            }
        }
        wire.push(0x7F);
        self.scripted.push((after_request, wire));
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

impl SerialLink for GatedLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.written.lock().unwrap().extend_from_slice(data);
        // A lone raw 0x7F closes a request frame; an escaped 0x7F arrives
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

fn build_response(opcode: u16, callback: u32, ret: u32, args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(&callback.to_le_bytes());
    out.extend_from_slice(&ret.to_le_bytes());
    out.extend_from_slice(&(args.len() as u16).to_le_bytes());
    for a in args {
        out.extend_from_slice(&(a.len() as u16).to_le_bytes());
        out.extend_from_slice(a);
    }
    let c = crc::compute(0, &out);
    out.extend_from_slice(&c.to_le_bytes());
    out
}

/// Split a recorded wire stream into frames, undoing byte escaping.
fn split_frames(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut escaped = false;
    for &b in wire {
        match b {
            0x7D => escaped = true,
            0x7E => current = Some(Vec::new()),
            0x7F => {
                if let Some(f) = current.take() {
                    frames.push(f);
                }
            }
            mut b => {
                if escaped {
                    b ^= 0x20;
                    escaped = false;
                }
                if let Some(f) = current.as_mut() {
                    f.push(b);
                }
            }
        }
    }
    frames
}

#[test]
fn call_and_wait_resolves_on_matching_return() {
    let mut link = ScriptedLink::new();
    link.push_response(2, 0, 1, &[]);
    let mut rpc = CoprocessorRpc::new(link);

    let value = rpc
        .call_and_wait(Opcode::IsReady, 1, &[], Duration::from_millis(200))
        .expect("reply was scripted");
    assert_eq!(value, 1);
}

#[test]
fn corrupted_crc_leaves_the_call_unresolved() {
    let mut link = ScriptedLink::new();
    let mut bad = build_response(2, 0, 1, &[]);
    let last = bad.len() - 1;
    bad[last] ^= 0x40;
    link.push_frame(&bad);
    let mut rpc = CoprocessorRpc::new(link);

    let err = rpc
        .call_and_wait(Opcode::IsReady, 1, &[], Duration::from_millis(100))
        .expect_err("damaged frame must be dropped silently");
    assert!(matches!(
        err,
        Error::Timeout(TimeoutError::Rpc { opcode: 2, .. })
    ));
}

#[test]
fn boot_noise_before_a_frame_is_harmless() {
    let mut link = ScriptedLink::new();
    link.push_raw(b"ets Jan  8 2013,rst cause:2, boot mode:(3,7)\r\n");
    link.push_response(2, 0, 1, &[]);
    let mut rpc = CoprocessorRpc::new(link);

    let value = rpc
        .call_and_wait(Opcode::IsReady, 1, &[], Duration::from_millis(200))
        .expect("noise must not block the reply");
    assert_eq!(value, 1);
}

#[test]
fn reset_request_has_the_exact_wire_image() {
    let mut rpc = CoprocessorRpc::new(ScriptedLink::new());
    rpc.send(Opcode::Reset, NO_CALLBACK, 0, &[]).unwrap();

    let mut header = [0u8; 12];
    header[0] = 0x01;
    let c = crc::compute(0, &header);

    let mut expected = vec![0x7E];
    expected.extend_from_slice(&header);
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
    assert_eq!(rpc.link_mut().written, expected);
}

#[test]
fn arguments_are_padded_to_four_bytes_with_padded_length() {
    let mut rpc = CoprocessorRpc::new(ScriptedLink::new());
    // A 5-byte topic pads to 8; the wire length field carries 8.
    rpc.send(Opcode::MqttSubscribe, NO_CALLBACK, 0, &[b"/up/b"])
        .unwrap();

    let frames = split_frames(&rpc.link_mut().written);
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    // header(12) + len(2) + data+pad(8) + crc(2)
    assert_eq!(frame.len(), 24);
    assert_eq!(u16::from_le_bytes([frame[12], frame[13]]), 8);
    assert_eq!(&frame[14..19], b"/up/b");
    assert_eq!(&frame[19..22], &[0, 0, 0]);
}

#[test]
fn sequential_requests_never_interleave_on_the_wire() {
    let mut rpc = CoprocessorRpc::new(ScriptedLink::new());
    rpc.send(Opcode::Reset, NO_CALLBACK, 0, &[]).unwrap();
    rpc.send(Opcode::IsReady, NO_CALLBACK, 1, &[]).unwrap();
    rpc.send(Opcode::MqttSubscribe, NO_CALLBACK, 0, &[b"/down/bs/864/#"])
        .unwrap();

    let wire = rpc.link_mut().written.clone();
    let frames = split_frames(&wire);
    assert_eq!(frames.len(), 3);
    assert_eq!(u16::from_le_bytes([frames[0][0], frames[0][1]]), 1);
    assert_eq!(u16::from_le_bytes([frames[1][0], frames[1][1]]), 2);
    assert_eq!(u16::from_le_bytes([frames[2][0], frames[2][1]]), 8);

    // The stream is nothing but whole frames: it must start with a start
    // marker, end with an end marker, and alternate cleanly.
    assert_eq!(wire[0], 0x7E);
    assert_eq!(*wire.last().unwrap(), 0x7F);
}

#[test]
fn concurrent_publish_and_poll_never_interleave_frames() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let mut link = GatedLink::new(Arc::clone(&written));
    link.respond_after(2, 2, 0, 1, &[]); // IsReady
    link.respond_after(3, 3, token::WIFI_STATUS, 0, &[&5u32.to_le_bytes()]); // GotIp
    link.respond_after(4, 4, 0, 0x77, &[]); // MQTT_SETUP → instance
    link.respond_after(5, 9, 0, 1, &[]); // LWT ack

    let (tx, _rx) = mpsc::channel();
    let mut cfg = GatewayConfig::default();
    cfg.rpc_timeout_ms = 50;
    let mut bridge = WifiBridge::new(link, cfg, tx);
    for _ in 0..6 {
        bridge.step().unwrap();
    }
    assert!(bridge.is_ready());

    // The workers share one transport behind a mutex; hammer publish and
    // poll from separate threads the way they do.
    let transport: Arc<Mutex<Box<dyn MqttTransport>>> = Arc::new(Mutex::new(Box::new(bridge)));
    let mut hammers = Vec::new();
    for channel in 0..2 {
        let transport = Arc::clone(&transport);
        hammers.push(thread::spawn(move || {
            for n in 0..50 {
                let topic = format!("/up/bs/864/input/AI{channel}");
                let payload = format!("{n}");
                transport
                    .lock()
                    .unwrap()
                    .publish(&topic, payload.as_bytes())
                    .unwrap();
            }
        }));
    }
    {
        let transport = Arc::clone(&transport);
        hammers.push(thread::spawn(move || {
            for _ in 0..100 {
                transport.lock().unwrap().poll().unwrap();
            }
        }));
    }
    for h in hammers {
        h.join().unwrap();
    }

    // Five bring-up requests plus one hundred publishes, and every one a
    // whole CRC-valid packet. A torn or interleaved frame cannot parse.
    let wire = written.lock().unwrap().clone();
    let frames = split_frames(&wire);
    assert_eq!(frames.len(), 105);
    for frame in &frames {
        parse_packet(frame).expect("recorded frame must be whole and CRC-valid");
    }
}

#[test]
fn unsolicited_events_are_queued_not_returned() {
    let mut link = ScriptedLink::new();
    link.push_response(10, 5, 0, &[b"/down/bs/864/selfping", b"p"]);
    link.push_response(2, 0, 1, &[]);
    let mut rpc = CoprocessorRpc::new(link);

    let value = rpc
        .call_and_wait(Opcode::IsReady, 1, &[], Duration::from_millis(200))
        .expect("return must resolve past the event");
    assert_eq!(value, 1);

    let event = rpc.poll_event().expect("event must be queued");
    assert_eq!(event.callback, 5);
    assert_eq!(event.arg(0).unwrap(), b"/down/bs/864/selfping");
}
