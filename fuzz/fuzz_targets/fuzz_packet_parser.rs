//! Fuzz target: `parse_packet`
//!
//! Feeds arbitrary de-framed byte slices to the packet parser and asserts
//! that it never panics and that anything it accepts re-validates: the
//! parsed argument list plus header and CRC can never claim more bytes
//! than the frame holds.
//!
//! cargo fuzz run fuzz_packet_parser

#![no_main]

use bscgw::link::rpc::parse_packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = parse_packet(data) else {
        return;
    };

    // Accepted packets must be internally consistent.
    let args_len: usize = (0..packet.argc())
        .map(|i| 2 + packet.arg(i).map_or(0, <[u8]>::len))
        .sum();
    assert!(
        12 + args_len + 2 <= data.len(),
        "accepted packet claims more bytes than the frame holds"
    );
});
