//! Fuzz target: `SlipDecoder::feed_byte`
//!
//! Drives arbitrary byte streams into the streaming SLIP decoder and
//! asserts that it never panics, never yields a frame beyond its fixed
//! buffer capacity, and accepts bytes cleanly again after a reset.
//!
//! cargo fuzz run fuzz_slip_decoder

#![no_main]

use bscgw::link::slip::{SlipDecoder, MAX_FRAME};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = SlipDecoder::new();

    for &b in data {
        if let Some(frame) = decoder.feed_byte(b) {
            assert!(frame.len() <= MAX_FRAME, "frame exceeds buffer capacity");
        }
    }

    // After a reset the decoder must accept the same bytes cleanly again.
    decoder.reset();
    for &b in data {
        let _ = decoder.feed_byte(b);
    }
});
