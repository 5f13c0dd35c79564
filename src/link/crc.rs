//! CRC-16 as computed by the WiFi co-processor firmware.
//!
//! This is an XMODEM-family variant with the firmware's exact fold order,
//! not textbook CRC-16/CCITT. The output must stay bit-identical to the
//! remote side or every frame is rejected, so the bit manipulation below is
//! a compatibility contract rather than a free choice.

/// Fold one byte into the running accumulator.
pub fn update(acc: u16, byte: u8) -> u16 {
    let mut acc = acc ^ u16::from(byte);
    acc = acc.rotate_left(8);
    acc ^= (acc & 0xff00) << 4;
    acc ^= (acc >> 8) >> 4;
    acc ^= (acc & 0xff00) >> 5;
    acc
}

/// Fold a whole buffer, continuing from `acc`.
pub fn compute(acc: u16, buf: &[u8]) -> u16 {
    buf.iter().fold(acc, |a, &b| update(a, b))
}
