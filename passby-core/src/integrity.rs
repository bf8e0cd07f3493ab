//! Integrity: 8-bit one's-complement checksum announced with each block and verified on completion.

/// One's complement of the one's-complement sum of `data`, folded to 8 bits.
pub fn checksum8(data: &[u8]) -> u8 {
    let mut sum: u32 = data.iter().map(|&b| b as u32).sum();
    while sum > 0xFF {
        sum = (sum & 0xFF) + (sum >> 8);
    }
    !(sum as u8)
}

/// Verify a received block against the checksum its sender announced.
pub fn verify_block(data: &[u8], expected: u8) -> bool {
    checksum8(data) == expected
}
