//! Integrity: per-chunk modular-sum checksum, verified on receive.
//!
//! The sum is order independent and ignores zero bytes, so it catches gross
//! corruption only: byte permutations and tampering go unnoticed. Kept as is
//! for wire compatibility with existing peers.

/// Checksum modulus. The result always fits the u16 checksum field.
pub const CHECKSUM_MODULUS: u64 = 65535;

/// Checksum a chunk payload: sum of all bytes modulo [`CHECKSUM_MODULUS`].
/// Padding zeros do not change the result, so padded and unpadded payloads agree.
pub fn checksum(payload: &[u8]) -> u16 {
    let sum: u64 = payload.iter().map(|&b| u64::from(b)).sum();
    (sum % CHECKSUM_MODULUS) as u16
}

/// Verify chunk payload against the transmitted checksum.
pub fn verify_chunk(payload: &[u8], expected: u16) -> bool {
    checksum(payload) == expected
}
