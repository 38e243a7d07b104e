//! Comparison and formatting helpers for key material.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// Used for public-key and key-blob equality checks where the compared
/// value arrives from an untrusted peer.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// First eight bytes as lowercase hex, for log lines.
pub fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
