//! Kryptonite crypto primitives.
//!
//! Thin wrappers over the NaCl constructions used on the pairing wire:
//! - `nacl`: Curve25519 authenticated box and sealed box
//! - `hash`: SHA-256 and the Blake2b-192 sealed-box nonce
//! - `random`: random bytes and 128-bit base62 identifiers
//! - `utils`: constant-time comparison

#![forbid(unsafe_code)]

pub mod hash;
pub mod nacl;
pub mod random;
pub mod utils;

pub use nacl::{
    box_open, box_seal, sealed_box_open, sealed_box_seal, CryptoError, KeyPair, KEY_SIZE,
    NONCE_SIZE,
};

#[cfg(test)]
mod proptests;
