use blake2::digest::consts::U24;
use blake2::Blake2b;
use sha2::{Digest, Sha256};

type Blake2b192 = Blake2b<U24>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Sealed-box nonce: blake2b-192(ephemeral_pk || recipient_pk).
pub fn sealed_box_nonce(ephemeral_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; 24] {
    let mut h = Blake2b192::new();
    Digest::update(&mut h, ephemeral_pk);
    Digest::update(&mut h, recipient_pk);
    let out = h.finalize();
    let mut arr = [0u8; 24];
    arr.copy_from_slice(&out);
    arr
}
