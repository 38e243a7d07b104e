//! Curve25519 authenticated box and sealed box.
//!
//! Box output is `nonce (24) || ciphertext+tag`. Sealed-box output is
//! `ephemeral_pk (32) || ciphertext+tag`, with the nonce derived from both
//! public keys so that it never travels on the wire.

use crypto_box::aead::Aead;
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use zeroize::Zeroize;

use crate::hash::sealed_box_nonce;
use crate::random::random_array;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag length.
pub const MAC_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("bad argument: {0}")]
    BadArg(&'static str),
    #[error("box open failed")]
    OpenFailed,
    #[error("box seal failed")]
    SealFailed,
    #[error("randomness unavailable")]
    Rng,
}

/// Curve25519 key-pair. The secret half is wiped on drop.
#[derive(Clone)]
pub struct KeyPair {
    pub public: [u8; KEY_SIZE],
    secret: [u8; KEY_SIZE],
}

impl KeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let secret: [u8; KEY_SIZE] = random_array()?;
        Ok(Self::from_secret(secret))
    }

    pub fn from_secret(secret: [u8; KEY_SIZE]) -> Self {
        let public = *SecretKey::from(secret).public_key().as_bytes();
        Self { public, secret }
    }

    pub fn secret_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.secret
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &crate::utils::short_hex(&self.public))
            .finish_non_exhaustive()
    }
}

fn key_array(b: &[u8], what: &'static str) -> Result<[u8; KEY_SIZE], CryptoError> {
    b.try_into().map_err(|_| CryptoError::BadArg(what))
}

fn salsa_box(peer_pk: &[u8], own_sk: &[u8]) -> Result<SalsaBox, CryptoError> {
    let pk = PublicKey::from(key_array(peer_pk, "public key must be 32 bytes")?);
    let sk = SecretKey::from(key_array(own_sk, "secret key must be 32 bytes")?);
    Ok(SalsaBox::new(&pk, &sk))
}

/// Encrypt `msg` from `sender_sk` to `recipient_pk` under a fresh random nonce.
pub fn box_seal(msg: &[u8], recipient_pk: &[u8], sender_sk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = salsa_box(recipient_pk, sender_sk)?;
    let nonce: [u8; NONCE_SIZE] = random_array()?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), msg)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open `nonce || ct` sent by `sender_pk` to the holder of `recipient_sk`.
pub fn box_open(boxed: &[u8], sender_pk: &[u8], recipient_sk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if boxed.len() < NONCE_SIZE + MAC_SIZE {
        return Err(CryptoError::BadArg("box shorter than nonce and tag"));
    }
    let cipher = salsa_box(sender_pk, recipient_sk)?;
    let (nonce, ct) = boxed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Anonymously encrypt `msg` to `recipient_pk`.
pub fn sealed_box_seal(msg: &[u8], recipient_pk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient = key_array(recipient_pk, "public key must be 32 bytes")?;
    let ephemeral = KeyPair::generate()?;
    let nonce = sealed_box_nonce(&ephemeral.public, &recipient);
    let cipher = salsa_box(&recipient, ephemeral.secret_bytes())?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), msg)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(KEY_SIZE + ct.len());
    out.extend_from_slice(&ephemeral.public);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed box addressed to `recipient`.
pub fn sealed_box_open(sealed: &[u8], recipient: &KeyPair) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < KEY_SIZE + MAC_SIZE {
        return Err(CryptoError::BadArg("sealed box shorter than key and tag"));
    }
    let (epk, ct) = sealed.split_at(KEY_SIZE);
    let epk = key_array(epk, "ephemeral key must be 32 bytes")?;
    let nonce = sealed_box_nonce(&epk, &recipient.public);
    let cipher = salsa_box(&epk, recipient.secret_bytes())?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ct)
        .map_err(|_| CryptoError::OpenFailed)
}
