//! Pairing secret and the unwrap-then-encrypt state machine.
//!
//! A pairing starts with a fresh workstation key-pair and no enclave key.
//! The phone answers the QR handshake with a `WRAPPED_PUBLIC_KEY` envelope
//! (its public key sealed to the workstation key). Until that envelope is
//! unwrapped every encrypt/decrypt fails with `WaitingForKey`; afterwards
//! the enclave key never changes for the lifetime of the pairing.

use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kr_crypto::{box_open, box_seal, sealed_box_open, KeyPair, KEY_SIZE};

use crate::errors::{CryptoFault, PairingError};
use crate::protocol::{b64, now_unix, CURRENT_VERSION};

/// Envelope header bytes.
pub const HEADER_CIPHERTEXT: u8 = 0x00;
pub const HEADER_WRAPPED_KEY: u8 = 0x01;
pub const HEADER_WRAPPED_PUBLIC_KEY: u8 = 0x02;

/// Outcome of feeding one inbound envelope to the pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwrapped {
    /// Box ciphertext (header stripped), ready for `decrypt_message`.
    Ciphertext(Vec<u8>),
    /// The enclave public key was learned from this envelope.
    KeyUnwrapped,
    /// A wrapped key arrived after the enclave key was already set.
    Discarded,
}

#[derive(Debug, Default)]
struct MutableState {
    enclave_public_key: Option<[u8; KEY_SIZE]>,
    sns_endpoint_arn: Option<String>,
    approved_until: Option<i64>,
    tracking_id: Option<String>,
}

#[derive(Debug)]
pub struct PairingSecret {
    keys: KeyPair,
    workstation_name: String,
    version: Version,
    state: Mutex<MutableState>,
}

/// QR payload shown to the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingQr {
    #[serde(rename = "pk", with = "b64")]
    pub workstation_public_key: Vec<u8>,
    #[serde(rename = "n")]
    pub workstation_name: String,
    #[serde(rename = "v")]
    pub version: Version,
}

/// Body of `PUT /pair`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingOptions {
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub workstation_name: Option<String>,
}

/// On-disk form of a pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPairing {
    #[serde(with = "b64")]
    pub workstation_public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub workstation_secret_key: Vec<u8>,
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub enclave_public_key: Option<Vec<u8>>,
    pub workstation_name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sns_endpoint_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
}

impl PairingSecret {
    pub fn generate(workstation_name: impl Into<String>) -> Result<Self, PairingError> {
        Ok(Self {
            keys: KeyPair::generate()?,
            workstation_name: workstation_name.into(),
            version: CURRENT_VERSION,
            state: Mutex::new(MutableState::default()),
        })
    }

    pub fn workstation_public_key(&self) -> &[u8; KEY_SIZE] {
        &self.keys.public
    }

    pub fn workstation_name(&self) -> &str {
        &self.workstation_name
    }

    pub fn enclave_public_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.state.lock().enclave_public_key
    }

    /// True once the enclave public key is known.
    pub fn is_paired(&self) -> bool {
        self.state.lock().enclave_public_key.is_some()
    }

    /// Same workstation key-pair, i.e. the same pairing.
    pub fn same_pairing(&self, other: &PairingSecret) -> bool {
        kr_crypto::utils::constant_time_compare(&self.keys.public, &other.keys.public)
    }

    pub fn qr_payload(&self) -> PairingQr {
        PairingQr {
            workstation_public_key: self.keys.public.to_vec(),
            workstation_name: self.workstation_name.clone(),
            version: self.version.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Envelopes
    // ------------------------------------------------------------------------

    /// Dispatch one inbound envelope on its header byte.
    pub fn unwrap_or_decrypt(&self, envelope: &[u8]) -> Result<Unwrapped, PairingError> {
        let (&header, rest) = envelope
            .split_first()
            .ok_or(PairingError::Crypto(CryptoFault::Empty))?;

        match header {
            HEADER_CIPHERTEXT => Ok(Unwrapped::Ciphertext(rest.to_vec())),
            HEADER_WRAPPED_PUBLIC_KEY => {
                if self.is_paired() {
                    return Ok(Unwrapped::Discarded);
                }
                let key = sealed_box_open(rest, &self.keys)?;
                let key: [u8; KEY_SIZE] = key
                    .as_slice()
                    .try_into()
                    .map_err(|_| PairingError::Crypto(CryptoFault::BadLength))?;

                let mut state = self.state.lock();
                // a concurrent unwrap may have won the race
                if state.enclave_public_key.is_some() {
                    return Ok(Unwrapped::Discarded);
                }
                state.enclave_public_key = Some(key);
                Ok(Unwrapped::KeyUnwrapped)
            }
            HEADER_WRAPPED_KEY => Err(PairingError::Crypto(CryptoFault::WrappedKeyUnsupported)),
            other => Err(PairingError::Crypto(CryptoFault::UnknownHeader(other))),
        }
    }

    /// Box `msg` to the enclave and prepend the ciphertext header.
    pub fn encrypt_message(&self, msg: &[u8]) -> Result<Vec<u8>, PairingError> {
        let enclave_pk = self.enclave_public_key().ok_or(PairingError::WaitingForKey)?;
        let boxed = box_seal(msg, &enclave_pk, self.keys.secret_bytes())?;

        let mut out = Vec::with_capacity(1 + boxed.len());
        out.push(HEADER_CIPHERTEXT);
        out.extend_from_slice(&boxed);
        Ok(out)
    }

    /// Open a box produced by the enclave (header already stripped).
    pub fn decrypt_message(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PairingError> {
        let enclave_pk = self.enclave_public_key().ok_or(PairingError::WaitingForKey)?;
        Ok(box_open(ciphertext, &enclave_pk, self.keys.secret_bytes())?)
    }

    // ------------------------------------------------------------------------
    // Approval window and push metadata
    // ------------------------------------------------------------------------

    pub fn requires_approval(&self) -> bool {
        self.requires_approval_at(now_unix())
    }

    pub fn requires_approval_at(&self, now: i64) -> bool {
        match self.state.lock().approved_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    pub fn approved_until(&self) -> Option<i64> {
        self.state.lock().approved_until
    }

    /// Returns true if the value changed.
    pub fn set_approved_until(&self, until: Option<i64>) -> bool {
        let mut state = self.state.lock();
        let changed = state.approved_until != until;
        state.approved_until = until;
        changed
    }

    pub fn sns_endpoint_arn(&self) -> Option<String> {
        self.state.lock().sns_endpoint_arn.clone()
    }

    pub fn set_sns_endpoint_arn(&self, arn: Option<String>) -> bool {
        let mut state = self.state.lock();
        let changed = state.sns_endpoint_arn != arn;
        state.sns_endpoint_arn = arn;
        changed
    }

    pub fn tracking_id(&self) -> Option<String> {
        self.state.lock().tracking_id.clone()
    }

    pub fn set_tracking_id(&self, id: Option<String>) -> bool {
        let mut state = self.state.lock();
        let changed = state.tracking_id != id;
        state.tracking_id = id;
        changed
    }

    // ------------------------------------------------------------------------
    // Mailbox naming
    // ------------------------------------------------------------------------

    /// Uppercase UUID from the first 16 bytes of SHA-256(workstation pk).
    pub fn derive_uuid(&self) -> String {
        let digest = kr_crypto::hash::sha256(&self.keys.public);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string().to_uppercase()
    }

    pub fn send_queue_name(&self) -> String {
        self.derive_uuid()
    }

    pub fn recv_queue_name(&self) -> String {
        format!("{}-responder", self.derive_uuid())
    }

    // ------------------------------------------------------------------------
    // Persistence form
    // ------------------------------------------------------------------------

    pub fn to_persisted(&self) -> PersistedPairing {
        let state = self.state.lock();
        PersistedPairing {
            workstation_public_key: self.keys.public.to_vec(),
            workstation_secret_key: self.keys.secret_bytes().to_vec(),
            enclave_public_key: state.enclave_public_key.map(|k| k.to_vec()),
            workstation_name: self.workstation_name.clone(),
            version: self.version.clone(),
            sns_endpoint_arn: state.sns_endpoint_arn.clone(),
            approved_until: state.approved_until,
            tracking_id: state.tracking_id.clone(),
        }
    }
}

impl TryFrom<PersistedPairing> for PairingSecret {
    type Error = PairingError;

    fn try_from(p: PersistedPairing) -> Result<Self, Self::Error> {
        let secret: [u8; KEY_SIZE] = p
            .workstation_secret_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::Malformed("secret key length".into()))?;
        let keys = KeyPair::from_secret(secret);
        if keys.public.as_slice() != p.workstation_public_key.as_slice() {
            return Err(PairingError::Malformed(
                "public key does not match secret key".into(),
            ));
        }
        let enclave_public_key = match p.enclave_public_key {
            Some(k) => Some(
                k.as_slice()
                    .try_into()
                    .map_err(|_| PairingError::Malformed("enclave key length".into()))?,
            ),
            None => None,
        };

        Ok(Self {
            keys,
            workstation_name: p.workstation_name,
            version: p.version,
            state: Mutex::new(MutableState {
                enclave_public_key,
                sns_endpoint_arn: p.sns_endpoint_arn,
                approved_until: p.approved_until,
                tracking_id: p.tracking_id,
            }),
        })
    }
}

/// Build the envelope a phone sends at first contact: its public key sealed
/// to the workstation key.
pub fn wrap_enclave_public_key(
    enclave_pk: &[u8; KEY_SIZE],
    workstation_pk: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, PairingError> {
    let sealed = kr_crypto::sealed_box_seal(enclave_pk, workstation_pk)?;
    let mut out = Vec::with_capacity(1 + sealed.len());
    out.push(HEADER_WRAPPED_PUBLIC_KEY);
    out.extend_from_slice(&sealed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired() -> (PairingSecret, KeyPair) {
        let ps = PairingSecret::generate("test-ws").unwrap();
        let enclave = KeyPair::generate().unwrap();
        let env = wrap_enclave_public_key(&enclave.public, ps.workstation_public_key()).unwrap();
        assert_eq!(ps.unwrap_or_decrypt(&env).unwrap(), Unwrapped::KeyUnwrapped);
        (ps, enclave)
    }

    #[test]
    fn fresh_pairing_waits_for_key() {
        let ps = PairingSecret::generate("ws").unwrap();
        assert!(!ps.is_paired());
        assert_eq!(ps.encrypt_message(b"x"), Err(PairingError::WaitingForKey));
        assert_eq!(ps.decrypt_message(&[0u8; 64]), Err(PairingError::WaitingForKey));
    }

    #[test]
    fn wrapped_public_key_is_learned_once() {
        let (ps, enclave) = paired();
        assert_eq!(ps.enclave_public_key(), Some(enclave.public));

        let other = KeyPair::generate().unwrap();
        let env = wrap_enclave_public_key(&other.public, ps.workstation_public_key()).unwrap();
        assert_eq!(ps.unwrap_or_decrypt(&env).unwrap(), Unwrapped::Discarded);
        assert_eq!(ps.enclave_public_key(), Some(enclave.public));
    }

    #[test]
    fn encrypt_then_enclave_decrypts() {
        let (ps, enclave) = paired();
        let ct = ps.encrypt_message(b"{\"request_id\":\"1\"}").unwrap();
        assert_eq!(ct[0], HEADER_CIPHERTEXT);
        let msg = box_open(&ct[1..], ps.workstation_public_key(), enclave.secret_bytes()).unwrap();
        assert_eq!(msg, b"{\"request_id\":\"1\"}");
    }

    #[test]
    fn enclave_response_round_trip() {
        let (ps, enclave) = paired();
        let mut env = vec![HEADER_CIPHERTEXT];
        env.extend(box_seal(b"resp", ps.workstation_public_key(), enclave.secret_bytes()).unwrap());

        match ps.unwrap_or_decrypt(&env).unwrap() {
            Unwrapped::Ciphertext(ct) => assert_eq!(ps.decrypt_message(&ct).unwrap(), b"resp"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn every_header_byte_has_one_outcome() {
        let (ps, _) = paired();
        for header in 0u8..=255 {
            let env = [header, 1, 2, 3];
            match ps.unwrap_or_decrypt(&env) {
                Ok(Unwrapped::Ciphertext(rest)) => {
                    assert_eq!(header, HEADER_CIPHERTEXT);
                    assert_eq!(rest, vec![1, 2, 3]);
                }
                Ok(Unwrapped::Discarded) => assert_eq!(header, HEADER_WRAPPED_PUBLIC_KEY),
                Ok(Unwrapped::KeyUnwrapped) => panic!("already paired"),
                Err(PairingError::Crypto(CryptoFault::WrappedKeyUnsupported)) => {
                    assert_eq!(header, HEADER_WRAPPED_KEY)
                }
                Err(PairingError::Crypto(CryptoFault::UnknownHeader(h))) => {
                    assert_eq!(h, header);
                    assert!(header > HEADER_WRAPPED_PUBLIC_KEY);
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn empty_envelope_is_an_error() {
        let ps = PairingSecret::generate("ws").unwrap();
        assert_eq!(
            ps.unwrap_or_decrypt(&[]),
            Err(PairingError::Crypto(CryptoFault::Empty))
        );
    }

    #[test]
    fn corrupt_wrapped_key_leaves_pairing_unpaired() {
        let ps = PairingSecret::generate("ws").unwrap();
        let enclave = KeyPair::generate().unwrap();
        let mut env = wrap_enclave_public_key(&enclave.public, ps.workstation_public_key()).unwrap();
        let last = env.len() - 1;
        env[last] ^= 0xff;
        assert!(ps.unwrap_or_decrypt(&env).is_err());
        assert!(!ps.is_paired());
    }

    #[test]
    fn approval_window() {
        let ps = PairingSecret::generate("ws").unwrap();
        assert!(ps.requires_approval_at(100));
        assert!(ps.set_approved_until(Some(160)));
        assert!(!ps.set_approved_until(Some(160)));
        assert!(!ps.requires_approval_at(100));
        assert!(!ps.requires_approval_at(159));
        assert!(ps.requires_approval_at(160));
    }

    #[test]
    fn queue_names() {
        let ps = PairingSecret::generate("ws").unwrap();
        let base = ps.send_queue_name();
        assert_eq!(base.len(), 36);
        assert_eq!(base, base.to_uppercase());
        assert_eq!(ps.recv_queue_name(), format!("{}-responder", base));
    }

    #[test]
    fn persisted_round_trip() {
        let (ps, _) = paired();
        ps.set_approved_until(Some(42));
        ps.set_tracking_id(Some("t-1".into()));

        let json = serde_json::to_string(&ps.to_persisted()).unwrap();
        let back: PersistedPairing = serde_json::from_str(&json).unwrap();
        let back = PairingSecret::try_from(back).unwrap();

        assert!(back.same_pairing(&ps));
        assert_eq!(back.enclave_public_key(), ps.enclave_public_key());
        assert_eq!(back.approved_until(), Some(42));
        assert_eq!(back.tracking_id().as_deref(), Some("t-1"));
    }

    #[test]
    fn persisted_with_mismatched_keys_is_rejected() {
        let ps = PairingSecret::generate("ws").unwrap();
        let mut p = ps.to_persisted();
        p.workstation_public_key = vec![0u8; 32];
        assert!(matches!(
            PairingSecret::try_from(p),
            Err(PairingError::Malformed(_))
        ));
    }
}
