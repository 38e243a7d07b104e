//! Error types for the Kryptonite core.
//!
//! Each component maps its low-level failures into these enums at its
//! boundary. `EnclaveError` is the taxonomy seen by broker callers; it is
//! `Clone` so one failure can be delivered to every pending request.

use kr_crypto::CryptoError;
use thiserror::Error;

// ============================================================================
// Crypto and pairing
// ============================================================================

/// Envelope-level crypto failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoFault {
    #[error("bad MAC")]
    BadMac,

    #[error("bad length")]
    BadLength,

    #[error("empty envelope")]
    Empty,

    #[error("unknown envelope header 0x{0:02x}")]
    UnknownHeader(u8),

    #[error("wrapped symmetric keys are unsupported")]
    WrappedKeyUnsupported,

    #[error("encryption failed")]
    SealFailed,

    #[error("randomness unavailable")]
    Rng,
}

impl From<CryptoError> for CryptoFault {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::BadArg(_) => CryptoFault::BadLength,
            CryptoError::OpenFailed => CryptoFault::BadMac,
            CryptoError::SealFailed => CryptoFault::SealFailed,
            CryptoError::Rng => CryptoFault::Rng,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("waiting for enclave public key")]
    WaitingForKey,

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoFault),

    #[error("malformed pairing: {0}")]
    Malformed(String),
}

impl From<CryptoError> for PairingError {
    fn from(e: CryptoError) -> Self {
        PairingError::Crypto(e.into())
    }
}

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message carries more than one payload variant: {0}")]
    MultipleVariants(String),

    #[error("malformed ssh wire data: {0}")]
    Wire(&'static str),

    #[error("missing field: {0}")]
    Missing(&'static str),

    #[error("json: {0}")]
    Json(String),

    #[error("randomness unavailable")]
    Rng,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("clock skew: request signature expired")]
    ClockSkew,

    #[error("mailbox provider error: status={status} body={body}")]
    Provider { status: u16, body: String },

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error(transparent)]
    Pairing(#[from] PairingError),
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid persisted data: {0}")]
    Invalid(String),
}

// ============================================================================
// Broker
// ============================================================================

/// Failures surfaced to callers of the enclave client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnclaveError {
    #[error("phone not paired")]
    NotPaired,

    #[error("waiting for the phone to finish pairing")]
    WaitingForKey,

    #[error("request timed out")]
    TimedOut,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transport: {0}")]
    Transport(TransportError),

    #[error("crypto: {0}")]
    Crypto(CryptoFault),

    #[error("request canceled")]
    Canceled,

    #[error("phone unpaired this workstation")]
    RemoteUnpair,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PairingError> for EnclaveError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::WaitingForKey => EnclaveError::WaitingForKey,
            PairingError::Crypto(fault) => EnclaveError::Crypto(fault),
            PairingError::Malformed(msg) => EnclaveError::Internal(msg),
        }
    }
}

impl From<TransportError> for EnclaveError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Pairing(p) => p.into(),
            other => EnclaveError::Transport(other),
        }
    }
}

impl From<CryptoFault> for EnclaveError {
    fn from(e: CryptoFault) -> Self {
        EnclaveError::Crypto(e)
    }
}

impl From<ProtocolError> for EnclaveError {
    fn from(e: ProtocolError) -> Self {
        EnclaveError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for EnclaveError {
    fn from(e: serde_json::Error) -> Self {
        EnclaveError::Internal(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_pairing_errors_flatten() {
        let e: EnclaveError = TransportError::Pairing(PairingError::WaitingForKey).into();
        assert_eq!(e, EnclaveError::WaitingForKey);

        let e: EnclaveError = TransportError::ClockSkew.into();
        assert_eq!(e, EnclaveError::Transport(TransportError::ClockSkew));
    }

    #[test]
    fn crypto_errors_map_to_faults() {
        assert_eq!(CryptoFault::from(CryptoError::OpenFailed), CryptoFault::BadMac);
        assert_eq!(
            CryptoFault::from(CryptoError::BadArg("short")),
            CryptoFault::BadLength
        );
    }
}
