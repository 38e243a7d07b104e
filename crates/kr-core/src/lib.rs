//! Kryptonite core - pairing, protocol and the enclave request broker.
//!
//! This crate implements:
//! - The pairing secret and its unwrap-then-encrypt state machine
//! - Request/response envelopes exchanged with the phone
//! - The abstract mailbox transport and its test doubles
//! - The notification bus read by out-of-process consumers
//! - Persistence of pairing, identity and known hosts
//! - The enclave client that correlates requests with responses

#![forbid(unsafe_code)]

// Data model
pub mod profile;
pub mod protocol;
pub mod wire;
pub mod armor;

// Pairing and broker
pub mod pairing;
pub mod client;
pub mod timeouts;

// Transport
pub mod transport;
pub mod testing;

// Infrastructure
pub mod dirs;
pub mod known_hosts;
pub mod notify;
pub mod persist;
pub mod task;

// Supporting modules
pub mod errors;

// Optional transport implementations
#[cfg(feature = "http-mailbox")]
pub mod http_mailbox;

#[cfg(test)]
mod proptests;

pub use client::EnclaveClient;
pub use errors::EnclaveError;
pub use pairing::PairingSecret;
pub use profile::Profile;
pub use protocol::{Request, RequestBody, Response, ResponseBody};
pub use timeouts::{TimeoutPhases, Timeouts};
pub use transport::Transport;
