//! `krd`: the workstation side of a Kryptonite pairing.
//!
//! Three local sockets share one enclave client:
//! - `control`: HTTP control plane used by the `kr` CLI
//! - `agent`: SSH agent protocol
//! - `hostauth`: host-key verification for wrapped SSH transports

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod control;
pub mod framing;
pub mod hostauth;
pub mod logging;
pub mod server;

pub use server::Daemon;
