//! The paired identity delivered by the phone.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::armor::{armor, PUBLIC_KEY_BLOCK};
use crate::errors::ProtocolError;
use crate::protocol::b64;
use crate::wire;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(rename = "public_key_wire", with = "b64")]
    pub ssh_wire_public_key: Vec<u8>,
    pub email: String,
    #[serde(
        rename = "pgp_pk",
        default,
        with = "b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub pgp_public_key: Option<Vec<u8>>,
}

impl Profile {
    /// Key type name from the wire key, e.g. `ssh-rsa`.
    pub fn key_type(&self) -> Result<String, ProtocolError> {
        wire::key_type(&self.ssh_wire_public_key)
    }

    /// `<type> <base64 wire key> <email>` with spaces removed from the email.
    pub fn authorized_key_string(&self) -> Result<String, ProtocolError> {
        Ok(format!(
            "{} {} {}",
            self.key_type()?,
            STANDARD.encode(&self.ssh_wire_public_key),
            self.email.replace(' ', "")
        ))
    }

    pub fn public_key_fingerprint(&self) -> [u8; 32] {
        kr_crypto::hash::sha256(&self.ssh_wire_public_key)
    }

    pub fn ascii_armored_pgp_public_key(&self) -> Result<String, ProtocolError> {
        let pk = self
            .pgp_public_key
            .as_ref()
            .ok_or(ProtocolError::Missing("pgp public key"))?;
        Ok(armor(PUBLIC_KEY_BLOCK, &[("Created With", "Kryptonite")], pk))
    }
}
