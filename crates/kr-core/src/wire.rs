//! SSH wire encoding: `uint32` lengths and length-prefixed strings.

use bytes::{Buf, BufMut};

use crate::errors::ProtocolError;

pub const SSH_RSA: &str = "ssh-rsa";
pub const SSH_ED25519: &str = "ssh-ed25519";
pub const RSA_SHA2_256: &str = "rsa-sha2-256";
pub const RSA_SHA2_512: &str = "rsa-sha2-512";

/// `SSH_MSG_USERAUTH_REQUEST`
pub const MSG_USERAUTH_REQUEST: u8 = 50;

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Wire("truncated uint32"));
    }
    Ok(buf.get_u32())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::Wire("truncated byte"));
    }
    Ok(buf.get_u8())
}

/// Read one length-prefixed string, advancing `buf` past it.
pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let len = read_u32(buf)? as usize;
    if buf.len() < len {
        return Err(ProtocolError::Wire("truncated string"));
    }
    let (s, rest) = buf.split_at(len);
    *buf = rest;
    Ok(s)
}

pub fn put_string(out: &mut Vec<u8>, s: &[u8]) {
    out.put_u32(s.len() as u32);
    out.put_slice(s);
}

/// Leading type name of a wire-format public key.
pub fn key_type(blob: &[u8]) -> Result<String, ProtocolError> {
    let mut buf = blob;
    let name = read_string(&mut buf)?;
    String::from_utf8(name.to_vec()).map_err(|_| ProtocolError::Wire("key type is not utf-8"))
}

/// `string(format) || string(signature)`
pub fn signature_blob(format: &str, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + format.len() + signature.len());
    put_string(&mut out, format.as_bytes());
    put_string(&mut out, signature);
    out
}

/// Wire-format RSA public key from big-endian exponent and modulus.
pub fn rsa_public_key_wire(e: &[u8], n: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, SSH_RSA.as_bytes());
    put_string(&mut out, &mpint(e));
    put_string(&mut out, &mpint(n));
    out
}

/// Positive mpint encoding: strip leading zeros, pad when the high bit is set.
fn mpint(be: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = match be.iter().position(|&b| b != 0) {
        Some(i) => &be[i..],
        None => &[],
    };
    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().map_or(false, |b| b & 0x80 != 0) {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

pub fn ed25519_public_key_wire(pk: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + SSH_ED25519.len() + 4 + 32);
    put_string(&mut out, SSH_ED25519.as_bytes());
    put_string(&mut out, pk);
    out
}

/// The data a client asks the agent to sign during public-key userauth
/// (RFC 4252 section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthPayload {
    pub session_id: Vec<u8>,
    pub user: String,
    pub service: String,
    pub method: String,
    pub has_signature: bool,
    pub algorithm: String,
    pub public_key: Vec<u8>,
}

fn read_utf8(buf: &mut &[u8], what: &'static str) -> Result<String, ProtocolError> {
    let s = read_string(buf)?;
    String::from_utf8(s.to_vec()).map_err(|_| ProtocolError::Wire(what))
}

impl UserAuthPayload {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        let session_id = read_string(&mut buf)?.to_vec();
        if read_u8(&mut buf)? != MSG_USERAUTH_REQUEST {
            return Err(ProtocolError::Wire("not a userauth request"));
        }
        let user = read_utf8(&mut buf, "user is not utf-8")?;
        let service = read_utf8(&mut buf, "service is not utf-8")?;
        let method = read_utf8(&mut buf, "method is not utf-8")?;
        let has_signature = read_u8(&mut buf)? != 0;
        let algorithm = read_utf8(&mut buf, "algorithm is not utf-8")?;
        let public_key = read_string(&mut buf)?.to_vec();
        Ok(Self {
            session_id,
            user,
            service,
            method,
            has_signature,
            algorithm,
            public_key,
        })
    }

    /// Re-encode without the trailing public key, which the phone already
    /// knows.
    pub fn encode_without_public_key(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.session_id);
        out.put_u8(MSG_USERAUTH_REQUEST);
        put_string(&mut out, self.user.as_bytes());
        put_string(&mut out, self.service.as_bytes());
        put_string(&mut out, self.method.as_bytes());
        out.put_u8(self.has_signature as u8);
        put_string(&mut out, self.algorithm.as_bytes());
        out
    }
}
