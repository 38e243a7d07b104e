//! SSH agent protocol server.
//!
//! The paired identity is listed first and signed for by the phone. Keys
//! added with `ADD_IDENTITY` live only in this process and are signed for
//! locally; only `ssh-ed25519` keys can be added.

use std::sync::Arc;

use ed25519_dalek::{Signer as _, SigningKey};
use parking_lot::Mutex;
use semver::Version;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kr_core::errors::{EnclaveError, ProtocolError};
use kr_core::notify::{cyan, green, red, yellow, Notifier};
use kr_core::profile::Profile;
use kr_core::protocol::{SignRequest, RSA_SHA2_MIN_VERSION};
use kr_core::wire::{self, UserAuthPayload, RSA_SHA2_256, RSA_SHA2_512, SSH_ED25519, SSH_RSA};
use kr_core::EnclaveClient;
use kr_crypto::hash::sha256;
use kr_crypto::random::base62_u128;

use crate::framing::{read_frame, write_frame, FrameError};

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;

pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Notification markers read by the SSH proxy command.
pub const MARKER_REJECTED: &str = "REJECTED";
pub const MARKER_HOST_KEY_MISMATCH: &str = "HOST_KEY_MISMATCH";
pub const MARKER_STOP: &str = "STOP";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("malformed agent message: {0}")]
    Wire(#[from] ProtocolError),
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("invalid private key")]
    BadKey,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    RequestIdentities,
    Sign { key_blob: Vec<u8>, data: Vec<u8>, flags: u32 },
    AddIdentity { key_type: String, body: Vec<u8> },
    RemoveIdentity { key_blob: Vec<u8> },
    RemoveAllIdentities,
    Unknown(u8),
}

impl AgentRequest {
    pub fn parse(frame: &[u8]) -> Result<Self, AgentError> {
        let mut buf = frame;
        let kind = wire::read_u8(&mut buf)?;
        Ok(match kind {
            SSH_AGENTC_REQUEST_IDENTITIES => AgentRequest::RequestIdentities,
            SSH_AGENTC_SIGN_REQUEST => {
                let key_blob = wire::read_string(&mut buf)?.to_vec();
                let data = wire::read_string(&mut buf)?.to_vec();
                let flags = if buf.is_empty() { 0 } else { wire::read_u32(&mut buf)? };
                AgentRequest::Sign { key_blob, data, flags }
            }
            SSH_AGENTC_ADD_IDENTITY => {
                let key_type = String::from_utf8(wire::read_string(&mut buf)?.to_vec())
                    .map_err(|_| ProtocolError::Wire("key type is not utf-8"))?;
                AgentRequest::AddIdentity {
                    key_type,
                    body: buf.to_vec(),
                }
            }
            SSH_AGENTC_REMOVE_IDENTITY => AgentRequest::RemoveIdentity {
                key_blob: wire::read_string(&mut buf)?.to_vec(),
            },
            SSH_AGENTC_REMOVE_ALL_IDENTITIES => AgentRequest::RemoveAllIdentities,
            other => AgentRequest::Unknown(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Success,
    Failure,
    Identities(Vec<Identity>),
    Signature(Vec<u8>),
}

impl AgentResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            AgentResponse::Success => out.push(SSH_AGENT_SUCCESS),
            AgentResponse::Failure => out.push(SSH_AGENT_FAILURE),
            AgentResponse::Identities(ids) => {
                out.push(SSH_AGENT_IDENTITIES_ANSWER);
                out.extend_from_slice(&(ids.len() as u32).to_be_bytes());
                for id in ids {
                    wire::put_string(&mut out, &id.key_blob);
                    wire::put_string(&mut out, id.comment.as_bytes());
                }
            }
            AgentResponse::Signature(blob) => {
                out.push(SSH_AGENT_SIGN_RESPONSE);
                wire::put_string(&mut out, blob);
            }
        }
        out
    }
}

// ============================================================================
// Local identities
// ============================================================================

struct LocalIdentity {
    key_blob: Vec<u8>,
    comment: String,
    key: SigningKey,
}

/// `string pk || string (seed || pk) || string comment`
fn parse_ed25519_identity(body: &[u8]) -> Result<LocalIdentity, AgentError> {
    let mut buf = body;
    let pk = wire::read_string(&mut buf)?;
    let sk = wire::read_string(&mut buf)?;
    let comment = String::from_utf8_lossy(wire::read_string(&mut buf)?).into_owned();

    let pk: [u8; 32] = pk.try_into().map_err(|_| AgentError::BadKey)?;
    if sk.len() != 64 {
        return Err(AgentError::BadKey);
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&sk[..32]);
    let key = SigningKey::from_bytes(&seed);
    if key.verifying_key().to_bytes() != pk {
        return Err(AgentError::BadKey);
    }
    Ok(LocalIdentity {
        key_blob: wire::ed25519_public_key_wire(&pk),
        comment,
        key,
    })
}

// ============================================================================
// Agent
// ============================================================================

pub struct Agent {
    client: EnclaveClient,
    identities: Mutex<Vec<LocalIdentity>>,
    silence_warnings: bool,
}

impl Agent {
    pub fn new(client: EnclaveClient, silence_warnings: bool) -> Self {
        Self {
            client,
            identities: Mutex::new(Vec::new()),
            silence_warnings,
        }
    }

    fn notifier(&self) -> &Notifier {
        self.client.notifier()
    }

    /// The paired identity, fetched from the phone if not cached yet.
    async fn paired_profile(&self) -> Option<Profile> {
        if let Some(me) = self.client.cached_me() {
            return Some(me);
        }
        if !self.client.is_paired() {
            return None;
        }
        match self.client.request_me().await {
            Ok(me) => Some(me),
            Err(e) => {
                warn!(error = %e, "could not fetch paired identity");
                None
            }
        }
    }

    pub async fn handle(&self, request: AgentRequest) -> AgentResponse {
        match request {
            AgentRequest::RequestIdentities => AgentResponse::Identities(self.list().await),
            AgentRequest::Sign { key_blob, data, flags } => self.sign(&key_blob, &data, flags).await,
            AgentRequest::AddIdentity { key_type, body } => match self.add(&key_type, &body) {
                Ok(()) => AgentResponse::Success,
                Err(e) => {
                    warn!(error = %e, "add identity failed");
                    AgentResponse::Failure
                }
            },
            AgentRequest::RemoveIdentity { key_blob } => {
                let mut ids = self.identities.lock();
                let before = ids.len();
                ids.retain(|id| id.key_blob != key_blob);
                if ids.len() < before {
                    AgentResponse::Success
                } else {
                    AgentResponse::Failure
                }
            }
            AgentRequest::RemoveAllIdentities => {
                self.identities.lock().clear();
                AgentResponse::Success
            }
            AgentRequest::Unknown(kind) => {
                debug!(kind, "unsupported agent request");
                AgentResponse::Failure
            }
        }
    }

    async fn list(&self) -> Vec<Identity> {
        let mut out = Vec::new();
        if let Some(me) = self.paired_profile().await {
            out.push(Identity {
                key_blob: me.ssh_wire_public_key.clone(),
                comment: me.email.clone(),
            });
        }
        out.extend(self.identities.lock().iter().map(|id| Identity {
            key_blob: id.key_blob.clone(),
            comment: id.comment.clone(),
        }));
        out
    }

    fn add(&self, key_type: &str, body: &[u8]) -> Result<(), AgentError> {
        if key_type != SSH_ED25519 {
            return Err(AgentError::UnsupportedKeyType(key_type.to_string()));
        }
        let identity = parse_ed25519_identity(body)?;
        let mut ids = self.identities.lock();
        ids.retain(|id| id.key_blob != identity.key_blob);
        info!(comment = %identity.comment, "added local identity");
        ids.push(identity);
        Ok(())
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> AgentResponse {
        if let Some(me) = self.paired_profile().await {
            if me.ssh_wire_public_key == key_blob {
                return self.sign_with_phone(&me, data, flags).await;
            }
        }

        let ids = self.identities.lock();
        match ids.iter().find(|id| id.key_blob == key_blob) {
            Some(id) => {
                let signature = id.key.sign(data);
                AgentResponse::Signature(wire::signature_blob(SSH_ED25519, &signature.to_bytes()))
            }
            None => {
                if !self.silence_warnings && !self.client.is_paired() {
                    self.notifier().notify(&yellow("Kryptonite ▶ Phone not paired. Run \"kr pair\" to pair."));
                }
                debug!("sign request for unknown key");
                AgentResponse::Failure
            }
        }
    }

    async fn sign_with_phone(&self, me: &Profile, data: &[u8], flags: u32) -> AgentResponse {
        let key_type = match me.key_type() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "paired identity has a malformed key");
                return AgentResponse::Failure;
            }
        };

        let (payload, prefix) = match UserAuthPayload::parse(data) {
            Ok(p) => {
                let digest = sha256(&p.session_id);
                let mut head = [0u8; 16];
                head.copy_from_slice(&digest[..16]);
                let prefix = format!("[{}]", base62_u128(u128::from_be_bytes(head)));
                (p.encode_without_public_key(), prefix)
            }
            Err(e) => {
                warn!(error = %e, "sign data is not a userauth request; forwarding as is");
                (data.to_vec(), String::new())
            }
        };
        let notify = |line: String| self.notifier().notify(&format!("{}{}", prefix, line));
        let stop = || {
            if !prefix.is_empty() {
                notify(MARKER_STOP.to_string());
            }
        };

        notify(cyan("Kryptonite ▶ Requesting SSH authentication from phone"));
        let request = SignRequest {
            data: payload,
            public_key_fingerprint: me.public_key_fingerprint().to_vec(),
            command: None,
            host_auth: None,
        };

        let signed = match self.client.request_sign(request).await {
            Ok(signed) => signed,
            Err(e) => {
                error!(error = %e, "phone signature failed");
                match &e {
                    EnclaveError::NotPaired if !self.silence_warnings => {
                        notify(yellow(&format!("Kryptonite ▶ {}", e)));
                    }
                    EnclaveError::TimedOut => {
                        notify(red(&format!("Kryptonite ▶ {}", e)));
                        notify(yellow("Kryptonite ▶ Falling back to local keys."));
                    }
                    EnclaveError::Rejected(reason) if reason == "rejected" => {
                        notify(MARKER_REJECTED.to_string());
                    }
                    EnclaveError::Rejected(reason) if reason.starts_with("host public key mismatched") => {
                        notify(MARKER_HOST_KEY_MISMATCH.to_string());
                    }
                    _ => notify(red("Kryptonite ▶ Error signing request")),
                }
                stop();
                return AgentResponse::Failure;
            }
        };

        let Some(signature) = signed.response.signature else {
            error!("sign response carried no signature");
            stop();
            return AgentResponse::Failure;
        };

        let format = signature_format(&key_type, flags, signed.enclave_version.as_ref());
        debug!(format = %format, "using signature format");
        notify(green("Kryptonite ▶ Success. Request Allowed ✔"));
        stop();
        AgentResponse::Signature(wire::signature_blob(&format, &signature))
    }
}

/// RSA keys honour the SHA-2 flags only when the phone can produce them.
pub fn signature_format(key_type: &str, flags: u32, enclave: Option<&Version>) -> String {
    if key_type != SSH_RSA {
        return key_type.to_string();
    }
    if enclave.map_or(true, |v| *v < RSA_SHA2_MIN_VERSION) {
        return SSH_RSA.to_string();
    }
    if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
        RSA_SHA2_512.to_string()
    } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
        RSA_SHA2_256.to_string()
    } else {
        SSH_RSA.to_string()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve one client until it disconnects.
pub async fn handle_connection<S>(stream: S, agent: Arc<Agent>) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let response = match AgentRequest::parse(&frame) {
            Ok(request) => agent.handle(request).await,
            Err(e) => {
                warn!(error = %e, "bad agent request");
                AgentResponse::Failure
            }
        };
        write_frame(&mut writer, &response.encode()).await?;
    }
}

/// Accept agent clients until `shutdown` flips.
pub async fn serve(listener: UnixListener, agent: Arc<Agent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let agent = agent.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, agent).await {
                            warn!(error = %e, "agent connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "agent accept failed"),
            },
            _ = shutdown.changed() => {
                info!("agent server stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kr_core::persist::MemoryPersister;
    use kr_core::testing::NoopTransport;

    fn unpaired_agent() -> Agent {
        let client = EnclaveClient::builder(Arc::new(NoopTransport::new()), Arc::new(MemoryPersister::new()))
            .build();
        Agent::new(client, true)
    }

    fn ed25519_body(seed: [u8; 32], comment: &str) -> (Vec<u8>, Vec<u8>) {
        let key = SigningKey::from_bytes(&seed);
        let pk = key.verifying_key().to_bytes();
        let mut body = Vec::new();
        wire::put_string(&mut body, &pk);
        let mut sk = seed.to_vec();
        sk.extend_from_slice(&pk);
        wire::put_string(&mut body, &sk);
        wire::put_string(&mut body, comment.as_bytes());
        (body, wire::ed25519_public_key_wire(&pk))
    }

    #[test]
    fn sign_request_flags_are_optional() {
        let mut frame = vec![SSH_AGENTC_SIGN_REQUEST];
        wire::put_string(&mut frame, b"key");
        wire::put_string(&mut frame, b"data");
        assert_eq!(
            AgentRequest::parse(&frame).unwrap(),
            AgentRequest::Sign {
                key_blob: b"key".to_vec(),
                data: b"data".to_vec(),
                flags: 0
            }
        );
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert!(matches!(AgentRequest::parse(&[]), Err(AgentError::Wire(_))));
    }

    #[test]
    fn identities_answer_layout() {
        let encoded = AgentResponse::Identities(vec![Identity {
            key_blob: vec![1, 2],
            comment: "c".into(),
        }])
        .encode();
        assert_eq!(encoded, vec![12, 0, 0, 0, 1, 0, 0, 0, 2, 1, 2, 0, 0, 0, 1, b'c']);
    }

    #[test]
    fn rsa_selectors_need_a_recent_enclave() {
        let old = Version::new(2, 2, 9);
        let new = Version::new(2, 3, 0);
        assert_eq!(signature_format(SSH_RSA, SSH_AGENT_RSA_SHA2_512, Some(&old)), SSH_RSA);
        assert_eq!(signature_format(SSH_RSA, SSH_AGENT_RSA_SHA2_512, None), SSH_RSA);
        assert_eq!(signature_format(SSH_RSA, SSH_AGENT_RSA_SHA2_512, Some(&new)), RSA_SHA2_512);
        assert_eq!(signature_format(SSH_RSA, SSH_AGENT_RSA_SHA2_256, Some(&new)), RSA_SHA2_256);
        assert_eq!(signature_format(SSH_RSA, 0, Some(&new)), SSH_RSA);
        assert_eq!(signature_format(SSH_ED25519, SSH_AGENT_RSA_SHA2_256, Some(&new)), SSH_ED25519);
    }

    #[tokio::test]
    async fn local_identity_lifecycle() {
        let agent = unpaired_agent();
        let (body, blob) = ed25519_body([7u8; 32], "laptop");

        let added = agent
            .handle(AgentRequest::AddIdentity {
                key_type: SSH_ED25519.into(),
                body,
            })
            .await;
        assert_eq!(added, AgentResponse::Success);

        let AgentResponse::Identities(ids) = agent.handle(AgentRequest::RequestIdentities).await else {
            panic!("expected identities");
        };
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].comment, "laptop");

        let AgentResponse::Signature(sig) = agent
            .handle(AgentRequest::Sign {
                key_blob: blob.clone(),
                data: b"payload".to_vec(),
                flags: 0,
            })
            .await
        else {
            panic!("expected signature");
        };
        let mut buf = &sig[..];
        assert_eq!(wire::read_string(&mut buf).unwrap(), SSH_ED25519.as_bytes());
        let raw: [u8; 64] = wire::read_string(&mut buf).unwrap().try_into().unwrap();
        let verifying = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        verifying
            .verify_strict(b"payload", &ed25519_dalek::Signature::from_bytes(&raw))
            .unwrap();

        assert_eq!(
            agent.handle(AgentRequest::RemoveIdentity { key_blob: blob.clone() }).await,
            AgentResponse::Success
        );
        assert_eq!(
            agent.handle(AgentRequest::RemoveIdentity { key_blob: blob }).await,
            AgentResponse::Failure
        );
    }

    #[tokio::test]
    async fn mismatched_ed25519_halves_are_refused() {
        let agent = unpaired_agent();
        let (mut body, _) = ed25519_body([1u8; 32], "bad");
        // seed no longer derives the declared public key
        let idx = 4 + 32 + 4;
        body[idx] ^= 1;
        assert_eq!(
            agent
                .handle(AgentRequest::AddIdentity {
                    key_type: SSH_ED25519.into(),
                    body
                })
                .await,
            AgentResponse::Failure
        );
    }

    #[tokio::test]
    async fn rsa_identities_cannot_be_added() {
        let agent = unpaired_agent();
        let response = agent
            .handle(AgentRequest::AddIdentity {
                key_type: SSH_RSA.into(),
                body: Vec::new(),
            })
            .await;
        assert_eq!(response, AgentResponse::Failure);
    }

    #[tokio::test]
    async fn unknown_key_and_opcode_fail() {
        let agent = unpaired_agent();
        let response = agent
            .handle(AgentRequest::Sign {
                key_blob: vec![0, 0, 0, 1, b'x'],
                data: Vec::new(),
                flags: 0,
            })
            .await;
        assert_eq!(response, AgentResponse::Failure);
        assert_eq!(agent.handle(AgentRequest::Unknown(99)).await, AgentResponse::Failure);
    }
}
