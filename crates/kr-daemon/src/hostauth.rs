//! Host-key verification socket.
//!
//! A wrapped SSH transport sends one frame per connection describing the
//! host key it was offered. Keys already in `known_hosts` pass without
//! involving the phone; anything else is forwarded as a host-auth signing
//! request and recorded once the phone approves it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kr_core::errors::{EnclaveError, PersistError};
use kr_core::known_hosts::{host_pattern, HostKeyStatus, KnownHosts};
use kr_core::persist::Persister;
use kr_core::protocol::{b64, now_unix, HostAuth, HostKeyPolicy, SignRequest};
use kr_core::EnclaveClient;

use crate::framing::{read_frame, write_frame, FrameError};

#[derive(Debug, thiserror::Error)]
pub enum HostAuthError {
    #[error("malformed host-auth request: {0}")]
    BadRequest(String),
    #[error("phone not paired")]
    NotPaired,
    #[error(transparent)]
    Enclave(#[from] EnclaveError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuthRequest {
    pub host: String,
    pub port: u16,
    #[serde(with = "b64")]
    pub host_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuthReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostAuthReply {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn err(e: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(e.to_string()),
        }
    }
}

pub struct HostAuthServer {
    client: EnclaveClient,
    persister: Arc<dyn Persister>,
    known_hosts: Mutex<KnownHosts>,
    trusted_ttl: Duration,
}

impl HostAuthServer {
    pub fn new(client: EnclaveClient, persister: Arc<dyn Persister>, trusted_ttl: Duration) -> Self {
        let known_hosts = KnownHosts::load(persister.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load known_hosts; starting empty");
            KnownHosts::default()
        });
        Self {
            client,
            persister,
            known_hosts: Mutex::new(known_hosts),
            trusted_ttl,
        }
    }

    pub async fn verify(&self, request: &HostAuthRequest) -> Result<(), HostAuthError> {
        if request.host.is_empty() || request.host_key.is_empty() {
            return Err(HostAuthError::BadRequest("host and host_key are required".into()));
        }

        let status = self
            .known_hosts
            .lock()
            .lookup(&request.host, request.port, &request.host_key, now_unix());
        match status {
            HostKeyStatus::Match => {
                debug!(host = %request.host, "host key matches cache");
                return Ok(());
            }
            HostKeyStatus::Mismatch => {
                warn!(host = %request.host, port = request.port, "host key differs from cached entry");
            }
            HostKeyStatus::Unknown => {}
        }

        let me = match self.client.cached_me() {
            Some(me) => me,
            None if self.client.is_paired() => self.client.request_me().await?,
            None => return Err(HostAuthError::NotPaired),
        };

        let sign = SignRequest {
            data: request.host_key.clone(),
            public_key_fingerprint: me.public_key_fingerprint().to_vec(),
            command: None,
            host_auth: Some(HostAuth {
                host_key: request.host_key.clone(),
                signature: None,
                host_names: vec![host_pattern(&request.host, request.port)],
            }),
        };
        let signed = self.client.request_sign(sign).await?;
        let policy = signed
            .response
            .host_key_policy
            .unwrap_or(HostKeyPolicy::TrustedOnce);

        {
            // saves are ordered by the lock
            let mut known = self.known_hosts.lock();
            let now = now_unix();
            known.prune(now);
            known.insert(&request.host, request.port, &request.host_key, policy, self.trusted_ttl, now);
            known.save(self.persister.as_ref())?;
        }
        info!(host = %request.host, port = request.port, ?policy, "host key approved");
        Ok(())
    }

    async fn answer(&self, frame: &[u8]) -> HostAuthReply {
        let request: HostAuthRequest = match serde_json::from_slice(frame) {
            Ok(r) => r,
            Err(e) => return HostAuthReply::err(HostAuthError::BadRequest(e.to_string())),
        };
        match self.verify(&request).await {
            Ok(()) => HostAuthReply::ok(),
            Err(e) => {
                warn!(host = %request.host, error = %e, "host verification failed");
                HostAuthReply::err(e)
            }
        }
    }
}

pub async fn handle_connection<S>(mut stream: S, server: Arc<HostAuthServer>) -> Result<(), HostAuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_frame(&mut stream).await?;
    let reply = server.answer(&frame).await;
    let body = serde_json::to_vec(&reply).map_err(|e| HostAuthError::BadRequest(e.to_string()))?;
    write_frame(&mut stream, &body).await?;
    Ok(())
}

pub async fn serve(listener: UnixListener, server: Arc<HostAuthServer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, server).await {
                            debug!(error = %e, "host-auth connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "host-auth accept failed"),
            },
            _ = shutdown.changed() => {
                info!("host-auth server stopping");
                return;
            }
        }
    }
}
