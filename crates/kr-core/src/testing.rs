//! In-process fake phones for exercising the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use kr_crypto::{box_open, box_seal, KeyPair, KEY_SIZE};

use crate::errors::{PairingError, TransportError};
use crate::notify::Notifier;
use crate::pairing::{wrap_enclave_public_key, PairingSecret, HEADER_CIPHERTEXT};
use crate::profile::Profile;
use crate::protocol::{
    now_unix, GitSignResponse, HostKeyPolicy, HostsResponse, ListResponse, MeResponse, Request,
    RequestBody, Response, ResponseBody, SignResponse, UnpairResponse,
};
use crate::transport::Transport;

pub use crate::transport::NoopTransport;

/// Produces a raw signature over the given bytes.
pub type Signer = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

const DEFAULT_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Enclave key material
// ============================================================================

/// The phone half of each pairing, keyed by workstation public key.
#[derive(Default)]
struct FakeEnclave {
    keys: Mutex<HashMap<[u8; KEY_SIZE], KeyPair>>,
}

impl FakeEnclave {
    /// Wrapped-key envelope, the first time a workstation key is seen.
    fn pairing_envelope(&self, ps: &PairingSecret) -> Result<Option<Vec<u8>>, TransportError> {
        let ws_pk = *ps.workstation_public_key();
        let mut keys = self.keys.lock();
        if keys.contains_key(&ws_pk) {
            return Ok(None);
        }
        let enclave = KeyPair::generate().map_err(PairingError::from)?;
        let envelope = wrap_enclave_public_key(&enclave.public, &ws_pk)?;
        keys.insert(ws_pk, enclave);
        Ok(Some(envelope))
    }

    /// Open a workstation envelope the way the phone would.
    fn open_request(&self, ps: &PairingSecret, envelope: &[u8]) -> Option<Request> {
        let keys = self.keys.lock();
        let enclave = keys.get(ps.workstation_public_key())?;
        let body = envelope.strip_prefix(&[HEADER_CIPHERTEXT])?;
        let plaintext = box_open(body, ps.workstation_public_key(), enclave.secret_bytes()).ok()?;
        match serde_json::from_slice(&plaintext) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "fake enclave received malformed request");
                None
            }
        }
    }

    fn seal_response(&self, ps: &PairingSecret, response: &Response) -> Option<Vec<u8>> {
        let keys = self.keys.lock();
        let enclave = keys.get(ps.workstation_public_key())?;
        let json = serde_json::to_vec(response).ok()?;
        let boxed = box_seal(&json, ps.workstation_public_key(), enclave.secret_bytes()).ok()?;
        let mut out = Vec::with_capacity(1 + boxed.len());
        out.push(HEADER_CIPHERTEXT);
        out.extend_from_slice(&boxed);
        Some(out)
    }
}

// ============================================================================
// ImmediatePairTransport
// ============================================================================

/// Completes pairing on the first read and records every request, but
/// never answers.
pub struct ImmediatePairTransport {
    enclave: FakeEnclave,
    sent: Mutex<Vec<Request>>,
    poll: Duration,
}

impl ImmediatePairTransport {
    pub fn new() -> Self {
        Self {
            enclave: FakeEnclave::default(),
            sent: Mutex::new(Vec::new()),
            poll: DEFAULT_POLL,
        }
    }

    /// Requests received so far, in arrival order.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    fn record(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError> {
        let envelope = ps.encrypt_message(message)?;
        if let Some(request) = self.enclave.open_request(ps, &envelope) {
            self.sent.lock().push(request);
        }
        Ok(())
    }
}

impl Default for ImmediatePairTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ImmediatePairTransport {
    async fn setup(&self, _ps: &PairingSecret) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push_alert(
        &self,
        ps: &PairingSecret,
        _alert_text: &str,
        message: &[u8],
    ) -> Result<(), TransportError> {
        self.record(ps, message)
    }

    async fn send_message(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError> {
        self.record(ps, message)
    }

    async fn read(
        &self,
        _notifier: &Notifier,
        ps: &PairingSecret,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        if let Some(envelope) = self.enclave.pairing_envelope(ps)? {
            return Ok(vec![envelope]);
        }
        tokio::time::sleep(self.poll).await;
        Ok(Vec::new())
    }
}

// ============================================================================
// ResponseTransport
// ============================================================================

enum Outgoing {
    Response(Response),
    /// Sealed correctly, then corrupted.
    Tampered(Response),
    Raw(Vec<u8>),
}

#[derive(Default)]
struct Outbox {
    ready: VecDeque<Outgoing>,
    held: Vec<Response>,
}

#[derive(Default)]
struct Shared {
    enclave: FakeEnclave,
    outbox: Mutex<Outbox>,
    wake: Notify,
    alerts_sent: AtomicUsize,
    messages_sent: AtomicUsize,
    sent_noops: AtomicUsize,
}

impl Shared {
    fn deliver(&self, item: Outgoing) {
        self.outbox.lock().ready.push_back(item);
        self.wake.notify_waiters();
    }
}

/// Fake phone that pairs immediately and answers requests with a fixed
/// profile and signer.
pub struct ResponseTransport {
    shared: Arc<Shared>,
    me: Profile,
    signer: Signer,
    respond_to_alert_only: bool,
    do_not_respond: bool,
    ack: bool,
    respond_after_ack: Option<Duration>,
    approve_for: Option<Duration>,
    release_reversed_after: Option<usize>,
    reject_with: Option<String>,
    host_key_policy: Option<HostKeyPolicy>,
    poll: Duration,
}

impl ResponseTransport {
    pub fn new(me: Profile, signer: Signer) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            me,
            signer,
            respond_to_alert_only: false,
            do_not_respond: false,
            ack: false,
            respond_after_ack: None,
            approve_for: None,
            release_reversed_after: None,
            reject_with: None,
            host_key_policy: None,
            poll: DEFAULT_POLL,
        }
    }

    /// Ignore silent sends; answer only push alerts.
    pub fn respond_to_alert_only(mut self) -> Self {
        self.respond_to_alert_only = true;
        self
    }

    /// Drop every request.
    pub fn do_not_respond(mut self) -> Self {
        self.do_not_respond = true;
        self
    }

    /// Answer requests that ask for it with an ACK only.
    pub fn with_ack(mut self) -> Self {
        self.ack = true;
        self
    }

    /// After the ACK, deliver the full response once `delay` has passed.
    pub fn respond_after_ack(mut self, delay: Duration) -> Self {
        self.ack = true;
        self.respond_after_ack = Some(delay);
        self
    }

    /// Open an approval window of `window` with every response.
    pub fn approve_for(mut self, window: Duration) -> Self {
        self.approve_for = Some(window);
        self
    }

    /// Hold responses until `n` are ready, then deliver them newest first.
    pub fn release_reversed_after(mut self, n: usize) -> Self {
        self.release_reversed_after = Some(n);
        self
    }

    /// Answer signing requests with `error` instead of a signature.
    pub fn reject_with(mut self, error: impl Into<String>) -> Self {
        self.reject_with = Some(error.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = Some(policy);
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn alerts_sent(&self) -> usize {
        self.shared.alerts_sent.load(Ordering::SeqCst)
    }

    pub fn messages_sent(&self) -> usize {
        self.shared.messages_sent.load(Ordering::SeqCst)
    }

    pub fn sent_noops(&self) -> usize {
        self.shared.sent_noops.load(Ordering::SeqCst)
    }

    /// Queue an `UnpairResponse` as if the user unpaired on the phone.
    pub fn remote_unpair(&self) {
        self.inject_response(Response::new("", Some(ResponseBody::Unpair(UnpairResponse {}))));
    }

    /// Queue a response, sealed for whichever pairing reads next.
    pub fn inject_response(&self, response: Response) {
        self.shared.deliver(Outgoing::Response(response));
    }

    /// Queue a response whose last ciphertext byte is flipped.
    pub fn inject_tampered_response(&self, response: Response) {
        self.shared.deliver(Outgoing::Tampered(response));
    }

    /// Queue an envelope exactly as given.
    pub fn inject_envelope(&self, envelope: Vec<u8>) {
        self.shared.deliver(Outgoing::Raw(envelope));
    }

    fn response_for(&self, request: &Request) -> Response {
        let body = match &request.body {
            RequestBody::NoOp => None,
            RequestBody::Me(_) => Some(ResponseBody::Me(MeResponse {
                me: self.me.clone(),
            })),
            RequestBody::Sign(sign) => {
                let response = if let Some(error) = &self.reject_with {
                    SignResponse {
                        error: Some(error.clone()),
                        ..Default::default()
                    }
                } else if sign.public_key_fingerprint != self.me.public_key_fingerprint() {
                    SignResponse {
                        error: Some("unknown key".into()),
                        ..Default::default()
                    }
                } else {
                    SignResponse {
                        signature: Some((self.signer)(&sign.data)),
                        error: None,
                        host_key_policy: sign.host_auth.as_ref().and(self.host_key_policy),
                    }
                };
                Some(ResponseBody::Sign(response))
            }
            RequestBody::GitSign(git) => {
                let message = git
                    .commit
                    .as_ref()
                    .map(|c| c.message.clone())
                    .or_else(|| git.tag.as_ref().map(|t| t.message.clone()))
                    .unwrap_or_default();
                let response = match &self.reject_with {
                    Some(error) => GitSignResponse {
                        signature: None,
                        error: Some(error.clone()),
                    },
                    None => GitSignResponse {
                        signature: Some((self.signer)(&message)),
                        error: None,
                    },
                };
                Some(ResponseBody::GitSign(response))
            }
            RequestBody::Unpair(_) => Some(ResponseBody::Unpair(UnpairResponse {})),
            RequestBody::CreateTeam(v) => Some(ResponseBody::CreateTeam(v.clone())),
            RequestBody::AdminKey(v) => Some(ResponseBody::AdminKey(v.clone())),
            RequestBody::List(_) => Some(ResponseBody::List(ListResponse {
                profiles: vec![self.me.clone()],
            })),
            RequestBody::Hosts(_) => Some(ResponseBody::Hosts(HostsResponse {
                pgp_user_ids: vec![self.me.email.clone()],
                hosts: Vec::new(),
            })),
        };
        let mut response = Response::new(request.request_id.clone(), body);
        response.approved_until = self.approve_for.map(|w| now_unix() + w.as_secs() as i64);
        response
    }

    fn enqueue(&self, response: Response) {
        let Some(n) = self.release_reversed_after else {
            self.shared.deliver(Outgoing::Response(response));
            return;
        };
        let mut outbox = self.shared.outbox.lock();
        outbox.held.push(response);
        if outbox.held.len() >= n {
            let held: Vec<Response> = outbox.held.drain(..).rev().collect();
            outbox.ready.extend(held.into_iter().map(Outgoing::Response));
            drop(outbox);
            self.shared.wake.notify_waiters();
        }
    }

    fn receive(&self, ps: &PairingSecret, message: &[u8], is_alert: bool) -> Result<(), TransportError> {
        let envelope = ps.encrypt_message(message)?;
        let Some(request) = self.shared.enclave.open_request(ps, &envelope) else {
            return Ok(());
        };

        if request.is_noop() {
            self.shared.sent_noops.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        if is_alert {
            self.shared.alerts_sent.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.messages_sent.fetch_add(1, Ordering::SeqCst);
        }

        if self.do_not_respond || (self.respond_to_alert_only && !is_alert) {
            return Ok(());
        }

        if request.send_ack && self.ack {
            let mut ack = Response::new(request.request_id.clone(), None);
            ack.ack = true;
            self.shared.deliver(Outgoing::Response(ack));

            if let Some(delay) = self.respond_after_ack {
                let shared = self.shared.clone();
                let response = self.response_for(&request);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.deliver(Outgoing::Response(response));
                });
            }
            return Ok(());
        }

        self.enqueue(self.response_for(&request));
        Ok(())
    }

    fn drain(&self, ps: &PairingSecret, out: &mut Vec<Vec<u8>>) {
        let ready: Vec<Outgoing> = self.shared.outbox.lock().ready.drain(..).collect();
        for item in ready {
            match item {
                Outgoing::Raw(envelope) => out.push(envelope),
                Outgoing::Response(response) => {
                    if let Some(envelope) = self.shared.enclave.seal_response(ps, &response) {
                        out.push(envelope);
                    }
                }
                Outgoing::Tampered(response) => {
                    if let Some(mut envelope) = self.shared.enclave.seal_response(ps, &response) {
                        if let Some(last) = envelope.last_mut() {
                            *last ^= 0xff;
                        }
                        out.push(envelope);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for ResponseTransport {
    async fn setup(&self, _ps: &PairingSecret) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push_alert(
        &self,
        ps: &PairingSecret,
        _alert_text: &str,
        message: &[u8],
    ) -> Result<(), TransportError> {
        self.receive(ps, message, true)
    }

    async fn send_message(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError> {
        self.receive(ps, message, false)
    }

    async fn read(
        &self,
        _notifier: &Notifier,
        ps: &PairingSecret,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut out = Vec::new();
        if let Some(envelope) = self.shared.enclave.pairing_envelope(ps)? {
            out.push(envelope);
        }
        self.drain(ps, &mut out);
        if out.is_empty() {
            let _ = tokio::time::timeout(self.poll, self.shared.wake.notified()).await;
            self.drain(ps, &mut out);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::Unwrapped;
    use crate::protocol::MeRequest;
    use crate::wire::ed25519_public_key_wire;

    fn me() -> Profile {
        Profile {
            ssh_wire_public_key: ed25519_public_key_wire(&[1u8; 32]),
            email: "hello@krypt.co".into(),
            pgp_public_key: None,
        }
    }

    fn signer() -> Signer {
        Arc::new(|data: &[u8]| data.iter().rev().copied().collect())
    }

    async fn pair(t: &dyn Transport, ps: &PairingSecret) {
        let envelopes = t.read(&Notifier::disabled(), ps).await.unwrap();
        assert_eq!(ps.unwrap_or_decrypt(&envelopes[0]).unwrap(), Unwrapped::KeyUnwrapped);
    }

    #[tokio::test]
    async fn immediate_pair_delivers_key_once() {
        let t = ImmediatePairTransport::new();
        let ps = PairingSecret::generate("ws").unwrap();
        pair(&t, &ps).await;
        assert!(t.read(&Notifier::disabled(), &ps).await.unwrap().is_empty());

        let req = Request::new(RequestBody::Me(MeRequest::default())).unwrap();
        t.send_message(&ps, &serde_json::to_vec(&req).unwrap()).await.unwrap();
        assert_eq!(t.sent_requests(), vec![req]);
    }

    #[tokio::test]
    async fn response_transport_answers_me() {
        let t = ResponseTransport::new(me(), signer());
        let ps = PairingSecret::generate("ws").unwrap();
        pair(&t, &ps).await;

        let req = Request::new(RequestBody::Me(MeRequest::default())).unwrap();
        t.push_alert(&ps, "alert", &serde_json::to_vec(&req).unwrap()).await.unwrap();
        assert_eq!(t.alerts_sent(), 1);

        let envelopes = t.read(&Notifier::disabled(), &ps).await.unwrap();
        let Unwrapped::Ciphertext(ct) = ps.unwrap_or_decrypt(&envelopes[0]).unwrap() else {
            panic!("expected ciphertext");
        };
        let resp: Response = serde_json::from_slice(&ps.decrypt_message(&ct).unwrap()).unwrap();
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(resp.body, Some(ResponseBody::Me(MeResponse { me: me() })));
    }

    #[tokio::test]
    async fn sends_before_pairing_wait_for_key() {
        let t = ResponseTransport::new(me(), signer());
        let ps = PairingSecret::generate("ws").unwrap();
        assert_eq!(
            t.send_message(&ps, b"{}").await,
            Err(TransportError::Pairing(PairingError::WaitingForKey))
        );
    }

    #[tokio::test]
    async fn noops_are_counted_not_answered() {
        let t = ResponseTransport::new(me(), signer());
        let ps = PairingSecret::generate("ws").unwrap();
        pair(&t, &ps).await;

        let noop = Request::new(RequestBody::NoOp).unwrap();
        t.send_message(&ps, &serde_json::to_vec(&noop).unwrap()).await.unwrap();
        assert_eq!(t.sent_noops(), 1);
        assert_eq!(t.messages_sent(), 0);
    }
}
