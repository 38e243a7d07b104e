//! Enclave client: correlates requests to the phone with its responses.
//!
//! One reader task per active pairing polls the transport and dispatches
//! decrypted responses by `request_id` to the waiting caller. Each caller
//! owns its deadlines:
//! - `alert`: if nothing (not even an ACK) arrived, notify the user and
//!   re-send through a visible push
//! - `fail`: give up with `TimedOut`; the first ACK pushes this back by the
//!   ACK delay
//! - ACK delay: re-send a request that was never acknowledged
//!
//! The pairing and the pending map sit behind separate mutexes, and
//! neither is held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use semver::Version;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::errors::{CryptoFault, EnclaveError, PairingError, ProtocolError, TransportError};
use crate::notify::{green, red, yellow, Notifier};
use crate::pairing::{PairingOptions, PairingQr, PairingSecret, Unwrapped};
use crate::persist::Persister;
use crate::profile::Profile;
use crate::protocol::{
    GitSignRequest, GitSignResponse, HostsRequest, HostsResponse, ListRequest, ListResponse,
    MeRequest, Request, RequestBody, Response, ResponseBody, SignRequest, SignResponse,
    UnpairRequest,
};
use crate::task::spawn_logged;
use crate::timeouts::{TimeoutPhases, Timeouts};
use crate::transport::{Transport, CLOCK_SKEW_NOTICE};

/// Messages held while the pairing waits for the enclave key.
const OUTGOING_QUEUE_CAP: usize = 128;
/// Back-off after a failed mailbox read.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const ME_ALERT: &str = "Kryptonite ▶ Incoming kr me request. Open Kryptonite to continue.";
const PAIR_ALERT: &str = "Kryptonite ▶ Waiting for the Kryptonite app to finish pairing.";
const SIGN_ALERT: &str = "Kryptonite ▶ Phone approval required. Respond using the Kryptonite app";
const UPGRADE_NOTICE: &str =
    "Kryptonite ▶ This version of the Kryptonite app is not supported. Please upgrade the app on your phone.";

// ============================================================================
// Results
// ============================================================================

/// A signature together with the enclave version that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Signed<T> {
    pub response: T,
    pub enclave_version: Option<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The user unpaired here.
    Local,
    /// The phone sent an `UnpairResponse`.
    Remote,
    /// A new pairing replaced this one.
    Replaced,
}

// ============================================================================
// State
// ============================================================================

struct PendingCall {
    tx: mpsc::UnboundedSender<Result<Response, EnclaveError>>,
}

struct QueuedMessage {
    message: Vec<u8>,
    alert: bool,
}

struct PairingTasks {
    reader: AbortHandle,
    ticker: AbortHandle,
}

impl PairingTasks {
    fn abort(self) {
        self.reader.abort();
        self.ticker.abort();
    }
}

struct State {
    pairing: Option<Arc<PairingSecret>>,
    cached_me: Option<Profile>,
    enclave_version: Option<Version>,
    outgoing: VecDeque<QueuedMessage>,
    tasks: Option<PairingTasks>,
    last_activity: Instant,
    stopped: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    notifier: Arc<Notifier>,
    timeouts: Timeouts,
    workstation_name: String,
    state: Mutex<State>,
    pending: Mutex<HashMap<String, PendingCall>>,
}

/// Removes a pending entry however the waiting caller exits.
struct PendingGuard<'a> {
    inner: &'a Inner,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(self.request_id);
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct EnclaveClientBuilder {
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    notifier: Arc<Notifier>,
    timeouts: Timeouts,
    workstation_name: String,
}

impl EnclaveClientBuilder {
    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Default name shown on the phone for new pairings.
    pub fn workstation_name(mut self, name: impl Into<String>) -> Self {
        self.workstation_name = name.into();
        self
    }

    pub fn build(self) -> EnclaveClient {
        EnclaveClient {
            inner: Arc::new(Inner {
                transport: self.transport,
                persister: self.persister,
                notifier: self.notifier,
                timeouts: self.timeouts,
                workstation_name: self.workstation_name,
                state: Mutex::new(State {
                    pairing: None,
                    cached_me: None,
                    enclave_version: None,
                    outgoing: VecDeque::new(),
                    tasks: None,
                    last_activity: Instant::now(),
                    stopped: false,
                }),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }
}

// ============================================================================
// EnclaveClient
// ============================================================================

#[derive(Clone)]
pub struct EnclaveClient {
    inner: Arc<Inner>,
}

impl EnclaveClient {
    pub fn builder(transport: Arc<dyn Transport>, persister: Arc<dyn Persister>) -> EnclaveClientBuilder {
        EnclaveClientBuilder {
            transport,
            persister,
            notifier: Arc::new(Notifier::disabled()),
            timeouts: Timeouts::default(),
            workstation_name: crate::dirs::machine_name(),
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.inner.timeouts
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.inner.notifier
    }

    /// Load any persisted pairing and identity and begin reading.
    pub async fn start(&self) -> Result<(), EnclaveError> {
        self.inner.state.lock().stopped = false;
        let ps = match self.inner.persister.load_pairing() {
            Ok(Some(ps)) => Arc::new(ps),
            Ok(None) => {
                info!("no persisted pairing");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "failed to load persisted pairing");
                return Ok(());
            }
        };
        let me = self.inner.persister.load_me().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load persisted identity");
            None
        });

        if let Err(e) = self.inner.transport.setup(&ps).await {
            warn!(error = %e, "mailbox setup failed");
        }
        info!(workstation = ps.workstation_name(), paired = ps.is_paired(), "loaded pairing");
        Inner::activate(&self.inner, ps, me);
        Ok(())
    }

    /// Cancel reader tasks and fail every pending call with `Canceled`.
    /// The pairing stays persisted.
    pub fn stop(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.tasks.take()
        };
        if let Some(tasks) = tasks {
            tasks.abort();
        }
        self.inner.fail_all(EnclaveError::Canceled);
        info!("enclave client stopped");
    }

    /// Start a fresh pairing, replacing any existing one.
    pub async fn pair(&self, options: PairingOptions) -> Result<PairingQr, EnclaveError> {
        let name = options
            .workstation_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.inner.workstation_name.clone());
        let ps = Arc::new(PairingSecret::generate(name)?);

        // a failed setup leaves the existing pairing untouched
        self.inner.transport.setup(&ps).await?;

        if let Some(old) = self.pairing() {
            info!("replacing existing pairing");
            self.inner.teardown(&old, Teardown::Replaced);
        }

        self.inner
            .persister
            .save_pairing(&ps)
            .map_err(|e| EnclaveError::Internal(format!("persist pairing: {}", e)))?;

        let qr = ps.qr_payload();
        info!(workstation = ps.workstation_name(), "generated new pairing");
        self.inner.state.lock().stopped = false;
        Inner::activate(&self.inner, ps, None);
        Ok(qr)
    }

    /// Forget the pairing and tell the phone, best effort.
    pub fn unpair(&self) {
        let Some(ps) = self.pairing() else {
            return;
        };
        if ps.is_paired() {
            let transport = self.inner.transport.clone();
            let notice = ps.clone();
            spawn_logged("unpair-notice", async move {
                let message = Request::new(RequestBody::Unpair(UnpairRequest {}))
                    .map_err(EnclaveError::from)
                    .and_then(|r| serde_json::to_vec(&r).map_err(EnclaveError::from));
                match message {
                    Ok(message) => {
                        if let Err(e) = transport.send_message(&notice, &message).await {
                            debug!(error = %e, "unpair notice not delivered");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to build unpair request"),
                }
            });
        }
        self.inner.teardown(&ps, Teardown::Local);
        info!("unpaired");
    }

    /// True once a pairing exists and the enclave key is known.
    pub fn is_paired(&self) -> bool {
        self.pairing().map_or(false, |ps| ps.is_paired())
    }

    pub fn pairing(&self) -> Option<Arc<PairingSecret>> {
        self.inner.state.lock().pairing.clone()
    }

    pub fn cached_me(&self) -> Option<Profile> {
        self.inner.state.lock().cached_me.clone()
    }

    /// Version the phone advertised in its most recent response.
    pub fn enclave_version(&self) -> Option<Version> {
        self.inner.state.lock().enclave_version.clone()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Send `request` and wait for its response.
    pub async fn request(
        &self,
        mut request: Request,
        phases: TimeoutPhases,
    ) -> Result<Response, EnclaveError> {
        let ps = {
            let state = self.inner.state.lock();
            if state.stopped {
                return Err(EnclaveError::Canceled);
            }
            state.pairing.clone().ok_or(EnclaveError::NotPaired)?
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request_id = self.inner.register(&mut request, tx)?;
        request.send_ack = true;
        let _guard = PendingGuard {
            inner: &self.inner,
            request_id: &request_id,
        };
        self.inner.touch();

        let message = serde_json::to_vec(&request)?;
        let component_alert = component_alert(&request.body, ps.is_paired());
        let push_text = format!("Request from {}", ps.workstation_name());
        let alert_first = request.needs_approval() && ps.requires_approval();

        debug!(request_id = %request_id, kind = request.body.name(), alert_first, "sending request");
        let start = Instant::now();
        self.inner.dispatch(&ps, &message, alert_first, &push_text).await?;

        let ack_delay = self.inner.timeouts.ack_delay;
        let alert_at = start + phases.alert;
        let mut fail_at = start + phases.fail;
        let mut retry_at = Some(start + ack_delay);
        let mut pushed = alert_first;
        let mut notified = false;
        let mut acked = false;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Ok(response)) if response.is_ack_only() => {
                        if !acked {
                            acked = true;
                            retry_at = None;
                            fail_at += ack_delay;
                            debug!(request_id = %request_id, "request acknowledged");
                        }
                    }
                    Some(Ok(response)) => {
                        debug!(
                            request_id = %request_id,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "response received"
                        );
                        return Ok(response);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(EnclaveError::Canceled),
                },
                _ = sleep_until(fail_at) => {
                    warn!(request_id = %request_id, kind = request.body.name(), "request timed out");
                    return Err(EnclaveError::TimedOut);
                }
                _ = sleep_until(alert_at), if !notified && !acked => {
                    notified = true;
                    self.inner.notifier.notify(&yellow(component_alert));
                    if !pushed {
                        pushed = true;
                        info!(request_id = %request_id, "pushing alert for request");
                        if let Err(e) = self.inner.transport.push_alert(&ps, &push_text, &message).await {
                            debug!(request_id = %request_id, error = %e, "alert push failed");
                        }
                    }
                }
                _ = sleep_until(retry_at.unwrap_or(fail_at)), if retry_at.is_some() => {
                    let now = Instant::now();
                    retry_at = (fail_at.saturating_duration_since(now) > ack_delay).then(|| now + ack_delay);
                    info!(request_id = %request_id, "resending unacknowledged request");
                    if let Err(e) = self.inner.dispatch(&ps, &message, pushed, &push_text).await {
                        debug!(request_id = %request_id, error = %e, "resend failed");
                    }
                }
            }
        }
    }

    /// The cached identity, or a fresh one from the phone.
    pub async fn request_me(&self) -> Result<Profile, EnclaveError> {
        if let Some(me) = self.cached_me() {
            return Ok(me);
        }
        self.fetch_me(MeRequest::default(), false).await
    }

    /// Ask the phone for the identity, bypassing the cache.
    pub async fn request_me_force_refresh(
        &self,
        pgp_user_id: Option<String>,
    ) -> Result<Profile, EnclaveError> {
        self.fetch_me(MeRequest { pgp_user_id }, false).await
    }

    /// Wait for a new pairing to complete and deliver the identity. Allowed
    /// before the enclave key arrives; the request is queued until then.
    pub async fn await_pairing_me(&self, me_request: MeRequest) -> Result<Profile, EnclaveError> {
        self.fetch_me(me_request, true).await
    }

    async fn fetch_me(&self, me_request: MeRequest, is_pairing: bool) -> Result<Profile, EnclaveError> {
        if !is_pairing && !self.is_paired() {
            return Err(EnclaveError::NotPaired);
        }
        let phases = if is_pairing {
            TimeoutPhases::new(self.inner.timeouts.me.alert, self.inner.timeouts.pair.fail)
        } else {
            self.inner.timeouts.me
        };
        let response = self
            .request(Request::new(RequestBody::Me(me_request))?, phases)
            .await?;
        match response.body {
            Some(ResponseBody::Me(me)) => {
                self.inner.state.lock().cached_me = Some(me.me.clone());
                if let Err(e) = self.inner.persister.save_me(&me.me) {
                    error!(error = %e, "failed to persist identity");
                }
                if let Err(e) = self.inner.persister.save_ssh_public_key(&me.me) {
                    error!(error = %e, "failed to write ssh public key");
                }
                Ok(me.me)
            }
            _ => Err(EnclaveError::Internal("response missing profile".into())),
        }
    }

    /// Ask the phone to sign. A phone-side error becomes `Rejected`.
    pub async fn request_sign(&self, sign: SignRequest) -> Result<Signed<SignResponse>, EnclaveError> {
        let response = self
            .request(Request::new(RequestBody::Sign(sign))?, self.inner.timeouts.sign)
            .await?;
        let enclave_version = response.version.clone();
        match response.body {
            Some(ResponseBody::Sign(sign)) => {
                if let Some(e) = sign.error {
                    return Err(EnclaveError::Rejected(e));
                }
                Ok(Signed {
                    response: sign,
                    enclave_version,
                })
            }
            _ => Err(EnclaveError::Internal("response missing sign_response".into())),
        }
    }

    pub async fn request_git_sign(
        &self,
        git_sign: GitSignRequest,
    ) -> Result<Signed<GitSignResponse>, EnclaveError> {
        let response = self
            .request(Request::new(RequestBody::GitSign(git_sign))?, self.inner.timeouts.sign)
            .await?;
        let enclave_version = response.version.clone();
        match response.body {
            Some(ResponseBody::GitSign(git)) => {
                if let Some(e) = git.error {
                    return Err(EnclaveError::Rejected(e));
                }
                Ok(Signed {
                    response: git,
                    enclave_version,
                })
            }
            _ => Err(EnclaveError::Internal("response missing git_sign_response".into())),
        }
    }

    pub async fn request_list(&self, list: ListRequest) -> Result<ListResponse, EnclaveError> {
        let response = self
            .request(Request::new(RequestBody::List(list))?, self.inner.timeouts.sign)
            .await?;
        match response.body {
            Some(ResponseBody::List(list)) => Ok(list),
            _ => Err(EnclaveError::Internal("response missing list_response".into())),
        }
    }

    pub async fn request_hosts(&self) -> Result<HostsResponse, EnclaveError> {
        let response = self
            .request(Request::new(RequestBody::Hosts(HostsRequest {}))?, self.inner.timeouts.sign)
            .await?;
        match response.body {
            Some(ResponseBody::Hosts(hosts)) => Ok(hosts),
            _ => Err(EnclaveError::Internal("response missing hosts_response".into())),
        }
    }

    /// Forward an already-built request, choosing phases by its kind.
    /// No-ops are sent without waiting and answered with an empty response.
    pub async fn request_generic(&self, request: Request) -> Result<Response, EnclaveError> {
        let phases = match &request.body {
            RequestBody::NoOp => {
                let id = request.request_id.clone();
                self.request_noop().await?;
                return Ok(Response::new(id, None));
            }
            RequestBody::Me(_) | RequestBody::Unpair(_) => self.inner.timeouts.me,
            _ => self.inner.timeouts.sign,
        };
        self.request(request, phases).await
    }

    /// Fire a payload-less request that lets the phone drain its queue.
    pub async fn request_noop(&self) -> Result<(), EnclaveError> {
        let Some(ps) = self.pairing() else {
            return Ok(());
        };
        self.inner.send_noop(&ps).await
    }
}

fn component_alert(body: &RequestBody, paired: bool) -> &'static str {
    match body {
        RequestBody::Me(_) if !paired => PAIR_ALERT,
        RequestBody::Me(_) => ME_ALERT,
        _ => SIGN_ALERT,
    }
}

// ============================================================================
// Internals
// ============================================================================

impl Inner {
    fn is_current(&self, ps: &Arc<PairingSecret>) -> bool {
        self.state
            .lock()
            .pairing
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, ps))
    }

    /// Add a pending entry for `request`. A missing id, or one already in
    /// flight, is replaced with a fresh id.
    fn register(
        &self,
        request: &mut Request,
        tx: mpsc::UnboundedSender<Result<Response, EnclaveError>>,
    ) -> Result<String, EnclaveError> {
        loop {
            {
                let mut pending = self.pending.lock();
                if !request.request_id.is_empty() && !pending.contains_key(&request.request_id) {
                    pending.insert(request.request_id.clone(), PendingCall { tx });
                    return Ok(request.request_id.clone());
                }
            }
            if !request.request_id.is_empty() {
                warn!(request_id = %request.request_id, "request id already in flight; assigning a new one");
            }
            request.request_id =
                kr_crypto::random::rand_128_base62().map_err(|_| ProtocolError::Rng)?;
        }
    }

    fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Install `ps` as the current pairing and spawn its reader and no-op
    /// ticker.
    fn activate(this: &Arc<Self>, ps: Arc<PairingSecret>, me: Option<Profile>) {
        let reader = spawn_logged("mailbox-reader", read_loop(Arc::downgrade(this), ps.clone()));
        let ticker = spawn_logged(
            "noop-ticker",
            noop_loop(Arc::downgrade(this), ps.clone(), this.timeouts.noop_interval),
        );
        let previous = {
            let mut state = this.state.lock();
            state.pairing = Some(ps);
            state.cached_me = me;
            state.outgoing.clear();
            state.last_activity = Instant::now();
            state.tasks.replace(PairingTasks { reader, ticker })
        };
        if let Some(tasks) = previous {
            tasks.abort();
        }
    }

    /// Send through the approval-aware path. A pairing still waiting for
    /// the enclave key queues the message instead.
    async fn dispatch(
        &self,
        ps: &PairingSecret,
        message: &[u8],
        alert: bool,
        push_text: &str,
    ) -> Result<(), EnclaveError> {
        match self.post(ps, message, alert, push_text).await {
            Ok(()) => Ok(()),
            Err(TransportError::Pairing(PairingError::WaitingForKey)) => {
                // The reader flushes under the state lock after unwrapping, so
                // a key that arrived since the send failed means no flush is
                // coming for this message.
                let queued = {
                    let mut state = self.state.lock();
                    if ps.is_paired() {
                        false
                    } else {
                        if state.outgoing.len() >= OUTGOING_QUEUE_CAP {
                            warn!("outgoing queue full; dropping oldest message");
                            state.outgoing.pop_front();
                        }
                        state.outgoing.push_back(QueuedMessage {
                            message: message.to_vec(),
                            alert,
                        });
                        debug!(queued = state.outgoing.len(), "queued message until pairing completes");
                        true
                    }
                };
                if queued {
                    Ok(())
                } else {
                    self.send_once(ps, message, alert, push_text).await
                }
            }
            Err(TransportError::ClockSkew) => {
                self.notifier.notify(&red(CLOCK_SKEW_NOTICE));
                Err(EnclaveError::Transport(TransportError::ClockSkew))
            }
            Err(e) => {
                warn!(error = %e, "send failed; will retry");
                Ok(())
            }
        }
    }

    async fn post(
        &self,
        ps: &PairingSecret,
        message: &[u8],
        alert: bool,
        push_text: &str,
    ) -> Result<(), TransportError> {
        if alert {
            self.transport.push_alert(ps, push_text, message).await
        } else {
            self.transport.send_message(ps, message).await
        }
    }

    /// Post without queueing; used once the enclave key is known.
    async fn send_once(
        &self,
        ps: &PairingSecret,
        message: &[u8],
        alert: bool,
        push_text: &str,
    ) -> Result<(), EnclaveError> {
        match self.post(ps, message, alert, push_text).await {
            Ok(()) => Ok(()),
            Err(TransportError::ClockSkew) => {
                self.notifier.notify(&red(CLOCK_SKEW_NOTICE));
                Err(EnclaveError::Transport(TransportError::ClockSkew))
            }
            Err(e) => {
                warn!(error = %e, "send failed; will retry");
                Ok(())
            }
        }
    }

    async fn send_noop(&self, ps: &PairingSecret) -> Result<(), EnclaveError> {
        let request = Request::new(RequestBody::NoOp)?;
        let message = serde_json::to_vec(&request)?;
        self.touch();
        match self.transport.send_message(ps, &message).await {
            Ok(()) => {}
            Err(TransportError::Pairing(PairingError::WaitingForKey)) => {}
            Err(e) => debug!(error = %e, "no-op send failed"),
        }
        Ok(())
    }

    async fn flush_outgoing(&self, ps: &PairingSecret) {
        let queued: Vec<QueuedMessage> = self.state.lock().outgoing.drain(..).collect();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "flushing queued messages");
        let push_text = format!("Request from {}", ps.workstation_name());
        for q in queued {
            if let Err(e) = self.dispatch(ps, &q.message, q.alert, &push_text).await {
                warn!(error = %e, "failed to flush queued message");
            }
        }
    }

    fn fail_all(&self, err: EnclaveError) {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), error = %err, "failing pending requests");
        }
        for call in drained {
            let _ = call.tx.send(Err(err.clone()));
        }
    }

    /// Save `ps` unless it was replaced or removed. Held under the state
    /// lock so a teardown cannot slip between the check and the write.
    fn persist_pairing(&self, ps: &Arc<PairingSecret>) {
        let state = self.state.lock();
        if !state.pairing.as_ref().map_or(false, |p| Arc::ptr_eq(p, ps)) {
            debug!("not persisting a pairing that is no longer current");
            return;
        }
        if let Err(e) = self.persister.save_pairing(ps) {
            error!(error = %e, "failed to persist pairing");
        }
    }

    /// Drop `ps` if it is still current: stop its tasks, fail pending
    /// calls, delete persisted state and restart the notification stream.
    fn teardown(&self, ps: &Arc<PairingSecret>, reason: Teardown) {
        let tasks = {
            let mut state = self.state.lock();
            if !state.pairing.as_ref().map_or(false, |p| Arc::ptr_eq(p, ps)) {
                return;
            }
            state.pairing = None;
            state.cached_me = None;
            state.outgoing.clear();
            state.tasks.take()
        };

        let err = match reason {
            Teardown::Local | Teardown::Remote => EnclaveError::RemoteUnpair,
            Teardown::Replaced => EnclaveError::Canceled,
        };
        self.fail_all(err);

        if let Err(e) = self.persister.delete_pairing() {
            error!(error = %e, "failed to delete pairing");
        }
        if let Err(e) = self.persister.delete_me() {
            error!(error = %e, "failed to delete identity");
        }
        if let Err(e) = self.persister.delete_ssh_public_key() {
            error!(error = %e, "failed to delete ssh public key");
        }
        self.notifier.reinit();
        if reason == Teardown::Remote {
            self.notifier.notify(&red("Kryptonite ▶ Your phone unpaired this workstation."));
        }

        if let Some(tasks) = tasks {
            tasks.abort();
        }
    }

    async fn handle_envelope(&self, ps: &Arc<PairingSecret>, envelope: &[u8]) {
        match ps.unwrap_or_decrypt(envelope) {
            Ok(Unwrapped::KeyUnwrapped) => {
                info!(workstation = ps.workstation_name(), "received enclave public key");
                self.persist_pairing(ps);
                self.notifier.notify(&green("Kryptonite ▶ Paired successfully"));
                self.flush_outgoing(ps).await;
            }
            Ok(Unwrapped::Discarded) => debug!("discarding duplicate wrapped key"),
            Ok(Unwrapped::Ciphertext(ct)) => match ps.decrypt_message(&ct) {
                Ok(plaintext) => self.handle_message(ps, &plaintext),
                Err(e) => warn!(error = %e, "failed to decrypt envelope"),
            },
            Err(PairingError::Crypto(CryptoFault::WrappedKeyUnsupported)) => {
                warn!("received unsupported wrapped-key envelope");
                self.notifier.notify(&red(UPGRADE_NOTICE));
            }
            Err(e) => warn!(error = %e, "failed to unwrap envelope"),
        }
    }

    fn handle_message(&self, ps: &Arc<PairingSecret>, plaintext: &[u8]) {
        let response: Response = match serde_json::from_slice(plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discarding malformed response");
                return;
            }
        };

        if let Some(version) = &response.version {
            self.state.lock().enclave_version = Some(version.clone());
        }

        if response.is_unpair() {
            info!("phone requested unpair");
            self.teardown(ps, Teardown::Remote);
            return;
        }

        let mut changed = false;
        if let Some(until) = response.approved_until {
            changed |= ps.set_approved_until(Some(until));
        }
        if let Some(arn) = &response.sns_endpoint_arn {
            changed |= ps.set_sns_endpoint_arn(Some(arn.clone()));
        }
        if let Some(tracking_id) = &response.tracking_id {
            changed |= ps.set_tracking_id(Some(tracking_id.clone()));
        }
        if changed {
            self.persist_pairing(ps);
        }

        let tx = {
            let mut pending = self.pending.lock();
            if response.is_ack_only() {
                pending.get(&response.request_id).map(|p| p.tx.clone())
            } else {
                pending.remove(&response.request_id).map(|p| p.tx)
            }
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!(request_id = %response.request_id, "dropping response for unknown request"),
        }
    }
}

// ============================================================================
// Background loops
// ============================================================================

async fn read_loop(inner: Weak<Inner>, ps: Arc<PairingSecret>) {
    debug!(workstation = ps.workstation_name(), "mailbox reader started");
    loop {
        let Some(this) = inner.upgrade() else {
            return;
        };
        if !this.is_current(&ps) {
            return;
        }
        match this.transport.read(&this.notifier, &ps).await {
            Ok(envelopes) => {
                for envelope in envelopes {
                    if !this.is_current(&ps) {
                        return;
                    }
                    this.handle_envelope(&ps, &envelope).await;
                }
            }
            Err(TransportError::ClockSkew) => {
                this.fail_all(EnclaveError::Transport(TransportError::ClockSkew));
                drop(this);
                sleep(READ_ERROR_BACKOFF).await;
            }
            Err(e) => {
                warn!(error = %e, "mailbox read failed");
                drop(this);
                sleep(READ_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn noop_loop(inner: Weak<Inner>, ps: Arc<PairingSecret>, interval: Duration) {
    loop {
        sleep(interval).await;
        let Some(this) = inner.upgrade() else {
            return;
        };
        if !this.is_current(&ps) {
            return;
        }
        if ps.is_paired() && this.idle_for() >= interval {
            debug!("sending idle no-op");
            let _ = this.send_noop(&ps).await;
        }
    }
}
