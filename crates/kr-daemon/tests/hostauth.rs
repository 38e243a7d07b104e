//! Host-key verification over the host-auth socket.

use std::sync::Arc;
use std::time::Duration;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::time::sleep;

use kr_core::known_hosts::{HostKeyStatus, KnownHosts};
use kr_core::pairing::PairingOptions;
use kr_core::persist::FilePersister;
use kr_core::profile::Profile;
use kr_core::protocol::{now_unix, HostKeyPolicy};
use kr_core::testing::{ResponseTransport, Signer};
use kr_core::timeouts::{TimeoutPhases, Timeouts};
use kr_core::wire::rsa_public_key_wire;
use kr_core::EnclaveClient;
use kr_daemon::framing::{read_frame, write_frame};
use kr_daemon::hostauth::{self, HostAuthReply, HostAuthRequest, HostAuthServer};
use kr_daemon::server::bind_unix;

const RSA_PEM: &str = include_str!("fixtures/rsa2048.pem");
const TTL: Duration = Duration::from_secs(600);

fn phone() -> ResponseTransport {
    let key = RsaPrivateKey::from_pkcs1_pem(RSA_PEM).unwrap();
    let profile = Profile {
        ssh_wire_public_key: rsa_public_key_wire(&key.e().to_bytes_be(), &key.n().to_bytes_be()),
        email: "hello@krypt.co".into(),
        pgp_public_key: None,
    };
    let signer: Signer = Arc::new(move |data: &[u8]| {
        let digest = Sha256::digest(data);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap()
    });
    ResponseTransport::new(profile, signer)
}

struct Harness {
    dir: TempDir,
    persister: Arc<FilePersister>,
    transport: Arc<ResponseTransport>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn ask(&self, host: &str, port: u16, host_key: &[u8]) -> HostAuthReply {
        let mut stream = UnixStream::connect(self.dir.path().join("hostauth.sock")).await.unwrap();
        let request = HostAuthRequest {
            host: host.into(),
            port,
            host_key: host_key.to_vec(),
        };
        write_frame(&mut stream, &serde_json::to_vec(&request).unwrap()).await.unwrap();
        serde_json::from_slice(&read_frame(&mut stream).await.unwrap()).unwrap()
    }

    fn phone_requests(&self) -> usize {
        self.transport.alerts_sent() + self.transport.messages_sent()
    }

    fn known_hosts(&self) -> KnownHosts {
        KnownHosts::load(self.persister.as_ref()).unwrap()
    }
}

async fn harness(phone: ResponseTransport, seed: Option<KnownHosts>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let persister = Arc::new(FilePersister::new(dir.path().join("kr"), dir.path().join("ssh")));
    std::fs::create_dir_all(dir.path().join("kr")).unwrap();
    std::fs::create_dir_all(dir.path().join("ssh")).unwrap();
    if let Some(known) = seed {
        known.save(persister.as_ref()).unwrap();
    }

    let transport = Arc::new(phone);
    let phases = TimeoutPhases::new(Duration::from_secs(3), Duration::from_secs(6));
    let client = EnclaveClient::builder(transport.clone(), persister.clone())
        .timeouts(Timeouts {
            me: phases,
            pair: phases,
            sign: phases,
            ack_delay: Duration::from_secs(60),
            noop_interval: Duration::from_secs(60),
        })
        .build();
    client.pair(PairingOptions::default()).await.unwrap();
    for _ in 0..200 {
        if client.is_paired() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(client.is_paired());

    let listener = bind_unix(&dir.path().join("hostauth.sock")).unwrap();
    let server = Arc::new(HostAuthServer::new(client, persister.clone(), TTL));
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(hostauth::serve(listener, server, rx));
    Harness {
        dir,
        persister,
        transport,
        _shutdown: shutdown,
    }
}

#[tokio::test]
async fn approved_host_is_pinned_and_not_asked_again() {
    let h = harness(phone().with_host_key_policy(HostKeyPolicy::Pinned), None).await;

    let reply = h.ask("github.com", 22, b"host-key-a").await;
    assert!(reply.ok, "{:?}", reply.error);
    let asked = h.phone_requests();
    assert!(asked >= 1);

    let known = h.known_hosts();
    assert_eq!(known.entries().len(), 1);
    assert_eq!(known.entries()[0].policy, HostKeyPolicy::Pinned);
    assert_eq!(known.entries()[0].expires, None);

    let reply = h.ask("github.com", 22, b"host-key-a").await;
    assert!(reply.ok);
    assert_eq!(h.phone_requests(), asked);
}

#[tokio::test]
async fn missing_policy_counts_as_trusted_once() {
    let h = harness(phone(), None).await;
    let reply = h.ask("example.com", 2222, b"host-key-b").await;
    assert!(reply.ok);

    let known = h.known_hosts();
    let entry = &known.entries()[0];
    assert_eq!(entry.pattern, "[example.com]:2222");
    assert_eq!(entry.policy, HostKeyPolicy::TrustedOnce);
    let expires = entry.expires.unwrap();
    assert!(expires > now_unix() && expires <= now_unix() + TTL.as_secs() as i64);
}

#[tokio::test]
async fn changed_key_goes_back_to_the_phone() {
    let mut seed = KnownHosts::default();
    seed.insert("github.com", 22, b"old-key", HostKeyPolicy::Pinned, TTL, now_unix());
    let h = harness(phone().reject_with("host public key mismatched"), Some(seed)).await;

    let reply = h.ask("github.com", 22, b"new-key").await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("host public key mismatched"));
    assert!(h.phone_requests() >= 1);

    let known = h.known_hosts();
    assert_eq!(known.lookup("github.com", 22, b"new-key", now_unix()), HostKeyStatus::Mismatch);
    assert_eq!(known.lookup("github.com", 22, b"old-key", now_unix()), HostKeyStatus::Match);
}

#[tokio::test]
async fn malformed_request_is_answered() {
    let h = harness(phone(), None).await;
    let mut stream = UnixStream::connect(h.dir.path().join("hostauth.sock")).await.unwrap();
    write_frame(&mut stream, br#"{"host":"x"}"#).await.unwrap();
    let reply: HostAuthReply = serde_json::from_slice(&read_frame(&mut stream).await.unwrap()).unwrap();
    assert!(!reply.ok);
    assert_eq!(h.phone_requests(), 0);
}

#[tokio::test]
async fn concurrent_approvals_all_reach_disk() {
    let h = Arc::new(harness(phone().with_host_key_policy(HostKeyPolicy::Pinned), None).await);

    let mut handles = Vec::new();
    for i in 0..6u8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.ask(&format!("host{}.example.com", i), 22, &[b'k', i]).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().ok);
    }

    let known = h.known_hosts();
    assert_eq!(known.entries().len(), 6);
    for i in 0..6u8 {
        let host = format!("host{}.example.com", i);
        assert_eq!(known.lookup(&host, 22, &[b'k', i], now_unix()), HostKeyStatus::Match);
    }
}
