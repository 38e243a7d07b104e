//! Whole-daemon lifecycle with no mailbox configured.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::sleep;

use kr_core::dirs::KrDirs;
use kr_daemon::config::KrdConfig;
use kr_daemon::Daemon;

async fn http(socket: &Path, request: &str) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    out
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn serves_then_cleans_up() {
    let home = tempfile::tempdir().unwrap();
    let dirs = KrDirs::from_home(home.path());
    let daemon = Arc::new(Daemon::new(KrdConfig::with_dirs(dirs.clone())).unwrap());

    // stale socket from a previous run
    std::fs::write(dirs.agent_socket(), b"").unwrap();

    let running = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run().await })
    };
    wait_for(&dirs.pid_file()).await;
    wait_for(&dirs.hostauth_socket()).await;

    let ping = http(
        &dirs.control_socket(),
        "GET /ping HTTP/1.1\r\nHost: krd\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(ping.starts_with("HTTP/1.1 200"), "{}", ping);

    let version = http(
        &dirs.control_socket(),
        "GET /version HTTP/1.1\r\nHost: krd\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(version.ends_with(env!("CARGO_PKG_VERSION")), "{}", version);

    let not_paired = http(
        &dirs.control_socket(),
        "PUT /enclave HTTP/1.1\r\nHost: krd\r\nConnection: close\r\nContent-Length: 17\r\n\r\n{\"me_request\":{}}",
    )
    .await;
    assert!(not_paired.starts_with("HTTP/1.1 404"), "{}", not_paired);

    // the agent answers on its socket
    let mut agent = UnixStream::connect(dirs.agent_socket()).await.unwrap();
    kr_daemon::framing::write_frame(&mut agent, &[11]).await.unwrap();
    let answer = kr_daemon::framing::read_frame(&mut agent).await.unwrap();
    assert_eq!(answer, vec![12, 0, 0, 0, 0]);

    daemon.shutdown();
    running.await.unwrap().unwrap();
    assert!(!dirs.control_socket().exists());
    assert!(!dirs.agent_socket().exists());
    assert!(!dirs.pid_file().exists());
}
