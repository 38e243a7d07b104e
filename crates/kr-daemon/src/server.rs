use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use kr_core::dirs::KrDirs;
use kr_core::http_mailbox::HttpMailboxTransport;
use kr_core::notify::{cleanup_stale, Notifier, STALE_AFTER};
use kr_core::persist::{FilePersister, Persister};
use kr_core::transport::NoopTransport;
use kr_core::{EnclaveClient, Transport};

use crate::agent::{self, Agent};
use crate::config::KrdConfig;
use crate::control::{self, AppState};
use crate::hostauth::{self, HostAuthServer};

/// Remove a stale socket file, bind, and restrict the socket to its owner.
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(listener)
}

pub struct Daemon {
    config: KrdConfig,
    dirs: KrDirs,
    client: EnclaveClient,
    persister: Arc<dyn Persister>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(config: KrdConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let dirs = config.dirs();
        dirs.ensure()?;

        match cleanup_stale(&dirs.notify_dir, STALE_AFTER) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "removed stale notification files"),
            Err(e) => warn!(error = %e, "failed to clean notification directory"),
        }
        let notifier = match Notifier::open(&dirs.notify_dir, "") {
            Ok(n) => Arc::new(n),
            Err(e) => {
                warn!(error = %e, "notifications disabled");
                Arc::new(Notifier::disabled())
            }
        };

        let transport: Arc<dyn Transport> = match &config.mailbox_url {
            Some(url) => {
                let mut t = HttpMailboxTransport::new(url.clone())?.with_wait_ms(config.poll_wait_ms);
                if let Some(push) = &config.push_url {
                    t = t.with_push_url(push.clone());
                }
                info!(mailbox = %url, "using http mailbox");
                Arc::new(t)
            }
            None => {
                warn!("no mailbox_url configured; the phone cannot be reached");
                Arc::new(NoopTransport::new())
            }
        };

        let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(&dirs.run_dir, &dirs.ssh_dir));
        let client = EnclaveClient::builder(transport, persister.clone())
            .notifier(notifier)
            .timeouts(config.broker_timeouts())
            .build();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            dirs,
            client,
            persister,
            shutdown_tx,
        })
    }

    pub fn client(&self) -> &EnclaveClient {
        &self.client
    }

    pub fn dirs(&self) -> &KrDirs {
        &self.dirs
    }

    /// Serve until a signal arrives or [`Daemon::shutdown`] is called.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.client.start().await?;

        let control_listener = bind_unix(&self.dirs.control_socket())?;
        let agent_listener = bind_unix(&self.dirs.agent_socket())?;
        let hostauth_listener = bind_unix(&self.dirs.hostauth_socket())?;
        if let Err(e) = std::fs::write(self.dirs.pid_file(), std::process::id().to_string()) {
            warn!(error = %e, "failed to write pid file");
        }

        let router = control::router(AppState {
            client: self.client.clone(),
        });
        let agent = Arc::new(Agent::new(self.client.clone(), self.config.silence_warnings));
        let hostauth = Arc::new(HostAuthServer::new(
            self.client.clone(),
            self.persister.clone(),
            self.config.trusted_host_ttl(),
        ));

        let tasks = [
            tokio::spawn(control::serve(control_listener, router, self.shutdown_tx.subscribe())),
            tokio::spawn(agent::serve(agent_listener, agent, self.shutdown_tx.subscribe())),
            tokio::spawn(hostauth::serve(hostauth_listener, hostauth, self.shutdown_tx.subscribe())),
        ];
        info!(run_dir = %self.dirs.run_dir.display(), "krd listening");

        Self::shutdown_signal(self.shutdown_tx.subscribe()).await;
        let _ = self.shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "acceptor ended abnormally");
            }
        }

        self.client.stop();
        for path in [
            self.dirs.control_socket(),
            self.dirs.agent_socket(),
            self.dirs.hostauth_socket(),
            self.dirs.pid_file(),
        ] {
            let _ = std::fs::remove_file(path);
        }
        info!("krd stopped");
        Ok(())
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("received SIGTERM, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = shutdown.changed() => {
                info!("shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
