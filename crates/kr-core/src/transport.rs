//! Mailbox transport abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::notify::Notifier;
use crate::pairing::PairingSecret;

/// Shown when the mailbox rejects requests because the local clock is off.
pub const CLOCK_SKEW_NOTICE: &str =
    "Kryptonite ▶ Your computer's clock is out of sync. Please correct it to continue using Kryptonite.";

/// Capability set the broker needs from a mailbox provider.
///
/// `message` arguments are plaintext request JSON; implementations encrypt
/// with the pairing before posting, so a pairing still waiting for the
/// enclave key fails with `TransportError::Pairing(WaitingForKey)`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocate the send and receive mailboxes for a pairing.
    async fn setup(&self, ps: &PairingSecret) -> Result<(), TransportError>;

    /// Post `message` and raise a visible push notification carrying
    /// `alert_text`. Push failures are logged, not returned.
    async fn push_alert(
        &self,
        ps: &PairingSecret,
        alert_text: &str,
        message: &[u8],
    ) -> Result<(), TransportError>;

    /// Post `message` with at most a silent push.
    async fn send_message(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError>;

    /// Wait a bounded time for inbound envelopes (header byte included).
    async fn read(
        &self,
        notifier: &Notifier,
        ps: &PairingSecret,
    ) -> Result<Vec<Vec<u8>>, TransportError>;
}

/// Transport that never delivers anything. Used when no mailbox is
/// configured.
#[derive(Debug, Clone)]
pub struct NoopTransport {
    poll: Duration,
}

impl NoopTransport {
    pub fn new() -> Self {
        Self {
            poll: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

impl Default for NoopTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NoopTransport {
    async fn setup(&self, _ps: &PairingSecret) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push_alert(
        &self,
        ps: &PairingSecret,
        _alert_text: &str,
        message: &[u8],
    ) -> Result<(), TransportError> {
        ps.encrypt_message(message)?;
        Ok(())
    }

    async fn send_message(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError> {
        ps.encrypt_message(message)?;
        Ok(())
    }

    async fn read(
        &self,
        _notifier: &Notifier,
        _ps: &PairingSecret,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        tokio::time::sleep(self.poll).await;
        Ok(Vec::new())
    }
}
