use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Two-phase deadline for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPhases {
    /// Grace period before a "check your phone" notification.
    #[serde(with = "millis")]
    pub alert: Duration,
    /// Absolute deadline, extended once by an ACK.
    #[serde(with = "millis")]
    pub fail: Duration,
}

impl TimeoutPhases {
    pub const fn new(alert: Duration, fail: Duration) -> Self {
        Self { alert, fail }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub me: TimeoutPhases,
    pub pair: TimeoutPhases,
    pub sign: TimeoutPhases,
    /// Retry delay for un-ACKed sends, and the deadline extension an ACK grants.
    #[serde(with = "millis")]
    pub ack_delay: Duration,
    /// Idle period after which a paired broker sends a no-op request.
    #[serde(with = "millis")]
    pub noop_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            me: TimeoutPhases::new(Duration::from_secs(4), Duration::from_secs(5)),
            pair: TimeoutPhases::new(Duration::from_secs(4), Duration::from_secs(90)),
            sign: TimeoutPhases::new(Duration::from_secs(2), Duration::from_secs(30)),
            ack_delay: Duration::from_secs(60),
            noop_interval: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    /// Short phases for tests: alert 100ms, fail 200ms, ACK delay 500ms.
    pub fn short() -> Self {
        let phases = TimeoutPhases::new(Duration::from_millis(100), Duration::from_millis(200));
        Self {
            me: phases,
            pair: phases,
            sign: phases,
            ack_delay: Duration::from_millis(500),
            noop_interval: Duration::from_secs(60),
        }
    }

    pub fn phases(&self) -> [(&'static str, TimeoutPhases); 3] {
        [("me", self.me), ("pair", self.pair), ("sign", self.sign)]
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
