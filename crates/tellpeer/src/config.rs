//! Tunables for sessions and peer connections.

use std::time::Duration;

/// How long a call waits for its reply when no timeout is given.
pub const DEFAULT_TELL_TIMEOUT: Duration = Duration::from_secs(4);

/// How long before expiry a credential is renewed.
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(30);

/// Pause between failed renewal attempts.
pub const DEFAULT_RENEW_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Pause between dial attempts of `dial_forever`.
pub const DEFAULT_REDIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub redial_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            redial_interval: DEFAULT_REDIAL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub tell_timeout: Duration,
    pub renew_before: Duration,
    pub renew_retry_interval: Duration,
    pub session: SessionConfig,
}

impl PeerConfig {
    pub fn with_tell_timeout(mut self, timeout: Duration) -> Self {
        self.tell_timeout = timeout;
        self
    }

    pub fn with_renew_before(mut self, before: Duration) -> Self {
        self.renew_before = before;
        self
    }

    pub fn with_renew_retry_interval(mut self, interval: Duration) -> Self {
        self.renew_retry_interval = interval;
        self
    }

    pub fn with_redial_interval(mut self, interval: Duration) -> Self {
        self.session.redial_interval = interval;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            tell_timeout: DEFAULT_TELL_TIMEOUT,
            renew_before: DEFAULT_RENEW_BEFORE,
            renew_retry_interval: DEFAULT_RENEW_RETRY_INTERVAL,
            session: SessionConfig::default(),
        }
    }
}
