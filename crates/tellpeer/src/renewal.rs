//! # Credential Renewal
//!
//! One loop per connection epoch keeps the peer's token fresh.
//!
//! ```text
//!              wake                  success
//!  Scheduled ────────► renew_once ───────────► Scheduled(new expiry)
//!      ▲                  │ failure
//!      │                  ▼
//!      └─── success ── Retrying ◄──┐ failure, after retry_interval
//!                         └────────┘
//!
//!  disconnect, from any state ──► Terminated
//! ```
//!
//! ## Invariants
//! - The disconnect signal is checked before every wake-up, so no attempt starts
//!   once the epoch has ended.
//! - Failures are logged and retried, never surfaced to callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::error;
use tracing::info;

use tellwire::Identity;

use crate::credential;
use crate::credential::KeyResolver;
use crate::credential::SharedCredential;
use crate::credential::TokenIssuer;
use crate::signal::DisconnectSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// Waiting until shortly before the given expiry.
    Scheduled(DateTime<Utc>),
    /// The last attempt failed.
    Retrying,
    Terminated,
}

pub struct Renewer {
    pub peer: Identity,
    pub credential: SharedCredential,
    pub issuer: Arc<dyn TokenIssuer>,
    pub keys: Arc<dyn KeyResolver>,
    pub renew_before: Duration,
    pub retry_interval: Duration,
}

impl Renewer {
    /// Runs until `signal` fires. Returns at once if the credential never expires.
    pub async fn run(self, mut signal: DisconnectSignal) {
        let Some(expiry) = self.credential.snapshot().valid_until else {
            debug!("credential has no expiry, not renewing");
            return;
        };

        let mut state = RenewalState::Scheduled(expiry);
        while state != RenewalState::Terminated {
            state = self.step(state, &mut signal).await;
        }
        debug!(peer = %self.peer, "renewal loop terminated");
    }

    async fn step(&self, state: RenewalState, signal: &mut DisconnectSignal) -> RenewalState {
        let wait = match state {
            RenewalState::Scheduled(expiry) => {
                let until_expiry = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                until_expiry.saturating_sub(self.renew_before)
            }
            RenewalState::Retrying => self.retry_interval,
            RenewalState::Terminated => return RenewalState::Terminated,
        };

        tokio::select! {
            biased;
            _ = signal.fired() => return RenewalState::Terminated,
            _ = tokio::time::sleep(wait) => {}
        }

        match self.renew_once().await {
            Ok(expiry) => RenewalState::Scheduled(expiry),
            Err(e) => {
                error!(
                    peer = %self.peer,
                    error = %e,
                    retry_in = ?self.retry_interval,
                    "token renewal failed"
                );
                RenewalState::Retrying
            }
        }
    }

    /// Fetches, verifies and installs a fresh token. Returns its expiry.
    pub async fn renew_once(&self) -> credential::Result<DateTime<Utc>> {
        let token = self.issuer.get_token(&self.peer).await?;
        let expiry = credential::decode_token(&token, self.keys.as_ref())?;

        let mut renewed = self.credential.snapshot();
        renewed.key = token;
        renewed.valid_until = Some(expiry);
        self.credential.replace(renewed);

        info!(peer = %self.peer, %expiry, "token renewed");
        Ok(expiry)
    }
}
