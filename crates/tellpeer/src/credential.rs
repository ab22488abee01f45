//! # Credentials
//!
//! The credential a peer presents with every call, and the machinery the renewal
//! loop uses to refresh it.
//!
//! A [`SharedCredential`] has a single writer (the renewal loop) and any number
//! of readers. Readers always take a full copy, so a call in flight keeps the
//! credential it was sent with even if a renewal lands halfway through.
//!
//! Tokens are JWTs. Their expiry is only trusted once the signature checks out
//! against the key of the issuer named in the token itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use serde::Deserialize;
use tokio::sync::watch;

use tellwire::Authentication;
use tellwire::Identity;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("cannot get token from issuer: {0}")]
    Issuer(String),
    #[error("token does not contain a valid issuer claim")]
    MissingIssuer,
    #[error("issuer is not trusted: {0}")]
    UntrustedIssuer(String),
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token does not carry a valid expiry")]
    InvalidExpiry,
}

pub type Result<T> = std::result::Result<T, TokenError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Scheme tag, e.g. `token`.
    pub kind: String,
    pub key: String,
    /// `None` for credentials that never expire.
    pub valid_until: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            valid_until: None,
        }
    }

    pub fn token(key: impl Into<String>) -> Self {
        Self::new("token", key)
    }

    pub fn with_valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }

    pub fn to_wire(&self) -> Authentication {
        Authentication::new(self.kind.clone(), self.key.clone())
    }
}

/// One-writer, many-reader credential cell.
#[derive(Debug, Clone)]
pub struct SharedCredential(Arc<watch::Sender<Credential>>);

impl SharedCredential {
    pub fn new(credential: Credential) -> Self {
        Self(Arc::new(watch::Sender::new(credential)))
    }

    pub fn snapshot(&self) -> Credential {
        self.0.borrow().clone()
    }

    pub fn replace(&self, credential: Credential) -> Credential {
        self.0.send_replace(credential)
    }
}

/// Hands out fresh tokens for a peer.
#[async_trait::async_trait]
pub trait TokenIssuer: Send + Sync + 'static {
    async fn get_token(&self, peer: &Identity) -> Result<String>;
}

#[derive(Clone)]
pub struct TrustedKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

/// Maps an issuer name to the key its tokens are signed with.
pub trait KeyResolver: Send + Sync + 'static {
    fn resolve(&self, issuer: &str) -> Result<TrustedKey>;
}

/// A fixed set of trusted issuers.
#[derive(Clone, Default)]
pub struct TrustedIssuers {
    keys: HashMap<String, TrustedKey>,
}

impl TrustedIssuers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts HS256 tokens from `issuer`.
    pub fn with_secret(mut self, issuer: impl Into<String>, secret: &[u8]) -> Self {
        self.keys.insert(
            issuer.into(),
            TrustedKey {
                key: DecodingKey::from_secret(secret),
                algorithm: Algorithm::HS256,
            },
        );
        self
    }

    /// Trusts RS256 tokens from `issuer`.
    pub fn with_rsa_pem(mut self, issuer: impl Into<String>, pem: &[u8]) -> Result<Self> {
        self.keys.insert(
            issuer.into(),
            TrustedKey {
                key: DecodingKey::from_rsa_pem(pem)?,
                algorithm: Algorithm::RS256,
            },
        );
        Ok(self)
    }
}

impl KeyResolver for TrustedIssuers {
    fn resolve(&self, issuer: &str) -> Result<TrustedKey> {
        self.keys
            .get(issuer)
            .cloned()
            .ok_or_else(|| TokenError::UntrustedIssuer(issuer.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies `token` and returns its expiry.
pub fn decode_token(token: &str, resolver: &dyn KeyResolver) -> Result<DateTime<Utc>> {
    let header = jsonwebtoken::decode_header(token)?;

    // Unverified read, only to learn which key to verify with.
    let mut peek = Validation::new(header.alg);
    peek.insecure_disable_signature_validation();
    peek.validate_exp = false;
    peek.validate_aud = false;
    peek.required_spec_claims.clear();
    let unverified = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &peek)?;

    let issuer = unverified
        .claims
        .iss
        .filter(|iss| !iss.is_empty())
        .ok_or(TokenError::MissingIssuer)?;
    let trusted = resolver.resolve(&issuer)?;

    let mut validation = Validation::new(trusted.algorithm);
    validation.set_issuer(&[issuer.as_str()]);
    validation.validate_aud = false;
    let verified = jsonwebtoken::decode::<Claims>(token, &trusted.key, &validation)?;

    let exp = verified.claims.exp.ok_or(TokenError::InvalidExpiry)?;
    DateTime::from_timestamp(exp, 0).ok_or(TokenError::InvalidExpiry)
}
