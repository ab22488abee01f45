//! Credential renewal driven by paused time.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use serde_json::json;

use tellpeer::Credential;
use tellpeer::PeerConfig;
use tellpeer::PeerConnection;
use tellpeer::TrustedIssuers;
use tellpeer::credential;
use tellpeer::credential::TokenError;
use tellpeer::credential::TokenIssuer;
use tellpeer::memory::MemoryAcceptor;
use tellpeer::memory::MemoryDialer;
use tellpeer::tellwire::Identity;

use common::RawPeer;
use common::serve_math;

const SECRET: &[u8] = b"kontrol-secret";

/// Issues HS256 tokens valid for an hour, failing a set number of times first.
struct TestIssuer {
    name: String,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl TestIssuer {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &str, failures: usize) -> Arc<Self> {
        let issuer = Self::new(name);
        issuer.failures.store(failures, Ordering::SeqCst);
        issuer
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenIssuer for TestIssuer {
    async fn get_token(&self, peer: &Identity) -> credential::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TokenError::Issuer("issuer unavailable".into()));
        }

        let claims = json!({
            "iss": self.name,
            "sub": peer.name,
            "jti": n.to_string(),
            "exp": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
        });
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
            .map_err(|e| TokenError::Issuer(e.to_string()))
    }
}

fn connect_with(
    credential: Credential,
    issuer: Arc<TestIssuer>,
) -> (PeerConnection, Arc<MemoryDialer>, MemoryAcceptor) {
    let (builder, dialer, acceptor) = common::builder(PeerConfig::default());
    let keys = Arc::new(TrustedIssuers::new().with_secret("kontrol", SECRET));
    let peer = builder.credential(credential).renewal(issuer, keys).build();
    (peer, dialer, acceptor)
}

fn expiring_in(seconds: i64) -> Credential {
    Credential::token("initial").with_valid_until(Utc::now() + chrono::Duration::seconds(seconds))
}

async fn advance(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn test_renews_before_expiry() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(60), issuer.clone());
    peer.dial().await?;
    let _raw = RawPeer::accept(&mut acceptor).await;

    advance(29).await;
    assert_eq!(issuer.calls(), 0, "renewed too early");

    advance(2).await;
    assert_eq!(issuer.calls(), 1, "not renewed 30s before expiry");
    let renewed = peer.credential().expect("no credential");
    assert_ne!(renewed.key, "initial");
    assert!(renewed.valid_until.expect("no expiry") > Utc::now() + chrono::Duration::minutes(50));

    advance(600).await;
    assert_eq!(issuer.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failures_retry_at_fixed_interval() -> anyhow::Result<()> {
    let issuer = TestIssuer::failing("kontrol", 2);
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(10), issuer.clone());
    peer.dial().await?;
    let _raw = RawPeer::accept(&mut acceptor).await;

    advance(5).await;
    assert_eq!(issuer.calls(), 1);
    assert_eq!(peer.credential().map(|c| c.key), Some("initial".into()));

    advance(10).await;
    assert_eq!(issuer.calls(), 2);

    advance(10).await;
    assert_eq!(issuer.calls(), 3);
    assert_ne!(peer.credential().map(|c| c.key), Some("initial".into()));

    advance(100).await;
    assert_eq!(issuer.calls(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_untrusted_token_is_rejected_and_retried() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("mallory");
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(0), issuer.clone());
    peer.dial().await?;
    let _raw = RawPeer::accept(&mut acceptor).await;

    advance(25).await;

    assert_eq!(issuer.calls(), 3);
    assert_eq!(peer.credential().map(|c| c.key), Some("initial".into()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_attempt_after_disconnect() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(60), issuer.clone());
    peer.dial().await?;
    let raw = RawPeer::accept(&mut acceptor).await;

    advance(10).await;
    raw.close().await;
    advance(600).await;

    assert_eq!(issuer.calls(), 0);
    assert!(!peer.is_connected());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_retrying() -> anyhow::Result<()> {
    let issuer = TestIssuer::failing("kontrol", usize::MAX);
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(0), issuer.clone());
    peer.dial().await?;
    let raw = RawPeer::accept(&mut acceptor).await;

    advance(15).await;
    assert_eq!(issuer.calls(), 2);
    raw.close().await;
    advance(600).await;

    assert_eq!(issuer.calls(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_starts_a_single_new_loop() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, dialer, mut acceptor) = connect_with(expiring_in(60), issuer.clone());
    peer.dial_forever().await?;
    let first = RawPeer::accept(&mut acceptor).await;

    advance(10).await;
    first.close().await;
    let _second = RawPeer::accept(&mut acceptor).await;
    assert_eq!(dialer.dial_count(), 2);

    // The first loop would have fired 30s after the first connect.
    advance(25).await;
    assert_eq!(issuer.calls(), 0);

    advance(10).await;
    assert_eq!(issuer.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dial_while_connected_keeps_a_single_loop() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, dialer, mut acceptor) = connect_with(expiring_in(60), issuer.clone());
    peer.dial().await?;
    let _first = RawPeer::accept(&mut acceptor).await;

    advance(10).await;
    peer.dial().await?;
    let _second = RawPeer::accept(&mut acceptor).await;
    assert_eq!(dialer.dial_count(), 2);

    // The first loop would have fired 30s after the first connect.
    advance(25).await;
    assert_eq!(issuer.calls(), 0);

    advance(10).await;
    assert_eq!(issuer.calls(), 1);

    advance(600).await;
    assert_eq!(issuer.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_next_call_carries_renewed_key() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, _dialer, mut acceptor) = connect_with(expiring_in(10), issuer.clone());
    peer.dial().await?;
    let _server = serve_math(&mut acceptor).await;

    advance(1).await;
    assert_eq!(issuer.calls(), 1);

    let renewed = peer.credential().map(|c| c.key).expect("no credential");
    let seen = peer.tell("whoami", vec![]).await.expect("call failed");
    assert_eq!(seen["key"], json!(renewed));
    assert_ne!(seen["key"], json!("initial"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_expiry_means_no_renewal() -> anyhow::Result<()> {
    let issuer = TestIssuer::new("kontrol");
    let (peer, _dialer, mut acceptor) = connect_with(Credential::token("forever"), issuer.clone());
    peer.dial().await?;
    let _raw = RawPeer::accept(&mut acceptor).await;

    advance(24 * 3600).await;

    assert_eq!(issuer.calls(), 0);
    assert_eq!(peer.credential().map(|c| c.key), Some("forever".into()));
    Ok(())
}
