//! Connection lifecycle: dialing, redialing, hooks and epochs.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use tellpeer::PeerConfig;
use tellpeer::PeerConnection;
use tellpeer::RemotePeer;
use tellpeer::Session;
use tellpeer::SessionError;
use tellpeer::SessionState;
use tellpeer::memory::DuplexTransport;
use tellpeer::tellwire::CallError;
use tellpeer::tellwire::Identity;
use tellpeer::tellwire::Method;
use tellpeer::transport;
use tellpeer::transport::Dialer;
use tellpeer::transport::Transport;

use common::RawPeer;
use common::builder;
use common::math_identity;
use common::serve_math;

async fn wait_for_state(session: &Session, state: SessionState) {
    let mut states = session.watch_state();
    states.wait_for(|current| *current == state).await.expect("session dropped");
}

#[tokio::test(start_paused = true)]
async fn test_dial_forever_retries_until_connected() -> anyhow::Result<()> {
    let config = PeerConfig::default().with_redial_interval(Duration::from_secs(1));
    let (builder, dialer, _acceptor) = builder(config);
    let peer = builder.build();
    dialer.refuse_next(3);

    let start = Instant::now();
    peer.dial_forever().await?;

    assert_eq!(dialer.dial_count(), 4);
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(peer.is_connected());
    assert_eq!(peer.session().epoch(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dial_failure_is_reported() {
    let (builder, dialer, _acceptor) = builder(PeerConfig::default());
    let peer = builder.build();
    dialer.refuse_next(1);

    let err = peer.dial().await.unwrap_err();

    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(peer.session().state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_hooks_fire_on_connect_and_disconnect() -> anyhow::Result<()> {
    let (builder, _dialer, mut acceptor) = builder(PeerConfig::default());
    let peer = builder.build();

    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        peer.on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = disconnects.clone();
        peer.on_disconnect(move || {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.dial().await?;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let server = serve_math(&mut acceptor).await;
    server.close().await;
    wait_for_state(peer.session(), SessionState::Disconnected).await;

    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_redial_after_disconnect_starts_fresh_epoch() -> anyhow::Result<()> {
    let (builder, dialer, mut acceptor) = builder(PeerConfig::default());
    let peer = builder.build();

    peer.dial_forever().await?;
    let first = serve_math(&mut acceptor).await;
    assert_eq!(peer.tell("add", vec![json!(1).into(), json!(1).into()]).await, Ok(json!(2)));

    // A call left hanging on the first epoch fails with the disconnect.
    let hanging = peer.go("hang", vec![]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.close().await;
    assert_eq!(hanging.await, Err(CallError::disconnect()));

    let _second = serve_math(&mut acceptor).await;
    wait_for_state(peer.session(), SessionState::Connected).await;

    assert_eq!(peer.session().epoch(), 2);
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(peer.tell("add", vec![json!(2).into(), json!(2).into()]).await, Ok(json!(4)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dial_while_connected_ends_live_epoch() -> anyhow::Result<()> {
    let (builder, dialer, mut acceptor) = builder(PeerConfig::default());
    let peer = builder.build();
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let disconnects = disconnects.clone();
        peer.on_disconnect(move || {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.dial().await?;
    let first = RawPeer::accept(&mut acceptor).await;
    let start = Instant::now();
    let hanging = peer.go("hang", vec![]);
    first.next_call().await;
    assert_eq!(peer.session().registry().len(), 1);

    peer.dial().await?;
    let _second = serve_math(&mut acceptor).await;

    assert_eq!(hanging.await, Err(CallError::disconnect()));
    assert!(start.elapsed() < peer.tell_timeout());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(peer.session().registry().is_empty());
    assert_eq!(peer.session().epoch(), 2);
    assert_eq!(dialer.dial_count(), 2);

    assert_eq!(peer.tell("add", vec![json!(2).into(), json!(2).into()]).await, Ok(json!(4)));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Dials connections whose far end is already gone.
struct DeadEndDialer;

#[async_trait::async_trait]
impl Dialer for DeadEndDialer {
    async fn dial(&self, _url: &str) -> transport::Result<Box<dyn Transport>> {
        let (local, remote) = DuplexTransport::pair();
        drop(remote);
        Ok(Box::new(local))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_hooks_run_before_the_epoch_can_end() -> anyhow::Result<()> {
    common::init_tracing();
    let session = Session::new(Identity::new("client", "c-1"), Arc::new(DeadEndDialer));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        let states = session.watch_state();
        session.on_connect(move || {
            seen.lock().unwrap().push(*states.borrow());
        });
    }

    for _ in 0..50 {
        session.dial("memory://nowhere").await?;
        tokio::task::yield_now().await;
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 50);
    assert!(seen.iter().all(|state| *state == SessionState::Connected), "{:?}", seen);
    Ok(())
}

#[tokio::test]
async fn test_connection_hooks_go_with_the_connection() {
    let (a, _b) = DuplexTransport::pair();
    let session = Session::accept(Identity::new("left", "l-1"), Box::new(a));
    let remote = RemotePeer::new(Identity::new("right", "r-1"), "memory://right");
    let baseline = session.hook_count();

    let first = PeerConnection::builder(Identity::new("left", "l-1"), remote.clone())
        .session(session.clone())
        .build();
    let with_one = session.hook_count();
    assert_eq!(with_one.1, baseline.1 + 1);
    drop(first);
    assert_eq!(session.hook_count(), baseline);

    let user_hook = {
        let second = PeerConnection::builder(Identity::new("left", "l-1"), remote)
            .session(session.clone())
            .build();
        assert_eq!(session.hook_count(), with_one);
        second.on_disconnect(|| {})
    };
    assert_eq!(session.hook_count(), (baseline.0, baseline.1 + 1));
    assert!(session.remove_hook(user_hook));
    assert!(!session.remove_hook(user_hook));
    assert_eq!(session.hook_count(), baseline);
}

#[tokio::test]
async fn test_call_without_caller_identity_is_answered() {
    common::init_tracing();
    let (a, b) = DuplexTransport::pair();
    let server = Session::accept(math_identity(), Box::new(a));
    common::register_math(&server);
    let raw = RawPeer::new(b);

    raw.send_raw(
        r#"{"method":"nope","arguments":[{"withArgs":[],"responseCallback":"[Function]"}],"callbacks":{"0":[0,"responseCallback"]}}"#,
    )
    .await;
    let reply = raw.next_call().await;
    assert_eq!(reply.method, Method::Callback(0));
    assert_eq!(reply.arguments[0]["withArgs"][0]["error"]["type"], json!("methodNotFound"));

    raw.send_raw(
        r#"{"method":"add","arguments":[{"kite":"garbled","withArgs":[2,3],"responseCallback":"[Function]"}],"callbacks":{"1":[0,"responseCallback"]}}"#,
    )
    .await;
    let reply = raw.next_call().await;
    assert_eq!(reply.method, Method::Callback(1));
    assert_eq!(reply.arguments[0]["withArgs"][0]["result"], json!(5));

    let extra = tokio::time::timeout(Duration::from_millis(50), raw.next_call()).await;
    assert!(extra.is_err(), "one reply per call");
}

#[tokio::test]
async fn test_close_stops_redialing() -> anyhow::Result<()> {
    let (builder, dialer, mut acceptor) = builder(PeerConfig::default());
    let peer = builder.build();

    peer.dial_forever().await?;
    let _server = serve_math(&mut acceptor).await;
    peer.close().await;

    assert_eq!(peer.session().state(), SessionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert!(matches!(peer.dial().await, Err(SessionError::Closed)));

    let err = peer.tell("add", vec![json!(1).into(), json!(2).into()]).await.unwrap_err();
    assert!(err.is(&tellpeer::tellwire::ErrorKind::SendError));
    Ok(())
}

#[tokio::test]
async fn test_accepted_session_cannot_dial() {
    let (a, _b) = DuplexTransport::pair();
    let session = Session::accept(Identity::new("math", "math-1"), Box::new(a));

    assert_eq!(session.state(), SessionState::Connected);
    assert!(matches!(session.dial("memory://elsewhere").await, Err(SessionError::NoDialer)));
}

#[tokio::test]
async fn test_two_sessions_call_each_other() -> anyhow::Result<()> {
    let (a, b) = DuplexTransport::pair();
    let left = Session::accept(Identity::new("left", "l-1"), Box::new(a));
    let right = Session::accept(Identity::new("right", "r-1"), Box::new(b));
    common::register_math(&right);

    let peer = tellpeer::PeerConnection::builder(
        Identity::new("left", "l-1"),
        tellpeer::RemotePeer::new(Identity::new("right", "r-1"), "memory://right"),
    )
    .session(left)
    .build();

    assert!(peer.is_connected());
    assert_eq!(peer.tell("add", vec![json!(20).into(), json!(22).into()]).await, Ok(json!(42)));
    Ok(())
}
