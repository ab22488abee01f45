//! Shared fixtures for the integration suite.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use tellpeer::IncomingCall;
use tellpeer::PeerConfig;
use tellpeer::PeerConnection;
use tellpeer::PeerConnectionBuilder;
use tellpeer::RemotePeer;
use tellpeer::Session;
use tellpeer::adapter;
use tellpeer::memory::DuplexTransport;
use tellpeer::memory::MemoryAcceptor;
use tellpeer::memory::MemoryDialer;
use tellpeer::tellwire::CallError;
use tellpeer::tellwire::ErrorKind;
use tellpeer::tellwire::Identity;
use tellpeer::tellwire::Message;
use tellpeer::tellwire::Method;
use tellpeer::transport::Transport;

pub const URL: &str = "memory://math";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn client_identity() -> Identity {
    Identity::new("client", "client-1").with_username("alice")
}

pub fn math_identity() -> Identity {
    Identity::new("math", "math-1").with_version("1.0.0")
}

/// A connection builder wired to an in-memory dialer.
pub fn builder(config: PeerConfig) -> (PeerConnectionBuilder, Arc<MemoryDialer>, MemoryAcceptor) {
    init_tracing();
    let (dialer, acceptor) = MemoryDialer::new();
    let dialer = Arc::new(dialer);
    let builder = PeerConnection::builder(client_identity(), RemotePeer::new(math_identity(), URL))
        .dialer(dialer.clone())
        .config(config);
    (builder, dialer, acceptor)
}

/// Accepts the next connection as a full session serving the math methods.
pub async fn serve_math(acceptor: &mut MemoryAcceptor) -> Session {
    let (_url, transport) = acceptor.accept().await.expect("no connection to accept");
    let session = Session::accept(math_identity(), Box::new(transport));
    register_math(&session);
    session
}

pub fn register_math(session: &Session) {
    session.handle("add", |call: IncomingCall| async move {
        let a = call.arg::<i64>(0)?;
        let b = call.arg::<i64>(1)?;
        Ok(json!(a + b))
    });

    session.handle("whoami", |call: IncomingCall| async move {
        Ok(json!({
            "name": call.caller.name,
            "username": call.caller.username,
            "key": call.authentication.map(|auth| auth.key),
        }))
    });

    session.handle("fail", |_call: IncomingCall| async move {
        Err(CallError::new(ErrorKind::Other("quotaExceeded".into()), "too many calls"))
    });

    session.handle("hang", |_call: IncomingCall| async move {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });

    let local = math_identity();
    session.handle("subscribe", move |call: IncomingCall| {
        let local = local.clone();
        async move {
            let topic = call.arg::<String>(0)?;
            let Some(listener) = call.callback(&[1.into()]) else {
                return Err(CallError::new(ErrorKind::Other("argumentError".into()), "missing listener"));
            };
            listener
                .call(adapter::wrap_callback_args(&local, vec![json!(format!("{}:tick", topic)).into()]))
                .await
                .map_err(|e| CallError::send_error(e.to_string()))?;
            Ok(json!("subscribed"))
        }
    });
}

/// The far end of a connection, driven frame by frame.
pub struct RawPeer(DuplexTransport);

impl RawPeer {
    pub fn new(transport: DuplexTransport) -> Self {
        Self(transport)
    }

    pub async fn accept(acceptor: &mut MemoryAcceptor) -> Self {
        let (_url, transport) = acceptor.accept().await.expect("no connection to accept");
        Self(transport)
    }

    pub async fn next_call(&self) -> Message {
        let frame = self.0.recv().await.expect("recv failed").expect("stream closed");
        Message::decode(&frame).expect("malformed frame")
    }

    /// Invokes the call's response continuation, the largest id it carries.
    pub async fn reply(&self, call: &Message, reply: Value) {
        let id = call
            .callback_entries()
            .expect("bad callback table")
            .into_iter()
            .map(|(id, _)| id)
            .max()
            .expect("call has no continuation");
        self.send(Message::new(Method::Callback(id), vec![reply])).await;
    }

    pub async fn send(&self, message: Message) {
        self.send_raw(message.encode().expect("encode failed")).await;
    }

    pub async fn send_raw(&self, frame: impl Into<String>) {
        self.0.send(frame.into()).await.expect("send failed");
    }

    pub async fn close(&self) {
        self.0.close().await;
    }
}

/// The application arguments of a call frame.
pub fn with_args(call: &Message) -> Vec<Value> {
    call.arguments[0]["withArgs"].as_array().cloned().unwrap_or_default()
}
