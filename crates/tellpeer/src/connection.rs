//! # Peer Connection
//!
//! The handle applications use to talk to one remote peer. It ties together a
//! [`Session`], the credential presented with every call, the per-epoch
//! disconnect broadcast and, optionally, the credential renewal loop.
//!
//! The hooks a connection installs on its session are removed when the
//! connection is dropped, so a shared session carries only those of live handles.
//!
//! ```ignore
//! let peer = PeerConnection::builder(local, RemotePeer::new(math, "ws://localhost:3636/kite"))
//!     .credential(Credential::token(key))
//!     .build();
//! peer.dial().await?;
//! let sum = peer.tell("add", vec![json!(2).into(), json!(3).into()]).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;
use tracing::info;

use tellwire::Identity;

use crate::config::PeerConfig;
use crate::credential::Credential;
use crate::credential::KeyResolver;
use crate::credential::SharedCredential;
use crate::credential::TokenIssuer;
use crate::renewal::Renewer;
use crate::session;
use crate::session::HookId;
use crate::session::Session;
use crate::session::SessionState;
use crate::signal::DisconnectBroadcast;
use crate::transport::Dialer;
use crate::ws::WebSocketDialer;

/// Who we talk to and where to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub identity: Identity,
    pub url: String,
}

impl RemotePeer {
    pub fn new(identity: Identity, url: impl Into<String>) -> Self {
        Self {
            identity,
            url: url.into(),
        }
    }
}

pub struct PeerConnection {
    remote: RemotePeer,
    local: Identity,
    session: Session,
    credential: Option<SharedCredential>,
    disconnect: Arc<DisconnectBroadcast>,
    tell_timeout_ms: AtomicU64,
    hooks: Vec<HookId>,
}

impl PeerConnection {
    pub fn builder(local: Identity, remote: RemotePeer) -> PeerConnectionBuilder {
        PeerConnectionBuilder {
            local,
            remote,
            credential: None,
            dialer: None,
            session: None,
            config: PeerConfig::default(),
            renewal: None,
        }
    }

    pub async fn dial(&self) -> session::Result<()> {
        info!(remote = %self.remote.identity, url = %self.remote.url, "dialing remote peer");
        self.session.dial(&self.remote.url).await
    }

    /// Dials until connected, and redials after every unexpected disconnect.
    pub async fn dial_forever(&self) -> session::Result<()> {
        info!(remote = %self.remote.identity, url = %self.remote.url, "dialing remote peer until connected");
        self.session.dial_forever(&self.remote.url).await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) -> HookId {
        self.session.on_connect(hook)
    }

    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) -> HookId {
        self.session.on_disconnect(hook)
    }

    /// Sets the timeout used by calls that do not give their own.
    pub fn set_tell_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.tell_timeout_ms.store(millis, Ordering::Relaxed);
    }

    pub fn tell_timeout(&self) -> Duration {
        Duration::from_millis(self.tell_timeout_ms.load(Ordering::Relaxed))
    }

    /// A copy of the credential as it is right now.
    pub fn credential(&self) -> Option<Credential> {
        self.credential.as_ref().map(SharedCredential::snapshot)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn remote(&self) -> &RemotePeer {
        &self.remote
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() == SessionState::Connected
    }

    pub(crate) fn disconnect(&self) -> &Arc<DisconnectBroadcast> {
        &self.disconnect
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for id in self.hooks.drain(..) {
            self.session.remove_hook(id);
        }
    }
}

pub struct PeerConnectionBuilder {
    local: Identity,
    remote: RemotePeer,
    credential: Option<Credential>,
    dialer: Option<Arc<dyn Dialer>>,
    session: Option<Session>,
    config: PeerConfig,
    renewal: Option<(Arc<dyn TokenIssuer>, Arc<dyn KeyResolver>)>,
}

impl PeerConnectionBuilder {
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Defaults to [`WebSocketDialer`].
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Runs on top of an existing session, e.g. one accepted by a server.
    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Keeps the credential fresh with tokens from `issuer`, verified against `keys`.
    pub fn renewal(mut self, issuer: Arc<dyn TokenIssuer>, keys: Arc<dyn KeyResolver>) -> Self {
        self.renewal = Some((issuer, keys));
        self
    }

    pub fn build(self) -> PeerConnection {
        let session = match self.session {
            Some(session) => session,
            None => {
                let dialer: Arc<dyn Dialer> = match self.dialer {
                    Some(dialer) => dialer,
                    None => Arc::new(WebSocketDialer),
                };
                Session::with_config(self.local.clone(), Some(dialer), self.config.session.clone())
            }
        };
        let credential = self.credential.map(SharedCredential::new);
        let disconnect = Arc::new(DisconnectBroadcast::new());

        // Registered before any user hook so pending calls hear about it first.
        let broadcast = disconnect.clone();
        let mut hooks = vec![session.on_disconnect(move || broadcast.fire_and_rebuild())];

        if let (Some(credential), Some((issuer, keys))) = (&credential, self.renewal) {
            let start = {
                let disconnect = disconnect.clone();
                let credential = credential.clone();
                let peer = self.remote.identity.clone();
                let renew_before = self.config.renew_before;
                let retry_interval = self.config.renew_retry_interval;
                move || {
                    if credential.snapshot().valid_until.is_none() {
                        debug!("credential has no expiry, not starting renewal");
                        return;
                    }
                    let renewer = Renewer {
                        peer: peer.clone(),
                        credential: credential.clone(),
                        issuer: issuer.clone(),
                        keys: keys.clone(),
                        renew_before,
                        retry_interval,
                    };
                    tokio::spawn(renewer.run(disconnect.subscribe()));
                }
            };
            if session.state() == SessionState::Connected {
                start();
            }
            hooks.push(session.on_connect(start));
        }

        PeerConnection {
            remote: self.remote,
            local: self.local,
            session,
            credential,
            disconnect,
            tell_timeout_ms: AtomicU64::new(
                u64::try_from(self.config.tell_timeout.as_millis()).unwrap_or(u64::MAX),
            ),
            hooks,
        }
    }
}
