//! # Session with Async Pump
//!
//! A `Session` owns one duplex connection at a time and everything that is scoped
//! to it: the callback registry, the handlers for inbound calls, and the
//! connect/disconnect hooks.
//!
//! Every successful dial starts a new *epoch*: a fresh transport plus a pump task
//! that reads frames and routes them. Frames naming a continuation id go to the
//! [`CallbackRegistry`]; frames naming a method go to its handler, or get a
//! `methodNotFound` reply when there is none.
//!
//! ## Invariants
//! - At most one epoch is live. A pump that outlives its epoch tears nothing down.
//! - Dialing while connected ends the live epoch, with its disconnect hooks, before
//!   the new one starts.
//! - Connect hooks run before the new epoch's pump, so nothing they subscribe to
//!   can be torn down ahead of them.
//! - The registry is cleared when an epoch ends: the peer that held those ids is
//!   gone, so the continuations can never fire.
//! - Ending an epoch and starting one never interleave: both happen under the
//!   transition lock, which is never held across an await.
//! - No lock is held across an await.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use tellwire::CallError;
use tellwire::Identity;
use tellwire::Message;
use tellwire::Method;
use tellwire::Path;

use crate::adapter;
use crate::adapter::IncomingCall;
use crate::args;
use crate::args::Arg;
use crate::args::Request;
use crate::config::SessionConfig;
use crate::registry::CallbackRegistry;
use crate::transport;
use crate::transport::Dialer;
use crate::transport::Transport;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("session is closed")]
    Closed,
    #[error("session has no dialer")]
    NoDialer,
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("cannot encode message: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Names a registered connect or disconnect hook, for [`Session::remove_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type Handler = Arc<dyn Fn(IncomingCall) -> BoxFuture<'static, std::result::Result<Value, CallError>> + Send + Sync>;

/// The live connection of one epoch.
struct Epoch {
    id: u64,
    transport: Arc<dyn Transport>,
    // Dropping this stops the epoch's pump.
    _shutdown: oneshot::Sender<()>,
}

pub(crate) struct Inner {
    local: Identity,
    dialer: Option<Arc<dyn Dialer>>,
    config: SessionConfig,
    registry: CallbackRegistry,
    handlers: DashMap<String, Handler>,
    on_connect: Mutex<Vec<(HookId, Hook)>>,
    on_disconnect: Mutex<Vec<(HookId, Hook)>>,
    hook_ids: AtomicU64,
    epoch: Mutex<Option<Epoch>>,
    transition: Mutex<()>,
    epochs: AtomicU64,
    state: watch::Sender<SessionState>,
    redial_url: Mutex<Option<String>>,
    closed: AtomicBool,
}

/// Duplex RPC session with a peer. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// Non-owning handle to a session, held by continuations and pumps.
#[derive(Clone, Default)]
pub struct WeakSession(Weak<Inner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// Creates a disconnected session that connects through `dialer`.
    pub fn new(local: Identity, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_config(local, Some(dialer), SessionConfig::default())
    }

    pub fn with_config(local: Identity, dialer: Option<Arc<dyn Dialer>>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                dialer,
                config,
                registry: CallbackRegistry::new(),
                handlers: DashMap::new(),
                on_connect: Mutex::new(Vec::new()),
                on_disconnect: Mutex::new(Vec::new()),
                hook_ids: AtomicU64::new(0),
                epoch: Mutex::new(None),
                transition: Mutex::new(()),
                epochs: AtomicU64::new(0),
                state: watch::Sender::new(SessionState::Disconnected),
                redial_url: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wraps an already established transport, e.g. one accepted by a server.
    ///
    /// The session is connected on return. It has no dialer, so once the
    /// transport ends it stays disconnected.
    pub fn accept(local: Identity, transport: Box<dyn Transport>) -> Self {
        let session = Self::with_config(local, None, SessionConfig::default());
        session.install(transport);
        session
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub fn local(&self) -> &Identity {
        &self.inner.local
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Number of connections established so far.
    pub fn epoch(&self) -> u64 {
        self.inner.epochs.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Registers a function to run after every successful connect.
    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) -> HookId {
        let id = self.next_hook_id();
        lock(&self.inner.on_connect).push((id, Arc::new(hook)));
        id
    }

    /// Registers a function to run after every disconnect.
    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) -> HookId {
        let id = self.next_hook_id();
        lock(&self.inner.on_disconnect).push((id, Arc::new(hook)));
        id
    }

    /// Unregisters a hook. Returns whether it was registered.
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut removed = false;
        for hooks in [&self.inner.on_connect, &self.inner.on_disconnect] {
            let mut hooks = lock(hooks);
            let before = hooks.len();
            hooks.retain(|(hook_id, _)| *hook_id != id);
            removed |= hooks.len() != before;
        }
        removed
    }

    /// Number of registered connect and disconnect hooks.
    pub fn hook_count(&self) -> (usize, usize) {
        (lock(&self.inner.on_connect).len(), lock(&self.inner.on_disconnect).len())
    }

    fn next_hook_id(&self) -> HookId {
        HookId(self.inner.hook_ids.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers the handler for inbound calls to `method`.
    ///
    /// The handler's result is sent back through the caller's response
    /// continuation, if it provided one.
    pub fn handle<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, CallError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |call| handler(call).boxed());
        self.inner.handlers.insert(method.into(), handler);
    }

    /// Connects once. A live connection is ended first.
    pub async fn dial(&self, url: &str) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let dialer = self.inner.dialer.clone().ok_or(SessionError::NoDialer)?;

        if let Some(live) = self.end_epoch(None, "redialing") {
            live.close().await;
        }

        self.inner.state.send_replace(SessionState::Connecting);
        match dialer.dial(url).await {
            Ok(transport) => {
                if self.is_closed() {
                    transport.close().await;
                    self.inner.state.send_replace(SessionState::Disconnected);
                    return Err(SessionError::Closed);
                }
                info!(url, "connected");
                self.install(transport);
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(SessionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Connects, retrying until it succeeds or the session is closed.
    ///
    /// After an unexpected disconnect the session dials again on its own.
    pub async fn dial_forever(&self, url: &str) -> Result<()> {
        *lock(&self.inner.redial_url) = Some(url.to_string());
        loop {
            match self.dial(url).await {
                Ok(()) => return Ok(()),
                Err(SessionError::Closed) => return Err(SessionError::Closed),
                Err(SessionError::NoDialer) => return Err(SessionError::NoDialer),
                Err(e) => {
                    warn!(url, error = %e, retry_in = ?self.inner.config.redial_interval, "dial failed");
                    tokio::time::sleep(self.inner.config.redial_interval).await;
                }
            }
        }
    }

    /// Closes the connection for good.
    ///
    /// Disconnect hooks have run by the time this returns.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        lock(&self.inner.redial_url).take();
        if let Some(transport) = self.end_epoch(None, "closed locally") {
            transport.close().await;
        }
    }

    /// Sends `args` to `method` on the peer.
    ///
    /// Continuations inside `args` are registered before the frame leaves.
    /// Returns the ids minted for them with their paths; on failure none of them
    /// stay registered.
    pub async fn send(&self, method: Method, args: Vec<Arg>) -> Result<BTreeMap<u64, Path>> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let transport = lock(&self.inner.epoch)
            .as_ref()
            .map(|epoch| epoch.transport.clone())
            .ok_or(SessionError::NotConnected)?;

        let (arguments, minted) = args::scrub(args, &self.inner.registry);
        let mut message = Message::new(method, arguments);
        message.callbacks = minted
            .iter()
            .map(|(id, path)| (id.to_string(), path.clone()))
            .collect();

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.forget(&minted);
                return Err(SessionError::Encode(e.to_string()));
            }
        };

        if let Err(e) = transport.send(frame).await {
            self.forget(&minted);
            return Err(e.into());
        }

        Ok(minted)
    }

    /// Drops a continuation from the registry. Unknown ids are ignored.
    pub fn remove_callback(&self, id: u64) -> bool {
        self.inner.registry.remove(id)
    }

    fn forget(&self, minted: &BTreeMap<u64, Path>) {
        for id in minted.keys() {
            self.inner.registry.remove(*id);
        }
    }

    /// Starts a new epoch on `transport`.
    fn install(&self, transport: Box<dyn Transport>) {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let id = self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let transition = lock(&self.inner.transition);
        let previous = lock(&self.inner.epoch).replace(Epoch {
            id,
            transport: transport.clone(),
            _shutdown: shutdown_tx,
        });
        // Two dials raced; the loser's epoch ends here.
        if let Some(previous) = previous {
            warn!(epoch = id, "replacing a live connection");
            let Epoch { id: previous_id, transport: stale, .. } = previous;
            tokio::spawn(async move { stale.close().await });
            self.retire(previous_id, "replaced");
        }

        self.inner.state.send_replace(SessionState::Connected);
        let hooks = lock(&self.inner.on_connect).clone();
        for (_, hook) in hooks {
            hook();
        }
        drop(transition);

        tokio::spawn(pump(self.downgrade(), id, transport, shutdown_rx));
    }

    /// Ends epoch `id` if it is still the live one, then redials if asked to.
    async fn teardown(&self, id: u64, reason: &str) {
        let Some(transport) = self.end_epoch(Some(id), reason) else { return };
        transport.close().await;

        let redial_url = lock(&self.inner.redial_url).clone();
        if let Some(url) = redial_url {
            if !self.is_closed() {
                tokio::spawn(redial(self.clone(), url));
            }
        }
    }

    /// Ends the live epoch, or only epoch `id` when given. Returns its transport
    /// for the caller to close.
    fn end_epoch(&self, id: Option<u64>, reason: &str) -> Option<Arc<dyn Transport>> {
        let _transition = lock(&self.inner.transition);
        let epoch = {
            let mut current = lock(&self.inner.epoch);
            match current.as_ref() {
                Some(epoch) if id.is_none_or(|id| id == epoch.id) => current.take(),
                _ => None,
            }
        }?;

        self.inner.state.send_replace(SessionState::Disconnected);
        self.retire(epoch.id, reason);
        Some(epoch.transport)
    }

    /// Drops what epoch `id` left behind and runs the disconnect hooks.
    fn retire(&self, id: u64, reason: &str) {
        self.inner.registry.clear();
        info!(epoch = id, reason, "disconnected");

        let hooks = lock(&self.inner.on_disconnect).clone();
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Routes one inbound frame.
    fn route(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        let method = message.method.clone();
        let request = match Request::from_message(message, &self.downgrade()) {
            Ok(request) => request,
            Err(e) => {
                warn!(%method, error = %e, "dropping frame with invalid callbacks");
                return;
            }
        };

        match method {
            Method::Callback(id) => match self.inner.registry.get(id) {
                Some(callback) => {
                    let (_caller, request) = adapter::unwrap_callback_args(request);
                    callback.call(request);
                }
                None => debug!(id, "callback is not registered, ignoring"),
            },
            Method::Name(name) => {
                let handler = self.inner.handlers.get(&name).map(|entry| entry.value().clone());
                let local = self.inner.local.clone();
                match handler {
                    Some(handler) => {
                        tokio::spawn(run_handler(local, name, handler, request));
                    }
                    None => {
                        debug!(method = %name, "no handler for inbound call");
                        tokio::spawn(async move {
                            adapter::reply_method_not_found(&local, &name, request).await;
                        });
                    }
                }
            }
        }
    }
}

async fn run_handler(local: Identity, method: String, handler: Handler, request: Request) {
    let call = match adapter::unwrap_method_call(request) {
        Ok(call) => call,
        Err(e) => {
            warn!(%method, error = %e, "dropping call with malformed envelope");
            return;
        }
    };

    let response = call.response.clone();
    let result = handler(call).await;
    match response {
        Some(response) => adapter::respond(&local, &response, result).await,
        None => debug!(%method, "caller expects no reply"),
    }
}

/// Reads frames of one epoch until the stream ends or the epoch is shut down.
async fn pump(
    session: WeakSession,
    epoch: u64,
    transport: Arc<dyn Transport>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break "epoch ended",
            frame = transport.recv() => match frame {
                Ok(Some(frame)) => {
                    let Some(session) = session.upgrade() else { return };
                    session.route(&frame);
                }
                Ok(None) => break "stream closed",
                Err(e) => {
                    warn!(epoch, error = %e, "transport error");
                    break "transport error";
                }
            }
        }
    };

    if let Some(session) = session.upgrade() {
        session.teardown(epoch, reason).await;
    }
}

// Runs detached from the pump whose teardown spawned it.
fn redial(session: Session, url: String) -> BoxFuture<'static, ()> {
    async move {
        if let Err(e) = session.dial_forever(&url).await {
            debug!(url, error = %e, "stopped redialing");
        }
    }
    .boxed()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
