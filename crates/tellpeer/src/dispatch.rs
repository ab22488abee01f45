//! # Call Dispatcher
//!
//! Turns a method call into exactly one outcome.
//!
//! Each call runs as its own task. It registers a one-shot response continuation,
//! sends the call, and then races three things: the reply arriving through the
//! continuation, the connection's disconnect signal, and its timeout.
//!
//! ## The id hand-off
//!
//! The continuation's id is only known once `send` returns, but the peer may
//! answer before that. [`IdHandoff`] is the single-slot meeting point: whichever
//! side arrives second performs the registry removal, so the entry is removed
//! exactly once and never leaks.
//!
//! ## Invariants
//! - A call resolves once: `done` is taken out of its slot on first use.
//! - The response continuation is the largest id minted by the send.
//! - A timed out or disconnected call removes its continuation; a late reply
//!   then finds nothing.
//! - The disconnect signal is taken right before the send, so it belongs to the
//!   epoch the call actually goes out on, not one that ended while it was queued.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use tellwire::Authentication;
use tellwire::CallError;
use tellwire::Identity;
use tellwire::Method;
use tellwire::Path;
use tellwire::Reply;

use crate::adapter;
use crate::args::Arg;
use crate::connection::PeerConnection;
use crate::registry::Callback;
use crate::session::Session;
use crate::session::WeakSession;
use crate::signal::DisconnectBroadcast;

type Outcome = Result<Value, CallError>;

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(Option<u64>),
    /// The continuation fired before the id was handed over.
    Claimed,
    Done,
}

/// Single-slot rendezvous for the response continuation's id.
#[derive(Debug)]
pub struct IdHandoff(Mutex<Slot>);

impl IdHandoff {
    pub fn new() -> Self {
        Self(Mutex::new(Slot::Pending))
    }

    /// Hands over the id. Returns it back if the continuation has already fired,
    /// in which case the caller must remove it.
    pub fn put(&self, id: Option<u64>) -> Option<u64> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Slot::Pending => {
                *slot = Slot::Ready(id);
                None
            }
            Slot::Claimed => {
                *slot = Slot::Done;
                id
            }
            Slot::Ready(_) | Slot::Done => None,
        }
    }

    /// Takes the id if it has been handed over, otherwise marks the slot claimed.
    pub fn take(&self) -> Option<u64> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Pending => {
                *slot = Slot::Claimed;
                None
            }
            Slot::Ready(id) => id,
            Slot::Claimed => {
                *slot = Slot::Claimed;
                None
            }
            Slot::Done => None,
        }
    }
}

impl Default for IdHandoff {
    fn default() -> Self {
        Self::new()
    }
}

/// The top-level continuation among those minted by one send.
pub fn max_callback_id(minted: &BTreeMap<u64, Path>) -> Option<u64> {
    minted.keys().max().copied()
}

/// The one-shot continuation that receives a call's reply.
pub fn response_callback(
    done: oneshot::Sender<Outcome>,
    handoff: Arc<IdHandoff>,
    session: WeakSession,
) -> Callback {
    let done = Mutex::new(Some(done));
    Callback::new(move |request| {
        if let Some(id) = handoff.take() {
            if let Some(session) = session.upgrade() {
                session.remove_callback(id);
            }
        }

        let outcome = Reply::from_args(&request.args);
        if let Err(e) = &outcome {
            warn!(kind = %e.kind, message = %e.message, "call failed on remote peer");
        }

        let done = done.lock().unwrap_or_else(PoisonError::into_inner).take();
        match done {
            Some(done) => {
                let _ = done.send(outcome);
            }
            None => debug!("reply already delivered, ignoring"),
        }
    })
}

/// The eventual outcome of a call.
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<Outcome>);

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(CallError::disconnect())))
    }
}

impl PeerConnection {
    /// Calls `method` with the default timeout. The call starts right away;
    /// the returned future only waits for its outcome.
    pub fn go(&self, method: impl Into<String>, args: Vec<Arg>) -> PendingReply {
        self.go_with_timeout(method, args, Duration::ZERO)
    }

    /// Calls `method`, giving up after `timeout`. A zero timeout means the default.
    pub fn go_with_timeout(&self, method: impl Into<String>, args: Vec<Arg>, timeout: Duration) -> PendingReply {
        let timeout = if timeout.is_zero() { self.tell_timeout() } else { timeout };
        let call = OutboundCall {
            session: self.session().clone(),
            local: self.local().clone(),
            authentication: self.credential().map(|credential| credential.to_wire()),
            method: method.into(),
            args,
            timeout,
            disconnect: self.disconnect().clone(),
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(call.run().await);
        });
        PendingReply(rx)
    }

    /// Calls `method` with the default timeout and waits for the outcome.
    pub async fn tell(&self, method: impl Into<String>, args: Vec<Arg>) -> Outcome {
        self.go(method, args).await
    }

    pub async fn tell_with_timeout(&self, method: impl Into<String>, args: Vec<Arg>, timeout: Duration) -> Outcome {
        self.go_with_timeout(method, args, timeout).await
    }
}

struct OutboundCall {
    session: Session,
    local: Identity,
    authentication: Option<Authentication>,
    method: String,
    args: Vec<Arg>,
    timeout: Duration,
    disconnect: Arc<DisconnectBroadcast>,
}

impl OutboundCall {
    async fn run(mut self) -> Outcome {
        let (done_tx, done_rx) = oneshot::channel();
        let handoff = Arc::new(IdHandoff::new());
        let response = response_callback(done_tx, handoff.clone(), self.session.downgrade());
        let args = adapter::wrap_method_args(
            &self.local,
            self.authentication.take(),
            std::mem::take(&mut self.args),
            response,
        );

        debug!(method = %self.method, timeout = ?self.timeout, "sending call");
        let mut disconnect = self.disconnect.subscribe();
        let minted = self
            .session
            .send(Method::Name(self.method.clone()), args)
            .await
            .map_err(|e| CallError::send_error(e.to_string()))?;

        let id = max_callback_id(&minted);
        if let Some(claimed) = handoff.put(id) {
            self.session.remove_callback(claimed);
        }

        tokio::select! {
            reply = done_rx => reply.unwrap_or_else(|_| Err(CallError::disconnect())),
            _ = disconnect.fired() => {
                self.forget(id);
                Err(CallError::disconnect())
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.forget(id);
                debug!(method = %self.method, "call timed out");
                Err(CallError::timeout())
            }
        }
    }

    fn forget(&self, id: Option<u64>) {
        if let Some(id) = id {
            self.session.remove_callback(id);
        }
    }
}
