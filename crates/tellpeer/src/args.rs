//! # Call Arguments
//!
//! Outbound arguments are an [`Arg`] tree that may hold local continuations
//! anywhere inside it. [`scrub`] flattens the tree into plain JSON, registering
//! every continuation it meets and recording where it was found.
//!
//! Inbound arguments arrive as a [`Request`]: the JSON values plus a handle for
//! every continuation the peer listed in its frame.
//!
//! ## Invariants
//! - `scrub` visits the tree depth-first in argument order, so a continuation
//!   placed after all others (the response continuation) gets the largest id
//!   minted by that call.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Map;
use serde_json::Value;

use tellwire::CALLBACK_PLACEHOLDER;
use tellwire::Message;
use tellwire::Method;
use tellwire::Path;
use tellwire::PathSegment;

use crate::registry::Callback;
use crate::registry::CallbackRegistry;
use crate::session::SessionError;
use crate::session::WeakSession;

/// An outgoing argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Callback(Callback),
    List(Vec<Arg>),
    /// Object fields, kept in insertion order.
    Map(Vec<(String, Arg)>),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Callback> for Arg {
    fn from(callback: Callback) -> Self {
        Self::Callback(callback)
    }
}

/// Replaces continuations with placeholders, registering each one.
///
/// Returns the plain arguments and the id → path table of the continuations
/// minted by this call.
pub(crate) fn scrub(args: Vec<Arg>, registry: &CallbackRegistry) -> (Vec<Value>, BTreeMap<u64, Path>) {
    let mut callbacks = BTreeMap::new();
    let mut path = Path::new();
    let values = args
        .into_iter()
        .enumerate()
        .map(|(i, arg)| {
            path.push(PathSegment::Index(i));
            let value = scrub_arg(arg, &mut path, registry, &mut callbacks);
            path.pop();
            value
        })
        .collect();
    (values, callbacks)
}

fn scrub_arg(
    arg: Arg,
    path: &mut Path,
    registry: &CallbackRegistry,
    callbacks: &mut BTreeMap<u64, Path>,
) -> Value {
    match arg {
        Arg::Value(value) => value,
        Arg::Callback(callback) => {
            let id = registry.register(callback);
            callbacks.insert(id, path.clone());
            Value::String(CALLBACK_PLACEHOLDER.into())
        }
        Arg::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                path.push(PathSegment::Index(i));
                out.push(scrub_arg(item, path, registry, callbacks));
                path.pop();
            }
            Value::Array(out)
        }
        Arg::Map(fields) => {
            let mut out = Map::new();
            for (key, field) in fields {
                path.push(PathSegment::Key(key.clone()));
                let value = scrub_arg(field, path, registry, callbacks);
                path.pop();
                out.insert(key, value);
            }
            Value::Object(out)
        }
    }
}

/// Handle to a continuation that lives on the peer.
#[derive(Clone)]
pub struct RemoteCallback {
    id: u64,
    session: WeakSession,
}

impl RemoteCallback {
    pub(crate) fn new(id: u64, session: WeakSession) -> Self {
        Self { id, session }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invokes the continuation on the peer.
    ///
    /// Fails with [`SessionError::Closed`] once the owning session is gone.
    pub async fn call(&self, args: Vec<Arg>) -> Result<BTreeMap<u64, Path>, SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::Closed)?;
        session.send(Method::Callback(self.id), args).await
    }
}

impl fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCallback").field("id", &self.id).finish()
    }
}

/// Arguments of an inbound invocation.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub args: Vec<Value>,
    callbacks: BTreeMap<Path, RemoteCallback>,
}

impl Request {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            callbacks: BTreeMap::new(),
        }
    }

    /// Builds a request from a decoded frame, binding its callbacks to `session`.
    pub(crate) fn from_message(message: Message, session: &WeakSession) -> tellwire::Result<Self> {
        let callbacks = message
            .callback_entries()?
            .into_iter()
            .map(|(id, path)| (path, RemoteCallback::new(id, session.clone())))
            .collect();
        Ok(Self {
            args: message.arguments,
            callbacks,
        })
    }

    /// The peer continuation found at `path`, if any.
    pub fn callback(&self, path: &[PathSegment]) -> Option<RemoteCallback> {
        self.callbacks.get(path).cloned()
    }

    pub fn callbacks(&self) -> impl Iterator<Item = (&Path, &RemoteCallback)> {
        self.callbacks.iter()
    }

    /// Replaces the arguments with `args`, keeping only the continuations under
    /// `prefix` and re-rooting their paths at the new arguments.
    pub(crate) fn rebase(self, args: Vec<Value>, prefix: &[PathSegment]) -> Self {
        let callbacks = self
            .callbacks
            .into_iter()
            .filter_map(|(path, callback)| {
                path.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_vec(), callback))
            })
            .collect();
        Self { args, callbacks }
    }
}
