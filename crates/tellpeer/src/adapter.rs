//! # Argument Adapter
//!
//! Converts between application arguments and the envelopes peers put on the wire.
//!
//! Outbound, a method call becomes a single [`CallEnvelope`] argument holding the
//! caller's identity, its credential, the application arguments and, last, the
//! response continuation. A continuation invocation becomes a single
//! [`CallbackEnvelope`] argument.
//!
//! Inbound, the envelopes are taken apart again and the remote continuations are
//! re-rooted at the application arguments, so that a handler addresses them by
//! their position in `withArgs`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use tellwire::Authentication;
use tellwire::CallEnvelope;
use tellwire::CallError;
use tellwire::CallbackEnvelope;
use tellwire::ErrorKind;
use tellwire::Identity;
use tellwire::PathSegment;
use tellwire::Reply;

use crate::args::Arg;
use crate::args::RemoteCallback;
use crate::args::Request;
use crate::registry::Callback;

const WITH_ARGS: &str = "withArgs";
const RESPONSE_CALLBACK: &str = "responseCallback";

/// Builds the arguments of an outbound method call.
///
/// The response continuation is the last continuation in the tree, so it gets
/// the largest id minted for the call.
pub fn wrap_method_args(
    local: &Identity,
    authentication: Option<Authentication>,
    args: Vec<Arg>,
    response: Callback,
) -> Vec<Arg> {
    let mut fields = vec![("kite".to_string(), Arg::Value(serde_json::json!(local)))];
    if let Some(authentication) = authentication {
        fields.push(("authentication".into(), Arg::Value(serde_json::json!(authentication))));
    }
    fields.push((WITH_ARGS.into(), Arg::List(args)));
    fields.push((RESPONSE_CALLBACK.into(), Arg::Callback(response)));
    vec![Arg::Map(fields)]
}

/// Builds the arguments of an outbound continuation invocation.
pub fn wrap_callback_args(local: &Identity, args: Vec<Arg>) -> Vec<Arg> {
    vec![Arg::Map(vec![
        (WITH_ARGS.into(), Arg::List(args)),
        ("kite".into(), Arg::Value(serde_json::json!(local))),
    ])]
}

/// Takes apart the arguments of an inbound continuation invocation.
///
/// Arguments that are not a callback envelope are passed through untouched, with
/// no caller.
pub fn unwrap_callback_args(request: Request) -> (Option<Identity>, Request) {
    let envelope = match request.args.as_slice() {
        [Value::Object(map)] if map.get(WITH_ARGS).is_some_and(Value::is_array) => {
            serde_json::from_value::<CallbackEnvelope>(request.args[0].clone()).ok()
        }
        _ => None,
    };

    match envelope {
        Some(envelope) => {
            let prefix = [PathSegment::Index(0), PathSegment::Key(WITH_ARGS.into())];
            (Some(envelope.kite), request.rebase(envelope.with_args, &prefix))
        }
        None => (None, request),
    }
}

/// An inbound method call as seen by a handler.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub caller: Identity,
    pub authentication: Option<Authentication>,
    /// The continuation the reply goes to; `None` for fire-and-forget calls.
    pub response: Option<RemoteCallback>,
    /// Application arguments, with their continuations.
    pub request: Request,
}

impl IncomingCall {
    pub fn args(&self) -> &[Value] {
        &self.request.args
    }

    /// Decodes application argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallError> {
        let value = self.request.args.get(index).cloned().ok_or_else(|| {
            CallError::new(
                ErrorKind::Other("argumentError".into()),
                format!("missing argument {}", index),
            )
        })?;
        serde_json::from_value(value).map_err(|e| {
            CallError::new(
                ErrorKind::Other("argumentError".into()),
                format!("argument {}: {}", index, e),
            )
        })
    }

    /// The continuation passed at `path` within the application arguments.
    pub fn callback(&self, path: &[PathSegment]) -> Option<RemoteCallback> {
        self.request.callback(path)
    }
}

/// Takes apart the envelope of an inbound method call.
pub fn unwrap_method_call(request: Request) -> tellwire::Result<IncomingCall> {
    let Some(first) = request.args.first() else {
        return Err(tellwire::Error::ProtocolViolation("method call without arguments".into()));
    };
    let envelope = CallEnvelope::from_value(first)?;

    let response = request.callback(&[PathSegment::Index(0), PathSegment::Key(RESPONSE_CALLBACK.into())]);
    let prefix = [PathSegment::Index(0), PathSegment::Key(WITH_ARGS.into())];
    let request = request.rebase(envelope.with_args, &prefix);

    Ok(IncomingCall {
        caller: envelope.kite,
        authentication: envelope.authentication,
        response,
        request,
    })
}

/// Sends the outcome of a handled call to the caller's response continuation.
pub async fn respond(local: &Identity, response: &RemoteCallback, result: Result<Value, CallError>) {
    let reply = Reply::from_result(result).to_value();
    let args = wrap_callback_args(local, vec![Arg::Value(reply)]);
    if let Err(e) = response.call(args).await {
        warn!(callback = response.id(), error = %e, "cannot deliver reply");
    }
}

/// Answers a call to a method this peer does not serve.
///
/// Only the response continuation is looked at, so a call whose envelope does
/// not decode still gets its answer.
pub async fn reply_method_not_found(local: &Identity, method: &str, request: Request) {
    match request.callback(&[PathSegment::Index(0), PathSegment::Key(RESPONSE_CALLBACK.into())]) {
        Some(response) => respond(local, &response, Err(CallError::method_not_found(method))).await,
        None => debug!(method, "caller expects no reply"),
    }
}
