//! # Envelopes
//!
//! The shapes of the first argument of every call and of every reply.
//!
//! ## Invariants
//! - A reply must carry at least one of `result` / `error`; a reply carrying
//!   neither, or carrying an `error` that does not decode, is `invalidResponse`.
//! - `error: null` is the same as an absent error.
//! - A call envelope with a missing or malformed `kite` or `authentication` still
//!   decodes, with those fields left empty.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;

use crate::auth::Authentication;
use crate::error::CallError;
use crate::identity::Identity;

/// First argument of a method call.
///
/// On the wire `responseCallback` holds the placeholder of a continuation; the
/// callable handle itself is recovered from the frame's callback table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    #[serde(default, deserialize_with = "lenient")]
    pub kite: Identity,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub with_args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_callback: Option<Value>,
}

impl CallEnvelope {
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        Ok(Self::deserialize(value)?)
    }
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// First argument of a continuation invocation: who is calling it, and with what.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackEnvelope {
    pub kite: Identity,
    #[serde(default)]
    pub with_args: Vec<Value>,
}

/// The single argument delivered to a response continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub result: Option<Value>,
    pub error: Option<CallError>,
}

impl Reply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: CallError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn from_result(result: std::result::Result<Value, CallError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::err(error),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("result".into(), self.result.clone().unwrap_or(Value::Null));
        map.insert(
            "error".into(),
            match &self.error {
                Some(error) => serde_json::json!({ "type": error.kind.as_tag(), "message": error.message }),
                None => Value::Null,
            },
        );
        Value::Object(map)
    }

    /// Interprets the arguments a response continuation was invoked with.
    ///
    /// Returns the result value, the peer's error, or `invalidResponse` when the
    /// arguments are not exactly one reply object.
    pub fn from_args(args: &[Value]) -> std::result::Result<Value, CallError> {
        let [arg] = args else {
            return Err(CallError::invalid_response(format!(
                "expected 1 reply argument, got {}",
                args.len()
            )));
        };

        let Value::Object(map) = arg else {
            return Err(CallError::invalid_response("reply argument is not an object"));
        };

        if !map.contains_key("result") && !map.contains_key("error") {
            return Err(CallError::invalid_response(
                "peer has sent invalid response arguments",
            ));
        }

        match map.get("error") {
            None | Some(Value::Null) => {}
            Some(raw) => {
                return match CallError::deserialize(raw) {
                    Ok(error) => Err(error),
                    Err(e) => Err(CallError::invalid_response(e.to_string())),
                };
            }
        }

        Ok(map.get("result").cloned().unwrap_or(Value::Null))
    }
}
