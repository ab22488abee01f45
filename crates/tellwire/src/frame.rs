//! # Message Frames
//!
//! One frame per transport message, encoded as JSON text:
//!
//! ```text
//! { "method": "add" | 7, "arguments": [...], "callbacks": { "7": [0, "responseCallback"] } }
//! ```
//!
//! `method` is either the name of a handler or the id of a continuation that the
//! receiver previously handed out. Continuations inside `arguments` are replaced
//! by [`CALLBACK_PLACEHOLDER`] and listed in `callbacks`, keyed by their id, with
//! the path at which they sit.
//!
//! ## Invariants
//! - Callback ids are decimal strings on the wire and `u64` in memory.
//! - Unknown top-level fields are ignored.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// The value left in place of a continuation inside the arguments.
pub const CALLBACK_PLACEHOLDER: &str = "[Function]";

/// Target of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Method {
    /// Invocation of a continuation previously sent by the receiver.
    Callback(u64),
    /// Invocation of a named handler.
    Name(String),
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(id) => write!(f, "callback#{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// One step into a JSON value: an array index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

/// Location of a value inside the argument list, starting with the argument index.
pub type Path = Vec<PathSegment>;

/// A single frame exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub method: Method,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub callbacks: BTreeMap<String, Path>,
}

impl Message {
    pub fn new(method: Method, arguments: Vec<Value>) -> Self {
        Self {
            method,
            arguments,
            callbacks: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The callback table with ids parsed, in ascending id order.
    pub fn callback_entries(&self) -> Result<Vec<(u64, Path)>> {
        let mut entries = self
            .callbacks
            .iter()
            .map(|(id, path)| {
                id.parse::<u64>()
                    .map(|id| (id, path.clone()))
                    .map_err(|_| Error::ProtocolViolation(format!("invalid callback id: {}", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries)
    }
}
