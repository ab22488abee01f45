//! Authentication material attached to outgoing calls.

use serde::Deserialize;
use serde::Serialize;

/// Wire form of a credential: `{type, key}`.
///
/// The expiry of the credential never crosses the wire; it is tracked locally
/// by whoever owns the credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Scheme of the key, e.g. `"token"` or `"sessionID"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub key: String,
}

impl Authentication {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}
