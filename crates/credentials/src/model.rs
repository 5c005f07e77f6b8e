//! The credentials blob carried inside a snapshot's flows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// EncryptedBlob
// ---------------------------------------------------------------------------

/// An opaque encrypted credentials payload, serialised as `{"$": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedBlob {
    #[serde(rename = "$")]
    data: String,
}

impl EncryptedBlob {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Node credentials of a flow set.
///
/// `Encrypted` is the only form that may be persisted. `Plaintext` exists
/// transiently, e.g. in an uploaded payload before it is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Encrypted(EncryptedBlob),
    Plaintext(Map<String, Value>),
}

impl Credentials {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// `true` for an empty plaintext map.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Plaintext(map) if map.is_empty())
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::Plaintext(Map::new())
    }
}

impl From<EncryptedBlob> for Credentials {
    fn from(blob: EncryptedBlob) -> Self {
        Self::Encrypted(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dollar_envelope_parses_as_encrypted() {
        let creds: Credentials = serde_json::from_value(json!({ "$": "abcd" })).unwrap();
        assert_eq!(creds, Credentials::Encrypted(EncryptedBlob::new("abcd")));
        assert_eq!(serde_json::to_value(&creds).unwrap(), json!({ "$": "abcd" }));
    }

    #[test]
    fn node_map_parses_as_plaintext() {
        let creds: Credentials =
            serde_json::from_value(json!({ "n1": { "user": "u", "password": "p" } })).unwrap();
        assert!(!creds.is_encrypted());
    }

    #[test]
    fn dollar_key_next_to_other_keys_is_plaintext() {
        // a node id that happens to be "$" must not be mistaken for an envelope
        let creds: Credentials =
            serde_json::from_value(json!({ "$": "x", "n1": { "token": "t" } })).unwrap();
        assert!(matches!(creds, Credentials::Plaintext(ref m) if m.len() == 2));
    }
}
