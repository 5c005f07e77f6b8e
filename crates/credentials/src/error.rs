//! Typed error type for the credentials crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Encrypted credentials were supplied without a key to open them.
    #[error("a credential secret is required to decrypt these credentials")]
    MissingSecret,

    /// The `$` payload is not `<hex iv><base64 ciphertext>`.
    #[error("malformed encrypted credentials: {0}")]
    Malformed(String),

    /// The payload did not decrypt to a JSON object, i.e. the secret is wrong.
    #[error("failed to decrypt credentials: {0}")]
    Decrypt(String),

    #[error("failed to serialise credentials: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid cipher key or iv length")]
    KeyLength,
}
