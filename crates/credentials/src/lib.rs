//! `credentials` crate — the snapshot credentials blob and its cipher.
//!
//! Snapshot credentials are stored in the node-red `{"$": "..."}` envelope.
//! [`Credentials`] makes the encrypted/plaintext distinction explicit, and
//! [`CredentialCipher`] moves a blob from one secret to another without the
//! plaintext ever leaving the cipher.

pub mod error;
pub mod model;
pub mod cipher;
pub mod secret;

pub use error::CredentialError;
pub use model::{Credentials, EncryptedBlob};
pub use cipher::{AesCtrCipher, CredentialCipher};
pub use secret::generate_secret;
