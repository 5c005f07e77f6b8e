//! Credential cipher.
//!
//! The envelope format matches node-red's credential storage: the key is the
//! SHA-256 digest of the secret, the cipher is AES-256-CTR and the payload is
//! the hex-encoded 16 byte IV followed by the base64 ciphertext of the JSON
//! credentials object.
//!
//! The IV is derived from the key and the plaintext, so encryption is a pure
//! function of its inputs.
//!
//! The envelope carries no MAC. A wrong secret is caught only because the
//! keystream turns the payload into bytes that do not parse as a JSON object.
//! For very short payloads (an empty `{}` is two bytes) a wrong secret opens
//! to a valid object roughly once in 65536 tries. The IV cannot be used as a
//! check either: blobs sealed by Node-RED itself carry a random IV and must
//! still open.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{CredentialError, Credentials, EncryptedBlob};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of the hex-encoded IV prefix.
const IV_HEX_LEN: usize = 32;

/// Seals and opens credentials blobs.
pub trait CredentialCipher: Send + Sync {
    /// Encrypt a plaintext credentials map under `secret`.
    fn encrypt(&self, plaintext: &Map<String, Value>, secret: &str)
        -> Result<EncryptedBlob, CredentialError>;

    /// Decrypt `blob` with `secret`.
    ///
    /// A wrong secret fails with [`CredentialError::Decrypt`] unless the
    /// garbage happens to parse as a JSON object; see the module docs.
    fn decrypt(&self, blob: &EncryptedBlob, secret: &str)
        -> Result<Map<String, Value>, CredentialError>;

    /// Move `credentials` under `to_secret`.
    ///
    /// Encrypted input is opened with `from_secret`; plaintext input is
    /// sealed directly and `from_secret` is ignored.
    fn reencrypt(
        &self,
        credentials: &Credentials,
        from_secret: Option<&str>,
        to_secret: &str,
    ) -> Result<Credentials, CredentialError> {
        let plaintext = match credentials {
            Credentials::Plaintext(map) => map.clone(),
            Credentials::Encrypted(blob) => {
                let from = from_secret.ok_or(CredentialError::MissingSecret)?;
                self.decrypt(blob, from)?
            }
        };
        Ok(Credentials::Encrypted(self.encrypt(&plaintext, to_secret)?))
    }
}

/// AES-256-CTR implementation of [`CredentialCipher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCtrCipher;

impl AesCtrCipher {
    pub fn new() -> Self {
        Self
    }

    fn key(secret: &str) -> [u8; 32] {
        Sha256::digest(secret.as_bytes()).into()
    }

    fn apply(key: &[u8; 32], iv: &[u8], buf: &mut [u8]) -> Result<(), CredentialError> {
        let mut cipher =
            Aes256Ctr::new_from_slices(key, iv).map_err(|_| CredentialError::KeyLength)?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

impl CredentialCipher for AesCtrCipher {
    fn encrypt(
        &self,
        plaintext: &Map<String, Value>,
        secret: &str,
    ) -> Result<EncryptedBlob, CredentialError> {
        let key = Self::key(secret);
        let mut buf = serde_json::to_vec(plaintext)?;

        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(&buf);
        let digest = hasher.finalize();
        let iv = &digest[..16];

        Self::apply(&key, iv, &mut buf)?;
        Ok(EncryptedBlob::new(format!("{}{}", hex::encode(iv), STANDARD.encode(&buf))))
    }

    fn decrypt(
        &self,
        blob: &EncryptedBlob,
        secret: &str,
    ) -> Result<Map<String, Value>, CredentialError> {
        let data = blob.as_str();
        let (iv_hex, body) = match (data.get(..IV_HEX_LEN), data.get(IV_HEX_LEN..)) {
            (Some(iv), Some(body)) => (iv, body),
            _ => return Err(CredentialError::Malformed("payload shorter than iv".into())),
        };

        let iv = hex::decode(iv_hex).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let mut buf = STANDARD
            .decode(body)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        Self::apply(&Self::key(secret), &iv, &mut buf)?;

        serde_json::from_slice::<Map<String, Value>>(&buf)
            .map_err(|e| CredentialError::Decrypt(e.to_string()))
    }
}
