//! Secret hashing and field encryption.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::SaltString,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bson::{Binary, Bson, Document, doc, spec::BinarySubtype};
use rand::RngCore;

use crate::error::{ResourceError, ResourceResult};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const SALT_SIZE: usize = 16;

/// Hashes secrets into Argon2id PHC strings and verifies candidates against them.
#[derive(Debug, Clone, Default)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl SecretHasher {
    pub fn new() -> Self {
        SecretHasher::default()
    }

    /// Hashes `secret` with a fresh random salt.
    pub fn hash(&self, secret: &str) -> ResourceResult<String> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt)
            .map_err(|e| ResourceError::Serialization(e.to_string()))?;

        self.argon2
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ResourceError::Serialization(e.to_string()))
    }

    /// Checks `secret` against a stored PHC string.
    ///
    /// # Errors
    ///
    /// [`ResourceError::SecretMismatch`] when the secret does not match, and
    /// [`ResourceError::ValidationFailed`] when `hash` is not a PHC string.
    pub fn verify(&self, secret: &str, hash: &str) -> ResourceResult<()> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| ResourceError::ValidationFailed(format!("invalid password hash: {e}")))?;

        self.argon2
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| ResourceError::SecretMismatch)
    }

    /// Whether `value` is already an Argon2 PHC string.
    pub fn is_hashed(value: &str) -> bool {
        value.starts_with("$argon2") && PasswordHash::new(value).is_ok()
    }
}

/// Encrypts individual field values with AES-256-GCM.
///
/// The plaintext is the BSON serialization of `{ "v": value }`, so any value type
/// round-trips. The stored form is an encrypted binary holding
/// `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn new(key: &[u8]) -> ResourceResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(ResourceError::Configuration(format!(
                "cipher key must be {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ResourceError::Configuration(e.to_string()))?;

        Ok(FieldCipher { cipher })
    }

    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> ResourceResult<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ResourceError::Configuration(format!("cipher key is not base64: {e}")))?;

        FieldCipher::new(&key)
    }

    pub fn encrypt(&self, value: &Bson) -> ResourceResult<Bson> {
        let plaintext = bson::serialize_to_vec(&doc! { "v": value.clone() })?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| ResourceError::Serialization("encryption failed".to_string()))?;

        let mut bytes = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        bytes.extend_from_slice(&nonce_bytes);
        bytes.extend(ciphertext);

        Ok(Bson::Binary(Binary {
            subtype: BinarySubtype::Encrypted,
            bytes,
        }))
    }

    /// Recovers the value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, value: &Bson) -> ResourceResult<Bson> {
        let bytes = match value {
            Bson::Binary(Binary {
                subtype: BinarySubtype::Encrypted,
                bytes,
            }) => bytes,
            _ => {
                return Err(ResourceError::ValidationFailed(
                    "value is not an encrypted binary".to_string(),
                ));
            }
        };

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ResourceError::Serialization("ciphertext too short".to_string()));
        }

        let nonce = Nonce::from_slice(&bytes[..NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &bytes[NONCE_SIZE..])
            .map_err(|_| ResourceError::Serialization("decryption failed".to_string()))?;

        let mut wrapper: Document = bson::deserialize_from_slice(&plaintext)?;
        wrapper
            .remove("v")
            .ok_or_else(|| ResourceError::Serialization("encrypted payload has no value".to_string()))
    }

    /// Whether `value` is already in encrypted form.
    pub fn is_encrypted(value: &Bson) -> bool {
        matches!(
            value,
            Bson::Binary(Binary {
                subtype: BinarySubtype::Encrypted,
                ..
            })
        )
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
