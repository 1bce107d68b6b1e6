//! At-rest sealing of client secrets and OAuth tokens using AES-256-GCM.
//!
//! Every sealed value is bound through associated data to the tenant, the
//! provider and the column it lives in, so a ciphertext copied to another row
//! or field fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_SEALED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SEALED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for the data key with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    /// Create a new crypto key from exactly 32 bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Column a sealed value belongs to; part of the associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedField {
    ClientSecret,
    AccessToken,
    RefreshToken,
}

impl SealedField {
    fn as_str(self) -> &'static str {
        match self {
            SealedField::ClientSecret => "client_secret",
            SealedField::AccessToken => "access_token",
            SealedField::RefreshToken => "refresh_token",
        }
    }
}

/// Associated data binding a ciphertext to its owner and column.
pub fn associated_data(tenant_id: Uuid, provider: &str, field: SealedField) -> Vec<u8> {
    format!("{}|{}|{}", tenant_id, provider, field.as_str()).into_bytes()
}

/// Encrypt bytes; output is `version || nonce || ciphertext+tag`.
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_SEALED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes produced by [`encrypt_bytes`]. Unversioned input is rejected.
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if sealed[0] != VERSION_SEALED || sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&sealed[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let body = &sealed[VERSION_FIELD_LEN + NONCE_LEN..];
    debug_assert!(body.len() >= TAG_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(nonce, Payload { msg: body, aad })
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Seal a UTF-8 secret for the given tenant, provider and column.
pub fn seal_str(
    key: &CryptoKey,
    tenant_id: Uuid,
    provider: &str,
    field: SealedField,
    value: &str,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(
        key,
        &associated_data(tenant_id, provider, field),
        value.as_bytes(),
    )
}

/// Open a value sealed with [`seal_str`].
pub fn open_str(
    key: &CryptoKey,
    tenant_id: Uuid,
    provider: &str,
    field: SealedField,
    sealed: &[u8],
) -> Result<String, CryptoError> {
    let bytes = decrypt_bytes(key, &associated_data(tenant_id, provider, field), sealed)?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}
