//! Encryption-at-rest for provider parameter values.
//!
//! Ciphertext format: base64(nonce || ciphertext || tag). Every call to
//! `encrypt` draws a fresh 96-bit nonce from the system CSPRNG.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

/// Opaque encrypt/decrypt capability.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;

    async fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

/// AES-256-GCM cipher keyed from a 32-byte secret.
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    /// Build from raw key bytes.
    pub fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CryptoError::InvalidKey("failed to create AES-256-GCM key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(key: &SecretString) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key is not valid base64: {e}")))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("key must be 32 bytes, got {}", bytes.len()))
        })?;
        Self::new(&key)
    }

    /// Generate a random base64 key suitable for `from_base64`.
    pub fn generate_key() -> Result<SecretString, CryptoError> {
        let mut key = [0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CryptoError::InvalidKey("failed to generate random key".into()))?;
        Ok(SecretString::from(STANDARD.encode(key)))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Seal("failed to generate random nonce".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Seal("AES-256-GCM encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed("ciphertext too short".into()));
        }
        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Malformed("bad nonce".into()))?;

        let mut in_out = body.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                CryptoError::Open("wrong key or corrupted data".into())
            })?;
        Ok(plaintext.to_vec())
    }
}

#[async_trait]
impl Cipher for AesGcmCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let sealed = self.seal(plaintext.as_bytes())?;
        Ok(STANDARD.encode(sealed))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let sealed = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::Malformed(format!("not base64: {e}")))?;
        let plaintext = self.open(&sealed)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Open(format!("not UTF-8: {e}")))
    }
}
