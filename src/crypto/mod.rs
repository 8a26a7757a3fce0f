//! Credential decryption.
//!
//! A request carries a sealed session token holding the caller's SMTP key.
//! Each stored SMTP account keeps its password encrypted under that key with
//! AES-GCM and a per-account nonce (the stored IV).
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256, 10 000 iterations, 32-byte key
//! - **Password cipher**: AES-128-GCM or AES-256-GCM, 96-bit nonce
//! - **Session token**: base64url(nonce || AES-256-GCM(JSON payload))

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::CryptoError;

/// PBKDF2 iteration count for SMTP keys.
pub const PBKDF2_ITERATIONS: u32 = 10_000;
/// Minimum salt length accepted by [`derive_smtp_key`].
pub const MIN_SALT_LEN: usize = 8;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// Derived key length.
pub const KEY_LEN: usize = 32;

/// Key material recovered from a session token.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key protecting the stored SMTP passwords.
    pub smtp_key: Vec<u8>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("smtp_key", &format_args!("[REDACTED; {} bytes]", self.smtp_key.len()))
            .finish()
    }
}

/// Opens a request's session token.
pub trait TokenDecryptor: Send + Sync {
    /// Decrypts `token` into session key material.
    fn decrypt(&self, token: &SecretString) -> Result<SessionKeys, CryptoError>;
}

/// Decrypts a stored SMTP password.
pub trait PasswordDecryptor: Send + Sync {
    /// Decrypts `cipher` with `key` and nonce `iv`.
    fn decrypt(&self, cipher: &[u8], key: &[u8], iv: &[u8]) -> Result<SecretString, CryptoError>;
}

/// Derives the SMTP key from a user password.
pub fn derive_smtp_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "salt must be at least {} bytes",
            MIN_SALT_LEN
        )));
    }
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    Ok(key)
}

/// Generates a random AES-GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn check_nonce(iv: &[u8]) -> Result<&Nonce<aes_gcm::aead::consts::U12>, CryptoError> {
    if iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidIv {
            expected: NONCE_LEN,
            actual: iv.len(),
        });
    }
    Ok(Nonce::from_slice(iv))
}

fn seal(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = check_nonce(iv)?;
    let result = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce, plaintext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce, plaintext),
        n => return Err(CryptoError::InvalidKey(format!("unsupported key length {}", n))),
    };
    result.map_err(|_| CryptoError::Encryption)
}

fn open(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = check_nonce(iv)?;
    let result = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce, ciphertext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce, ciphertext),
        n => return Err(CryptoError::InvalidKey(format!("unsupported key length {}", n))),
    };
    result.map_err(|_| CryptoError::Decryption)
}

/// AES-GCM cipher for stored SMTP passwords.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmPasswordCipher;

impl AesGcmPasswordCipher {
    /// Creates the cipher.
    pub fn new() -> Self {
        Self
    }

    /// Encrypts `password` under `key`, returning `(ciphertext, iv)`.
    pub fn encrypt(&self, password: &str, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let iv = generate_nonce();
        let ciphertext = seal(key, &iv, password.as_bytes())?;
        Ok((ciphertext, iv.to_vec()))
    }
}

impl PasswordDecryptor for AesGcmPasswordCipher {
    fn decrypt(&self, cipher: &[u8], key: &[u8], iv: &[u8]) -> Result<SecretString, CryptoError> {
        let plaintext = open(key, iv, cipher)?;
        String::from_utf8(plaintext)
            .map(SecretString::new)
            .map_err(|_| CryptoError::Encoding)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    smtp_key: String,
}

/// Seals and opens session tokens under a server-side 256-bit secret.
pub struct SealedTokenCipher {
    secret: [u8; KEY_LEN],
}

impl fmt::Debug for SealedTokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedTokenCipher([REDACTED])")
    }
}

impl SealedTokenCipher {
    /// Creates a cipher from a 32-byte secret.
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; KEY_LEN] = secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("token secret must be {} bytes", KEY_LEN)))?;
        Ok(Self { secret })
    }

    /// Seals `keys` into a token.
    pub fn seal(&self, keys: &SessionKeys) -> Result<SecretString, CryptoError> {
        let payload = serde_json::to_vec(&TokenPayload {
            smtp_key: BASE64.encode(&keys.smtp_key),
        })
        .map_err(|_| CryptoError::Encryption)?;

        let nonce = generate_nonce();
        let mut sealed = nonce.to_vec();
        sealed.extend(seal(&self.secret, &nonce, &payload)?);
        Ok(SecretString::new(URL_SAFE_NO_PAD.encode(sealed)))
    }
}

impl TokenDecryptor for SealedTokenCipher {
    fn decrypt(&self, token: &SecretString) -> Result<SessionKeys, CryptoError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.expose_secret().trim())
            .map_err(|e| CryptoError::InvalidToken(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidToken("token is truncated".into()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let payload = open(&self.secret, nonce, ciphertext)?;
        let payload: TokenPayload =
            serde_json::from_slice(&payload).map_err(|e| CryptoError::InvalidToken(e.to_string()))?;

        let smtp_key = BASE64
            .decode(payload.smtp_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(SessionKeys { smtp_key })
    }
}
