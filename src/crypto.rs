//! Per-key encryption of values at rest.
//!
//! The symmetric key is derived from a caller-supplied passphrase with
//! PBKDF2-HMAC-SHA256, salted with the raw bytes of the storage key name, so
//! one passphrase yields a different key for every key name. Values are sealed
//! with AES-256-GCM under a fresh 96-bit IV per write.
//!
//! Ciphertext and IV are stored as standard base64 text: the value slot and
//! the `iv` metadata entry of the underlying store only carry strings.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{Error, Result};

pub const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KDF_ITERATIONS: u32 = 100;

pub type Iv = [u8; IV_LEN];

/// Cipher backend used by [`KeyedStore`](crate::KeyedStore).
pub trait CipherProvider: Send + Sync + 'static {
    fn encrypt(&self, plaintext: &[u8], key_name: &str, iv: &Iv, passphrase: &str) -> Result<Vec<u8>>;

    /// Fails with [`Error::Crypto`] on a wrong passphrase or tampered ciphertext.
    fn decrypt(&self, ciphertext: &[u8], key_name: &str, iv: &Iv, passphrase: &str) -> Result<Vec<u8>>;
}

/// PBKDF2 + AES-256-GCM.
#[derive(Clone, Copy, Debug, Default)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    fn cipher(key_name: &str, passphrase: &str) -> Result<Aes256Gcm> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), key_name.as_bytes(), KDF_ITERATIONS, &mut key);
        Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Crypto("invalid derived key length".into()))
    }
}

impl CipherProvider for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], key_name: &str, iv: &Iv, passphrase: &str) -> Result<Vec<u8>> {
        Self::cipher(key_name, passphrase)?
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))
    }

    fn decrypt(&self, ciphertext: &[u8], key_name: &str, iv: &Iv, passphrase: &str) -> Result<Vec<u8>> {
        Self::cipher(key_name, passphrase)?
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| Error::Crypto(format!("cannot decrypt value of `{key_name}`")))
    }
}

/// A fresh random IV. Never reuse one across writes of the same key.
pub fn generate_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Text form of an encrypted value, ready for the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypts `value` under a fresh IV and encodes both for storage.
pub fn seal(cipher: &dyn CipherProvider, value: &str, key_name: &str, passphrase: &str) -> Result<Sealed> {
    let iv = generate_iv();
    let ciphertext = cipher.encrypt(value.as_bytes(), key_name, &iv, passphrase)?;
    Ok(Sealed { ciphertext: BASE64.encode(ciphertext), iv: BASE64.encode(iv) })
}

/// Reverses [`seal`].
pub fn open(cipher: &dyn CipherProvider, ciphertext: &str, iv: &str, key_name: &str, passphrase: &str) -> Result<String> {
    let iv_raw = BASE64.decode(iv).map_err(|e| Error::Crypto(format!("iv: {e}")))?;
    let iv: Iv = iv_raw
        .try_into()
        .map_err(|_| Error::Crypto(format!("iv must be {IV_LEN} bytes")))?;
    let ciphertext = BASE64.decode(ciphertext).map_err(|e| Error::Crypto(format!("ciphertext: {e}")))?;
    let plaintext = cipher.decrypt(&ciphertext, key_name, &iv, passphrase)?;
    String::from_utf8(plaintext).map_err(|_| Error::Crypto("plaintext is not utf-8".into()))
}
