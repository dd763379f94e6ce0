//! Passphrase-based sealing of the entry collection.
//!
//! - PBKDF2-HMAC-SHA256 derives a 256-bit key from the passphrase
//! - AES-256-GCM provides authenticated encryption
//! - Random salt and IV per encryption
//!
//! Decryption is best-effort: a wrong passphrase, a damaged bundle or an
//! unsupported mode all come back as [`Unsealed::Locked`], never as an error.

use crate::{CipherBundle, CipherMode, Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Shortest passphrase ever used for key derivation
pub const MIN_PASSPHRASE_LEN: usize = 4;
/// Default KDF iteration count
pub const KDF_ITERATIONS: u32 = 120_000;
/// Iteration count when the strong KDF setting is on
pub const KDF_ITERATIONS_STRONG: u32 = 310_000;
pub const IV_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const BUNDLE_VERSION: u32 = 1;

/// Whether a passphrase is long enough to attempt encryption or decryption
///
/// Length is measured in UTF-16 code units, so a character outside the
/// basic plane counts twice. Diaries sealed by the web app rely on this.
pub fn passphrase_is_usable(passphrase: &str) -> bool {
    passphrase.encode_utf16().count() >= MIN_PASSPHRASE_LEN
}

/// Outcome of opening a bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unsealed {
    Bytes(Vec<u8>),
    /// The data exists but cannot be read with this passphrase
    Locked,
}

/// Key derivation plus authenticated encryption
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoCodec {
    available: bool,
}

impl Default for CryptoCodec {
    fn default() -> Self {
        Self::system()
    }
}

impl CryptoCodec {
    /// Codec backed by the platform's primitives
    pub fn system() -> Self {
        Self { available: true }
    }

    /// Codec for a host without crypto primitives; sealing degrades to plain
    pub fn unavailable() -> Self {
        Self { available: false }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Derive a 256-bit key from a passphrase and salt
    pub fn derive_key(
        &self,
        passphrase: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Zeroizing<[u8; 32]>> {
        if !self.available {
            return Err(Error::CryptoUnavailable(
                "no key derivation primitive on this host".into(),
            ));
        }
        if iterations == 0 {
            return Err(Error::Crypto("KDF iteration count must be positive".into()));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut *key);
        Ok(key)
    }

    /// Seal `plain` under the passphrase
    ///
    /// Without a passphrase, or without crypto primitives, the bytes are
    /// carried verbatim in a `plain` bundle.
    pub fn encrypt(
        &self,
        plain: &[u8],
        passphrase: Option<&str>,
        iterations: u32,
    ) -> Result<CipherBundle> {
        let passphrase = match passphrase {
            Some(p) if !p.is_empty() && self.available => p,
            _ => return plain_bundle(plain),
        };

        let mut iv = [0u8; IV_LEN];
        let mut salt = [0u8; SALT_LEN];
        if let Err(e) = OsRng
            .try_fill_bytes(&mut iv)
            .and_then(|_| OsRng.try_fill_bytes(&mut salt))
        {
            tracing::warn!("No secure random source ({}), storing bundle unencrypted", e);
            return plain_bundle(plain);
        }

        let key = self.derive_key(passphrase, &salt, iterations)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plain)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(CipherBundle {
            mode: CipherMode::Gcm,
            iv: Some(iv.to_vec()),
            salt: Some(salt.to_vec()),
            iter: Some(iterations),
            version: BUNDLE_VERSION,
            data: B64.encode(sealed),
        })
    }

    /// Open a bundle; every failure is reported as `Locked`
    pub fn decrypt(&self, bundle: &CipherBundle, passphrase: &str) -> Unsealed {
        match bundle.mode {
            CipherMode::Plain => Unsealed::Bytes(bundle.data.clone().into_bytes()),
            CipherMode::Gcm => match self.open_gcm(bundle, passphrase) {
                Some(bytes) => Unsealed::Bytes(bytes),
                None => Unsealed::Locked,
            },
        }
    }

    fn open_gcm(&self, bundle: &CipherBundle, passphrase: &str) -> Option<Vec<u8>> {
        let iv = bundle.iv.as_deref().filter(|iv| iv.len() == IV_LEN)?;
        let salt = bundle.salt.as_deref().filter(|s| s.len() == SALT_LEN)?;
        let iterations = bundle.iter.unwrap_or(KDF_ITERATIONS);
        let sealed = B64.decode(bundle.data.as_bytes()).ok()?;

        let key = match self.derive_key(passphrase, salt, iterations) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!("Cannot derive key for bundle: {}", e);
                return None;
            }
        };
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).ok()?;
        cipher.decrypt(Nonce::from_slice(iv), sealed.as_slice()).ok()
    }
}

fn plain_bundle(plain: &[u8]) -> Result<CipherBundle> {
    let data = String::from_utf8(plain.to_vec())
        .map_err(|_| Error::Crypto("plain bundles must carry UTF-8 JSON".into()))?;
    Ok(CipherBundle::plain(data))
}
