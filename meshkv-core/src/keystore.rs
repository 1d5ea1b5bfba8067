//! Sealing of store secret keys at rest.
//!
//! Secret keys are never persisted in the clear: the metadata store and
//! the redundant key file both hold the key sealed under a device-bound
//! root key. The platform keystore is reached through [`DeviceKeystore`];
//! [`SoftwareKeystore`] is a pure-software implementation for platforms
//! without hardware backing and for tests.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{StoreError, StoreResult};
use crate::types::SECRET_KEY_LENGTH;

/// Associated data bound to every sealed store secret key.
pub const SECRET_KEY_AD: &[u8] = b"meshkv:store-secret-key";

const NONCE_LENGTH: usize = 24;

/// Device keystore interface used to seal and open store secret keys.
///
/// The associated data is not encrypted but is integrity-protected; any
/// mismatch when opening must fail.
pub trait DeviceKeystore: Send + Sync {
    /// Seals plaintext under the device-bound root key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when the keystore refuses the
    /// operation.
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> StoreResult<Vec<u8>>;

    /// Opens ciphertext sealed by [`DeviceKeystore::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when authentication fails.
    fn open_sealed(&self, associated_data: &[u8], ciphertext: &[u8]) -> StoreResult<Vec<u8>>;
}

/// Software keystore built on XChaCha20-Poly1305.
pub struct SoftwareKeystore {
    root_key: Zeroizing<[u8; 32]>,
}

impl SoftwareKeystore {
    /// Builds a keystore around an existing root key.
    #[must_use]
    pub fn new(root_key: [u8; 32]) -> Self {
        Self {
            root_key: Zeroizing::new(root_key),
        }
    }

    /// Builds a keystore with a freshly generated root key.
    ///
    /// The key lives only for this process; use [`SoftwareKeystore::new`]
    /// with a persisted root key for data that must survive restarts.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut root_key = [0u8; 32];
        OsRng.fill_bytes(&mut root_key);
        Self::new(root_key)
    }
}

impl DeviceKeystore for SoftwareKeystore {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.root_key.as_ref()));
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| StoreError::CryptError)?;
        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open_sealed(&self, associated_data: &[u8], ciphertext: &[u8]) -> StoreResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LENGTH {
            return Err(StoreError::CryptError);
        }
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_LENGTH);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.root_key.as_ref()));
        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: payload,
                    aad: associated_data,
                },
            )
            .map_err(|_| StoreError::CryptError)
    }
}

/// Generates a fresh random store secret key.
#[must_use]
pub fn random_secret_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; SECRET_KEY_LENGTH]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let keystore = SoftwareKeystore::ephemeral();
        let sealed = keystore.seal(SECRET_KEY_AD, b"key material").expect("seal");
        let opened = keystore.open_sealed(SECRET_KEY_AD, &sealed).expect("open");
        assert_eq!(opened, b"key material");
    }

    #[test]
    fn test_open_with_wrong_aad_fails() {
        let keystore = SoftwareKeystore::ephemeral();
        let sealed = keystore.seal(SECRET_KEY_AD, b"key material").expect("seal");
        assert_eq!(
            keystore.open_sealed(b"meshkv:other", &sealed),
            Err(StoreError::CryptError)
        );
    }

    #[test]
    fn test_open_with_other_root_key_fails() {
        let sealed = SoftwareKeystore::ephemeral()
            .seal(SECRET_KEY_AD, b"key material")
            .expect("seal");
        assert_eq!(
            SoftwareKeystore::ephemeral().open_sealed(SECRET_KEY_AD, &sealed),
            Err(StoreError::CryptError)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keystore = SoftwareKeystore::ephemeral();
        let mut sealed = keystore.seal(SECRET_KEY_AD, b"key material").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            keystore.open_sealed(SECRET_KEY_AD, &sealed),
            Err(StoreError::CryptError)
        );
    }
}
