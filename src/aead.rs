//! Authenticated encryption for ratchet message payloads.
//!
//! Every ratchet message key is used for exactly one XChaCha20-Poly1305
//! seal/open; the 24-byte nonce is generated fresh per message rather than
//! derived, since message keys are themselves single-use.

use chacha20poly1305::aead::{Aead as AeadTrait, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::KeyInit;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Nonce size for XChaCha20-Poly1305 (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// A single-use AEAD key, derived per message from the chain ratchet.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(pub [u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// A sealed payload: nonce plus ciphertext-with-tag.
#[derive(Clone, Debug)]
pub struct EncryptedPayload {
    /// The randomly generated nonce used to seal this payload.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the 16-byte Poly1305 tag appended.
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `key`, authenticating `aad` (typically the
/// message header) without encrypting it.
pub fn seal(key: &AeadKey, plaintext: &[u8], aad: &[u8]) -> CryptoResult<EncryptedPayload> {
    let cipher = XChaCha20Poly1305::new(key.0.as_ref().into());
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(nonce.as_ref().into(), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::InvalidMessage("AEAD seal failed".to_string()))?;

    Ok(EncryptedPayload { nonce, ciphertext })
}

/// Open a previously sealed payload. Any tampering with `ciphertext`,
/// `nonce`, or `aad` surfaces as [`CryptoError::InvalidMessage`].
pub fn open(key: &AeadKey, payload: &EncryptedPayload, aad: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.0.as_ref().into());
    cipher
        .decrypt(
            payload.nonce.as_ref().into(),
            Payload {
                msg: &payload.ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::InvalidMessage("AEAD authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = AeadKey::from_bytes([0x42; KEY_SIZE]);
        let plaintext = b"hello";
        let aad = b"header";

        let sealed = seal(&key, plaintext, aad).unwrap();
        let opened = open(&key, &sealed, aad).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = AeadKey::from_bytes([0x42; KEY_SIZE]);
        let key2 = AeadKey::from_bytes([0x43; KEY_SIZE]);
        let sealed = seal(&key1, b"secret", b"aad").unwrap();
        assert!(open(&key2, &sealed, b"aad").is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = AeadKey::from_bytes([0x42; KEY_SIZE]);
        let sealed = seal(&key, b"secret", b"aad1").unwrap();
        assert!(open(&key, &sealed, b"aad2").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = AeadKey::from_bytes([0x42; KEY_SIZE]);
        let mut sealed = seal(&key, b"secret", b"aad").unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(open(&key, &sealed, b"aad").is_err());
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = AeadKey::from_bytes([0x42; KEY_SIZE]);
        let sealed = seal(&key, b"", b"aad").unwrap();
        assert_eq!(open(&key, &sealed, b"aad").unwrap(), Vec::<u8>::new());
    }
}
