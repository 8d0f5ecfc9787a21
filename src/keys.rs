//! Key types used by the session state machine.
//!
//! Two distinct key types exist: an `IdentityKeyPair`, the long-term
//! Ed25519 signing identity that also carries an X25519 DH key derived
//! from the same seed (the libsodium `crypto_sign_ed25519_sk_to_curve25519`
//! trick), and a `KeyPair`, a plain ephemeral X25519 keypair minted per
//! ratchet step and per prekey.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Size of an X25519/Ed25519 public key encoding.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An ephemeral X25519 keypair, minted for a ratchet step or a prekey.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    secret: X25519StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw secret bytes (e.g. after deserialisation).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = X25519StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.public.as_bytes())
    }

    /// Raw secret bytes, for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 Diffie-Hellman against a remote public key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        let their_key = X25519PublicKey::from(their_public.0);
        *self.secret.diffie_hellman(&their_key).as_bytes()
    }

    /// Wipe the secret half in place, ahead of (and independent of) drop.
    /// Used by prekey-consumption paths that must zeroize a loaded
    /// prekey's secret material before its record is deleted from the
    /// store, even if that delete itself fails.
    pub fn zeroize_secret(&mut self) {
        self.secret.zeroize();
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret.to_bytes())
    }
}

/// A serialisable X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex::serde")] pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// The long-term identity keypair: Ed25519 for signing, plus an X25519 DH
/// key derived from the same seed via SHA-512 expansion and clamping.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    signing_key: SigningKey,
    dh_secret: X25519StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a new random identity keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let dh_secret = Self::derive_dh_secret(&signing_key);
        Self {
            signing_key,
            dh_secret,
        }
    }

    /// Reconstruct from the Ed25519 seed.
    pub fn from_seed_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let dh_secret = Self::derive_dh_secret(&signing_key);
        Self {
            signing_key,
            dh_secret,
        }
    }

    fn derive_dh_secret(signing_key: &SigningKey) -> X25519StaticSecret {
        let mut hasher = Sha512::new();
        hasher.update(signing_key.to_bytes());
        let hash = hasher.finalize();

        let mut x25519_bytes = [0u8; 32];
        x25519_bytes.copy_from_slice(&hash[..32]);
        x25519_bytes[0] &= 248;
        x25519_bytes[31] &= 127;
        x25519_bytes[31] |= 64;

        X25519StaticSecret::from(x25519_bytes)
    }

    /// The public identity (Ed25519 verifying key + derived X25519 key).
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey {
            signing_key: self.signing_key.verifying_key(),
            dh_key: X25519PublicKey::from(&self.dh_secret),
        }
    }

    /// Sign a message with the Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// X25519 Diffie-Hellman against a remote identity's DH key.
    pub fn diffie_hellman(&self, their_dh_key: &X25519PublicKey) -> [u8; 32] {
        *self.dh_secret.diffie_hellman(their_dh_key).as_bytes()
    }

    /// Raw Ed25519 seed bytes, for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for IdentityKeyPair {
    fn clone(&self) -> Self {
        Self::from_seed_bytes(&self.signing_key.to_bytes())
    }
}

/// The public half of an identity: an Ed25519 verifying key plus the
/// X25519 key derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityKey {
    pub signing_key: VerifyingKey,
    pub dh_key: X25519PublicKey,
}

impl IdentityKey {
    /// Reconstruct from a bare Ed25519 public key, deriving the X25519 key.
    pub fn from_signing_key_bytes(bytes: &[u8; 32]) -> CryptoResult<Self> {
        let signing_key = VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidMessage("invalid Ed25519 public key".to_string()))?;
        let dh_key = Self::ed25519_to_x25519(&signing_key)?;
        Ok(Self { signing_key, dh_key })
    }

    fn ed25519_to_x25519(ed_pk: &VerifyingKey) -> CryptoResult<X25519PublicKey> {
        let compressed = CompressedEdwardsY::from_slice(ed_pk.as_bytes()).map_err(|_| {
            CryptoError::InvalidMessage("malformed Ed25519 point encoding".to_string())
        })?;
        let edwards = compressed.decompress().ok_or_else(|| {
            CryptoError::InvalidMessage("Ed25519 point does not decompress".to_string())
        })?;
        let montgomery: MontgomeryPoint = edwards.to_montgomery();
        Ok(X25519PublicKey::from(montgomery.to_bytes()))
    }

    /// Verify an Ed25519 signature under this identity's signing key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> CryptoResult<()> {
        let sig = Signature::from_bytes(signature);
        self.signing_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Ed25519 public key bytes.
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Derived X25519 public key bytes.
    pub fn dh_key_bytes(&self) -> [u8; 32] {
        *self.dh_key.as_bytes()
    }

    /// SHA-256 fingerprint of the signing key, for logging and the
    /// local-identity-changed check on deserialisation.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Fingerprint rendered as lowercase hex, for log fields.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }
}

/// Encode a public key as a CBOR byte string, for embedding under a tag.
pub fn public_key_value(key: &PublicKey) -> ciborium::value::Value {
    ciborium::value::Value::Bytes(key.0.to_vec())
}

/// Encode an identity key as its Ed25519 signing-key bytes; the X25519
/// half is re-derived on load.
pub fn identity_key_value(key: &IdentityKey) -> ciborium::value::Value {
    ciborium::value::Value::Bytes(key.signing_key_bytes().to_vec())
}

/// Decode a public-key-valued tag.
pub fn public_key_tag(
    value: &ciborium::value::Value,
    tag: u64,
    field: &str,
) -> Result<PublicKey, crate::error::DecodeError> {
    Ok(PublicKey(crate::codec::bytes_tag(value, tag, field)?))
}

/// Decode an identity-key-valued tag (stored as its Ed25519 signing key
/// bytes; the X25519 half is re-derived on load).
pub fn identity_key_tag(
    value: &ciborium::value::Value,
    tag: u64,
    field: &str,
) -> Result<IdentityKey, crate::error::DecodeError> {
    let bytes: [u8; 32] = crate::codec::bytes_tag(value, tag, field)?;
    IdentityKey::from_signing_key_bytes(&bytes)
        .map_err(|e| crate::error::DecodeError::Malformed(e.to_string()))
}
