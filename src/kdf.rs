//! Key derivation for the ratchet: HKDF-SHA512 for root/chain keys, and an
//! HMAC-SHA256 symmetric ratchet for per-message key derivation.
//!
//! Domain separation strings keep the two derivations from ever reusing
//! the same HKDF `info` parameter for different purposes.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

/// HKDF using SHA-512, used for root/chain key derivation after a DH step.
pub type HkdfSha512 = Hkdf<Sha512>;

/// HMAC-SHA256, used for the symmetric chain ratchet.
pub type HmacSha256 = Hmac<Sha256>;

/// Domain separation strings for the two HKDF derivations this crate performs.
pub mod domain {
    /// Root key derivation after a DH ratchet step.
    pub const ROOT_KEY: &[u8] = b"construct-session_v1_RootKey";
    /// Chain key derivation after a DH ratchet step.
    pub const CHAIN_KEY: &[u8] = b"construct-session_v1_ChainKey";
}

/// A derived key with automatic zeroization.
#[derive(Clone, Zeroize)]
pub struct DerivedKey<const N: usize>(pub [u8; N]);

impl<const N: usize> DerivedKey<N> {
    /// Convert to raw bytes, consuming the wrapper.
    pub fn into_bytes(self) -> [u8; N] {
        self.0
    }
}

/// One-shot HKDF-Extract-then-Expand context over a salt and input key
/// material (typically a previous root key and a fresh DH output).
pub struct KeyDerivationContext {
    hkdf: HkdfSha512,
}

impl KeyDerivationContext {
    /// Create a new KDF context. `salt` is the previous root key (or
    /// `None` on the very first derivation of a session).
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            hkdf: HkdfSha512::new(salt, ikm),
        }
    }

    /// Derive an `N`-byte key under the given `info` label.
    pub fn derive<const N: usize>(&self, info: &[u8]) -> CryptoResult<DerivedKey<N>> {
        let mut output = [0u8; N];
        self.hkdf
            .expand(info, &mut output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;
        Ok(DerivedKey(output))
    }
}

/// HMAC-based chain key ratcheting: each step derives a message key and
/// advances the chain key, so a compromised message key never reveals the
/// ones that follow it.
pub struct ChainRatchet {
    chain_key: [u8; 32],
}

impl ChainRatchet {
    /// Start a ratchet from an initial chain key (the output of a DH step).
    pub fn new(chain_key: [u8; 32]) -> Self {
        Self { chain_key }
    }

    /// Advance the chain by one step.
    ///
    /// Returns `(new_chain_key, message_key)`.
    pub fn ratchet(&mut self) -> ([u8; 32], [u8; 32]) {
        let message_key = self.hmac_derive(&[0x01]);
        let new_chain_key = self.hmac_derive(&[0x02]);
        self.chain_key = new_chain_key;
        (new_chain_key, message_key)
    }

    fn hmac_derive(&self, input: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.chain_key)
            .expect("HMAC accepts a key of any size");
        mac.update(input);
        let mut output = [0u8; 32];
        output.copy_from_slice(&mac.finalize().into_bytes());
        output
    }
}

impl Drop for ChainRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// Derive a new root key and a new chain key from the previous root key
/// and a fresh DH output, following a DH ratchet step.
pub fn derive_root_and_chain_keys(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> CryptoResult<([u8; 32], [u8; 32])> {
    let kdf = KeyDerivationContext::new(Some(root_key), dh_output);
    let new_root_key: DerivedKey<32> = kdf.derive(domain::ROOT_KEY)?;
    let chain_key: DerivedKey<32> = kdf.derive(domain::CHAIN_KEY)?;
    Ok((new_root_key.into_bytes(), chain_key.into_bytes()))
}

/// Derive a message key from a chain key, advancing the chain.
///
/// Returns `(new_chain_key, message_key)`.
pub fn derive_message_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut ratchet = ChainRatchet::new(*chain_key);
    ratchet.ratchet()
}
