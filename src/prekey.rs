//! Prekeys: the single-use (or last-resort) keys a responder publishes so
//! an initiator can start a session without either party being online at
//! the same time.

use async_trait::async_trait;

use crate::keys::{IdentityKey, KeyPair, PublicKey};

/// A prekey identifier. `MAX_PREKEY_ID` is reserved for the last-resort
/// prekey, which a store may hand out more than once.
pub type PreKeyId = u32;

/// Sentinel identifying the last-resort prekey, which is exempt from the
/// single-use invariant other prekeys are held to.
pub const MAX_PREKEY_ID: PreKeyId = u16::MAX as PreKeyId;

/// One of a responder's published prekeys, plus the secret half kept
/// locally in the store.
#[derive(Clone)]
pub struct PreKey {
    pub prekey_id: PreKeyId,
    pub key_pair: KeyPair,
}

impl PreKey {
    /// Wrap a freshly generated keypair under `prekey_id`.
    pub fn generate(prekey_id: PreKeyId) -> Self {
        Self {
            prekey_id,
            key_pair: KeyPair::generate(),
        }
    }

    /// The published half of this prekey.
    pub fn bundle(&self, identity_key: IdentityKey) -> PreKeyBundle {
        PreKeyBundle {
            prekey_id: self.prekey_id,
            prekey_public: self.key_pair.public_key(),
            identity_key,
        }
    }

    /// Wipe this prekey's secret material in place. Called on a prekey
    /// freshly loaded from the store purely to be consumed (i.e. not the
    /// copy already folded into a live `SessionState`), ahead of deleting
    /// its record from the store.
    pub fn zeroize_secret(&mut self) {
        self.key_pair.zeroize_secret();
    }
}

/// What an initiator fetches out-of-band to start a handshake: one
/// published prekey plus the responder's identity.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub prekey_id: PreKeyId,
    pub prekey_public: PublicKey,
    pub identity_key: IdentityKey,
}

/// The local collaborator that holds a responder's unconsumed prekeys.
///
/// Modeled as async because a production store is typically backed by a
/// database or platform keychain; this crate only defines the contract,
/// not an implementation suited for production use.
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    /// Look up a prekey by id. Returns `Ok(None)` if it was already
    /// consumed or never existed, distinct from a store-level I/O failure.
    async fn load_prekey(&self, id: PreKeyId) -> anyhow::Result<Option<PreKey>>;

    /// Remove a prekey after it has been consumed by a handshake, unless
    /// `id == MAX_PREKEY_ID`, which a store may retain indefinitely.
    async fn delete_prekey(&self, id: PreKeyId) -> anyhow::Result<()>;

    /// A diagnostic name surfaced in `SessionError::PrekeyNotFoundInStore`.
    fn name(&self) -> &str {
        "prekey-store"
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::InMemoryPreKeyStore;
    use super::*;
    use crate::keys::IdentityKeyPair;

    #[tokio::test]
    async fn store_roundtrips_and_deletes() {
        let store = InMemoryPreKeyStore::new("bob");
        let prekey = PreKey::generate(1);
        store.insert(prekey.clone()).await;

        assert!(store.load_prekey(1).await.unwrap().is_some());
        store.delete_prekey(1).await.unwrap();
        assert!(store.load_prekey(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_resort_prekey_survives_delete() {
        let store = InMemoryPreKeyStore::new("bob");
        store.insert(PreKey::generate(MAX_PREKEY_ID)).await;
        store.delete_prekey(MAX_PREKEY_ID).await.unwrap();
        assert!(store.load_prekey(MAX_PREKEY_ID).await.unwrap().is_some());
    }

    #[test]
    fn bundle_carries_prekey_id_and_identity() {
        let identity = IdentityKeyPair::generate();
        let prekey = PreKey::generate(42);
        let bundle = prekey.bundle(identity.public_key());
        assert_eq!(bundle.prekey_id, 42);
    }
}
