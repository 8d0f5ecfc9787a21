//! The `Session`: a bounded collection of ratchet branches between two
//! identities, driven by `encrypt`/`decrypt` and able to upgrade itself
//! from a fresh prekey handshake.

use std::collections::HashMap;

use ciborium::value::Value;
use tracing::{debug, warn};

use crate::codec::{self, tagged_map, u32_tag, Decode, Encode};
use crate::error::{CryptoError, DecodeError, Result, SessionError};
use crate::keys::{self, IdentityKey, IdentityKeyPair, PublicKey};
use crate::message::{CipherMessage, Envelope, PreKeyMessage, SessionTag};
use crate::prekey::{PreKeyBundle, PreKeyId, PreKeyStore, MAX_PREKEY_ID};
use crate::session_state::SessionState;

/// Upper bound on distinct ratchet branches (session states) a `Session`
/// retains before evicting the oldest non-current one.
pub const MAX_SESSION_STATES: usize = 100;

/// Tunable knobs for a `Session`. Production callers use
/// [`SessionConfig::default`]; tests may shrink `max_session_states` to
/// exercise eviction without driving a hundred handshakes.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub max_session_states: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_states: MAX_SESSION_STATES,
        }
    }
}

/// An unconfirmed Alice-initiated handshake: cleared the first time a
/// reply from Bob is decrypted, proving the prekey message arrived.
#[derive(Clone, Copy, Debug)]
pub struct PendingPreKey {
    pub prekey_id: PreKeyId,
    pub base_public_key: PublicKey,
}

struct SessionStateEntry {
    idx: u64,
    state: SessionState,
}

/// An end-to-end secure messaging session between a local identity and a
/// single remote identity.
pub struct Session {
    local_identity: IdentityKeyPair,
    remote_identity: IdentityKey,
    session_tag: SessionTag,
    pending_prekey: Option<PendingPreKey>,
    session_states: HashMap<String, SessionStateEntry>,
    next_idx: u64,
    config: SessionConfig,
}

impl Session {
    /// Start a session as the initiator, given the responder's published
    /// prekey bundle. Synchronous: establishing the first branch is pure
    /// in-memory computation, with no store to consult.
    pub fn init_from_prekey(
        local_identity: IdentityKeyPair,
        bundle: &PreKeyBundle,
        config: SessionConfig,
    ) -> Result<Self> {
        let base_key_pair = crate::keys::KeyPair::generate();
        let base_public = base_key_pair.public_key();

        let shared_secret = Self::agree_alice(&local_identity, &base_key_pair, bundle)?;
        let state = SessionState::init_as_alice(&shared_secret, &bundle.prekey_public)?;

        let session_tag = SessionTag::new_random();

        let mut session = Self {
            local_identity,
            remote_identity: bundle.identity_key,
            // Transiently wrong until the first insertion below promotes
            // it; `session_tag` only needs to name a key in
            // `session_states` once at least one state exists (see the
            // invariant in the crate's design notes).
            session_tag,
            pending_prekey: Some(PendingPreKey {
                prekey_id: bundle.prekey_id,
                base_public_key: base_public,
            }),
            session_states: HashMap::new(),
            next_idx: 0,
            config,
        };
        session.insert_session_state(session_tag, state);
        debug!(tag = %session_tag.string_form(), "initiated session from prekey bundle");
        Ok(session)
    }

    fn agree_alice(
        local_identity: &IdentityKeyPair,
        base_key_pair: &crate::keys::KeyPair,
        bundle: &PreKeyBundle,
    ) -> Result<[u8; 32]> {
        let dh1 = local_identity.diffie_hellman(&bundle.identity_key.dh_key);
        let dh2 = base_key_pair.diffie_hellman(&bundle.prekey_public);
        Ok(Self::combine(&dh1, &dh2))
    }

    /// Mirrors [`Self::agree_alice`] with the two DH computations' roles
    /// reversed: Bob's prekey stands in for Alice's base key, and Bob's
    /// identity for Alice's. Since X25519 DH is commutative
    /// (`a_priv * B_pub == b_priv * A_pub`), both sides land on the same
    /// shared secret.
    fn agree_bob(
        local_identity: &IdentityKeyPair,
        prekey_key_pair: &crate::keys::KeyPair,
        their_identity: &IdentityKey,
        their_base_key: &PublicKey,
    ) -> Result<[u8; 32]> {
        let dh1 = local_identity.diffie_hellman(&their_identity.dh_key);
        let dh2 = prekey_key_pair.diffie_hellman(their_base_key);
        Ok(Self::combine(&dh1, &dh2))
    }

    fn combine(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(a);
        hasher.update(b);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Establish a session as the responder from an incoming prekey
    /// message, consuming the referenced prekey from `store`. Async
    /// because consuming the prekey is an I/O-bound store operation.
    pub async fn init_from_message(
        local_identity: IdentityKeyPair,
        store: &dyn PreKeyStore,
        envelope: &Envelope,
        config: SessionConfig,
    ) -> Result<(Self, Vec<u8>)> {
        let prekey_message = match envelope {
            Envelope::Cipher(_) => return Err(SessionError::InitGivenCipherMessage),
            Envelope::Prekey(m) => m,
        };

        let mut state = Self::new_state(&local_identity, store, prekey_message).await?;
        let tag = prekey_message.message.session_tag;

        let plaintext = state.decrypt(
            prekey_message.message.counter,
            prekey_message.message.previous_counter,
            &prekey_message.message.ratchet_key,
            &prekey_message.message.cipher_text,
            &tag.0,
        )?;

        // Prekey consumption: `new_state` above already zeroized the loaded
        // prekey's secret once the DH agreement was done, so all that's
        // left is the delete. A one-time prekey's delete failure is
        // wrapped as `PrekeyNotFound`/CASE_203; the last-resort prekey
        // (`MAX_PREKEY_ID`) is never deleted.
        if prekey_message.prekey_id != MAX_PREKEY_ID {
            store
                .delete_prekey(prekey_message.prekey_id)
                .await
                .map_err(SessionError::PrekeyNotFound)?;
        }

        let mut session = Self {
            local_identity,
            remote_identity: prekey_message.identity_key,
            session_tag: tag,
            pending_prekey: None,
            session_states: HashMap::new(),
            next_idx: 0,
            config,
        };
        session.insert_session_state(tag, state);

        debug!(tag = %tag.string_form(), "established session from prekey message");
        Ok((session, plaintext))
    }

    /// Load the prekey the message references and build the responder's
    /// ratchet state from it. `CASE_101` if the store has no such prekey.
    async fn new_state(
        local_identity: &IdentityKeyPair,
        store: &dyn PreKeyStore,
        prekey_message: &PreKeyMessage,
    ) -> Result<SessionState> {
        let mut prekey = store
            .load_prekey(prekey_message.prekey_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::PrekeyNotFoundInStore {
                store: store.name().to_string(),
            })?;

        let shared_secret = Self::agree_bob(
            local_identity,
            &prekey.key_pair,
            &prekey_message.identity_key,
            &prekey_message.base_key,
        )?;
        let state = SessionState::init_as_bob(&shared_secret, prekey.key_pair.clone());

        // The clone above lives on in `state`; this loaded copy is spent
        // once the DH agreement is done, so its secret is wiped here
        // rather than left to whenever the caller's `store.delete_prekey`
        // happens to run (or fails to).
        prekey.zeroize_secret();
        Ok(state)
    }

    /// Encrypt `plaintext` under the current branch's ratchet.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        let tag = self.session_tag;
        let entry = self
            .session_states
            .get_mut(&tag.string_form())
            .ok_or(SessionError::NoCurrentState)?;

        let (counter, previous_counter, ratchet_key, cipher_text) =
            entry.state.encrypt(plaintext, &tag.0)?;

        let cipher_message = CipherMessage {
            session_tag: tag,
            counter,
            previous_counter,
            ratchet_key,
            cipher_text,
        };

        if let Some(pending) = self.pending_prekey {
            let prekey_message = PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: pending.base_public_key,
                identity_key: self.local_identity.public_key(),
                message: cipher_message,
            };
            return Ok(Envelope::Prekey(prekey_message));
        }

        Ok(Envelope::Cipher(cipher_message))
    }

    /// Decrypt an incoming envelope. Async because a fresh-handshake
    /// recovery on the prekey path touches the store.
    pub async fn decrypt(&mut self, store: &dyn PreKeyStore, envelope: &Envelope) -> Result<Vec<u8>> {
        match envelope {
            Envelope::Cipher(m) => self.decrypt_cipher_message(m),
            Envelope::Prekey(m) => self.decrypt_prekey_message(store, m).await,
        }
    }

    /// §4.6.1: decrypt a message on an already-established branch. Deep
    /// clones the branch's state via a serialise/deserialise round-trip
    /// before attempting decrypt, so a failed attempt can never leave
    /// partially-advanced ratchet state behind (the clone is discarded;
    /// the live entry is untouched).
    fn decrypt_cipher_message(&mut self, message: &CipherMessage) -> Result<Vec<u8>> {
        let key = message.session_tag.string_form();
        let Some(entry) = self.session_states.get(&key) else {
            return Err(SessionError::NoStateForTag);
        };

        let bytes = codec::encode_to_bytes(&entry.state);
        let mut trial: SessionState = codec::decode_from_bytes(&bytes)?;

        let plaintext = trial.decrypt(
            message.counter,
            message.previous_counter,
            &message.ratchet_key,
            &message.cipher_text,
            &message.session_tag.0,
        )?;

        // Insertion (not a direct field write) so that decrypting a
        // message on a non-current branch still promotes it, matching
        // every other insertion path.
        self.insert_session_state(message.session_tag, trial);
        if self.pending_prekey.is_some() {
            self.pending_prekey = None;
            debug!(tag = %key, "cleared pending prekey on first confirmed reply");
        }
        Ok(plaintext)
    }

    /// §4.6.2: decrypt a prekey message. Tries the existing branch first
    /// (§4.6.1, including its "no state for this tag" case); only on a
    /// signature or invalid-message failure does it fall back to
    /// establishing a fresh ratchet from the embedded handshake fields.
    async fn decrypt_prekey_message(
        &mut self,
        store: &dyn PreKeyStore,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>> {
        if message.identity_key != self.remote_identity {
            warn!("prekey message's identity does not match established remote identity");
            return Err(SessionError::RemoteIdentityChanged);
        }

        let key = message.message.session_tag.string_form();
        match self.decrypt_cipher_message(&message.message) {
            Ok(plaintext) => return Ok(plaintext),
            Err(SessionError::NoStateForTag)
            | Err(SessionError::Crypto(CryptoError::InvalidSignature))
            | Err(SessionError::Crypto(CryptoError::InvalidMessage(_))) => {
                warn!(tag = %key, "existing branch rejected prekey message, establishing fresh ratchet");
            }
            Err(e) => return Err(e),
        }

        let mut state = Self::new_state(&self.local_identity, store, message).await?;

        let plaintext = state.decrypt(
            message.message.counter,
            message.message.previous_counter,
            &message.message.ratchet_key,
            &message.message.cipher_text,
            &message.message.session_tag.0,
        )?;

        // As in `init_from_message`, `new_state` above already zeroized
        // the loaded prekey's secret once the DH agreement was done, so
        // only the delete is left here. Unlike `init_from_message`, a
        // delete failure here propagates as the raw store error rather
        // than being wrapped as `PrekeyNotFound` — an asymmetry the
        // protocol note this crate implements flags as a
        // likely-unintentional but compatibility-preserved quirk of the
        // source implementation.
        if message.prekey_id != MAX_PREKEY_ID {
            store
                .delete_prekey(message.prekey_id)
                .await
                .map_err(SessionError::Store)?;
        }

        self.insert_session_state(message.message.session_tag, state);
        self.pending_prekey = None;
        Ok(plaintext)
    }

    /// §4.3: deterministic state-map maintenance. Replaces in place
    /// (without touching `idx`/`next_idx`) if `tag` is already a key;
    /// otherwise inserts fresh, resetting the whole map on the
    /// (practically unreachable) counter overflow safety valve. Always
    /// promotes `session_tag` to `tag` when it differs, then evicts if
    /// the map is at or past capacity.
    fn insert_session_state(&mut self, tag: SessionTag, state: SessionState) {
        let name = tag.string_form();

        if let Some(entry) = self.session_states.get_mut(&name) {
            entry.state = state;
        } else {
            if self.next_idx == u64::MAX {
                warn!("session state counter overflow, resetting state table");
                self.session_states.clear();
                self.next_idx = 0;
            }
            let idx = self.next_idx;
            self.next_idx += 1;
            self.session_states.insert(name.clone(), SessionStateEntry { idx, state });
        }

        if name != self.session_tag.string_form() {
            self.session_tag = tag;
        }

        if self.session_states.len() >= self.config.max_session_states {
            self.evict_oldest_session_state();
        }
    }

    fn evict_oldest_session_state(&mut self) {
        let current = self.session_tag.string_form();
        let victim = self
            .session_states
            .iter()
            .filter(|(tag, _)| tag.as_str() != current.as_str())
            .min_by_key(|(_, entry)| entry.idx)
            .map(|(tag, _)| tag.clone());

        if let Some(tag) = victim {
            warn!(tag = %tag, "evicting oldest session state, state table at capacity");
            self.session_states.remove(&tag);
        }
    }

    /// Serialise this session to its canonical binary form (§6.1: 6
    /// tagged fields; the local identity is carried as its public key
    /// only, for the fingerprint check on deserialisation).
    pub fn serialise(&self) -> Vec<u8> {
        codec::encode_to_bytes(self)
    }

    /// Deserialise a session, checking that its embedded local identity
    /// matches the identity the caller expects to be loading state for.
    /// On success, `expected_local_identity` (not the decoded public
    /// key) becomes the session's local identity.
    pub fn deserialise(bytes: &[u8], expected_local_identity: &IdentityKeyPair) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| SessionError::Decode(DecodeError::Malformed(e.to_string())))?;
        Self::decode_with_local_identity(&value, expected_local_identity)
    }

    fn decode_with_local_identity(value: &Value, expected_local_identity: &IdentityKeyPair) -> Result<Self> {
        let tag_bytes: [u8; 16] = codec::bytes_tag(value, 1, "session_tag")?;
        let session_tag = SessionTag(tag_bytes);

        // Tag 2: the encoded local identity is used only to verify that
        // the caller is loading state for the identity that wrote it; the
        // decoded public key itself is discarded afterwards.
        let encoded_local_identity = keys::identity_key_tag(value, 2, "local_identity")?;
        if encoded_local_identity.fingerprint() != expected_local_identity.public_key().fingerprint() {
            return Err(SessionError::Decode(DecodeError::LocalIdentityChanged));
        }

        let remote_identity = keys::identity_key_tag(value, 3, "remote_identity")
            .map_err(|_| DecodeError::MissingRemoteIdentity)?;

        let pending_prekey = match codec::require_tag(value, 4, "pending_prekey")? {
            Value::Null => None,
            v => Some(PendingPreKey {
                prekey_id: u32_tag(v, 0, "pending_prekey.prekey_id")?,
                base_public_key: keys::public_key_tag(v, 1, "pending_prekey.base_key")?,
            }),
        };

        let state_entries = match codec::require_tag(value, 5, "session_states")? {
            Value::Array(entries) => entries.clone(),
            _ => return Err(DecodeError::InvalidType("session_states".to_string()).into()),
        };

        let mut session_states = HashMap::with_capacity(state_entries.len());
        for (idx, entry) in state_entries.iter().enumerate() {
            let tag_bytes: [u8; 16] = codec::bytes_tag(entry, 0, "session_states[].tag")?;
            let tag = SessionTag(tag_bytes);
            let state_value = codec::require_tag(entry, 1, "session_states[].state")?;
            let state = SessionState::decode(state_value)?;
            // §4.7: idx is assigned from iteration index on decode,
            // preserving original insertion order rather than being
            // carried on the wire.
            session_states.insert(tag.string_form(), SessionStateEntry { idx: idx as u64, state });
        }
        let next_idx = session_states.len() as u64;

        Ok(Self {
            local_identity: expected_local_identity.clone(),
            remote_identity,
            session_tag,
            pending_prekey,
            session_states,
            next_idx,
            config: SessionConfig::default(),
        })
    }
}

impl Encode for Session {
    fn encode(&self) -> Value {
        let tagged_states: Vec<Value> = self
            .session_states
            .iter()
            .map(|(tag_hex, entry)| {
                tagged_map(vec![
                    (0, Value::Bytes(hex::decode(tag_hex).expect("valid hex from string_form"))),
                    (1, entry.state.encode()),
                ])
            })
            .collect();

        tagged_map(vec![
            (0, Value::Integer(crate::WIRE_VERSION.into())),
            (1, Value::Bytes(self.session_tag.0.to_vec())),
            (2, keys::identity_key_value(&self.local_identity.public_key())),
            (3, keys::identity_key_value(&self.remote_identity)),
            (
                4,
                self.pending_prekey
                    .map(|p| {
                        tagged_map(vec![
                            (0, Value::Integer(p.prekey_id.into())),
                            (1, keys::public_key_value(&p.base_public_key)),
                        ])
                    })
                    .unwrap_or(Value::Null),
            ),
            (5, Value::Array(tagged_states)),
        ])
    }
}
