//! Wire message types: the opaque ratchet-branch tag and the two envelope
//! variants a `Session` sends and receives.

use ciborium::value::Value;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::codec::{self, bytes_tag, byte_vec_tag, tagged_map, u32_tag, Decode, Encode};
use crate::error::DecodeError;
use crate::keys::{self, IdentityKey, PublicKey};
use crate::prekey::PreKeyId;

/// Size in bytes of a [`SessionTag`].
pub const SESSION_TAG_SIZE: usize = 16;

/// An opaque 16-byte identifier for one ratchet branch within a `Session`.
/// Minted fresh by the Alice side of a handshake; carried on every
/// message so the receiving `Session` knows which `SessionState` to use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTag(pub [u8; SESSION_TAG_SIZE]);

impl SessionTag {
    /// Mint a fresh random tag.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; SESSION_TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Lowercase hex rendering, used as the `session_states` map key and in
    /// log fields.
    pub fn string_form(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionTag({})", self.string_form())
    }
}

/// A message encrypted under an already-established ratchet.
#[derive(Clone, Debug)]
pub struct CipherMessage {
    /// Which ratchet branch this message belongs to.
    pub session_tag: SessionTag,
    /// Counter within the sender's current sending chain.
    pub counter: u32,
    /// Length of the sender's previous sending chain, for receiver-side
    /// skipped-key bookkeeping across a DH ratchet step.
    pub previous_counter: u32,
    /// The sender's current ratchet public key.
    pub ratchet_key: PublicKey,
    /// AEAD-sealed payload (nonce prefix + ciphertext-with-tag).
    pub cipher_text: Vec<u8>,
}

impl Encode for CipherMessage {
    fn encode(&self) -> Value {
        tagged_map(vec![
            (0, Value::Bytes(self.session_tag.0.to_vec())),
            (1, Value::Integer(self.counter.into())),
            (2, Value::Integer(self.previous_counter.into())),
            (3, keys::public_key_value(&self.ratchet_key)),
            (4, Value::Bytes(self.cipher_text.clone())),
        ])
    }
}

impl Decode for CipherMessage {
    fn decode(value: &Value) -> Result<Self, DecodeError> {
        let tag_bytes: [u8; SESSION_TAG_SIZE] = bytes_tag(value, 0, "session_tag")?;
        Ok(Self {
            session_tag: SessionTag(tag_bytes),
            counter: u32_tag(value, 1, "counter")?,
            previous_counter: u32_tag(value, 2, "previous_counter")?,
            ratchet_key: keys::public_key_tag(value, 3, "ratchet_key")?,
            cipher_text: byte_vec_tag(value, 4, "cipher_text")?,
        })
    }
}

/// The first message of a handshake: a `CipherMessage` plus enough of
/// Alice's handshake state for Bob to derive the same ratchet.
#[derive(Clone, Debug)]
pub struct PreKeyMessage {
    /// Which of Bob's prekeys Alice used.
    pub prekey_id: PreKeyId,
    /// Alice's ephemeral base key for the X3DH-style agreement.
    pub base_key: PublicKey,
    /// Alice's identity key.
    pub identity_key: IdentityKey,
    /// The actual encrypted payload, under the freshly established ratchet.
    pub message: CipherMessage,
}

impl Encode for PreKeyMessage {
    fn encode(&self) -> Value {
        tagged_map(vec![
            (0, Value::Integer(self.prekey_id.into())),
            (1, keys::public_key_value(&self.base_key)),
            (2, keys::identity_key_value(&self.identity_key)),
            (3, self.message.encode()),
        ])
    }
}

impl Decode for PreKeyMessage {
    fn decode(value: &Value) -> Result<Self, DecodeError> {
        let prekey_id = u32_tag(value, 0, "prekey_id")? as PreKeyId;
        let message_value = codec::require_tag(value, 3, "message")?;
        Ok(Self {
            prekey_id,
            base_key: keys::public_key_tag(value, 1, "base_key")?,
            identity_key: keys::identity_key_tag(value, 2, "identity_key")?,
            message: CipherMessage::decode(message_value)?,
        })
    }
}

/// The two shapes a message on the wire can take.
#[derive(Clone, Debug)]
pub enum Envelope {
    /// A handshake-establishing message (only ever the first message on a
    /// freshly initiated branch).
    Prekey(PreKeyMessage),
    /// An ordinary message on an already-established branch.
    Cipher(CipherMessage),
}

impl Encode for Envelope {
    fn encode(&self) -> Value {
        match self {
            Envelope::Prekey(m) => tagged_map(vec![(0, Value::Integer(0.into())), (1, m.encode())]),
            Envelope::Cipher(m) => tagged_map(vec![(0, Value::Integer(1.into())), (1, m.encode())]),
        }
    }
}

impl Decode for Envelope {
    fn decode(value: &Value) -> Result<Self, DecodeError> {
        let kind = u32_tag(value, 0, "envelope_kind")?;
        let inner = codec::require_tag(value, 1, "envelope_body")?;
        match kind {
            0 => Ok(Envelope::Prekey(PreKeyMessage::decode(inner)?)),
            1 => Ok(Envelope::Cipher(CipherMessage::decode(inner)?)),
            _ => Err(DecodeError::InvalidType("envelope_kind".to_string())),
        }
    }
}
