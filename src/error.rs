//! Error types for the session state machine and its cryptographic collaborator.
//!
//! The protocol note this crate implements keeps a catalogue of stable
//! `CASE_nnn` codes for cross-implementation log correlation; they show up
//! here as doc-commented variants rather than string constants so callers
//! can `match` on them instead of grepping messages.

use thiserror::Error;

/// Result alias for the cryptographic (`SessionState`) layer.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Result alias for the `Session` layer.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by the ratchet collaborator (`SessionState`).
///
/// `Session::_decrypt_prekey_message` recovers locally from exactly two of
/// these (`InvalidSignature`, `InvalidMessage`) by establishing a fresh
/// ratchet; every other variant propagates unchanged.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// HKDF expansion failed (practically unreachable — fixed output length).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD authentication tag did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Envelope did not decrypt under the expected chain/message key, or
    /// was otherwise structurally unusable for this branch.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The message counter for this chain has already been consumed.
    #[error("duplicate message (counter {counter} already seen)")]
    DuplicateMessage {
        /// The message counter that was replayed.
        counter: u32,
    },

    /// The gap between the last received counter and the incoming one
    /// exceeds `MAX_SKIPPED_KEYS`.
    #[error("message gap too large: {gap} messages skipped")]
    MessageGapTooLarge {
        /// Number of messages that would need to be skipped.
        gap: u32,
    },

    /// Internal ratchet invariant violated (missing chain key at a point
    /// where one is required). Indicates a bug, not attacker input.
    #[error("ratchet state corrupted: {0}")]
    RatchetCorrupted(String),

    /// Canonical decode of a `SessionState` failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors raised by `Session`'s own operations. `CASE_*` numbers are
/// preserved for log compatibility with the protocol note this crate
/// implements.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `_new_state`: the referenced prekey was not found in the store.
    /// `CASE_101`.
    #[error("prekey not found in store `{store}` (CASE_101)")]
    PrekeyNotFoundInStore {
        /// The store's diagnostic name, surfaced for operator logs.
        store: String,
    },

    /// `encrypt`: no ratchet state exists for the current session tag.
    /// `CASE_102`.
    #[error("no session state for the current tag (CASE_102)")]
    NoCurrentState,

    /// `decrypt`: the envelope carries neither a known prekey message nor
    /// a cipher message variant. `CASE_200`.
    #[error("unknown envelope variant (CASE_200)")]
    UnknownEnvelope,

    /// `init_from_message` was handed a `CipherMessage` instead of a
    /// `PreKeyMessage`. `CASE_201`.
    #[error("init_from_message given a cipher message, not a prekey message (CASE_201)")]
    InitGivenCipherMessage,

    /// `init_from_message` was handed an envelope that is neither variant.
    /// `CASE_202`.
    #[error("init_from_message given an unrecognised envelope (CASE_202)")]
    InitGivenUnknownEnvelope,

    /// `init_from_message`'s prekey-consumption delete failed. `CASE_203`.
    #[error("prekey delete failed during session establishment (CASE_203)")]
    PrekeyNotFound(#[source] anyhow::Error),

    /// A prekey message's embedded identity key does not match the
    /// session's established remote identity. `CASE_204`.
    #[error("remote identity changed mid-session (CASE_204)")]
    RemoteIdentityChanged,

    /// `decrypt` of a `CipherMessage` referenced a session tag with no
    /// matching state. `CASE_205`.
    #[error("no session state for incoming message's tag (CASE_205)")]
    NoStateForTag,

    /// Lower-layer ratchet failure that was not locally recoverable.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Canonical binary decode failed.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The prekey store returned an error from a fallible operation other
    /// than the two wrapped cases above (e.g. `_decrypt_prekey_message`'s
    /// recovery-path delete, which re-raises unwrapped).
    #[error("prekey store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the canonical tagged-field codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Tag 3 (`remote_identity`) was absent after decoding a full object.
    #[error("missing remote identity")]
    MissingRemoteIdentity,

    /// Tag 2's decoded identity key does not match the identity supplied
    /// by the caller at deserialisation time. `CASE_300`.
    #[error("local identity changed (CASE_300)")]
    LocalIdentityChanged,

    /// A field's CBOR shape did not match its declared tag semantics
    /// (e.g. `pending_prekey` was neither `null` nor a 2-field object).
    /// `CASE_301`.
    #[error("invalid type for field: {0} (CASE_301)")]
    InvalidType(String),

    /// The underlying CBOR stream was malformed, or a required field was
    /// missing / of the wrong shape.
    #[error("malformed encoding: {0}")]
    Malformed(String),
}
