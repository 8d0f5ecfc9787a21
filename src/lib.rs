//! # construct-session
//!
//! The Proteus-style session object at the core of Construct Messenger's
//! end-to-end encryption: a bounded collection of double-ratchet branches
//! between two identities, driven by `encrypt`/`decrypt`, upgraded on
//! receipt of a fresh prekey handshake, and serialised to a canonical
//! binary form for persistence.
//!
//! ## Core Components
//!
//! - [`keys`]: identity and ephemeral key types, fingerprints.
//! - [`prekey`]: `PreKey`, `PreKeyBundle`, and the `PreKeyStore` collaborator.
//! - [`message`]: wire message types (`SessionTag`, `CipherMessage`,
//!   `PreKeyMessage`, `Envelope`).
//! - [`session_state`]: the per-branch ratchet (`SessionState`) — a DH
//!   ratchet nested around a symmetric chain ratchet.
//! - [`session`]: the `Session` state machine itself.
//! - [`kdf`] / [`aead`]: key derivation and authenticated encryption.
//! - [`codec`]: the canonical tagged-field binary encoding all wire types
//!   share.
//! - [`error`]: typed errors carrying the stable `CASE_*` codes used for
//!   cross-implementation log correlation.
//!
//! Group messaging, key transparency, forward secrecy across identity
//! rotation, and network transport are all out of scope — see
//! `SPEC_FULL.md` for the full requirements this crate implements.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod aead;
pub mod codec;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod message;
pub mod prekey;
pub mod session;
pub mod session_state;

pub use error::{CryptoError, CryptoResult, Result, SessionError};
pub use prekey::MAX_PREKEY_ID;
pub use session::{Session, SessionConfig, MAX_SESSION_STATES};
pub use session_state::{MAX_RECV_CHAINS, MAX_SKIPPED_KEYS};

/// Canonical binary format version this crate writes (wire tag 0).
pub const WIRE_VERSION: u8 = 1;

/// Convenient re-exports for downstream crates driving a `Session`.
pub mod prelude {
    pub use crate::error::{CryptoError, Result, SessionError};
    pub use crate::keys::{IdentityKey, IdentityKeyPair, KeyPair, PublicKey};
    pub use crate::message::{CipherMessage, Envelope, PreKeyMessage, SessionTag};
    pub use crate::prekey::{PreKey, PreKeyBundle, PreKeyStore, MAX_PREKEY_ID};
    pub use crate::session::{Session, SessionConfig};
}
