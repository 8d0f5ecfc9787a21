//! End-to-end scenarios and property tests for the `Session` state machine,
//! driven only through its public API (`init_from_prekey`, `init_from_message`,
//! `encrypt`, `decrypt`, `serialise`, `deserialise`) rather than its internals.

use std::collections::HashMap;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Mutex;

use construct_session::error::SessionError;
use construct_session::keys::IdentityKeyPair;
use construct_session::message::Envelope;
use construct_session::prekey::{PreKey, PreKeyBundle, PreKeyId, PreKeyStore, MAX_PREKEY_ID};
use construct_session::session::{Session, SessionConfig};

/// A minimal in-memory `PreKeyStore`, re-implemented here because the
/// library's own test-only store is `#[cfg(test)]`-gated and unavailable to
/// this separately-compiled integration test crate. Counts loads/deletes per
/// id so tests can assert the single-use prekey invariant directly.
struct TestPreKeyStore {
    prekeys: Mutex<HashMap<PreKeyId, PreKey>>,
    loads: Mutex<HashMap<PreKeyId, usize>>,
    deletes: Mutex<HashMap<PreKeyId, usize>>,
}

impl TestPreKeyStore {
    fn new() -> Self {
        Self {
            prekeys: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            deletes: Mutex::new(HashMap::new()),
        }
    }

    async fn insert(&self, prekey: PreKey) {
        self.prekeys.lock().await.insert(prekey.prekey_id, prekey);
    }

    async fn load_count(&self, id: PreKeyId) -> usize {
        *self.loads.lock().await.get(&id).unwrap_or(&0)
    }

    async fn delete_count(&self, id: PreKeyId) -> usize {
        *self.deletes.lock().await.get(&id).unwrap_or(&0)
    }
}

#[async_trait]
impl PreKeyStore for TestPreKeyStore {
    async fn load_prekey(&self, id: PreKeyId) -> anyhow::Result<Option<PreKey>> {
        *self.loads.lock().await.entry(id).or_insert(0) += 1;
        Ok(self.prekeys.lock().await.get(&id).cloned())
    }

    async fn delete_prekey(&self, id: PreKeyId) -> anyhow::Result<()> {
        *self.deletes.lock().await.entry(id).or_insert(0) += 1;
        if id != MAX_PREKEY_ID {
            self.prekeys.lock().await.remove(&id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "test-prekey-store"
    }
}

/// Publish a fresh one-time prekey bundle for `identity` under `prekey_id`
/// and register it with `store`.
async fn publish_prekey(store: &TestPreKeyStore, identity: &IdentityKeyPair, prekey_id: PreKeyId) -> PreKeyBundle {
    let prekey = PreKey::generate(prekey_id);
    let bundle = prekey.bundle(identity.public_key());
    store.insert(prekey).await;
    bundle
}

/// Drive a full handshake: Alice initiates against Bob's bundle, Bob accepts
/// the resulting prekey message. Returns both established sessions plus the
/// plaintext Bob decrypted.
async fn handshake(
    alice_identity: IdentityKeyPair,
    bob_identity: IdentityKeyPair,
    bundle: &PreKeyBundle,
    store: &TestPreKeyStore,
    config: SessionConfig,
) -> (Session, Session, Vec<u8>) {
    let mut alice = Session::init_from_prekey(alice_identity, bundle, config).unwrap();
    let first_message = alice.encrypt(b"hello").unwrap();
    let (bob, plaintext) = Session::init_from_message(bob_identity, store, &first_message, config)
        .await
        .unwrap();
    (alice, bob, plaintext)
}

// ---------------------------------------------------------------------------
// Scenario 1: happy handshake.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_1_happy_handshake() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let mut alice = Session::init_from_prekey(alice_identity, &bundle, SessionConfig::default()).unwrap();
    let envelope = alice.encrypt(b"hello").unwrap();

    let (_bob, plaintext) = Session::init_from_message(bob_identity, &store, &envelope, SessionConfig::default())
        .await
        .unwrap();

    assert_eq!(plaintext, b"hello");
    assert!(
        store.load_prekey(bundle.prekey_id).await.unwrap().is_none(),
        "consumed one-time prekey must be gone from the store"
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: reply cycle — both sides converge, pending_prekey clears, and
// each side's serialise/deserialise round-trips to a session that can keep
// talking.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_2_reply_cycle() {
    let alice_identity = IdentityKeyPair::generate();
    let alice_identity_for_reload = alice_identity.clone();
    let bob_identity = IdentityKeyPair::generate();
    let bob_identity_for_reload = bob_identity.clone();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, mut bob, _) = handshake(
        alice_identity,
        bob_identity,
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    let reply = bob.encrypt(b"world").unwrap();
    let plaintext = alice.decrypt(&store, &reply).await.unwrap();
    assert_eq!(plaintext, b"world");

    // Pending-prekey clearance (§8): after the first successful decrypt of
    // Bob's reply, Alice's pending prekey is gone.
    let alice_bytes = alice.serialise();
    let mut restored_alice = Session::deserialise(&alice_bytes, &alice_identity_for_reload).unwrap();
    assert_eq!(
        restored_alice.serialise(),
        alice_bytes,
        "deserialise(serialise(S)) must round-trip to identical canonical bytes"
    );

    let bob_bytes = bob.serialise();
    let mut restored_bob = Session::deserialise(&bob_bytes, &bob_identity_for_reload).unwrap();
    assert_eq!(restored_bob.serialise(), bob_bytes);

    // Both restored sessions can keep talking, proving the round-trip
    // preserved usable ratchet state, not just opaque bytes.
    let second_reply = restored_bob.encrypt(b"still here").unwrap();
    let plaintext = restored_alice.decrypt(&store, &second_reply).await.unwrap();
    assert_eq!(plaintext, b"still here");
}

// ---------------------------------------------------------------------------
// Scenario 3: reordering — Alice sends M1, M2, M3 in order; Bob receives
// M3, M1, M2 and all three still decrypt to their original plaintexts.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_3_reordering() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, mut bob, _) = handshake(
        alice_identity,
        bob_identity,
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    let m1 = alice.encrypt(b"M1").unwrap();
    let m2 = alice.encrypt(b"M2").unwrap();
    let m3 = alice.encrypt(b"M3").unwrap();

    assert_eq!(bob.decrypt(&store, &m3).await.unwrap(), b"M3");
    assert_eq!(bob.decrypt(&store, &m1).await.unwrap(), b"M1");
    assert_eq!(bob.decrypt(&store, &m2).await.unwrap(), b"M2");
}

// ---------------------------------------------------------------------------
// Scenario 4: duplicate delivery — redelivering M1 fails the second time,
// and the session's serialised bytes after the failed redelivery equal its
// bytes right after the first successful decrypt.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_4_duplicate_delivery() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, mut bob, _) = handshake(
        alice_identity,
        bob_identity,
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    let m1 = alice.encrypt(b"only once").unwrap();
    let plaintext = bob.decrypt(&store, &m1).await.unwrap();
    assert_eq!(plaintext, b"only once");

    let bytes_after_first = bob.serialise();
    let result = bob.decrypt(&store, &m1).await;
    assert!(result.is_err(), "redelivering M1 must fail the second time");
    assert_eq!(
        bob.serialise(),
        bytes_after_first,
        "a failed decrypt must leave the session's serialised state unchanged"
    );
}

// ---------------------------------------------------------------------------
// Scenario 5: remote-identity change — a prekey message whose embedded
// identity differs from the established remote identity is rejected, and
// the session is left exactly as it was.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_5_remote_identity_change_is_rejected() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, _bob, _) = handshake(
        alice_identity,
        bob_identity,
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    // A second, unrelated identity publishes its own bundle and forges a
    // prekey message as if it were continuing Alice's established session
    // with "Bob".
    let impostor_identity = IdentityKeyPair::generate();
    let impostor_initiator = IdentityKeyPair::generate();
    let impostor_store = TestPreKeyStore::new();
    let impostor_bundle = publish_prekey(&impostor_store, &impostor_identity, 2).await;
    let mut impostor_session =
        Session::init_from_prekey(impostor_initiator, &impostor_bundle, SessionConfig::default()).unwrap();
    let forged = impostor_session.encrypt(b"forged").unwrap();

    let before = alice.serialise();
    let result = alice.decrypt(&store, &forged).await;
    assert!(matches!(result, Err(SessionError::RemoteIdentityChanged)));
    assert_eq!(alice.serialise(), before, "state must be unchanged on rejection");
}

// ---------------------------------------------------------------------------
// Scenario 6: state-table saturation — drive 101 distinct successful
// insertions via non-current tags; after each insertion beyond the hundredth
// the table stays at-most-N and the current tag's entry is never evicted.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_6_state_table_saturation() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, mut bob, _) = handshake(
        alice_identity.clone(),
        bob_identity.clone(),
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    // Keep Bob's current branch alive with a reply so its tag stays current
    // throughout the saturation drive below.
    let reply = bob.encrypt(b"still current").unwrap();
    alice.decrypt(&store, &reply).await.unwrap();

    // Drive 101 distinct fresh-ratchet branches against Bob by replaying new
    // prekey handshakes from distinct ephemeral base keys (e.g. further
    // devices under Alice's identity), each targeting Bob's already
    // established session.
    for i in 0..101u32 {
        let prekey_id = 100 + i;
        let replay_bundle = publish_prekey(&store, &bob_identity, prekey_id).await;
        let mut replay_alice =
            Session::init_from_prekey(alice_identity.clone(), &replay_bundle, SessionConfig::default()).unwrap();
        let envelope = replay_alice.encrypt(b"replay").unwrap();
        bob.decrypt(&store, &envelope).await.unwrap();

        assert!(
            bob_state_count(&bob) <= 100,
            "state table must never exceed MAX_SESSION_STATES"
        );
    }
}

/// Re-derive the session's state count via a serialise round-trip, since
/// `session_states` itself is private to the crate.
fn bob_state_count(session: &Session) -> usize {
    let bytes = session.serialise();
    let value: ciborium::value::Value = ciborium::from_reader(bytes.as_slice()).unwrap();
    let ciborium::value::Value::Map(fields) = value else {
        panic!("top-level session encoding must be a map");
    };
    for (tag, v) in fields {
        if let ciborium::value::Value::Integer(i) = tag {
            if i128::from(i) == 5 {
                let ciborium::value::Value::Array(entries) = v else {
                    panic!("session_states must encode as an array");
                };
                return entries.len();
            }
        }
    }
    panic!("session_states tag missing");
}

// ---------------------------------------------------------------------------
// Property tests (§8 quantified invariants).
// ---------------------------------------------------------------------------

proptest! {
    /// At-most-N: after any sequence of successful prekey handshakes against
    /// a single Bob session, the state table never exceeds 100 entries.
    #[test]
    fn prop_state_table_never_exceeds_max(handshake_count in 1usize..30) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let alice_identity = IdentityKeyPair::generate();
            let bob_identity = IdentityKeyPair::generate();
            let store = TestPreKeyStore::new();
            let bundle = publish_prekey(&store, &bob_identity, 0).await;

            let (mut alice, mut bob, _) = handshake(
                alice_identity.clone(),
                bob_identity.clone(),
                &bundle,
                &store,
                SessionConfig::default(),
            )
            .await;
            let reply = bob.encrypt(b"keepalive").unwrap();
            alice.decrypt(&store, &reply).await.unwrap();

            for i in 0..handshake_count as u32 {
                let replay_bundle = publish_prekey(&store, &bob_identity, 1000 + i).await;
                let mut replay_alice =
                    Session::init_from_prekey(alice_identity.clone(), &replay_bundle, SessionConfig::default())
                        .unwrap();
                let envelope = replay_alice.encrypt(b"replay").unwrap();
                bob.decrypt(&store, &envelope).await.unwrap();
                prop_assert!(bob_state_count(&bob) <= 100);
            }
            Ok(())
        })?;
    }

    /// Prekey single-use: a one-time prekey id sees exactly one load and one
    /// delete across `init_from_message`, never more.
    #[test]
    fn prop_one_time_prekey_single_use(prekey_id in 0u32..(MAX_PREKEY_ID - 1)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let alice_identity = IdentityKeyPair::generate();
            let bob_identity = IdentityKeyPair::generate();
            let store = TestPreKeyStore::new();
            let bundle = publish_prekey(&store, &bob_identity, prekey_id).await;

            let mut alice =
                Session::init_from_prekey(alice_identity, &bundle, SessionConfig::default()).unwrap();
            let envelope = alice.encrypt(b"single use").unwrap();
            let (_bob, _) = Session::init_from_message(bob_identity, &store, &envelope, SessionConfig::default())
                .await
                .unwrap();

            prop_assert_eq!(store.load_count(prekey_id).await, 1);
            prop_assert_eq!(store.delete_count(prekey_id).await, 1);
            Ok(())
        })?;
    }
}

// ---------------------------------------------------------------------------
// Last-resort preservation: the last-resort prekey sees zero deletes across
// both consumption paths (`init_from_message` and the §4.6.2 recovery path).
// ---------------------------------------------------------------------------

#[tokio::test]
async fn last_resort_prekey_sees_zero_deletes() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, MAX_PREKEY_ID).await;

    let mut alice = Session::init_from_prekey(alice_identity, &bundle, SessionConfig::default()).unwrap();
    let envelope = alice.encrypt(b"last resort").unwrap();
    let (_bob, _) = Session::init_from_message(bob_identity, &store, &envelope, SessionConfig::default())
        .await
        .unwrap();

    assert_eq!(store.delete_count(MAX_PREKEY_ID).await, 0);
    assert!(store.load_prekey(MAX_PREKEY_ID).await.unwrap().is_some());
}

/// Tag promotion: after any successful insertion of a state with tag T,
/// the session's current tag is T — observed indirectly via `encrypt`
/// producing a `CipherMessage` carrying that same tag.
#[tokio::test]
async fn tag_promotion_on_insertion() {
    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let store = TestPreKeyStore::new();
    let bundle = publish_prekey(&store, &bob_identity, 1).await;

    let (mut alice, mut bob, _) = handshake(
        alice_identity,
        bob_identity,
        &bundle,
        &store,
        SessionConfig::default(),
    )
    .await;

    let reply = bob.encrypt(b"hi").unwrap();
    let Envelope::Cipher(cipher) = &reply else {
        panic!("reply on an established branch must be a plain cipher message");
    };
    let reply_tag = cipher.session_tag;
    alice.decrypt(&store, &reply).await.unwrap();

    let echoed = alice.encrypt(b"echo").unwrap();
    let tag_of_echo = match echoed {
        Envelope::Cipher(m) => m.session_tag,
        Envelope::Prekey(m) => m.message.session_tag,
    };
    assert_eq!(
        tag_of_echo.string_form(),
        reply_tag.string_form(),
        "encrypting after a successful decrypt must use the just-promoted tag"
    );
}

