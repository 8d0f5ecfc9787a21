//! Benchmarks for the hot paths of the session state machine: key
//! generation, the X25519 DH agreement the ratchet runs on every step,
//! HKDF/HMAC key derivation, AEAD sealing, and a full `Session`
//! encrypt/decrypt round trip.

use std::collections::HashMap;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::sync::Mutex;

use construct_session::aead::{self, AeadKey};
use construct_session::kdf::{derive_message_key, derive_root_and_chain_keys, ChainRatchet};
use construct_session::keys::{IdentityKeyPair, KeyPair};
use construct_session::prekey::{PreKey, PreKeyId, PreKeyStore};
use construct_session::session::{Session, SessionConfig};

/// Mirrors `prekey::test_support::InMemoryPreKeyStore`, duplicated here
/// since that module is `#[cfg(test)]`-only and unavailable to a
/// separate bench binary.
struct BenchPreKeyStore {
    prekeys: Mutex<HashMap<PreKeyId, PreKey>>,
}

impl BenchPreKeyStore {
    fn new() -> Self {
        Self {
            prekeys: Mutex::new(HashMap::new()),
        }
    }

    async fn insert(&self, prekey: PreKey) {
        self.prekeys.lock().await.insert(prekey.prekey_id, prekey);
    }
}

#[async_trait]
impl PreKeyStore for BenchPreKeyStore {
    async fn load_prekey(&self, id: PreKeyId) -> anyhow::Result<Option<PreKey>> {
        Ok(self.prekeys.lock().await.get(&id).cloned())
    }

    async fn delete_prekey(&self, id: PreKeyId) -> anyhow::Result<()> {
        self.prekeys.lock().await.remove(&id);
        Ok(())
    }
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");

    group.bench_function("ephemeral_keypair", |b| {
        b.iter(|| black_box(KeyPair::generate()))
    });

    group.bench_function("identity_keypair", |b| {
        b.iter(|| black_box(IdentityKeyPair::generate()))
    });

    group.finish();
}

fn bench_diffie_hellman(c: &mut Criterion) {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    c.bench_function("x25519_dh", |b| {
        b.iter(|| black_box(alice.diffie_hellman(&bob.public_key())))
    });
}

fn bench_kdf(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdf");

    let root_key = [0x11u8; 32];
    let dh_output = [0x22u8; 32];

    group.bench_function("root_and_chain_keys", |b| {
        b.iter(|| black_box(derive_root_and_chain_keys(&root_key, &dh_output).unwrap()))
    });

    group.bench_function("chain_ratchet_step", |b| {
        let mut ratchet = ChainRatchet::new([0x33u8; 32]);
        b.iter(|| black_box(ratchet.ratchet()))
    });

    group.bench_function("derive_message_key", |b| {
        b.iter(|| black_box(derive_message_key(&[0x44u8; 32])))
    });

    group.finish();
}

fn bench_aead(c: &mut Criterion) {
    let mut group = c.benchmark_group("aead");
    let key = AeadKey::from_bytes([0x55u8; 32]);

    for size in [16usize, 256, 4096] {
        let plaintext = vec![0x42u8; size];
        group.bench_with_input(BenchmarkId::new("seal", size), &plaintext, |b, pt| {
            b.iter(|| black_box(aead::seal(&key, pt, b"aad").unwrap()))
        });
    }

    group.finish();
}

fn bench_session_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("session_handshake_and_reply", |b| {
        b.iter(|| {
            rt.block_on(async {
                let alice_identity = IdentityKeyPair::generate();
                let bob_identity = IdentityKeyPair::generate();
                let bob_prekey = PreKey::generate(1);
                let bundle = bob_prekey.bundle(bob_identity.public_key());

                let store = BenchPreKeyStore::new();
                store.insert(bob_prekey).await;

                let mut alice =
                    Session::init_from_prekey(alice_identity, &bundle, SessionConfig::default()).unwrap();
                let envelope = alice.encrypt(b"benchmark payload").unwrap();

                let (mut bob, _) =
                    Session::init_from_message(bob_identity, &store, &envelope, SessionConfig::default())
                        .await
                        .unwrap();

                let reply = bob.encrypt(b"reply payload").unwrap();
                black_box(alice.decrypt(&store, &reply).await.unwrap())
            })
        })
    });
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_diffie_hellman,
    bench_kdf,
    bench_aead,
    bench_session_round_trip
);
criterion_main!(benches);
