//! Per-ratchet cryptographic state: one instance exists per entry in a
//! `Session`'s state map, and drives exactly one branch of the double
//! ratchet — a DH ratchet for break-in recovery nested around a symmetric
//! chain ratchet for forward secrecy within a chain.

use std::collections::HashMap;

use ciborium::value::Value;
use zeroize::Zeroize;

use crate::aead::{self, AeadKey};
use crate::codec::{self, tagged_map, u32_tag, Decode, Encode};
use crate::error::{CryptoError, CryptoResult, DecodeError};
use crate::kdf::{derive_message_key, derive_root_and_chain_keys};
use crate::keys::{self, KeyPair, PublicKey};

/// Bound on how many distinct receiving chains (one per DH ratchet step
/// the remote has advanced through) a single `SessionState` retains
/// before the oldest is dropped. Distinct from, and nested inside, a
/// `Session`'s own bound on distinct branches.
pub const MAX_RECV_CHAINS: usize = 5;

/// Bound on skipped message keys retained per receiving chain, to cap the
/// cost of recovering from a maliciously large counter gap.
pub const MAX_SKIPPED_KEYS: usize = 1000;

struct SendingChain {
    chain_key: [u8; 32],
    counter: u32,
}

impl Drop for SendingChain {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

struct ReceivingChain {
    ratchet_key: PublicKey,
    chain_key: [u8; 32],
    counter: u32,
    skipped: HashMap<u32, [u8; 32]>,
}

impl Drop for ReceivingChain {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

/// The ratchet state driving one branch of a `Session`.
pub struct SessionState {
    dh_self: KeyPair,
    dh_remote: Option<PublicKey>,
    root_key: [u8; 32],
    send_chain: Option<SendingChain>,
    recv_chains: Vec<ReceivingChain>,
    previous_chain_length: u32,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl SessionState {
    /// Establish a branch as the initiator, given the X3DH-style shared
    /// secret and the responder's prekey public key (the first DH
    /// ratchet key the branch is anchored to).
    pub fn init_as_alice(shared_secret: &[u8; 32], their_ratchet_key: &PublicKey) -> CryptoResult<Self> {
        let dh_self = KeyPair::generate();
        let dh_output = dh_self.diffie_hellman(their_ratchet_key);
        let (root_key, chain_key) = derive_root_and_chain_keys(shared_secret, &dh_output)?;

        Ok(Self {
            dh_self,
            dh_remote: Some(*their_ratchet_key),
            root_key,
            send_chain: Some(SendingChain { chain_key, counter: 0 }),
            recv_chains: Vec::new(),
            previous_chain_length: 0,
        })
    }

    /// Establish a branch as the responder. The responder's first
    /// receiving chain materialises lazily on the first `decrypt` call,
    /// once the initiator's ratchet key is observed.
    pub fn init_as_bob(shared_secret: &[u8; 32], our_ratchet_key_pair: KeyPair) -> Self {
        Self {
            dh_self: our_ratchet_key_pair,
            dh_remote: None,
            root_key: *shared_secret,
            send_chain: None,
            recv_chains: Vec::new(),
            previous_chain_length: 0,
        }
    }

    /// The current sending-side ratchet public key, carried on every
    /// outgoing `CipherMessage`.
    pub fn ratchet_public_key(&self) -> PublicKey {
        self.dh_self.public_key()
    }

    /// Encrypt `plaintext`, advancing the sending chain by one step.
    /// Returns `(counter, previous_counter, ratchet_key, cipher_text)`.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> CryptoResult<(u32, u32, PublicKey, Vec<u8>)> {
        if self.send_chain.is_none() {
            self.start_sending_chain()?;
        }
        let chain = self.send_chain.as_mut().expect("just ensured present");

        let (new_chain_key, message_key) = derive_message_key(&chain.chain_key);
        chain.chain_key = new_chain_key;
        let counter = chain.counter;
        chain.counter += 1;

        let key = AeadKey::from_bytes(message_key);
        let sealed = aead::seal(&key, plaintext, aad)?;
        let mut cipher_text = sealed.nonce.to_vec();
        cipher_text.extend_from_slice(&sealed.ciphertext);

        Ok((counter, self.previous_chain_length, self.ratchet_public_key(), cipher_text))
    }

    fn start_sending_chain(&mut self) -> CryptoResult<()> {
        let remote = self
            .dh_remote
            .ok_or_else(|| CryptoError::RatchetCorrupted("no remote ratchet key to start a sending chain from".to_string()))?;
        let dh_self = KeyPair::generate();
        let dh_output = dh_self.diffie_hellman(&remote);
        let (new_root, chain_key) = derive_root_and_chain_keys(&self.root_key, &dh_output)?;
        self.root_key = new_root;
        self.dh_self = dh_self;
        self.send_chain = Some(SendingChain { chain_key, counter: 0 });
        Ok(())
    }

    /// Decrypt a message from the given branch state. Performs a DH
    /// ratchet step if `ratchet_key` differs from the last one observed.
    pub fn decrypt(
        &mut self,
        counter: u32,
        previous_counter: u32,
        ratchet_key: &PublicKey,
        cipher_text: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if cipher_text.len() < aead::NONCE_SIZE {
            return Err(CryptoError::InvalidMessage("ciphertext shorter than a nonce".to_string()));
        }
        let (nonce_bytes, sealed_bytes) = cipher_text.split_at(aead::NONCE_SIZE);
        let mut nonce = [0u8; aead::NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        let payload = aead::EncryptedPayload {
            nonce,
            ciphertext: sealed_bytes.to_vec(),
        };

        if let Some(message_key) = self.take_skipped_key(ratchet_key, counter) {
            let key = AeadKey::from_bytes(message_key);
            return aead::open(&key, &payload, aad);
        }

        let is_new_chain = self.dh_remote.as_ref() != Some(ratchet_key);
        if is_new_chain {
            if let Some(old_remote) = self.dh_remote {
                self.skip_to(&old_remote, previous_counter)?;
            }
            self.dh_ratchet(ratchet_key)?;
        }

        self.skip_to(ratchet_key, counter)?;

        let chain = self
            .recv_chain_mut(ratchet_key)
            .ok_or_else(|| CryptoError::RatchetCorrupted("receiving chain vanished after skip".to_string()))?;
        if counter < chain.counter {
            return Err(CryptoError::DuplicateMessage { counter });
        }
        let (new_chain_key, message_key) = derive_message_key(&chain.chain_key);
        chain.chain_key = new_chain_key;
        chain.counter += 1;

        let key = AeadKey::from_bytes(message_key);
        aead::open(&key, &payload, aad)
    }

    fn recv_chain_mut(&mut self, ratchet_key: &PublicKey) -> Option<&mut ReceivingChain> {
        self.recv_chains.iter_mut().find(|c| &c.ratchet_key == ratchet_key)
    }

    fn take_skipped_key(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<[u8; 32]> {
        self.recv_chains
            .iter_mut()
            .find(|c| &c.ratchet_key == ratchet_key)
            .and_then(|c| c.skipped.remove(&counter))
    }

    fn dh_ratchet(&mut self, their_ratchet_key: &PublicKey) -> CryptoResult<()> {
        self.previous_chain_length = self.send_chain.as_ref().map(|c| c.counter).unwrap_or(0);
        self.send_chain = None;
        self.dh_remote = Some(*their_ratchet_key);

        let dh_output = self.dh_self.diffie_hellman(their_ratchet_key);
        let (new_root, chain_key) = derive_root_and_chain_keys(&self.root_key, &dh_output)?;
        self.root_key = new_root;

        if self.recv_chains.len() >= MAX_RECV_CHAINS {
            self.recv_chains.remove(0);
        }
        self.recv_chains.push(ReceivingChain {
            ratchet_key: *their_ratchet_key,
            chain_key,
            counter: 0,
            skipped: HashMap::new(),
        });

        Ok(())
    }

    fn skip_to(&mut self, ratchet_key: &PublicKey, until: u32) -> CryptoResult<()> {
        let Some(chain) = self.recv_chains.iter_mut().find(|c| &c.ratchet_key == ratchet_key) else {
            return Ok(());
        };

        if until.saturating_sub(chain.counter) as usize > MAX_SKIPPED_KEYS {
            return Err(CryptoError::MessageGapTooLarge {
                gap: until - chain.counter,
            });
        }

        while chain.counter < until {
            let (new_chain_key, message_key) = derive_message_key(&chain.chain_key);
            chain.chain_key = new_chain_key;
            chain.skipped.insert(chain.counter, message_key);
            chain.counter += 1;

            if chain.skipped.len() > MAX_SKIPPED_KEYS {
                if let Some(&oldest) = chain.skipped.keys().min() {
                    chain.skipped.remove(&oldest);
                }
            }
        }

        Ok(())
    }
}

impl Encode for SessionState {
    fn encode(&self) -> Value {
        let recv_chains: Vec<Value> = self
            .recv_chains
            .iter()
            .map(|c| {
                let skipped: Vec<Value> = c
                    .skipped
                    .iter()
                    .map(|(counter, key)| {
                        tagged_map(vec![
                            (0, Value::Integer((*counter).into())),
                            (1, Value::Bytes(key.to_vec())),
                        ])
                    })
                    .collect();
                tagged_map(vec![
                    (0, keys::public_key_value(&c.ratchet_key)),
                    (1, Value::Bytes(c.chain_key.to_vec())),
                    (2, Value::Integer(c.counter.into())),
                    (3, Value::Array(skipped)),
                ])
            })
            .collect();

        tagged_map(vec![
            (0, Value::Bytes(self.dh_self.secret_bytes().to_vec())),
            (
                1,
                self.dh_remote
                    .map(|k| keys::public_key_value(&k))
                    .unwrap_or(Value::Null),
            ),
            (2, Value::Bytes(self.root_key.to_vec())),
            (
                3,
                self.send_chain
                    .as_ref()
                    .map(|c| {
                        tagged_map(vec![
                            (0, Value::Bytes(c.chain_key.to_vec())),
                            (1, Value::Integer(c.counter.into())),
                        ])
                    })
                    .unwrap_or(Value::Null),
            ),
            (4, Value::Array(recv_chains)),
            (5, Value::Integer(self.previous_chain_length.into())),
        ])
    }
}

impl Decode for SessionState {
    fn decode(value: &Value) -> Result<Self, DecodeError> {
        let secret: [u8; 32] = codec::bytes_tag(value, 0, "dh_self")?;
        let dh_self = KeyPair::from_secret_bytes(secret);

        let dh_remote = match codec::require_tag(value, 1, "dh_remote")? {
            Value::Null => None,
            v => Some(keys::public_key_tag(
                &tagged_map(vec![(0, v.clone())]),
                0,
                "dh_remote",
            )?),
        };

        let root_key: [u8; 32] = codec::bytes_tag(value, 2, "root_key")?;

        let send_chain = match codec::require_tag(value, 3, "send_chain")? {
            Value::Null => None,
            v => Some(SendingChain {
                chain_key: codec::bytes_tag(v, 0, "send_chain.chain_key")?,
                counter: u32_tag(v, 1, "send_chain.counter")?,
            }),
        };

        let Value::Array(recv_entries) = codec::require_tag(value, 4, "recv_chains")? else {
            return Err(DecodeError::InvalidType("recv_chains".to_string()));
        };
        let mut recv_chains = Vec::with_capacity(recv_entries.len());
        for entry in recv_entries {
            let ratchet_key = keys::public_key_tag(entry, 0, "recv_chain.ratchet_key")?;
            let chain_key: [u8; 32] = codec::bytes_tag(entry, 1, "recv_chain.chain_key")?;
            let counter = u32_tag(entry, 2, "recv_chain.counter")?;
            let Value::Array(skipped_entries) = codec::require_tag(entry, 3, "recv_chain.skipped")? else {
                return Err(DecodeError::InvalidType("recv_chain.skipped".to_string()));
            };
            let mut skipped = HashMap::with_capacity(skipped_entries.len());
            for s in skipped_entries {
                let counter = u32_tag(s, 0, "skipped.counter")?;
                let key: [u8; 32] = codec::bytes_tag(s, 1, "skipped.key")?;
                skipped.insert(counter, key);
            }
            recv_chains.push(ReceivingChain {
                ratchet_key,
                chain_key,
                counter,
                skipped,
            });
        }

        let previous_chain_length = u32_tag(value, 5, "previous_chain_length")?;

        Ok(Self {
            dh_self,
            dh_remote,
            root_key,
            send_chain,
            recv_chains,
            previous_chain_length,
        })
    }
}
