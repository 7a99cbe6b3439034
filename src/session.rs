//! Session key store (§3.4, §4.7): per-`(my_id, contact_id)` ratchet state
//! consumed by the message pipeline's encrypt/decrypt steps.
//!
//! Shaped like the teacher's `encryption.rs` DCGKA group-key cache — a
//! trait describing the operations the message layer needs, backed here by
//! an in-memory store behind a `tokio::sync::Mutex`. `InMemorySessionStore`
//! is the store actually consulted on the hot path; `persist`/`hydrate`
//! write a snapshot of one session through to the `sessions` table in
//! `db.rs` and read it back, for callers that want a session to survive a
//! restart.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::identity::UidMessage;
use crate::nymaddress::NymAddress;
use crate::primitives::{hmac_sha256, sha256};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no private key entry for the requested public-key hash")]
    NoKeyEntry,
    #[error("no KeyInit published for this contact")]
    NoKeyInit,
    #[error("no message key at the requested ratchet position")]
    NoMessageKey,
    #[error("persisted session row is malformed")]
    Decode,
    #[error("db error: {0}")]
    Db(#[from] crate::db::DbError),
}

fn encode_hash_list(list: &[[u8; 32]]) -> Vec<u8> {
    list.iter().flat_map(|h| h.iter().copied()).collect()
}

fn decode_hash_list(bytes: &[u8]) -> Result<Vec<[u8; 32]>, SessionError> {
    if bytes.len() % 32 != 0 {
        return Err(SessionError::Decode);
    }
    Ok(bytes.chunks_exact(32).map(|c| c.try_into().expect("chunks_exact(32)")).collect())
}

/// `{root_key_hash, send_chain_key, recv_chain_key, send_pub_hashes[], recv_pub_hashes[]}`
/// of §4.7, created on first successful encrypt or decrypt.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub root_key_hash: [u8; 32],
    pub send_chain_key: [u8; 32],
    pub recv_chain_key: [u8; 32],
    pub send_pub_hashes: Vec<[u8; 32]>,
    pub recv_pub_hashes: Vec<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub priv_key: [u8; 32],
    pub pub_key: [u8; 32],
}

/// Advances a sending/receiving chain key one step (§9 resolution of Open
/// Question #2): `chain_key' = HMAC-SHA256(chain_key, 0x01)`,
/// `message_key = HMAC-SHA256(chain_key, 0x02)`.
pub fn advance_chain_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let new_chain_key = hmac_sha256(chain_key, &[0x01]);
    let message_key = hmac_sha256(chain_key, &[0x02]);
    (new_chain_key, message_key)
}

/// Folds a fresh DH output into the root key hash:
/// `root_key_hash' = SHA-256(root_key_hash ‖ DH_output)`.
pub fn advance_root_key_hash(root_key_hash: &[u8; 32], dh_output: &[u8; 32]) -> [u8; 32] {
    sha256(&[root_key_hash.as_slice(), dh_output.as_slice()].concat())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// The full interface §4.7 names — the message layer composes these; the
/// ratchet's internal bookkeeping lives behind the trait.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session_state(&self, my_id: &str, contact_id: &str) -> Option<SessionState>;
    async fn set_session_state(&self, my_id: &str, contact_id: &str, state: SessionState);

    /// Creates or rolls a session: folds `dh_output` into the root key hash
    /// and records the new sending chain key, monotonically advancing past
    /// whatever session previously existed for this pair.
    #[allow(clippy::too_many_arguments)]
    async fn store_session(
        &self,
        my_id: &str,
        contact_id: &str,
        sender_session_pub_hash: [u8; 32],
        root_key_hash: [u8; 32],
        chain_key: [u8; 32],
        send_pub_hashes: Vec<[u8; 32]>,
        recv_pub_hashes: Vec<[u8; 32]>,
    );

    async fn has_session(
        &self,
        my_id: &str,
        contact_id: &str,
        sender_session_pub_hash: [u8; 32],
    ) -> bool;

    async fn get_private_key_entry(&self, pub_key_hash: &[u8; 32]) -> Result<KeyEntry, SessionError>;
    async fn get_public_key_entry(
        &self,
        uid_msg: &UidMessage,
    ) -> Result<(KeyEntry, NymAddress), SessionError>;

    /// Resolves a contact's long-term Ed25519 signing key, cached from the
    /// `UidMessage` a prior hash-chain search/lookup resolved for them.
    /// `None` means we have no cached UID for that identity — a signed
    /// message from such a sender cannot be checked and is not rejected for
    /// it, matching §4.8 step 3's gray-list-on-first-contact behavior.
    async fn get_verifying_key(&self, mapped_id: &str) -> Option<VerifyingKey>;

    async fn get_message_key(
        &self,
        my_id: &str,
        contact_id: &str,
        chain_position: u64,
    ) -> Result<[u8; 32], SessionError>;
    async fn num_message_keys(&self, my_id: &str, contact_id: &str) -> u64;
    async fn get_root_key_hash(&self, my_id: &str, contact_id: &str) -> Option<[u8; 32]>;
    async fn get_chain_key(&self, my_id: &str, contact_id: &str) -> Option<[u8; 32]>;
    async fn del_message_key(&self, my_id: &str, contact_id: &str, chain_position: u64);

    async fn add_session_key(&self, pub_key_hash: [u8; 32], entry: KeyEntry, expire: u64);
    async fn get_session_key(&self, pub_key_hash: &[u8; 32]) -> Option<KeyEntry>;
    async fn del_priv_session_key(&self, pub_key_hash: &[u8; 32]);
    async fn cleanup_session_keys(&self, t: u64);
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<(String, String), SessionState>,
    private_keys: HashMap<[u8; 32], KeyEntry>,
    public_key_directory: HashMap<String, (KeyEntry, NymAddress)>,
    verifying_keys: HashMap<String, VerifyingKey>,
    message_keys: HashMap<(String, String), HashMap<u64, [u8; 32]>>,
    pregenerated: HashMap<[u8; 32], (KeyEntry, u64)>,
}

/// In-memory backing for `SessionStore`; `db.rs` provides a SQLite-backed
/// sibling with the same contract.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap hook: seeds a recipient's `KeyInit` entry so
    /// `get_public_key_entry` can resolve it.
    pub async fn seed_public_key_entry(
        &self,
        mapped_id: &str,
        key_entry: KeyEntry,
        nym_address: NymAddress,
    ) {
        let mut guard = self.inner.lock().await;
        guard
            .public_key_directory
            .insert(mapped_id.to_string(), (key_entry, nym_address));
    }

    pub async fn seed_private_key_entry(&self, pub_key_hash: [u8; 32], entry: KeyEntry) {
        let mut guard = self.inner.lock().await;
        guard.private_keys.insert(pub_key_hash, entry);
    }

    /// Caches a resolved contact's signing key, as the hash-chain
    /// search/lookup path does once it has verified a `UidMessage`.
    pub async fn seed_verifying_key(&self, mapped_id: &str, key: VerifyingKey) {
        let mut guard = self.inner.lock().await;
        guard.verifying_keys.insert(mapped_id.to_string(), key);
    }

    /// Writes the current `(my_id, contact_id)` session state through to
    /// `sessions`. A no-op if no session exists for that pair yet.
    pub async fn persist(
        &self,
        pool: &sqlx::SqlitePool,
        my_id: &str,
        contact_id: &str,
    ) -> Result<(), SessionError> {
        let Some(state) = self.get_session_state(my_id, contact_id).await else {
            return Ok(());
        };
        crate::db::save_session_row(
            pool,
            my_id,
            contact_id,
            &state.root_key_hash,
            &state.send_chain_key,
            &state.recv_chain_key,
            &encode_hash_list(&state.send_pub_hashes),
            &encode_hash_list(&state.recv_pub_hashes),
        )
        .await?;
        Ok(())
    }

    /// Loads a previously `persist`ed `(my_id, contact_id)` session back
    /// into memory. Returns `false` if no row was found.
    pub async fn hydrate(
        &self,
        pool: &sqlx::SqlitePool,
        my_id: &str,
        contact_id: &str,
    ) -> Result<bool, SessionError> {
        let Some(row) = crate::db::load_session_row(pool, my_id, contact_id).await? else {
            return Ok(false);
        };
        let state = SessionState {
            root_key_hash: row.root_key_hash.as_slice().try_into().map_err(|_| SessionError::Decode)?,
            send_chain_key: row.send_chain_key.as_slice().try_into().map_err(|_| SessionError::Decode)?,
            recv_chain_key: row.recv_chain_key.as_slice().try_into().map_err(|_| SessionError::Decode)?,
            send_pub_hashes: decode_hash_list(&row.send_pub_hashes)?,
            recv_pub_hashes: decode_hash_list(&row.recv_pub_hashes)?,
        };
        self.set_session_state(my_id, contact_id, state).await;
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session_state(&self, my_id: &str, contact_id: &str) -> Option<SessionState> {
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(&(my_id.to_string(), contact_id.to_string()))
            .cloned()
    }

    async fn set_session_state(&self, my_id: &str, contact_id: &str, state: SessionState) {
        let mut guard = self.inner.lock().await;
        guard
            .sessions
            .insert((my_id.to_string(), contact_id.to_string()), state);
    }

    async fn store_session(
        &self,
        my_id: &str,
        contact_id: &str,
        sender_session_pub_hash: [u8; 32],
        root_key_hash: [u8; 32],
        chain_key: [u8; 32],
        send_pub_hashes: Vec<[u8; 32]>,
        recv_pub_hashes: Vec<[u8; 32]>,
    ) {
        let mut guard = self.inner.lock().await;
        let mut recv = recv_pub_hashes;
        if !recv.contains(&sender_session_pub_hash) {
            recv.push(sender_session_pub_hash);
        }
        guard.sessions.insert(
            (my_id.to_string(), contact_id.to_string()),
            SessionState {
                root_key_hash,
                send_chain_key: chain_key,
                recv_chain_key: chain_key,
                send_pub_hashes,
                recv_pub_hashes: recv,
            },
        );
    }

    async fn has_session(
        &self,
        my_id: &str,
        contact_id: &str,
        sender_session_pub_hash: [u8; 32],
    ) -> bool {
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(&(my_id.to_string(), contact_id.to_string()))
            .map(|s| s.recv_pub_hashes.contains(&sender_session_pub_hash))
            .unwrap_or(false)
    }

    async fn get_private_key_entry(&self, pub_key_hash: &[u8; 32]) -> Result<KeyEntry, SessionError> {
        let guard = self.inner.lock().await;
        guard
            .private_keys
            .get(pub_key_hash)
            .cloned()
            .ok_or(SessionError::NoKeyEntry)
    }

    async fn get_public_key_entry(
        &self,
        uid_msg: &UidMessage,
    ) -> Result<(KeyEntry, NymAddress), SessionError> {
        let guard = self.inner.lock().await;
        guard
            .public_key_directory
            .get(uid_msg.mapped_id().as_str())
            .cloned()
            .ok_or(SessionError::NoKeyInit)
    }

    async fn get_verifying_key(&self, mapped_id: &str) -> Option<VerifyingKey> {
        let guard = self.inner.lock().await;
        guard.verifying_keys.get(mapped_id).copied()
    }

    async fn get_message_key(
        &self,
        my_id: &str,
        contact_id: &str,
        chain_position: u64,
    ) -> Result<[u8; 32], SessionError> {
        let guard = self.inner.lock().await;
        guard
            .message_keys
            .get(&(my_id.to_string(), contact_id.to_string()))
            .and_then(|m| m.get(&chain_position))
            .copied()
            .ok_or(SessionError::NoMessageKey)
    }

    async fn num_message_keys(&self, my_id: &str, contact_id: &str) -> u64 {
        let guard = self.inner.lock().await;
        guard
            .message_keys
            .get(&(my_id.to_string(), contact_id.to_string()))
            .map(|m| m.len() as u64)
            .unwrap_or(0)
    }

    async fn get_root_key_hash(&self, my_id: &str, contact_id: &str) -> Option<[u8; 32]> {
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(&(my_id.to_string(), contact_id.to_string()))
            .map(|s| s.root_key_hash)
    }

    async fn get_chain_key(&self, my_id: &str, contact_id: &str) -> Option<[u8; 32]> {
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(&(my_id.to_string(), contact_id.to_string()))
            .map(|s| s.send_chain_key)
    }

    async fn del_message_key(&self, my_id: &str, contact_id: &str, chain_position: u64) {
        let mut guard = self.inner.lock().await;
        if let Some(m) = guard
            .message_keys
            .get_mut(&(my_id.to_string(), contact_id.to_string()))
        {
            m.remove(&chain_position);
        }
    }

    async fn add_session_key(&self, pub_key_hash: [u8; 32], entry: KeyEntry, expire: u64) {
        let mut guard = self.inner.lock().await;
        guard.pregenerated.insert(pub_key_hash, (entry, expire));
    }

    async fn get_session_key(&self, pub_key_hash: &[u8; 32]) -> Option<KeyEntry> {
        let guard = self.inner.lock().await;
        guard.pregenerated.get(pub_key_hash).map(|(e, _)| e.clone())
    }

    async fn del_priv_session_key(&self, pub_key_hash: &[u8; 32]) {
        let mut guard = self.inner.lock().await;
        guard.pregenerated.remove(pub_key_hash);
    }

    async fn cleanup_session_keys(&self, t: u64) {
        let mut guard = self.inner.lock().await;
        guard.pregenerated.retain(|_, (_, expire)| *expire >= t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_key_ratchet_advances_deterministically() {
        let ck = [1u8; 32];
        let (next1, mk1) = advance_chain_key(&ck);
        let (next2, mk2) = advance_chain_key(&ck);
        assert_eq!(next1, next2);
        assert_eq!(mk1, mk2);
        assert_ne!(next1, mk1);
    }

    #[test]
    fn root_key_hash_changes_with_dh_output() {
        let root = [2u8; 32];
        let a = advance_root_key_hash(&root, &[3u8; 32]);
        let b = advance_root_key_hash(&root, &[4u8; 32]);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn store_and_lookup_session_state() {
        let store = InMemorySessionStore::new();
        store
            .store_session(
                "alice@mute.berlin",
                "bob@mute.berlin",
                [9u8; 32],
                [1u8; 32],
                [2u8; 32],
                vec![[5u8; 32]],
                vec![],
            )
            .await;
        assert!(
            store
                .has_session("alice@mute.berlin", "bob@mute.berlin", [9u8; 32])
                .await
        );
        let state = store
            .get_session_state("alice@mute.berlin", "bob@mute.berlin")
            .await
            .unwrap();
        assert_eq!(state.root_key_hash, [1u8; 32]);
    }

    #[tokio::test]
    async fn pregenerated_session_keys_expire_on_cleanup() {
        let store = InMemorySessionStore::new();
        let entry = KeyEntry {
            priv_key: [1u8; 32],
            pub_key: [2u8; 32],
        };
        store.add_session_key([7u8; 32], entry, 100).await;
        assert!(store.get_session_key(&[7u8; 32]).await.is_some());
        store.cleanup_session_keys(200).await;
        assert!(store.get_session_key(&[7u8; 32]).await.is_none());
    }

    #[tokio::test]
    async fn missing_private_key_entry_errors() {
        let store = InMemorySessionStore::new();
        let err = store.get_private_key_entry(&[0u8; 32]).await.unwrap_err();
        assert!(matches!(err, SessionError::NoKeyEntry));
    }

    #[tokio::test]
    async fn persisted_session_survives_a_fresh_store() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let store = InMemorySessionStore::new();
        store
            .store_session(
                "alice@mute.berlin",
                "bob@mute.berlin",
                [9u8; 32],
                [1u8; 32],
                [2u8; 32],
                vec![[5u8; 32]],
                vec![[6u8; 32]],
            )
            .await;
        store.persist(&pool, "alice@mute.berlin", "bob@mute.berlin").await.unwrap();

        let reloaded = InMemorySessionStore::new();
        let found = reloaded
            .hydrate(&pool, "alice@mute.berlin", "bob@mute.berlin")
            .await
            .unwrap();
        assert!(found);

        let state = reloaded
            .get_session_state("alice@mute.berlin", "bob@mute.berlin")
            .await
            .unwrap();
        assert_eq!(state.root_key_hash, [1u8; 32]);
        assert_eq!(state.send_pub_hashes, vec![[5u8; 32]]);
        assert!(state.recv_pub_hashes.contains(&[6u8; 32]));
        assert!(state.recv_pub_hashes.contains(&[9u8; 32]));
    }

    #[tokio::test]
    async fn hydrate_with_no_row_returns_false() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let store = InMemorySessionStore::new();
        let found = store
            .hydrate(&pool, "alice@mute.berlin", "nobody@mute.berlin")
            .await
            .unwrap();
        assert!(!found);
    }
}
