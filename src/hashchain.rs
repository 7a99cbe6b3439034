//! Hash-chain log (§3.3, §4.3): an append-only chain of 153-byte entries
//! binding identities to key-server-registered UID messages.
//!
//! The backlink/position bookkeeping here mirrors the `seq_num` +
//! `backlink` chaining the teacher's op log uses to extend a log
//! (`sign_and_store_op` in the original ops module), adapted to the
//! fixed 153-byte wire entry this spec pins.

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::identity::UidMessage;
use crate::primitives::{aes256_cbc_decrypt, ckdf, sha256, verify};

pub const HC_TYPE: u8 = 0x01;
pub const ENTRY_LEN: usize = 153;

#[derive(Debug, Error)]
pub enum HashChainError {
    #[error("entry is not {ENTRY_LEN} bytes")]
    BadLength,
    #[error("TYPE field mismatch")]
    BadType,
    #[error("chain hash mismatch at position {0}")]
    ChainMismatch(u64),
    #[error("known hash mismatch at position {0}")]
    KnownHashMismatch(u64),
    #[error("locally recorded HASHCHAINENTRY mismatch for a stored UID at position {0}")]
    UidAnchorMismatch(u64),
    #[error("crypto failure while searching position {0}")]
    CryptoFailure(u64),
    #[error("decrypted UID message's anchor index does not match UIDIndex at position {0}")]
    IndexMismatch(u64),
    #[error("no key-server trust-anchor key available to verify chain-of-custody signature at position {0}")]
    UnknownKeyServerKey(u64),
    #[error("key server's chain-of-custody signature failed to verify at position {0}")]
    ServerSignatureInvalid(u64),
    #[error("key-server RPC failed: {0}")]
    Rpc(String),
    #[error("hash-chain cache db error: {0}")]
    Db(String),
}

/// A single 153-byte hash-chain entry, decoded into fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChainEntry {
    pub ty: u8,
    pub nonce: [u8; 8],
    pub hash_id: [u8; 32],
    pub cr_uid: [u8; 48],
    pub uid_index: [u8; 32],
    pub prev_hash: [u8; 32],
}

impl HashChainEntry {
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        buf[0] = self.ty;
        buf[1..9].copy_from_slice(&self.nonce);
        buf[9..41].copy_from_slice(&self.hash_id);
        buf[41..89].copy_from_slice(&self.cr_uid);
        buf[89..121].copy_from_slice(&self.uid_index);
        buf[121..153].copy_from_slice(&self.prev_hash);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HashChainError> {
        if bytes.len() != ENTRY_LEN {
            return Err(HashChainError::BadLength);
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[1..9]);
        let mut hash_id = [0u8; 32];
        hash_id.copy_from_slice(&bytes[9..41]);
        let mut cr_uid = [0u8; 48];
        cr_uid.copy_from_slice(&bytes[41..89]);
        let mut uid_index = [0u8; 32];
        uid_index.copy_from_slice(&bytes[89..121]);
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&bytes[121..153]);
        Ok(Self {
            ty: bytes[0],
            nonce,
            hash_id,
            cr_uid,
            uid_index,
            prev_hash,
        })
    }

    pub fn entry_hash(&self) -> [u8; 32] {
        sha256(&self.encode())
    }

    /// Builds an entry for `mapped_id` anchoring `uid_hash` at `uid_index`,
    /// chained to `prev_hash` (32 zero bytes for the first entry).
    pub fn new(
        mapped_id: &str,
        uid_hash: &[u8; 48],
        uid_index: [u8; 32],
        prev_hash: [u8; 32],
        nonce: [u8; 8],
        rng: &mut dyn crate::primitives::Rand,
    ) -> Result<Self, HashChainError> {
        let (k1, k2) = ckdf(&nonce);
        let hash_id = sha256(&[&k1[..], mapped_id.as_bytes()].concat());
        let key2 = sha256(&[&k2[..], mapped_id.as_bytes()].concat());
        let cr_uid_vec = crate::primitives::aes256_cbc_encrypt(&key2, uid_hash, rng)
            .map_err(|_| HashChainError::CryptoFailure(0))?;
        let mut cr_uid = [0u8; 48];
        if cr_uid_vec.len() != 48 {
            return Err(HashChainError::CryptoFailure(0));
        }
        cr_uid.copy_from_slice(&cr_uid_vec);
        Ok(Self {
            ty: HC_TYPE,
            nonce,
            hash_id,
            cr_uid,
            uid_index,
            prev_hash,
        })
    }
}

/// A UID message together with the server's chain-of-custody signature and
/// the position it claims to be anchored at.
#[derive(Debug, Clone)]
pub struct UidMessageReply {
    pub uid_message_encrypted: Vec<u8>,
    pub hash_chain_entry: [u8; 32],
    pub hash_chain_pos: u64,
    pub server_signature: [u8; 64],
}

/// Abstraction over the key server's JSON-RPC surface (§6.2), so validate/
/// search/lookup can be tested against a fake without a live server.
#[async_trait]
pub trait KeyServerClient: Send + Sync {
    async fn fetch_last(&self) -> Result<(HashChainEntry, u64), HashChainError>;
    async fn fetch_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(HashChainEntry, [u8; 32])>, HashChainError>;
    async fn lookup_by_identity(&self, mapped_id: &str) -> Result<Vec<u64>, HashChainError>;
    async fn fetch_uid(&self, uid_index: &[u8; 32]) -> Result<UidMessageReply, HashChainError>;
}

/// A locally cached entry plus the hash distributed alongside it.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry: HashChainEntry,
    pub known_hash: [u8; 32],
}

/// The bytes the key server signs over when vouching for a UID message's
/// anchor (§4.3's "chain-of-custody signature"): the encrypted reply body
/// together with the chain entry and position it claims, so a signature
/// cannot be replayed against a different entry.
fn server_signature_message(uid_message_encrypted: &[u8], hash_chain_entry: &[u8; 32], hash_chain_pos: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(uid_message_encrypted.len() + 40);
    buf.extend_from_slice(uid_message_encrypted);
    buf.extend_from_slice(hash_chain_entry);
    buf.extend_from_slice(&hash_chain_pos.to_be_bytes());
    buf
}

/// Decrypts and validates the UID message fetched for `stored`'s
/// `UIDIndex`, per §4.3: decrypt `UIDMessage` with `UIDHash`, check the
/// decrypted index equals `UIDIndex`, verify the self-signature, and — for
/// anything but the keyserver trust anchor — verify the key server's
/// chain-of-custody signature against `keyserver_verifying_key`.
fn decrypt_and_verify_uid(
    idkey: &[u8; 32],
    stored: &StoredEntry,
    reply: &UidMessageReply,
    pos: u64,
    keyserver_verifying_key: Option<&VerifyingKey>,
) -> Result<UidMessage, HashChainError> {
    let uid_hash = aes256_cbc_decrypt(idkey, &stored.entry.cr_uid)
        .map_err(|_| HashChainError::CryptoFailure(pos))?;
    let uid = UidMessage::open(&reply.uid_message_encrypted, &uid_hash)
        .map_err(|_| HashChainError::CryptoFailure(pos))?;
    if uid.anchor_index != stored.entry.uid_index {
        return Err(HashChainError::IndexMismatch(pos));
    }
    uid.verify_self_signature()
        .map_err(|_| HashChainError::CryptoFailure(pos))?;
    if !uid.is_keyserver_trust_anchor() {
        let server_key = keyserver_verifying_key.ok_or(HashChainError::UnknownKeyServerKey(pos))?;
        if reply.hash_chain_pos > pos {
            return Err(HashChainError::ServerSignatureInvalid(pos));
        }
        let msg = server_signature_message(&reply.uid_message_encrypted, &reply.hash_chain_entry, reply.hash_chain_pos);
        if !verify(server_key, &msg, &reply.server_signature) {
            return Err(HashChainError::ServerSignatureInvalid(pos));
        }
    }
    Ok(uid)
}

pub struct HashChainLog {
    pub entries: Vec<StoredEntry>,
}

impl Default for HashChainLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HashChainLog {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn max(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Persists every entry to the `hash_chain_cache` table (§3.8), so a
    /// restart doesn't have to re-walk the whole remote chain from scratch.
    /// Idempotent: `db::save_hash_chain_entry` no-ops on an already-stored
    /// position.
    pub async fn persist(&self, pool: &sqlx::SqlitePool) -> Result<(), HashChainError> {
        for (i, stored) in self.entries.iter().enumerate() {
            crate::db::save_hash_chain_entry(pool, i as i64, &stored.entry.encode(), &stored.known_hash)
                .await
                .map_err(|e| HashChainError::Db(e.to_string()))?;
        }
        Ok(())
    }

    /// Rebuilds a log from the locally cached entries, in position order.
    pub async fn load(pool: &sqlx::SqlitePool) -> Result<Self, HashChainError> {
        let rows = crate::db::load_hash_chain_entries(pool)
            .await
            .map_err(|e| HashChainError::Db(e.to_string()))?;
        let mut entries = Vec::with_capacity(rows.len());
        for (entry_bytes, known_hash_bytes) in rows {
            let entry = HashChainEntry::decode(&entry_bytes)?;
            let known_hash: [u8; 32] = known_hash_bytes
                .try_into()
                .map_err(|_| HashChainError::BadLength)?;
            entries.push(StoredEntry { entry, known_hash });
        }
        Ok(Self { entries })
    }

    /// Sync: pulls `(local_max+1)..=remote_last` and appends without
    /// validation — validation is a separate pass per §4.3.
    pub async fn sync(&mut self, client: &dyn KeyServerClient) -> Result<(), HashChainError> {
        let (_, remote_last) = client.fetch_last().await?;
        let local_max = self.max();
        if remote_last <= local_max {
            return Ok(());
        }
        let fetched = client.fetch_range(local_max, remote_last).await?;
        for (entry, known_hash) in fetched {
            self.entries.push(StoredEntry { entry, known_hash });
        }
        Ok(())
    }

    /// Validate: checks the chain structure and (where given) that locally
    /// anchored UIDs still match the stored hash at their recorded position.
    pub fn validate(
        &self,
        anchored_uids: &[(u64, [u8; 32])],
    ) -> Result<(), HashChainError> {
        let mut prev = [0u8; 32];
        for (i, stored) in self.entries.iter().enumerate() {
            let i = i as u64;
            if stored.entry.ty != HC_TYPE {
                return Err(HashChainError::BadType);
            }
            if stored.entry.entry_hash() != stored.known_hash {
                return Err(HashChainError::KnownHashMismatch(i));
            }
            if stored.entry.prev_hash != prev {
                return Err(HashChainError::ChainMismatch(i));
            }
            prev = stored.entry.entry_hash();
        }
        for (pos, recorded_hash) in anchored_uids {
            if *pos >= self.max() {
                continue;
            }
            let actual = self.entries[*pos as usize].known_hash;
            if actual != *recorded_hash {
                return Err(HashChainError::UidAnchorMismatch(*pos));
            }
        }
        Ok(())
    }

    /// Search: scans the whole chain without revealing `mapped_id` to the
    /// server. Returns `None` only if the full scan completes with no
    /// match — any crypto/parse error along the way is fatal.
    pub async fn search(
        &self,
        mapped_id: &str,
        client: &dyn KeyServerClient,
        keyserver_verifying_key: Option<&VerifyingKey>,
    ) -> Result<Option<(u64, UidMessage)>, HashChainError> {
        for (i, stored) in self.entries.iter().enumerate() {
            let i = i as u64;
            let (k1, k2) = ckdf(&stored.entry.nonce);
            let hash_id_test = sha256(&[&k1[..], mapped_id.as_bytes()].concat());
            if stored.entry.hash_id != hash_id_test {
                continue;
            }
            let idkey = sha256(&[&k2[..], mapped_id.as_bytes()].concat());
            let reply = client.fetch_uid(&stored.entry.uid_index).await?;
            let uid = decrypt_and_verify_uid(&idkey, stored, &reply, i, keyserver_verifying_key)?;
            return Ok(Some((i, uid)));
        }
        Ok(None)
    }

    /// Lookup: same per-entry processing as search, but driven by server-
    /// supplied positions (leaks identity to the server).
    pub async fn lookup(
        &self,
        mapped_id: &str,
        client: &dyn KeyServerClient,
        keyserver_verifying_key: Option<&VerifyingKey>,
    ) -> Result<Option<(u64, UidMessage)>, HashChainError> {
        let positions = client.lookup_by_identity(mapped_id).await?;
        for pos in positions {
            if pos >= self.max() {
                continue;
            }
            let stored = &self.entries[pos as usize];
            let (_, k2) = ckdf(&stored.entry.nonce);
            let idkey = sha256(&[&k2[..], mapped_id.as_bytes()].concat());
            let reply = client.fetch_uid(&stored.entry.uid_index).await?;
            let uid = decrypt_and_verify_uid(&idkey, stored, &reply, pos, keyserver_verifying_key)?;
            return Ok(Some((pos, uid)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::OsRand;

    fn build_chain(n: usize) -> HashChainLog {
        let mut log = HashChainLog::new();
        let mut prev = [0u8; 32];
        for i in 0..n {
            let entry = HashChainEntry::new(
                "alice@mute.berlin",
                &[0u8; 48],
                [i as u8; 32],
                prev,
                [i as u8; 8],
                &mut OsRand,
            )
            .unwrap();
            let known_hash = entry.entry_hash();
            prev = known_hash;
            log.entries.push(StoredEntry { entry, known_hash });
        }
        log
    }

    #[test]
    fn validate_accepts_well_formed_chain() {
        let log = build_chain(5);
        log.validate(&[]).unwrap();
    }

    #[test]
    fn validate_rejects_broken_link() {
        let mut log = build_chain(5);
        log.entries[3].entry.prev_hash[0] ^= 0xFF;
        let err = log.validate(&[]).unwrap_err();
        assert!(matches!(err, HashChainError::ChainMismatch(3)));
    }

    #[test]
    fn validate_rejects_tampered_known_hash() {
        let mut log = build_chain(3);
        log.entries[1].known_hash[0] ^= 0xFF;
        let err = log.validate(&[]).unwrap_err();
        assert!(matches!(err, HashChainError::KnownHashMismatch(1)));
    }

    #[test]
    fn entry_encode_decode_roundtrip() {
        let entry = HashChainEntry::new(
            "bob@mute.berlin",
            &[1u8; 48],
            [2u8; 32],
            [0u8; 32],
            [3u8; 8],
            &mut OsRand,
        )
        .unwrap();
        let bytes = entry.encode();
        assert_eq!(bytes.len(), ENTRY_LEN);
        let decoded = HashChainEntry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[tokio::test]
    async fn persisted_chain_survives_a_reload() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let log = build_chain(4);
        log.persist(&pool).await.unwrap();

        let reloaded = HashChainLog::load(&pool).await.unwrap();
        assert_eq!(reloaded.max(), log.max());
        reloaded.validate(&[]).unwrap();
    }
}
