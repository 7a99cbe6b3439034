//! Mix key list (§4.4): a mix's own short-lived curve25519 key set, plus the
//! signed `AddressStatement` advertised to clients.
//!
//! The background ticker here follows the same shape as the teacher's
//! `pkarr_publish::start_republish_loop` and `projector::run_projector`:
//! a `tokio::time::interval`, a dispatch call, and `eprintln!`-tagged error
//! reporting rather than a structured logging framework.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::primitives::{self, x25519_base, OsRand, Rand};

#[derive(Debug, Clone)]
pub struct MixKeyEntry {
    pub public: [u8; 32],
    pub private: [u8; 32],
    pub expire: u64,
    pub mix_address: String,
    pub token_pub: [u8; 32],
}

/// Signed statement over the currently live key list, published for client
/// consumption (§4.5 step 3, §6.2 `GET /keys`).
#[derive(Debug, Clone)]
pub struct AddressStatement {
    pub entries: Vec<(Vec<u8>, u64)>, // (public key, expire) pairs only — no private material
    pub signed_at: u64,
    pub signature: [u8; 64],
}

pub struct MixKeyList {
    entries: Mutex<Vec<MixKeyEntry>>,
    mix_address: String,
    token_pub: [u8; 32],
    signing_key: SigningKey,
    new_key_frequency_secs: u64,
    pool: Option<sqlx::SqlitePool>,
}

impl MixKeyList {
    pub fn new(
        mix_address: String,
        token_pub: [u8; 32],
        signing_key: SigningKey,
        new_key_frequency_secs: u64,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            mix_address,
            token_pub,
            signing_key,
            new_key_frequency_secs,
            pool: None,
        }
    }

    /// Like `new`, but every `add_key` also writes through to `mix_keys`
    /// (§3.8) so the list survives a restart.
    pub fn new_with_persistence(
        mix_address: String,
        token_pub: [u8; 32],
        signing_key: SigningKey,
        new_key_frequency_secs: u64,
        pool: sqlx::SqlitePool,
    ) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new(mix_address, token_pub, signing_key, new_key_frequency_secs)
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs()
    }

    /// Appends a fresh entry and purges expired ones. When constructed with
    /// `new_with_persistence`, writes the new entry to `mix_keys` and purges
    /// expired rows there too.
    pub async fn add_key(&self, lifetime_secs: u64) {
        let mut private = [0u8; 32];
        OsRand.fill(&mut private).expect("OS RNG does not fail");
        let public = x25519_base(&private);
        let now = Self::now();
        let expire = now + lifetime_secs;

        let mut guard = self.entries.lock().await;
        guard.push(MixKeyEntry {
            public,
            private,
            expire,
            mix_address: self.mix_address.clone(),
            token_pub: self.token_pub,
        });
        guard.retain(|e| e.expire >= now);
        drop(guard);

        if let Some(pool) = &self.pool {
            if let Err(e) =
                crate::db::save_mix_key(pool, &public, &private, expire as i64, &self.mix_address, &self.token_pub)
                    .await
            {
                eprintln!("[mixkeys] failed to persist key: {e}");
            }
            if let Err(e) = crate::db::purge_expired_mix_keys(pool, now as i64).await {
                eprintln!("[mixkeys] failed to purge expired keys: {e}");
            }
        }
    }

    /// Returns the private key for `public` iff it exists and has not
    /// expired.
    pub async fn get_private(&self, public: &[u8; 32]) -> Option<[u8; 32]> {
        let now = Self::now();
        let guard = self.entries.lock().await;
        guard
            .iter()
            .find(|e| &e.public == public && e.expire >= now)
            .map(|e| e.private)
    }

    pub async fn statement(&self) -> AddressStatement {
        let guard = self.entries.lock().await;
        let entries: Vec<(Vec<u8>, u64)> = guard
            .iter()
            .map(|e| (e.public.to_vec(), e.expire))
            .collect();
        drop(guard);

        let signed_at = Self::now();
        let mut msg = Vec::new();
        for (pk, expire) in &entries {
            msg.extend_from_slice(pk);
            msg.extend_from_slice(&expire.to_be_bytes());
        }
        msg.extend_from_slice(&signed_at.to_be_bytes());
        let signature = primitives::sign(&self.signing_key, &msg);

        AddressStatement {
            entries,
            signed_at,
            signature,
        }
    }
}

/// Background maintainer: every `new_key_frequency` seconds, appends a key
/// with a lifetime of `2 * new_key_frequency` seconds (so there is always a
/// previous-generation key still valid to decrypt in-flight mail) and purges
/// expired ones.
pub async fn run_maintainer(list: std::sync::Arc<MixKeyList>) {
    let period = Duration::from_secs(list.new_key_frequency_secs.max(1));
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        list.add_key(list.new_key_frequency_secs.max(1) * 2).await;
        println!("[mixkeys] rotated key list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn add_and_lookup() {
        let list = MixKeyList::new(
            "https://mix.mute.berlin/hop".into(),
            [9u8; 32],
            SigningKey::generate(&mut OsRng),
            60,
        );
        list.add_key(3600).await;
        let stmt = list.statement().await;
        assert_eq!(stmt.entries.len(), 1);
        let pub_bytes: [u8; 32] = stmt.entries[0].0.clone().try_into().unwrap();
        assert!(list.get_private(&pub_bytes).await.is_some());
    }

    #[tokio::test]
    async fn expired_key_is_purged_on_next_add() {
        let list = MixKeyList::new(
            "https://mix.mute.berlin/hop".into(),
            [9u8; 32],
            SigningKey::generate(&mut OsRng),
            60,
        );
        list.add_key(0).await; // already expired by the time we check
        list.add_key(3600).await;
        let stmt = list.statement().await;
        assert_eq!(stmt.entries.len(), 1);
    }

    #[tokio::test]
    async fn persisted_keys_survive_a_purge_and_are_written_through() {
        use sqlx::sqlite::SqlitePoolOptions;
        use sqlx::Row;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let list = MixKeyList::new_with_persistence(
            "https://mix.mute.berlin/hop".into(),
            [9u8; 32],
            SigningKey::generate(&mut OsRng),
            60,
            pool.clone(),
        );
        list.add_key(0).await; // expired immediately
        list.add_key(3600).await;

        let stmt = list.statement().await;
        assert_eq!(stmt.entries.len(), 1);

        // the expired key's row was purged; the live one was written through
        let row = sqlx::query("SELECT COUNT(*) AS n FROM mix_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 1);
    }
}
