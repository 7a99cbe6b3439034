//! Global runtime and process-wide singleton (§0 ambient stack).
//!
//! The host process interface (§6.3) is a synchronous command loop over
//! pipes, so every public entry point bridges into async workers via
//! `block_on`, exactly as the teacher's `store.rs` does with its own
//! `RUNTIME`/`CORE` pair.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use ed25519_dalek::SigningKey;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::mixkeys::MixKeyList;
use crate::session::{InMemorySessionStore, SessionStore};

static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

fn get_runtime() -> &'static tokio::runtime::Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to create Tokio runtime")
    })
}

/// Runs an async block on the global multi-thread runtime, for the
/// synchronous host-process command loop (§6.3) to call into.
pub fn block_on<F, R>(f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    get_runtime().block_on(f)
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("core init error: {0}")]
    Init(String),
    #[error("already initialised")]
    AlreadyInit,
}

pub struct MuteCore {
    pub signing_key: SigningKey,
    pub mapped_id: String,
    pub db: SqlitePool,
    pub mix_keys: Option<Arc<MixKeyList>>,
    pub sessions: Arc<dyn SessionStore>,
    pub db_dir: PathBuf,
}

static CORE: OnceLock<MuteCore> = OnceLock::new();

pub fn get_core() -> Option<&'static MuteCore> {
    CORE.get()
}

async fn init_db(db_dir: &str) -> Result<SqlitePool, CoreError> {
    let url = format!("sqlite://{db_dir}/mute.db?mode=rwc");
    let pool = SqlitePool::connect(&url)
        .await
        .map_err(|e| CoreError::Init(e.to_string()))?;
    crate::db::run_migrations(&pool)
        .await
        .map_err(|e| CoreError::Init(e.to_string()))?;
    Ok(pool)
}

/// Bootstraps the process singleton: opens the local database, loads the
/// caller's identity key, and — for a server-role process — starts the mix
/// key-list maintainer ticker. Idempotent, matching the teacher's
/// already-initialized-is-a-no-op `bootstrap()`.
pub async fn bootstrap(
    signing_key: SigningKey,
    mapped_id: String,
    db_dir: &str,
    mix_role: Option<(String, [u8; 32], u64)>,
) -> Result<(), CoreError> {
    if CORE.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(db_dir)
        .map_err(|e| CoreError::Init(format!("failed to create db dir: {e}")))?;
    let db = init_db(db_dir).await?;

    let mix_keys = mix_role.map(|(mix_address, token_pub, new_key_frequency_secs)| {
        Arc::new(MixKeyList::new_with_persistence(
            mix_address,
            token_pub,
            signing_key.clone(),
            new_key_frequency_secs,
            db.clone(),
        ))
    });
    if let Some(list) = &mix_keys {
        tokio::spawn(crate::mixkeys::run_maintainer(list.clone()));
    }

    let core = MuteCore {
        signing_key,
        mapped_id,
        db,
        mix_keys,
        sessions: Arc::new(InMemorySessionStore::new()),
        db_dir: PathBuf::from(db_dir),
    };

    CORE.set(core).map_err(|_| CoreError::AlreadyInit)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn bootstrap_is_idempotent() {
        block_on(async {
            let dir = std::env::temp_dir().join(format!("mute-core-test-{}", std::process::id()));
            let signing_key = SigningKey::generate(&mut OsRng);
            let dir_str = dir.to_string_lossy().to_string();
            let first = bootstrap(signing_key.clone(), "alice@mute.berlin".into(), &dir_str, None).await;
            assert!(first.is_ok());
            let second = bootstrap(signing_key, "someone-else@mute.berlin".into(), &dir_str, None).await;
            assert!(second.is_ok());
            assert_eq!(get_core().unwrap().mapped_id, "alice@mute.berlin");
            let _ = std::fs::remove_dir_all(&dir);
        });
    }
}
