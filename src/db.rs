//! Opaque local stores (§3.8): the SQLite-backed rows the message pipeline,
//! session store, mix-key list, and key-server cache persist between runs.
//!
//! Schema and access-function shape follow the teacher's read-model
//! (`db::run_migrations`, `ON CONFLICT ... DO UPDATE`, `Row::get`) — the
//! tables themselves are new, carrying this system's queues and caches
//! instead of a social read model.

use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Creates all tables if they don't already exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS message_store (
            row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            from_id       TEXT NOT NULL,
            to_id         TEXT NOT NULL,
            plaintext     BLOB NOT NULL,
            sign_flag     INTEGER NOT NULL DEFAULT 1,
            min_delay     INTEGER NOT NULL,
            max_delay     INTEGER NOT NULL,
            created_at    INTEGER NOT NULL,
            signature     BLOB
        );

        CREATE TABLE IF NOT EXISTS out_queue (
            idx                 INTEGER PRIMARY KEY AUTOINCREMENT,
            nym_mapped_id       TEXT NOT NULL,
            msg_id              BLOB NOT NULL,
            payload             BLOB NOT NULL,
            nym_address_b64     TEXT NOT NULL,
            min_delay           INTEGER NOT NULL,
            max_delay           INTEGER NOT NULL,
            stage               TEXT NOT NULL CHECK (stage IN ('encrypted', 'enveloped')),
            resend_flag         INTEGER NOT NULL DEFAULT 0,
            created_at          INTEGER NOT NULL,
            retract_from        TEXT NOT NULL,
            retract_to          TEXT NOT NULL,
            retract_plaintext   BLOB NOT NULL,
            retract_sign_flag   INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS in_queue (
            idx             INTEGER PRIMARY KEY AUTOINCREMENT,
            my_id           TEXT NOT NULL,
            contact_id      TEXT,
            received_at     INTEGER NOT NULL,
            payload         BLOB NOT NULL,
            form            TEXT NOT NULL CHECK (form IN ('envelope', 'cleartext_cipher'))
        );

        CREATE TABLE IF NOT EXISTS message_id_cache (
            my_id           TEXT NOT NULL,
            contact_id      TEXT NOT NULL,
            message_id      BLOB NOT NULL,
            seq             INTEGER NOT NULL,
            PRIMARY KEY (my_id, contact_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS contacts (
            my_id           TEXT NOT NULL,
            contact_id      TEXT NOT NULL,
            list            TEXT NOT NULL CHECK (list IN ('white', 'gray', 'black')),
            added_at        INTEGER NOT NULL,
            PRIMARY KEY (my_id, contact_id)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            my_id               TEXT NOT NULL,
            contact_id          TEXT NOT NULL,
            root_key_hash       BLOB NOT NULL,
            send_chain_key      BLOB NOT NULL,
            recv_chain_key      BLOB NOT NULL,
            send_pub_hashes     BLOB NOT NULL,
            recv_pub_hashes     BLOB NOT NULL,
            PRIMARY KEY (my_id, contact_id)
        );

        CREATE TABLE IF NOT EXISTS mix_keys (
            public_key      BLOB PRIMARY KEY,
            private_key     BLOB NOT NULL,
            expire          INTEGER NOT NULL,
            mix_address     TEXT NOT NULL,
            token_pub       BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keyserver_capabilities (
            domain          TEXT PRIMARY KEY,
            methods_json    TEXT NOT NULL,
            fetched_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hash_chain_cache (
            position        INTEGER PRIMARY KEY,
            entry_bytes     BLOB NOT NULL,
            known_hash      BLOB NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

// ─── MessageStore (ToSend rows) ─────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageStoreRow {
    pub row_id: i64,
    pub from_id: String,
    pub to_id: String,
    pub plaintext: Vec<u8>,
    pub sign_flag: bool,
    pub min_delay: i64,
    pub max_delay: i64,
    pub created_at: i64,
    /// The sender's signature over `plaintext`, carried through from the
    /// inbound decrypt step (§4.8 step 3) so the host process can surface
    /// `SIGNATURE:` on `FETCH`. `None` for outbound rows and for inbound
    /// messages that weren't signed.
    pub signature: Option<Vec<u8>>,
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_to_send(
    pool: &SqlitePool,
    from_id: &str,
    to_id: &str,
    plaintext: &[u8],
    sign_flag: bool,
    min_delay: i64,
    max_delay: i64,
    now: i64,
    signature: Option<&[u8]>,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO message_store (from_id, to_id, plaintext, sign_flag, min_delay, max_delay, created_at, signature)\n         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(from_id)
    .bind(to_id)
    .bind(plaintext)
    .bind(sign_flag)
    .bind(min_delay)
    .bind(max_delay)
    .bind(now)
    .bind(signature)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_to_send(pool: &SqlitePool) -> Result<Vec<MessageStoreRow>, DbError> {
    Ok(
        sqlx::query_as::<_, MessageStoreRow>("SELECT * FROM message_store ORDER BY row_id ASC")
            .fetch_all(pool)
            .await?,
    )
}

pub async fn delete_to_send(pool: &SqlitePool, row_id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM message_store WHERE row_id = ?")
        .bind(row_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── OutQueue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutQueueRow {
    pub idx: i64,
    pub nym_mapped_id: String,
    pub msg_id: Vec<u8>,
    pub payload: Vec<u8>,
    pub nym_address_b64: String,
    pub min_delay: i64,
    pub max_delay: i64,
    pub stage: String,
    pub resend_flag: bool,
    pub retract_from: String,
    pub retract_to: String,
    pub retract_plaintext: Vec<u8>,
    pub retract_sign_flag: bool,
}

/// `retract_from`/`retract_to`/`retract_plaintext`/`retract_sign_flag` carry
/// enough of the original `ToSend` row to rebuild it verbatim if the mix
/// permanently rejects this delivery attempt (§4.8 step 3, "retract").
#[allow(clippy::too_many_arguments)]
pub async fn insert_out_queue_row(
    pool: &SqlitePool,
    nym_mapped_id: &str,
    msg_id: &[u8],
    payload: &[u8],
    nym_address_b64: &str,
    min_delay: i64,
    max_delay: i64,
    now: i64,
    retract_from: &str,
    retract_to: &str,
    retract_plaintext: &[u8],
    retract_sign_flag: bool,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO out_queue (nym_mapped_id, msg_id, payload, nym_address_b64, min_delay, max_delay, stage, resend_flag, created_at, retract_from, retract_to, retract_plaintext, retract_sign_flag)\n         VALUES (?, ?, ?, ?, ?, ?, 'encrypted', 0, ?, ?, ?, ?, ?)",
    )
    .bind(nym_mapped_id)
    .bind(msg_id)
    .bind(payload)
    .bind(nym_address_b64)
    .bind(min_delay)
    .bind(max_delay)
    .bind(now)
    .bind(retract_from)
    .bind(retract_to)
    .bind(retract_plaintext)
    .bind(retract_sign_flag)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Permanent-failure path: deletes the `OutQueue` row and reinserts it into
/// `MessageStore` as a fresh `ToSend` row, forcing a new token acquisition.
pub async fn retract_out_queue_row(pool: &SqlitePool, row: &OutQueueRow, now: i64) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM out_queue WHERE idx = ?")
        .bind(row.idx)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO message_store (from_id, to_id, plaintext, sign_flag, min_delay, max_delay, created_at)\n         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.retract_from)
    .bind(&row.retract_to)
    .bind(&row.retract_plaintext)
    .bind(row.retract_sign_flag)
    .bind(row.min_delay)
    .bind(row.max_delay)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn oldest_out_queue_row(pool: &SqlitePool) -> Result<Option<OutQueueRow>, DbError> {
    Ok(
        sqlx::query_as::<_, OutQueueRow>("SELECT * FROM out_queue ORDER BY idx ASC LIMIT 1")
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn set_out_queue_payload_and_stage(
    pool: &SqlitePool,
    idx: i64,
    payload: &[u8],
    stage: &str,
) -> Result<(), DbError> {
    sqlx::query("UPDATE out_queue SET payload = ?, stage = ? WHERE idx = ?")
        .bind(payload)
        .bind(stage)
        .bind(idx)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_resend_flag(pool: &SqlitePool, idx: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE out_queue SET resend_flag = 1 WHERE idx = ?")
        .bind(idx)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clears every `resend_flag` for the nym, run once per scheduler tick
/// before the oldest row is processed (§4.8 step 4).
pub async fn clear_resend_flags_for_nym(pool: &SqlitePool, nym_mapped_id: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE out_queue SET resend_flag = 0 WHERE nym_mapped_id = ?")
        .bind(nym_mapped_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_out_queue_row(pool: &SqlitePool, idx: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM out_queue WHERE idx = ?")
        .bind(idx)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── InQueue ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InQueueRow {
    pub idx: i64,
    pub my_id: String,
    pub contact_id: Option<String>,
    pub received_at: i64,
    pub payload: Vec<u8>,
    pub form: String,
}

pub async fn insert_in_queue_row(
    pool: &SqlitePool,
    my_id: &str,
    received_at: i64,
    payload: &[u8],
    form: &str,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO in_queue (my_id, contact_id, received_at, payload, form) VALUES (?, NULL, ?, ?, ?)",
    )
    .bind(my_id)
    .bind(received_at)
    .bind(payload)
    .bind(form)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_in_queue_rows(pool: &SqlitePool) -> Result<Vec<InQueueRow>, DbError> {
    Ok(
        sqlx::query_as::<_, InQueueRow>("SELECT * FROM in_queue ORDER BY idx ASC")
            .fetch_all(pool)
            .await?,
    )
}

pub async fn update_in_queue_payload(
    pool: &SqlitePool,
    idx: i64,
    payload: &[u8],
    form: &str,
    contact_id: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE in_queue SET payload = ?, form = ?, contact_id = ? WHERE idx = ?")
        .bind(payload)
        .bind(form)
        .bind(contact_id)
        .bind(idx)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_in_queue_row(pool: &SqlitePool, idx: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM in_queue WHERE idx = ?")
        .bind(idx)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── MessageID cache ─────────────────────────────────────────────────────────

pub async fn has_message_id(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
    message_id: &[u8],
) -> Result<bool, DbError> {
    let row = sqlx::query(
        "SELECT 1 FROM message_id_cache WHERE my_id = ? AND contact_id = ? AND message_id = ?",
    )
    .bind(my_id)
    .bind(contact_id)
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn insert_message_id(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
    message_id: &[u8],
) -> Result<(), DbError> {
    let seq_row = sqlx::query(
        "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM message_id_cache WHERE my_id = ? AND contact_id = ?",
    )
    .bind(my_id)
    .bind(contact_id)
    .fetch_one(pool)
    .await?;
    let next_seq: i64 = seq_row.get("next_seq");

    sqlx::query(
        "INSERT OR IGNORE INTO message_id_cache (my_id, contact_id, message_id, seq) VALUES (?, ?, ?, ?)",
    )
    .bind(my_id)
    .bind(contact_id)
    .bind(message_id)
    .bind(next_seq)
    .execute(pool)
    .await?;
    Ok(())
}

/// Trims every cache entry strictly older (lower `seq`) than `message_id`'s
/// own sequence number, once a known ID is re-observed (§4.8 step 1).
pub async fn trim_older_than(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
    message_id: &[u8],
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM message_id_cache\n         WHERE my_id = ? AND contact_id = ? AND seq < (\n             SELECT seq FROM message_id_cache WHERE my_id = ? AND contact_id = ? AND message_id = ?\n         )",
    )
    .bind(my_id)
    .bind(contact_id)
    .bind(my_id)
    .bind(contact_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ─── Contacts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactList {
    White,
    Gray,
    Black,
}

impl ContactList {
    fn as_str(&self) -> &'static str {
        match self {
            ContactList::White => "white",
            ContactList::Gray => "gray",
            ContactList::Black => "black",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "white" => Some(ContactList::White),
            "gray" => Some(ContactList::Gray),
            "black" => Some(ContactList::Black),
            _ => None,
        }
    }
}

pub async fn get_contact_list(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
) -> Result<Option<ContactList>, DbError> {
    let row = sqlx::query("SELECT list FROM contacts WHERE my_id = ? AND contact_id = ?")
        .bind(my_id)
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.and_then(|r| ContactList::from_str(r.get::<String, _>("list").as_str())))
}

pub async fn set_contact_list(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
    list: ContactList,
    now: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO contacts (my_id, contact_id, list, added_at) VALUES (?, ?, ?, ?)\n         ON CONFLICT(my_id, contact_id) DO UPDATE SET list = excluded.list",
    )
    .bind(my_id)
    .bind(contact_id)
    .bind(list.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

// ─── Sessions ────────────────────────────────────────────────────────────────

pub async fn save_session_row(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
    root_key_hash: &[u8; 32],
    send_chain_key: &[u8; 32],
    recv_chain_key: &[u8; 32],
    send_pub_hashes: &[u8],
    recv_pub_hashes: &[u8],
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO sessions (my_id, contact_id, root_key_hash, send_chain_key, recv_chain_key, send_pub_hashes, recv_pub_hashes)\n         VALUES (?, ?, ?, ?, ?, ?, ?)\n         ON CONFLICT(my_id, contact_id) DO UPDATE SET\n           root_key_hash = excluded.root_key_hash,\n           send_chain_key = excluded.send_chain_key,\n           recv_chain_key = excluded.recv_chain_key,\n           send_pub_hashes = excluded.send_pub_hashes,\n           recv_pub_hashes = excluded.recv_pub_hashes",
    )
    .bind(my_id)
    .bind(contact_id)
    .bind(root_key_hash.as_slice())
    .bind(send_chain_key.as_slice())
    .bind(recv_chain_key.as_slice())
    .bind(send_pub_hashes)
    .bind(recv_pub_hashes)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub root_key_hash: Vec<u8>,
    pub send_chain_key: Vec<u8>,
    pub recv_chain_key: Vec<u8>,
    pub send_pub_hashes: Vec<u8>,
    pub recv_pub_hashes: Vec<u8>,
}

pub async fn load_session_row(
    pool: &SqlitePool,
    my_id: &str,
    contact_id: &str,
) -> Result<Option<SessionRow>, DbError> {
    Ok(sqlx::query_as::<_, SessionRow>(
        "SELECT root_key_hash, send_chain_key, recv_chain_key, send_pub_hashes, recv_pub_hashes\n         FROM sessions WHERE my_id = ? AND contact_id = ?",
    )
    .bind(my_id)
    .bind(contact_id)
    .fetch_optional(pool)
    .await?)
}

// ─── Mix keys ────────────────────────────────────────────────────────────────

pub async fn save_mix_key(
    pool: &SqlitePool,
    public_key: &[u8; 32],
    private_key: &[u8; 32],
    expire: i64,
    mix_address: &str,
    token_pub: &[u8; 32],
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO mix_keys (public_key, private_key, expire, mix_address, token_pub) VALUES (?, ?, ?, ?, ?)\n         ON CONFLICT(public_key) DO UPDATE SET expire = excluded.expire",
    )
    .bind(public_key.as_slice())
    .bind(private_key.as_slice())
    .bind(expire)
    .bind(mix_address)
    .bind(token_pub.as_slice())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn purge_expired_mix_keys(pool: &SqlitePool, now: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM mix_keys WHERE expire < ?")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── Key-server capabilities cache ──────────────────────────────────────────

pub async fn save_keyserver_capabilities(
    pool: &SqlitePool,
    domain: &str,
    methods_json: &str,
    fetched_at: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO keyserver_capabilities (domain, methods_json, fetched_at) VALUES (?, ?, ?)\n         ON CONFLICT(domain) DO UPDATE SET methods_json = excluded.methods_json, fetched_at = excluded.fetched_at",
    )
    .bind(domain)
    .bind(methods_json)
    .bind(fetched_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_keyserver_capabilities(
    pool: &SqlitePool,
    domain: &str,
) -> Result<Option<(String, i64)>, DbError> {
    let row = sqlx::query("SELECT methods_json, fetched_at FROM keyserver_capabilities WHERE domain = ?")
        .bind(domain)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| (r.get("methods_json"), r.get("fetched_at"))))
}

// ─── Hash-chain cache ────────────────────────────────────────────────────────

pub async fn save_hash_chain_entry(
    pool: &SqlitePool,
    position: i64,
    entry_bytes: &[u8],
    known_hash: &[u8; 32],
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO hash_chain_cache (position, entry_bytes, known_hash) VALUES (?, ?, ?)\n         ON CONFLICT(position) DO NOTHING",
    )
    .bind(position)
    .bind(entry_bytes)
    .bind(known_hash.as_slice())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_hash_chain_entries(pool: &SqlitePool) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
    let rows = sqlx::query("SELECT entry_bytes, known_hash FROM hash_chain_cache ORDER BY position ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("entry_bytes"), r.get("known_hash")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn out_queue_roundtrip_and_ordering() {
        let pool = test_pool().await;
        insert_out_queue_row(
            &pool,
            "mix@example.org",
            b"id1",
            b"payload1",
            "b64-1",
            0,
            100,
            1,
            "alice@mute.berlin",
            "bob@mute.berlin",
            b"hello",
            true,
        )
        .await
        .unwrap();
        insert_out_queue_row(
            &pool,
            "mix@example.org",
            b"id2",
            b"payload2",
            "b64-2",
            0,
            100,
            2,
            "alice@mute.berlin",
            "bob@mute.berlin",
            b"world",
            true,
        )
        .await
        .unwrap();
        let oldest = oldest_out_queue_row(&pool).await.unwrap().unwrap();
        assert_eq!(oldest.msg_id, b"id1");
        assert_eq!(oldest.stage, "encrypted");
    }

    #[tokio::test]
    async fn permanent_failure_retracts_row_back_to_to_send() {
        let pool = test_pool().await;
        insert_out_queue_row(
            &pool,
            "mix@example.org",
            b"id1",
            b"payload1",
            "b64-1",
            0,
            100,
            1,
            "alice@mute.berlin",
            "bob@mute.berlin",
            b"hello",
            true,
        )
        .await
        .unwrap();
        let row = oldest_out_queue_row(&pool).await.unwrap().unwrap();
        retract_out_queue_row(&pool, &row, 2).await.unwrap();

        assert!(oldest_out_queue_row(&pool).await.unwrap().is_none());
        let to_send = list_to_send(&pool).await.unwrap();
        assert_eq!(to_send.len(), 1);
        assert_eq!(to_send[0].plaintext, b"hello");
        assert_eq!(to_send[0].to_id, "bob@mute.berlin");
    }

    #[tokio::test]
    async fn message_id_cache_trims_older_entries() {
        let pool = test_pool().await;
        insert_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m1")
            .await
            .unwrap();
        insert_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m2")
            .await
            .unwrap();
        insert_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m3")
            .await
            .unwrap();
        trim_older_than(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m2")
            .await
            .unwrap();
        assert!(!has_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m1")
            .await
            .unwrap());
        assert!(has_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m2")
            .await
            .unwrap());
        assert!(has_message_id(&pool, "alice@mute.berlin", "bob@mute.berlin", b"m3")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn contact_list_transitions() {
        let pool = test_pool().await;
        set_contact_list(&pool, "alice@mute.berlin", "bob@mute.berlin", ContactList::Gray, 1)
            .await
            .unwrap();
        assert_eq!(
            get_contact_list(&pool, "alice@mute.berlin", "bob@mute.berlin")
                .await
                .unwrap(),
            Some(ContactList::Gray)
        );
        set_contact_list(&pool, "alice@mute.berlin", "bob@mute.berlin", ContactList::White, 2)
            .await
            .unwrap();
        assert_eq!(
            get_contact_list(&pool, "alice@mute.berlin", "bob@mute.berlin")
                .await
                .unwrap(),
            Some(ContactList::White)
        );
    }
}
