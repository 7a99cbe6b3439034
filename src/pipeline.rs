//! Message pipeline (§3.4, §4.7, §4.8): the client-to-client crypto step
//! ("mutecrypt"), the outbound `ToSend → Encrypted → Enveloped →
//! Delivered|Resend` state machine, and the inbound
//! `Fetched → Unwrapped → Decrypted|Dropped` state machine.
//!
//! Grounded the way the teacher's `encryption.rs` and `sync.rs` split the
//! work: a pure crypto step (here: `encrypt_for_recipient`/`open_from_sender`)
//! and a separate queue-driving loop that calls it, both behind `db.rs` rows.

use ed25519_dalek::SigningKey;
use thiserror::Error;

use crate::db::{self, ContactList, DbError, OutQueueRow};
use crate::envelope::{self, ClientMixHeader, EnvelopeError};
use crate::identity::UidMessage;
use crate::nymaddress::{self, AddressTemplate, NymAddress, NymAddressError};
use crate::primitives::{
    aes_gcm_open, aes_gcm_seal, sha256, sign, verify, x25519_base, x25519_dh, PrimitiveError, Rand,
};
use crate::session::{advance_chain_key, advance_root_key_hash, SessionError, SessionStore};
use crate::transport::{MixClient, SubmitOutcome, TransportError};
use crate::wallet::{get_token_with_retry, TokenOracle, WalletError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("nym address error: {0}")]
    NymAddress(#[from] NymAddressError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("primitive error: {0}")]
    Primitive(#[from] PrimitiveError),
    #[error("AES-GCM open failed")]
    Aead,
    #[error("no local private key matches this message's recipient hash — not ours to open")]
    NoPreHeaderKey,
    #[error("nym address does not map to our mailbox — dropped")]
    WrongMailbox,
    #[error("signature verify failed")]
    SignatureVerifyFailed,
}

// ─── mutecrypt: client-to-client encrypt/decrypt (§3.4, §4.7) ──────────────

/// `SENDERIDENTITY ‖ SIGNATURE? ‖ payload`, AEAD-protected so a mix never
/// sees it — only the recipient, after opening the outer layers, does.
struct InnerPlaintext {
    sender_identity: String,
    signature: Option<[u8; 64]>,
    payload: Vec<u8>,
}

impl InnerPlaintext {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let id_bytes = self.sender_identity.as_bytes();
        buf.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(id_bytes);
        match self.signature {
            None => buf.push(0x00),
            Some(sig) => {
                buf.push(0x01);
                buf.extend_from_slice(&sig);
            }
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.len() < 2 {
            return Err(PipelineError::Aead);
        }
        let id_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let mut off = 2;
        if bytes.len() < off + id_len + 1 {
            return Err(PipelineError::Aead);
        }
        let sender_identity =
            String::from_utf8(bytes[off..off + id_len].to_vec()).map_err(|_| PipelineError::Aead)?;
        off += id_len;
        let signature = match bytes[off] {
            0x00 => {
                off += 1;
                None
            }
            0x01 => {
                if bytes.len() < off + 1 + 64 {
                    return Err(PipelineError::Aead);
                }
                let sig: [u8; 64] = bytes[off + 1..off + 65].try_into().unwrap();
                off += 65;
                Some(sig)
            }
            _ => return Err(PipelineError::Aead),
        };
        Ok(Self {
            sender_identity,
            signature,
            payload: bytes[off..].to_vec(),
        })
    }
}

/// Encrypts `plaintext` from `my_id` to the holder of `recipient_key_entry`
/// (the `KeyInit` resolved via `SessionStore::get_public_key_entry`). Each
/// call performs a fresh curve25519 handshake — per-message forward secrecy
/// rather than a cross-message double ratchet, since the ratchet's only
/// specified role (§4.7) is message-key derivation *within* one DH output.
pub async fn encrypt_for_recipient(
    sessions: &dyn SessionStore,
    my_id: &str,
    contact_id: &str,
    recipient_pub_key: &[u8; 32],
    signing_key: Option<&SigningKey>,
    plaintext: &[u8],
    rng: &mut dyn Rand,
) -> Result<Vec<u8>, PipelineError> {
    let mut ephemeral_priv = [0u8; 32];
    rng.fill(&mut ephemeral_priv)
        .map_err(PipelineError::Primitive)?;
    let ephemeral_pub = x25519_base(&ephemeral_priv);

    let dh = x25519_dh(recipient_pub_key, &ephemeral_priv);
    let root_key_hash = advance_root_key_hash(&[0u8; 32], &dh);
    let (chain_key, message_key) = advance_chain_key(&root_key_hash);

    let recipient_pub_hash = sha256(recipient_pub_key);
    let nonce: [u8; 12] = sha256(&[ephemeral_pub.as_slice(), recipient_pub_hash.as_slice()].concat())
        [..12]
        .try_into()
        .unwrap();

    let signature = signing_key.map(|sk| sign(sk, plaintext));
    let inner = InnerPlaintext {
        sender_identity: my_id.to_string(),
        signature,
        payload: plaintext.to_vec(),
    }
    .encode();

    let ciphertext = aes_gcm_seal(&message_key, &nonce, &inner);

    sessions
        .store_session(
            my_id,
            contact_id,
            sha256(&ephemeral_pub),
            root_key_hash,
            chain_key,
            vec![sha256(&ephemeral_pub)],
            vec![],
        )
        .await;

    let mut wire = Vec::with_capacity(32 + 32 + 12 + ciphertext.len());
    wire.extend_from_slice(&ephemeral_pub);
    wire.extend_from_slice(&recipient_pub_hash);
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// The recipient-side counterpart: looks up the long-term private key entry
/// this ciphertext is addressed to, derives the same single-DH message key,
/// and opens it. `NoPreHeaderKey` means silently drop (§4.8 step 3) — it is
/// not addressed to any key we hold. The sender's signing key can only be
/// resolved once the inner plaintext names who sent it, so verification
/// happens against `sessions`' cached `UidMessage` signing keys after
/// decrypt, not before: if a signature is attached and we hold a key for
/// that sender, a mismatch is `SignatureVerifyFailed`, a hard crypto error;
/// an unknown sender's signature cannot be checked and is passed through.
pub async fn open_from_sender(
    sessions: &dyn SessionStore,
    my_id: &str,
    wire: &[u8],
) -> Result<(String, Vec<u8>, Option<[u8; 64]>), PipelineError> {
    if wire.len() < 32 + 32 + 12 {
        return Err(PipelineError::Aead);
    }
    let ephemeral_pub: [u8; 32] = wire[0..32].try_into().unwrap();
    let recipient_pub_hash: [u8; 32] = wire[32..64].try_into().unwrap();
    let nonce: [u8; 12] = wire[64..76].try_into().unwrap();
    let ciphertext = &wire[76..];

    let key_entry = sessions
        .get_private_key_entry(&recipient_pub_hash)
        .await
        .map_err(|_| PipelineError::NoPreHeaderKey)?;

    let dh = x25519_dh(&ephemeral_pub, &key_entry.priv_key);
    let root_key_hash = advance_root_key_hash(&[0u8; 32], &dh);
    let (chain_key, message_key) = advance_chain_key(&root_key_hash);

    let plaintext = aes_gcm_open(&message_key, &nonce, ciphertext).map_err(|_| PipelineError::Aead)?;
    let inner = InnerPlaintext::decode(&plaintext)?;

    if let Some(sig) = inner.signature {
        if let Some(vk) = sessions.get_verifying_key(&inner.sender_identity).await {
            if !verify(&vk, &inner.payload, &sig) {
                return Err(PipelineError::SignatureVerifyFailed);
            }
        }
    }

    sessions
        .store_session(
            my_id,
            &inner.sender_identity,
            sha256(&ephemeral_pub),
            root_key_hash,
            chain_key,
            vec![],
            vec![sha256(&ephemeral_pub)],
        )
        .await;

    Ok((inner.sender_identity, inner.payload, inner.signature))
}

// ─── Outbound state machine (§4.8) ──────────────────────────────────────────

/// `ToSend → Encrypted`: moves the oldest queued plaintext into `OutQueue`.
/// `recipient` supplies the already-resolved `(KeyEntry, NymAddress)` for
/// `to_id`'s current `KeyInit` — looking that up is the hash-chain/key-server
/// client's job, not the pipeline's.
pub async fn to_send_to_encrypted(
    pool: &sqlx::SqlitePool,
    sessions: &dyn SessionStore,
    signing_key: Option<&SigningKey>,
    recipient_pub_key: &[u8; 32],
    nym_address: &NymAddress,
    rng: &mut dyn Rand,
) -> Result<bool, PipelineError> {
    let pending = db::list_to_send(pool).await?;
    let Some(row) = pending.into_iter().next() else {
        return Ok(false);
    };

    let ciphertext = encrypt_for_recipient(
        sessions,
        &row.from_id,
        &row.to_id,
        recipient_pub_key,
        signing_key,
        &row.plaintext,
        rng,
    )
    .await?;

    let msg_id = sha256(&ciphertext);
    let now = row.created_at;
    db::insert_out_queue_row(
        pool,
        &row.to_id,
        &msg_id,
        &ciphertext,
        &base64_encode(&nym_address.encode()),
        row.min_delay,
        row.max_delay,
        now,
        &row.from_id,
        &row.to_id,
        &row.plaintext,
        row.sign_flag,
    )
    .await?;
    db::delete_to_send(pool, row.row_id).await?;
    Ok(true)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, PipelineError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(s)
        .map_err(|_| PipelineError::NymAddress(NymAddressError::Decode))
}

/// `Encrypted → Enveloped`: fetches a payment token and wraps the ciphertext
/// in a client-mix `Relay` envelope. On failure, releases the token and
/// leaves the row at `encrypted`.
pub async fn encrypted_to_enveloped(
    pool: &sqlx::SqlitePool,
    oracle: &dyn TokenOracle,
    row: &OutQueueRow,
    rng: &mut dyn Rand,
) -> Result<(), PipelineError> {
    let nym_address_bytes = base64_decode(&row.nym_address_b64)?;
    let nym_address = NymAddress::decode(&nym_address_bytes)?;

    let token = get_token_with_retry(oracle, "Message", &nym_address.token_pub_key).await?;

    let header = ClientMixHeader::Relay {
        nym_address: nym_address.clone(),
        revoke_id: None,
        token: Some(token.bytes.clone()),
        payload: row.payload.clone(),
    };
    let envelope = match envelope::encrypt(&nym_address.mix_pub_key, &header, rng) {
        Ok(bytes) => bytes,
        Err(e) => {
            oracle.unlock_token(&token).await;
            return Err(e.into());
        }
    };

    db::set_out_queue_payload_and_stage(pool, row.idx, &envelope, "enveloped").await?;
    Ok(())
}

/// `Enveloped → Delivered|Resend|retract-to-ToSend`: submits to the mix
/// named by the row's nym address.
pub async fn enveloped_to_delivered(
    pool: &sqlx::SqlitePool,
    mix_client: &dyn MixClient,
    row: &OutQueueRow,
    now: i64,
) -> Result<SubmitOutcome, PipelineError> {
    let nym_address_bytes = base64_decode(&row.nym_address_b64)?;
    let nym_address = NymAddress::decode(&nym_address_bytes)?;

    let outcome = mix_client.submit(&nym_address.mix_address, &row.payload).await?;
    match &outcome {
        SubmitOutcome::Delivered => {
            db::delete_out_queue_row(pool, row.idx).await?;
        }
        SubmitOutcome::Resend(_) => {
            db::set_resend_flag(pool, row.idx).await?;
        }
        SubmitOutcome::Permanent(_) => {
            db::retract_out_queue_row(pool, row, now).await?;
        }
    }
    Ok(outcome)
}

/// One scheduler tick (§4.8 step 4): clear stale resend flags for `nym`,
/// process the oldest row, report whether a row was present at all.
pub async fn scheduler_tick(
    pool: &sqlx::SqlitePool,
    mix_client: &dyn MixClient,
    oracle: &dyn TokenOracle,
    nym_mapped_id: &str,
    now: i64,
    rng: &mut dyn Rand,
) -> Result<Option<SubmitOutcome>, PipelineError> {
    db::clear_resend_flags_for_nym(pool, nym_mapped_id).await?;
    let Some(row) = db::oldest_out_queue_row(pool).await? else {
        return Ok(None);
    };
    if row.stage == "encrypted" {
        encrypted_to_enveloped(pool, oracle, &row, rng).await?;
        return Ok(None);
    }
    let refreshed = db::oldest_out_queue_row(pool).await?.unwrap_or(row);
    let outcome = enveloped_to_delivered(pool, mix_client, &refreshed, now).await?;
    Ok(Some(outcome))
}

// ─── Inbound state machine (§4.8) ──────────────────────────────────────────

/// `Fetched → Unwrapped`: unwraps the nym-address recipient-side layer,
/// dropping anything that doesn't address our mailbox.
pub fn unwrap_envelope(
    template: &AddressTemplate,
    delivered: &[u8],
    mailbox_address: &[u8],
    expected_my_id_hash: &[u8; 32],
) -> Result<Vec<u8>, PipelineError> {
    let (_, cipher) = nymaddress::recipient_open(template, delivered, mailbox_address, expected_my_id_hash)
        .map_err(|e| match e {
            NymAddressError::WrongRecipient => PipelineError::WrongMailbox,
            other => other.into(),
        })?;
    Ok(cipher)
}

/// `Cipher → Decrypted|Dropped`: opens the client-to-client ciphertext and
/// applies the gray/black/white contact-list policy of §4.8 step 3.
pub async fn decrypt_and_classify(
    pool: &sqlx::SqlitePool,
    sessions: &dyn SessionStore,
    my_id: &str,
    cipher: &[u8],
    now: i64,
) -> Result<Option<(String, Vec<u8>, Option<[u8; 64]>)>, PipelineError> {
    let (sender_identity, payload, signature) =
        match open_from_sender(sessions, my_id, cipher).await {
            Ok(v) => v,
            Err(PipelineError::NoPreHeaderKey) => return Ok(None),
            Err(e) => return Err(e),
        };

    let list = db::get_contact_list(pool, my_id, &sender_identity).await?;
    match list {
        Some(ContactList::Black) => Ok(None),
        Some(ContactList::White) | Some(ContactList::Gray) => {
            Ok(Some((sender_identity, payload, signature)))
        }
        None => {
            db::set_contact_list(pool, my_id, &sender_identity, ContactList::Gray, now).await?;
            Ok(Some((sender_identity, payload, signature)))
        }
    }
}

/// One full inbound tick: consults the `MessageID` cache, persists new
/// envelopes, unwraps, decrypts, classifies, and commits to `MessageStore`
/// (or drops), per §4.8's inbound transitions.
#[allow(clippy::too_many_arguments)]
pub async fn process_fetched_message(
    pool: &sqlx::SqlitePool,
    sessions: &dyn SessionStore,
    template: &AddressTemplate,
    my_id: &str,
    mailbox_address: &[u8],
    expected_my_id_hash: &[u8; 32],
    message_id: &[u8],
    delivered_envelope: &[u8],
    now: i64,
) -> Result<(), PipelineError> {
    if db::has_message_id(pool, my_id, "*", message_id).await? {
        db::trim_older_than(pool, my_id, "*", message_id).await?;
        return Ok(());
    }

    let idx = db::insert_in_queue_row(pool, my_id, now, delivered_envelope, "envelope").await?;
    db::insert_message_id(pool, my_id, "*", message_id).await?;

    let cipher = match unwrap_envelope(template, delivered_envelope, mailbox_address, expected_my_id_hash) {
        Ok(c) => c,
        Err(_) => {
            db::delete_in_queue_row(pool, idx).await?;
            return Ok(());
        }
    };
    db::update_in_queue_payload(pool, idx, &cipher, "cleartext_cipher", None).await?;

    let classified = decrypt_and_classify(pool, sessions, my_id, &cipher, now).await?;

    db::delete_in_queue_row(pool, idx).await?;
    if let Some((sender_identity, plaintext, signature)) = classified {
        db::insert_to_send(
            pool,
            &sender_identity,
            my_id,
            &plaintext,
            true,
            0,
            0,
            now,
            signature.as_ref().map(|s| s.as_slice()),
        )
        .await?;
    }
    Ok(())
}

/// Resumes any `in_queue` rows left behind by a crash between their
/// insertion in `process_fetched_message` and the matching delete (§4.8
/// step 1/commit). Rows are drained oldest-first, matching the spec's single
/// FIFO cursor across all nyms, but only rows for `my_id` are actionable
/// here since unwrapping an `envelope` row needs that nym's template.
#[allow(clippy::too_many_arguments)]
pub async fn recover_in_queue(
    pool: &sqlx::SqlitePool,
    sessions: &dyn SessionStore,
    template: &AddressTemplate,
    my_id: &str,
    mailbox_address: &[u8],
    expected_my_id_hash: &[u8; 32],
    now: i64,
) -> Result<usize, PipelineError> {
    let mut recovered = 0;
    for row in db::list_in_queue_rows(pool).await? {
        if row.my_id != my_id {
            continue;
        }
        let cipher = if row.form == "envelope" {
            match unwrap_envelope(template, &row.payload, mailbox_address, expected_my_id_hash) {
                Ok(c) => c,
                Err(_) => {
                    db::delete_in_queue_row(pool, row.idx).await?;
                    continue;
                }
            }
        } else {
            row.payload
        };

        let classified = decrypt_and_classify(pool, sessions, my_id, &cipher, now).await?;
        db::delete_in_queue_row(pool, row.idx).await?;
        if let Some((sender_identity, plaintext, signature)) = classified {
            db::insert_to_send(
                pool,
                &sender_identity,
                my_id,
                &plaintext,
                true,
                0,
                0,
                now,
                signature.as_ref().map(|s| s.as_slice()),
            )
            .await?;
        }
        recovered += 1;
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn encrypt_then_open_recovers_identity_and_payload() {
        let sessions = InMemorySessionStore::new();
        let signing_key = SigningKey::generate(&mut OsRng);

        let mut recipient_priv = [0u8; 32];
        crate::primitives::OsRand.fill(&mut recipient_priv).unwrap();
        let recipient_pub = x25519_base(&recipient_priv);
        sessions
            .seed_private_key_entry(
                sha256(&recipient_pub),
                crate::session::KeyEntry {
                    priv_key: recipient_priv,
                    pub_key: recipient_pub,
                },
            )
            .await;

        let wire = encrypt_for_recipient(
            &sessions,
            "alice@mute.berlin",
            "bob@mute.berlin",
            &recipient_pub,
            Some(&signing_key),
            b"hello bob",
            &mut crate::primitives::OsRand,
        )
        .await
        .unwrap();

        sessions
            .seed_verifying_key("alice@mute.berlin", signing_key.verifying_key())
            .await;

        let (sender_identity, payload, signature) =
            open_from_sender(&sessions, "bob@mute.berlin", &wire).await.unwrap();

        assert_eq!(sender_identity, "alice@mute.berlin");
        assert_eq!(payload, b"hello bob");
        assert!(signature.is_some());
    }

    #[tokio::test]
    async fn open_with_unknown_recipient_hash_is_no_pre_header_key() {
        let sessions = InMemorySessionStore::new();
        let wire = vec![0u8; 76 + 16];
        let err = open_from_sender(&sessions, "bob@mute.berlin", &wire)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoPreHeaderKey));
    }

    #[tokio::test]
    async fn forged_signature_from_a_known_contact_is_rejected() {
        let sessions = InMemorySessionStore::new();
        let signing_key = SigningKey::generate(&mut OsRng);
        let forger_key = SigningKey::generate(&mut OsRng);

        let mut recipient_priv = [0u8; 32];
        crate::primitives::OsRand.fill(&mut recipient_priv).unwrap();
        let recipient_pub = x25519_base(&recipient_priv);
        sessions
            .seed_private_key_entry(
                sha256(&recipient_pub),
                crate::session::KeyEntry {
                    priv_key: recipient_priv,
                    pub_key: recipient_pub,
                },
            )
            .await;
        sessions
            .seed_verifying_key("alice@mute.berlin", signing_key.verifying_key())
            .await;

        let wire = encrypt_for_recipient(
            &sessions,
            "alice@mute.berlin",
            "bob@mute.berlin",
            &recipient_pub,
            Some(&forger_key),
            b"hello bob",
            &mut crate::primitives::OsRand,
        )
        .await
        .unwrap();

        let err = open_from_sender(&sessions, "bob@mute.berlin", &wire)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SignatureVerifyFailed));
    }

    #[tokio::test]
    async fn recover_in_queue_resumes_a_row_left_by_a_crash() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();

        let sessions = InMemorySessionStore::new();
        let signing_key = SigningKey::generate(&mut OsRng);

        let mut recipient_priv = [0u8; 32];
        crate::primitives::OsRand.fill(&mut recipient_priv).unwrap();
        let recipient_pub = x25519_base(&recipient_priv);
        sessions
            .seed_private_key_entry(
                sha256(&recipient_pub),
                crate::session::KeyEntry {
                    priv_key: recipient_priv,
                    pub_key: recipient_pub,
                },
            )
            .await;
        sessions
            .seed_verifying_key("alice@mute.berlin", signing_key.verifying_key())
            .await;

        let wire = encrypt_for_recipient(
            &sessions,
            "alice@mute.berlin",
            "bob@mute.berlin",
            &recipient_pub,
            Some(&signing_key),
            b"hello bob",
            &mut crate::primitives::OsRand,
        )
        .await
        .unwrap();

        // simulates a crash right after process_fetched_message staged the
        // decrypted cipher but before it could delete the row
        db::insert_in_queue_row(&pool, "bob@mute.berlin", 1000, &wire, "cleartext_cipher")
            .await
            .unwrap();

        let template = AddressTemplate { secret: [0u8; 32] };
        let recovered = recover_in_queue(
            &pool,
            &sessions,
            &template,
            "bob@mute.berlin",
            b"unused",
            &[0u8; 32],
            1001,
        )
        .await
        .unwrap();

        assert_eq!(recovered, 1);
        assert!(db::list_in_queue_rows(&pool).await.unwrap().is_empty());
        let sent = db::list_to_send(&pool).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].plaintext, b"hello bob");
    }
}
