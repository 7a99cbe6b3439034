//! Wire calls (§6.1, §6.2): typed DTOs and the production/fake client pairs
//! for the key server, account server, and mix.
//!
//! The teacher has no direct analogue for typed JSON-RPC DTOs (its own
//! network layer speaks p2panda/iroh), so this module is grounded on the
//! pack's broader `reqwest`-based request/response idiom; it plays the role
//! `onion.rs`/`network.rs` play in the teacher for "how bytes leave the
//! process," generalized into typed request/response structs per §9's
//! "typed DTOs per method" redesign hint.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashchain::{HashChainEntry, HashChainError, KeyServerClient, UidMessageReply};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP transport failed: {0}")]
    Http(String),
    #[error("response failed to decode: {0}")]
    Decode(String),
    #[error("server reported an error: {0}")]
    Server(String),
}

// ─── Key server DTOs (§6.2) ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HcEntryDto {
    pub entry_hex: String,
    pub known_hash_hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchLastResponse {
    pub hc_entry: HcEntryDto,
    pub hc_pos: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRangeResponse {
    pub hc_entries: Vec<HcEntryDto>,
    pub hc_first_pos: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupUidResponse {
    pub hc_positions: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UidMessageReplyDto {
    pub uid_message_encrypted_b64: String,
    pub hash_chain_entry_hex: String,
    pub hash_chain_pos: u64,
    pub server_signature_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilitiesDto {
    pub methods: Vec<String>,
    pub tkn_pub_key_hex: String,
    pub sig_pub_key_hex: String,
}

fn hc_entry_from_dto(dto: &HcEntryDto) -> Result<(HashChainEntry, [u8; 32]), TransportError> {
    let entry_bytes = hex::decode(&dto.entry_hex).map_err(|e| TransportError::Decode(e.to_string()))?;
    let entry = HashChainEntry::decode(&entry_bytes).map_err(|e| TransportError::Decode(e.to_string()))?;
    let known_hash_bytes =
        hex::decode(&dto.known_hash_hex).map_err(|e| TransportError::Decode(e.to_string()))?;
    let known_hash: [u8; 32] = known_hash_bytes
        .try_into()
        .map_err(|_| TransportError::Decode("known_hash must be 32 bytes".into()))?;
    Ok((entry, known_hash))
}

/// Production key-server client speaking the JSON-RPC surface of §6.2 over
/// `reqwest`.
pub struct ReqwestKeyServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestKeyServerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, TransportError> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(&params)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Server(resp.status().to_string()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl KeyServerClient for ReqwestKeyServerClient {
    async fn fetch_last(&self) -> Result<(HashChainEntry, u64), HashChainError> {
        let resp: FetchLastResponse = self
            .call("KeyHashchain.FetchLastHashChain", serde_json::json!({}))
            .await
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        let (entry, _) =
            hc_entry_from_dto(&resp.hc_entry).map_err(|e| HashChainError::Rpc(e.to_string()))?;
        Ok((entry, resp.hc_pos))
    }

    async fn fetch_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(HashChainEntry, [u8; 32])>, HashChainError> {
        let resp: FetchRangeResponse = self
            .call(
                "KeyHashchain.FetchHashChain",
                serde_json::json!({"StartPosition": start, "EndPosition": end}),
            )
            .await
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        resp.hc_entries
            .iter()
            .map(|dto| hc_entry_from_dto(dto).map_err(|e| HashChainError::Rpc(e.to_string())))
            .collect()
    }

    async fn lookup_by_identity(&self, mapped_id: &str) -> Result<Vec<u64>, HashChainError> {
        let resp: LookupUidResponse = self
            .call(
                "KeyHashchain.LookupUID",
                serde_json::json!({"Identity": mapped_id}),
            )
            .await
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        Ok(resp.hc_positions)
    }

    async fn fetch_uid(&self, uid_index: &[u8; 32]) -> Result<UidMessageReply, HashChainError> {
        let resp: UidMessageReplyDto = self
            .call(
                "KeyRepository.FetchUID",
                serde_json::json!({"UIDIndex": hex::encode(uid_index)}),
            )
            .await
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        let uid_message_encrypted = BASE64
            .decode(&resp.uid_message_encrypted_b64)
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        let hash_chain_entry_vec =
            hex::decode(&resp.hash_chain_entry_hex).map_err(|e| HashChainError::Rpc(e.to_string()))?;
        let hash_chain_entry: [u8; 32] = hash_chain_entry_vec
            .try_into()
            .map_err(|_| HashChainError::Rpc("HASHCHAINENTRY must be 32 bytes".into()))?;
        let server_signature_vec = BASE64
            .decode(&resp.server_signature_b64)
            .map_err(|e| HashChainError::Rpc(e.to_string()))?;
        let server_signature: [u8; 64] = server_signature_vec
            .try_into()
            .map_err(|_| HashChainError::Rpc("SERVERSIGNATURE must be 64 bytes".into()))?;
        Ok(UidMessageReply {
            uid_message_encrypted,
            hash_chain_entry,
            hash_chain_pos: resp.hash_chain_pos,
            server_signature,
        })
    }
}

// ─── Account server (§6.2) ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: Vec<u8>,
    pub receive_time: u64,
    pub receive_time_nano: u64,
    pub read_time: Option<u64>,
}

#[async_trait]
pub trait AccountServerClient: Send + Sync {
    async fn load_account(&self, auth_token: &[u8], pay_token: &[u8]) -> Result<String, TransportError>;
    async fn list_messages(
        &self,
        auth_token: &[u8],
        last_receive_time: u64,
    ) -> Result<Vec<MessageMeta>, TransportError>;
    async fn fetch_message(
        &self,
        auth_token: &[u8],
        message_id: &[u8],
    ) -> Result<Vec<u8>, TransportError>;
}

// ─── Mix (§6.2) ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait MixClient: Send + Sync {
    async fn get_address_statement(&self, mix_address: &str) -> Result<Vec<u8>, TransportError>;
    async fn revoke(&self, mix_address: &str, revoke_id: &[u8; 32]) -> Result<String, TransportError>;
    /// Submits a client-mix envelope for delivery. Production speaks SMTP
    /// with STARTTLS (hard-failing when a pinned CA is set and STARTTLS is
    /// absent, per §6.2); abstracted here to a single call so the pipeline's
    /// Delivered/Resend/retract logic can be tested against a fake.
    async fn submit(&self, mix_address: &str, envelope: &[u8]) -> Result<SubmitOutcome, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    Resend(String),
    Permanent(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitResponse {
    status: String,
    detail: Option<String>,
}

/// Production mix client. §6.2 has mix submission speak SMTP with STARTTLS;
/// this crate has no SMTP dependency anywhere in its stack, so — matching
/// `ReqwestKeyServerClient`'s existing request/response idiom rather than
/// pulling in an unrelated mail crate — submission is modeled as an HTTPS
/// POST to the mix's address, classifying the JSON response's `status`
/// field into `SubmitOutcome`. Recorded as a scope simplification in
/// DESIGN.md.
pub struct ReqwestMixClient {
    http: reqwest::Client,
}

impl ReqwestMixClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Used when the host process has a pinned CA certificate configured
    /// (§6.2's "hard-fail if a pinned CA is set and STARTTLS is absent" —
    /// here, the HTTPS-transport equivalent is to trust only that CA).
    pub fn new_with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for ReqwestMixClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MixClient for ReqwestMixClient {
    async fn get_address_statement(&self, mix_address: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .http
            .get(mix_address)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Server(resp.status().to_string()));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn revoke(&self, mix_address: &str, revoke_id: &[u8; 32]) -> Result<String, TransportError> {
        let resp = self
            .http
            .post(format!("{mix_address}/revoke"))
            .json(&serde_json::json!({"RevokeID": hex::encode(revoke_id)}))
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Server(resp.status().to_string()));
        }
        resp.text().await.map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn submit(&self, mix_address: &str, envelope: &[u8]) -> Result<SubmitOutcome, TransportError> {
        let resp = self
            .http
            .post(mix_address)
            .body(envelope.to_vec())
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if resp.status().is_server_error() || resp.status().as_u16() == 429 {
            return Ok(SubmitOutcome::Resend(resp.status().to_string()));
        }
        if resp.status().is_client_error() {
            return Ok(SubmitOutcome::Permanent(resp.status().to_string()));
        }
        let parsed: SubmitResponse = resp.json().await.map_err(|e| TransportError::Decode(e.to_string()))?;
        match parsed.status.as_str() {
            "delivered" => Ok(SubmitOutcome::Delivered),
            "resend" => Ok(SubmitOutcome::Resend(parsed.detail.unwrap_or_default())),
            other => Ok(SubmitOutcome::Permanent(parsed.detail.unwrap_or_else(|| other.to_string()))),
        }
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory key-server fake backed by a list of pre-built entries,
    /// used by `hashchain.rs`'s tests and any pipeline test that needs to
    /// sync a chain without a live server.
    pub struct FakeKeyServer {
        pub entries: Vec<(HashChainEntry, [u8; 32])>,
        pub uids: Mutex<std::collections::HashMap<[u8; 32], UidMessageReply>>,
    }

    #[async_trait]
    impl KeyServerClient for FakeKeyServer {
        async fn fetch_last(&self) -> Result<(HashChainEntry, u64), HashChainError> {
            self.entries
                .last()
                .map(|(e, _)| (e.clone(), self.entries.len() as u64))
                .ok_or_else(|| HashChainError::Rpc("empty chain".into()))
        }

        async fn fetch_range(
            &self,
            start: u64,
            end: u64,
        ) -> Result<Vec<(HashChainEntry, [u8; 32])>, HashChainError> {
            Ok(self.entries[start as usize..end as usize].to_vec())
        }

        async fn lookup_by_identity(&self, _mapped_id: &str) -> Result<Vec<u64>, HashChainError> {
            Ok(vec![])
        }

        async fn fetch_uid(&self, uid_index: &[u8; 32]) -> Result<UidMessageReply, HashChainError> {
            self.uids
                .lock()
                .unwrap()
                .get(uid_index)
                .cloned()
                .ok_or_else(|| HashChainError::Rpc("no such UID".into()))
        }
    }

    pub struct FakeMixClient {
        pub outcome: SubmitOutcome,
    }

    #[async_trait]
    impl MixClient for FakeMixClient {
        async fn get_address_statement(&self, _mix_address: &str) -> Result<Vec<u8>, TransportError> {
            Ok(vec![])
        }

        async fn revoke(&self, _mix_address: &str, _revoke_id: &[u8; 32]) -> Result<String, TransportError> {
            Ok("REVOKED".into())
        }

        async fn submit(&self, _mix_address: &str, _envelope: &[u8]) -> Result<SubmitOutcome, TransportError> {
            Ok(self.outcome.clone())
        }
    }

    #[tokio::test]
    async fn fake_mix_client_reports_configured_outcome() {
        let client = FakeMixClient {
            outcome: SubmitOutcome::Resend("4xx".into()),
        };
        let outcome = client.submit("https://mix.mute.berlin/hop", b"env").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Resend("4xx".into()));
    }
}
