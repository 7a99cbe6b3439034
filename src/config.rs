//! Config client (§4.10): priority-ordered bootstrap server list, each
//! candidate gated by `signed_map::certify` before its config is trusted.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::primitives::{sha512, Rand};
use crate::signed_map::{self, SignedMapError};

const INITIAL_SKEW_SECS: u64 = 23 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no candidate server produced a certified config")]
    NoWorkingServer,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("signed config failed to decode: {0}")]
    Decode(String),
    #[error("certify rejected the signed config: {0}")]
    Certify(#[from] SignedMapError),
    #[error("advertised CACertHash did not match the fetched CA cert's SHA-512")]
    CaCertMismatch,
}

/// `prio,host[;prio,host]*`, parsed into `(priority, host)` pairs.
pub fn parse_url_list(spec: &str) -> Vec<(u32, String)> {
    spec.split(';')
        .filter_map(|entry| {
            let (prio, host) = entry.split_once(',')?;
            let prio: u32 = prio.trim().parse().ok()?;
            Some((prio, host.trim().to_string()))
        })
        .collect()
}

/// Sorts by ascending priority; within equal priorities, shuffles uniformly
/// using the injected `rng` rather than a global seeded source (§9's
/// "accept an injected RNG" redesign hint).
pub fn order_url_list(mut entries: Vec<(u32, String)>, rng: &mut dyn Rand) -> Vec<(u32, String)> {
    entries.sort_by_key(|(prio, _)| *prio);
    let mut start = 0;
    while start < entries.len() {
        let prio = entries[start].0;
        let mut end = start + 1;
        while end < entries.len() && entries[end].0 == prio {
            end += 1;
        }
        fisher_yates(&mut entries[start..end], rng);
        start = end;
    }
    entries
}

fn fisher_yates(slice: &mut [(u32, String)], rng: &mut dyn Rand) {
    for i in (1..slice.len()).rev() {
        let mut byte = [0u8; 1];
        if rng.fill(&mut byte).is_err() {
            return;
        }
        let j = (byte[0] as usize) % (i + 1);
        slice.swap(i, j);
    }
}

#[derive(Debug, Deserialize)]
struct SignedConfigDto {
    #[serde(rename = "Config")]
    config: BTreeMap<String, String>,
    #[serde(rename = "Signature")]
    signature: String,
    #[serde(rename = "SignDate")]
    sign_date: u64,
}

#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn get_config(&self, host: &str) -> Result<Vec<u8>, ConfigError>;
    async fn get_cacert(&self, host: &str) -> Result<Vec<u8>, ConfigError>;
}

pub struct ConfigClient {
    urls: Mutex<Vec<(u32, String)>>,
    pubkey: VerifyingKey,
    last_sign_date: Mutex<Option<u64>>,
    cached_ca: Mutex<Option<Vec<u8>>>,
}

impl ConfigClient {
    pub fn new(urls: Vec<(u32, String)>, pubkey: VerifyingKey) -> Self {
        Self {
            urls: Mutex::new(urls),
            pubkey,
            last_sign_date: Mutex::new(None),
            cached_ca: Mutex::new(None),
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs()
    }

    /// Iterates the ordered URL list, stopping at the first candidate whose
    /// signed config certifies; on success, rotates it to the front.
    pub async fn fetch_and_verify(
        &self,
        fetcher: &dyn ConfigFetcher,
    ) -> Result<BTreeMap<String, String>, ConfigError> {
        let urls = self.urls.lock().await.clone();
        for (position, (_, host)) in urls.iter().enumerate() {
            match self.try_one(fetcher, host).await {
                Ok(config) => {
                    let mut guard = self.urls.lock().await;
                    let len = guard.len();
                    let entry = guard.remove(position.min(len.saturating_sub(1)));
                    guard.insert(0, entry);
                    return Ok(config);
                }
                Err(_) => continue,
            }
        }
        Err(ConfigError::NoWorkingServer)
    }

    async fn try_one(
        &self,
        fetcher: &dyn ConfigFetcher,
        host: &str,
    ) -> Result<BTreeMap<String, String>, ConfigError> {
        let bytes = fetcher.get_config(host).await?;
        let dto: SignedConfigDto =
            serde_json::from_slice(&bytes).map_err(|e| ConfigError::Decode(e.to_string()))?;
        let signature_vec = base64::engine::general_purpose::STANDARD
            .decode(&dto.signature)
            .map_err(|e| ConfigError::Decode(e.to_string()))?;
        let signature: [u8; 64] = signature_vec
            .try_into()
            .map_err(|_| ConfigError::Decode("Signature must be 64 bytes".into()))?;

        let mut last_sign_date_guard = self.last_sign_date.lock().await;
        let last_sign_date = last_sign_date_guard.unwrap_or_else(|| Self::now().saturating_sub(INITIAL_SKEW_SECS));

        signed_map::certify(last_sign_date, &self.pubkey, &dto.config, dto.sign_date, &signature)?;
        *last_sign_date_guard = Some(dto.sign_date);
        drop(last_sign_date_guard);

        if let Some(expected_hex) = dto.config.get("CACertHash") {
            let expected = hex::decode(expected_hex).map_err(|e| ConfigError::Decode(e.to_string()))?;
            let mut cached = self.cached_ca.lock().await;
            let needs_fetch = match cached.as_ref() {
                Some(ca) => sha512(ca).as_slice() != expected.as_slice(),
                None => true,
            };
            if needs_fetch {
                let cacert = fetcher.get_cacert(host).await?;
                if sha512(&cacert).as_slice() != expected.as_slice() {
                    return Err(ConfigError::CaCertMismatch);
                }
                *cached = Some(cacert);
            }
        }

        Ok(dto.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{sign, OsRand};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    struct FakeFetcher {
        bodies: std::collections::HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl ConfigFetcher for FakeFetcher {
        async fn get_config(&self, host: &str) -> Result<Vec<u8>, ConfigError> {
            self.bodies
                .get(host)
                .cloned()
                .ok_or_else(|| ConfigError::Fetch("no such host".into()))
        }
        async fn get_cacert(&self, _host: &str) -> Result<Vec<u8>, ConfigError> {
            Ok(vec![])
        }
    }

    fn signed_body(signing_key: &SigningKey, map: &BTreeMap<String, String>, sign_date: u64) -> Vec<u8> {
        let sig = signed_map::sign_map(signing_key, map, sign_date);
        let dto = serde_json::json!({
            "Config": map,
            "Signature": base64::engine::general_purpose::STANDARD.encode(sig),
            "SignDate": sign_date,
        });
        serde_json::to_vec(&dto).unwrap()
    }

    #[test]
    fn parses_and_orders_by_priority() {
        let entries = parse_url_list("2,b.example.org;1,a.example.org");
        let ordered = order_url_list(entries, &mut OsRand);
        assert_eq!(ordered[0].1, "a.example.org");
        assert_eq!(ordered[1].1, "b.example.org");
    }

    #[tokio::test]
    async fn falls_through_to_second_candidate_on_failure() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut map = BTreeMap::new();
        map.insert("bootstrap".into(), "https://mute.berlin".into());
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        let mut bodies = std::collections::HashMap::new();
        bodies.insert("b.example.org".into(), signed_body(&signing_key, &map, now));

        let fetcher = FakeFetcher { bodies };
        let client = ConfigClient::new(
            vec![(1, "a.example.org".into()), (2, "b.example.org".into())],
            signing_key.verifying_key(),
        );
        let config = client.fetch_and_verify(&fetcher).await.unwrap();
        assert_eq!(config.get("bootstrap").unwrap(), "https://mute.berlin");

        let urls = client.urls.lock().await;
        assert_eq!(urls[0].1, "b.example.org");
    }

    #[tokio::test]
    async fn all_candidates_failing_is_an_error() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let _ = sign(&signing_key, b"unused");
        let fetcher = FakeFetcher {
            bodies: std::collections::HashMap::new(),
        };
        let client = ConfigClient::new(vec![(1, "a.example.org".into())], signing_key.verifying_key());
        let err = client.fetch_and_verify(&fetcher).await.unwrap_err();
        assert!(matches!(err, ConfigError::NoWorkingServer));
    }
}
