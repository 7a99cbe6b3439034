//! Token oracle (§5, §8 wallet-retry scenario): acquires and releases the
//! per-usage tokens the message pipeline attaches to an enveloped message.
//!
//! The retry loop is shaped like the teacher's `pkarr_publish` retry-on-tick
//! pattern generalized into an explicit backoff helper, since nothing in the
//! teacher itself retries a fallible external call with backoff.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use thiserror::Error;

const INITIAL_BACKOFF_MS: u64 = 100;
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const TOTAL_BUDGET: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("token oracle asked us to retry")]
    Retry,
    #[error("token oracle returned a final, non-retryable error: {0}")]
    Final(String),
    #[error("exhausted the 5-minute retry budget without success")]
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub bytes: Vec<u8>,
    pub owner: [u8; 32],
    pub usage: String,
}

/// Abstracts the wallet service so the retry/backoff policy can be tested
/// against a fake oracle without a live wallet backend.
#[async_trait]
pub trait TokenOracle: Send + Sync {
    async fn get_token(&self, usage: &str, owner: &[u8; 32]) -> Result<Token, WalletError>;
    async fn unlock_token(&self, token: &Token);
}

/// Requests a token, retrying `ErrRetry` with exponential backoff (initial
/// 100ms, factor 1.5, cap 5s, no jitter) until either success or the 5-minute
/// total budget is exhausted. A `Final` error aborts immediately.
pub async fn get_token_with_retry(
    oracle: &dyn TokenOracle,
    usage: &str,
    owner: &[u8; 32],
) -> Result<Token, WalletError> {
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut elapsed = Duration::ZERO;
    loop {
        match oracle.get_token(usage, owner).await {
            Ok(token) => return Ok(token),
            Err(WalletError::Final(detail)) => return Err(WalletError::Final(detail)),
            Err(_) => {
                if elapsed + backoff > TOTAL_BUDGET {
                    return Err(WalletError::BudgetExhausted);
                }
                tokio::time::sleep(backoff).await;
                elapsed += backoff;
                let next_ms = (backoff.as_millis() as f64 * BACKOFF_FACTOR) as u64;
                backoff = Duration::from_millis(next_ms).min(BACKOFF_CAP);
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    status: String,
    token_b64: Option<String>,
    detail: Option<String>,
}

/// Production token oracle, speaking the same POST-JSON idiom as
/// `ReqwestKeyServerClient`.
pub struct ReqwestTokenOracle {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestTokenOracle {
    pub fn new(base_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }

    /// Used when the host process has a pinned CA certificate configured.
    pub fn new_with_client(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl TokenOracle for ReqwestTokenOracle {
    async fn get_token(&self, usage: &str, owner: &[u8; 32]) -> Result<Token, WalletError> {
        let resp = self
            .http
            .post(format!("{}/Wallet.GetToken", self.base_url))
            .json(&serde_json::json!({"Usage": usage, "Owner": hex::encode(owner)}))
            .send()
            .await
            .map_err(|e| WalletError::Final(e.to_string()))?;
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| WalletError::Final(e.to_string()))?;
        match parsed.status.as_str() {
            "ok" => {
                let token_b64 = parsed.token_b64.ok_or_else(|| {
                    WalletError::Final("oracle reported ok with no token".into())
                })?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(token_b64)
                    .map_err(|e| WalletError::Final(e.to_string()))?;
                Ok(Token { bytes, owner: *owner, usage: usage.to_string() })
            }
            "retry" => Err(WalletError::Retry),
            other => Err(WalletError::Final(parsed.detail.unwrap_or_else(|| other.to_string()))),
        }
    }

    async fn unlock_token(&self, token: &Token) {
        let _ = self
            .http
            .post(format!("{}/Wallet.UnlockToken", self.base_url))
            .json(&serde_json::json!({
                "Usage": token.usage,
                "Owner": hex::encode(token.owner),
                "TokenB64": base64::engine::general_purpose::STANDARD.encode(&token.bytes),
            }))
            .send()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyOracle {
        failures_remaining: AtomicUsize,
        attempts: Mutex<Vec<()>>,
    }

    #[async_trait]
    impl TokenOracle for FlakyOracle {
        async fn get_token(&self, usage: &str, owner: &[u8; 32]) -> Result<Token, WalletError> {
            self.attempts.lock().unwrap().push(());
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(WalletError::Retry);
            }
            Ok(Token {
                bytes: vec![1, 2, 3],
                owner: *owner,
                usage: usage.to_string(),
            })
        }

        async fn unlock_token(&self, _token: &Token) {}
    }

    struct AlwaysFinalOracle;

    #[async_trait]
    impl TokenOracle for AlwaysFinalOracle {
        async fn get_token(&self, _usage: &str, _owner: &[u8; 32]) -> Result<Token, WalletError> {
            Err(WalletError::Final("token expired".into()))
        }
        async fn unlock_token(&self, _token: &Token) {}
    }

    #[tokio::test]
    async fn retries_three_times_then_succeeds() {
        let oracle = FlakyOracle {
            failures_remaining: AtomicUsize::new(3),
            attempts: Mutex::new(Vec::new()),
        };
        let token = get_token_with_retry(&oracle, "Message", &[9u8; 32]).await.unwrap();
        assert_eq!(token.usage, "Message");
        assert_eq!(oracle.attempts.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn final_error_aborts_without_retry() {
        let oracle = AlwaysFinalOracle;
        let err = get_token_with_retry(&oracle, "Message", &[9u8; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Final(_)));
    }
}
