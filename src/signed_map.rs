//! Signed sorted map: canonical hash + Ed25519-signed `string -> string` map
//! with freshness guards, consumed by the config client (§4.10).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::primitives::{self, sha512};

const FRESHNESS_WINDOW_SECS: u64 = 4 * 60 * 60;

#[derive(Debug, Error)]
pub enum SignedMapError {
    #[error("malformed signed map bytes")]
    Decode,
    #[error("sign date {got} precedes last known sign date {last} (walkback)")]
    Walkback { got: u64, last: u64 },
    #[error("sign date {got} is outside the freshness window around {now}")]
    Stale { got: u64, now: u64 },
    #[error("signature verification failed")]
    BadSignature,
}

/// Builds the canonical image of a map: for each `(k, v)` in ascending key
/// order, `u64_be(len(k)) ‖ k ‖ u64_be(len(v)) ‖ v`, followed by
/// `u64_be(total_image_byte_length)`.
pub fn canonical_image(map: &BTreeMap<String, String>) -> Vec<u8> {
    let mut body = Vec::new();
    for (k, v) in map.iter() {
        body.extend_from_slice(&(k.len() as u64).to_be_bytes());
        body.extend_from_slice(k.as_bytes());
        body.extend_from_slice(&(v.len() as u64).to_be_bytes());
        body.extend_from_slice(v.as_bytes());
    }
    let mut image = body.clone();
    image.extend_from_slice(&(body.len() as u64).to_be_bytes());
    image
}

pub fn canonical_hash(map: &BTreeMap<String, String>) -> [u8; 64] {
    sha512(&canonical_image(map))
}

/// Signs `map` together with `sign_date` (8-byte big-endian, appended after
/// the canonical hash before signing).
pub fn sign_map(
    signing_key: &ed25519_dalek::SigningKey,
    map: &BTreeMap<String, String>,
    sign_date: u64,
) -> [u8; 64] {
    let hash = canonical_hash(map);
    let mut msg = Vec::with_capacity(64 + 8);
    msg.extend_from_slice(&hash);
    msg.extend_from_slice(&sign_date.to_be_bytes());
    primitives::sign(signing_key, &msg)
}

/// `Certify`: verifies a signed map against `pubkey`, enforcing both
/// walkback (`sign_date >= last_sign_date`) and freshness
/// (`|now - sign_date| <= 4h`) before checking the signature itself.
pub fn certify(
    last_sign_date: u64,
    pubkey: &VerifyingKey,
    map: &BTreeMap<String, String>,
    sign_date: u64,
    signature: &[u8; 64],
) -> Result<(), SignedMapError> {
    if sign_date < last_sign_date {
        return Err(SignedMapError::Walkback {
            got: sign_date,
            last: last_sign_date,
        });
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();
    let delta = now.abs_diff(sign_date);
    if delta > FRESHNESS_WINDOW_SECS {
        return Err(SignedMapError::Stale { got: sign_date, now });
    }

    let hash = canonical_hash(map);
    let mut msg = Vec::with_capacity(64 + 8);
    msg.extend_from_slice(&hash);
    msg.extend_from_slice(&sign_date.to_be_bytes());
    if !primitives::verify(pubkey, &msg, signature) {
        return Err(SignedMapError::BadSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn sample_map() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("alpha".into(), "first".into());
        m.insert("beta".into(), "second".into());
        m.insert("gamma".into(), "third".into());
        m.insert("delta".into(), "fourth".into());
        m
    }

    #[test]
    fn permutation_invariance() {
        let a = sample_map();
        let mut b = BTreeMap::new();
        for k in ["delta", "beta", "alpha", "gamma"] {
            b.insert(k.to_string(), a.get(k).unwrap().clone());
        }
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn tampered_signature_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let map = sample_map();
        let mut sig = sign_map(&signing_key, &map, 1000);
        sig[0] ^= 0x01;
        let err = certify(0, &signing_key.verifying_key(), &map, 1000, &sig).unwrap_err();
        assert!(matches!(err, SignedMapError::BadSignature));
    }

    #[test]
    fn wrong_signdate_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let map = sample_map();
        let sig = sign_map(&signing_key, &map, 1000);
        let err = certify(0, &signing_key.verifying_key(), &map, 1001, &sig).unwrap_err();
        assert!(matches!(err, SignedMapError::BadSignature));
    }

    #[test]
    fn walkback_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let map = sample_map();
        let sig = sign_map(&signing_key, &map, 1000);
        let err = certify(1001, &signing_key.verifying_key(), &map, 1000, &sig).unwrap_err();
        assert!(matches!(err, SignedMapError::Walkback { .. }));
    }
}
