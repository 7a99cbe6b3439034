//! Identity mapping (§3.1) and UID messages (§3.2).

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity must contain exactly one '@'")]
    Malformed,
    #[error("identity is not in mapped form")]
    NotMapped,
    #[error("self-signature verification failed")]
    BadSignature,
    #[error("failed to seal/open the wire-encrypted UID message: {0}")]
    Crypto(String),
}

/// Canonicalizes `local@domain`: lowercases the local part, normalizes the
/// domain (lowercase, trims a single trailing dot). `mapped_id` is the only
/// form ever stored.
pub fn map_identity(unmapped: &str) -> Result<String, IdentityError> {
    let (local, domain) = unmapped.split_once('@').ok_or(IdentityError::Malformed)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(IdentityError::Malformed);
    }
    let domain = domain.trim_end_matches('.');
    Ok(format!("{}@{}", local.to_lowercase(), domain.to_lowercase()))
}

/// Enforces the write-time invariant: `map(unmapped) == mapped`.
pub fn require_mapped(unmapped: &str, mapped: &str) -> Result<(), IdentityError> {
    if map_identity(unmapped)? != mapped {
        return Err(IdentityError::NotMapped);
    }
    Ok(())
}

/// An Ed25519-self-signed record binding an identity to a long-term
/// signature key, anchored into the hash chain via its `UIDIndex`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidMessage {
    pub msgcount: u64,
    pub notbefore: u64,
    pub notafter: u64,
    pub sigkey_pubkey: [u8; 32],
    pub localpart: String,
    pub domain: String,
    #[serde(with = "serde_bytes_64")]
    pub self_signature: [u8; 64],
    pub encrypted_blob: Vec<u8>,
    /// The hash-chain `UIDIndex` this message declares itself anchored at,
    /// covered by `self_signature` so a key server cannot replay a
    /// validly-signed message at a different index than the one it was
    /// issued for (§4.3's "check the decrypted index equals `UIDIndex`").
    pub anchor_index: [u8; 32],
}

mod serde_bytes_64 {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v: Vec<u8> = serde::Deserialize::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl UidMessage {
    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.msgcount.to_be_bytes());
        buf.extend_from_slice(&self.notbefore.to_be_bytes());
        buf.extend_from_slice(&self.notafter.to_be_bytes());
        buf.extend_from_slice(&self.sigkey_pubkey);
        buf.extend_from_slice(self.localpart.as_bytes());
        buf.push(b'@');
        buf.extend_from_slice(self.domain.as_bytes());
        buf.extend_from_slice(&self.anchor_index);
        buf
    }

    /// Produces a self-signed UID message anchored at `anchor_index`.
    /// `signing_key` must correspond to `sigkey_pubkey`.
    pub fn sign(
        signing_key: &SigningKey,
        msgcount: u64,
        notbefore: u64,
        notafter: u64,
        localpart: String,
        domain: String,
        encrypted_blob: Vec<u8>,
        anchor_index: [u8; 32],
    ) -> Self {
        let sigkey_pubkey = signing_key.verifying_key().to_bytes();
        let mut msg = Self {
            msgcount,
            notbefore,
            notafter,
            sigkey_pubkey,
            localpart,
            domain,
            self_signature: [0u8; 64],
            encrypted_blob,
            anchor_index,
        };
        msg.self_signature = primitives::sign(signing_key, &msg.signable_bytes());
        msg
    }

    /// Encrypts the JSON encoding of this message with `uid_hash` as key
    /// material (§4.3: "decrypt UIDMessage with UIDHash"), producing the
    /// bytes a key server would hand back as `UidMessageReply::
    /// uid_message_encrypted`. `uid_hash` is hashed down to a 32-byte AES key
    /// regardless of its own length, since the CrUID field's decrypted
    /// plaintext length is an implementation detail of the hash-chain entry
    /// encoding, not a fixed key size.
    pub fn seal(&self, uid_hash: &[u8], rng: &mut dyn primitives::Rand) -> Result<Vec<u8>, IdentityError> {
        let key = primitives::sha256(uid_hash);
        let plaintext = serde_json::to_vec(self).map_err(|e| IdentityError::Crypto(e.to_string()))?;
        primitives::aes256_cbc_encrypt(&key, &plaintext, rng)
            .map_err(|e| IdentityError::Crypto(e.to_string()))
    }

    /// Inverse of `seal`.
    pub fn open(ciphertext: &[u8], uid_hash: &[u8]) -> Result<Self, IdentityError> {
        let key = primitives::sha256(uid_hash);
        let plaintext = primitives::aes256_cbc_decrypt(&key, ciphertext)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| IdentityError::Crypto(e.to_string()))
    }

    pub fn verify_self_signature(&self) -> Result<(), IdentityError> {
        let pubkey = VerifyingKey::from_bytes(&self.sigkey_pubkey)
            .map_err(|_| IdentityError::BadSignature)?;
        if primitives::verify(&pubkey, &self.signable_bytes(), &self.self_signature) {
            Ok(())
        } else {
            Err(IdentityError::BadSignature)
        }
    }

    pub fn mapped_id(&self) -> String {
        format!("{}@{}", self.localpart.to_lowercase(), self.domain.to_lowercase())
    }

    pub fn is_keyserver_trust_anchor(&self) -> bool {
        self.localpart == "keyserver" && self.msgcount == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn mapping_is_idempotent_and_case_normalizing() {
        let mapped = map_identity("Alice@Mute.Berlin").unwrap();
        assert_eq!(mapped, "alice@mute.berlin");
        assert_eq!(map_identity(&mapped).unwrap(), mapped);
    }

    #[test]
    fn malformed_identity_rejected() {
        assert!(map_identity("no-at-sign").is_err());
        assert!(map_identity("a@b@c").is_err());
    }

    #[test]
    fn uid_message_self_signature_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let msg = UidMessage::sign(
            &signing_key,
            0,
            0,
            u64::MAX,
            "alice".into(),
            "mute.berlin".into(),
            vec![1, 2, 3],
            [7u8; 32],
        );
        msg.verify_self_signature().unwrap();
    }

    #[test]
    fn tampered_uid_message_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut msg = UidMessage::sign(
            &signing_key,
            0,
            0,
            u64::MAX,
            "alice".into(),
            "mute.berlin".into(),
            vec![],
            [7u8; 32],
        );
        msg.msgcount = 1;
        assert!(msg.verify_self_signature().is_err());
    }

    #[test]
    fn seal_open_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let msg = UidMessage::sign(
            &signing_key,
            0,
            0,
            u64::MAX,
            "alice".into(),
            "mute.berlin".into(),
            vec![],
            [9u8; 32],
        );
        let uid_hash = b"some decrypted UIDHash bytes";
        let sealed = msg.seal(uid_hash, &mut crate::primitives::OsRand).unwrap();
        let opened = UidMessage::open(&sealed, uid_hash).unwrap();
        assert_eq!(opened.mapped_id(), msg.mapped_id());
        assert_eq!(opened.anchor_index, msg.anchor_index);
    }

    #[test]
    fn open_with_wrong_uid_hash_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let msg = UidMessage::sign(
            &signing_key,
            0,
            0,
            u64::MAX,
            "alice".into(),
            "mute.berlin".into(),
            vec![],
            [9u8; 32],
        );
        let sealed = msg.seal(b"right key", &mut crate::primitives::OsRand).unwrap();
        assert!(UidMessage::open(&sealed, b"wrong key").is_err());
    }
}
