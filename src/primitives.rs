//! Cryptographic primitives: Curve25519 DH, Ed25519, AES-256-CBC/CTR/GCM,
//! HMAC-SHA-256/512, SHA-256/512, CKDF, LIONESS, and the injected-RNG contract.
//!
//! Everything above this module composes these functions; nothing here knows
//! about nym addresses, envelopes, or queues.

use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit as AeadKeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ctr::cipher::StreamCipher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("plaintext must be at least 1 byte")]
    EmptyPlaintext,
    #[error("random source exhausted")]
    RandEof,
    #[error("ciphertext too short or malformed")]
    BadCiphertext,
    #[error("AES-GCM seal/open failed")]
    AeadFailure,
    #[error("signature verification failed")]
    BadSignature,
}

/// Random source injected into every primitive that needs one, per the
/// "test seam" re-architecture hint: production code gets an OS-backed
/// instance, tests get a deterministic or EOF-simulating one.
pub trait Rand {
    /// Fill `buf` completely or return `RandEof`.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), PrimitiveError>;
}

/// Default production RNG, backed by the OS CSPRNG.
pub struct OsRand;

impl Rand for OsRand {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), PrimitiveError> {
        rand::rngs::OsRng.fill_bytes(buf);
        Ok(())
    }
}

/// A test double that returns `RandEof` after `remaining` bytes have been
/// served, used to exercise the "rand EOF is fatal" contract.
pub struct EofAfter {
    pub remaining: usize,
}

impl Rand for EofAfter {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), PrimitiveError> {
        if buf.len() > self.remaining {
            return Err(PrimitiveError::RandEof);
        }
        rand::rngs::OsRng.fill_bytes(buf);
        self.remaining -= buf.len();
        Ok(())
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut h = Sha512::new();
    h.update(data);
    h.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Two-output HMAC-SHA-256-based KDF from an 8-byte nonce: `(k1, k2)`.
/// Deterministic — same nonce always yields the same pair.
pub fn ckdf(nonce: &[u8; 8]) -> ([u8; 32], [u8; 32]) {
    let k1 = hmac_sha256(nonce, b"mute-ckdf-k1");
    let k2 = hmac_sha256(nonce, b"mute-ckdf-k2");
    (k1, k2)
}

/// `iv(16) ‖ ciphertext` with PKCS#7 padding. Panics (contract violation,
/// not a recoverable error) on a short key — callers that want a recoverable
/// path must check lengths themselves before calling.
pub fn aes256_cbc_encrypt(
    key: &[u8],
    plaintext: &[u8],
    rng: &mut dyn Rand,
) -> Result<Vec<u8>, PrimitiveError> {
    if key.len() != 32 {
        return Err(PrimitiveError::BadKeyLength(key.len()));
    }
    if plaintext.is_empty() {
        return Err(PrimitiveError::EmptyPlaintext);
    }
    let mut iv = [0u8; 16];
    rng.fill(&mut iv)?;

    let pad_len = 16 - (plaintext.len() % 16);
    let mut buf = vec![0u8; plaintext.len() + pad_len];
    buf[..plaintext.len()].copy_from_slice(plaintext);

    let ct = Aes256CbcEnc::new_from_slices(key, &iv)
        .expect("key/iv length checked above")
        .encrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf, plaintext.len())
        .map_err(|_| PrimitiveError::BadCiphertext)?;

    let mut out = Vec::with_capacity(16 + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(ct);
    Ok(out)
}

/// Decrypts the `iv(16) ‖ ciphertext` form. Requires `len >= 17` and
/// `len % 16 == 1` (16 iv bytes plus a whole number of 16-byte blocks).
pub fn aes256_cbc_decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if key.len() != 32 {
        return Err(PrimitiveError::BadKeyLength(key.len()));
    }
    if blob.len() < 17 || blob.len() % 16 != 1 {
        return Err(PrimitiveError::BadCiphertext);
    }
    let (iv, ct) = blob.split_at(16);
    let mut buf = ct.to_vec();
    let pt = Aes256CbcDec::new_from_slices(key, iv)
        .expect("key/iv length checked above")
        .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
        .map_err(|_| PrimitiveError::BadCiphertext)?;
    Ok(pt.to_vec())
}

/// `iv(16) ‖ ciphertext`, CTR mode (no padding — stream cipher).
pub fn aes256_ctr_encrypt(
    key: &[u8],
    plaintext: &[u8],
    rng: &mut dyn Rand,
) -> Result<Vec<u8>, PrimitiveError> {
    if key.len() != 32 {
        return Err(PrimitiveError::BadKeyLength(key.len()));
    }
    let mut iv = [0u8; 16];
    rng.fill(&mut iv)?;
    let mut buf = plaintext.to_vec();
    Aes256Ctr::new_from_slices(key, &iv)
        .expect("key/iv length checked above")
        .apply_keystream(&mut buf);
    let mut out = Vec::with_capacity(16 + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(out)
}

pub fn aes256_ctr_decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if key.len() != 32 {
        return Err(PrimitiveError::BadKeyLength(key.len()));
    }
    if blob.len() < 16 {
        return Err(PrimitiveError::BadCiphertext);
    }
    let (iv, ct) = blob.split_at(16);
    let mut buf = ct.to_vec();
    Aes256Ctr::new_from_slices(key, iv)
        .expect("key/iv length checked above")
        .apply_keystream(&mut buf);
    Ok(buf)
}

/// CTR-with-explicit-zero-iv variant used by the nym-address derivation
/// (§3.5), which fixes `iv = 0` rather than prefixing a random one.
pub fn aes256_ctr_zero_iv(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let iv = [0u8; 16];
    let mut buf = data.to_vec();
    Aes256Ctr::new_from_slices(key, &iv)
        .expect("fixed-size key/iv")
        .apply_keystream(&mut buf);
    buf
}

/// AES-256-GCM with a 12-byte nonce (the first 12 bytes of the 32-byte
/// nonce/secret the client-mix envelope and mix relay both derive).
pub fn aes_gcm_seal(key: &[u8; 32], nonce12: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
    cipher
        .encrypt(
            GcmNonce::from_slice(nonce12),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("AES-GCM seal is infallible for valid key/nonce lengths")
}

pub fn aes_gcm_open(
    key: &[u8; 32],
    nonce12: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
    cipher
        .decrypt(
            GcmNonce::from_slice(nonce12),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| PrimitiveError::AeadFailure)
}

// ─── Ed25519 ─────────────────────────────────────────────────────────────────

pub fn sign(signing_key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    signing_key.sign(msg).to_bytes()
}

pub fn verify(verifying_key: &VerifyingKey, msg: &[u8], sig: &[u8; 64]) -> bool {
    let sig = Signature::from_bytes(sig);
    verifying_key.verify(msg, &sig).is_ok()
}

// ─── Curve25519 DH ───────────────────────────────────────────────────────────

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

pub fn x25519_base(private: &[u8; 32]) -> [u8; 32] {
    X25519Public::from(&StaticSecret::from(*private)).to_bytes()
}

pub fn x25519_dh(their_public: &[u8; 32], our_private: &[u8; 32]) -> [u8; 32] {
    StaticSecret::from(*our_private)
        .diffie_hellman(&X25519Public::from(*their_public))
        .to_bytes()
}

/// Expands a raw DH output plus a public nonce into a 32-byte AEAD key and a
/// 12-byte GCM nonce, used by the client-mix envelope (§3.6) and mix relay
/// re-encryption step (§4.5 step 5).
pub fn expand_shared_secret(dh_output: &[u8; 32], nonce: &[u8]) -> ([u8; 32], [u8; 12]) {
    let key = hmac_sha256(dh_output, &[nonce, b"mute-envelope-key"].concat());
    let nonce_mac = hmac_sha256(dh_output, &[nonce, b"mute-envelope-nonce"].concat());
    let mut gcm_nonce = [0u8; 12];
    gcm_nonce.copy_from_slice(&nonce_mac[..12]);
    (key, gcm_nonce)
}

// ─── LIONESS wide-block cipher ──────────────────────────────────────────────

/// LIONESS: a 4-round unbalanced Feistel construction over a wide block,
/// alternating a keyed hash half-round (SHA-256-based HMAC, keyed by the
/// other half) with a keyed stream half-round (AES-256-CTR, keyed by the
/// other half). There is no off-the-shelf LIONESS crate anywhere in this
/// crate's dependency set; this is a from-scratch implementation of the
/// classical construction built only out of primitives already used above.
///
/// The block is split `left(32) ‖ right(rest)`. Round key material is
/// derived from `secret` so a 32-byte DH output is enough key material for
/// all four rounds.
pub fn lioness_encrypt(secret: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if plaintext.len() <= 32 {
        return Err(PrimitiveError::BadCiphertext);
    }
    let (mut left, mut right) = split_block(plaintext);
    for round in 0..4u8 {
        if round % 2 == 0 {
            // Hash half-round: right XORed with a keystream derived from left.
            let round_key = hmac_sha256(secret, &[&[round], &left[..]].concat());
            right = xor_keystream(&round_key, &right);
        } else {
            // Keyed-hash half-round: left XORed with HMAC(right-derived key, left).
            let round_key = hmac_sha256(secret, &[&[round], &right[..]].concat());
            let mask = hmac_sha256(&round_key, &left);
            for (b, m) in left.iter_mut().zip(mask.iter().cycle()) {
                *b ^= m;
            }
        }
    }
    Ok([left.as_slice(), right.as_slice()].concat())
}

/// LIONESS is an involution under round reversal: decrypt runs the same
/// four rounds in reverse order.
pub fn lioness_decrypt(secret: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if ciphertext.len() <= 32 {
        return Err(PrimitiveError::BadCiphertext);
    }
    let (mut left, mut right) = split_block(ciphertext);
    for round in (0..4u8).rev() {
        if round % 2 == 0 {
            let round_key = hmac_sha256(secret, &[&[round], &left[..]].concat());
            right = xor_keystream(&round_key, &right);
        } else {
            let round_key = hmac_sha256(secret, &[&[round], &right[..]].concat());
            let mask = hmac_sha256(&round_key, &left);
            for (b, m) in left.iter_mut().zip(mask.iter().cycle()) {
                *b ^= m;
            }
        }
    }
    Ok([left.as_slice(), right.as_slice()].concat())
}

fn split_block(block: &[u8]) -> ([u8; 32], Vec<u8>) {
    let mut left = [0u8; 32];
    left.copy_from_slice(&block[..32]);
    (left, block[32..].to_vec())
}

fn xor_keystream(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    aes256_ctr_zero_iv(key, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip() {
        let key = [7u8; 32];
        let pt = b"this is a secret";
        let ct = aes256_cbc_encrypt(&key, pt, &mut OsRand).unwrap();
        let rt = aes256_cbc_decrypt(&key, &ct).unwrap();
        assert_eq!(rt, pt);
    }

    #[test]
    fn cbc_short_key_rejected() {
        let key = [0u8; 31];
        let err = aes256_cbc_encrypt(&key, b"this is a secret", &mut OsRand).unwrap_err();
        assert!(matches!(err, PrimitiveError::BadKeyLength(31)));
    }

    #[test]
    fn cbc_empty_plaintext_rejected() {
        let key = [0u8; 32];
        let err = aes256_cbc_encrypt(&key, b"", &mut OsRand).unwrap_err();
        assert!(matches!(err, PrimitiveError::EmptyPlaintext));
    }

    #[test]
    fn cbc_rand_eof_rejected() {
        let key = [0u8; 32];
        let mut rng = EofAfter { remaining: 0 };
        let err = aes256_cbc_encrypt(&key, b"this is a secret", &mut rng).unwrap_err();
        assert!(matches!(err, PrimitiveError::RandEof));
    }

    #[test]
    fn ctr_roundtrip() {
        let key = [3u8; 32];
        let pt = b"stream cipher message of arbitrary length";
        let ct = aes256_ctr_encrypt(&key, pt, &mut OsRand).unwrap();
        let rt = aes256_ctr_decrypt(&key, &ct).unwrap();
        assert_eq!(rt, pt);
    }

    #[test]
    fn dh_is_symmetric() {
        let a_priv = [11u8; 32];
        let b_priv = [22u8; 32];
        let a_pub = x25519_base(&a_priv);
        let b_pub = x25519_base(&b_priv);
        assert_eq!(x25519_dh(&b_pub, &a_priv), x25519_dh(&a_pub, &b_priv));
    }

    #[test]
    fn gcm_roundtrip_with_identical_nonces() {
        let (k1, n1) = expand_shared_secret(&[1u8; 32], b"nonceval");
        let (k2, n2) = expand_shared_secret(&[1u8; 32], b"nonceval");
        assert_eq!(k1, k2);
        assert_eq!(n1, n2);
        let ct = aes_gcm_seal(&k1, &n1, b"hello mix");
        let pt = aes_gcm_open(&k2, &n2, &ct).unwrap();
        assert_eq!(pt, b"hello mix");
    }

    #[test]
    fn lioness_roundtrip() {
        let secret = [5u8; 32];
        let pt = vec![9u8; 200];
        let ct = lioness_encrypt(&secret, &pt).unwrap();
        assert_ne!(ct, pt);
        let rt = lioness_decrypt(&secret, &ct).unwrap();
        assert_eq!(rt, pt);
    }

    #[test]
    fn lioness_wrong_key_fails_to_recover() {
        let pt = vec![1u8; 128];
        let ct = lioness_encrypt(&[1u8; 32], &pt).unwrap();
        let rt = lioness_decrypt(&[2u8; 32], &ct).unwrap();
        assert_ne!(rt, pt);
    }

    #[test]
    fn ckdf_is_deterministic() {
        let nonce = [9u8; 8];
        assert_eq!(ckdf(&nonce), ckdf(&nonce));
    }
}
